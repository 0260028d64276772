//! SDP (Session Description Protocol) generation (RFC 4566 / RFC 8866).
//!
//! Each stream renders its own media block; [`SessionDescription`] wraps
//! them in the session-level lines:
//!
//! ```text
//! v=0                                          ← protocol version
//! o=- <sess-id> <sess-ver> IN IP4 <origin>     ← origin
//! s=Unnamed                                    ← session name
//! i=N/A                                        ← session information
//! c=IN IP4 <destination>                       ← connection address
//! t=0 0                                        ← timing (live stream)
//! a=recvonly                                   ← direction, receiver's view
//! m=video 5006 RTP/AVP 96                      ← media description
//! a=rtpmap:96 H264/90000                       ← codec/clock rate
//! a=fmtp:96 packetization-mode=1;...           ← codec parameters
//! a=control:track1                             ← track control URL
//! ```
//!
//! Every line ends with CRLF; `a=rtpmap` precedes the `a=fmtp` that
//! references its payload type.

use std::fmt;
use std::net::IpAddr;

use crate::media::aac::AacConfig;
use crate::media::h264::{H264Config, H264_CLOCK_RATE};
use crate::media::rtp::DYNAMIC_PAYLOAD_TYPE;

/// Media block of an H.264 stream (RFC 6184 §8.2.1).
pub fn h264_media(port: u16, config: &H264Config) -> String {
    let pt = DYNAMIC_PAYLOAD_TYPE;
    format!(
        "m=video {port} RTP/AVP {pt}\r\n\
         a=rtpmap:{pt} H264/{H264_CLOCK_RATE}\r\n\
         a=fmtp:{pt} packetization-mode=1;profile-level-id={};sprop-parameter-sets={},{};\r\n",
        config.profile_level_id(),
        config.sps_base64(),
        config.pps_base64(),
    )
}

/// Media block of an AAC stream (RFC 3640 §4.1, `AAC-hbr`).
pub fn aac_media(port: u16, config: &AacConfig) -> String {
    let pt = DYNAMIC_PAYLOAD_TYPE;
    format!(
        "m=audio {port} RTP/AVP {pt}\r\n\
         a=rtpmap:{pt} mpeg4-generic/{}\r\n\
         a=fmtp:{pt} streamtype=5; profile-level-id=15; mode=AAC-hbr; config={}; \
         SizeLength=13; IndexLength=3; IndexDeltaLength=3;\r\n",
        config.sampling_rate(),
        config.config_hex(),
    )
}

/// Session-level description around the media blocks of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub session_id: u64,
    pub session_version: u64,
    pub origin: IpAddr,
    pub destination: IpAddr,
    media: Vec<(usize, String)>,
}

impl SessionDescription {
    pub fn new(session_id: u64, origin: IpAddr, destination: IpAddr) -> Self {
        Self {
            session_id,
            session_version: session_id,
            origin,
            destination,
            media: Vec::new(),
        }
    }

    /// Append a media block, followed by `a=control:track<track>`.
    pub fn add_media(&mut self, track: usize, block: String) {
        self.media.push((track, block));
    }

    pub fn media_count(&self) -> usize {
        self.media.len()
    }
}

fn addr_type(addr: &IpAddr) -> &'static str {
    match addr {
        IpAddr::V4(_) => "IP4",
        IpAddr::V6(_) => "IP6",
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v=0\r\n")?;
        write!(
            f,
            "o=- {} {} IN {} {}\r\n",
            self.session_id,
            self.session_version,
            addr_type(&self.origin),
            self.origin
        )?;
        write!(f, "s=Unnamed\r\n")?;
        write!(f, "i=N/A\r\n")?;
        write!(
            f,
            "c=IN {} {}\r\n",
            addr_type(&self.destination),
            self.destination
        )?;
        write!(f, "t=0 0\r\n")?;
        write!(f, "a=recvonly\r\n")?;
        for (track, block) in &self.media {
            f.write_str(block)?;
            write!(f, "a=control:track{track}\r\n")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::codec::AAC_PROFILE_LC;

    fn h264_config() -> H264Config {
        H264Config::new(&[0x67, 0x42, 0x00, 0x1e], &[0x68, 0xce, 0x38, 0x80]).unwrap()
    }

    #[test]
    fn h264_block_is_exact() {
        assert_eq!(
            h264_media(5006, &h264_config()),
            "m=video 5006 RTP/AVP 96\r\n\
             a=rtpmap:96 H264/90000\r\n\
             a=fmtp:96 packetization-mode=1;profile-level-id=42001e;\
             sprop-parameter-sets=Z0IAHg==,aM44gA==;\r\n"
        );
    }

    #[test]
    fn aac_block_is_exact() {
        let config = AacConfig::new(AAC_PROFILE_LC, 44_100, 1).unwrap();
        assert_eq!(
            aac_media(5004, &config),
            "m=audio 5004 RTP/AVP 96\r\n\
             a=rtpmap:96 mpeg4-generic/44100\r\n\
             a=fmtp:96 streamtype=5; profile-level-id=15; mode=AAC-hbr; config=1208; \
             SizeLength=13; IndexLength=3; IndexDeltaLength=3;\r\n"
        );
    }

    #[test]
    fn session_wraps_tracks_in_order() {
        let mut sdp = SessionDescription::new(
            1234,
            Ipv4Addr::new(10, 0, 0, 1).into(),
            Ipv4Addr::new(10, 0, 0, 2).into(),
        );
        sdp.add_media(
            0,
            aac_media(5004, &AacConfig::new(AAC_PROFILE_LC, 8000, 1).unwrap()),
        );
        sdp.add_media(1, h264_media(5006, &h264_config()));
        let text = sdp.to_string();

        assert!(text.starts_with(
            "v=0\r\no=- 1234 1234 IN IP4 10.0.0.1\r\ns=Unnamed\r\ni=N/A\r\n\
             c=IN IP4 10.0.0.2\r\nt=0 0\r\na=recvonly\r\n"
        ));
        let audio = text.find("m=audio").unwrap();
        let track0 = text.find("a=control:track0").unwrap();
        let video = text.find("m=video").unwrap();
        let track1 = text.find("a=control:track1").unwrap();
        assert!(audio < track0 && track0 < video && video < track1);
        assert!(text.contains("config=1588;"));
        assert!(text.ends_with("a=control:track1\r\n"));
        assert!(text.split("\r\n").all(|line| !line.contains('\n')));
    }

    #[test]
    fn rtpmap_precedes_fmtp() {
        let block = h264_media(0, &h264_config());
        assert!(block.find("a=rtpmap").unwrap() < block.find("a=fmtp").unwrap());
    }
}
