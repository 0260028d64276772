//! AAC over RTP in RFC 3640 `AAC-hbr` mode.
//!
//! Every packet carries exactly one access unit behind a 4-byte AU header
//! section:
//!
//! ```text
//! [rtphl]     [rtphl+1]     [rtphl+2]            [rtphl+3]
//! 0x00        0x10          AU-size (13 bits) ─┬─ AU-Index (3 bits) = 0
//! AU-headers-length = 16 bits                  │
//! ```
//!
//! Two input framings are accepted: raw access units ([`AacFraming::Latm`])
//! and ADTS frames ([`AacFraming::Adts`]) whose 7- or 9-byte header is
//! stripped before sending.

use super::input::MediaInput;
use super::rtp::RTP_HEADER_LEN;
use super::socket::{MTU, RtpSocket};
use super::{Packetizer, next_access_unit, pts_to_ns};
use crate::codec::AAC_PROFILE_LC;
use crate::error::{CodecConfigErrorKind, Result, StreamError};
use crate::quality::{AUDIO_SAMPLING_RATES, AudioQuality, sampling_rate_index};

/// Samples per AAC frame.
pub const AAC_FRAME_SAMPLES: u32 = 1024;

/// AU-headers-length field plus one 16-bit AU header.
pub const AU_HEADER_SECTION_LEN: usize = 4;

/// Largest access unit that fits one packet.
pub const MAX_ACCESS_UNIT: usize = MTU - RTP_HEADER_LEN - AU_HEADER_SECTION_LEN;

/// MPEG-4 AudioSpecificConfig for the SDP `config=` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AacConfig {
    /// Audio object type (2 = AAC LC).
    pub profile: u8,
    pub sampling_rate_index: u8,
    pub channel_config: u8,
}

impl AacConfig {
    pub fn new(profile: u8, sampling_rate: u32, channel_config: u8) -> Result<Self> {
        let sampling_rate_index = sampling_rate_index(sampling_rate)
            .ok_or(StreamError::UnsupportedSamplingRate(sampling_rate))?;
        Ok(Self {
            profile,
            sampling_rate_index,
            channel_config,
        })
    }

    /// AAC LC, mono, at the quality's sampling rate.
    pub fn from_quality(quality: &AudioQuality) -> Result<Self> {
        Self::new(AAC_PROFILE_LC, quality.sampling_rate, 1)
    }

    /// Object type, rate and channels announced by an ADTS header.
    pub fn from_adts(header: &AdtsHeader) -> Self {
        Self {
            profile: header.object_type,
            sampling_rate_index: header.sampling_rate_index,
            channel_config: header.channel_config,
        }
    }

    /// Parse the first two bytes of an AudioSpecificConfig (encoder `csd-0`).
    pub fn from_audio_specific_config(asc: &[u8]) -> Result<Self> {
        let [hi, lo, ..] = asc else {
            return Err(StreamError::codec_config(
                CodecConfigErrorKind::MissingParameterSets,
            ));
        };
        let v = u16::from_be_bytes([*hi, *lo]);
        let index = ((v >> 7) & 0x0f) as u8;
        if usize::from(index) >= AUDIO_SAMPLING_RATES.len() {
            return Err(StreamError::UnsupportedSamplingRate(0));
        }
        Ok(Self {
            profile: (v >> 11) as u8,
            sampling_rate_index: index,
            channel_config: ((v >> 3) & 0x0f) as u8,
        })
    }

    pub fn sampling_rate(&self) -> u32 {
        AUDIO_SAMPLING_RATES[usize::from(self.sampling_rate_index)]
    }

    /// `(profile << 11) | (samplingRateIndex << 7) | (channelConfig << 3)`.
    pub fn audio_specific_config(&self) -> u16 {
        (u16::from(self.profile & 0x1f) << 11)
            | (u16::from(self.sampling_rate_index & 0x0f) << 7)
            | (u16::from(self.channel_config & 0x0f) << 3)
    }

    /// Lowercase hex without padding, as written in `a=fmtp`.
    pub fn config_hex(&self) -> String {
        format!("{:x}", self.audio_specific_config())
    }
}

/// Fixed ADTS header (ISO 14496-3 §1.A.2.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdtsHeader {
    /// Audio object type (ADTS profile + 1).
    pub object_type: u8,
    pub sampling_rate_index: u8,
    pub channel_config: u8,
    /// Whole frame length, header included.
    pub frame_length: usize,
    /// 7 bytes, or 9 when a CRC follows.
    pub header_len: usize,
}

impl AdtsHeader {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let malformed = || StreamError::codec_config(CodecConfigErrorKind::MalformedAdts);
        if buf.len() < 7 || buf[0] != 0xff || buf[1] & 0xf0 != 0xf0 {
            return Err(malformed());
        }
        let protection_absent = buf[1] & 0x01 == 1;
        let header_len = if protection_absent { 7 } else { 9 };
        let sampling_rate_index = (buf[2] >> 2) & 0x0f;
        let frame_length = (usize::from(buf[3] & 0x03) << 11)
            | (usize::from(buf[4]) << 3)
            | usize::from(buf[5] >> 5);
        if usize::from(sampling_rate_index) >= AUDIO_SAMPLING_RATES.len()
            || frame_length < header_len
        {
            return Err(malformed());
        }
        Ok(Self {
            object_type: (buf[2] >> 6) + 1,
            sampling_rate_index,
            channel_config: ((buf[2] & 0x01) << 2) | (buf[3] >> 6),
            frame_length,
            header_len,
        })
    }

    pub fn sampling_rate(&self) -> u32 {
        AUDIO_SAMPLING_RATES[usize::from(self.sampling_rate_index)]
    }
}

/// How the encoder delimits AAC access units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AacFraming {
    /// One raw access unit per buffer.
    Latm,
    /// ADTS frames, possibly several per buffer.
    Adts,
}

/// AAC packetizer (RFC 3640 `AAC-hbr`, one AU per packet, M always set).
pub struct AacPacketizer {
    socket: RtpSocket,
    framing: AacFraming,
    last_pts_us: Option<i64>,
}

impl AacPacketizer {
    pub fn new(framing: AacFraming, sampling_rate: u32) -> Self {
        Self::with_socket(RtpSocket::new(), framing, sampling_rate)
    }

    pub fn with_socket(mut socket: RtpSocket, framing: AacFraming, sampling_rate: u32) -> Self {
        socket.set_clock_rate(sampling_rate);
        Self {
            socket,
            framing,
            last_pts_us: None,
        }
    }

    pub fn framing(&self) -> AacFraming {
        self.framing
    }

    /// Packetize one encoder buffer presented at `pts_us`.
    pub fn packetize_access_unit(&mut self, data: &[u8], pts_us: i64) -> Result<()> {
        if let Some(last) = self.last_pts_us
            && pts_us < last
        {
            tracing::warn!(
                pts_us,
                last_pts_us = last,
                "pts went backwards, access unit dropped"
            );
            self.socket.commit_buffer();
            return Ok(());
        }
        self.last_pts_us = Some(pts_us);

        match self.framing {
            AacFraming::Latm => {
                self.socket.update_timestamp(pts_to_ns(pts_us));
                self.send_access_unit(data)
            }
            AacFraming::Adts => self.send_adts_frames(data, pts_us),
        }
    }

    /// Send every ADTS frame of `data`, spaced 1024 samples apart.
    fn send_adts_frames(&mut self, data: &[u8], pts_us: i64) -> Result<()> {
        let mut offset = 0;
        let mut index = 0u32;
        while offset < data.len() {
            let header = match AdtsHeader::parse(&data[offset..]) {
                Ok(h) => h,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        offset,
                        size = data.len(),
                        "dropping rest of ADTS buffer"
                    );
                    break;
                }
            };
            let rate = header.sampling_rate();
            if rate != self.socket.clock_rate() {
                tracing::debug!(sampling_rate = rate, "clock rate taken from ADTS header");
                self.socket.set_clock_rate(rate);
            }

            let end = (offset + header.frame_length).min(data.len());
            let payload = &data[(offset + header.header_len).min(end)..end];
            self.socket.update_timestamp(pts_to_ns(pts_us));
            self.socket.advance_timestamp(index * AAC_FRAME_SAMPLES);
            self.send_access_unit(payload)?;

            offset += header.frame_length;
            index += 1;
        }
        Ok(())
    }

    fn send_access_unit(&mut self, au: &[u8]) -> Result<()> {
        if au.is_empty() {
            self.socket.commit_buffer();
            return Ok(());
        }
        let len = if au.len() > MAX_ACCESS_UNIT {
            tracing::warn!(
                size = au.len(),
                max = MAX_ACCESS_UNIT,
                "AAC access unit larger than one packet, truncated"
            );
            MAX_ACCESS_UNIT
        } else {
            au.len()
        };

        let buf = self.socket.request_buffer();
        buf[RTP_HEADER_LEN] = 0x00;
        buf[RTP_HEADER_LEN + 1] = 0x10;
        // AU-size in the upper 13 bits, AU-Index 0 in the lower 3.
        buf[RTP_HEADER_LEN + 2] = (len >> 5) as u8;
        buf[RTP_HEADER_LEN + 3] = ((len << 3) & 0xf8) as u8;
        let start = RTP_HEADER_LEN + AU_HEADER_SECTION_LEN;
        buf[start..start + len].copy_from_slice(&au[..len]);

        self.socket.mark_next_packet();
        self.socket.send(start + len)?;
        Ok(())
    }
}

impl Packetizer for AacPacketizer {
    fn run(&mut self, input: &mut dyn MediaInput) -> Result<()> {
        tracing::debug!(
            ssrc = format_args!("{:#010X}", self.socket.ssrc()),
            framing = ?self.framing,
            clock_rate = self.socket.clock_rate(),
            "AAC packetizer started"
        );
        let mut au = Vec::new();
        while let Some(pts_us) = next_access_unit(input, &mut au)? {
            self.packetize_access_unit(&au, pts_us)?;
        }
        self.socket.flush()?;
        tracing::debug!("AAC packetizer reached end of stream");
        Ok(())
    }

    fn codec_name(&self) -> &'static str {
        "mpeg4-generic"
    }

    fn socket(&self) -> &RtpSocket {
        &self.socket
    }

    fn socket_mut(&mut self) -> &mut RtpSocket {
        &mut self.socket
    }

    fn into_socket(self: Box<Self>) -> RtpSocket {
        self.socket
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::media::input::testing::UnitInput;
    use crate::media::rtp::RtpHeader;
    use crate::transport::testing::CaptureTransport;

    const TS_BASE: u32 = 77;

    fn make_packetizer(framing: AacFraming, rate: u32) -> (AacPacketizer, Arc<CaptureTransport>) {
        let capture = Arc::new(CaptureTransport::default());
        let mut socket = RtpSocket::with_state(0x0BADF00D, 10, TS_BASE);
        socket.set_transport(capture.clone());
        (AacPacketizer::with_socket(socket, framing, rate), capture)
    }

    /// ADTS frame with no CRC around `payload`.
    fn adts(payload: &[u8], sampling_rate_index: u8) -> Vec<u8> {
        let len = payload.len() + 7;
        let mut frame = vec![
            0xff,
            0xf1,
            (1 << 6) | (sampling_rate_index << 2),
            (1 << 6) | ((len >> 11) as u8 & 0x03),
            (len >> 3) as u8,
            (((len & 0x07) as u8) << 5) | 0x1f,
            0xfc,
        ];
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn latm_access_unit_layout() {
        let (mut p, capture) = make_packetizer(AacFraming::Latm, 44_100);
        let au = vec![0x21; 100];
        p.packetize_access_unit(&au, 2_000_000).unwrap();

        let packets = capture.rtp_packets();
        assert_eq!(packets.len(), 1);
        let pkt = &packets[0];
        assert_eq!(pkt.len(), RTP_HEADER_LEN + 4 + 100);
        assert_eq!(&pkt[RTP_HEADER_LEN..RTP_HEADER_LEN + 4], &[0x00, 0x10, 0x03, 0x20]);
        assert_eq!(&pkt[RTP_HEADER_LEN + 4..], au.as_slice());

        let h = RtpHeader::parse(pkt).unwrap();
        assert!(h.marker);
        assert_eq!(h.timestamp.wrapping_sub(TS_BASE), 88_200);
    }

    #[test]
    fn every_packet_is_marked_and_sequenced() {
        let (mut p, capture) = make_packetizer(AacFraming::Latm, 8000);
        for i in 0..3 {
            p.packetize_access_unit(&[1, 2, 3], i * 128_000).unwrap();
        }
        let headers: Vec<RtpHeader> = capture
            .rtp_packets()
            .iter()
            .map(|p| RtpHeader::parse(p).unwrap())
            .collect();
        assert!(headers.iter().all(|h| h.marker));
        assert_eq!(
            headers.iter().map(|h| h.sequence).collect::<Vec<_>>(),
            vec![10, 11, 12]
        );
        assert_eq!(headers[1].timestamp - headers[0].timestamp, 1024);
    }

    #[test]
    fn pts_regression_is_dropped() {
        let (mut p, capture) = make_packetizer(AacFraming::Latm, 8000);
        p.packetize_access_unit(&[1], 500_000).unwrap();
        p.packetize_access_unit(&[2], 400_000).unwrap();
        p.packetize_access_unit(&[3], 600_000).unwrap();
        let payloads: Vec<u8> = capture
            .rtp_packets()
            .iter()
            .map(|p| p[RTP_HEADER_LEN + 4])
            .collect();
        assert_eq!(payloads, vec![1, 3]);
    }

    #[test]
    fn oversized_access_unit_is_truncated() {
        let (mut p, capture) = make_packetizer(AacFraming::Latm, 48_000);
        p.packetize_access_unit(&vec![0; 2000], 0).unwrap();
        let packets = capture.rtp_packets();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].len(), MTU);
    }

    #[test]
    fn adts_header_is_stripped() {
        let (mut p, capture) = make_packetizer(AacFraming::Adts, 44_100);
        let payload = [0xAB; 50];
        p.packetize_access_unit(&adts(&payload, 4), 0).unwrap();
        let packets = capture.rtp_packets();
        assert_eq!(packets.len(), 1);
        assert_eq!(&packets[0][RTP_HEADER_LEN + 4..], &payload);
        assert_eq!(packets[0][RTP_HEADER_LEN + 3], (50 << 3) as u8);
    }

    #[test]
    fn adts_sets_clock_and_spaces_frames() {
        let (mut p, capture) = make_packetizer(AacFraming::Adts, 8000);
        let mut buf = adts(&[1; 10], 3);
        buf.extend(adts(&[2; 12], 3));
        p.packetize_access_unit(&buf, 1_000_000).unwrap();

        assert_eq!(p.clock_rate(), 48_000);
        let headers: Vec<RtpHeader> = capture
            .rtp_packets()
            .iter()
            .map(|p| RtpHeader::parse(p).unwrap())
            .collect();
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0].timestamp.wrapping_sub(TS_BASE), 48_000);
        assert_eq!(headers[1].timestamp - headers[0].timestamp, 1024);
    }

    #[test]
    fn adts_garbage_is_dropped() {
        let (mut p, capture) = make_packetizer(AacFraming::Adts, 8000);
        p.packetize_access_unit(&[0x12, 0x34, 0x56, 0, 0, 0, 0, 0], 0).unwrap();
        assert!(capture.rtp_packets().is_empty());
    }

    #[test]
    fn adts_header_fields() {
        let frame = adts(&[0; 100], 11);
        let h = AdtsHeader::parse(&frame).unwrap();
        assert_eq!(h.object_type, 2);
        assert_eq!(h.sampling_rate(), 8000);
        assert_eq!(h.channel_config, 1);
        assert_eq!(h.frame_length, 107);
        assert_eq!(h.header_len, 7);
    }

    #[test]
    fn run_until_closed() {
        let (mut p, capture) = make_packetizer(AacFraming::Latm, 16_000);
        let mut input = UnitInput::new(vec![(vec![1; 20], 0), (vec![2; 30], 64_000)]);
        p.run(&mut input).unwrap();
        assert_eq!(capture.rtp_packets().len(), 2);
        assert_eq!(p.codec_name(), "mpeg4-generic");
    }

    #[test]
    fn audio_specific_config_values() {
        let c = AacConfig::new(AAC_PROFILE_LC, 8000, 1).unwrap();
        assert_eq!(c.audio_specific_config(), 0x1588);
        assert_eq!(c.config_hex(), "1588");

        let c = AacConfig::new(AAC_PROFILE_LC, 44_100, 2).unwrap();
        assert_eq!(c.config_hex(), "1210");
        assert_eq!(AacConfig::from_audio_specific_config(&[0x12, 0x10]).unwrap(), c);
    }

    #[test]
    fn exotic_sampling_rate_rejected() {
        assert!(matches!(
            AacConfig::new(AAC_PROFILE_LC, 44_000, 1),
            Err(StreamError::UnsupportedSamplingRate(44_000))
        ));
    }
}
