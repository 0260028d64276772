use base64::prelude::{BASE64_STANDARD, Engine as _};

use super::input::MediaInput;
use super::rtp::RTP_HEADER_LEN;
use super::socket::{MTU, RtpSocket};
use super::{Packetizer, next_access_unit, pts_to_ns};
use crate::codec::MediaFormat;
use crate::error::{CodecConfigErrorKind, Result, StreamError};

/// RTP clock for H.264 (RFC 6184 §8.1).
pub const H264_CLOCK_RATE: u32 = 90_000;

pub const NAL_SLICE: u8 = 1;
pub const NAL_IDR: u8 = 5;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;
pub const NAL_AUD: u8 = 9;
pub const NAL_FU_A: u8 = 28;

/// Largest NAL unit sent as a Single NAL Unit packet.
const MAX_SINGLE_NAL: usize = MTU - RTP_HEADER_LEN;

/// Largest FU-A fragment payload (FU indicator + FU header take 2 bytes).
const MAX_FRAGMENT: usize = MTU - RTP_HEADER_LEN - 2;

/// NAL unit type (low 5 bits of the NAL header).
pub fn nal_type(nal: &[u8]) -> u8 {
    nal.first().map_or(0, |b| b & 0x1f)
}

/// Position and length of the first Annex B start code at or after `from`.
pub fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                return Some((i, 3));
            }
            if data[i + 2] == 0 && i + 3 < data.len() && data[i + 3] == 1 {
                return Some((i, 4));
            }
        }
        i += 1;
    }
    None
}

/// Split an Annex B byte stream into NAL units, start codes removed.
///
/// Handles both 4-byte `00 00 00 01` and 3-byte `00 00 01` start codes,
/// mixed freely. Bytes before the first start code are ignored.
pub fn split_nal_units(data: &[u8]) -> Vec<&[u8]> {
    let mut nal_units = Vec::new();
    let Some((first, first_len)) = find_start_code(data, 0) else {
        return nal_units;
    };
    let mut start = first + first_len;
    loop {
        match find_start_code(data, start) {
            Some((next, next_len)) => {
                if start < next {
                    nal_units.push(&data[start..next]);
                }
                start = next + next_len;
            }
            None => {
                if start < data.len() {
                    nal_units.push(&data[start..]);
                }
                return nal_units;
            }
        }
    }
}

/// `data` without a leading Annex B start code, if it has one.
fn strip_start_code(data: &[u8]) -> &[u8] {
    match find_start_code(data, 0) {
        Some((0, len)) => &data[len..],
        _ => data,
    }
}

/// H.264 parameter sets carried in the SDP.
///
/// SPS and PPS are stored as bare NAL units (no start code). The
/// profile-level-id is kept as given by its source (settings entry, `avcC`)
/// and derived from the SPS otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct H264Config {
    profile_level_id: String,
    sps: Vec<u8>,
    pps: Vec<u8>,
}

impl H264Config {
    pub fn new(sps: &[u8], pps: &[u8]) -> Result<Self> {
        let sps = strip_start_code(sps);
        let pps = strip_start_code(pps);
        if sps.is_empty() || pps.is_empty() {
            return Err(StreamError::codec_config(
                CodecConfigErrorKind::MissingParameterSets,
            ));
        }
        if sps.len() < 4 {
            return Err(StreamError::codec_config(CodecConfigErrorKind::SpsTooShort));
        }
        Ok(Self {
            profile_level_id: format!("{:02x}{:02x}{:02x}", sps[1], sps[2], sps[3]),
            sps: sps.to_vec(),
            pps: pps.to_vec(),
        })
    }

    /// Replace the derived profile-level-id; written to the SDP unchanged.
    pub fn with_profile_level_id(mut self, profile_level_id: impl Into<String>) -> Self {
        self.profile_level_id = profile_level_id.into();
        self
    }

    pub fn from_base64(sps: &str, pps: &str) -> Result<Self> {
        let decode = |s: &str| {
            BASE64_STANDARD
                .decode(s.trim())
                .map_err(|_| StreamError::codec_config(CodecConfigErrorKind::Base64))
        };
        Self::new(&decode(sps)?, &decode(pps)?)
    }

    /// From an encoder output format: `csd-0` is the SPS, `csd-1` the PPS.
    pub fn from_format(format: &MediaFormat) -> Result<Self> {
        match (format.csd(0), format.csd(1)) {
            (Some(sps), Some(pps)) => Self::new(sps, pps),
            _ => Err(StreamError::codec_config(
                CodecConfigErrorKind::MissingParameterSets,
            )),
        }
    }

    /// From an Annex B buffer holding (at least) one SPS and one PPS.
    pub fn from_annex_b(data: &[u8]) -> Result<Self> {
        let nals = split_nal_units(data);
        let sps = nals.iter().find(|n| nal_type(n) == NAL_SPS);
        let pps = nals.iter().find(|n| nal_type(n) == NAL_PPS);
        match (sps, pps) {
            (Some(sps), Some(pps)) => Self::new(sps, pps),
            _ => Err(StreamError::codec_config(
                CodecConfigErrorKind::MissingParameterSets,
            )),
        }
    }

    /// Parse a cached `"<profile-level-id>,<b64 SPS>,<b64 PPS>"` entry.
    pub fn from_setting(value: &str) -> Result<Self> {
        let mut fields = value.split(',');
        match (fields.next(), fields.next(), fields.next(), fields.next()) {
            (Some(profile), Some(sps), Some(pps), None) => {
                let config = Self::from_base64(sps, pps)?;
                let profile = profile.trim();
                if profile.is_empty() {
                    Ok(config)
                } else {
                    Ok(config.with_profile_level_id(profile))
                }
            }
            _ => Err(StreamError::codec_config(
                CodecConfigErrorKind::MalformedSetting,
            )),
        }
    }

    pub fn to_setting(&self) -> String {
        format!(
            "{},{},{}",
            self.profile_level_id(),
            self.sps_base64(),
            self.pps_base64()
        )
    }

    /// By default `profile_idc`, constraint flags and `level_idc` (SPS bytes
    /// 1-3) as lowercase hex.
    pub fn profile_level_id(&self) -> &str {
        &self.profile_level_id
    }

    pub fn sps(&self) -> &[u8] {
        &self.sps
    }

    pub fn pps(&self) -> &[u8] {
        &self.pps
    }

    pub fn sps_base64(&self) -> String {
        BASE64_STANDARD.encode(&self.sps)
    }

    pub fn pps_base64(&self) -> String {
        BASE64_STANDARD.encode(&self.pps)
    }
}

/// When SPS/PPS are sent ahead of the coded slices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ParameterSetPolicy {
    /// Before the first access unit and before every IDR.
    #[default]
    EveryIdr,
    /// Before the first access unit only.
    FirstFrameOnly,
}

/// H.264 RTP packetizer (RFC 6184, packetization-mode=1).
///
/// - **Single NAL Unit** (§5.6): a NAL that fits in `MTU - 12` bytes goes
///   out as-is.
/// - **FU-A** (§5.8): larger NALs are split; each fragment carries
///
///   ```text
///   FU indicator:  [F|NRI|Type=28]     (1 byte)
///   FU header:     [S|E|R|NAL_Type]    (1 byte)
///   Fragment data: [...]               (up to MTU - 14 bytes)
///   ```
///
/// All packets of one access unit share its timestamp. The marker bit is
/// set on the last packet of the access unit, and on the packet before an
/// access unit delimiter found inside it.
pub struct H264Packetizer {
    socket: RtpSocket,
    config: Option<H264Config>,
    policy: ParameterSetPolicy,
    last_pts_us: Option<i64>,
    sent_parameter_sets: bool,
}

impl H264Packetizer {
    pub fn new() -> Self {
        Self::with_socket(RtpSocket::new())
    }

    pub fn with_socket(mut socket: RtpSocket) -> Self {
        socket.set_clock_rate(H264_CLOCK_RATE);
        Self {
            socket,
            config: None,
            policy: ParameterSetPolicy::default(),
            last_pts_us: None,
            sent_parameter_sets: false,
        }
    }

    pub fn set_config(&mut self, config: H264Config) {
        self.config = Some(config);
    }

    /// Latest parameter sets, including ones captured in-band.
    pub fn config(&self) -> Option<&H264Config> {
        self.config.as_ref()
    }

    pub fn set_parameter_set_policy(&mut self, policy: ParameterSetPolicy) {
        self.policy = policy;
    }

    /// Packetize one Annex B access unit presented at `pts_us`.
    pub fn packetize_access_unit(&mut self, au: &[u8], pts_us: i64) -> Result<()> {
        if let Some(last) = self.last_pts_us
            && pts_us < last
        {
            tracing::warn!(
                pts_us,
                last_pts_us = last,
                "pts went backwards, access unit dropped"
            );
            return Ok(());
        }

        let window = &au[..au.len().min(MTU)];
        if find_start_code(window, 0).is_none() {
            tracing::warn!(size = au.len(), "no start code in access unit, dropped");
            return Ok(());
        }

        let nals = split_nal_units(au);
        let in_band = self.capture_parameter_sets(&nals);
        if nals.iter().all(|n| matches!(nal_type(n), NAL_SPS | NAL_PPS)) {
            tracing::debug!(nal_count = nals.len(), "parameter-set-only access unit captured");
            return Ok(());
        }

        self.last_pts_us = Some(pts_us);
        self.socket.update_timestamp(pts_to_ns(pts_us));

        let has_idr = nals.iter().any(|n| nal_type(n) == NAL_IDR);
        let inject = !in_band
            && (!self.sent_parameter_sets
                || (has_idr && self.policy == ParameterSetPolicy::EveryIdr));
        if inject {
            self.send_parameter_sets()?;
        } else if in_band {
            self.sent_parameter_sets = true;
        }

        let mut packets = 0;
        for (i, nal) in nals.iter().enumerate() {
            let end_of_au = match nals.get(i + 1) {
                None => true,
                // A delimiter only opens a new access unit when slices follow it.
                Some(next) => {
                    nal_type(next) == NAL_AUD
                        && nals[i + 2..].iter().any(|n| nal_type(n) != NAL_AUD)
                }
            };
            packets += self.send_nal(nal, end_of_au)?;
        }

        tracing::trace!(
            nal_count = nals.len(),
            rtp_packets = packets,
            frame_bytes = au.len(),
            pts_us,
            seq = self.socket.sequence(),
            ts = self.socket.timestamp(),
            "access unit packetized"
        );
        Ok(())
    }

    /// Refresh stored SPS/PPS from in-band NAL units.
    ///
    /// Returns whether the access unit carries both.
    fn capture_parameter_sets(&mut self, nals: &[&[u8]]) -> bool {
        let sps = nals.iter().find(|n| nal_type(n) == NAL_SPS);
        let pps = nals.iter().find(|n| nal_type(n) == NAL_PPS);
        let (Some(sps), Some(pps)) = (sps, pps) else {
            return false;
        };
        match H264Config::new(sps, pps) {
            Ok(config) => {
                let changed = self
                    .config
                    .as_ref()
                    .is_none_or(|c| c.sps() != config.sps() || c.pps() != config.pps());
                if changed {
                    tracing::debug!(
                        profile_level_id = %config.profile_level_id(),
                        sps_len = sps.len(),
                        pps_len = pps.len(),
                        "H.264 parameter sets captured from bitstream"
                    );
                    self.config = Some(config);
                }
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "ignoring in-band parameter sets");
                false
            }
        }
    }

    fn send_parameter_sets(&mut self) -> Result<()> {
        let Some(config) = self.config.take() else {
            tracing::debug!("no SPS/PPS known yet, nothing to inject");
            return Ok(());
        };
        let sent = self
            .send_nal(config.sps(), false)
            .and_then(|_| self.send_nal(config.pps(), false));
        self.config = Some(config);
        sent?;
        self.sent_parameter_sets = true;
        Ok(())
    }

    /// Send one NAL unit, fragmenting it when needed. Returns the packet count.
    fn send_nal(&mut self, nal: &[u8], end_of_au: bool) -> Result<usize> {
        if nal.is_empty() {
            return Ok(0);
        }

        if nal.len() <= MAX_SINGLE_NAL {
            let buf = self.socket.request_buffer();
            buf[RTP_HEADER_LEN..RTP_HEADER_LEN + nal.len()].copy_from_slice(nal);
            if end_of_au {
                self.socket.mark_next_packet();
            }
            self.socket.send(RTP_HEADER_LEN + nal.len())?;
            return Ok(1);
        }

        let nal_header = nal[0];
        let fu_indicator = (nal_header & 0xe0) | NAL_FU_A;
        let original_type = nal_header & 0x1f;
        let payload = &nal[1..];

        let mut fragments = 0;
        for (i, chunk) in payload.chunks(MAX_FRAGMENT).enumerate() {
            let first = i == 0;
            let last = (i + 1) * MAX_FRAGMENT >= payload.len();
            let start_bit = if first { 0x80 } else { 0x00 };
            let end_bit = if last { 0x40 } else { 0x00 };

            let buf = self.socket.request_buffer();
            buf[RTP_HEADER_LEN] = fu_indicator;
            buf[RTP_HEADER_LEN + 1] = start_bit | end_bit | original_type;
            buf[RTP_HEADER_LEN + 2..RTP_HEADER_LEN + 2 + chunk.len()].copy_from_slice(chunk);
            if last && end_of_au {
                self.socket.mark_next_packet();
            }
            self.socket.send(RTP_HEADER_LEN + 2 + chunk.len())?;
            fragments += 1;
        }

        tracing::trace!(
            nal_type = original_type,
            nal_size = nal.len(),
            fragments,
            "FU-A fragmented NAL unit"
        );
        Ok(fragments)
    }
}

impl Default for H264Packetizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Packetizer for H264Packetizer {
    fn run(&mut self, input: &mut dyn MediaInput) -> Result<()> {
        tracing::debug!(
            ssrc = format_args!("{:#010X}", self.socket.ssrc()),
            "H.264 packetizer started"
        );
        let mut au = Vec::new();
        while let Some(pts_us) = next_access_unit(input, &mut au)? {
            self.packetize_access_unit(&au, pts_us)?;
        }
        self.socket.flush()?;
        tracing::debug!("H.264 packetizer reached end of stream");
        Ok(())
    }

    fn codec_name(&self) -> &'static str {
        "H264"
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
