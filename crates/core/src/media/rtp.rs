use rand::random;

/// RTP version written in every header.
pub const RTP_VERSION: u8 = 2;

/// Length of the fixed RTP header (no CSRCs, no extension).
pub const RTP_HEADER_LEN: usize = 12;

/// Dynamic payload type used by every stream.
pub const DYNAMIC_PAYLOAD_TYPE: u8 = 96;

/// Generic RTP fixed header (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Padding, extension and CSRC count are always 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub payload_type: u8,
    /// Set on the last packet of an access unit (RFC 6184 §5.1) and on
    /// every AAC packet.
    pub marker: bool,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    /// Serialize into the first [`RTP_HEADER_LEN`] bytes of `buf`.
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0] = RTP_VERSION << 6;
        buf[1] = ((self.marker as u8) << 7) | (self.payload_type & 0x7f);
        buf[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        buf[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
    }

    pub fn to_bytes(&self) -> [u8; RTP_HEADER_LEN] {
        let mut header = [0u8; RTP_HEADER_LEN];
        self.write_to(&mut header);
        header
    }

    /// Parse the fixed header of a received or captured packet.
    pub fn parse(packet: &[u8]) -> Option<Self> {
        if packet.len() < RTP_HEADER_LEN || packet[0] >> 6 != RTP_VERSION {
            return None;
        }
        Some(Self {
            payload_type: packet[1] & 0x7f,
            marker: packet[1] & 0x80 != 0,
            sequence: u16::from_be_bytes([packet[2], packet[3]]),
            timestamp: u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]),
            ssrc: u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]),
        })
    }
}

/// Random SSRC per RFC 3550 §8.1.
pub fn random_ssrc() -> u32 {
    random::<u32>()
}

/// Random initial sequence number (RFC 3550 §5.1).
pub fn random_sequence() -> u16 {
    random::<u16>()
}

/// Random timestamp base (RFC 3550 §5.1).
pub fn random_timestamp_base() -> u32 {
    random::<u32>()
}
