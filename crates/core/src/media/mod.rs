//! Encoder output to RTP: the frame pipe and the codec packetizers.
//!
//! ## Data flow
//!
//! ```text
//! Encoder ──► reader thread ──► FramePool ──► CodecInputStream ──► Packetizer ──► RtpSocket ──► transport
//! ```
//!
//! The [`reader`] drains the encoder into pooled [`queue::Frame`]s, the
//! [`input::CodecInputStream`] turns the queue back into a blocking byte
//! stream that keeps access-unit boundaries and timestamps, and a
//! [`Packetizer`] running on its own [`worker`] thread cuts each access unit
//! into RTP packets through its [`socket::RtpSocket`].
//!
//! ## Supported codecs
//!
//! | Codec | Module | RFC |
//! |-------|--------|-----|
//! | H.264 | [`h264`] | [RFC 6184](https://tools.ietf.org/html/rfc6184) |
//! | AAC   | [`aac`]  | [RFC 3640](https://tools.ietf.org/html/rfc3640) |

pub mod aac;
pub mod h264;
pub mod input;
pub mod queue;
pub mod reader;
pub mod rtcp;
pub mod rtp;
pub mod socket;
pub mod worker;

use crate::error::Result;
use input::MediaInput;
use socket::RtpSocket;

/// Codec-specific RTP packetizer.
///
/// A packetizer owns its [`RtpSocket`] and pulls access units from a
/// [`MediaInput`] until the input is closed. All packets of a stream are
/// produced on the thread that calls [`run`](Self::run), so sequence
/// numbers go out in order.
pub trait Packetizer: Send {
    /// Packetize until the input closes.
    ///
    /// Returns `Ok(())` on end of stream and an error when the transport
    /// fails.
    fn run(&mut self, input: &mut dyn MediaInput) -> Result<()>;

    /// Encoding name for the SDP `a=rtpmap` attribute (e.g. `"H264"`).
    fn codec_name(&self) -> &'static str;

    fn socket(&self) -> &RtpSocket;

    fn socket_mut(&mut self) -> &mut RtpSocket;

    /// Give the socket back so a later packetizer continues its SSRC,
    /// sequence numbers and counters.
    fn into_socket(self: Box<Self>) -> RtpSocket;

    /// RTP clock rate in Hz.
    fn clock_rate(&self) -> u32 {
        self.socket().clock_rate()
    }

    /// Dynamic types use 96–127; every stream here uses 96.
    fn payload_type(&self) -> u8 {
        self.socket().payload_type()
    }

    /// Sequence number of the next packet (for `RTP-Info`).
    fn next_sequence(&self) -> u16 {
        self.socket().sequence()
    }

    /// Current RTP timestamp (for `RTP-Info`).
    fn next_rtp_timestamp(&self) -> u32 {
        self.socket().timestamp()
    }
}

/// Pull the next access unit, mapping a closed input to `None`.
pub(crate) fn next_access_unit(
    input: &mut dyn MediaInput,
    buf: &mut Vec<u8>,
) -> Result<Option<i64>> {
    match input.read_access_unit(buf) {
        Ok(pts_us) => Ok(Some(pts_us)),
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Media time of `pts_us` in nanoseconds; negative pts clamp to zero.
pub(crate) fn pts_to_ns(pts_us: i64) -> u64 {
    u64::try_from(pts_us).unwrap_or(0).saturating_mul(1000)
}
