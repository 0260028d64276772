use std::io::{self, Write};
use std::net::TcpStream;
use std::sync::Arc;

use parking_lot::Mutex;

use super::RtpTransport;

/// Write one `$<channel><len16><payload>` frame (RFC 2326 §10.12).
pub fn write_interleaved<W: Write + ?Sized>(
    out: &mut W,
    channel: u8,
    payload: &[u8],
) -> io::Result<()> {
    let len = u16::try_from(payload.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "payload too large for interleaved frame",
        )
    })?;
    let [hi, lo] = len.to_be_bytes();
    out.write_all(&[b'$', channel, hi, lo])?;
    out.write_all(payload)?;
    out.flush()
}

/// Byte stream shared by every stream interleaved on one connection.
pub type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// RTP over an existing TCP connection, `$`-framed.
///
/// RTP goes out on `channel`, RTCP on `channel + 1`. Several transports
/// (video and audio) may share the same writer; each frame is written
/// under the writer's lock so frames never interleave mid-packet.
pub struct InterleavedTransport {
    writer: SharedWriter,
    channel: u8,
}

impl InterleavedTransport {
    pub fn new(writer: SharedWriter, channel: u8) -> Self {
        tracing::debug!(
            rtp_channel = channel,
            rtcp_channel = channel.wrapping_add(1),
            "interleaved transport created"
        );
        Self { writer, channel }
    }

    /// Wrap a connected TCP stream into a writer shareable between streams.
    pub fn shared_writer(stream: TcpStream) -> io::Result<SharedWriter> {
        stream.set_nodelay(true)?;
        let boxed: Box<dyn Write + Send> = Box::new(stream);
        Ok(Arc::new(Mutex::new(boxed)))
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }
}

impl RtpTransport for InterleavedTransport {
    fn send_rtp(&self, packet: &[u8]) -> io::Result<()> {
        let mut out = self.writer.lock();
        write_interleaved(&mut **out, self.channel, packet)
    }

    fn send_rtcp(&self, packet: &[u8]) -> io::Result<()> {
        let mut out = self.writer.lock();
        write_interleaved(&mut **out, self.channel.wrapping_add(1), packet)
    }

    fn describe(&self) -> String {
        format!("interleaved channel {}", self.channel)
    }
}
