//! Stream orchestration: encoder, packetizer thread, RTCP and transport.
//!
//! ## Lifecycle
//!
//! ```text
//! configure()   Idle | Configured -> Configured   (probe, build SDP block)
//! start()       Configured        -> Streaming
//! stop()        any               -> Idle
//! worker fault  Streaming         -> Idle         (error returned by the next call)
//! ```
//!
//! Every transition holds the stream's lock, so concurrent callers see
//! them one at a time.

pub mod aac;
pub mod h264;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::codec::{EncoderFactory, MediaFormat, SharedEncoder};
use crate::error::{Result, StreamError};
use crate::media::Packetizer;
use crate::media::input::CodecInputStream;
use crate::media::rtcp::{DEFAULT_RTCP_INTERVAL, RtcpReporter, SenderStats};
use crate::media::socket::RtpSocket;
use crate::media::worker::PacketizerWorker;
use crate::transport::udp::{self, DEFAULT_TTL, UdpTransport};
use crate::transport::RtpTransport;

pub use aac::{AacCodec, AacStream};
pub use h264::{H264Codec, H264Stream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Configured,
    Streaming,
}

/// One RTP stream of a session.
///
/// Setters take effect on the next [`start`](Self::start).
pub trait Stream: Send + Sync {
    /// Probe the codec configuration and prepare the SDP media block.
    fn configure(&self) -> Result<()>;

    fn start(&self) -> Result<()>;

    fn stop(&self) -> Result<()>;

    /// SDP media block, without the `a=control` line.
    fn session_description(&self) -> Result<String>;

    fn state(&self) -> StreamState;

    fn is_streaming(&self) -> bool {
        self.state() == StreamState::Streaming
    }

    fn set_destination(&self, destination: IpAddr);

    /// RTP port (made even) and RTCP port (RTP + 1 when `None`).
    fn set_destination_ports(&self, rtp: u16, rtcp: Option<u16>);

    fn destination_ports(&self) -> (u16, u16);

    fn set_time_to_live(&self, ttl: u32);

    /// Send through `transport` instead of UDP (e.g. RTSP interleaved TCP).
    fn set_transport(&self, transport: Option<Arc<dyn RtpTransport>>);

    fn ssrc(&self) -> u32;

    /// Sender counters as of now.
    fn stats(&self) -> SenderStats;
}

/// Codec half of a [`MediaStream`].
pub trait StreamCodec: Send + 'static {
    /// `"video"` or `"audio"`, used for thread names and logs.
    fn kind(&self) -> &'static str;

    /// Validate the quality and resolve the codec configuration.
    fn configure(&mut self) -> Result<()>;

    /// SDP media block for `port`; only called after a successful `configure`.
    fn media_description(&self, port: u16) -> Result<String>;

    fn encoder_format(&self) -> MediaFormat;

    fn factory(&self) -> &Arc<dyn EncoderFactory>;

    /// Packetizer around `socket`, set up with the configured codec.
    fn packetizer(&self, socket: RtpSocket) -> Box<dyn Packetizer>;
}

/// Everything a running stream owns besides its codec.
struct Running {
    encoder: SharedEncoder,
    worker: PacketizerWorker,
    rtcp: Option<RtcpReporter>,
}

/// Codec-independent stream state: destination, RTP socket and workers.
pub struct BaseStream {
    state: StreamState,
    destination: Option<IpAddr>,
    rtp_port: u16,
    rtcp_port: u16,
    ttl: u32,
    transport_override: Option<Arc<dyn RtpTransport>>,
    rtcp_interval: Duration,
    /// Present while not streaming; the packetizer owns it otherwise.
    socket: Option<RtpSocket>,
    ssrc: u32,
    stats: Arc<Mutex<SenderStats>>,
    running: Option<Running>,
    pending_fault: Option<StreamError>,
}

impl BaseStream {
    pub fn new(rtp_port: u16) -> Self {
        let socket = RtpSocket::new();
        let (rtp_port, rtcp_port) = udp::destination_ports(rtp_port, None);
        Self {
            state: StreamState::Idle,
            destination: None,
            rtp_port,
            rtcp_port,
            ttl: DEFAULT_TTL,
            transport_override: None,
            rtcp_interval: DEFAULT_RTCP_INTERVAL,
            ssrc: socket.ssrc(),
            stats: socket.stats(),
            socket: Some(socket),
            running: None,
            pending_fault: None,
        }
    }

    /// Tear down a stream whose packetizer exited on its own.
    fn reap(&mut self) {
        let finished = self
            .running
            .as_ref()
            .is_some_and(|running| running.worker.is_finished());
        if finished {
            if let Err(e) = self.teardown() {
                tracing::error!(ssrc = self.ssrc, error = %e, "stream failed");
                if self.pending_fault.is_none() {
                    self.pending_fault = Some(e);
                }
            } else {
                tracing::info!(ssrc = self.ssrc, "stream reached end of input");
            }
        }
    }

    /// Reap, then return a stored fault once.
    fn check(&mut self) -> Result<()> {
        self.reap();
        match self.pending_fault.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn transport(&self) -> Result<Arc<dyn RtpTransport>> {
        if let Some(transport) = &self.transport_override {
            return Ok(Arc::clone(transport));
        }
        let destination = self
            .destination
            .ok_or(StreamError::IllegalState("no destination set"))?;
        let transport = UdpTransport::bind(destination, self.rtp_port, Some(self.rtcp_port))?;
        transport.set_ttl(self.ttl)?;
        Ok(Arc::new(transport))
    }

    fn start<C: StreamCodec>(&mut self, codec: &C) -> Result<()> {
        match self.state {
            StreamState::Streaming => return Err(StreamError::IllegalState("stream already started")),
            StreamState::Idle => return Err(StreamError::IllegalState("stream not configured")),
            StreamState::Configured => {}
        }

        let transport = self.transport()?;
        let encoder = codec.factory().create_encoder(&codec.encoder_format())?;
        let encoder: SharedEncoder = Arc::new(Mutex::new(encoder));
        let input = match CodecInputStream::new(Arc::clone(&encoder)) {
            Ok(input) => input,
            Err(e) => {
                stop_encoder(&encoder);
                return Err(e.into());
            }
        };

        let mut socket = self.socket.take().unwrap_or_else(RtpSocket::new);
        socket.set_transport(Arc::clone(&transport));
        self.ssrc = socket.ssrc();
        self.stats = socket.stats();
        let worker = match PacketizerWorker::spawn(codec.kind(), codec.packetizer(socket), input) {
            Ok(worker) => worker,
            Err(e) => {
                stop_encoder(&encoder);
                return Err(e.into());
            }
        };

        let rtcp = match RtcpReporter::spawn(self.stats(), transport, self.rtcp_interval) {
            Ok(rtcp) => Some(rtcp),
            Err(e) => {
                tracing::warn!(error = %e, "RTCP sender not started");
                None
            }
        };

        self.running = Some(Running {
            encoder,
            worker,
            rtcp,
        });
        self.state = StreamState::Streaming;
        tracing::info!(
            kind = codec.kind(),
            ssrc = format_args!("{:#010X}", self.ssrc),
            rtp_port = self.rtp_port,
            "stream started"
        );
        Ok(())
    }

    /// Stop workers and encoder; returns the packetizer's outcome.
    fn teardown(&mut self) -> Result<()> {
        self.state = StreamState::Idle;
        let Some(mut running) = self.running.take() else {
            return Ok(());
        };

        let (packetizer, result) = running.worker.stop();
        if let Some(mut rtcp) = running.rtcp.take() {
            rtcp.stop();
        }
        stop_encoder(&running.encoder);

        let mut socket = match packetizer {
            Some(packetizer) => packetizer.into_socket(),
            None => RtpSocket::new(),
        };
        socket.clear_transport();
        self.ssrc = socket.ssrc();
        self.stats = socket.stats();
        self.socket = Some(socket);
        result
    }

    fn stop(&mut self) -> Result<()> {
        let was_streaming = self.running.is_some();
        let result = self.teardown();
        if was_streaming {
            tracing::info!(ssrc = format_args!("{:#010X}", self.ssrc), "stream stopped");
        }
        match self.pending_fault.take() {
            Some(fault) => Err(fault),
            None => result,
        }
    }

    fn stats(&self) -> Arc<Mutex<SenderStats>> {
        Arc::clone(&self.stats)
    }
}

fn stop_encoder(encoder: &SharedEncoder) {
    if let Err(e) = encoder.lock().stop() {
        tracing::debug!(error = %e, "encoder stop");
    }
}

struct Inner<C> {
    base: BaseStream,
    codec: C,
}

/// A [`Stream`] built from [`BaseStream`] and a codec.
pub struct MediaStream<C> {
    inner: Mutex<Inner<C>>,
}

impl<C: StreamCodec> MediaStream<C> {
    pub fn with_codec(codec: C, rtp_port: u16) -> Self {
        Self {
            inner: Mutex::new(Inner {
                base: BaseStream::new(rtp_port),
                codec,
            }),
        }
    }

    /// Interval between RTCP sender reports.
    pub fn set_rtcp_interval(&self, interval: Duration) {
        self.inner.lock().base.rtcp_interval = interval;
    }

    /// Run `f` on the codec; a change drops the stream back to `Idle`
    /// unless it is streaming.
    fn update_codec(&self, f: impl FnOnce(&mut C)) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.base.state == StreamState::Streaming {
            return Err(StreamError::IllegalState("stream is running"));
        }
        f(&mut inner.codec);
        inner.base.state = StreamState::Idle;
        Ok(())
    }

    fn with_codec_ref<T>(&self, f: impl FnOnce(&C) -> T) -> T {
        f(&self.inner.lock().codec)
    }
}

impl<C: StreamCodec> Stream for MediaStream<C> {
    fn configure(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.base.check()?;
        if inner.base.state == StreamState::Streaming {
            return Err(StreamError::IllegalState("stream is running"));
        }
        inner.base.state = StreamState::Idle;
        inner.codec.configure()?;
        inner.base.state = StreamState::Configured;
        tracing::debug!(kind = inner.codec.kind(), "stream configured");
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.base.check()?;
        let Inner { base, codec } = &mut *inner;
        base.start(&*codec)
    }

    fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.base.reap();
        inner.base.stop()
    }

    fn session_description(&self) -> Result<String> {
        let mut inner = self.inner.lock();
        inner.base.check()?;
        if inner.base.state == StreamState::Idle {
            return Err(StreamError::IllegalState("stream not configured"));
        }
        let sdp = inner.codec.media_description(inner.base.rtp_port)?;
        tracing::debug!(kind = inner.codec.kind(), sdp = %sdp, "media description");
        Ok(sdp)
    }

    fn state(&self) -> StreamState {
        let mut inner = self.inner.lock();
        inner.base.reap();
        inner.base.state
    }

    fn set_destination(&self, destination: IpAddr) {
        self.inner.lock().base.destination = Some(destination);
    }

    fn set_destination_ports(&self, rtp: u16, rtcp: Option<u16>) {
        let (rtp, rtcp) = udp::destination_ports(rtp, rtcp);
        let mut inner = self.inner.lock();
        inner.base.rtp_port = rtp;
        inner.base.rtcp_port = rtcp;
    }

    fn destination_ports(&self) -> (u16, u16) {
        let inner = self.inner.lock();
        (inner.base.rtp_port, inner.base.rtcp_port)
    }

    fn set_time_to_live(&self, ttl: u32) {
        self.inner.lock().base.ttl = ttl;
    }

    fn set_transport(&self, transport: Option<Arc<dyn RtpTransport>>) {
        self.inner.lock().base.transport_override = transport;
    }

    fn ssrc(&self) -> u32 {
        self.inner.lock().base.ssrc
    }

    fn stats(&self) -> SenderStats {
        *self.inner.lock().base.stats.lock()
    }
}

impl<C> Drop for MediaStream<C> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.base.running.is_some()
            && let Err(e) = inner.base.teardown()
        {
            tracing::debug!(error = %e, "stream dropped while failing");
        }
    }
}
