pub mod codec;
pub mod error;
pub mod media;
pub mod probe;
pub mod quality;
pub mod sdp;
pub mod session;
pub mod settings;
pub mod stream;
pub mod transport;

pub use codec::{BufferFlags, BufferInfo, Encoder, EncoderError, EncoderFactory, MediaFormat, OutputStatus};
pub use error::{CodecConfigErrorKind, Result, StreamError};
pub use media::Packetizer;
pub use quality::{AudioQuality, VideoQuality};
pub use session::{Session, SessionBuilder, SessionCallback};
pub use settings::Settings;
pub use stream::{AacStream, H264Stream, Stream, StreamState};
pub use transport::{InterleavedTransport, RtpTransport, UdpTransport};
