//! Error types for the streaming library.

use std::fmt;

/// Errors that can occur while configuring or running a stream.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Configuration**: [`ConfigUnsupported`](Self::ConfigUnsupported),
///   [`UnsupportedSamplingRate`](Self::UnsupportedSamplingRate),
///   [`InvalidQuality`](Self::InvalidQuality),
///   [`InvalidCodecConfig`](Self::InvalidCodecConfig).
/// - **Lifecycle**: [`IllegalState`](Self::IllegalState), API misuse such as
///   asking for SDP before `configure()`.
/// - **Transport**: [`Io`](Self::Io), terminal for the current session.
/// - **Encoder**: [`EncoderFault`](Self::EncoderFault).
/// - **Probe**: [`StorageUnavailable`](Self::StorageUnavailable), raised by the
///   MP4 test-recording path.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Underlying I/O or socket error, or the input stream was closed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The encoder rejected the requested size, rate or profile.
    #[error("configuration not supported: {0}")]
    ConfigUnsupported(String),

    /// The call is not valid in the current stream state.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    /// Unexpected runtime failure reported by the encoder.
    #[error("encoder fault: {0}")]
    EncoderFault(String),

    /// The legacy probe path needs a writable directory for its test recording.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Sampling rate is not one of the 13 MPEG-4 audio frequencies.
    #[error("unsupported sampling rate: {0} Hz")]
    UnsupportedSamplingRate(u32),

    /// A quality value was zero or could not be parsed.
    #[error("invalid quality: {0}")]
    InvalidQuality(String),

    /// Codec configuration (SPS/PPS, avcC, ADTS header, cached setting) is malformed.
    #[error("invalid codec configuration: {kind}")]
    InvalidCodecConfig { kind: CodecConfigErrorKind },
}

/// Specific kind of codec configuration failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecConfigErrorKind {
    /// SPS is shorter than the 4 bytes needed for `profile-level-id`.
    SpsTooShort,
    /// SPS or PPS is missing.
    MissingParameterSets,
    /// A base64 field could not be decoded.
    Base64,
    /// A cached settings entry did not have the `profile,sps,pps` shape.
    MalformedSetting,
    /// No `avcC` box found in the test recording.
    MissingAvcc,
    /// The `avcC` record has an unexpected version or is truncated.
    MalformedAvcc,
    /// ADTS header without the 0xFFF syncword or with a bad length.
    MalformedAdts,
}

impl fmt::Display for CodecConfigErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SpsTooShort => write!(f, "SPS too short for profile-level-id"),
            Self::MissingParameterSets => write!(f, "SPS or PPS missing"),
            Self::Base64 => write!(f, "invalid base64"),
            Self::MalformedSetting => write!(f, "malformed cached setting"),
            Self::MissingAvcc => write!(f, "no avcC box"),
            Self::MalformedAvcc => write!(f, "malformed avcC box"),
            Self::MalformedAdts => write!(f, "malformed ADTS header"),
        }
    }
}

impl StreamError {
    pub(crate) fn codec_config(kind: CodecConfigErrorKind) -> Self {
        Self::InvalidCodecConfig { kind }
    }

    /// Whether this error means the input stream was closed under the reader.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::BrokenPipe)
    }
}

/// Convenience alias for `Result<T, StreamError>`.
pub type Result<T> = std::result::Result<T, StreamError>;
