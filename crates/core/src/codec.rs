//! Contract with the platform encoder.
//!
//! The encoder itself is an external collaborator. The library only drains
//! its output: [`Encoder::dequeue_output_buffer`] waits for a coded buffer,
//! [`Encoder::output_buffer`] exposes its bytes, and
//! [`Encoder::release_output_buffer`] hands it back.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::StreamError;
use crate::quality::{AudioQuality, VideoQuality};

pub const MIME_AVC: &str = "video/avc";
pub const MIME_AAC: &str = "audio/mp4a-latm";

/// AAC Low Complexity audio object type.
pub const AAC_PROFILE_LC: u8 = 2;

/// Per-buffer flags reported by the encoder and carried on queued frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferFlags(u32);

impl BufferFlags {
    pub const NONE: Self = Self(0);
    pub const KEY_FRAME: Self = Self(1);
    pub const CODEC_CONFIG: Self = Self(2);
    pub const END_OF_STREAM: Self = Self(4);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// Metadata for one coded output buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferInfo {
    /// Start of valid data within the output buffer.
    pub offset: usize,
    /// Number of valid bytes.
    pub size: usize,
    /// Presentation timestamp in microseconds.
    pub presentation_time_us: i64,
    pub flags: BufferFlags,
}

/// Result of waiting on the encoder's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStatus {
    /// A coded buffer is ready at `index`.
    Buffer { index: usize, info: BufferInfo },
    /// Nothing ready within the timeout.
    TryAgainLater,
    /// [`Encoder::output_format`] changed (typically carries `csd-0`/`csd-1`).
    FormatChanged,
    /// Output buffer set was reallocated.
    BuffersChanged,
}

/// Failures reported by an [`Encoder`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum EncoderError {
    /// Encoder is stopped or released; the reader stops draining.
    #[error("encoder in illegal state: {0}")]
    IllegalState(String),
    /// The requested format was refused at configuration time.
    #[error("format rejected: {0}")]
    Rejected(String),
    /// Any other runtime failure.
    #[error("{0}")]
    Fault(String),
}

impl From<EncoderError> for StreamError {
    fn from(e: EncoderError) -> Self {
        match e {
            EncoderError::Rejected(msg) => StreamError::ConfigUnsupported(msg),
            EncoderError::IllegalState(msg) | EncoderError::Fault(msg) => {
                StreamError::EncoderFault(msg)
            }
        }
    }
}

/// Encoder output format: the requested parameters plus codec-specific data.
///
/// For H.264, `csd-0` holds the SPS and `csd-1` the PPS (each usually with an
/// Annex B start code). For AAC, `csd-0` holds the AudioSpecificConfig.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaFormat {
    pub mime: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub bit_rate: u32,
    pub sample_rate: u32,
    pub channel_count: u32,
    pub aac_profile: u8,
    /// Key-frame interval in seconds.
    pub i_frame_interval: u32,
    csd: Vec<Vec<u8>>,
}

impl MediaFormat {
    pub fn video(mime: &str, width: u32, height: u32) -> Self {
        Self {
            mime: mime.to_string(),
            width,
            height,
            ..Self::default()
        }
    }

    pub fn audio(mime: &str, sample_rate: u32, channel_count: u32) -> Self {
        Self {
            mime: mime.to_string(),
            sample_rate,
            channel_count,
            ..Self::default()
        }
    }

    /// H.264 encoder request for `quality`, one key frame per second.
    pub fn h264(quality: &VideoQuality) -> Self {
        Self {
            frame_rate: quality.framerate,
            bit_rate: quality.bitrate,
            i_frame_interval: 1,
            ..Self::video(MIME_AVC, quality.res_x, quality.res_y)
        }
    }

    /// AAC LC mono encoder request for `quality`.
    pub fn aac(quality: &AudioQuality) -> Self {
        Self {
            bit_rate: quality.bit_rate,
            aac_profile: AAC_PROFILE_LC,
            ..Self::audio(MIME_AAC, quality.sampling_rate, 1)
        }
    }

    /// Codec-specific data `csd-<index>`.
    pub fn csd(&self, index: usize) -> Option<&[u8]> {
        self.csd.get(index).map(Vec::as_slice)
    }

    pub fn set_csd(&mut self, index: usize, data: Vec<u8>) {
        if self.csd.len() <= index {
            self.csd.resize(index + 1, Vec::new());
        }
        self.csd[index] = data;
    }

    #[must_use]
    pub fn with_csd(mut self, index: usize, data: Vec<u8>) -> Self {
        self.set_csd(index, data);
        self
    }
}

/// A running platform encoder, drained by the library.
pub trait Encoder: Send {
    /// Wait up to `timeout` for the next output event.
    fn dequeue_output_buffer(&mut self, timeout: Duration) -> Result<OutputStatus, EncoderError>;

    /// Bytes of the output buffer at `index` (valid range given by its [`BufferInfo`]).
    fn output_buffer(&mut self, index: usize) -> Result<&[u8], EncoderError>;

    /// Return the output buffer at `index` to the encoder.
    fn release_output_buffer(&mut self, index: usize) -> Result<(), EncoderError>;

    /// Latest output format.
    fn output_format(&self) -> MediaFormat;

    /// Stop encoding and release resources. Further calls fail with
    /// [`EncoderError::IllegalState`].
    fn stop(&mut self) -> Result<(), EncoderError>;
}

/// Encoder shared between the reader worker and the stream that owns it.
pub type SharedEncoder = Arc<Mutex<Box<dyn Encoder>>>;

/// Creates and starts encoders for a requested format.
///
/// Implemented by the platform glue; returns [`EncoderError::Rejected`] when
/// the format (size, rate, profile) is not supported.
pub trait EncoderFactory: Send + Sync {
    fn create_encoder(&self, format: &MediaFormat) -> Result<Box<dyn Encoder>, EncoderError>;
}
