//! Encoding quality values for video and audio streams.

use std::fmt;

use crate::error::{Result, StreamError};

/// Sampling frequencies addressable by a 4-bit MPEG-4 `samplingFrequencyIndex`
/// (ISO 14496-3 §1.6.3.4). Indices 13–15 are reserved.
pub const AUDIO_SAMPLING_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// Index of `rate` in [`AUDIO_SAMPLING_RATES`], if it is one of the 13 entries.
pub fn sampling_rate_index(rate: u32) -> Option<u8> {
    AUDIO_SAMPLING_RATES
        .iter()
        .position(|&r| r == rate)
        .map(|i| i as u8)
}

/// Resolution, frame rate and bit rate of a video stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VideoQuality {
    pub res_x: u32,
    pub res_y: u32,
    /// Frames per second.
    pub framerate: u32,
    /// Bits per second.
    pub bitrate: u32,
}

impl VideoQuality {
    pub const fn new(res_x: u32, res_y: u32, framerate: u32, bitrate: u32) -> Self {
        Self {
            res_x,
            res_y,
            framerate,
            bitrate,
        }
    }

    /// Reject zero fields before they reach an encoder.
    pub fn validate(&self) -> Result<()> {
        if self.res_x == 0 || self.res_y == 0 || self.framerate == 0 || self.bitrate == 0 {
            return Err(StreamError::InvalidQuality(self.to_string()));
        }
        Ok(())
    }

    /// Parse `"<kbps>-<fps>-<width>-<height>"`.
    ///
    /// Missing trailing fields keep the value from `default`; a field that is
    /// present but not a number is an error.
    ///
    /// ```
    /// use rtpcast::quality::VideoQuality;
    ///
    /// let q = VideoQuality::parse("1000-30-640-480", VideoQuality::default()).unwrap();
    /// assert_eq!(q, VideoQuality::new(640, 480, 30, 1_000_000));
    /// ```
    pub fn parse(s: &str, default: VideoQuality) -> Result<Self> {
        let mut quality = default;
        let fields = parse_fields(s)?;
        if let Some(&kbps) = fields.first() {
            quality.bitrate = kbps_to_bps(kbps, s)?;
        }
        if let Some(&fps) = fields.get(1) {
            quality.framerate = fps;
        }
        if let Some(&w) = fields.get(2) {
            quality.res_x = w;
        }
        if let Some(&h) = fields.get(3) {
            quality.res_y = h;
        }
        Ok(quality)
    }
}

impl Default for VideoQuality {
    fn default() -> Self {
        Self::new(176, 144, 20, 500_000)
    }
}

impl fmt::Display for VideoQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} px, {} fps, {} kbps",
            self.res_x,
            self.res_y,
            self.framerate,
            self.bitrate / 1000
        )
    }
}

/// Sampling rate and bit rate of an audio stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioQuality {
    /// Hz; must be one of [`AUDIO_SAMPLING_RATES`].
    pub sampling_rate: u32,
    /// Bits per second.
    pub bit_rate: u32,
}

impl AudioQuality {
    pub const fn new(sampling_rate: u32, bit_rate: u32) -> Self {
        Self {
            sampling_rate,
            bit_rate,
        }
    }

    /// Sampling-frequency index for the AudioSpecificConfig.
    pub fn sampling_rate_index(&self) -> Result<u8> {
        sampling_rate_index(self.sampling_rate)
            .ok_or(StreamError::UnsupportedSamplingRate(self.sampling_rate))
    }

    pub fn validate(&self) -> Result<()> {
        if self.bit_rate == 0 {
            return Err(StreamError::InvalidQuality(self.to_string()));
        }
        self.sampling_rate_index().map(|_| ())
    }

    /// Parse `"<kbps>-<samplingRate>"`.
    pub fn parse(s: &str, default: AudioQuality) -> Result<Self> {
        let mut quality = default;
        let fields = parse_fields(s)?;
        if let Some(&kbps) = fields.first() {
            quality.bit_rate = kbps_to_bps(kbps, s)?;
        }
        if let Some(&rate) = fields.get(1) {
            quality.sampling_rate = rate;
        }
        Ok(quality)
    }
}

impl Default for AudioQuality {
    fn default() -> Self {
        Self::new(8000, 32_000)
    }
}

impl fmt::Display for AudioQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Hz, {} kbps", self.sampling_rate, self.bit_rate / 1000)
    }
}

fn kbps_to_bps(kbps: u32, s: &str) -> Result<u32> {
    kbps.checked_mul(1000)
        .ok_or_else(|| StreamError::InvalidQuality(s.trim().to_string()))
}

fn parse_fields(s: &str) -> Result<Vec<u32>> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(Vec::new());
    }
    s.split('-')
        .map(|f| {
            f.trim()
                .parse::<u32>()
                .map_err(|_| StreamError::InvalidQuality(s.to_string()))
        })
        .collect()
}
