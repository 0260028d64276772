//! H.264 parameter-set discovery.
//!
//! The SDP needs SPS/PPS before the first packet is sent, so a stream probes
//! them at configuration time. Sources are tried in order:
//!
//! 1. the [`Settings`] cache, keyed by [`settings::h264_key`];
//! 2. a short-lived test encoder from the [`EncoderFactory`], read from its
//!    output format (`csd-0`/`csd-1`) or the first buffer carrying both sets;
//! 3. a [`mp4::TestRecorder`] clip whose `avcC` box is parsed.
//!
//! A successful probe is written back to the cache.

pub mod mp4;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::codec::{BufferFlags, EncoderFactory, MediaFormat, OutputStatus};
use crate::error::{Result, StreamError};
use crate::media::h264::H264Config;
use crate::quality::VideoQuality;
use crate::settings::{self, Settings};
use mp4::TestRecorder;

/// How long a test encoder may take to produce its parameter sets.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Length of the MP4 test clip.
pub const TEST_RECORDING_DURATION: Duration = Duration::from_millis(1500);

const TEST_RECORDING_NAME: &str = "rtpcast-probe.mp4";
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(10);

/// Probe sources for one H.264 stream.
#[derive(Clone, Default)]
pub struct H264Probe {
    pub settings: Option<Settings>,
    pub factory: Option<Arc<dyn EncoderFactory>>,
    pub recorder: Option<Arc<dyn TestRecorder>>,
    /// Writable directory for the MP4 test clip.
    pub storage_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl H264Probe {
    pub fn probe(&self, quality: &VideoQuality) -> Result<H264Config> {
        let key = settings::h264_key(quality);
        if let Some(cached) = self.settings.as_ref().and_then(|s| s.get(&key)) {
            match H264Config::from_setting(&cached) {
                Ok(config) => {
                    tracing::debug!(key = %key, "H.264 parameter sets from settings");
                    return Ok(config);
                }
                Err(e) => tracing::warn!(key = %key, error = %e, "ignoring cached parameter sets"),
            }
        }

        let config = match (&self.factory, &self.recorder) {
            (Some(factory), None) => self.probe_encoder(factory.as_ref(), quality)?,
            (Some(factory), Some(recorder)) => {
                match self.probe_encoder(factory.as_ref(), quality) {
                    Ok(config) => config,
                    Err(e) => {
                        tracing::warn!(error = %e, "encoder probe failed, trying test recording");
                        self.probe_recording(recorder.as_ref(), quality)?
                    }
                }
            }
            (None, Some(recorder)) => self.probe_recording(recorder.as_ref(), quality)?,
            (None, None) => {
                return Err(StreamError::ConfigUnsupported(
                    "no source for H.264 parameter sets".into(),
                ));
            }
        };

        tracing::info!(
            quality = %quality,
            profile_level_id = %config.profile_level_id(),
            "H.264 parameter sets probed"
        );
        if let Some(settings) = &self.settings {
            settings.set(key, config.to_setting());
        }
        Ok(config)
    }

    /// Run a test encoder until it reports SPS and PPS.
    pub fn probe_encoder(
        &self,
        factory: &dyn EncoderFactory,
        quality: &VideoQuality,
    ) -> Result<H264Config> {
        let mut encoder = factory.create_encoder(&MediaFormat::h264(quality))?;
        let deadline = Instant::now() + self.timeout.unwrap_or(DEFAULT_PROBE_TIMEOUT);

        let found = loop {
            if Instant::now() >= deadline {
                break None;
            }
            match encoder.dequeue_output_buffer(DEQUEUE_TIMEOUT) {
                Ok(OutputStatus::FormatChanged) => {
                    if let Ok(config) = H264Config::from_format(&encoder.output_format()) {
                        break Some(config);
                    }
                }
                Ok(OutputStatus::Buffer { index, info }) => {
                    let config = encoder.output_buffer(index).ok().and_then(|buf| {
                        let end = (info.offset + info.size).min(buf.len());
                        let data = buf.get(info.offset..end)?;
                        let parsed = H264Config::from_annex_b(data);
                        if parsed.is_err() && info.flags.contains(BufferFlags::CODEC_CONFIG) {
                            tracing::debug!(size = info.size, "codec-config buffer without SPS/PPS");
                        }
                        parsed.ok()
                    });
                    encoder.release_output_buffer(index)?;
                    if config.is_some() {
                        break config;
                    }
                }
                Ok(OutputStatus::TryAgainLater | OutputStatus::BuffersChanged) => {}
                Err(e) => {
                    let _ = encoder.stop();
                    return Err(e.into());
                }
            }
        };

        if let Err(e) = encoder.stop() {
            tracing::debug!(error = %e, "test encoder stop failed");
        }
        found.ok_or_else(|| {
            StreamError::ConfigUnsupported(format!(
                "encoder produced no SPS/PPS for {quality}"
            ))
        })
    }

    /// Record a short clip and read its `avcC` box.
    pub fn probe_recording(
        &self,
        recorder: &dyn TestRecorder,
        quality: &VideoQuality,
    ) -> Result<H264Config> {
        let dir = self
            .storage_dir
            .as_ref()
            .ok_or_else(|| StreamError::StorageUnavailable("no storage directory".into()))?;
        let writable = fs::metadata(dir)
            .map(|meta| meta.is_dir() && !meta.permissions().readonly())
            .unwrap_or(false);
        if !writable {
            return Err(StreamError::StorageUnavailable(format!(
                "{} is not a writable directory",
                dir.display()
            )));
        }

        let path = dir.join(TEST_RECORDING_NAME);
        tracing::debug!(path = %path.display(), "recording H.264 test clip");
        let recorded = recorder
            .record(&path, quality, TEST_RECORDING_DURATION)
            .map_err(|e| StreamError::ConfigUnsupported(format!("test recording failed: {e}")))
            .and_then(|()| Ok(fs::read(&path)?));
        if let Err(e) = fs::remove_file(&path) {
            tracing::debug!(error = %e, "test clip not removed");
        }
        let file = recorded?;
        mp4::parse_avcc(mp4::find_avcc(&file)?)
    }
}
