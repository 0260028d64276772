//! File-backed encoders that replay an elementary stream in real time.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use rtpcast::codec::{BufferFlags, BufferInfo, Encoder, EncoderError, EncoderFactory, MediaFormat, OutputStatus};
use rtpcast::media::aac::{AAC_FRAME_SAMPLES, AdtsHeader};
use rtpcast::media::h264::{H264Config, NAL_IDR, nal_type, split_nal_units};

struct AccessUnit {
    data: Vec<u8>,
    pts_us: i64,
    key_frame: bool,
}

/// A parsed file, handed out as a fresh encoder on every request.
pub struct Clip {
    units: Arc<Vec<AccessUnit>>,
    duration_us: i64,
    csd: Vec<Vec<u8>>,
    looping: bool,
}

fn is_vcl(nal_type: u8) -> bool {
    (1..=5).contains(&nal_type)
}

/// `first_mb_in_slice == 0`: its ue(v) code is a single `1` bit.
fn starts_picture(nal: &[u8]) -> bool {
    nal.get(1).is_some_and(|b| b & 0x80 != 0)
}

impl Clip {
    /// Annex B H.264 file, one access unit per `1 / framerate`.
    pub fn h264(path: &Path, framerate: u32, looping: bool) -> anyhow::Result<(Self, H264Config)> {
        let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let config = H264Config::from_annex_b(&data)
            .with_context(|| format!("{} has no SPS/PPS", path.display()))?;

        let mut pictures: Vec<Vec<&[u8]>> = Vec::new();
        let mut current: Vec<&[u8]> = Vec::new();
        let mut has_vcl = false;
        for nal in split_nal_units(&data) {
            let vcl = is_vcl(nal_type(nal));
            if has_vcl && (!vcl || starts_picture(nal)) {
                pictures.push(std::mem::take(&mut current));
                has_vcl = false;
            }
            has_vcl |= vcl;
            current.push(nal);
        }
        if has_vcl {
            pictures.push(current);
        }
        if pictures.is_empty() {
            bail!("{} holds no coded pictures", path.display());
        }

        let frame_us = 1_000_000 / i64::from(framerate.max(1));
        let units: Vec<AccessUnit> = pictures
            .into_iter()
            .enumerate()
            .map(|(i, nals)| AccessUnit {
                key_frame: nals.iter().any(|n| nal_type(n) == NAL_IDR),
                data: nals
                    .iter()
                    .flat_map(|n| [&[0, 0, 0, 1][..], n])
                    .flatten()
                    .copied()
                    .collect(),
                pts_us: i as i64 * frame_us,
            })
            .collect();
        tracing::info!(path = %path.display(), pictures = units.len(), "H.264 file loaded");

        let csd = vec![
            [&[0, 0, 0, 1][..], config.sps()].concat(),
            [&[0, 0, 0, 1][..], config.pps()].concat(),
        ];
        let clip = Self {
            duration_us: units.len() as i64 * frame_us,
            units: Arc::new(units),
            csd,
            looping,
        };
        Ok((clip, config))
    }

    /// ADTS AAC file; returns its first header, which describes the stream.
    pub fn adts(path: &Path, looping: bool) -> anyhow::Result<(Self, AdtsHeader)> {
        let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let first = AdtsHeader::parse(&data)
            .with_context(|| format!("{} does not start with an ADTS header", path.display()))?;
        let rate = first.sampling_rate();
        let frame_us = i64::from(AAC_FRAME_SAMPLES) * 1_000_000 / i64::from(rate);

        let mut units = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            let Ok(header) = AdtsHeader::parse(&data[offset..]) else {
                tracing::warn!(offset, "trailing bytes after last ADTS frame ignored");
                break;
            };
            let end = (offset + header.frame_length).min(data.len());
            units.push(AccessUnit {
                data: data[offset..end].to_vec(),
                pts_us: units.len() as i64 * frame_us,
                key_frame: true,
            });
            offset = end;
        }
        tracing::info!(path = %path.display(), frames = units.len(), sampling_rate = rate, "ADTS file loaded");

        let clip = Self {
            duration_us: units.len() as i64 * frame_us,
            units: Arc::new(units),
            csd: Vec::new(),
            looping,
        };
        Ok((clip, first))
    }
}

impl EncoderFactory for Clip {
    fn create_encoder(&self, format: &MediaFormat) -> Result<Box<dyn Encoder>, EncoderError> {
        let mut format = format.clone();
        for (i, csd) in self.csd.iter().enumerate() {
            format.set_csd(i, csd.clone());
        }
        Ok(Box::new(ClipEncoder {
            units: Arc::clone(&self.units),
            duration_us: self.duration_us,
            looping: self.looping,
            announce_format: !self.csd.is_empty(),
            format,
            next: 0,
            loops: 0,
            started: None,
            stopped: false,
        }))
    }
}

/// Hands out the clip's access units when their pts comes due.
struct ClipEncoder {
    units: Arc<Vec<AccessUnit>>,
    duration_us: i64,
    looping: bool,
    announce_format: bool,
    format: MediaFormat,
    next: usize,
    loops: i64,
    started: Option<Instant>,
    stopped: bool,
}

impl Encoder for ClipEncoder {
    fn dequeue_output_buffer(&mut self, timeout: Duration) -> Result<OutputStatus, EncoderError> {
        if self.stopped {
            return Err(EncoderError::IllegalState("stopped".into()));
        }
        if self.announce_format {
            self.announce_format = false;
            return Ok(OutputStatus::FormatChanged);
        }
        if self.next == self.units.len() {
            if !self.looping {
                return Err(EncoderError::IllegalState("end of file".into()));
            }
            self.next = 0;
            self.loops += 1;
        }

        let unit = &self.units[self.next];
        let pts_us = unit.pts_us + self.loops * self.duration_us;
        let started = *self.started.get_or_insert_with(Instant::now);
        let due = started + Duration::from_micros(u64::try_from(pts_us).unwrap_or(0));
        let now = Instant::now();
        if due > now {
            thread::sleep((due - now).min(timeout));
            if Instant::now() < due {
                return Ok(OutputStatus::TryAgainLater);
            }
        }

        let index = self.next;
        self.next += 1;
        let flags = if unit.key_frame {
            BufferFlags::KEY_FRAME
        } else {
            BufferFlags::NONE
        };
        Ok(OutputStatus::Buffer {
            index,
            info: BufferInfo {
                offset: 0,
                size: unit.data.len(),
                presentation_time_us: pts_us,
                flags,
            },
        })
    }

    fn output_buffer(&mut self, index: usize) -> Result<&[u8], EncoderError> {
        self.units
            .get(index)
            .map(|unit| unit.data.as_slice())
            .ok_or_else(|| EncoderError::Fault(format!("no output buffer {index}")))
    }

    fn release_output_buffer(&mut self, _index: usize) -> Result<(), EncoderError> {
        Ok(())
    }

    fn output_format(&self) -> MediaFormat {
        self.format.clone()
    }

    fn stop(&mut self) -> Result<(), EncoderError> {
        self.stopped = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rtpcast::media::aac::AacConfig;

    use super::*;

    fn write_temp(name: &str, data: &[u8]) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("{}-{name}", std::process::id()));
        fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn h264_pictures_group_parameter_sets() {
        let mut data = Vec::new();
        for nal in [
            &[0x67, 0x42, 0x00, 0x1e][..],
            &[0x68, 0xce, 0x38, 0x80],
            &[0x65, 0x88, 0x01],
            &[0x41, 0x9a, 0x02],
            &[0x41, 0x9a, 0x03],
        ] {
            data.extend_from_slice(&[0, 0, 0, 1]);
            data.extend_from_slice(nal);
        }
        let path = write_temp("clip.h264", &data);
        let (clip, config) = Clip::h264(&path, 25, false).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(config.profile_level_id(), "42001e");
        assert_eq!(clip.units.len(), 3);
        assert!(clip.units[0].key_frame);
        assert_eq!(split_nal_units(&clip.units[0].data).len(), 3);
        assert_eq!(clip.units[2].pts_us, 80_000);
        assert_eq!(clip.duration_us, 120_000);
    }

    #[test]
    fn adts_frames() {
        // 44.1 kHz mono, 10-byte frames (7-byte header + 3 bytes).
        let frame = [0xff, 0xf1, 0x50, 0x40, 0x01, 0x5f, 0xfc, 1, 2, 3];
        let path = write_temp("clip.aac", &[frame, frame].concat());
        let (clip, header) = Clip::adts(&path, false).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(header.sampling_rate(), 44_100);
        assert_eq!(header.channel_config, 1);
        assert_eq!(clip.units.len(), 2);
        assert_eq!(clip.units[1].pts_us, 23_219);
    }

    #[test]
    fn adts_stereo_header_is_returned() {
        let frame = [0xff, 0xf1, 0x50, 0x80, 0x01, 0x5f, 0xfc, 1, 2, 3];
        let path = write_temp("stereo.aac", &frame);
        let (_, header) = Clip::adts(&path, false).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(header.object_type, 2);
        assert_eq!(header.channel_config, 2);
        assert_eq!(AacConfig::from_adts(&header).config_hex(), "1210");
    }

    #[test]
    fn encoder_ends_unless_looping() {
        let clip = Clip {
            units: Arc::new(vec![AccessUnit {
                data: vec![1],
                pts_us: 0,
                key_frame: true,
            }]),
            duration_us: 1000,
            csd: Vec::new(),
            looping: false,
        };
        let mut encoder = clip.create_encoder(&MediaFormat::default()).unwrap();
        let timeout = Duration::from_millis(10);
        assert!(matches!(
            encoder.dequeue_output_buffer(timeout),
            Ok(OutputStatus::Buffer { index: 0, .. })
        ));
        assert!(matches!(
            encoder.dequeue_output_buffer(timeout),
            Err(EncoderError::IllegalState(_))
        ));
    }
}
