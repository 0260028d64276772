//! `avcC` extraction from a short MP4 test recording (ISO 14496-12/15).
//!
//! Only the path down to the first video sample entry is walked:
//!
//! ```text
//! moov ─ trak ─ mdia ─ minf ─ stbl ─ stsd ─ avc1 ─ avcC
//! ```

use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt};

use crate::error::{CodecConfigErrorKind, Result, StreamError};
use crate::media::h264::H264Config;
use crate::quality::VideoQuality;

const fn fourcc(code: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*code)
}

const MOOV: u32 = fourcc(b"moov");
const TRAK: u32 = fourcc(b"trak");
const MDIA: u32 = fourcc(b"mdia");
const MINF: u32 = fourcc(b"minf");
const STBL: u32 = fourcc(b"stbl");
const STSD: u32 = fourcc(b"stsd");
const AVC1: u32 = fourcc(b"avc1");
const AVC3: u32 = fourcc(b"avc3");
const AVCC: u32 = fourcc(b"avcC");

/// Bytes of a VisualSampleEntry before its child boxes.
const VISUAL_SAMPLE_ENTRY_LEN: u64 = 78;

/// Records a short H.264 clip into an MP4 file.
///
/// Stands in for the platform's media recorder; the stream only needs the
/// `avcC` box of the result.
pub trait TestRecorder: Send + Sync {
    fn record(&self, path: &Path, quality: &VideoQuality, duration: Duration) -> std::io::Result<()>;
}

/// Parameter sets from an `AVCDecoderConfigurationRecord` (the `avcC` payload).
pub fn parse_avcc(record: &[u8]) -> Result<H264Config> {
    let malformed = |_| StreamError::codec_config(CodecConfigErrorKind::MalformedAvcc);
    let mut reader = Cursor::new(record);

    let version = reader.read_u8().map_err(malformed)?;
    if version != 1 {
        return Err(StreamError::codec_config(CodecConfigErrorKind::MalformedAvcc));
    }
    let profile = reader.read_u8().map_err(malformed)?;
    let compat = reader.read_u8().map_err(malformed)?;
    let level = reader.read_u8().map_err(malformed)?;
    let _length_size = reader.read_u8().map_err(malformed)? & 0x03;

    let sps_count = reader.read_u8().map_err(malformed)? & 0x1f;
    let mut sps = None;
    for _ in 0..sps_count {
        let unit = read_unit(&mut reader).map_err(malformed)?;
        if sps.is_none() {
            sps = Some(unit);
        }
    }
    let pps_count = reader.read_u8().map_err(malformed)?;
    let mut pps = None;
    for _ in 0..pps_count {
        let unit = read_unit(&mut reader).map_err(malformed)?;
        if pps.is_none() {
            pps = Some(unit);
        }
    }

    tracing::debug!(profile, level, sps_count, pps_count, "avcC parsed");
    match (sps, pps) {
        (Some(sps), Some(pps)) => Ok(H264Config::new(&sps, &pps)?
            .with_profile_level_id(format!("{profile:02x}{compat:02x}{level:02x}"))),
        _ => Err(StreamError::codec_config(
            CodecConfigErrorKind::MissingParameterSets,
        )),
    }
}

fn read_unit<R: Read>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let len = reader.read_u16::<BigEndian>()?;
    let mut unit = vec![0; usize::from(len)];
    reader.read_exact(&mut unit)?;
    Ok(unit)
}

/// Find the `avcC` payload of the first H.264 track in an MP4 file.
pub fn find_avcc(file: &[u8]) -> Result<&[u8]> {
    let mut reader = Cursor::new(file);
    let end = file.len() as u64;
    descend(&mut reader, end, &[MOOV, TRAK, MDIA, MINF, STBL, STSD])
        .and_then(|(start, end)| avcc_in_stsd(&mut reader, start, end))
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                StreamError::codec_config(CodecConfigErrorKind::MissingAvcc)
            }
            _ => StreamError::codec_config(CodecConfigErrorKind::MalformedAvcc),
        })
        .map(|(start, end)| &file[start as usize..end as usize])
}

/// Read a box header at the current position: `(type, payload end)`.
fn read_header(reader: &mut Cursor<&[u8]>, limit: u64) -> std::io::Result<(u32, u64)> {
    let start = reader.position();
    let size = reader.read_u32::<BigEndian>()?;
    let box_type = reader.read_u32::<BigEndian>()?;
    let end = match size {
        0 => limit,
        1 => start + reader.read_u64::<BigEndian>()?,
        n => start + u64::from(n),
    };
    if end > limit || end < reader.position() {
        return Err(std::io::ErrorKind::InvalidData.into());
    }
    Ok((box_type, end))
}

/// Walk `path` from the current position; returns the payload range of its last box.
fn descend(reader: &mut Cursor<&[u8]>, mut end: u64, path: &[u32]) -> std::io::Result<(u64, u64)> {
    let mut start = reader.position();
    for &wanted in path {
        (start, end) = child(reader, end, wanted)?;
    }
    Ok((start, end))
}

/// Payload range of the first child box of type `wanted` before `end`.
fn child(reader: &mut Cursor<&[u8]>, end: u64, wanted: u32) -> std::io::Result<(u64, u64)> {
    while reader.position() + 8 <= end {
        let (box_type, box_end) = read_header(reader, end)?;
        if box_type == wanted {
            return Ok((reader.position(), box_end));
        }
        reader.seek(SeekFrom::Start(box_end))?;
    }
    Err(std::io::ErrorKind::NotFound.into())
}

fn avcc_in_stsd(reader: &mut Cursor<&[u8]>, start: u64, end: u64) -> std::io::Result<(u64, u64)> {
    reader.seek(SeekFrom::Start(start))?;
    let _version_flags = reader.read_u32::<BigEndian>()?;
    let entries = reader.read_u32::<BigEndian>()?;
    for _ in 0..entries {
        let (entry_type, entry_end) = read_header(reader, end)?;
        if matches!(entry_type, AVC1 | AVC3) {
            let children = reader.position() + VISUAL_SAMPLE_ENTRY_LEN;
            reader.seek(SeekFrom::Start(children))?;
            return child(reader, entry_end, AVCC);
        }
        reader.seek(SeekFrom::Start(entry_end))?;
    }
    Err(std::io::ErrorKind::NotFound.into())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SPS: [u8; 4] = [0x67, 0x42, 0xc0, 0x1f];
    pub(crate) const PPS: [u8; 4] = [0x68, 0xce, 0x3c, 0x80];

    fn mp4_box(box_type: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
        out.extend_from_slice(box_type);
        out.extend_from_slice(payload);
        out
    }

    pub(crate) fn avcc_record() -> Vec<u8> {
        let mut record = vec![1, SPS[1], SPS[2], SPS[3], 0xff, 0xe1];
        record.extend_from_slice(&(SPS.len() as u16).to_be_bytes());
        record.extend_from_slice(&SPS);
        record.push(1);
        record.extend_from_slice(&(PPS.len() as u16).to_be_bytes());
        record.extend_from_slice(&PPS);
        record
    }

    /// Minimal file: `ftyp`, then `moov` down to `avc1/avcC`.
    pub(crate) fn test_file() -> Vec<u8> {
        let mut avc1 = vec![0; VISUAL_SAMPLE_ENTRY_LEN as usize];
        avc1.extend(mp4_box(b"avcC", &avcc_record()));
        let mut stsd = vec![0, 0, 0, 0, 0, 0, 0, 1];
        stsd.extend(mp4_box(b"avc1", &avc1));
        let mut stbl = mp4_box(b"stts", &[0; 8]);
        stbl.extend(mp4_box(b"stsd", &stsd));
        let minf = mp4_box(b"stbl", &stbl);
        let mdia = mp4_box(b"minf", &minf);
        let mut trak = mp4_box(b"tkhd", &[0; 20]);
        trak.extend(mp4_box(b"mdia", &mdia));
        let moov = mp4_box(b"trak", &trak);

        let mut file = mp4_box(b"ftyp", b"isom\0\0\0\0");
        file.extend(mp4_box(b"mdat", &[0; 32]));
        file.extend(mp4_box(b"moov", &moov));
        file
    }

    #[test]
    fn parses_record() {
        let config = parse_avcc(&avcc_record()).unwrap();
        assert_eq!(config.sps(), SPS);
        assert_eq!(config.pps(), PPS);
        assert_eq!(config.profile_level_id(), "42c01f");
    }

    #[test]
    fn profile_level_id_comes_from_record() {
        let mut record = avcc_record();
        record[3] = 0x28;
        let config = parse_avcc(&record).unwrap();
        assert_eq!(config.profile_level_id(), "42c028");
        assert_eq!(config.sps(), SPS);
    }

    #[test]
    fn finds_avcc_in_file() {
        let file = test_file();
        let record = find_avcc(&file).unwrap();
        assert_eq!(record, avcc_record().as_slice());
    }

    #[test]
    fn file_without_avcc() {
        let file = mp4_box(b"moov", &mp4_box(b"trak", &[]));
        let err = find_avcc(&file).unwrap_err();
        assert!(matches!(
            err,
            StreamError::InvalidCodecConfig {
                kind: CodecConfigErrorKind::MissingAvcc
            }
        ));
    }

    #[test]
    fn truncated_record() {
        let record = avcc_record();
        let err = parse_avcc(&record[..9]).unwrap_err();
        assert!(matches!(
            err,
            StreamError::InvalidCodecConfig {
                kind: CodecConfigErrorKind::MalformedAvcc
            }
        ));
    }

    #[test]
    fn oversized_box_is_malformed() {
        let mut file = mp4_box(b"moov", &[0; 8]);
        file[3] = 0xff;
        assert!(find_avcc(&file).is_err());
    }
}
