//! Byte-stream view of the encoder output.
//!
//! [`CodecInputStream`] hides the frame pool behind a blocking reader. Each
//! read drains the current access unit; when it is exhausted the frame goes
//! back to the pool and the next one is polled in [`POLL_SLICE`] steps so a
//! concurrent [`InputCloser::close`] is noticed quickly.

use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::codec::{MediaFormat, SharedEncoder};
use crate::error::StreamError;
use crate::media::queue::{Frame, FramePool};
use crate::media::reader;

/// Longest single wait on the frame queue before `closed` is re-checked.
pub const POLL_SLICE: Duration = Duration::from_millis(50);

/// State shared by the encoder reader and the adapter.
pub(crate) struct Shared {
    pub(crate) pool: FramePool,
    closed: AtomicBool,
    format: Mutex<Option<MediaFormat>>,
    fault: Mutex<Option<StreamError>>,
}

impl Shared {
    pub(crate) fn new(pool: FramePool) -> Self {
        Self {
            pool,
            closed: AtomicBool::new(false),
            format: Mutex::new(None),
            fault: Mutex::new(None),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn set_format(&self, format: MediaFormat) {
        *self.format.lock() = Some(format);
    }

    pub(crate) fn format(&self) -> Option<MediaFormat> {
        self.format.lock().clone()
    }

    /// Keep the first fault only; later ones are consequences of it.
    pub(crate) fn record_fault(&self, err: StreamError) {
        let mut fault = self.fault.lock();
        if fault.is_none() {
            *fault = Some(err);
        }
    }

    pub(crate) fn take_fault(&self) -> Option<StreamError> {
        self.fault.lock().take()
    }
}

pub(crate) fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "input stream closed")
}

/// Source of coded access units for a packetizer.
///
/// Reads never span two access units: after a successful read,
/// [`presentation_time_us`](Self::presentation_time_us) is the pts of the
/// unit the bytes came from and [`available`](Self::available) is what is
/// left of it. Once closed, reads fail with [`io::ErrorKind::BrokenPipe`].
pub trait MediaInput: Read + Send {
    /// Pts of the most recently latched access unit.
    fn presentation_time_us(&self) -> i64;

    /// Bytes left in the current access unit.
    fn available(&self) -> usize;

    fn close(&mut self);

    fn is_closed(&self) -> bool;

    /// Read one whole access unit into `out`, returning its pts.
    fn read_access_unit(&mut self, out: &mut Vec<u8>) -> io::Result<i64> {
        out.clear();
        let mut chunk = [0u8; 4096];
        loop {
            let n = self.read(&mut chunk)?;
            out.extend_from_slice(&chunk[..n]);
            if !out.is_empty() && self.available() == 0 {
                return Ok(self.presentation_time_us());
            }
        }
    }
}

/// Closes a [`CodecInputStream`] from another thread.
#[derive(Clone)]
pub struct InputCloser {
    shared: Arc<Shared>,
}

impl InputCloser {
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Encoder fault that closed the input, if any.
    pub fn take_fault(&self) -> Option<StreamError> {
        self.shared.take_fault()
    }
}

/// Blocking reader over an encoder's output, fed by a dedicated reader thread.
pub struct CodecInputStream {
    shared: Arc<Shared>,
    current: Option<Frame>,
    cursor: usize,
    last_pts_us: i64,
    reader: Option<JoinHandle<()>>,
}

impl CodecInputStream {
    /// Start draining `encoder` into a default-sized frame pool.
    pub fn new(encoder: SharedEncoder) -> io::Result<Self> {
        Self::with_pool(encoder, FramePool::default())
    }

    pub fn with_pool(encoder: SharedEncoder, pool: FramePool) -> io::Result<Self> {
        let shared = Arc::new(Shared::new(pool));
        let reader = reader::spawn(encoder, Arc::clone(&shared))?;
        Ok(Self {
            shared,
            current: None,
            cursor: 0,
            last_pts_us: 0,
            reader: Some(reader),
        })
    }

    pub fn closer(&self) -> InputCloser {
        InputCloser {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Last format reported by the encoder, with its codec-specific data.
    pub fn output_format(&self) -> Option<MediaFormat> {
        self.shared.format()
    }

    pub fn pool(&self) -> &FramePool {
        &self.shared.pool
    }

    fn release_current(&mut self) {
        if let Some(frame) = self.current.take() {
            self.shared.pool.recycle(frame);
        }
        self.cursor = 0;
    }

    fn latch_next(&mut self) -> io::Result<()> {
        loop {
            if self.shared.is_closed() {
                return Err(closed_error());
            }
            if let Some(frame) = self.shared.pool.poll(POLL_SLICE) {
                self.last_pts_us = frame.presentation_time_us();
                self.cursor = 0;
                self.current = Some(frame);
                return Ok(());
            }
        }
    }
}

impl Read for CodecInputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.shared.is_closed() {
            self.release_current();
            return Err(closed_error());
        }
        if self.current.is_none() {
            self.latch_next()?;
        }
        let Some(frame) = self.current.as_ref() else {
            return Err(closed_error());
        };

        let remaining = &frame.as_bytes()[self.cursor..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.cursor += n;
        if self.cursor >= frame.len() {
            self.release_current();
        }
        Ok(n)
    }
}

impl MediaInput for CodecInputStream {
    fn presentation_time_us(&self) -> i64 {
        self.last_pts_us
    }

    fn available(&self) -> usize {
        self.current
            .as_ref()
            .map_or(0, |frame| frame.len() - self.cursor)
    }

    fn close(&mut self) {
        self.shared.close();
        self.release_current();
    }

    fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

impl Drop for CodecInputStream {
    fn drop(&mut self) {
        self.shared.close();
        self.release_current();
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                tracing::error!("encoder reader panicked");
            }
        }
        let drained = self.shared.pool.drain();
        tracing::debug!(drained, "input stream released");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory [`MediaInput`] for packetizer tests.

    use std::collections::VecDeque;

    use super::*;

    /// Yields the given access units in order, then reports closed.
    pub(crate) struct UnitInput {
        units: VecDeque<(Vec<u8>, i64)>,
        current: Vec<u8>,
        cursor: usize,
        pts_us: i64,
        closed: bool,
    }

    impl UnitInput {
        pub(crate) fn new(units: Vec<(Vec<u8>, i64)>) -> Self {
            Self {
                units: units.into(),
                current: Vec::new(),
                cursor: 0,
                pts_us: 0,
                closed: false,
            }
        }
    }

    impl Read for UnitInput {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.closed {
                return Err(closed_error());
            }
            if self.cursor >= self.current.len() {
                let Some((data, pts)) = self.units.pop_front() else {
                    self.closed = true;
                    return Err(closed_error());
                };
                self.current = data;
                self.cursor = 0;
                self.pts_us = pts;
            }
            let n = (self.current.len() - self.cursor).min(buf.len());
            buf[..n].copy_from_slice(&self.current[self.cursor..self.cursor + n]);
            self.cursor += n;
            Ok(n)
        }
    }

    impl MediaInput for UnitInput {
        fn presentation_time_us(&self) -> i64 {
            self.pts_us
        }

        fn available(&self) -> usize {
            self.current.len() - self.cursor
        }

        fn close(&mut self) {
            self.closed = true;
        }

        fn is_closed(&self) -> bool {
            self.closed
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Instant;

    use super::*;
    use crate::codec::testing::ScriptedEncoder;

    fn stream(frames: &[(&[u8], i64)]) -> CodecInputStream {
        CodecInputStream::with_pool(
            ScriptedEncoder::frames(frames).into_shared(),
            FramePool::new(4, 64),
        )
        .unwrap()
    }

    #[test]
    fn reads_preserve_access_unit_pts() {
        let mut input = stream(&[(&[1, 2, 3, 4, 5], 100), (&[6, 7], 200)]);
        let mut buf = [0u8; 3];

        assert_eq!(input.read(&mut buf).unwrap(), 3);
        assert_eq!(input.presentation_time_us(), 100);
        assert_eq!(input.available(), 2);
        assert_eq!(input.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[4, 5]);
        assert_eq!(input.available(), 0);

        assert_eq!(input.read(&mut buf).unwrap(), 2);
        assert_eq!(input.presentation_time_us(), 200);
    }

    #[test]
    fn read_access_unit_collects_whole_frame() {
        let big = vec![7u8; 50];
        let mut input = stream(&[(&big, 33)]);
        let mut au = Vec::new();
        let pts = input.read_access_unit(&mut au).unwrap();
        assert_eq!(pts, 33);
        assert_eq!(au, big);
    }

    #[test]
    fn close_unblocks_pending_read() {
        let mut input = stream(&[]);
        let closer = input.closer();
        let started = Instant::now();
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 8];
            let res = input.read(&mut buf);
            (res.map_err(|e| e.kind()), Instant::now())
        });
        thread::sleep(Duration::from_millis(20));
        let closed_at = Instant::now();
        closer.close();
        let (res, returned_at) = handle.join().unwrap();
        assert_eq!(res, Err(io::ErrorKind::BrokenPipe));
        assert!(returned_at.duration_since(closed_at) <= Duration::from_millis(100));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn reads_after_close_fail() {
        let mut input = stream(&[(&[1, 2], 1)]);
        input.close();
        let mut buf = [0u8; 4];
        let err = input.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(input.is_closed());
    }

    #[test]
    fn frames_return_to_pool_after_read() {
        let mut input = stream(&[(&[1, 2], 1), (&[3], 2)]);
        let mut au = Vec::new();
        input.read_access_unit(&mut au).unwrap();
        input.read_access_unit(&mut au).unwrap();
        let pool = input.pool();
        assert_eq!(pool.queued_count(), 0);
        // The reader may be holding one frame while it waits on the encoder.
        assert!(pool.free_count() >= 3);
        assert_eq!(input.available(), 0);
    }

    #[test]
    fn unit_input_ends_with_broken_pipe() {
        let mut input = testing::UnitInput::new(vec![(vec![1, 2, 3], 5)]);
        let mut au = Vec::new();
        assert_eq!(input.read_access_unit(&mut au).unwrap(), 5);
        let err = input.read_access_unit(&mut au).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
