//! Bounded, recyclable frame queue between the encoder reader and the
//! byte-stream adapter.
//!
//! A [`FramePool`] owns `capacity` frames for its whole life. A frame is
//! always in exactly one place: the free list, the FIFO of queued frames, or
//! held by value by the reader or the adapter. Ownership makes the "never
//! shared by two consumers" rule structural, and
//! `free + queued + in-flight == capacity` holds at all times.

use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::queue::ArrayQueue;

use crate::codec::{BufferFlags, BufferInfo};

/// Frames per pool.
pub const DEFAULT_POOL_CAPACITY: usize = 4;

/// Worst-case access unit size a pooled frame can hold.
pub const DEFAULT_FRAME_SIZE: usize = 200 * 1024;

/// One coded access unit copied out of the encoder.
#[derive(Debug)]
pub struct Frame {
    data: Vec<u8>,
    max_size: usize,
    offset: usize,
    size: usize,
    presentation_time_us: i64,
    flags: BufferFlags,
}

impl Frame {
    fn with_capacity(max_size: usize) -> Self {
        Self {
            data: Vec::with_capacity(max_size),
            max_size,
            offset: 0,
            size: 0,
            presentation_time_us: 0,
            flags: BufferFlags::NONE,
        }
    }

    /// Copy the valid range of an encoder output buffer into this frame.
    ///
    /// Returns the number of payload bytes kept. Payload beyond the pooled
    /// buffer size is truncated.
    pub fn set(&mut self, src: &[u8], info: &BufferInfo) -> usize {
        let start = info.offset.min(src.len());
        let end = info.offset.saturating_add(info.size).min(src.len());
        let available = end - start;
        let kept = available.min(self.max_size);
        if kept < available {
            tracing::warn!(
                size = available,
                max = self.max_size,
                "access unit larger than pooled frame, truncated"
            );
        }

        self.data.clear();
        self.data.extend_from_slice(&src[start..start + kept]);
        self.offset = 0;
        self.size = kept;
        self.presentation_time_us = info.presentation_time_us;
        self.flags = info.flags;
        kept
    }

    /// Valid payload bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.size]
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Size of the pooled buffer backing this frame.
    pub fn capacity(&self) -> usize {
        self.max_size
    }

    pub fn presentation_time_us(&self) -> i64 {
        self.presentation_time_us
    }

    pub fn flags(&self) -> BufferFlags {
        self.flags
    }

    fn clear(&mut self) {
        self.data.clear();
        self.offset = 0;
        self.size = 0;
        self.presentation_time_us = 0;
        self.flags = BufferFlags::NONE;
    }
}

/// Fixed set of reusable frames plus a FIFO of filled ones.
///
/// Single producer (the encoder reader) and single consumer (the adapter).
/// Neither side ever blocks the other except through [`poll`](Self::poll).
pub struct FramePool {
    free: ArrayQueue<Frame>,
    queued_tx: Sender<Frame>,
    queued_rx: Receiver<Frame>,
    capacity: usize,
}

impl FramePool {
    pub fn new(capacity: usize, frame_size: usize) -> Self {
        let capacity = capacity.max(1);
        let free = ArrayQueue::new(capacity);
        for _ in 0..capacity {
            let _ = free.push(Frame::with_capacity(frame_size));
        }
        let (queued_tx, queued_rx) = channel::bounded(capacity);
        tracing::debug!(capacity, frame_size, "frame pool created");
        Self {
            free,
            queued_tx,
            queued_rx,
            capacity,
        }
    }

    /// Take a free frame, or `None` if every frame is queued or in flight.
    pub fn obtain(&self) -> Option<Frame> {
        self.free.pop()
    }

    /// Append a filled frame to the FIFO.
    ///
    /// Never blocks: only frames from [`obtain`](Self::obtain) can be queued,
    /// so the channel always has room.
    pub fn queue(&self, frame: Frame) {
        if let Err(e) = self.queued_tx.try_send(frame) {
            tracing::warn!("frame queue unexpectedly full, recycling frame");
            self.recycle(e.into_inner());
        }
    }

    /// Wait up to `timeout` for the oldest queued frame.
    pub fn poll(&self, timeout: Duration) -> Option<Frame> {
        self.queued_rx.recv_timeout(timeout).ok()
    }

    /// Return a frame to the free list.
    pub fn recycle(&self, mut frame: Frame) {
        frame.clear();
        if self.free.push(frame).is_err() {
            tracing::warn!("free list full on recycle, frame dropped");
        }
    }

    /// Recycle every queued frame (used on close).
    pub fn drain(&self) -> usize {
        let mut drained = 0;
        while let Ok(frame) = self.queued_rx.try_recv() {
            self.recycle(frame);
            drained += 1;
        }
        drained
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn queued_count(&self) -> usize {
        self.queued_rx.len()
    }

    /// Frames currently held by the reader or the adapter.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.free_count() - self.queued_count()
    }
}

impl Default for FramePool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY, DEFAULT_FRAME_SIZE)
    }
}
