//! Outbound RTP socket: header state plus a ring of transmit buffers.
//!
//! A packetizer fills packets in place:
//!
//! ```text
//! let buf = socket.request_buffer();          // header prefilled
//! buf[RTP_HEADER_LEN..][..n].copy_from_slice(payload);
//! socket.update_timestamp(pts_ns);
//! socket.mark_next_packet();                  // optional
//! socket.send(RTP_HEADER_LEN + n)?;           // stamps seq, transmits
//! ```
//!
//! With a non-zero cache window, sent packets are held in the ring and
//! released once the newest timestamp is more than the window ahead of
//! them, or the ring is about to wrap onto them.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::media::rtcp::{SenderStats, SharedStats};
use crate::media::rtp::{
    DYNAMIC_PAYLOAD_TYPE, RTP_HEADER_LEN, RtpHeader, random_sequence, random_ssrc,
    random_timestamp_base,
};
use crate::transport::RtpTransport;

/// Largest packet written, RTP header included.
pub const MTU: usize = 1400;

/// Transmit buffers per socket.
pub const RING_SIZE: usize = 300;

/// Clock used until a packetizer sets its own.
pub const DEFAULT_CLOCK_RATE: u32 = 90_000;

struct Slot {
    data: Box<[u8; MTU]>,
    len: usize,
    timestamp: u32,
}

pub struct RtpSocket {
    ring: Vec<Slot>,
    /// Slot handed out by the next `request_buffer`.
    buffer_in: usize,
    /// Slots sent by the packetizer but held back by the cache window.
    held: VecDeque<usize>,
    ssrc: u32,
    sequence: u16,
    timestamp_base: u32,
    timestamp: u32,
    clock_rate: u32,
    payload_type: u8,
    marker: bool,
    cache_us: u64,
    transport: Option<Arc<dyn RtpTransport>>,
    stats: SharedStats,
}

impl RtpSocket {
    /// Socket with random SSRC, initial sequence and timestamp base.
    pub fn new() -> Self {
        Self::with_state(random_ssrc(), random_sequence(), random_timestamp_base())
    }

    /// Socket with explicit RTP state.
    pub fn with_state(ssrc: u32, sequence: u16, timestamp_base: u32) -> Self {
        let ring = (0..RING_SIZE)
            .map(|_| Slot {
                data: Box::new([0u8; MTU]),
                len: 0,
                timestamp: 0,
            })
            .collect();
        tracing::debug!(
            ssrc = format_args!("{:#010X}", ssrc),
            sequence,
            timestamp_base,
            "RTP socket created"
        );
        Self {
            ring,
            buffer_in: 0,
            held: VecDeque::new(),
            ssrc,
            sequence,
            timestamp_base,
            timestamp: timestamp_base,
            clock_rate: DEFAULT_CLOCK_RATE,
            payload_type: DYNAMIC_PAYLOAD_TYPE,
            marker: false,
            cache_us: 0,
            transport: None,
            stats: Arc::new(Mutex::new(SenderStats {
                ssrc,
                clock_rate: DEFAULT_CLOCK_RATE,
                ..SenderStats::default()
            })),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Sequence number the next sent packet will carry.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Current RTP timestamp, base included.
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn timestamp_base(&self) -> u32 {
        self.timestamp_base
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    pub fn set_clock_rate(&mut self, clock_rate: u32) {
        self.clock_rate = clock_rate.max(1);
        self.stats.lock().clock_rate = self.clock_rate;
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    pub fn set_payload_type(&mut self, payload_type: u8) {
        self.payload_type = payload_type & 0x7f;
    }

    pub fn set_transport(&mut self, transport: Arc<dyn RtpTransport>) {
        tracing::debug!(
            ssrc = format_args!("{:#010X}", self.ssrc),
            destination = %transport.describe(),
            "RTP socket destination set"
        );
        self.transport = Some(transport);
    }

    pub fn transport(&self) -> Option<&Arc<dyn RtpTransport>> {
        self.transport.as_ref()
    }

    /// Detach the transport; later sends fail with `NotConnected`.
    pub fn clear_transport(&mut self) -> Option<Arc<dyn RtpTransport>> {
        self.transport.take()
    }

    /// Counters read by the RTCP reporter.
    pub fn stats(&self) -> SharedStats {
        Arc::clone(&self.stats)
    }

    /// Hold sent packets for up to `cache_us` of media time (0 sends at once).
    pub fn set_cache_size(&mut self, cache_us: u64) {
        self.cache_us = cache_us;
    }

    /// Cache window in clock ticks.
    fn cache_window(&self) -> u64 {
        let ticks = u128::from(self.cache_us) * u128::from(self.clock_rate) / 1_000_000;
        u64::try_from(ticks).unwrap_or(u64::MAX)
    }

    /// Buffer for the next packet, with the fixed header prewritten.
    ///
    /// The payload goes at `RTP_HEADER_LEN..`. Sequence number, timestamp and
    /// marker are stamped by [`send`](Self::send).
    pub fn request_buffer(&mut self) -> &mut [u8] {
        let header = RtpHeader {
            payload_type: self.payload_type,
            marker: false,
            sequence: self.sequence,
            timestamp: self.timestamp,
            ssrc: self.ssrc,
        };
        let slot = &mut self.ring[self.buffer_in];
        header.write_to(&mut slot.data[..RTP_HEADER_LEN]);
        &mut slot.data[..]
    }

    /// Set the marker bit on the packet being built.
    pub fn mark_next_packet(&mut self) {
        self.marker = true;
    }

    /// Move the RTP timestamp to the media time `ts_ns` (nanoseconds).
    pub fn update_timestamp(&mut self, ts_ns: u64) {
        let ticks = u128::from(ts_ns) * u128::from(self.clock_rate) / 1_000_000_000;
        self.timestamp = self.timestamp_base.wrapping_add(ticks as u32);
    }

    /// Advance the RTP timestamp by `ticks` of the clock.
    pub fn advance_timestamp(&mut self, ticks: u32) {
        self.timestamp = self.timestamp.wrapping_add(ticks);
    }

    /// Drop the packet being built without sending it.
    pub fn commit_buffer(&mut self) {
        self.marker = false;
        tracing::trace!("RTP buffer released without sending");
    }

    /// Finalize the requested buffer as a `len`-byte packet and transmit it.
    ///
    /// Consumes one sequence number.
    pub fn send(&mut self, len: usize) -> io::Result<()> {
        if !(RTP_HEADER_LEN..=MTU).contains(&len) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("RTP packet length {len} outside {RTP_HEADER_LEN}..={MTU}"),
            ));
        }
        let header = RtpHeader {
            payload_type: self.payload_type,
            marker: self.marker,
            sequence: self.sequence,
            timestamp: self.timestamp,
            ssrc: self.ssrc,
        };
        let index = self.buffer_in;
        let slot = &mut self.ring[index];
        header.write_to(&mut slot.data[..RTP_HEADER_LEN]);
        slot.len = len;
        slot.timestamp = self.timestamp;

        self.marker = false;
        self.sequence = self.sequence.wrapping_add(1);
        self.buffer_in = (index + 1) % RING_SIZE;

        if self.cache_us == 0 {
            return self.transmit(index);
        }

        self.held.push_back(index);
        self.release_due()
    }

    /// Transmit every held packet.
    pub fn flush(&mut self) -> io::Result<()> {
        while let Some(index) = self.held.pop_front() {
            self.transmit(index)?;
        }
        Ok(())
    }

    fn release_due(&mut self) -> io::Result<()> {
        let window = self.cache_window();
        while let Some(&oldest) = self.held.front() {
            let age = u64::from(self.timestamp.wrapping_sub(self.ring[oldest].timestamp));
            // The next request_buffer must not land on a held slot.
            if age <= window && self.held.len() < RING_SIZE {
                break;
            }
            self.held.pop_front();
            self.transmit(oldest)?;
        }
        Ok(())
    }

    fn transmit(&mut self, index: usize) -> io::Result<()> {
        let Some(transport) = self.transport.as_ref() else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "RTP socket has no transport",
            ));
        };
        let slot = &self.ring[index];
        transport.send_rtp(&slot.data[..slot.len])?;
        self.stats
            .lock()
            .record(slot.len - RTP_HEADER_LEN, slot.timestamp, Instant::now());
        tracing::trace!(
            seq = u16::from_be_bytes([slot.data[2], slot.data[3]]),
            ts = slot.timestamp,
            len = slot.len,
            "RTP packet sent"
        );
        Ok(())
    }
}

impl Default for RtpSocket {
    fn default() -> Self {
        Self::new()
    }
}
