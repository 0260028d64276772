//! RTCP sender reports (RFC 3550 §6.4.1).
//!
//! The packetizer thread updates a [`SenderStats`] after every packet; an
//! [`RtcpReporter`] thread snapshots it periodically and emits an SR that
//! maps the current wallclock to the stream's RTP timeline.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ByteOrder};
use parking_lot::Mutex;

use crate::media::rtp::RTP_VERSION;
use crate::transport::RtpTransport;

/// RTCP packet type for a sender report.
pub const PT_SENDER_REPORT: u8 = 200;

/// Size of an SR without reception report blocks.
pub const SR_LEN: usize = 28;

/// Period between two sender reports.
pub const DEFAULT_RTCP_INTERVAL: Duration = Duration::from_secs(5);

/// Seconds between the NTP epoch (1900) and the Unix epoch.
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Running send counters of one RTP stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderStats {
    pub ssrc: u32,
    pub clock_rate: u32,
    pub packet_count: u32,
    /// Payload bytes sent, RTP headers excluded.
    pub octet_count: u32,
    /// RTP timestamp of the last packet sent.
    pub last_timestamp: u32,
    pub last_sent: Option<Instant>,
}

impl SenderStats {
    pub(crate) fn record(&mut self, payload_len: usize, timestamp: u32, now: Instant) {
        self.packet_count = self.packet_count.wrapping_add(1);
        self.octet_count = self.octet_count.wrapping_add(payload_len as u32);
        self.last_timestamp = timestamp;
        self.last_sent = Some(now);
    }

    /// RTP timestamp matching `now`, extrapolated from the last sent packet.
    pub fn rtp_timestamp_at(&self, now: Instant) -> u32 {
        match self.last_sent {
            Some(sent) => {
                let elapsed = now.saturating_duration_since(sent);
                let ticks = elapsed.as_nanos() * u128::from(self.clock_rate) / 1_000_000_000;
                self.last_timestamp.wrapping_add(ticks as u32)
            }
            None => self.last_timestamp,
        }
    }
}

/// Counters shared between the packetizer and the reporter.
pub type SharedStats = Arc<Mutex<SenderStats>>;

/// 64-bit NTP timestamp (32.32 fixed point seconds since 1900).
pub fn ntp_timestamp(wallclock: SystemTime) -> u64 {
    let since_unix = wallclock.duration_since(UNIX_EPOCH).unwrap_or_default();
    let secs = since_unix.as_secs() + NTP_UNIX_OFFSET;
    let frac = (u64::from(since_unix.subsec_nanos()) << 32) / 1_000_000_000;
    (secs << 32) | frac
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp_timestamp: u64,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
}

impl SenderReport {
    pub fn from_stats(stats: &SenderStats, wallclock: SystemTime, now: Instant) -> Self {
        Self {
            ssrc: stats.ssrc,
            ntp_timestamp: ntp_timestamp(wallclock),
            rtp_timestamp: stats.rtp_timestamp_at(now),
            packet_count: stats.packet_count,
            octet_count: stats.octet_count,
        }
    }

    /// Serialize with no reception report blocks.
    ///
    /// ```text
    /// |V=2|P|RC=0|  PT=200  |        length = 6         |
    /// |                 SSRC of sender                  |
    /// |            NTP timestamp, most significant      |
    /// |            NTP timestamp, least significant     |
    /// |                 RTP timestamp                   |
    /// |             sender's packet count               |
    /// |              sender's octet count               |
    /// ```
    pub fn to_bytes(&self) -> [u8; SR_LEN] {
        let mut buf = [0u8; SR_LEN];
        buf[0] = RTP_VERSION << 6;
        buf[1] = PT_SENDER_REPORT;
        BigEndian::write_u16(&mut buf[2..4], (SR_LEN / 4 - 1) as u16);
        BigEndian::write_u32(&mut buf[4..8], self.ssrc);
        BigEndian::write_u64(&mut buf[8..16], self.ntp_timestamp);
        BigEndian::write_u32(&mut buf[16..20], self.rtp_timestamp);
        BigEndian::write_u32(&mut buf[20..24], self.packet_count);
        BigEndian::write_u32(&mut buf[24..28], self.octet_count);
        buf
    }
}

/// Background thread sending a sender report every `interval`.
///
/// Checks its `running` flag every 50 ms so [`stop`](Self::stop) returns
/// promptly.
pub struct RtcpReporter {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RtcpReporter {
    pub fn spawn(
        stats: SharedStats,
        transport: Arc<dyn RtpTransport>,
        interval: Duration,
    ) -> io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name("rtcp-sender".into())
            .spawn(move || report_loop(&stats, transport.as_ref(), interval, &flag))?;
        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("RTCP sender panicked");
            }
        }
    }
}

impl Drop for RtcpReporter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn report_loop(
    stats: &SharedStats,
    transport: &dyn RtpTransport,
    interval: Duration,
    running: &AtomicBool,
) {
    let mut next = Instant::now() + interval;
    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now < next {
            thread::sleep(SLEEP_SLICE.min(next - now));
            continue;
        }
        next = now + interval;

        let snapshot = *stats.lock();
        if snapshot.packet_count == 0 {
            continue;
        }
        let sr = SenderReport::from_stats(&snapshot, SystemTime::now(), now);
        match transport.send_rtcp(&sr.to_bytes()) {
            Ok(()) => tracing::trace!(
                ssrc = format_args!("{:#010X}", sr.ssrc),
                packets = sr.packet_count,
                octets = sr.octet_count,
                rtp_ts = sr.rtp_timestamp,
                "sender report sent"
            ),
            Err(e) => tracing::warn!(error = %e, "failed to send sender report"),
        }
    }
    tracing::debug!("RTCP sender exited");
}
