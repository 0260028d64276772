//! Network transports for outbound RTP and RTCP.
//!
//! Two implementations of [`RtpTransport`]:
//!
//! - **UDP** ([`udp`]): RTP to an even port, RTCP to the next one, with a
//!   configurable multicast TTL.
//! - **Interleaved TCP** ([`tcp`]): RTP and RTCP multiplexed on one byte
//!   stream using `$` framing (RFC 2326 §10.12), typically the RTSP
//!   connection handed over by the signaling server.
//!
//! A transport is shared between the packetizer thread and the RTCP timer,
//! so every method takes `&self`.

pub mod tcp;
pub mod udp;

use std::io;

pub use tcp::InterleavedTransport;
pub use udp::UdpTransport;

/// Sink for serialized RTP and RTCP packets of one stream.
pub trait RtpTransport: Send + Sync {
    /// Send one complete RTP packet (header included).
    fn send_rtp(&self, packet: &[u8]) -> io::Result<()>;

    /// Send one compound RTCP packet.
    fn send_rtcp(&self, packet: &[u8]) -> io::Result<()>;

    /// Human-readable destination for logs.
    fn describe(&self) -> String;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Transport that records every packet instead of sending it.

    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    pub(crate) struct CaptureTransport {
        pub(crate) rtp: Mutex<Vec<Vec<u8>>>,
        pub(crate) rtcp: Mutex<Vec<Vec<u8>>>,
    }

    impl CaptureTransport {
        pub(crate) fn rtp_packets(&self) -> Vec<Vec<u8>> {
            self.rtp.lock().clone()
        }

        pub(crate) fn rtcp_packets(&self) -> Vec<Vec<u8>> {
            self.rtcp.lock().clone()
        }
    }

    impl RtpTransport for CaptureTransport {
        fn send_rtp(&self, packet: &[u8]) -> io::Result<()> {
            self.rtp.lock().push(packet.to_vec());
            Ok(())
        }

        fn send_rtcp(&self, packet: &[u8]) -> io::Result<()> {
            self.rtcp.lock().push(packet.to_vec());
            Ok(())
        }

        fn describe(&self) -> String {
            "capture".to_string()
        }
    }
}
