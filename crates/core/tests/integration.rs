//! End-to-end: a session drives a synthetic encoder and the packets are
//! received on loopback sockets.

use std::collections::VecDeque;
use std::io::Read;
use std::net::{Ipv4Addr, TcpListener, TcpStream, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rtpcast::codec::{BufferFlags, BufferInfo, Encoder, EncoderError, EncoderFactory, MediaFormat, OutputStatus};
use rtpcast::media::rtcp::PT_SENDER_REPORT;
use rtpcast::media::rtp::{RTP_HEADER_LEN, RtpHeader};
use rtpcast::session::VIDEO_TRACK;
use rtpcast::{AacStream, AudioQuality, InterleavedTransport, SessionBuilder, Stream};

const SPS: [u8; 4] = [0x67, 0x42, 0x00, 0x1e];
const PPS: [u8; 4] = [0x68, 0xce, 0x38, 0x80];

enum Event {
    Format,
    Frame(Vec<u8>, i64),
}

/// Reports its format, plays `frames` once, then idles.
struct ClipEncoder {
    events: VecDeque<Event>,
    format: MediaFormat,
    current: Vec<u8>,
    stopped: bool,
}

impl Encoder for ClipEncoder {
    fn dequeue_output_buffer(&mut self, timeout: Duration) -> Result<OutputStatus, EncoderError> {
        if self.stopped {
            return Err(EncoderError::IllegalState("stopped".into()));
        }
        match self.events.pop_front() {
            Some(Event::Format) => Ok(OutputStatus::FormatChanged),
            Some(Event::Frame(data, pts)) => {
                let info = BufferInfo {
                    offset: 0,
                    size: data.len(),
                    presentation_time_us: pts,
                    flags: BufferFlags::NONE,
                };
                self.current = data;
                Ok(OutputStatus::Buffer { index: 0, info })
            }
            None => {
                thread::sleep(timeout);
                Ok(OutputStatus::TryAgainLater)
            }
        }
    }

    fn output_buffer(&mut self, _index: usize) -> Result<&[u8], EncoderError> {
        Ok(&self.current)
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

struct ClipFactory {
    frames: Vec<(Vec<u8>, i64)>,
}

impl EncoderFactory for ClipFactory {
    fn create_encoder(&self, format: &MediaFormat) -> Result<Box<dyn Encoder>, EncoderError> {
        let format = format
            .clone()
            .with_csd(0, [&[0, 0, 0, 1][..], &SPS].concat())
            .with_csd(1, [&[0, 0, 0, 1][..], &PPS].concat());
        let mut events = VecDeque::from([Event::Format]);
        events.extend(
            self.frames
                .iter()
                .map(|(data, pts)| Event::Frame(data.clone(), *pts)),
        );
        Ok(Box::new(ClipEncoder {
            events,
            format,
            current: Vec::new(),
            stopped: false,
        }))
    }
}

fn annex_b(nal: &[u8]) -> Vec<u8> {
    [&[0, 0, 0, 1][..], nal].concat()
}

fn idr_nal(len: usize) -> Vec<u8> {
    let mut nal = vec![0x65];
    nal.extend((1..len).map(|i| (i % 251) as u8));
    nal
}

fn bind_even_port() -> UdpSocket {
    for _ in 0..64 {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        if socket.local_addr().unwrap().port() % 2 == 0 {
            return socket;
        }
    }
    panic!("no even UDP port available");
}

fn receive(socket: &UdpSocket, count: usize) -> Vec<Vec<u8>> {
    socket
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(3);
    let mut packets = Vec::new();
    let mut buf = [0u8; 2048];
    while packets.len() < count && Instant::now() < deadline {
        if let Ok(n) = socket.recv(&mut buf) {
            packets.push(buf[..n].to_vec());
        }
    }
    packets
}

#[test]
fn h264_session_over_udp() {
    let idr = idr_nal(3000);
    let factory = Arc::new(ClipFactory {
        frames: vec![
            (annex_b(&idr), 0),
            (annex_b(&[0x41, 0x9a, 0x01, 0x02]), 33_333),
            (annex_b(&[0x41, 0x9a, 0x03, 0x04]), 66_666),
        ],
    });
    let rtp = bind_even_port();
    let rtcp = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let rtp_port = rtp.local_addr().unwrap().port();
    let rtcp_port = rtcp.local_addr().unwrap().port();

    let builder = SessionBuilder {
        destination: Ipv4Addr::LOCALHOST.into(),
        video_factory: Some(factory),
        video_port: rtp_port,
        ..SessionBuilder::default()
    };
    let session = builder.build().unwrap();
    let video = session.video_track().unwrap();
    video.set_destination_ports(rtp_port, Some(rtcp_port));
    video.set_rtcp_interval(Duration::from_millis(100));

    session.configure().unwrap();
    let sdp = session.session_description().unwrap();
    assert!(sdp.contains(&format!("m=video {rtp_port} RTP/AVP 96\r\n")));
    assert!(sdp.contains("profile-level-id=42001e;sprop-parameter-sets=Z0IAHg==,aM44gA==;"));
    assert!(sdp.contains("c=IN IP4 127.0.0.1\r\n"));

    session.start().unwrap();
    // SPS, PPS, three FU-A fragments, two single NAL packets.
    let packets = receive(&rtp, 7);
    let mut report = [0u8; 64];
    rtcp.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let report_len = rtcp.recv(&mut report).unwrap();
    session.stop().unwrap();
    assert!(!session.is_streaming());

    assert_eq!(packets.len(), 7);
    let headers: Vec<RtpHeader> = packets.iter().map(|p| RtpHeader::parse(p).unwrap()).collect();
    let ssrc = video.ssrc();
    for pair in headers.windows(2) {
        assert_eq!(pair[1].sequence, pair[0].sequence.wrapping_add(1));
    }
    assert!(headers.iter().all(|h| h.ssrc == ssrc && h.payload_type == 96));
    let markers: Vec<bool> = headers.iter().map(|h| h.marker).collect();
    assert_eq!(markers, [false, false, false, false, true, true, true]);

    assert_eq!(&packets[0][RTP_HEADER_LEN..], SPS);
    assert_eq!(&packets[1][RTP_HEADER_LEN..], PPS);

    // FU-A fragments share one timestamp and reassemble to the IDR NAL.
    let fragments = &packets[2..5];
    assert!(headers[2..5].iter().all(|h| h.timestamp == headers[2].timestamp));
    assert_eq!(fragments[0][RTP_HEADER_LEN + 1] & 0xc0, 0x80);
    assert_eq!(fragments[1][RTP_HEADER_LEN + 1] & 0xc0, 0x00);
    assert_eq!(fragments[2][RTP_HEADER_LEN + 1] & 0xc0, 0x40);
    let indicator = fragments[0][RTP_HEADER_LEN];
    let mut nal = vec![(indicator & 0xe0) | (fragments[0][RTP_HEADER_LEN + 1] & 0x1f)];
    for fragment in fragments {
        assert!(fragment.len() <= 1400);
        nal.extend_from_slice(&fragment[RTP_HEADER_LEN + 2..]);
    }
    assert_eq!(nal, idr);

    assert!(headers[5].timestamp.wrapping_sub(headers[4].timestamp) as i32 > 0);
    assert!(headers[6].timestamp.wrapping_sub(headers[5].timestamp) as i32 > 0);

    // Sender report for the same SSRC.
    assert_eq!(report_len, 28);
    assert_eq!(report[1], PT_SENDER_REPORT);
    assert_eq!(u32::from_be_bytes([report[4], report[5], report[6], report[7]]), ssrc);

    assert_eq!(session.track(VIDEO_TRACK).unwrap().stats().packet_count, 7);
}

/// AAC frames streamed over a `$`-framed TCP connection.
#[test]
fn aac_stream_over_interleaved_tcp() {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (mut server, _) = listener.accept().unwrap();
    server
        .set_read_timeout(Some(Duration::from_secs(3)))
        .unwrap();

    let factory = Arc::new(ClipFactory {
        frames: vec![(vec![0x21; 200], 0), (vec![0x21; 150], 64_000)],
    });
    let stream = AacStream::new(AudioQuality::new(16_000, 32_000), factory);
    let writer = InterleavedTransport::shared_writer(client).unwrap();
    stream.set_transport(Some(Arc::new(InterleavedTransport::new(writer, 2))));

    stream.configure().unwrap();
    assert!(stream.session_description().unwrap().contains("config=1408;"));
    stream.start().unwrap();

    let mut frames = Vec::new();
    for _ in 0..2 {
        let mut prefix = [0u8; 4];
        server.read_exact(&mut prefix).unwrap();
        assert_eq!(prefix[0], b'$');
        assert_eq!(prefix[1], 2);
        let len = usize::from(u16::from_be_bytes([prefix[2], prefix[3]]));
        let mut packet = vec![0u8; len];
        server.read_exact(&mut packet).unwrap();
        frames.push(packet);
    }
    stream.stop().unwrap();

    let first = RtpHeader::parse(&frames[0]).unwrap();
    let second = RtpHeader::parse(&frames[1]).unwrap();
    assert!(first.marker && second.marker);
    assert_eq!(second.sequence, first.sequence.wrapping_add(1));
    // 64 ms at 16 kHz.
    assert_eq!(second.timestamp.wrapping_sub(first.timestamp), 1024);
    assert_eq!(&frames[0][RTP_HEADER_LEN..RTP_HEADER_LEN + 4], [0x00, 0x10, 0x06, 0x40]);
    assert_eq!(frames[1].len(), RTP_HEADER_LEN + 4 + 150);
}
