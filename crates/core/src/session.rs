//! A session groups an optional audio and an optional video stream sent to
//! the same destination, and renders their joint SDP.
//!
//! Track 0 is audio and track 1 is video, whether or not both are present.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use crate::codec::EncoderFactory;
use crate::error::{Result, StreamError};
use crate::media::aac::{AacConfig, AacFraming};
use crate::media::rtcp::ntp_timestamp;
use crate::probe::H264Probe;
use crate::probe::mp4::TestRecorder;
use crate::quality::{AudioQuality, VideoQuality};
use crate::sdp::SessionDescription;
use crate::settings::Settings;
use crate::stream::aac::DEFAULT_AUDIO_PORT;
use crate::stream::h264::DEFAULT_VIDEO_PORT;
use crate::stream::{AacStream, H264Stream, Stream, StreamState};
use crate::transport::RtpTransport;
use crate::transport::udp::DEFAULT_TTL;

pub const AUDIO_TRACK: usize = 0;
pub const VIDEO_TRACK: usize = 1;

/// Session events. Every method defaults to doing nothing.
///
/// Called on the thread that drove the transition, with no session lock held.
pub trait SessionCallback: Send + Sync {
    fn on_session_configured(&self) {}

    fn on_session_started(&self) {}

    fn on_session_stopped(&self) {}

    /// `track` is [`AUDIO_TRACK`] or [`VIDEO_TRACK`].
    fn on_session_error(&self, _track: usize, _error: &StreamError) {}
}

pub struct Session {
    id: u64,
    origin: IpAddr,
    destination: IpAddr,
    ttl: u32,
    audio: Option<AacStream>,
    video: Option<H264Stream>,
    callback: Option<Arc<dyn SessionCallback>>,
}

impl Session {
    pub fn new(origin: IpAddr, destination: IpAddr) -> Self {
        Self {
            id: ntp_timestamp(SystemTime::now()) >> 32,
            origin,
            destination,
            ttl: DEFAULT_TTL,
            audio: None,
            video: None,
            callback: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn add_audio_track(&mut self, stream: AacStream) {
        stream.set_destination(self.destination);
        stream.set_time_to_live(self.ttl);
        self.audio = Some(stream);
    }

    pub fn add_video_track(&mut self, stream: H264Stream) {
        stream.set_destination(self.destination);
        stream.set_time_to_live(self.ttl);
        self.video = Some(stream);
    }

    pub fn audio_track(&self) -> Option<&AacStream> {
        self.audio.as_ref()
    }

    pub fn video_track(&self) -> Option<&H264Stream> {
        self.video.as_ref()
    }

    pub fn track(&self, track: usize) -> Option<&dyn Stream> {
        match track {
            AUDIO_TRACK => self.audio.as_ref().map(|s| s as &dyn Stream),
            VIDEO_TRACK => self.video.as_ref().map(|s| s as &dyn Stream),
            _ => None,
        }
    }

    fn tracks(&self) -> impl Iterator<Item = (usize, &dyn Stream)> {
        [AUDIO_TRACK, VIDEO_TRACK]
            .into_iter()
            .filter_map(|track| self.track(track).map(|s| (track, s)))
    }

    pub fn origin(&self) -> IpAddr {
        self.origin
    }

    pub fn set_origin(&mut self, origin: IpAddr) {
        self.origin = origin;
    }

    pub fn destination(&self) -> IpAddr {
        self.destination
    }

    pub fn set_destination(&mut self, destination: IpAddr) {
        self.destination = destination;
        for (_, stream) in self.tracks() {
            stream.set_destination(destination);
        }
    }

    pub fn set_time_to_live(&mut self, ttl: u32) {
        self.ttl = ttl;
        for (_, stream) in self.tracks() {
            stream.set_time_to_live(ttl);
        }
    }

    /// Route one track through `transport` (e.g. RTSP interleaved TCP).
    pub fn set_transport(&self, track: usize, transport: Option<Arc<dyn RtpTransport>>) {
        if let Some(stream) = self.track(track) {
            stream.set_transport(transport);
        }
    }

    pub fn set_callback(&mut self, callback: Option<Arc<dyn SessionCallback>>) {
        self.callback = callback;
    }

    fn report(&self, track: usize, error: StreamError) -> StreamError {
        tracing::error!(track, error = %error, "session track failed");
        if let Some(callback) = &self.callback {
            callback.on_session_error(track, &error);
        }
        error
    }

    /// Configure every track; stops at the first failure.
    pub fn configure(&self) -> Result<()> {
        for (track, stream) in self.tracks() {
            stream.configure().map_err(|e| self.report(track, e))?;
        }
        tracing::info!(session_id = self.id, "session configured");
        if let Some(callback) = &self.callback {
            callback.on_session_configured();
        }
        Ok(())
    }

    /// Start every track, configuring idle ones first.
    ///
    /// When one track fails the others are stopped again.
    pub fn start(&self) -> Result<()> {
        for (track, stream) in self.tracks() {
            let started = match stream.state() {
                StreamState::Streaming => Ok(()),
                StreamState::Idle => stream.configure().and_then(|()| stream.start()),
                StreamState::Configured => stream.start(),
            };
            if let Err(e) = started {
                for (_, other) in self.tracks() {
                    let _ = other.stop();
                }
                return Err(self.report(track, e));
            }
        }
        tracing::info!(
            session_id = self.id,
            destination = %self.destination,
            "session started"
        );
        if let Some(callback) = &self.callback {
            callback.on_session_started();
        }
        Ok(())
    }

    /// Stop every track; returns the first failure after all are stopped.
    pub fn stop(&self) -> Result<()> {
        let mut first = None;
        for (track, stream) in self.tracks() {
            if let Err(e) = stream.stop() {
                let e = self.report(track, e);
                if first.is_none() {
                    first = Some(e);
                }
            }
        }
        tracing::info!(session_id = self.id, "session stopped");
        if let Some(callback) = &self.callback {
            callback.on_session_stopped();
        }
        first.map_or(Ok(()), Err)
    }

    pub fn is_streaming(&self) -> bool {
        self.tracks().any(|(_, stream)| stream.is_streaming())
    }

    /// Full SDP; every track must be configured.
    pub fn session_description(&self) -> Result<String> {
        let mut sdp = SessionDescription::new(self.id, self.origin, self.destination);
        for (track, stream) in self.tracks() {
            sdp.add_media(track, stream.session_description()?);
        }
        if sdp.media_count() == 0 {
            return Err(StreamError::IllegalState("session has no tracks"));
        }
        let text = sdp.to_string();
        tracing::debug!(session_id = self.id, sdp = %text, "session description");
        Ok(text)
    }
}

/// Everything needed to build a [`Session`].
///
/// A track is created when its factory is set.
#[derive(Clone)]
pub struct SessionBuilder {
    pub origin: IpAddr,
    pub destination: IpAddr,
    pub ttl: u32,
    pub video_quality: VideoQuality,
    pub audio_quality: AudioQuality,
    pub video_port: u16,
    pub audio_port: u16,
    pub video_factory: Option<Arc<dyn EncoderFactory>>,
    pub audio_factory: Option<Arc<dyn EncoderFactory>>,
    pub audio_framing: AacFraming,
    /// AudioSpecificConfig to announce instead of AAC-LC mono.
    pub audio_config: Option<AacConfig>,
    /// Probe cache shared with the video stream.
    pub settings: Option<Settings>,
    pub recorder: Option<Arc<dyn TestRecorder>>,
    pub storage_dir: Option<PathBuf>,
    pub callback: Option<Arc<dyn SessionCallback>>,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self {
            origin: Ipv4Addr::LOCALHOST.into(),
            destination: Ipv4Addr::LOCALHOST.into(),
            ttl: DEFAULT_TTL,
            video_quality: VideoQuality::default(),
            audio_quality: AudioQuality::default(),
            video_port: DEFAULT_VIDEO_PORT,
            audio_port: DEFAULT_AUDIO_PORT,
            video_factory: None,
            audio_factory: None,
            audio_framing: AacFraming::Latm,
            audio_config: None,
            settings: None,
            recorder: None,
            storage_dir: None,
            callback: None,
        }
    }
}

impl SessionBuilder {
    pub fn build(&self) -> Result<Session> {
        let mut session = Session::new(self.origin, self.destination);
        session.set_time_to_live(self.ttl);
        session.set_callback(self.callback.clone());

        if let Some(factory) = &self.audio_factory {
            let stream =
                AacStream::with_framing(self.audio_quality, Arc::clone(factory), self.audio_framing);
            if self.audio_config.is_some() {
                stream.set_aac_config(self.audio_config)?;
            }
            stream.set_destination_ports(self.audio_port, None);
            session.add_audio_track(stream);
        }

        if let Some(factory) = &self.video_factory {
            let stream = H264Stream::new(self.video_quality, Arc::clone(factory));
            stream.set_probe(H264Probe {
                settings: self.settings.clone(),
                factory: Some(Arc::clone(factory)),
                recorder: self.recorder.clone(),
                storage_dir: self.storage_dir.clone(),
                timeout: None,
            })?;
            stream.set_destination_ports(self.video_port, None);
            session.add_video_track(stream);
        }

        tracing::debug!(
            session_id = session.id(),
            audio = session.audio.is_some(),
            video = session.video.is_some(),
            "session built"
        );
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::codec::BufferFlags;
    use crate::codec::testing::Step;
    use crate::stream::testing::ScriptedFactory;
    use crate::transport::testing::CaptureTransport;

    #[derive(Default)]
    struct Events {
        configured: AtomicUsize,
        started: AtomicUsize,
        stopped: AtomicUsize,
        errors: Mutex<Vec<usize>>,
    }

    impl SessionCallback for Events {
        fn on_session_configured(&self) {
            self.configured.fetch_add(1, Ordering::SeqCst);
        }

        fn on_session_started(&self) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        fn on_session_stopped(&self) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }

        fn on_session_error(&self, track: usize, _error: &StreamError) {
            self.errors.lock().push(track);
        }
    }

    fn sps_pps() -> Step {
        Step::Output {
            data: vec![0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1e, 0, 0, 0, 1, 0x68, 0xce, 0x38, 0x80],
            pts_us: 0,
            flags: BufferFlags::CODEC_CONFIG,
        }
    }

    #[test]
    fn defaults() {
        let builder = SessionBuilder::default();
        assert_eq!(builder.video_port, 5006);
        assert_eq!(builder.audio_port, 5004);
        assert_eq!(builder.ttl, 64);
        let session = builder.build().unwrap();
        assert!(session.audio_track().is_none() && session.video_track().is_none());
        assert!(matches!(
            session.session_description(),
            Err(StreamError::IllegalState(_))
        ));
    }

    #[test]
    fn audio_and_video_description() {
        let events = Arc::new(Events::default());
        let builder = SessionBuilder {
            origin: Ipv4Addr::new(192, 168, 1, 10).into(),
            destination: Ipv4Addr::new(192, 168, 1, 20).into(),
            video_factory: Some(ScriptedFactory::new(vec![vec![sps_pps()]])),
            audio_factory: Some(ScriptedFactory::new(Vec::new())),
            callback: Some(events.clone()),
            ..SessionBuilder::default()
        };
        let session = builder.build().unwrap();
        assert!(session.session_description().is_err());

        session.configure().unwrap();
        assert_eq!(events.configured.load(Ordering::SeqCst), 1);
        let sdp = session.session_description().unwrap();

        let id = session.id();
        assert!(sdp.starts_with(&format!(
            "v=0\r\no=- {id} {id} IN IP4 192.168.1.10\r\ns=Unnamed\r\n"
        )));
        assert!(sdp.contains("c=IN IP4 192.168.1.20\r\n"));
        let audio = sdp.find("m=audio 5004 RTP/AVP 96").unwrap();
        let video = sdp.find("m=video 5006 RTP/AVP 96").unwrap();
        assert!(audio < video);
        assert!(sdp.contains("a=control:track0\r\nm=video"));
        assert!(sdp.ends_with("a=control:track1\r\n"));
    }

    #[test]
    fn failed_track_reports_and_stops_others() {
        let events = Arc::new(Events::default());
        let builder = SessionBuilder {
            // Audio encoder is rejected at start; video has a probe script only.
            video_factory: Some(ScriptedFactory::new(vec![vec![sps_pps()], Vec::new()])),
            audio_factory: Some(ScriptedFactory::new(Vec::new())),
            callback: Some(events.clone()),
            ..SessionBuilder::default()
        };
        let session = builder.build().unwrap();
        for track in [AUDIO_TRACK, VIDEO_TRACK] {
            session.set_transport(track, Some(Arc::new(CaptureTransport::default())));
        }

        let err = session.start().unwrap_err();
        assert!(matches!(err, StreamError::ConfigUnsupported(_)));
        assert_eq!(*events.errors.lock(), vec![AUDIO_TRACK]);
        assert_eq!(events.started.load(Ordering::SeqCst), 0);
        assert!(!session.is_streaming());
    }

    #[test]
    fn start_and_stop_video_only() {
        let events = Arc::new(Events::default());
        let builder = SessionBuilder {
            video_factory: Some(ScriptedFactory::new(vec![vec![sps_pps()], Vec::new()])),
            callback: Some(events.clone()),
            ..SessionBuilder::default()
        };
        let session = builder.build().unwrap();
        session.set_transport(VIDEO_TRACK, Some(Arc::new(CaptureTransport::default())));

        session.start().unwrap();
        assert!(session.is_streaming());
        assert!(session.session_description().unwrap().contains("a=control:track1\r\n"));
        session.stop().unwrap();
        assert!(!session.is_streaming());
        assert_eq!(events.started.load(Ordering::SeqCst), 1);
        assert_eq!(events.stopped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn destination_reaches_tracks() {
        let builder = SessionBuilder {
            video_factory: Some(ScriptedFactory::new(Vec::new())),
            video_port: 5009,
            ..SessionBuilder::default()
        };
        let mut session = builder.build().unwrap();
        session.set_destination(Ipv4Addr::new(10, 1, 1, 1).into());
        assert_eq!(session.destination(), IpAddr::from(Ipv4Addr::new(10, 1, 1, 1)));
        assert_eq!(
            session.track(VIDEO_TRACK).unwrap().destination_ports(),
            (5008, 5009)
        );
        assert!(session.track(2).is_none());
    }
}
