use std::sync::Arc;

use super::{MediaStream, StreamCodec};
use crate::codec::{EncoderFactory, MediaFormat};
use crate::error::{Result, StreamError};
use crate::media::Packetizer;
use crate::media::h264::{H264Config, H264Packetizer, ParameterSetPolicy};
use crate::media::socket::RtpSocket;
use crate::probe::H264Probe;
use crate::quality::VideoQuality;
use crate::sdp;

/// Default RTP port of the video stream.
pub const DEFAULT_VIDEO_PORT: u16 = 5006;

pub struct H264Codec {
    quality: VideoQuality,
    factory: Arc<dyn EncoderFactory>,
    probe: H264Probe,
    config: Option<H264Config>,
    policy: ParameterSetPolicy,
}

impl H264Codec {
    /// The factory also serves as the probe's test encoder unless
    /// [`set_probe`](H264Stream::set_probe) overrides it.
    pub fn new(quality: VideoQuality, factory: Arc<dyn EncoderFactory>) -> Self {
        let probe = H264Probe {
            factory: Some(Arc::clone(&factory)),
            ..H264Probe::default()
        };
        Self {
            quality,
            factory,
            probe,
            config: None,
            policy: ParameterSetPolicy::default(),
        }
    }
}

impl StreamCodec for H264Codec {
    fn kind(&self) -> &'static str {
        "video"
    }

    fn configure(&mut self) -> Result<()> {
        self.quality.validate()?;
        self.config = Some(self.probe.probe(&self.quality)?);
        Ok(())
    }

    fn media_description(&self, port: u16) -> Result<String> {
        let config = self
            .config
            .as_ref()
            .ok_or(StreamError::IllegalState("stream not configured"))?;
        Ok(sdp::h264_media(port, config))
    }

    fn encoder_format(&self) -> MediaFormat {
        MediaFormat::h264(&self.quality)
    }

    fn factory(&self) -> &Arc<dyn EncoderFactory> {
        &self.factory
    }

    fn packetizer(&self, socket: RtpSocket) -> Box<dyn Packetizer> {
        let mut packetizer = H264Packetizer::with_socket(socket);
        packetizer.set_parameter_set_policy(self.policy);
        if let Some(config) = &self.config {
            packetizer.set_config(config.clone());
        }
        Box::new(packetizer)
    }
}

/// H.264 video stream (RFC 6184, packetization-mode 1).
pub type H264Stream = MediaStream<H264Codec>;

impl H264Stream {
    pub fn new(quality: VideoQuality, factory: Arc<dyn EncoderFactory>) -> Self {
        Self::with_codec(H264Codec::new(quality, factory), DEFAULT_VIDEO_PORT)
    }

    pub fn video_quality(&self) -> VideoQuality {
        self.with_codec_ref(|codec| codec.quality)
    }

    /// Requires a new `configure`.
    pub fn set_video_quality(&self, quality: VideoQuality) -> Result<()> {
        self.update_codec(|codec| {
            codec.quality = quality;
            codec.config = None;
        })
    }

    pub fn set_probe(&self, probe: H264Probe) -> Result<()> {
        self.update_codec(|codec| codec.probe = probe)
    }

    pub fn set_parameter_set_policy(&self, policy: ParameterSetPolicy) -> Result<()> {
        self.update_codec(|codec| codec.policy = policy)
    }

    /// Parameter sets found by the last `configure`.
    pub fn h264_config(&self) -> Option<H264Config> {
        self.with_codec_ref(|codec| codec.config.clone())
    }
}
