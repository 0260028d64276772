use std::sync::Arc;

use super::{MediaStream, StreamCodec};
use crate::codec::{EncoderFactory, MediaFormat};
use crate::error::{Result, StreamError};
use crate::media::Packetizer;
use crate::media::aac::{AacConfig, AacFraming, AacPacketizer};
use crate::media::socket::RtpSocket;
use crate::quality::AudioQuality;
use crate::sdp;

/// Default RTP port of the audio stream.
pub const DEFAULT_AUDIO_PORT: u16 = 5004;

pub struct AacCodec {
    quality: AudioQuality,
    factory: Arc<dyn EncoderFactory>,
    framing: AacFraming,
    /// Announced instead of the AAC-LC mono default, e.g. from an ADTS header.
    config_override: Option<AacConfig>,
    config: Option<AacConfig>,
}

impl AacCodec {
    pub fn new(quality: AudioQuality, factory: Arc<dyn EncoderFactory>, framing: AacFraming) -> Self {
        Self {
            quality,
            factory,
            framing,
            config_override: None,
            config: None,
        }
    }
}

impl StreamCodec for AacCodec {
    fn kind(&self) -> &'static str {
        "audio"
    }

    fn configure(&mut self) -> Result<()> {
        self.quality.validate()?;
        let config = match self.config_override {
            Some(config) => {
                if config.sampling_rate() != self.quality.sampling_rate {
                    tracing::warn!(
                        quality = self.quality.sampling_rate,
                        config = config.sampling_rate(),
                        "AAC config overrides the quality's sampling rate"
                    );
                }
                config
            }
            None => AacConfig::from_quality(&self.quality)?,
        };
        tracing::debug!(
            sampling_rate = config.sampling_rate(),
            config = %config.config_hex(),
            "AAC configured"
        );
        self.config = Some(config);
        Ok(())
    }

    fn media_description(&self, port: u16) -> Result<String> {
        let config = self
            .config
            .as_ref()
            .ok_or(StreamError::IllegalState("stream not configured"))?;
        Ok(sdp::aac_media(port, config))
    }

    fn encoder_format(&self) -> MediaFormat {
        let mut format = MediaFormat::aac(&self.quality);
        if let Some(config) = &self.config_override {
            format.channel_count = u32::from(config.channel_config);
        }
        format
    }

    fn factory(&self) -> &Arc<dyn EncoderFactory> {
        &self.factory
    }

    fn packetizer(&self, socket: RtpSocket) -> Box<dyn Packetizer> {
        Box::new(AacPacketizer::with_socket(
            socket,
            self.framing,
            self.quality.sampling_rate,
        ))
    }
}

/// AAC-LC audio stream (RFC 3640, `AAC-hbr`).
pub type AacStream = MediaStream<AacCodec>;

impl AacStream {
    /// Stream fed by an encoder that emits raw access units.
    pub fn new(quality: AudioQuality, factory: Arc<dyn EncoderFactory>) -> Self {
        Self::with_framing(quality, factory, AacFraming::Latm)
    }

    pub fn with_framing(
        quality: AudioQuality,
        factory: Arc<dyn EncoderFactory>,
        framing: AacFraming,
    ) -> Self {
        Self::with_codec(AacCodec::new(quality, factory, framing), DEFAULT_AUDIO_PORT)
    }

    pub fn audio_quality(&self) -> AudioQuality {
        self.with_codec_ref(|codec| codec.quality)
    }

    /// Requires a new `configure`.
    pub fn set_audio_quality(&self, quality: AudioQuality) -> Result<()> {
        self.update_codec(|codec| {
            codec.quality = quality;
            codec.config = None;
        })
    }

    /// Announce `config` in the SDP instead of AAC-LC mono; requires a new
    /// `configure`.
    pub fn set_aac_config(&self, config: Option<AacConfig>) -> Result<()> {
        self.update_codec(|codec| {
            codec.config_override = config;
            codec.config = None;
        })
    }

    pub fn aac_config(&self) -> Option<AacConfig> {
        self.with_codec_ref(|codec| codec.config)
    }
}
