mod source;

use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use rtpcast::media::aac::{AacConfig, AacFraming};
use rtpcast::session::{AUDIO_TRACK, VIDEO_TRACK};
use rtpcast::{AudioQuality, InterleavedTransport, SessionBuilder, VideoQuality};
use tracing_subscriber::EnvFilter;

use source::Clip;

#[derive(Parser)]
#[command(
    name = "rtpcast",
    about = "Stream H.264 (Annex B) and AAC (ADTS) files over RTP"
)]
struct Args {
    /// H.264 Annex B elementary stream
    #[arg(long)]
    video: Option<PathBuf>,

    /// AAC elementary stream with ADTS headers
    #[arg(long)]
    audio: Option<PathBuf>,

    /// Destination address
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    dest: IpAddr,

    /// Origin address written to the SDP
    #[arg(long)]
    origin: Option<IpAddr>,

    #[arg(long, default_value_t = 5006)]
    video_port: u16,

    #[arg(long, default_value_t = 5004)]
    audio_port: u16,

    #[arg(long, default_value_t = 64)]
    ttl: u32,

    /// "<kbps>-<fps>-<width>-<height>"; the framerate paces the file
    #[arg(long, default_value = "")]
    video_quality: String,

    /// "<kbps>-<sampling rate>"; the rate is taken from the file
    #[arg(long, default_value = "")]
    audio_quality: String,

    /// Send RTP interleaved on a TCP connection to this address instead of UDP
    #[arg(long)]
    tcp: Option<SocketAddr>,

    /// Write the SDP here instead of stdout
    #[arg(long)]
    sdp_out: Option<PathBuf>,

    /// Restart the files when they end
    #[arg(long = "loop")]
    looping: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    if args.video.is_none() && args.audio.is_none() {
        bail!("nothing to stream: pass --video and/or --audio");
    }

    let mut builder = SessionBuilder {
        origin: args.origin.unwrap_or(args.dest),
        destination: args.dest,
        ttl: args.ttl,
        video_port: args.video_port,
        audio_port: args.audio_port,
        ..SessionBuilder::default()
    };

    if let Some(path) = &args.video {
        let quality = VideoQuality::parse(&args.video_quality, VideoQuality::default())?;
        let (clip, config) = Clip::h264(path, quality.framerate, args.looping)?;
        tracing::info!(profile_level_id = %config.profile_level_id(), quality = %quality, "video track");
        builder.video_quality = quality;
        builder.video_factory = Some(Arc::new(clip));
    }

    if let Some(path) = &args.audio {
        let (clip, header) = Clip::adts(path, args.looping)?;
        let mut quality = AudioQuality::parse(&args.audio_quality, AudioQuality::default())?;
        quality.sampling_rate = header.sampling_rate();
        let config = AacConfig::from_adts(&header);
        tracing::info!(
            quality = %quality,
            channels = header.channel_config,
            config = %config.config_hex(),
            "audio track"
        );
        builder.audio_quality = quality;
        builder.audio_framing = AacFraming::Adts;
        builder.audio_config = Some(config);
        builder.audio_factory = Some(Arc::new(clip));
    }

    let session = builder.build()?;

    if let Some(addr) = args.tcp {
        let stream = TcpStream::connect(addr).with_context(|| format!("connecting to {addr}"))?;
        let writer = InterleavedTransport::shared_writer(stream)?;
        for (track, channel) in [(AUDIO_TRACK, 0), (VIDEO_TRACK, 2)] {
            let transport = InterleavedTransport::new(Arc::clone(&writer), channel);
            session.set_transport(track, Some(Arc::new(transport)));
        }
    }

    session.configure()?;
    let sdp = session.session_description()?;
    match &args.sdp_out {
        Some(path) => {
            fs::write(path, &sdp).with_context(|| format!("writing {}", path.display()))?;
            tracing::info!(path = %path.display(), "SDP written");
        }
        None => print!("{sdp}"),
    }

    session.start()?;
    eprintln!("streaming to {}, press Enter to stop", args.dest);

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut line = String::new();
        let _ = io::stdin().read_line(&mut line);
        let _ = tx.send(());
    });
    while session.is_streaming() {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }
    }

    session.stop()?;
    Ok(())
}
