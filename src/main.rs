use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use whip_ingest::config::{self, InputFormat, PublishConfig};
use whip_ingest::media::encoder::{CodecSelector, EncoderBuilder, PassthroughEncoder};
use whip_ingest::media::source::{AnnexBSource, FrameSource, IvfSource, OggSource};
use whip_ingest::media::MediaKind;
use whip_ingest::webrtc::{ConnectionState, PublisherPeer, Track, TrackConfig, WhipSession};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// Publish a pre-encoded video stream to a WHIP endpoint
#[derive(Parser, Debug)]
#[command(name = "whip-publish")]
#[command(version, about = "Publish video to a WHIP ingest endpoint", long_about = None)]
struct CliArgs {
    /// WHIP endpoint URL (overrides config file)
    endpoint: Option<String>,

    /// Bearer token for the endpoint
    #[arg(short = 't', long, value_name = "TOKEN")]
    token: Option<String>,

    /// ICE server URL, may be repeated (default: stun:stun.l.google.com:19302)
    #[arg(short = 'i', long = "ice-server", value_name = "URL")]
    ice_servers: Vec<String>,

    /// Video codecs in preference order, comma separated
    #[arg(long = "video-codec", value_name = "CODEC", value_delimiter = ',')]
    video_codecs: Vec<String>,

    /// Video input path, "-" for stdin
    #[arg(short = 'I', long, value_name = "PATH")]
    input: Option<String>,

    /// Framing of the video input
    #[arg(short = 'f', long = "input-format", value_name = "FORMAT")]
    input_format: Option<InputFormat>,

    /// Opus audio input in an Ogg container, "-" for stdin
    #[arg(short = 'a', long, value_name = "PATH")]
    audio: Option<String>,

    /// Frame width of H.264 input
    #[arg(long, value_name = "PIXELS")]
    width: Option<u32>,

    /// Frame height of H.264 input
    #[arg(long, value_name = "PIXELS")]
    height: Option<u32>,

    /// Pace input at this frame rate (0 = as fast as it arrives)
    #[arg(long, value_name = "FPS")]
    fps: Option<u32>,

    /// Skip TLS certificate verification
    #[arg(long)]
    insecure: bool,

    /// TOML configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting whip-publish v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => config::load(path).await?,
        None => PublishConfig::default(),
    };
    apply_cli_overrides(&mut config, &args);
    config.validate()?;

    let selector = Arc::new(build_selector(&config)?);
    let stream_id = format!("whip-{}", uuid::Uuid::new_v4());

    let mut tracks = vec![Track::new(
        TrackConfig {
            stream_id: stream_id.clone(),
            mtu: config.webrtc.mtu,
            ..Default::default()
        },
        open_video_source(&config)?,
        selector.clone(),
    )];
    if let Some(source) = open_audio_source(&config)? {
        tracks.push(Track::new(
            TrackConfig {
                track_id: "audio0".to_string(),
                stream_id,
                kind: MediaKind::Audio,
                mtu: config.webrtc.mtu,
                ..Default::default()
            },
            source,
            selector.clone(),
        ));
    }

    let (ended_tx, mut ended_rx) = mpsc::unbounded_channel();
    for track in &tracks {
        let ended_tx = ended_tx.clone();
        let track_id = track.id().to_string();
        track.on_ended(move |err| {
            tracing::error!("Track {} ended: {}", track_id, err);
            let _ = ended_tx.send(());
        });
    }

    let mut peer = PublisherPeer::new(&config.webrtc, &selector).await?;
    for track in &tracks {
        peer.add_track(track.clone()).await?;
    }
    let mut peer_state = peer.state_watch();

    let mut session = WhipSession::new(&config.whip, Box::new(peer))?;
    if let Err(e) = session.publish().await {
        tracing::error!("Publishing failed: {}", e);
        if let Err(close_err) = session.close().await {
            tracing::warn!("Cleanup after failed publish: {}", close_err);
        }
        return Err(e.into());
    }

    let stdin_busy = config.video.is_stdin() || config.audio.is_stdin();
    if stdin_busy {
        tracing::info!("Publishing; press Ctrl-C to finish");
    } else {
        tracing::info!("Publishing; press Enter or Ctrl-C to finish");
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted"),
        _ = wait_for_enter(!stdin_busy) => tracing::info!("Finishing"),
        _ = ended_rx.recv() => tracing::warn!("Stopping after track error"),
        state = wait_for_peer_failure(&mut peer_state) => {
            tracing::warn!("Stopping, peer connection {}", state)
        }
    }

    for track in &tracks {
        let stats = track.stats();
        tracing::info!(
            "Track {}: sent {} packets ({} bytes, {} key frames)",
            track.id(),
            stats.packets_sent,
            stats.bytes_sent,
            stats.key_frames_sent
        );
    }

    session.close().await?;
    tracing::info!("Session closed");
    Ok(())
}

fn apply_cli_overrides(config: &mut PublishConfig, args: &CliArgs) {
    if let Some(endpoint) = &args.endpoint {
        config.whip.endpoint = endpoint.clone();
    }
    if let Some(token) = &args.token {
        config.whip.token = Some(token.clone());
    }
    if args.insecure {
        config.whip.insecure = true;
    }
    if !args.ice_servers.is_empty() {
        config.webrtc.stun_servers = args.ice_servers.clone();
    }
    if !args.video_codecs.is_empty() {
        config.webrtc.video_codecs = args.video_codecs.clone();
    }
    if let Some(input) = &args.input {
        config.video.input = input.clone();
    }
    if let Some(format) = args.input_format {
        config.video.format = format;
    }
    if let Some(width) = args.width {
        config.video.width = width;
    }
    if let Some(height) = args.height {
        config.video.height = height;
    }
    if let Some(fps) = args.fps {
        config.video.fps = fps;
    }
    if let Some(audio) = &args.audio {
        config.audio.input = Some(audio.clone());
    }
}

/// Encoder candidates able to forward the configured input, in the
/// configured codec preference order
fn build_selector(config: &PublishConfig) -> anyhow::Result<CodecSelector> {
    let available: Vec<Arc<dyn EncoderBuilder>> = match config.video.format {
        InputFormat::H264 => vec![Arc::new(PassthroughEncoder::h264()) as Arc<dyn EncoderBuilder>],
        InputFormat::Ivf => vec![
            Arc::new(PassthroughEncoder::vp8()) as Arc<dyn EncoderBuilder>,
            Arc::new(PassthroughEncoder::vp9()),
        ],
    };

    let mut selector = CodecSelector::new();
    for name in &config.webrtc.video_codecs {
        for builder in available.iter().filter(|b| b.codec().matches_name(name)) {
            selector.register(builder.clone());
        }
    }

    if selector.candidates(MediaKind::Video).is_empty() {
        anyhow::bail!(
            "{} input cannot be sent as any of [{}]",
            config.video.format,
            config.webrtc.video_codecs.join(", ")
        );
    }
    if config.audio.is_enabled() {
        selector.register(Arc::new(PassthroughEncoder::opus()));
    }
    Ok(selector)
}

/// Open a file, or stdin for "-"
fn open_input(path: &str, what: &str) -> anyhow::Result<Box<dyn Read + Send>> {
    if path == "-" {
        return Ok(Box::new(std::io::stdin()));
    }
    let file = std::fs::File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open {} input {}: {}", what, path, e))?;
    Ok(Box::new(file))
}

fn open_video_source(config: &PublishConfig) -> anyhow::Result<Box<dyn FrameSource>> {
    let video = &config.video;
    let reader = open_input(&video.input, "video")?;
    tracing::info!("Reading {} video from {}", video.format, video.input);

    let source: Box<dyn FrameSource> = match video.format {
        InputFormat::H264 => Box::new(AnnexBSource::new(
            reader,
            video.resolution(),
            video.pacing(),
        )),
        InputFormat::Ivf => Box::new(IvfSource::new(reader, video.pacing())),
    };
    Ok(source)
}

fn open_audio_source(config: &PublishConfig) -> anyhow::Result<Option<Box<dyn FrameSource>>> {
    let Some(input) = &config.audio.input else {
        return Ok(None);
    };
    let reader = open_input(input, "audio")?;
    tracing::info!("Reading Ogg/Opus audio from {}", input);
    let source: Box<dyn FrameSource> = Box::new(OggSource::new(reader, config.audio.realtime));
    Ok(Some(source))
}

/// Resolve with the terminal state once the peer connection fails or closes
async fn wait_for_peer_failure(
    state: &mut tokio::sync::watch::Receiver<ConnectionState>,
) -> ConnectionState {
    loop {
        let current = *state.borrow_and_update();
        if matches!(current, ConnectionState::Failed | ConnectionState::Closed) {
            return current;
        }
        if state.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

/// Resolve when a line is entered on stdin; never resolves when disabled
async fn wait_for_enter(enabled: bool) {
    if !enabled {
        return std::future::pending().await;
    }
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    match lines.next_line().await {
        Ok(Some(_)) => {}
        // Closed stdin is not a request to stop
        _ => std::future::pending().await,
    }
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "whip_ingest=error,whip_publish=error,webrtc=error",
        LogLevel::Warn => "whip_ingest=warn,whip_publish=warn,webrtc=warn",
        LogLevel::Info => "whip_ingest=info,whip_publish=info,webrtc=warn",
        LogLevel::Verbose => "whip_ingest=debug,whip_publish=debug,webrtc=warn",
        LogLevel::Debug => "whip_ingest=debug,whip_publish=debug,webrtc=info",
        LogLevel::Trace => "whip_ingest=trace,whip_publish=trace,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
