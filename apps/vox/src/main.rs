use clap::{Args, Parser};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use vox_client_core::channel::{CallHandle, ChannelError, SignalingClient};
use vox_client_core::config::Config;
use vox_client_core::observer::CallObserver;
use vox_client_core::telemetry::logging::{self as logctl, LogConfig, LogLevel};
use vox_client_core::transport::webrtc::WebRtcTransportFactory;
use vox_client_core::transport::{MediaTrack, RemoteStream, TransportError};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logctl::init(&log_config).map_err(|err| CliError::Logging(err.to_string()))?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let mut config = Config::from_env();
    if let Some(url) = cli.url {
        config.signaling_url = url;
    }
    if let Some(client_id) = cli.client_id {
        config.client_id = client_id;
    }
    info!(
        client_id = %config.client_id,
        url = %config.signaling_url,
        stun_servers = config.stun_urls.len(),
        "starting vox"
    );

    let factory = Arc::new(WebRtcTransportFactory::new(config.webrtc())?);
    let (handle, commands) = CallHandle::channel();
    let observer = Arc::new(ConsoleObserver {
        handle: handle.clone(),
        auto_call: cli.auto_call,
    });

    let tracks = local_tracks(cli.audio, cli.video);
    if !tracks.is_empty() {
        handle.media_ready(tracks);
    }

    let interrupt = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted; hanging up");
            interrupt.disconnect();
        }
    });

    SignalingClient::new(config, factory, observer)
        .run(commands)
        .await?;
    info!("signaling client stopped");
    Ok(())
}

#[derive(Parser, Debug)]
#[command(
    name = "vox",
    about = "Headless WebRTC call client driven by a signaling server",
    author,
    version
)]
struct Cli {
    #[arg(long, help = "Signaling WebSocket URL (overrides VOX_SIGNALING_URL)")]
    url: Option<String>,

    #[arg(long, help = "Local identity (overrides VOX_CLIENT_ID)")]
    client_id: Option<String>,

    #[arg(long, help = "Send an offer as soon as a peer is assigned")]
    auto_call: bool,

    #[arg(long, help = "Offer a local audio track")]
    audio: bool,

    #[arg(long, help = "Offer a local video track")]
    video: bool,

    #[command(flatten)]
    logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "VOX_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "VOX_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,

    #[arg(
        long = "log-filter",
        value_name = "DIRECTIVES",
        env = "VOX_LOG_FILTER",
        help = "Raw tracing filter directives; replaces --log-level"
    )]
    filter: Option<String>,

    #[arg(
        long = "trace-deps",
        env = "VOX_TRACE_DEPS",
        help = "Let WebRTC and WebSocket internals log below info"
    )]
    trace_deps: bool,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
            filter: self.filter.clone(),
            trace_dependencies: self.trace_deps,
        }
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Channel(#[from] ChannelError),
    #[error("transport setup failed: {0}")]
    Transport(#[from] TransportError),
    #[error("logging initialization failed: {0}")]
    Logging(String),
}

fn local_tracks(audio: bool, video: bool) -> Vec<MediaTrack> {
    let mut tracks = Vec::new();
    if audio {
        tracks.push(MediaTrack::audio("vox-audio", "vox"));
    }
    if video {
        tracks.push(MediaTrack::video("vox-video", "vox"));
    }
    tracks
}

/// Logs call milestones and optionally places the call on assignment.
struct ConsoleObserver {
    handle: CallHandle,
    auto_call: bool,
}

impl CallObserver for ConsoleObserver {
    fn on_assignment_ready(&self, remote: &str) {
        info!(remote, "peer assigned");
        if !self.auto_call {
            return;
        }
        let handle = self.handle.clone();
        tokio::spawn(async move {
            if let Err(err) = handle.start_call().await {
                warn!(error = %err, "auto call failed");
            }
        });
    }

    fn on_remote_stream(&self, stream: RemoteStream, remote: &str) {
        info!(remote, track = %stream.track_id, kind = ?stream.kind, "receiving remote media");
        let Some(track) = stream.track else {
            return;
        };
        let remote = remote.to_string();
        tokio::spawn(async move {
            let mut packets: u64 = 0;
            while track.read_rtp().await.is_ok() {
                packets += 1;
            }
            debug!(remote = %remote, packets, "remote track ended");
        });
    }

    fn on_fatal_error(&self, reason: &str) {
        error!(reason, "call error");
    }
}
