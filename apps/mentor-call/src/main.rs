use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser};
use mentor_call_core::media::{DeviceBehavior, MediaKind, SyntheticDevices};
use mentor_call_core::peer::{RtcPeerFactory, TracingSurfaces};
use mentor_call_core::session::{HeadlessDisplay, format_duration};
use mentor_call_core::signaling::{Credentials, WsConnector};
use mentor_call_core::telemetry::{self, LogConfig, LogLevel};
use mentor_call_core::{CallConfig, CallHandle, CallParams, CallStatus, SessionDeps};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "mentor-call",
    about = "Join a two-party mentorship call from the terminal",
    author,
    version
)]
struct Cli {
    /// Room to join; both participants use the same id.
    #[arg(long)]
    room: String,

    /// User id announced in `join-room`.
    #[arg(long)]
    user: String,

    /// Name shown to the other participant.
    #[arg(long, env = "MENTOR_CALL_DISPLAY_NAME")]
    name: Option<String>,

    #[arg(long, env = "MENTOR_CALL_SIGNALING_URL")]
    signaling_url: Option<String>,

    #[arg(long, env = "MENTOR_CALL_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Join with audio only.
    #[arg(long)]
    no_video: bool,

    /// Simulate a denied camera permission.
    #[arg(long)]
    deny_video: bool,

    /// Simulate a denied microphone permission.
    #[arg(long)]
    deny_audio: bool,

    #[command(flatten)]
    logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(long, value_enum, env = "MENTOR_CALL_LOG_LEVEL", default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    #[arg(long, env = "MENTOR_CALL_LOG_FILE")]
    log_file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.log_level,
            file: self.log_file.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    telemetry::init(&cli.logging.to_config()).context("failed to initialise logging")?;

    let mut config = CallConfig::from_env().context("invalid call configuration")?;
    if let Some(url) = cli.signaling_url.clone() {
        config.signaling_url = url;
    }
    if cli.token.is_some() {
        config.credentials = Credentials::from_token(cli.token.clone());
    }
    if cli.name.is_some() {
        config.display_name = cli.name.clone();
    }
    if cli.no_video {
        config.constraints = config.constraints.without(MediaKind::Video);
    }

    let mut devices = SyntheticDevices::new().with_sample_pump();
    if cli.deny_video {
        devices = devices.with(MediaKind::Video, DeviceBehavior::Deny);
    }
    if cli.deny_audio {
        devices = devices.with(MediaKind::Audio, DeviceBehavior::Deny);
    }

    let deps = SessionDeps {
        connector: Arc::new(WsConnector),
        devices: Arc::new(devices),
        peers: Arc::new(RtcPeerFactory::new().context("failed to set up webrtc")?),
        surfaces: Arc::new(TracingSurfaces),
        display: Arc::new(HeadlessDisplay::new()),
    };
    info!(room_id = %cli.room, user_id = %cli.user, signaling_url = %config.signaling_url, "starting call");
    let call = CallHandle::spawn(
        CallParams {
            room_id: cli.room.clone(),
            user_id: cli.user.clone(),
            config,
        },
        deps,
    );
    call.join().await.context("failed to join call")?;
    println!("commands: m = mic, c = camera, f = fullscreen, r = retry media, q = leave");

    let mut updates = call.subscribe();
    let mut last_status = call.status();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(Duration::from_secs(30));

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                if snapshot.status != last_status {
                    println!("status: {}", snapshot.status);
                    if let CallStatus::PermissionError(err) = &snapshot.status {
                        println!("recovery: {:?}", err.recovery_actions());
                    }
                    last_status = snapshot.status.clone();
                }
                if snapshot.torn_down {
                    break;
                }
            }
            line = stdin.next_line() => {
                let Ok(Some(line)) = line else {
                    continue;
                };
                match line.trim() {
                    "m" => println!("mic enabled: {:?}", call.toggle_mic().await?),
                    "c" => println!("camera enabled: {:?}", call.toggle_camera().await?),
                    "f" => println!("fullscreen: {}", call.toggle_fullscreen().await?),
                    "r" => {
                        if let Err(err) = call.retry_media().await {
                            warn!(error = %err, "retry not possible");
                        }
                    }
                    "q" => break,
                    "" => {}
                    other => println!("unknown command {other:?}"),
                }
            }
            _ = ticker.tick() => {
                if call.status().is_in_call() {
                    println!("call time {}", format_duration(call.call_duration()));
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    call.leave().await?;
    info!("call ended");
    Ok(())
}
