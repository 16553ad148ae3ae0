use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use meshroom::media::{MediaCapture, MediaSourceManager, SampleTrackCapture};
use meshroom::{ConferenceConfig, Intent, Room, RoomHandle};

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// Join a mesh conference room from the terminal
#[derive(Parser, Debug)]
#[command(name = "meshroom")]
#[command(version, about, long_about = None)]
struct CliArgs {
    /// Room to join
    #[arg(short, long, env = "MESHROOM_ROOM")]
    room: String,

    /// Display name shown to other participants
    #[arg(short, long)]
    name: Option<String>,

    /// Relay base URL (ws:// or wss://)
    #[arg(long, value_name = "URL")]
    signaling_url: Option<String>,

    /// Join with the microphone muted
    #[arg(long)]
    muted: bool,

    /// Join with the camera off
    #[arg(long)]
    camera_off: bool,

    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level);

    let mut config = ConferenceConfig::from_env()?;
    if let Some(url) = args.signaling_url {
        config.signaling_url = url;
    }
    if let Some(name) = args.name {
        config.display_name = name;
    }
    config.validate()?;

    // Preview: acquire devices and apply the pre-join toggles.
    let capture: Arc<dyn MediaCapture> = Arc::new(SampleTrackCapture::default());
    let media = match MediaSourceManager::open(Arc::clone(&capture)).await {
        Ok(media) => media,
        Err(e) => {
            warn!("Joining receive-only: {}", e);
            MediaSourceManager::receive_only(capture)
        }
    };
    if args.muted {
        if let Err(e) = media.toggle_mic() {
            warn!("Cannot mute: {}", e);
        }
    }
    if args.camera_off {
        if let Err(e) = media.toggle_camera() {
            warn!("Cannot turn camera off: {}", e);
        }
    }

    let (room, handle) = Room::join(&config, &args.room, media).await?;
    let room_task = tokio::spawn(room.run());

    tokio::spawn(log_snapshots(handle.clone()));
    tokio::spawn(log_notices(handle.clone()));
    tokio::spawn(read_intents(handle.clone()));

    let leave_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, leaving room");
            let _ = leave_handle.leave().await;
        }
    });

    room_task.await??;
    info!("Left room {}", args.room);
    Ok(())
}

fn init_logging(level: LogLevel) {
    let filter = match level {
        LogLevel::Error => "meshroom=error,webrtc=error",
        LogLevel::Warn => "meshroom=warn,webrtc=warn",
        LogLevel::Info => "meshroom=info,webrtc=warn",
        LogLevel::Debug => "meshroom=debug,webrtc=info",
        LogLevel::Trace => "meshroom=trace,webrtc=debug",
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

/// Map a console command to an intent.
fn parse_intent(line: &str) -> Option<Intent> {
    let mut words = line.split_whitespace();
    let intent = match words.next()? {
        "mic" | "mute" => Intent::ToggleMic,
        "cam" | "camera" => Intent::ToggleCamera,
        "share" => Intent::ToggleScreenShare,
        "focus" => Intent::FocusPeer(words.next()?.to_string()),
        "unfocus" => Intent::ClearFocus,
        "leave" | "quit" => Intent::Leave,
        _ => return None,
    };
    Some(intent)
}

async fn read_intents(handle: RoomHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let Some(intent) = parse_intent(&line) else {
            if !line.trim().is_empty() {
                warn!("Unknown command {:?} (mic, cam, share, focus <id>, unfocus, leave)", line.trim());
            }
            continue;
        };
        if handle.send(intent).await.is_err() {
            break;
        }
    }
}

async fn log_snapshots(handle: RoomHandle) {
    let mut snapshots = handle.subscribe();
    while snapshots.changed().await.is_ok() {
        let snapshot = snapshots.borrow_and_update().clone();
        info!(
            phase = ?snapshot.phase,
            peers = snapshot.peers.len(),
            grid = %format!("{}x{}", snapshot.view.cols, snapshot.view.rows),
            focused = ?snapshot.view.focused_peer_id,
            overflow = snapshot.view.overflow_count,
            mic = snapshot.media.mic_enabled,
            camera = snapshot.media.camera_enabled,
            source = ?snapshot.local_source,
            "Room updated"
        );
    }
}

async fn log_notices(handle: RoomHandle) {
    let mut notices = handle.notices();
    loop {
        match notices.recv().await {
            Ok(notice) => warn!(kind = ?notice.kind, peer_id = ?notice.peer_id, "{}", notice.message),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Notices dropped"),
            Err(RecvError::Closed) => break,
        }
    }
}
