use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use meetscribe::settings::AppSettings;
use meetscribe::streaming::ServerEvent;
use meetscribe::{Session, SessionState};

#[derive(Parser)]
#[command(
    name = "meetscribe",
    version,
    about = "Streaming client for live meeting transcription"
)]
struct Cli {
    /// Verbose (debug-level) logging
    #[arg(short, long)]
    debug: bool,

    /// Override the backend WebSocket endpoint
    #[arg(long)]
    server: Option<String>,

    /// Override the backend HTTP API base URL
    #[arg(long)]
    api: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record the microphone and stream it live until Ctrl-C
    Stream,
    /// Upload files for transcription and wait for their status
    Upload {
        /// Audio files to upload
        files: Vec<PathBuf>,
    },
    /// List available transcription models
    Models {
        /// Select this model as the active one
        #[arg(long)]
        select: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (for development convenience)
    // Silently ignore if not found - production uses system env vars
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_logging(cli.debug);

    let mut settings = meetscribe::settings::load_settings();
    settings.apply_env_overrides();
    if let Some(server) = cli.server {
        settings.server_url = server;
    }
    if let Some(api) = cli.api {
        settings.api_base_url = api;
    }

    match cli.command {
        Command::Models { select } => run_models(&settings, select).await,
        Command::Upload { files } => run_upload(&settings, files).await,
        Command::Stream => run_stream(&settings).await,
    }
}

fn init_logging(debug: bool) {
    let level = if debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}",
                chrono::Local::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        })
        .filter(None, level)
        .init();
}

async fn run_models(settings: &AppSettings, select: Option<String>) -> anyhow::Result<()> {
    if let Some(key) = select {
        meetscribe::models::select_model(&settings.api_base_url, &key)
            .await
            .with_context(|| format!("selecting model '{}'", key))?;
        println!("Selected model: {}", key);
        return Ok(());
    }

    let catalog = meetscribe::models::fetch_models(&settings.api_base_url)
        .await
        .context("fetching model catalog")?;

    for (key, info) in catalog.models_sorted() {
        let marker = if *key == catalog.current_model {
            "*"
        } else {
            " "
        };
        println!(
            "{} {:<8} {:<8} {:<8} {}",
            marker, key, info.name, info.size, info.description
        );
    }

    Ok(())
}

async fn run_upload(settings: &AppSettings, files: Vec<PathBuf>) -> anyhow::Result<()> {
    anyhow::ensure!(!files.is_empty(), "no files given");

    let session = Session::connect(settings)
        .await
        .context("connecting to backend")?;

    for path in &files {
        match session.upload(path).await {
            Ok(id) => println!("{}  {}", id, path.display()),
            Err(e) => eprintln!("upload failed for {}: {}", path.display(), e),
        }
    }

    // Wait (bounded) for the backend to report terminal statuses
    let deadline = tokio::time::Instant::now() + Duration::from_secs(600);
    while !session.uploads_settled().await {
        if tokio::time::Instant::now() >= deadline {
            eprintln!("timed out waiting for file status");
            break;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    for file in session.uploaded_files().await {
        println!(
            "{}  {:<24} {:>7.1}s  {:?}",
            file.id, file.name, file.duration, file.status
        );
    }

    session.shutdown().await;
    Ok(())
}

async fn run_stream(settings: &AppSettings) -> anyhow::Result<()> {
    let mut session = Session::connect(settings)
        .await
        .context("connecting to backend")?;

    let mut inbound = session
        .take_inbound()
        .context("inbound events already taken")?;
    let mut state_rx = session.state();

    session
        .start_recording()
        .await
        .map_err(|e| anyhow::anyhow!("controller unavailable: {}", e))?;
    println!("Recording... press Ctrl-C to stop.");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Stopping...");
                let _ = session.stop_recording().await;
                break;
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = state_rx.borrow().clone();
                match &state {
                    SessionState::Recording { dropped_chunks, notice: Some(notice), .. } => {
                        eprintln!("! {} ({} chunks lost)", notice, dropped_chunks);
                    }
                    SessionState::Error { message } => {
                        eprintln!("error: {}", message);
                    }
                    _ => {}
                }
            }
            event = inbound.recv() => {
                match event {
                    Some(ServerEvent::Transcript(t)) => {
                        println!("[{}] {}: {}", t.timestamp, t.participant, t.content);
                    }
                    Some(ServerEvent::Summary(s)) => {
                        println!("-- summary --\n{}", s.content);
                    }
                    Some(ServerEvent::Participants(participants)) => {
                        let names: Vec<&str> =
                            participants.iter().map(|p| p.name.as_str()).collect();
                        println!("participants: {}", names.join(", "));
                    }
                    Some(ServerEvent::Error { message }) => {
                        eprintln!("backend error: {}", message);
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        }
    }

    // Let the controller wind down so the device is released before exit
    let wound_down = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if matches!(
                *state_rx.borrow(),
                SessionState::Idle | SessionState::Error { .. }
            ) {
                break;
            }
            if state_rx.changed().await.is_err() {
                break;
            }
        }
    })
    .await;

    if wound_down.is_err() {
        log::warn!("Controller did not reach idle before shutdown");
    }

    let summary = session.metrics_summary().await;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    session.shutdown().await;
    Ok(())
}
