//! lockstep - reaction/source sync engine CLI
//!
//! Subcommands:
//! - `lockstep demo` - Run the engine against simulated players and an
//!   in-process session store, printing a status line every second
//! - `lockstep status <session>` - Fetch a session from the configured API
//! - `lockstep share <session>` - Generate a share link for a session
//! - `lockstep config` - Print the effective configuration and its sources

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lockconf::LockConfig;
use lockproto::{CreateSessionRequest, SessionId, SourceType, Video};
use lockstep::offset::Lead;
use lockstep::{
    telemetry, HttpSessionApi, InMemorySessionApi, SessionApi, SimulatedResolver, Stream,
    SyncEngine, SyncSnapshot,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "lockstep")]
#[command(about = "Watch a reaction video and its source in lockstep")]
#[command(version)]
struct Cli {
    /// Config file to use instead of ./lockstep.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play a simulated session pair and keep it in sync
    Demo {
        /// Seconds the source is ahead of the reaction (negative: behind)
        #[arg(short, long, default_value = "-5", allow_hyphen_values = true)]
        offset: f64,

        /// How long to run, in seconds
        #[arg(short, long, default_value = "20")]
        seconds: u64,

        /// Pin this reaction timestamp instead of running a countdown
        #[arg(short, long)]
        pin: Option<f64>,

        /// Stall the source for this many milliseconds after two seconds
        #[arg(long)]
        stall_ms: Option<u64>,

        /// Shared playback rate
        #[arg(short, long, default_value = "1.0")]
        rate: f64,
    },

    /// Fetch a session from the sync API
    Status {
        /// Session id
        session: String,
    },

    /// Generate a share link for a session
    Share {
        /// Session id
        session: String,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, sources) = LockConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::Config => {
            print!("{}", config.to_toml());
            println!();
            for file in &sources.files {
                println!("# loaded: {}", file.display());
            }
            for var in &sources.env_overrides {
                println!("# env override: {var}");
            }
        }
        Commands::Status { session } => {
            telemetry::init(&config.telemetry)?;
            let api = HttpSessionApi::from_config(&config.api)?;
            let session = api.get_session(&SessionId::from(session)).await?;
            println!("{}", serde_json::to_string_pretty(&session)?);
        }
        Commands::Share { session } => {
            telemetry::init(&config.telemetry)?;
            let api = HttpSessionApi::from_config(&config.api)?;
            let link = api.generate_share_link(&SessionId::from(session)).await?;
            println!("{link}");
        }
        Commands::Demo {
            offset,
            seconds,
            pin,
            stall_ms,
            rate,
        } => {
            telemetry::init(&config.telemetry)?;
            run_demo(config, offset, seconds, pin, stall_ms, rate).await?;
        }
    }

    Ok(())
}

async fn run_demo(
    config: LockConfig,
    offset: f64,
    seconds: u64,
    pin: Option<f64>,
    stall_ms: Option<u64>,
    rate: f64,
) -> Result<()> {
    let store = Arc::new(InMemorySessionApi::new());
    let reaction = store.register_video(
        Video::new("file:///media/reaction.mp4", SourceType::Uploaded)
            .with_title("Reaction")
            .with_duration(600.0),
    );
    let source = store.register_video(
        Video::new("https://www.youtube.com/watch?v=dQw4w9WgXcQ", SourceType::Youtube)
            .with_title("Source")
            .with_duration(212.0),
    );
    let created = store
        .create_session(&CreateSessionRequest {
            name: Some("demo".to_string()),
            reaction_video_id: reaction,
            external_video_id: source,
            time_offset: Some(offset),
            playback_speed: Some(rate),
            ..Default::default()
        })
        .await?;
    info!(session = %created.id, offset = %Lead::describe(offset), "demo session created");

    let resolver = Arc::new(SimulatedResolver::new());
    let api: Arc<dyn SessionApi> = store.clone();
    let engine = SyncEngine::spawn(config.sync.clone(), api, resolver.clone());
    engine.load(created.id.clone()).await?;

    // Let the embedded player report ready before syncing.
    wait_until(&engine, Duration::from_secs(5), |s| s.reaction_ready && s.source_ready)
        .await
        .context("players never became ready")?;

    match pin {
        Some(timestamp) => {
            engine.pin_timestamp(timestamp).await?;
            engine.play().await?;
        }
        None => engine.start_countdown().await?,
    }

    if let Some(ms) = stall_ms {
        let control = resolver.control(Stream::Source);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            if let Some(control) = control {
                info!(ms, "stalling source");
                control.stall_for(Duration::from_millis(ms));
            }
        });
    }

    let mut interval = tokio::time::interval(Duration::from_secs(1));
    for _ in 0..seconds {
        interval.tick().await;
        println!("{}", status_line(&engine.snapshot()));
    }

    engine.pause().await?;
    let stored = store.session(&created.id);
    if let Some(stored) = stored {
        println!(
            "server: {} reaction={:.2} source={:.2} reports={}",
            stored.sync_state,
            stored.reaction_position,
            stored.external_position,
            store.call_count("report_positions", created.id.as_str()),
        );
    }
    engine.shutdown().await;
    Ok(())
}

async fn wait_until(
    engine: &lockstep::EngineHandle,
    limit: Duration,
    ready: impl Fn(&SyncSnapshot) -> bool,
) -> Result<()> {
    let mut rx = engine.subscribe();
    tokio::time::timeout(limit, async {
        loop {
            if ready(&rx.borrow_and_update()) {
                return Ok::<(), anyhow::Error>(());
            }
            rx.changed().await.context("engine stopped")?;
        }
    })
    .await
    .context("timed out")?
}

fn status_line(s: &SyncSnapshot) -> String {
    let countdown = s
        .countdown
        .map(|n| format!(" countdown={n}"))
        .unwrap_or_default();
    let drift = s
        .drift
        .map(|d| format!("{d:+.3}"))
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{:<14} {} reaction={:>7.2} source={:>7.2} drift={} corrections={} reports={}{}",
        s.sync_state.as_str(),
        if s.is_playing { "playing" } else { "paused " },
        s.reaction_position,
        s.source_position,
        drift,
        s.corrections,
        s.reports_sent,
        countdown,
    )
}
