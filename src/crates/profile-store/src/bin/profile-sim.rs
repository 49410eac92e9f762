//! Profile store simulator
//!
//! Runs several simulated server processes against one shared in-memory
//! store and walks through session handoff, crash recovery and messaging.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use profile_store::{
    Clock, ConstantName, Document, InMemoryBackend, KeyValueBackend, LastSaveReason,
    LocalNotifier, ProfileRuntime, ProfileStoreConfig, SessionMarker, SessionStart,
    StartSessionOptions,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "profile-sim")]
#[command(about = "Simulate processes competing for profile sessions", long_about = None)]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Override a timing constant, e.g. --set SESSION_STEAL=2
    #[arg(long = "set", value_name = "NAME=VALUE", global = true)]
    overrides: Vec<String>,

    /// Key to compete for
    #[arg(short, long, default_value = "player-1", global = true)]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process A holds the key; B times out, then steals it
    Handoff {
        /// Seconds B waits before giving up without stealing
        #[arg(long, default_value_t = 2)]
        wait: u64,
    },
    /// A process dies holding the key; another claims it once the lock is stale
    Crash,
    /// Queue messages for an offline key and process them in a session
    Messages {
        /// Number of messages to send
        #[arg(short, long, default_value_t = 3)]
        count: usize,
    },
}

/// Short timings so scenarios finish in seconds
fn simulation_config(overrides: &[String]) -> anyhow::Result<ProfileStoreConfig> {
    let mut config = ProfileStoreConfig::default()
        .with_auto_save_period(Duration::from_secs(2))
        .with_first_load_repeat(Duration::from_millis(500))
        .with_load_repeat_period(Duration::from_secs(1))
        .with_session_steal(Duration::from_secs(3))
        .with_assume_dead(Duration::from_secs(6))
        .with_start_session_timeout(Duration::from_secs(15));
    config.apply_env_overrides()?;

    for entry in overrides {
        let (name, value) = entry
            .split_once('=')
            .with_context(|| format!("override '{}' is not NAME=VALUE", entry))?;
        let name: ConstantName = name.parse()?;
        let value: f64 = value
            .parse()
            .with_context(|| format!("value of {} is not a number", name))?;
        config.set_constant(name, value)?;
    }
    config.validate()?;
    Ok(config)
}

struct Cluster {
    backend: Arc<InMemoryBackend>,
    notifier: Arc<LocalNotifier>,
    config: ProfileStoreConfig,
    clock: Clock,
}

impl Cluster {
    fn new(config: ProfileStoreConfig) -> Self {
        let clock = Clock::system();
        Self {
            backend: Arc::new(InMemoryBackend::with_clock(clock)),
            notifier: Arc::new(LocalNotifier::new()),
            config,
            clock,
        }
    }

    fn process(&self, name: &str) -> anyhow::Result<ProfileRuntime> {
        Ok(ProfileRuntime::builder()
            .owner_id("sim")
            .instance_id(name)
            .config(self.config.clone())
            .clock(self.clock)
            .backend(self.backend.clone())
            .notifier(self.notifier.clone())
            .build()?)
    }
}

fn template() -> serde_json::Value {
    json!({"coins": 0, "inventory": [], "gifts": 0})
}

async fn handoff(cluster: &Cluster, key: &str, wait: u64) -> anyhow::Result<()> {
    let a = cluster.process("A")?;
    let b = cluster.process("B")?;

    let Some(held) = a
        .store("players", template())
        .start_session(key, StartSessionOptions::new())
        .await?
        .profile()
    else {
        bail!("process A could not start a session");
    };
    held.on_last_save().connect(|reason: &LastSaveReason| {
        tracing::info!(?reason, "A: last save");
    });
    held.data()["coins"] = json!(50);
    tracing::info!(count = held.session_load_count(), "A: session started");

    let store_b = b.store("players", template());
    let attempt = store_b
        .start_session(
            key,
            StartSessionOptions::new().timeout(Duration::from_secs(wait)),
        )
        .await?;
    tracing::info!(started = attempt.is_started(), "B: polite attempt finished");

    let started = std::time::Instant::now();
    let Some(stolen) = store_b
        .start_session(key, StartSessionOptions::new().steal(true))
        .await?
        .profile()
    else {
        bail!("process B could not steal the session");
    };
    tracing::info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        count = stolen.session_load_count(),
        coins = %stolen.data()["coins"],
        "B: session stolen"
    );
    tracing::info!(state = %held.state(), "A: final state");

    a.close().await;
    b.close().await;
    Ok(())
}

async fn crash(cluster: &Cluster, key: &str) -> anyhow::Result<()> {
    // A process that claimed the key and then died: its lock is in the
    // document but its heartbeat never advances
    let now = cluster.clock.now();
    let mut document = Document::new(template(), now);
    document.metadata.active_session = Some(SessionMarker::new("sim", "crashed"));
    document.metadata.session_load_count = 1;
    let value = profile_store::document::encode(&document)?;
    let mut write = move |_: Option<&Value>| -> Option<Value> { Some(value.clone()) };
    cluster.backend.update(key, &mut write).await?;
    tracing::info!("Crashed process left its lock behind");

    let b = cluster.process("B")?;
    let started = std::time::Instant::now();
    let outcome = b
        .store("players", template())
        .start_session(key, StartSessionOptions::new())
        .await?;
    let Some(profile) = outcome.profile() else {
        bail!("B could not claim the stale lock");
    };
    tracing::info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        count = profile.session_load_count(),
        "B: claimed after the lock went stale"
    );

    b.close().await;
    Ok(())
}

async fn messages(cluster: &Cluster, key: &str, count: usize) -> anyhow::Result<()> {
    let sender = cluster.process("sender")?;
    let players = sender.store("players", template());
    for n in 0..count {
        players.message(key, json!({"gift": n})).await?;
    }
    tracing::info!(count, "Messages queued");

    let owner = cluster.process("owner")?;
    let SessionStart::Started(profile) = owner
        .store("players", template())
        .start_session(key, StartSessionOptions::new())
        .await?
    else {
        bail!("owner could not start a session");
    };

    let handled = Arc::new(AtomicI64::new(0));
    let counter = handled.clone();
    profile.message_handler(move |message, ack| {
        tracing::info!(%message, "Handling message");
        counter.fetch_add(1, Ordering::SeqCst);
        ack.processed();
    });
    profile.data()["gifts"] = json!(handled.load(Ordering::SeqCst));
    profile.save_now().await?;
    tracing::info!(
        gifts = %profile.data()["gifts"],
        remaining = profile.queued_messages().len(),
        "Messages processed"
    );

    owner.close().await;
    sender.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(rust_log).init();

    let cli = Cli::parse();
    let cluster = Cluster::new(simulation_config(&cli.overrides)?);

    match cli.command {
        Commands::Handoff { wait } => handoff(&cluster, &cli.key, wait).await,
        Commands::Crash => crash(&cluster, &cli.key).await,
        Commands::Messages { count } => messages(&cluster, &cli.key, count).await,
    }
}
