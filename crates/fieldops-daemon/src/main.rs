use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use fieldops_coordination::{
    CoordinationConfig, EscalationHandle, EventCoordinator, MemoryStore, SharedSink,
    SharedStateStore, TracingSink,
};
use fieldops_daemon::{read_events, WebhookSink};
use tracing::{info, warn};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file (FIELDOPS_* environment variables still apply)
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSON Lines event feed; `-` reads stdin
    #[arg(long, default_value = "-")]
    events: String,

    /// Divide escalation waits by this factor (overrides FIELDOPS_TIME_SCALE)
    #[arg(long)]
    time_scale: Option<f64>,

    /// POST notifications to this URL instead of logging them
    #[arg(long)]
    webhook_url: Option<String>,

    /// Webhook request timeout in seconds
    #[arg(long, default_value_t = 10)]
    webhook_timeout_secs: u64,

    /// RocksDB directory for strikes, results and escalations
    #[arg(long)]
    state_path: Option<PathBuf>,

    /// Exit after routing instead of waiting for escalations to finish
    #[arg(long, default_value_t = false)]
    no_wait: bool,
}

fn open_store(state_path: Option<&PathBuf>) -> Result<SharedStateStore> {
    match state_path {
        #[cfg(feature = "heavy-state")]
        Some(path) => {
            let store = fieldops_coordination::RocksStore::open(path)
                .with_context(|| format!("Failed to open state store at {}", path.display()))?;
            info!(path = %path.display(), "Using RocksDB state store");
            Ok(store.shared())
        }
        #[cfg(not(feature = "heavy-state"))]
        Some(path) => {
            warn!(
                path = %path.display(),
                "Built without heavy-state, falling back to in-memory store"
            );
            Ok(MemoryStore::new().shared())
        }
        None => Ok(MemoryStore::new().shared()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &args.config {
        Some(path) => CoordinationConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => CoordinationConfig::from_env().context("Invalid environment configuration")?,
    };
    if let Some(scale) = args.time_scale {
        config.simulation_time_scale = scale;
        config.validate().context("Invalid --time-scale")?;
    }

    let sink: SharedSink = match &args.webhook_url {
        Some(url) => Arc::new(WebhookSink::new(
            url.clone(),
            Duration::from_secs(args.webhook_timeout_secs),
        )?),
        None => Arc::new(TracingSink),
    };
    let store = open_store(args.state_path.as_ref())?;
    let coordinator = EventCoordinator::new(&config, sink, store)?;

    let mut pending: Vec<EscalationHandle> = coordinator.recover_escalations().await?;

    let events = if args.events == "-" {
        read_events(std::io::stdin().lock())?
    } else {
        let file = std::fs::File::open(&args.events)
            .with_context(|| format!("Failed to open event feed {}", args.events))?;
        read_events(BufReader::new(file))?
    };
    info!(
        events = events.len(),
        handlers = coordinator.registry().len(),
        time_scale = config.simulation_time_scale,
        "Field-service coordinator starting"
    );

    for event in &events {
        match coordinator.route_event(event).await {
            Ok(mut result) => {
                println!("{}", serde_json::to_string(&result)?);
                pending.append(&mut result.escalations);
            }
            Err(e) => warn!(event_id = %event.id, error = %e, "Event rejected"),
        }
    }

    if !args.no_wait && !pending.is_empty() {
        info!(escalations = pending.len(), "Waiting for escalations to finish");
        for handle in &pending {
            let state = handle.wait().await;
            info!(
                escalation_id = %handle.id(),
                subject = %handle.subject_id(),
                %state,
                fired = handle.fired(),
                "Escalation settled"
            );
        }
    }

    info!("{}", coordinator.get_metrics().summary());
    let (unreconciled, dropped) = coordinator.drain_reconciliation();
    if dropped > 0 {
        warn!(dropped, "Reconciliation items were dropped before shutdown");
    }
    for item in unreconciled {
        warn!(
            kind = %item.kind,
            subject = %item.subject_id,
            reference = %item.reference,
            "Needs manual reconciliation"
        );
    }
    Ok(())
}
