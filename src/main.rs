//! pulsed - on-device metrics aggregation daemon
//!
//! # Usage
//!
//! ```bash
//! # Replay newline-delimited JSON events from stdin
//! python atom_replay.py | pulsed --config metrics.json --stdin
//!
//! # Write the final report somewhere other than stdout
//! pulsed --config metrics.json --stdin --report-out report.jsonl
//! ```
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Logging level (default: info)

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pulsed::builder::{build, BuildParams};
use pulsed::config::{AggregationConfig, ConfigKey};
use pulsed::external::{EmptyPackageResolver, InertAlarmMonitor, LogSubscriberSink, NoPullers};
use pulsed::pipeline::{run_loop, StdinEventSource};
use pulsed::storage::{load_active_configs, save_active_configs, ActiveConfigsBlob};
use pulsed::{DumpLatency, DumpReportReason};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "pulsed")]
#[command(about = "On-device metrics aggregation daemon")]
#[command(version)]
struct CliArgs {
    /// Path to the metrics configuration (JSON or TOML)
    #[arg(long, env = "PULSED_CONFIG")]
    config: PathBuf,

    /// Read JSON events from stdin (one per line)
    #[arg(long)]
    stdin: bool,

    /// Write the final dump report here instead of stdout
    #[arg(long, value_name = "PATH")]
    report_out: Option<PathBuf>,

    /// Directory holding persisted daemon state
    #[arg(long, default_value = ".", value_name = "DIR")]
    state_dir: PathBuf,

    /// Bucket-clock origin in elapsed nanoseconds
    #[arg(long, default_value = "0")]
    time_base_ns: i64,

    /// Uid recorded as the config's installer
    #[arg(long, default_value = "0")]
    config_uid: i32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = CliArgs::parse();

    let config = AggregationConfig::load(&args.config)
        .with_context(|| format!("loading config from {}", args.config.display()))?;
    let config_key = ConfigKey::new(args.config_uid, config.id);

    let params = BuildParams {
        config_key,
        time_base_ns: args.time_base_ns,
        start_time_sec: chrono::Utc::now().timestamp(),
        resolver: Arc::new(EmptyPackageResolver),
        pullers: Arc::new(NoPullers),
        alarm_monitor: Arc::new(InertAlarmMonitor::default()),
        subscriber_sink: Arc::new(LogSubscriberSink),
    };
    let manager = build(&config, &params).context("installing config")?;
    info!(config = %config_key, metrics = manager.metric_count(), "pulsed starting");

    // Restore activations that survived the last shutdown.
    let blob_path = args.state_dir.join("active_configs.json");
    match load_active_configs(&blob_path) {
        Ok(blob) => {
            let now_ns = args.time_base_ns;
            for config_blob in &blob.configs {
                manager.load_active_blob(config_blob, now_ns);
            }
        }
        Err(e) => warn!(error = %e, "Could not load persisted activations"),
    }

    let manager = Arc::new(Mutex::new(manager));

    if !args.stdin {
        warn!("No event source selected (only --stdin is supported); exiting");
        return Ok(());
    }

    // Drive events until the source closes or we get a termination signal.
    let loop_manager = manager.clone();
    let pipeline = tokio::spawn(async move {
        run_loop(Box::new(StdinEventSource::new()), loop_manager).await
    });

    tokio::select! {
        result = pipeline => {
            match result {
                Ok(Ok(delivered)) => info!(delivered, "Event stream ended"),
                Ok(Err(e)) => warn!(error = %e, "Transport error"),
                Err(e) => warn!(error = %e, "Pipeline task failed"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Termination signal received");
        }
    }

    // Final report and activation persistence.
    let manager = manager
        .lock()
        .map_err(|_| anyhow::anyhow!("manager lock poisoned"))?;
    let dump_time_ns = manager.last_event_time_ns().max(args.time_base_ns);

    let report_result = match &args.report_out {
        Some(path) => {
            let mut file = std::fs::File::create(path)
                .with_context(|| format!("creating report file {}", path.display()))?;
            manager.on_dump_report(
                dump_time_ns,
                true,
                true,
                DumpLatency::NoTimeConstraints,
                DumpReportReason::TerminationSignal,
                &mut file,
            )
        }
        None => {
            let mut stdout = std::io::stdout();
            manager.on_dump_report(
                dump_time_ns,
                true,
                true,
                DumpLatency::NoTimeConstraints,
                DumpReportReason::TerminationSignal,
                &mut stdout,
            )
        }
    };
    if let Err(e) = report_result {
        warn!(error = %e, "Failed to write final report");
    }

    let blob = ActiveConfigsBlob {
        configs: vec![manager.collect_active_blob(dump_time_ns)],
    };
    if let Err(e) = save_active_configs(&blob_path, &blob) {
        warn!(error = %e, "Failed to persist activations");
    }

    info!("pulsed shut down");
    Ok(())
}
