//! Web-of-Trust engine daemon.
//!
//! Runs the trust/score engine against a local database. The anonymizing
//! transport and the identity-file codec are provided by the embedding
//! application; started standalone, the daemon runs offline: all graph
//! operations work, downloads are disabled.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};

use wot_core::WotConfig;
use wot_daemon::{OfflineCodec, OfflineNetworkClient, WotEngine};

/// Web-of-Trust engine daemon.
#[derive(Parser, Debug)]
#[command(name = "wot-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the data directory.
    #[arg(short, long, env = "WOT_DATA_DIR", default_value = "/var/lib/wot")]
    data_dir: PathBuf,

    /// Keep everything in memory (testing).
    #[arg(long, env = "WOT_IN_MEMORY", default_value = "false")]
    in_memory: bool,

    /// Use the pre-incremental reference scoring path (A/B validation).
    #[arg(long, env = "WOT_LEGACY_SCORING", default_value = "false")]
    legacy_scoring: bool,

    /// Concurrent slow-downloader requests.
    #[arg(long, env = "WOT_SLOW_DOWNLOAD_SLOTS", default_value = "4")]
    slow_download_slots: usize,

    /// Days between full score verifications.
    #[arg(long, env = "WOT_VERIFICATION_INTERVAL_DAYS", default_value = "28")]
    verification_interval_days: u64,

    /// Days between store defragmentations.
    #[arg(long, env = "WOT_DEFRAG_INTERVAL_DAYS", default_value = "7")]
    defrag_interval_days: u64,

    /// Run the full score verification immediately and exit.
    #[arg(long, default_value = "false")]
    verify: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "WOT_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log format (plain, json).
    #[arg(long, env = "WOT_LOG_FORMAT", default_value = "plain")]
    log_format: String,
}

fn setup_logging(log_level: &str, log_format: &str) -> Result<()> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("sled=warn".parse()?);

    match log_format.to_lowercase().as_str() {
        "json" => {
            let subscriber = fmt::Subscriber::builder()
                .with_env_filter(filter)
                .json()
                .flatten_event(true)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .context("failed to set subscriber")?;
        }
        _ => {
            let subscriber = fmt::Subscriber::builder()
                .with_env_filter(filter)
                .with_target(true)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .context("failed to set subscriber")?;
        }
    }
    Ok(())
}

fn build_config(args: &Args) -> WotConfig {
    let mut builder = WotConfig::builder()
        .with_slow_download_slots(args.slow_download_slots)
        .with_score_verification_interval(Duration::from_secs(
            args.verification_interval_days * 24 * 3600,
        ))
        .with_defrag_interval(Duration::from_secs(args.defrag_interval_days * 24 * 3600));
    if args.in_memory {
        builder = builder.with_in_memory_storage();
    } else {
        builder = builder.with_data_dir(&args.data_dir);
    }
    if args.legacy_scoring {
        builder = builder.with_legacy_reference_scoring();
    }
    builder.build()
}

fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level, &args.log_format)?;

    let config = build_config(&args);
    config.validate().context("invalid configuration")?;

    warn!("no transport configured, running offline: downloads are disabled");
    let engine = WotEngine::start(
        config,
        Arc::new(OfflineNetworkClient),
        Arc::new(OfflineCodec),
    )
    .context("engine failed to start")?;

    let stats = engine.stats();
    info!(
        identities = stats.identities,
        own_identities = stats.own_identities,
        trusts = stats.trusts,
        scores = stats.scores,
        hints = stats.hints,
        "database loaded"
    );

    if args.verify {
        let corrections = engine
            .verify_scores_now()
            .context("score verification failed")?;
        info!(corrections, "score verification finished");
        engine.shutdown();
        return Ok(());
    }

    info!("running; close stdin or press enter to shut down");
    let mut line = String::new();
    let _ = std::io::stdin().lock().read_line(&mut line);

    engine.shutdown();
    Ok(())
}
