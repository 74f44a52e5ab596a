//! edgebot - Cross-Market Mispricing Detector & Trader
//! Mission: Capture constraint violations across the open-market universe

use anyhow::{Context, Result};
use clap::Parser;
use edgebot::{
    alerts::AlertSink,
    config::{Config, Credentials},
    db::Db,
    detector,
    exchange::KalshiClient,
    executor::Executor,
    ingestion,
    market_cache::MarketCache,
    orchestrator::Orchestrator,
    portfolio::Portfolio,
    relationship::{oracle::InferenceOracle, RelationshipMapper},
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "edgebot", about = "Cross-market mispricing engine")]
struct Args {
    /// Path to the YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: String,

    /// Force dry-run regardless of config
    #[arg(long)]
    dry_run: bool,

    /// Run one ingestion + detection cycle and exit (no orders placed)
    #[arg(long)]
    scan_once: bool,
}

fn init_tracing(level: &str, log_file: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_lowercase()));

    match log_file {
        Some(path) => {
            if let Some(parent) = std::path::Path::new(path).parent() {
                std::fs::create_dir_all(parent).ok();
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)?;
    if args.dry_run {
        config.trading.dry_run = true;
    }
    init_tracing(&config.logging.level, config.logging.file.as_deref())?;

    // Missing credentials are fatal: log, notify, exit non-zero
    let credentials = match Credentials::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Startup failed: {:#}", e);
            let sink = AlertSink::new(
                reqwest::Client::new(),
                std::env::var("DISCORD_WEBHOOK_URL").ok(),
            );
            sink.error("Startup failed", &format!("{:#}", e)).await;
            std::process::exit(1);
        }
    };

    let db = Db::open(&credentials.database_path)?;
    let client = Arc::new(KalshiClient::new(
        &credentials.api_key_id,
        &credentials.private_key_pem,
        &credentials.base_url,
    )?);

    let http = reqwest::Client::new();
    let alerts = Arc::new(AlertSink::new(http.clone(), credentials.webhook_url.clone()));

    if args.scan_once {
        info!("Single scan mode");
        ingestion::ingest_all(&client, &db).await?;
        let opportunities = detector::scan_for_violations(
            &db,
            config.trading.min_score_threshold,
            config.trading.fee_safety_multiplier,
        )?;
        for opp in &opportunities {
            info!(
                "{} | score={:.4} magnitude={:.4}",
                opp.signal.label(),
                opp.score,
                opp.magnitude
            );
        }
        info!("Scan complete: {} opportunities", opportunities.len());
        return Ok(());
    }

    let oracle: Arc<InferenceOracle> = match credentials.oracle_api_key {
        Some(key) => Arc::new(InferenceOracle::new(http, key)),
        None => {
            error!("Startup failed: no oracle API key configured");
            alerts
                .error("Startup failed", "no oracle API key configured")
                .await;
            std::process::exit(1);
        }
    };

    let portfolio = Portfolio::new(db.clone(), &config.trading)?;
    let executor = Executor::new(db.clone(), Arc::clone(&client), config.trading.dry_run);
    let mapper = RelationshipMapper::new(db.clone(), oracle);
    let cache = Arc::new(MarketCache::new());

    let mut orchestrator = Orchestrator::new(
        config,
        db,
        client,
        portfolio,
        executor,
        mapper,
        alerts,
        cache,
    );

    // Graceful shutdown: clear the flag, let the current tick finish
    let running = orchestrator.running_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Termination signal received, finishing current tick");
            running.store(false, Ordering::SeqCst);
        }
    });

    orchestrator.run().await
}
