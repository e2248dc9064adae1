mod api;
mod clients;
mod config;
mod copilot;
mod db;
mod delivery;
mod detector;
mod digest;
mod engine;
mod error;
mod resilience;
mod retention;
mod scheduler;
mod settings;
mod state;
mod themes;
mod types;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::health::HealthState;
use crate::api::latency::LatencyStats;
use crate::api::{router, ApiState};
use crate::clients::{GammaFeed, MarketFeed, Messenger, OpenAiLlm, RationaleLlm, TelegramMessenger};
use crate::config::{resilience as tuning, Config};
use crate::copilot::{CopilotCaps, CopilotService};
use crate::detector::{ConfirmedParams, Detector, FastParams};
use crate::engine::Engine;
use crate::error::Result;
use crate::resilience::Guard;
use crate::retention::RetentionSweeper;
use crate::scheduler::CycleScheduler;
use crate::settings::SettingsCache;
use crate::state::{CooldownLedger, KvStore};

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Database setup ---
    let pool = db::connect(&cfg.db_path).await?;
    let seeded = db::users::seed_builtin_plans(&pool, Utc::now()).await?;
    info!("Database ready at {} ({seeded} built-in plans seeded)", cfg.db_path);

    // --- In-memory state ---
    let ledger = CooldownLedger::new();
    let cooldowns = db::alerts::load_cooldowns(&pool).await?;
    ledger.load(cooldowns);
    info!("[STATE] restored {} cooldown entries", ledger.len());
    let kv = KvStore::new();
    let settings = SettingsCache::new();

    // --- External dependencies ---
    let feed_guard = Arc::new(Guard::new(
        "feed",
        Duration::from_secs(tuning::FEED_TIMEOUT_SECS),
        tuning::FEED_MAX_IN_FLIGHT,
    ));
    let telegram_guard = Arc::new(Guard::new(
        "telegram",
        Duration::from_secs(tuning::TELEGRAM_TIMEOUT_SECS),
        tuning::TELEGRAM_MAX_IN_FLIGHT,
    ));
    let llm_guard = Arc::new(OpenAiLlm::guard(&cfg));

    let feed: Arc<dyn MarketFeed> = Arc::new(GammaFeed::new(&cfg, feed_guard.clone())?);
    let messenger: Arc<dyn Messenger> = Arc::new(TelegramMessenger::new(&cfg, telegram_guard.clone())?);
    if cfg.telegram_bot_token.is_none() {
        warn!("TELEGRAM_BOT_TOKEN not set: digests will be recorded as SEND_FAILED");
    }
    let llm: Option<Arc<dyn RationaleLlm>> = match OpenAiLlm::from_config(&cfg, llm_guard.clone())? {
        Some(client) => Some(Arc::new(client)),
        None => {
            info!("OPENAI_API_KEY not set: Copilot uses template rationales");
            None
        }
    };

    // --- Engine ---
    let health = Arc::new(HealthState::new());
    let latency = Arc::new(LatencyStats::new()?);
    let detector = Detector::new(
        pool.clone(),
        Arc::clone(&ledger),
        ConfirmedParams::default(),
        FastParams::default(),
        cfg.fast_signals_global_enabled,
    );
    let copilot = CopilotService::new(pool.clone(), CopilotCaps::new(kv.clone()), messenger.clone(), llm);
    let engine = Arc::new(Engine::new(
        pool.clone(),
        feed,
        messenger,
        detector,
        settings.clone(),
        kv.clone(),
        copilot,
        health.clone(),
        latency.clone(),
        cfg.fast_signals_global_enabled,
        cfg.max_concurrent_users,
    ));

    // --- Spawn tasks ---

    // Ingestion + digest cycle
    let scheduler = CycleScheduler::new(Arc::clone(&engine), cfg.ingest_interval_secs);
    tokio::spawn(async move { scheduler.run().await });

    // Daily retention sweep
    let sweeper = RetentionSweeper::new(&cfg, pool.clone(), kv);
    tokio::spawn(async move { sweeper.run().await });

    // HTTP API server
    let api_state = ApiState {
        pool,
        engine,
        settings,
        health,
        latency,
        guards: vec![feed_guard, telegram_guard, llm_guard],
        admin_key: cfg.admin_api_key.clone(),
    };
    let app = router(api_state);
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
