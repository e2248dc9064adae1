use crate::error::{AppError, Result};

pub const POLYMARKET_BASE_URL: &str = "https://gamma-api.polymarket.com";
pub const TELEGRAM_API_URL: &str = "https://api.telegram.org";
pub const LLM_API_BASE: &str = "https://api.openai.com/v1/chat/completions";
pub const MARKET_LINK_BASE: &str = "https://polymarket.com/market";

/// Snapshots are aligned to this cadence (minutes).
pub const SNAPSHOT_BUCKET_MINUTES: i64 = 5;

/// The scheduler never runs cycles faster than this, whatever INGEST_INTERVAL_SECONDS says.
pub const MIN_INGEST_INTERVAL_SECS: u64 = 30;

/// Retention sweeper wakes up hourly and runs at most once per UTC day.
pub const RETENTION_CHECK_INTERVAL_SECS: u64 = 3_600;

/// Resolved settings stay cached per user for this long.
pub const SETTINGS_CACHE_TTL_SECS: u64 = 600;
pub const SETTINGS_CACHE_CAPACITY: u64 = 10_000;

/// Points either side of an alert bucket used for classification and evidence.
pub const PRICE_POINTS_PER_SIDE: i64 = 5;

/// Copilot needs at least this many distinct snapshot points around the alert.
pub const MIN_COPILOT_SNAPSHOT_POINTS: usize = 3;

/// Jaccard similarity at or above which two titles are grouped into one theme.
pub const THEME_MERGE_SIMILARITY: f64 = 0.6;

/// Code defaults. The innermost layer of every effective setting.
pub mod defaults {
    pub const WINDOW_MINUTES: i64 = 60;
    pub const MOVE_THRESHOLD: f64 = 0.05;
    pub const ALERT_COOLDOWN_MINUTES: i64 = 30;

    pub const MIN_PRICE_THRESHOLD: f64 = 0.05;
    pub const FLOOR_PRICE: f64 = 0.05;
    pub const MEDIUM_ABS_MOVE_THRESHOLD: f64 = 0.01;
    pub const STRONG_ABS_MOVE_THRESHOLD: f64 = 0.05;
    pub const MEDIUM_MIN_LIQUIDITY: f64 = 1_000.0;
    pub const MEDIUM_MIN_VOLUME_24H: f64 = 1_000.0;
    pub const STRONG_MIN_LIQUIDITY: f64 = 10_000.0;
    pub const STRONG_MIN_VOLUME_24H: f64 = 10_000.0;

    pub const FAST_WINDOW_MINUTES: i64 = 15;
    pub const FAST_MIN_ABS_MOVE: f64 = 0.015;
    pub const FAST_MIN_PCT_MOVE: f64 = 0.05;
    pub const FAST_MIN_LIQUIDITY: f64 = 5_000.0;
    pub const FAST_MIN_VOLUME_24H: f64 = 5_000.0;
    pub const FAST_PYES_MIN: f64 = 0.15;
    pub const FAST_PYES_MAX: f64 = 0.85;
    pub const FAST_COOLDOWN_MINUTES: i64 = 30;
    pub const FAST_MAX_THEMES_PER_DIGEST: i64 = 2;
    pub const FAST_MAX_MARKETS_PER_THEME: i64 = 2;

    pub const DIGEST_WINDOW_MINUTES: i64 = 60;
    pub const MAX_THEMES_PER_DIGEST: i64 = 5;
    pub const MAX_MARKETS_PER_THEME: i64 = 3;
    pub const MAX_ACTIONABLE_PER_DIGEST: i64 = 7;
    pub const DIGEST_ACTIONABLE_ONLY: bool = false;
    pub const PYES_ACTIONABLE_MIN: f64 = 0.15;
    pub const PYES_ACTIONABLE_MAX: f64 = 0.85;
    pub const ALLOWED_STRENGTHS: &str = "STRONG,MEDIUM";

    pub const COPILOT_ENABLED: bool = true;
    pub const MAX_COPILOT_PER_DAY: i64 = 30;
    pub const MAX_COPILOT_PER_HOUR: i64 = 3;
    pub const MAX_COPILOT_PER_DIGEST: i64 = 1;
    pub const COPILOT_THEME_TTL_MINUTES: i64 = 360;
}

/// Classification cut-offs for liquidity/volume descriptors in digest lines.
pub mod descriptors {
    pub const HIGH_LIQUIDITY: f64 = 50_000.0;
    pub const MODERATE_LIQUIDITY: f64 = 10_000.0;
    pub const HIGH_VOLUME_24H: f64 = 100_000.0;
    pub const MODERATE_VOLUME_24H: f64 = 25_000.0;
}

/// Timeouts, retry and breaker tuning for external collaborators.
pub mod resilience {
    pub const FEED_TIMEOUT_SECS: u64 = 15;
    pub const TELEGRAM_TIMEOUT_SECS: u64 = 10;

    pub const MAX_RETRIES: u32 = 2;
    pub const INITIAL_BACKOFF_MS: u64 = 500;
    pub const BACKOFF_MULTIPLIER: f64 = 2.0;
    pub const MAX_BACKOFF_MS: u64 = 4_000;

    pub const BREAKER_FAILURE_THRESHOLD: u32 = 5;
    pub const BREAKER_COOLDOWN_SECS: u64 = 60;

    pub const FEED_MAX_IN_FLIGHT: usize = 2;
    pub const TELEGRAM_MAX_IN_FLIGHT: usize = 4;
    pub const LLM_MAX_IN_FLIGHT: usize = 2;
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    pub polymarket_base_url: String,
    /// Page size for /events (POLY_PAGE_LIMIT)
    pub poly_page_limit: usize,
    /// Hard stop on pagination (POLY_MAX_PAGES)
    pub poly_max_pages: usize,
    /// Send liquidity/volume minimums to the feed as a payload-reduction hint (POLY_USE_SERVER_FILTERS)
    pub poly_use_server_filters: bool,
    /// Cycle cadence in seconds, floored at MIN_INGEST_INTERVAL_SECS (INGEST_INTERVAL_SECONDS)
    pub ingest_interval_secs: u64,
    pub snapshot_retention_days: i64,
    pub alert_retention_days: i64,
    pub delivery_retention_days: i64,
    pub cleanup_enabled: bool,
    pub cleanup_hour_utc: u32,
    /// Master switch for the FAST tier (FAST_SIGNALS_GLOBAL_ENABLED)
    pub fast_signals_global_enabled: bool,
    pub telegram_bot_token: Option<String>,
    pub telegram_api_url: String,
    pub openai_api_key: Option<String>,
    pub llm_api_base: String,
    pub llm_model: String,
    pub llm_timeout_secs: u64,
    pub llm_max_retries: u32,
    pub llm_cache_ttl_secs: u64,
    /// Required x-admin-key value for admin routes when set (ADMIN_API_KEY)
    pub admin_api_key: Option<String>,
    /// Users processed concurrently within one cycle (MAX_CONCURRENT_USERS)
    pub max_concurrent_users: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let ingest_interval_secs = env_parse::<u64>("INGEST_INTERVAL_SECONDS", 300)?;
        let cleanup_hour_utc = env_parse::<u32>("CLEANUP_SCHEDULE_HOUR_UTC", 3)?;
        if cleanup_hour_utc > 23 {
            return Err(AppError::Config(
                "CLEANUP_SCHEDULE_HOUR_UTC must be between 0 and 23".to_string(),
            ));
        }

        Ok(Self {
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "digest.db".to_string()),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            polymarket_base_url: std::env::var("POLYMARKET_BASE_URL")
                .unwrap_or_else(|_| POLYMARKET_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            poly_page_limit: env_parse::<usize>("POLY_PAGE_LIMIT", 100)?.max(1),
            poly_max_pages: env_parse::<usize>("POLY_MAX_PAGES", 100)?.max(1),
            poly_use_server_filters: env_bool("POLY_USE_SERVER_FILTERS", true),
            ingest_interval_secs: ingest_interval_secs.max(MIN_INGEST_INTERVAL_SECS),
            snapshot_retention_days: env_parse::<i64>("SNAPSHOT_RETENTION_DAYS", 7)?,
            alert_retention_days: env_parse::<i64>("ALERT_RETENTION_DAYS", 30)?,
            delivery_retention_days: env_parse::<i64>("DELIVERY_RETENTION_DAYS", 30)?,
            cleanup_enabled: env_bool("CLEANUP_ENABLED", true),
            cleanup_hour_utc,
            fast_signals_global_enabled: env_bool("FAST_SIGNALS_GLOBAL_ENABLED", false),
            telegram_bot_token: env_opt("TELEGRAM_BOT_TOKEN"),
            telegram_api_url: std::env::var("TELEGRAM_API_URL")
                .unwrap_or_else(|_| TELEGRAM_API_URL.to_string()),
            openai_api_key: env_opt("OPENAI_API_KEY"),
            llm_api_base: std::env::var("LLM_API_BASE").unwrap_or_else(|_| LLM_API_BASE.to_string()),
            llm_model: std::env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            llm_timeout_secs: env_parse::<u64>("LLM_TIMEOUT_SECONDS", 15)?,
            llm_max_retries: env_parse::<u32>("LLM_MAX_RETRIES", 2)?,
            llm_cache_ttl_secs: env_parse::<u64>("LLM_CACHE_TTL_SECONDS", 3_600)?,
            admin_api_key: env_opt("ADMIN_API_KEY"),
            max_concurrent_users: env_parse::<usize>("MAX_CONCURRENT_USERS", 8)?.max(1),
        })
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_opt(key) {
        Some(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env_opt(key) {
        Some(v) => v
            .parse::<T>()
            .map_err(|_| AppError::Config(format!("{key} has an invalid value: {v}"))),
        None => Ok(default),
    }
}

#[cfg(test)]
impl Config {
    /// Defaults without reading the environment.
    pub fn for_tests() -> Self {
        Self {
            log_level: "debug".to_string(),
            db_path: ":memory:".to_string(),
            api_port: 0,
            polymarket_base_url: POLYMARKET_BASE_URL.to_string(),
            poly_page_limit: 100,
            poly_max_pages: 100,
            poly_use_server_filters: true,
            ingest_interval_secs: 300,
            snapshot_retention_days: 7,
            alert_retention_days: 30,
            delivery_retention_days: 30,
            cleanup_enabled: true,
            cleanup_hour_utc: 3,
            fast_signals_global_enabled: false,
            telegram_bot_token: None,
            telegram_api_url: TELEGRAM_API_URL.to_string(),
            openai_api_key: None,
            llm_api_base: LLM_API_BASE.to_string(),
            llm_model: "gpt-4o-mini".to_string(),
            llm_timeout_secs: 15,
            llm_max_retries: 2,
            llm_cache_ttl_secs: 3_600,
            admin_api_key: None,
            max_concurrent_users: 8,
        }
    }
}
