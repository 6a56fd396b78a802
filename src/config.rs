use crate::rpc::RetryPolicy;
use anyhow::Result;
use std::env;
use std::time::Duration;

/// Legacy deployment of the arena contract and its result-event topic.
pub const DEFAULT_LEGACY_CONTRACT: &str = "0x8a3f0e7de6cbd425ec51c431a3c7d1a04ef52912";
pub const DEFAULT_LEGACY_TOPIC: &str =
    "0x9a2f68cd41ad6d3f0b84eca135049f5f0b02e6a7a2c8f54d9f13a0d6c84be917";

/// Current (migrated) deployment and its result-event topic.
pub const DEFAULT_CURRENT_CONTRACT: &str = "0xc41be2f5d6e8a9730f1a94c3bfe2a06a1f4f09b3";
pub const DEFAULT_CURRENT_TOPIC: &str =
    "0x3d82f50e9387cd8ab1a6a843d29f1f49f3b4b10f2cb10ef26a9c36e0ac7d4151";

/// Migration cutover: 2024-06-01T00:00:00Z, aligned to a UTC day boundary so
/// any single day index resolves unambiguously to one contract generation.
pub const DEFAULT_CUTOVER_TS: i64 = 1_717_200_000;

#[derive(Debug, Clone)]
pub struct Config {
    // Chain RPC
    pub rpc_url: String,
    pub rpc_timeout_seconds: u64,
    pub rpc_max_retries: u32,
    pub rpc_retry_delay_ms: u64,
    pub rpc_backoff_multiplier: f64,

    // Contract generations
    pub legacy_contract: String,
    pub legacy_topic: String,
    pub current_contract: String,
    pub current_topic: String,
    pub cutover_ts: i64,

    // Log fetching
    pub max_block_span: u64,
    pub log_concurrency: usize,
    pub day_concurrency: usize,
    pub batch_pause_ms: u64,

    // Caching
    pub redis_url: Option<String>,
    pub memory_cache_days: usize,
    pub empty_day_ttl_seconds: u64,

    // Service
    pub service_port: u16,
    pub metrics_port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present

        Ok(Config {
            rpc_url: env::var("ARENA_RPC_URL")
                .unwrap_or_else(|_| "http://localhost:8545".to_string()),

            rpc_timeout_seconds: env::var("ARENA_RPC_TIMEOUT_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),

            rpc_max_retries: env::var("ARENA_RPC_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),

            rpc_retry_delay_ms: env::var("ARENA_RPC_RETRY_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1000),

            rpc_backoff_multiplier: env::var("ARENA_RPC_BACKOFF_MULTIPLIER")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1.7),

            legacy_contract: env::var("ARENA_LEGACY_CONTRACT")
                .unwrap_or_else(|_| DEFAULT_LEGACY_CONTRACT.to_string()),

            legacy_topic: env::var("ARENA_LEGACY_TOPIC")
                .unwrap_or_else(|_| DEFAULT_LEGACY_TOPIC.to_string()),

            current_contract: env::var("ARENA_CURRENT_CONTRACT")
                .unwrap_or_else(|_| DEFAULT_CURRENT_CONTRACT.to_string()),

            current_topic: env::var("ARENA_CURRENT_TOPIC")
                .unwrap_or_else(|_| DEFAULT_CURRENT_TOPIC.to_string()),

            cutover_ts: env::var("ARENA_CUTOVER_TS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_CUTOVER_TS),

            max_block_span: env::var("ARENA_MAX_BLOCK_SPAN")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2000),

            log_concurrency: env::var("ARENA_LOG_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4),

            day_concurrency: env::var("ARENA_DAY_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4),

            batch_pause_ms: env::var("ARENA_BATCH_PAUSE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(250),

            redis_url: env::var("ARENA_REDIS_URL").ok().filter(|v| !v.is_empty()),

            memory_cache_days: env::var("ARENA_MEMORY_CACHE_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(256),

            empty_day_ttl_seconds: env::var("ARENA_EMPTY_DAY_TTL_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3600),

            service_port: env::var("ARENA_SERVICE_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),

            metrics_port: env::var("ARENA_METRICS_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(9090),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.rpc_max_retries,
            base_delay: Duration::from_millis(self.rpc_retry_delay_ms),
            multiplier: self.rpc_backoff_multiplier,
        }
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_seconds)
    }

    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }

    pub fn empty_day_ttl(&self) -> Duration {
        Duration::from_secs(self.empty_day_ttl_seconds)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rpc_url: "http://localhost:8545".to_string(),
            rpc_timeout_seconds: 30,
            rpc_max_retries: 3,
            rpc_retry_delay_ms: 1000,
            rpc_backoff_multiplier: 1.7,
            legacy_contract: DEFAULT_LEGACY_CONTRACT.to_string(),
            legacy_topic: DEFAULT_LEGACY_TOPIC.to_string(),
            current_contract: DEFAULT_CURRENT_CONTRACT.to_string(),
            current_topic: DEFAULT_CURRENT_TOPIC.to_string(),
            cutover_ts: DEFAULT_CUTOVER_TS,
            max_block_span: 2000,
            log_concurrency: 4,
            day_concurrency: 4,
            batch_pause_ms: 250,
            redis_url: None,
            memory_cache_days: 256,
            empty_day_ttl_seconds: 3600,
            service_port: 8080,
            metrics_port: 9090,
        }
    }
}
