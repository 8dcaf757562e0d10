//! Typed environment settings (spec.md §6).
//!
//! Mirrors the teacher's `DbConfig::default()` shape: every field is parsed
//! once from `std::env::var`, with a hard-coded default on parse failure or
//! absence. A handful of settings are load-bearing enough that an invalid
//! value is a fatal startup error instead of a silent fallback.

use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::RwLock;

/// `EA_MODE` — which loops this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EaMode {
    Reader,
    Writer,
    ReaderWriter,
}

impl EaMode {
    pub fn runs_ingress(self) -> bool {
        matches!(self, EaMode::Reader | EaMode::ReaderWriter)
    }

    pub fn runs_background(self) -> bool {
        matches!(self, EaMode::Writer | EaMode::ReaderWriter)
    }

    fn parse(raw: &str) -> anyhow::Result<Self> {
        match raw {
            "reader" => Ok(EaMode::Reader),
            "writer" => Ok(EaMode::Writer),
            "reader-writer" => Ok(EaMode::ReaderWriter),
            other => anyhow::bail!("EA_MODE must be one of reader|writer|reader-writer, got {other:?}"),
        }
    }
}

/// `CACHE_TYPE` — local (in-process) or redis-backed cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheType {
    Local,
    Redis,
}

/// `RATE_LIMITING_STRATEGY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitStrategy {
    Burst,
    FixedInterval,
    ApiCredit,
}

impl RateLimitStrategy {
    fn parse(raw: &str) -> Self {
        match raw {
            "fixed-interval" => RateLimitStrategy::FixedInterval,
            "api-credit" => RateLimitStrategy::ApiCredit,
            _ => RateLimitStrategy::Burst,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub ea_mode: EaMode,
    pub ea_host: String,
    pub ea_port: u16,
    pub base_url: String,
    pub metrics_port: Option<u16>,

    pub cache_type: CacheType,
    pub cache_max_age_ms: u64,
    pub cache_max_items: u64,
    pub cache_prefix: String,
    pub cache_polling_max_retries: u32,
    pub cache_polling_sleep_ms: u64,
    pub cache_lock_duration_ms: u64,
    pub cache_lock_retries: u32,
    pub max_common_key_size: usize,
    pub max_payload_size_limit: usize,

    pub rate_limit_capacity_second: Option<u32>,
    pub rate_limit_capacity_minute: Option<u32>,
    pub rate_limit_capacity: Option<u32>,
    pub rate_limiting_strategy: RateLimitStrategy,
    pub max_http_request_queue_length: usize,

    pub background_execute_ms_http: u64,
    pub background_execute_ms_ws: u64,
    pub background_execute_ms_sse: u64,
    pub background_execute_timeout_ms: u64,

    pub warmup_subscription_ttl_ms: u64,
    pub ws_subscription_ttl_ms: u64,
    pub ws_subscription_unresponsive_ttl_ms: u64,
    pub ws_heartbeat_interval_ms: u64,
    pub sse_subscription_ttl_ms: u64,
    pub sse_keepalive_sleep_ms: u64,

    pub api_timeout_ms: u64,
    pub correlation_id_enabled: bool,
    pub log_level: String,
    pub metrics_enabled: bool,
    pub experimental_metrics_enabled: bool,

    pub redis_url: String,
    pub adapter_name: String,

    /// Transport security is an external collaborator (spec.md §6): these
    /// are parsed so they show up in logs and `.env.example`, but the core
    /// itself always binds a plain `TcpListener` and never acts on them. A
    /// reverse proxy or a wrapping TLS listener terminates TLS in front of
    /// it.
    pub tls_enabled: bool,
    pub mtls_enabled: bool,
    pub tls_private_key: Option<String>,
    pub tls_public_key: Option<String>,
    pub tls_ca: Option<String>,
    pub tls_passphrase: Option<String>,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_or_opt<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Settings {
    /// Parse settings from the process environment. Call after
    /// `dotenvy::dotenv().ok()` so a `.env` file is honored.
    pub fn from_env() -> anyhow::Result<Self> {
        let ea_mode = EaMode::parse(&env_str("EA_MODE", "reader-writer"))?;
        let cache_type = match env_str("CACHE_TYPE", "local").as_str() {
            "redis" => CacheType::Redis,
            _ => CacheType::Local,
        };

        // Invariant 6: local cache requires reader-writer mode.
        if cache_type == CacheType::Local && ea_mode != EaMode::ReaderWriter {
            anyhow::bail!(
                "CACHE_TYPE=local requires EA_MODE=reader-writer (got {:?}); \
                 a local cache is only consistent when reads and writes share one process",
                ea_mode
            );
        }

        let settings = Settings {
            ea_mode,
            ea_host: env_str("EA_HOST", "0.0.0.0"),
            ea_port: env_or("EA_PORT", 8080u16),
            base_url: env_str("BASE_URL", "/"),
            metrics_port: env_or_opt("METRICS_PORT"),

            cache_type,
            cache_max_age_ms: env_or("CACHE_MAX_AGE", 30_000u64),
            cache_max_items: env_or("CACHE_MAX_ITEMS", 10_000u64),
            cache_prefix: env_str("CACHE_PREFIX", "ea"),
            cache_polling_max_retries: env_or("CACHE_POLLING_MAX_RETRIES", 10u32),
            cache_polling_sleep_ms: env_or("CACHE_POLLING_SLEEP_MS", 1_000u64),
            cache_lock_duration_ms: env_or("CACHE_LOCK_DURATION", 30_000u64),
            cache_lock_retries: env_or("CACHE_LOCK_RETRIES", 5u32),
            max_common_key_size: env_or("MAX_COMMON_KEY_SIZE", 300usize),
            max_payload_size_limit: env_or("MAX_PAYLOAD_SIZE_LIMIT", 1_000_000usize),

            rate_limit_capacity_second: env_or_opt("RATE_LIMIT_CAPACITY_SECOND"),
            rate_limit_capacity_minute: env_or_opt("RATE_LIMIT_CAPACITY_MINUTE"),
            rate_limit_capacity: env_or_opt("RATE_LIMIT_CAPACITY"),
            rate_limiting_strategy: RateLimitStrategy::parse(&env_str("RATE_LIMITING_STRATEGY", "burst")),
            max_http_request_queue_length: env_or("MAX_HTTP_REQUEST_QUEUE_LENGTH", 1_000usize),

            background_execute_ms_http: env_or("BACKGROUND_EXECUTE_MS_HTTP", 1_000u64),
            background_execute_ms_ws: env_or("BACKGROUND_EXECUTE_MS_WS", 1_000u64),
            background_execute_ms_sse: env_or("BACKGROUND_EXECUTE_MS_SSE", 1_000u64),
            background_execute_timeout_ms: env_or("BACKGROUND_EXECUTE_TIMEOUT", 180_000u64),

            warmup_subscription_ttl_ms: env_or("WARMUP_SUBSCRIPTION_TTL", 30_000u64),
            ws_subscription_ttl_ms: env_or("WS_SUBSCRIPTION_TTL", 120_000u64),
            ws_subscription_unresponsive_ttl_ms: env_or("WS_SUBSCRIPTION_UNRESPONSIVE_TTL", 120_000u64),
            ws_heartbeat_interval_ms: env_or("WS_HEARTBEAT_INTERVAL_MS", 30_000u64),
            sse_subscription_ttl_ms: env_or("SSE_SUBSCRIPTION_TTL", 120_000u64),
            sse_keepalive_sleep_ms: env_or("SSE_KEEPALIVE_SLEEP", 60_000u64),

            api_timeout_ms: env_or("API_TIMEOUT", 30_000u64),
            correlation_id_enabled: env_or("CORRELATION_ID_ENABLED", true),
            log_level: env_str("LOG_LEVEL", default_log_level()),
            metrics_enabled: env_or("METRICS_ENABLED", false),
            experimental_metrics_enabled: env_or("EXPERIMENTAL_METRICS_ENABLED", false),

            redis_url: env_str("REDIS_URL", "redis://127.0.0.1:6379"),
            adapter_name: env_str("ADAPTER_NAME", "EA"),

            tls_enabled: env_or("TLS_ENABLED", false),
            mtls_enabled: env_or("MTLS_ENABLED", false),
            tls_private_key: env_or_opt("TLS_PRIVATE_KEY"),
            tls_public_key: env_or_opt("TLS_PUBLIC_KEY"),
            tls_ca: env_or_opt("TLS_CA"),
            tls_passphrase: env_or_opt("TLS_PASSPHRASE"),
        };

        if settings.tls_enabled || settings.mtls_enabled {
            tracing::warn!(
                "TLS_ENABLED/MTLS_ENABLED are set but this process always binds a plain TCP listener; \
                 terminate TLS with a reverse proxy or a wrapping listener in front of it"
            );
        }
        register_sensitive(&[]); // no sensitive settings are recognized by name yet; hook point for adapters.
        Ok(settings)
    }

    pub fn background_execute_timeout(&self) -> Duration {
        Duration::from_millis(self.background_execute_timeout_ms)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_millis(self.api_timeout_ms)
    }
}

fn default_log_level() -> &'static str {
    if cfg!(debug_assertions) {
        "debug"
    } else {
        "warn"
    }
}

// Sensitive-value registry consulted by `error::redact`. Adapters can push
// secret strings (API keys embedded in `config`) in here at startup so they
// are scrubbed from error bodies and logs without the core needing to know
// their names ahead of time.
static SENSITIVE_VALUES: OnceCell<RwLock<Vec<String>>> = OnceCell::new();

pub fn register_sensitive(values: &[String]) {
    let cell = SENSITIVE_VALUES.get_or_init(|| RwLock::new(Vec::new()));
    cell.write().extend(values.iter().cloned());
}

pub fn sensitive_values_snapshot() -> Vec<String> {
    SENSITIVE_VALUES
        .get()
        .map(|lock| lock.read().clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_cache_requires_reader_writer_mode() {
        std::env::set_var("CACHE_TYPE", "local");
        std::env::set_var("EA_MODE", "reader");
        let result = Settings::from_env();
        assert!(result.is_err(), "local cache + reader-only mode must be fatal");
        std::env::remove_var("CACHE_TYPE");
        std::env::remove_var("EA_MODE");
    }
}
