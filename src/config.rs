use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: Option<String>,
    /// Hard ceiling on concurrently owned instances.
    pub max_instances: usize,
    /// Delay between cold-start recovery batches.
    pub staggered_boot_delay: Duration,
    pub boot_batch_size: usize,
    /// Fleet-wide cap on in-flight reconnect attempts.
    pub reconnect_concurrency: usize,
    pub max_reconnect_attempts: u32,
    /// Uniform jitter applied before each reconnect attempt.
    pub reconnect_jitter: (Duration, Duration),
    /// Coalescing window for signal key writes.
    pub key_write_debounce: Duration,
    pub qr_ttl: Duration,
    pub version_cache_ttl: Duration,
    /// Consumed by the message log, which lives outside this service.
    pub messages_retention_days: u32,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3000),
            database_url: env::var("DATABASE_URL").ok(),
            max_instances: env::var("MAX_INSTANCES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(80),
            staggered_boot_delay: Duration::from_millis(
                env::var("STAGGERED_BOOT_DELAY_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(500),
            ),
            messages_retention_days: env::var("MESSAGES_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(7),
            ..Self::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            database_url: None,
            max_instances: 80,
            staggered_boot_delay: Duration::from_millis(500),
            boot_batch_size: 5,
            reconnect_concurrency: 5,
            max_reconnect_attempts: 5,
            reconnect_jitter: (Duration::from_secs(1), Duration::from_secs(5)),
            key_write_debounce: Duration::from_millis(500),
            qr_ttl: Duration::from_secs(60),
            version_cache_ttl: Duration::from_secs(3600),
            messages_retention_days: 7,
        }
    }
}
