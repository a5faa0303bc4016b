use std::env;
use std::time::Duration;

/// Event bus configuration.
///
/// Reads from the `MENDER_REDIS_URL` environment variable, falling back to
/// `redis://localhost:6379` when unset.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Redis connection URL.
    pub redis_url: String,
}

impl BusConfig {
    /// The default connection URL used when no environment variable is set.
    pub const DEFAULT_URL: &str = "redis://localhost:6379";

    /// Build a config from the environment.
    pub fn from_env() -> Self {
        let redis_url =
            env::var("MENDER_REDIS_URL").unwrap_or_else(|_| Self::DEFAULT_URL.to_owned());
        Self { redis_url }
    }

    /// Build a config from an explicit URL (useful for tests and CLI flags).
    pub fn new(redis_url: impl Into<String>) -> Self {
        Self {
            redis_url: redis_url.into(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Tunables for the self-healing loop.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// A task in `running` whose last mutation is older than this is
    /// considered stale and reclaimed by the failure detector.
    pub stale_timeout: Duration,
    /// How often the failure detector sweeps.
    pub sweep_interval: Duration,
    /// Base delay for retry backoff; the wait for attempt `n` is
    /// `backoff_base * 2^retry_count`, capped at `backoff_cap`.
    pub backoff_base: Duration,
    /// Upper bound on a single retry wait.
    pub backoff_cap: Duration,
    /// Maximum number of task handlers a single worker process runs
    /// concurrently.
    pub worker_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stale_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(300),
            worker_concurrency: 16,
        }
    }
}
