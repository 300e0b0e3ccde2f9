//! Scheduler configuration
//!
//! Pool sizes, the overflow rule, the cancellation grace period and the
//! history retention policy. Configuration can be built programmatically,
//! read from environment variables, or loaded from a JSON file.

use crate::error::ConfigError;
use crate::priority::WorkerTier;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const ENV_ADMIN_WORKERS: &str = "BGPROC_ADMIN_WORKERS";
pub const ENV_USER_WORKERS: &str = "BGPROC_USER_WORKERS";
pub const ENV_ALLOW_OVERFLOW: &str = "BGPROC_ALLOW_OVERFLOW";
pub const ENV_OVERFLOW_RESERVE: &str = "BGPROC_OVERFLOW_RESERVE";
pub const ENV_CANCEL_GRACE_MS: &str = "BGPROC_CANCEL_GRACE_MS";
pub const ENV_POLL_INTERVAL_MS: &str = "BGPROC_POLL_INTERVAL_MS";
pub const ENV_HISTORY_LIMIT: &str = "BGPROC_HISTORY_LIMIT";
pub const ENV_HISTORY_TTL_MS: &str = "BGPROC_HISTORY_TTL_MS";

/// Configuration for a [`ProcessScheduler`](crate::ProcessScheduler) and its worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Size of the admin pool (`W_admin`)
    pub admin_workers: usize,

    /// Size of the user pool (`W_user`)
    pub user_workers: usize,

    /// Let idle admin workers borrow from the user queue when the admin queue is empty
    pub allow_overflow: bool,

    /// Admin slots that must stay idle after a borrow
    pub overflow_reserve: usize,

    /// How long a running process may ignore a cancel request before it is
    /// reported `Cancelled` anyway
    pub cancel_grace_period: Duration,

    /// Worker wake-up and supervisor tick interval
    pub poll_interval: Duration,

    /// Maximum number of terminal records retained, `None` for unbounded
    pub history_limit: Option<usize>,

    /// Maximum age of a terminal record, `None` to keep by count only
    pub history_ttl: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            admin_workers: 2,
            user_workers: 4,
            allow_overflow: true,
            overflow_reserve: 1,
            cancel_grace_period: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            history_limit: Some(500),
            history_ttl: None,
        }
    }
}

impl SchedulerConfig {
    pub fn new(admin_workers: usize, user_workers: usize) -> Self {
        Self::default().with_workers(admin_workers, user_workers)
    }

    pub fn with_workers(mut self, admin_workers: usize, user_workers: usize) -> Self {
        self.admin_workers = admin_workers;
        self.user_workers = user_workers;
        self
    }

    pub fn with_overflow(mut self, allow: bool, reserve: usize) -> Self {
        self.allow_overflow = allow;
        self.overflow_reserve = reserve;
        self
    }

    pub fn with_cancel_grace_period(mut self, grace: Duration) -> Self {
        self.cancel_grace_period = grace;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_history_limit(mut self, limit: Option<usize>) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn with_history_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.history_ttl = ttl;
        self
    }

    /// Pool size for a tier
    pub fn workers(&self, tier: WorkerTier) -> usize {
        match tier {
            WorkerTier::Admin => self.admin_workers,
            WorkerTier::User => self.user_workers,
        }
    }

    /// Check the invariants the dispatcher relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.admin_workers == 0 {
            return Err(ConfigError::Invalid("admin pool needs at least one worker".into()));
        }
        if self.user_workers == 0 {
            return Err(ConfigError::Invalid("user pool needs at least one worker".into()));
        }
        if self.overflow_reserve > self.admin_workers {
            return Err(ConfigError::Invalid(format!(
                "overflow reserve {} exceeds admin pool size {}",
                self.overflow_reserve, self.admin_workers
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("poll interval must be positive".into()));
        }
        Ok(())
    }

    /// Defaults overridden by environment variables
    ///
    /// - `BGPROC_ADMIN_WORKERS`, `BGPROC_USER_WORKERS`: pool sizes
    /// - `BGPROC_ALLOW_OVERFLOW`: `true`/`false`
    /// - `BGPROC_OVERFLOW_RESERVE`: admin slots kept free for admin work
    /// - `BGPROC_CANCEL_GRACE_MS`, `BGPROC_POLL_INTERVAL_MS`: milliseconds
    /// - `BGPROC_HISTORY_LIMIT`: record count, `0` for unbounded
    /// - `BGPROC_HISTORY_TTL_MS`: milliseconds, `0` to disable
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_env()
    }

    /// Overlay environment variables onto this configuration
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Some(n) = env_parse::<usize>(ENV_ADMIN_WORKERS)? {
            self.admin_workers = n;
        }
        if let Some(n) = env_parse::<usize>(ENV_USER_WORKERS)? {
            self.user_workers = n;
        }
        if let Some(allow) = env_parse::<bool>(ENV_ALLOW_OVERFLOW)? {
            self.allow_overflow = allow;
        }
        if let Some(n) = env_parse::<usize>(ENV_OVERFLOW_RESERVE)? {
            self.overflow_reserve = n;
        }
        if let Some(ms) = env_parse::<u64>(ENV_CANCEL_GRACE_MS)? {
            self.cancel_grace_period = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>(ENV_POLL_INTERVAL_MS)? {
            self.poll_interval = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse::<usize>(ENV_HISTORY_LIMIT)? {
            self.history_limit = (n > 0).then_some(n);
        }
        if let Some(ms) = env_parse::<u64>(ENV_HISTORY_TTL_MS)? {
            self.history_ttl = (ms > 0).then(|| Duration::from_millis(ms));
        }
        Ok(self)
    }

    /// Parse a JSON document; missing keys keep their defaults
    ///
    /// ```json
    /// {
    ///   "admin_workers": 2,
    ///   "user_workers": 4,
    ///   "allow_overflow": true,
    ///   "overflow_reserve": 1,
    ///   "cancel_grace_ms": 30000,
    ///   "poll_interval_ms": 100,
    ///   "history_limit": 500,
    ///   "history_ttl_ms": null
    /// }
    /// ```
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = serde_json::from_str(json)?;
        Ok(file.into())
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_json(&contents)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(&ConfigFile::from(self))?)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path.as_ref(), self.to_json()?)?;
        Ok(())
    }
}

/// On-disk form, durations as integers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub admin_workers: usize,
    pub user_workers: usize,
    pub allow_overflow: bool,
    pub overflow_reserve: usize,
    pub cancel_grace_ms: u64,
    pub poll_interval_ms: u64,
    pub history_limit: Option<usize>,
    pub history_ttl_ms: Option<u64>,
}

impl Default for ConfigFile {
    fn default() -> Self {
        ConfigFile::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for ConfigFile {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            admin_workers: config.admin_workers,
            user_workers: config.user_workers,
            allow_overflow: config.allow_overflow,
            overflow_reserve: config.overflow_reserve,
            cancel_grace_ms: duration_ms(config.cancel_grace_period),
            poll_interval_ms: duration_ms(config.poll_interval),
            history_limit: config.history_limit,
            // Sub-millisecond ages round up so a set TTL never reads back as disabled.
            history_ttl_ms: config.history_ttl.map(|ttl| duration_ms(ttl).max(1)),
        }
    }
}

impl From<ConfigFile> for SchedulerConfig {
    fn from(file: ConfigFile) -> Self {
        Self {
            admin_workers: file.admin_workers,
            user_workers: file.user_workers,
            allow_overflow: file.allow_overflow,
            overflow_reserve: file.overflow_reserve,
            cancel_grace_period: Duration::from_millis(file.cancel_grace_ms),
            poll_interval: Duration::from_millis(file.poll_interval_ms),
            history_limit: file.history_limit.filter(|n| *n > 0),
            history_ttl: file.history_ttl_ms.filter(|ms| *ms > 0).map(Duration::from_millis),
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key: key.to_string(), value }),
        Err(_) => Ok(None),
    }
}
