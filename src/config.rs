//! Application configuration.
//!
//! The per-client YAML file is parsed by an outer collaborator and handed in
//! as this struct; `from_env` covers standalone runs of the binary. Every
//! field is validated up front so a misconfigured process refuses to start
//! instead of misbehaving later.

use serde::{Deserialize, Serialize};

use crate::error::AutopilotError;

/// Execution mode applied when a request does not specify one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    DryRun,
    Live,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::DryRun => "dry_run",
            ExecutionMode::Live => "live",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dry_run" => Some(ExecutionMode::DryRun),
            "live" => Some(ExecutionMode::Live),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub execute_per_min: u32,
    pub batch_per_min: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            execute_per_min: 10,
            batch_per_min: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retry attempts after the first try.
    pub max: u32,
    pub base_ms: u64,
    pub cap_ms: u64,
    /// Overall deadline across all attempts, per proposal.
    pub deadline_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max: 3,
            base_ms: 1_000,
            cap_ms: 30_000,
            deadline_ms: 90_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub mode_default: ExecutionMode,
    pub batch_cap: usize,
    pub retry: RetryConfig,
    /// Per-attempt adapter timeout.
    pub attempt_timeout_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            mode_default: ExecutionMode::DryRun,
            batch_cap: 100,
            retry: RetryConfig::default(),
            attempt_timeout_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailConfig {
    pub high_risk_confidence_floor: f64,
    /// Applied when a rule does not declare its own cooldown.
    pub default_cooldown_days: u32,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            high_risk_confidence_floor: 0.85,
            default_cooldown_days: 7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionConfig {
    /// ROAS drop beyond this fraction (with cost above baseline) is a regression.
    pub roas_drop_pct: f64,
    /// CPA increase beyond this fraction is a regression.
    pub cpa_increase_pct: f64,
}

impl Default for RegressionConfig {
    fn default() -> Self {
        Self {
            roas_drop_pct: 0.30,
            cpa_increase_pct: 0.50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackConfig {
    pub tick_seconds: u64,
    /// Baseline and observation window length, either side of execution.
    pub window_days: u32,
    /// Floor on post-change clicks before the predicate may fire.
    pub min_post_data_points: u64,
    /// Monitoring never extends past this many days.
    pub max_monitoring_days: u32,
    pub regression: RegressionConfig,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            tick_seconds: 300,
            window_days: 7,
            min_post_data_points: 20,
            max_monitoring_days: 14,
            regression: RegressionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub ttl_seconds: u64,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 3_600,
            max_entries: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub customer_id: i64,
    pub database_path: String,
    pub port: u16,
    pub log_dir: String,
    /// Pending recommendations expire after this many hours.
    pub pending_ttl_hours: u32,
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub guardrails: GuardrailConfig,
    #[serde(default)]
    pub rollback: RollbackConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            customer_id: 0,
            database_path: "./autopilot.db".to_string(),
            port: 8080,
            log_dir: "./logs".to_string(),
            pending_ttl_hours: 72,
            rate_limits: RateLimitConfig::default(),
            execution: ExecutionConfig::default(),
            guardrails: GuardrailConfig::default(),
            rollback: RollbackConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let customer_id = std::env::var("CUSTOMER_ID")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./autopilot.db".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let log_dir = std::env::var("LOG_DIR").unwrap_or_else(|_| "./logs".to_string());

        let mode_default = std::env::var("EXECUTION_MODE")
            .ok()
            .and_then(|v| ExecutionMode::parse(&v))
            .unwrap_or(ExecutionMode::DryRun);

        let mut config = Self {
            customer_id,
            database_path,
            port,
            log_dir,
            ..Self::default()
        };
        config.execution.mode_default = mode_default;

        config.validate()?;
        Ok(config)
    }

    /// Reject a config the process must not start with. Messages name the
    /// offending field precisely.
    pub fn validate(&self) -> anyhow::Result<()> {
        fn fail(field: &str, message: &str) -> anyhow::Error {
            AutopilotError::ValidationFailed {
                field: field.to_string(),
                message: message.to_string(),
            }
            .into()
        }

        if self.customer_id <= 0 {
            return Err(fail("customer_id", "must be a positive customer id"));
        }
        if self.database_path.is_empty() {
            return Err(fail("database_path", "must not be empty"));
        }
        if self.rate_limits.execute_per_min == 0 {
            return Err(fail("rate_limits.execute_per_min", "must be >= 1"));
        }
        if self.rate_limits.batch_per_min == 0 {
            return Err(fail("rate_limits.batch_per_min", "must be >= 1"));
        }
        if self.execution.batch_cap == 0 {
            return Err(fail("execution.batch_cap", "must be >= 1"));
        }
        if self.execution.retry.base_ms == 0 {
            return Err(fail("execution.retry.base_ms", "must be >= 1"));
        }
        if self.execution.retry.cap_ms < self.execution.retry.base_ms {
            return Err(fail("execution.retry.cap_ms", "must be >= retry.base_ms"));
        }
        if !(0.0..=1.0).contains(&self.guardrails.high_risk_confidence_floor) {
            return Err(fail(
                "guardrails.high_risk_confidence_floor",
                "must be within [0, 1]",
            ));
        }
        if self.rollback.tick_seconds == 0 {
            return Err(fail("rollback.tick_seconds", "must be >= 1"));
        }
        if self.rollback.window_days == 0 {
            return Err(fail("rollback.window_days", "must be >= 1"));
        }
        if self.rollback.max_monitoring_days < self.rollback.window_days {
            return Err(fail(
                "rollback.max_monitoring_days",
                "must be >= rollback.window_days",
            ));
        }
        if !(0.0..=1.0).contains(&self.rollback.regression.roas_drop_pct) {
            return Err(fail(
                "rollback.regression.roas_drop_pct",
                "must be within [0, 1]",
            ));
        }
        if self.rollback.regression.cpa_increase_pct <= 0.0 {
            return Err(fail("rollback.regression.cpa_increase_pct", "must be > 0"));
        }
        if self.cache.ttl_seconds == 0 {
            return Err(fail("cache.ttl_seconds", "must be >= 1"));
        }
        if self.cache.max_entries == 0 {
            return Err(fail("cache.max_entries", "must be >= 1"));
        }
        if self.pending_ttl_hours == 0 {
            return Err(fail("pending_ttl_hours", "must be >= 1"));
        }
        Ok(())
    }
}
