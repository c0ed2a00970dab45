use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub quota: QuotaSettings,
    pub backoff: BackoffSettings,
    #[serde(default)]
    pub ledger: LedgerSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Published provider quotas plus the margin held below them.
///
/// Effective limits are derived as `published * (1 - safety_margin)` unless an
/// explicit override is given; either way they must stay strictly below the
/// published value.
#[derive(Debug, Deserialize, Clone)]
pub struct QuotaSettings {
    pub published_start_tps: f64,
    pub published_poll_tps: f64,
    #[serde(default = "default_published_detect_tps")]
    pub published_detect_tps: f64,
    pub published_max_concurrent_jobs: u32,
    pub safety_margin: f64,

    #[serde(default)]
    pub start_tps: Option<f64>,
    #[serde(default)]
    pub poll_tps: Option<f64>,
    #[serde(default)]
    pub detect_tps: Option<f64>,
    #[serde(default)]
    pub max_in_flight: Option<u32>,

    /// Minimum spacing between two status checks of the same job
    #[serde(default = "default_min_poll_interval_ms")]
    pub min_poll_interval_ms: u64,
    /// How long a submission waits for a concurrency slot before deferring
    #[serde(default = "default_slot_wait_ms")]
    pub slot_wait_ms: u64,
    /// How long a call waits for a rate token before deferring
    #[serde(default = "default_token_wait_ms")]
    pub token_wait_ms: u64,
    /// Wall-clock ceiling for a document, from enqueue to terminal state
    pub document_timeout_ms: u64,
    /// Upper bound on a single submit or status call to the provider
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_submit_sweep_ms")]
    pub submit_sweep_ms: u64,
    #[serde(default = "default_poll_sweep_ms")]
    pub poll_sweep_ms: u64,
    /// Time for a narrowed limiter to recover its full configured rate
    #[serde(default = "default_adaptive_recovery_ms")]
    pub adaptive_recovery_ms: u64,
}

fn default_published_detect_tps() -> f64 {
    1.0
}
fn default_min_poll_interval_ms() -> u64 {
    5_000
}
fn default_slot_wait_ms() -> u64 {
    30_000
}
fn default_token_wait_ms() -> u64 {
    10_000
}
fn default_call_timeout_ms() -> u64 {
    30_000
}
fn default_submit_sweep_ms() -> u64 {
    250
}
fn default_poll_sweep_ms() -> u64 {
    1_000
}
fn default_adaptive_recovery_ms() -> u64 {
    30_000
}

impl QuotaSettings {
    fn derived_rate(&self, published: f64, explicit: Option<f64>) -> f64 {
        explicit.unwrap_or(published * (1.0 - self.safety_margin))
    }

    pub fn start_rate(&self) -> f64 {
        self.derived_rate(self.published_start_tps, self.start_tps)
    }

    pub fn poll_rate(&self) -> f64 {
        self.derived_rate(self.published_poll_tps, self.poll_tps)
    }

    pub fn detect_rate(&self) -> f64 {
        self.derived_rate(self.published_detect_tps, self.detect_tps)
    }

    pub fn max_in_flight(&self) -> usize {
        match self.max_in_flight {
            Some(n) => n as usize,
            None => {
                let published = self.published_max_concurrent_jobs as f64;
                let derived = (published * (1.0 - self.safety_margin)).floor() as usize;
                derived
                    .min(self.published_max_concurrent_jobs.saturating_sub(1) as usize)
                    .max(1)
            }
        }
    }

    pub fn min_poll_interval(&self) -> Duration {
        Duration::from_millis(self.min_poll_interval_ms)
    }
    pub fn slot_wait(&self) -> Duration {
        Duration::from_millis(self.slot_wait_ms)
    }
    pub fn token_wait(&self) -> Duration {
        Duration::from_millis(self.token_wait_ms)
    }
    pub fn document_timeout(&self) -> Duration {
        Duration::from_millis(self.document_timeout_ms)
    }
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
    pub fn submit_sweep(&self) -> Duration {
        Duration::from_millis(self.submit_sweep_ms)
    }
    pub fn poll_sweep(&self) -> Duration {
        Duration::from_millis(self.poll_sweep_ms)
    }
    pub fn adaptive_recovery(&self) -> Duration {
        Duration::from_millis(self.adaptive_recovery_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackoffSettings {
    pub throttled: RetryCurveSettings,
    pub transient: RetryCurveSettings,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct RetryCurveSettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LedgerSettings {
    #[serde(default = "default_ledger_backend")]
    pub backend: Backend,
    #[serde(default = "default_ledger_path")]
    pub path: String,
    #[serde(default)]
    pub flush_interval_ms: Option<u64>,
}

fn default_ledger_backend() -> Backend {
    Backend::Fs
}

fn default_ledger_path() -> String {
    "/tmp/textract-quota-ledger".to_string()
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            backend: default_ledger_backend(),
            path: default_ledger_path(),
            flush_interval_ms: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Fs,
    Memory,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

impl AppConfig {
    /// Deployment profile used when no config file is given: 90% of the
    /// published Textract quotas (2 start TPS, 5 get TPS, 100 concurrent jobs).
    pub fn deployment_default() -> Self {
        Self {
            quota: QuotaSettings {
                published_start_tps: 2.0,
                published_poll_tps: 5.0,
                published_detect_tps: default_published_detect_tps(),
                published_max_concurrent_jobs: 100,
                safety_margin: 0.1,
                start_tps: None,
                poll_tps: None,
                detect_tps: None,
                max_in_flight: None,
                min_poll_interval_ms: default_min_poll_interval_ms(),
                slot_wait_ms: default_slot_wait_ms(),
                token_wait_ms: default_token_wait_ms(),
                document_timeout_ms: 3_600_000,
                call_timeout_ms: default_call_timeout_ms(),
                submit_sweep_ms: default_submit_sweep_ms(),
                poll_sweep_ms: default_poll_sweep_ms(),
                adaptive_recovery_ms: default_adaptive_recovery_ms(),
            },
            backoff: BackoffSettings {
                throttled: RetryCurveSettings {
                    base_delay_ms: 1_000,
                    max_delay_ms: 60_000,
                    max_attempts: 6,
                },
                transient: RetryCurveSettings {
                    base_delay_ms: 250,
                    max_delay_ms: 10_000,
                    max_attempts: 3,
                },
            },
            ledger: LedgerSettings::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load config from a TOML file, or the deployment profile when no path
    /// is given. Environment overrides are applied and the result validated.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let mut cfg = match path {
            Some(p) => {
                let data = fs::read_to_string(p)?;
                Self::from_toml(&data)?
            }
            None => Self::deployment_default(),
        };
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml(data: &str) -> Result<Self, SettingsError> {
        Ok(toml::from_str(data)?)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), SettingsError> {
        self.apply_overrides_from(|var| std::env::var(var).ok())
    }

    /// Apply the `TEXTRACT_*` overrides, reading variables through `lookup`.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), SettingsError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        if let Some(v) = parse_var::<f64, _>(&lookup, "TEXTRACT_START_TPS_LIMIT")? {
            self.quota.start_tps = Some(v);
        }
        if let Some(v) = parse_var::<f64, _>(&lookup, "TEXTRACT_GET_TPS_LIMIT")? {
            self.quota.poll_tps = Some(v);
        }
        if let Some(v) = parse_var::<f64, _>(&lookup, "TEXTRACT_DETECT_TPS_LIMIT")? {
            self.quota.detect_tps = Some(v);
        }
        if let Some(v) = parse_var::<u32, _>(&lookup, "TEXTRACT_MAX_CONCURRENT_JOBS")? {
            self.quota.max_in_flight = Some(v);
        }
        if let Some(v) = parse_var::<f64, _>(&lookup, "TEXTRACT_SAFETY_MARGIN")? {
            self.quota.safety_margin = v;
        }
        if let Some(v) = parse_var::<u32, _>(&lookup, "TEXTRACT_MAX_RETRIES")? {
            self.backoff.throttled.max_attempts = v;
        }
        // Delays are given in (fractional) seconds
        if let Some(v) = parse_var::<f64, _>(&lookup, "TEXTRACT_BASE_DELAY")? {
            self.backoff.throttled.base_delay_ms = (v * 1000.0).round() as u64;
        }
        if let Some(v) = parse_var::<f64, _>(&lookup, "TEXTRACT_MAX_DELAY")? {
            self.backoff.throttled.max_delay_ms = (v * 1000.0).round() as u64;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let q = &self.quota;
        if !(q.safety_margin > 0.0 && q.safety_margin < 1.0) {
            return Err(SettingsError::Invalid(format!(
                "safety_margin must be in (0, 1), got {}",
                q.safety_margin
            )));
        }
        for (name, published, effective) in [
            ("start", q.published_start_tps, q.start_rate()),
            ("poll", q.published_poll_tps, q.poll_rate()),
            ("detect", q.published_detect_tps, q.detect_rate()),
        ] {
            // Written as one positive condition so NaN fails it
            let in_range = published.is_finite() && effective > 0.0 && effective < published;
            if !in_range {
                return Err(SettingsError::Invalid(format!(
                    "{name} rate {effective} must be positive and strictly below the published limit {published}"
                )));
            }
        }
        let max_in_flight = q.max_in_flight();
        if max_in_flight == 0 {
            return Err(SettingsError::Invalid(
                "max_in_flight must be at least 1".to_string(),
            ));
        }
        if max_in_flight >= q.published_max_concurrent_jobs as usize {
            return Err(SettingsError::Invalid(format!(
                "max_in_flight {} must be strictly below the published limit {}",
                max_in_flight, q.published_max_concurrent_jobs
            )));
        }
        if q.document_timeout_ms == 0
            || q.call_timeout_ms == 0
            || q.poll_sweep_ms == 0
            || q.submit_sweep_ms == 0
        {
            return Err(SettingsError::Invalid(
                "document_timeout_ms, call_timeout_ms and sweep intervals must be non-zero"
                    .to_string(),
            ));
        }
        for (name, curve) in [
            ("throttled", &self.backoff.throttled),
            ("transient", &self.backoff.transient),
        ] {
            if curve.max_attempts == 0 {
                return Err(SettingsError::Invalid(format!(
                    "backoff.{name}.max_attempts must be at least 1"
                )));
            }
            if curve.base_delay_ms == 0 || curve.base_delay_ms > curve.max_delay_ms {
                return Err(SettingsError::Invalid(format!(
                    "backoff.{name}: base_delay_ms must be in 1..=max_delay_ms"
                )));
            }
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, SettingsError>
where
    T: std::str::FromStr,
    F: Fn(&'static str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| SettingsError::InvalidEnv { var, value: raw }),
    }
}
