//! Protocol configuration.

use lockstep_config::{ConfigError, Settings};
use std::time::Duration;

/// Tunables for one protocol instance.
///
/// `N` is fixed for the lifetime of the instance; membership changes are out
/// of scope.
#[derive(Debug, Clone)]
pub struct PbftConfig {
    /// Total number of replicas.
    pub n: u64,
    /// Upper bound on Byzantine replicas; requires `n >= 3f + 1`.
    pub f: u64,
    /// Checkpoint period in sequence numbers.
    pub k: u64,
    /// Log window is `k * log_multiplier` sequence numbers.
    pub log_multiplier: u64,
    /// Rotate the primary every this many stable checkpoints. Zero disables.
    pub view_change_period: u64,
    /// How long a pending request may go unordered before a view change.
    pub request_timeout: Duration,
    /// How long to wait for a new-view before escalating another view.
    pub new_view_timeout: Duration,
    /// Primary null-request send interval. Zero disables null requests.
    pub null_request_timeout: Duration,
    /// Rebroadcast interval for our own view-change message.
    pub vc_resend_timeout: Duration,
}

impl Default for PbftConfig {
    fn default() -> Self {
        Self {
            n: 4,
            f: 1,
            k: 10,
            log_multiplier: 4,
            view_change_period: 0,
            request_timeout: Duration::from_secs(2),
            new_view_timeout: Duration::from_secs(2),
            null_request_timeout: Duration::ZERO,
            vc_resend_timeout: Duration::from_secs(1),
        }
    }
}

impl PbftConfig {
    /// Build from loaded [`Settings`], validating the derived quorums.
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        let n = settings.get_u64("general.N")?;
        let f = if settings.is_set("general.f") {
            settings.get_u64("general.f")?
        } else {
            (n.saturating_sub(1)) / 3
        };
        let config = Self {
            n,
            f,
            k: settings.get_u64("general.K")?,
            log_multiplier: settings.get_u64("general.logmultiplier")?,
            view_change_period: settings.get_u64("general.viewchangeperiod")?,
            request_timeout: settings.get_duration("general.timeout.request")?,
            new_view_timeout: settings.get_duration("general.timeout.viewchange")?,
            null_request_timeout: settings.get_duration("general.timeout.nullrequest")?,
            vc_resend_timeout: settings.get_duration("general.timeout.resendviewchange")?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the parameters are mutually consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n == 0 {
            return Err(ConfigError::Invalid("N must be positive".into()));
        }
        if self.n < 3 * self.f + 1 {
            return Err(ConfigError::Invalid(format!(
                "N = {} cannot tolerate f = {} failures (need N >= 3f + 1)",
                self.n, self.f
            )));
        }
        if self.k == 0 {
            return Err(ConfigError::Invalid("checkpoint period K must be positive".into()));
        }
        if self.log_multiplier < 2 {
            return Err(ConfigError::Invalid(
                "logmultiplier must be at least 2".into(),
            ));
        }
        Ok(())
    }

    /// Size of the log window: `L = K * logmultiplier`.
    pub fn log_size(&self) -> u64 {
        self.k * self.log_multiplier
    }

    /// Quorum size guaranteeing intersection in a correct replica:
    /// `ceil((N + f + 1) / 2)`, which is `2f + 1` when `N = 3f + 1`.
    pub fn intersection_quorum(&self) -> u64 {
        (self.n + self.f + 2) / 2
    }

    /// Smallest set guaranteed to contain a correct replica: `f + 1`.
    pub fn weak_quorum(&self) -> u64 {
        self.f + 1
    }
}
