//! Synchronization options
//!
//! A process-wide default is installed once and copied into every new task
//! frame. Frames may override their own copy.

use crate::error::ConfigError;
use once_cell::sync::OnceCell;
use tessel_substrate::{WaitMode, DEFAULT_SPIN_LIMIT};

/// Environment variable selecting [`CheckMode`]
pub const ENV_CHECKS: &str = "TESSEL_SYNC_CHECKS";
/// Environment variable selecting the lock [`WaitMode`]
pub const ENV_LOCK_WAIT_MODE: &str = "TESSEL_LOCK_WAIT_MODE";
/// Environment variable setting the reservation spin budget
pub const ENV_LOCK_SPIN_LIMIT: &str = "TESSEL_LOCK_SPIN_LIMIT";

/// Whether protocol checks run
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum CheckMode {
    /// Violations are logged and raised as panics
    #[default]
    Checked,
    /// Checks are skipped
    Unchecked,
}

impl CheckMode {
    /// Parse `checked` / `unchecked`
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "checked" => Ok(CheckMode::Checked),
            "unchecked" => Ok(CheckMode::Unchecked),
            _ => Err(ConfigError::InvalidValue {
                key: ENV_CHECKS,
                value: value.to_string(),
            }),
        }
    }

    /// Whether checks run in this mode
    pub fn is_checked(self) -> bool {
        self == CheckMode::Checked
    }
}

/// Parse `spin` / `always-spin` / `wait`
pub fn parse_wait_mode(value: &str) -> Result<WaitMode, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "spin" => Ok(WaitMode::Spin),
        "always-spin" | "always_spin" => Ok(WaitMode::AlwaysSpin),
        "wait" => Ok(WaitMode::Wait),
        _ => Err(ConfigError::InvalidValue {
            key: ENV_LOCK_WAIT_MODE,
            value: value.to_string(),
        }),
    }
}

/// Options for locks, guards and waits
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    /// Protocol check mode
    pub checks: CheckMode,

    /// Wait mode for new local locks
    pub lock_wait_mode: WaitMode,

    /// Spin budget for new local locks
    pub lock_spin_limit: u32,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            checks: CheckMode::Checked,
            lock_wait_mode: WaitMode::Spin,
            lock_spin_limit: DEFAULT_SPIN_LIMIT,
        }
    }
}

impl SyncOptions {
    /// Defaults overridden by any `TESSEL_*` variables that are set
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each key
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut options = Self::default();
        if let Some(value) = lookup(ENV_CHECKS) {
            options.checks = CheckMode::parse(&value)?;
        }
        if let Some(value) = lookup(ENV_LOCK_WAIT_MODE) {
            options.lock_wait_mode = parse_wait_mode(&value)?;
        }
        if let Some(value) = lookup(ENV_LOCK_SPIN_LIMIT) {
            options.lock_spin_limit = match value.trim().parse::<u32>() {
                Ok(limit) if limit > 0 => limit,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: ENV_LOCK_SPIN_LIMIT,
                        value,
                    })
                }
            };
        }
        Ok(options)
    }
}

static GLOBAL: OnceCell<SyncOptions> = OnceCell::new();

/// Install the process-wide default options
///
/// Returns the rejected options if a default was already installed.
pub fn install_global(options: SyncOptions) -> Result<(), SyncOptions> {
    GLOBAL.set(options)?;
    tracing::debug!(?options, "sync options installed");
    Ok(())
}

/// The process-wide default options
///
/// The first call without an installed default reads the environment; an
/// invalid environment falls back to built-in defaults.
pub fn global() -> SyncOptions {
    *GLOBAL.get_or_init(|| match SyncOptions::from_env() {
        Ok(options) => options,
        Err(err) => {
            tracing::warn!(%err, "ignoring invalid sync options in environment");
            SyncOptions::default()
        }
    })
}
