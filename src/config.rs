//! Process-wide policy configuration.
//!
//! Loaded once at startup and handed to [`crate::Engine::new`], which refuses
//! an invalid config. Nothing here is read from ambient state at request time.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hellinger::DEFAULT_TOLERANCE;
use crate::score::ExplorationConstant;

/// Environment variable for the exploration constant `c`.
pub const ENV_EXPLORATION_C: &str = "UCBRANK_EXPLORATION_C";
/// Environment variable for the bisection tolerance.
pub const ENV_TOLERANCE: &str = "UCBRANK_TOLERANCE";
/// Environment variable for the per-click `successes` increment.
pub const ENV_CLICK_INCREMENT: &str = "UCBRANK_CLICK_INCREMENT";
/// Environment variable toggling rank logging (`true`/`1` enables).
pub const ENV_RANK_LOG_ENABLED: &str = "UCBRANK_RANK_LOG_ENABLED";

/// Largest accepted [`EngineConfig::click_increment`].
pub const MAX_CLICK_INCREMENT: u64 = 1_000;

/// Configuration for an [`crate::Engine`].
///
/// Start with [`EngineConfig::default()`] and adjust via the `with_*` methods
/// or by setting fields directly; call [`EngineConfig::validate`] (the engine
/// does) before use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Exploration constant `c ∈ (0.25, 0.5]`.
    pub exploration: ExplorationConstant,
    /// Bisection tolerance for the UCB root-finder.
    pub tolerance: f64,
    /// How much one de-duplicated click adds to `successes`.
    ///
    /// Default `1`, at most [`MAX_CLICK_INCREMENT`]. Larger values bias
    /// ranking toward clicked arms and let `successes` exceed `pulls`.
    pub click_increment: u64,
    /// Persist one rank-log row per ranked candidate on every request.
    ///
    /// Meant for short monitoring windows; it writes `O(candidates)` rows per request.
    pub rank_log_enabled: bool,
    /// Page size used when a caller does not specify one.
    pub default_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            exploration: ExplorationConstant::default(),
            tolerance: DEFAULT_TOLERANCE,
            click_increment: 1,
            rank_log_enabled: false,
            default_limit: 20,
        }
    }
}

impl EngineConfig {
    /// Set the exploration constant (validated).
    pub fn with_exploration(mut self, c: f64) -> Result<Self> {
        self.exploration = ExplorationConstant::new(c)?;
        Ok(self)
    }

    /// Set the bisection tolerance.
    pub fn with_tolerance(mut self, tol: f64) -> Self {
        self.tolerance = tol;
        self
    }

    /// Set the click increment.
    pub fn with_click_increment(mut self, inc: u64) -> Self {
        self.click_increment = inc;
        self
    }

    /// Enable per-request rank logging.
    pub fn with_rank_log(mut self) -> Self {
        self.rank_log_enabled = true;
        self
    }

    /// Set the default page size.
    pub fn with_default_limit(mut self, limit: usize) -> Self {
        self.default_limit = limit;
        self
    }

    /// Check every field; returns the first violation as [`Error::Configuration`].
    pub fn validate(&self) -> Result<()> {
        // Re-check `c`: the field is public and may have been set directly.
        ExplorationConstant::new(self.exploration.get())?;
        if !(self.tolerance.is_finite() && self.tolerance > 0.0 && self.tolerance < 0.5) {
            return Err(Error::Configuration(format!(
                "tolerance must be finite and in (0, 0.5) (got {})",
                self.tolerance
            )));
        }
        if !(1..=MAX_CLICK_INCREMENT).contains(&self.click_increment) {
            return Err(Error::Configuration(format!(
                "click_increment must be in 1..={MAX_CLICK_INCREMENT} (got {})",
                self.click_increment
            )));
        }
        Ok(())
    }

    /// Build a config from `UCBRANK_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup (the environment, a map, ...).
    pub fn from_lookup<F>(mut lookup: F) -> Result<Self>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(raw) = lookup(ENV_EXPLORATION_C) {
            cfg.exploration = ExplorationConstant::new(parse_value(ENV_EXPLORATION_C, &raw)?)?;
        }
        if let Some(raw) = lookup(ENV_TOLERANCE) {
            cfg.tolerance = parse_value(ENV_TOLERANCE, &raw)?;
        }
        if let Some(raw) = lookup(ENV_CLICK_INCREMENT) {
            cfg.click_increment = parse_value(ENV_CLICK_INCREMENT, &raw)?;
        }
        if let Some(raw) = lookup(ENV_RANK_LOG_ENABLED) {
            let v = raw.trim().to_ascii_lowercase();
            cfg.rank_log_enabled = v == "true" || v == "1";
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| Error::Configuration(format!("{key}={raw:?}: {e}")))
}
