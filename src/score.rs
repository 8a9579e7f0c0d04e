//! Per-arm Hellinger-UCB score.
//!
//! For an arm with `N` pulls and `S` successes at global time index `t`:
//!
//! ```text
//!   α = 1 − exp(−c · ln(t + 1) / N)
//!   score = sup { q ∈ [0,1] : H²(S/N, q) ≤ α }
//! ```
//!
//! Untried arms (`N = 0`) score exactly `1.0`, which forces every new arm to
//! be shown before the bound starts discriminating. More pulls shrink `α`
//! toward 0 and pull the score down toward `S/N`; a larger `t` relative to `N`
//! widens the region again for under-shown arms.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hellinger::{find_hellinger_ucb, DEFAULT_TOLERANCE};

/// Exploration constant `c`, validated into `(0.25, 0.5]`.
///
/// `0.25` is the most exploitative end of the range, `0.5` the most
/// exploratory. Deserializing an out-of-range value fails.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct ExplorationConstant(f64);

impl ExplorationConstant {
    /// Exclusive lower bound of the admissible range.
    pub const LOWER_EXCLUSIVE: f64 = 0.25;
    /// Inclusive upper bound of the admissible range.
    pub const UPPER_INCLUSIVE: f64 = 0.5;
    /// Value used when nothing is configured.
    pub const DEFAULT: f64 = 0.26;

    /// Validate `c`.
    pub fn new(c: f64) -> Result<Self> {
        if c > Self::LOWER_EXCLUSIVE && c <= Self::UPPER_INCLUSIVE {
            Ok(Self(c))
        } else {
            Err(Error::Configuration(format!(
                "exploration constant c must satisfy 0.25 < c <= 0.5 (got {c})"
            )))
        }
    }

    /// The raw value.
    #[inline]
    pub fn get(self) -> f64 {
        self.0
    }
}

impl Default for ExplorationConstant {
    fn default() -> Self {
        Self(Self::DEFAULT)
    }
}

impl TryFrom<f64> for ExplorationConstant {
    type Error = Error;

    fn try_from(c: f64) -> Result<Self> {
        Self::new(c)
    }
}

impl From<ExplorationConstant> for f64 {
    fn from(c: ExplorationConstant) -> f64 {
        c.0
    }
}

impl fmt::Display for ExplorationConstant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Exploration budget `α = 1 − exp(−c · ln(t + 1) / N)` for an arm with `pulls > 0`.
///
/// `t` below 1 (or NaN) is raised to 1. Returns `1.0` for `pulls == 0`.
#[must_use]
pub fn exploration_budget(pulls: u64, t: f64, c: ExplorationConstant) -> f64 {
    if pulls == 0 {
        return 1.0;
    }
    let t = if t.is_nan() { 1.0 } else { t.max(1.0) };
    let n = pulls as f64;
    1.0 - (-c.get() * (t + 1.0).ln() / n).exp()
}

/// Hellinger-UCB score for one arm, validating `c` first.
///
/// Fails with [`Error::Configuration`] when `c` is outside `(0.25, 0.5]`.
///
/// ```rust
/// use ucbrank::hellinger_ucb;
///
/// assert_eq!(hellinger_ucb(0, 0, 10.0, 0.3).unwrap(), 1.0);
/// assert!(hellinger_ucb(3, 1, 10.0, 0.1).is_err());
/// ```
pub fn hellinger_ucb(pulls: u64, successes: u64, t: f64, c: f64) -> Result<f64> {
    let c = ExplorationConstant::new(c)?;
    Ok(arm_score(pulls, successes, t, c, DEFAULT_TOLERANCE))
}

/// Infallible score for an already-validated exploration constant.
///
/// `successes` may exceed `pulls` (the ledger does not enforce `S ≤ N`); the
/// empirical rate is then clamped to `1`.
#[must_use]
pub fn arm_score(pulls: u64, successes: u64, t: f64, c: ExplorationConstant, tol: f64) -> f64 {
    if pulls == 0 {
        return 1.0;
    }
    let alpha = exploration_budget(pulls, t, c);
    let p_hat = successes as f64 / pulls as f64;
    find_hellinger_ucb(p_hat, alpha, tol)
}

/// Global bandit context for one ranking decision: time index and exploration constant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BanditContext {
    /// Global time index `t` (sum of the actor's pulls over visible arms, at least 1).
    pub t: f64,
    /// Exploration constant.
    pub c: ExplorationConstant,
    /// Bisection tolerance.
    pub tol: f64,
}

impl BanditContext {
    /// Build a context from the total pull count, flooring `t` at 1.
    pub fn from_total_pulls(total_pulls: u64, c: ExplorationConstant, tol: f64) -> Self {
        Self {
            t: (total_pulls as f64).max(1.0),
            c,
            tol,
        }
    }

    /// Score one arm under this context.
    #[inline]
    pub fn score(&self, pulls: u64, successes: u64) -> f64 {
        arm_score(pulls, successes, self.t, self.c, self.tol)
    }
}
