//! Ranking: score every candidate arm and sort descending by UCB.
//!
//! Ties keep their input order (stable sort). Cold arms all score exactly
//! `1.0`, so this tie-break decides the order of every unexplored arm; callers
//! that want "newest first" exploration should pass candidates newest first.

use std::collections::{BTreeMap, HashMap};
use std::hash::BuildHasher;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::hellinger::DEFAULT_TOLERANCE;
use crate::score::{BanditContext, ExplorationConstant};
use crate::ArmId;

/// Aggregate bandit counts for one arm: pulls `N` and successes `S`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArmCounts {
    pub pulls: u64,
    pub successes: u64,
}

impl ArmCounts {
    pub fn new(pulls: u64, successes: u64) -> Self {
        Self { pulls, successes }
    }

    /// Empirical success rate, or `None` for a cold arm.
    pub fn success_rate(&self) -> Option<f64> {
        if self.pulls == 0 {
            None
        } else {
            Some(self.successes as f64 / self.pulls as f64)
        }
    }
}

/// Source of per-arm counts for a ranking decision.
///
/// Arms the lookup does not know about are treated as cold (`(0, 0)`).
pub trait CountLookup {
    fn counts(&self, arm: ArmId) -> Option<ArmCounts>;
}

impl CountLookup for BTreeMap<ArmId, ArmCounts> {
    fn counts(&self, arm: ArmId) -> Option<ArmCounts> {
        self.get(&arm).copied()
    }
}

impl<S: BuildHasher> CountLookup for HashMap<ArmId, ArmCounts, S> {
    fn counts(&self, arm: ArmId) -> Option<ArmCounts> {
        self.get(&arm).copied()
    }
}

impl<T: CountLookup + ?Sized> CountLookup for &T {
    fn counts(&self, arm: ArmId) -> Option<ArmCounts> {
        (**self).counts(arm)
    }
}

/// One scored arm in a ranking.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankedArm {
    pub arm: ArmId,
    /// Hellinger-UCB score in `[0, 1]`.
    pub score: f64,
    /// Counts the score was computed from.
    pub counts: ArmCounts,
}

impl RankedArm {
    /// Whether this arm was ranked as untried.
    pub fn is_cold(&self) -> bool {
        self.counts.pulls == 0
    }
}

/// Sum of pulls over `arms` (each arm counted once per appearance), floored at 1.
///
/// This is the global time index `t` used for every arm in one decision.
pub fn time_index<L: CountLookup + ?Sized>(arms: &[ArmId], lookup: &L) -> f64 {
    let total: u64 = arms
        .iter()
        .filter_map(|a| lookup.counts(*a))
        .fold(0u64, |acc, c| acc.saturating_add(c.pulls));
    (total as f64).max(1.0)
}

/// Score and sort `arms` under a prepared [`BanditContext`].
///
/// Deterministic given identical inputs; ties keep input order.
pub fn rank_with_context<L: CountLookup + ?Sized>(
    arms: &[ArmId],
    lookup: &L,
    ctx: &BanditContext,
) -> Vec<RankedArm> {
    let mut ranked: Vec<RankedArm> = arms
        .iter()
        .map(|&arm| {
            let counts = lookup.counts(arm).unwrap_or_default();
            RankedArm {
                arm,
                score: ctx.score(counts.pulls, counts.successes),
                counts,
            }
        })
        .collect();
    // `sort_by` is stable: equal scores keep their relative input order.
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    ranked
}

/// Rank arms by Hellinger-UCB, returning `(arm, score)` pairs sorted descending.
///
/// `c` is validated first ([`crate::Error::Configuration`] when outside `(0.25, 0.5]`).
///
/// ```rust
/// use std::collections::BTreeMap;
/// use ucbrank::{rank_articles, ArmCounts, ArmId};
///
/// let mut stats = BTreeMap::new();
/// stats.insert(ArmId(3), ArmCounts::new(10, 9));
/// let ranked = rank_articles(&[ArmId(1), ArmId(2), ArmId(3)], &stats, 10.0, 0.3).unwrap();
/// let order: Vec<_> = ranked.iter().map(|(a, _)| a.0).collect();
/// assert_eq!(order, vec![1, 2, 3]);
/// ```
pub fn rank_articles<L: CountLookup + ?Sized>(
    arms: &[ArmId],
    lookup: &L,
    t: f64,
    c: f64,
) -> Result<Vec<(ArmId, f64)>> {
    let c = ExplorationConstant::new(c)?;
    let ctx = BanditContext {
        t,
        c,
        tol: DEFAULT_TOLERANCE,
    };
    Ok(rank_with_context(arms, lookup, &ctx)
        .into_iter()
        .map(|r| (r.arm, r.score))
        .collect())
}
