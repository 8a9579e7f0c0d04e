//! Read-side reports over a ledger: rank logs, cycle history, engagement.
//!
//! Every report reads inside its own transaction and never writes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ledger::{ArmStatistic, Interaction, Ledger, RankLogEntry, RankLogQuery, RankingCycle};
use crate::{ActorId, ArmId, OfficeId};

fn round_to(x: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (x * scale).round() / scale
}

fn ctr(clicks: u64, impressions: u64, decimals: i32) -> f64 {
    if impressions == 0 {
        0.0
    } else {
        round_to(clicks as f64 / impressions as f64, decimals)
    }
}

/// Rows of the most recent ranking run matching `query`, by rank.
///
/// "Most recent" is the newest `created_at` among the matching rows; a run
/// writes all of its rows with one timestamp. Empty when nothing matches.
pub fn latest_rank_logs<L: Ledger>(ledger: &L, query: &RankLogQuery) -> Result<Vec<RankLogEntry>> {
    let rows = ledger.transaction(|tx| tx.rank_logs(query))?;
    let Some(newest) = rows.iter().map(|r| r.created_at).max() else {
        return Ok(Vec::new());
    };
    let mut latest: Vec<RankLogEntry> = rows
        .into_iter()
        .filter(|r| r.created_at == newest)
        .collect();
    latest.sort_by_key(|r| r.rank);
    Ok(latest)
}

/// The actor's ranking cycles, newest first.
pub fn cycle_history<L: Ledger>(ledger: &L, actor: &ActorId) -> Result<Vec<RankingCycle>> {
    ledger.transaction(|tx| tx.cycles_for_actor(actor))
}

/// Every interaction recorded in `office`, newest first.
pub fn office_interactions<L: Ledger>(ledger: &L, office: &OfficeId) -> Result<Vec<Interaction>> {
    ledger.transaction(|tx| tx.interactions_for_office(office))
}

/// Totals over a set of statistic rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EngagementSummary {
    pub clicks: u64,
    pub impressions: u64,
    pub bookmarks: u64,
    pub adds: u64,
    /// `clicks / impressions`, 4 decimals; `0` without impressions.
    pub ctr: f64,
}

/// Per-cycle statistics of one actor plus their totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngagementReport {
    /// Most recently interacted first; rows never interacted with come last.
    pub rows: Vec<ArmStatistic>,
    pub summary: EngagementSummary,
}

/// Engagement of one actor across every ranking cycle.
pub fn actor_engagement<L: Ledger>(ledger: &L, actor: &ActorId) -> Result<EngagementReport> {
    let mut rows = ledger.transaction(|tx| tx.statistics_for_actor(actor))?;
    // `Option` orders `None` first, so reversing puts never-interacted rows last.
    rows.sort_by(|a, b| {
        b.last_interaction
            .cmp(&a.last_interaction)
            .then_with(|| b.cycle.cmp(&a.cycle))
    });

    let mut summary = EngagementSummary::default();
    for row in &rows {
        summary.clicks = summary.clicks.saturating_add(row.successes);
        summary.impressions = summary.impressions.saturating_add(row.pulls);
        summary.bookmarks = summary.bookmarks.saturating_add(row.bookmarks);
        summary.adds = summary.adds.saturating_add(row.adds);
    }
    summary.ctr = ctr(summary.clicks, summary.impressions, 4);
    Ok(EngagementReport { rows, summary })
}

/// Engagement of one actor with one arm, summed over cycles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmEngagement {
    pub arm: ArmId,
    pub clicks: u64,
    pub impressions: u64,
    /// `clicks / impressions`, 3 decimals; `0` without impressions.
    pub ctr: f64,
    pub bookmarks: u64,
    pub adds: u64,
    pub last_interaction: Option<DateTime<Utc>>,
}

/// Per-arm engagement for an actor, best CTR first (ties by arm id).
pub fn arm_engagement<L: Ledger>(ledger: &L, actor: &ActorId) -> Result<Vec<ArmEngagement>> {
    let stats = ledger.transaction(|tx| tx.statistics_for_actor(actor))?;
    let mut by_arm: BTreeMap<ArmId, ArmEngagement> = BTreeMap::new();
    for s in stats {
        let e = by_arm.entry(s.arm).or_insert_with(|| ArmEngagement {
            arm: s.arm,
            clicks: 0,
            impressions: 0,
            ctr: 0.0,
            bookmarks: 0,
            adds: 0,
            last_interaction: None,
        });
        e.clicks = e.clicks.saturating_add(s.successes);
        e.impressions = e.impressions.saturating_add(s.pulls);
        e.bookmarks = e.bookmarks.saturating_add(s.bookmarks);
        e.adds = e.adds.saturating_add(s.adds);
        e.last_interaction = e.last_interaction.max(s.last_interaction);
    }
    let mut out: Vec<ArmEngagement> = by_arm
        .into_values()
        .map(|mut e| {
            e.ctr = ctr(e.clicks, e.impressions, 3);
            e
        })
        .collect();
    out.sort_by(|a, b| b.ctr.total_cmp(&a.ctr).then_with(|| a.arm.cmp(&b.arm)));
    Ok(out)
}
