//! Arm-statistics ledger: the persisted counters behind every ranking decision.
//!
//! The ledger is the only shared mutable state in the crate. All access goes
//! through [`Ledger::transaction`], which hands a [`LedgerTx`] to a closure
//! and commits only if the closure returns `Ok`; any `Err` rolls back every
//! write made through that handle.
//!
//! Counting rules:
//! - [`LedgerTx::record_impression`] inserts at most one impression per
//!   `(actor, arm, session, cycle)` and bumps `pulls` only when that insert
//!   actually happened.
//! - A click is counted once per cycle; later clicks on the same cycle are
//!   ignored (no row, no counter change).
//! - Bookmarks and adds always append a row and always bump their counter.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::candidates::CandidateFilter;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::rank::ArmCounts;
use crate::{ActorId, ArmId, CycleId, OfficeId, SessionId};

mod memory;
pub use memory::InMemoryLedger;

#[cfg(feature = "sqlite")]
mod sqlite;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteLedger;

/// Kind of a user interaction with a ranked arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionKind {
    /// Counts toward `successes`, at most once per cycle.
    Click,
    Bookmark,
    Add,
}

impl InteractionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            InteractionKind::Click => "click",
            InteractionKind::Bookmark => "bookmark",
            InteractionKind::Add => "add",
        }
    }
}

impl fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InteractionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "click" => Ok(InteractionKind::Click),
            "bookmark" => Ok(InteractionKind::Bookmark),
            "add" => Ok(InteractionKind::Add),
            other => Err(Error::InvalidRequest(format!(
                "unknown interaction kind {other:?}"
            ))),
        }
    }
}

/// One persisted ranking decision: `arm` was shown to `actor` at `page_offset`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingCycle {
    pub id: CycleId,
    pub office: OfficeId,
    pub actor: ActorId,
    pub session: SessionId,
    pub arm: ArmId,
    pub page_offset: usize,
    pub filters: CandidateFilter,
    pub created_at: DateTime<Utc>,
}

/// Counters for one `(office, actor, arm, cycle)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArmStatistic {
    pub cycle: CycleId,
    pub office: OfficeId,
    pub actor: ActorId,
    pub arm: ArmId,
    pub pulls: u64,
    pub successes: u64,
    pub bookmarks: u64,
    pub adds: u64,
    pub last_interaction: Option<DateTime<Utc>>,
}

impl ArmStatistic {
    /// A zero row.
    pub fn zero(cycle: CycleId, who: &Identity, arm: ArmId) -> Self {
        Self {
            cycle,
            office: who.office.clone(),
            actor: who.actor.clone(),
            arm,
            pulls: 0,
            successes: 0,
            bookmarks: 0,
            adds: 0,
            last_interaction: None,
        }
    }

    pub fn counts(&self) -> ArmCounts {
        ArmCounts::new(self.pulls, self.successes)
    }
}

/// An immutable interaction event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interaction {
    pub cycle: CycleId,
    pub office: OfficeId,
    pub actor: ActorId,
    pub session: SessionId,
    pub arm: ArmId,
    pub kind: InteractionKind,
    pub created_at: DateTime<Utc>,
}

/// What [`LedgerTx::record_interaction`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InteractionOutcome {
    /// A new interaction row was appended and its counter incremented.
    Recorded { cycle: CycleId, kind: InteractionKind },
    /// The cycle already had a click; nothing was written.
    DuplicateClickIgnored { cycle: CycleId },
}

impl InteractionOutcome {
    pub fn cycle(&self) -> CycleId {
        match *self {
            InteractionOutcome::Recorded { cycle, .. } => cycle,
            InteractionOutcome::DuplicateClickIgnored { cycle } => cycle,
        }
    }
}

/// One row of a rank log: how one candidate was scored in one ranking run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankLogEntry {
    pub office: OfficeId,
    pub actor: ActorId,
    pub session: SessionId,
    pub arm: ArmId,
    /// 1-based position in the full ranking (not the page).
    pub rank: usize,
    pub pulls: u64,
    pub successes: u64,
    pub ucb: f64,
    pub t: f64,
    pub c: f64,
    pub topics: Vec<String>,
    pub date_min: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}

/// Filter for reading rank logs. `None` fields do not filter; the time range
/// is inclusive on both ends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankLogQuery {
    pub office: Option<OfficeId>,
    pub actor: Option<ActorId>,
    pub session: Option<SessionId>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl RankLogQuery {
    pub fn for_actor(actor: impl Into<ActorId>) -> Self {
        Self {
            actor: Some(actor.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, entry: &RankLogEntry) -> bool {
        self.office.as_ref().map_or(true, |o| *o == entry.office)
            && self.actor.as_ref().map_or(true, |a| *a == entry.actor)
            && self.session.as_ref().map_or(true, |s| *s == entry.session)
            && self.from.map_or(true, |from| entry.created_at >= from)
            && self.to.map_or(true, |to| entry.created_at <= to)
    }
}

/// Operations available inside one ledger transaction.
///
/// Object safe: the engine drives it as `&mut dyn LedgerTx`.
pub trait LedgerTx {
    /// Sum `pulls`/`successes` over every cycle of `actor` for each of `arms`.
    ///
    /// Arms without any statistic row are absent from the map.
    fn load_aggregate_counts(
        &mut self,
        actor: &ActorId,
        arms: &[ArmId],
    ) -> Result<BTreeMap<ArmId, ArmCounts>>;

    /// Persist a new ranking cycle and return its id.
    fn open_cycle(
        &mut self,
        who: &Identity,
        arm: ArmId,
        page_offset: usize,
        filters: &CandidateFilter,
    ) -> Result<CycleId>;

    /// Create the zero statistic row for `(cycle, who, arm)` unless it exists.
    fn ensure_statistic_row(&mut self, cycle: CycleId, who: &Identity, arm: ArmId) -> Result<()>;

    /// Log an impression; returns `true` if it was new (and `pulls` was bumped).
    fn record_impression(&mut self, who: &Identity, arm: ArmId, cycle: CycleId) -> Result<bool>;

    /// Attribute an interaction to the most recent cycle of `(actor, arm)`.
    ///
    /// Fails with [`Error::NoActiveCycle`] when the pair was never ranked.
    fn record_interaction(
        &mut self,
        who: &Identity,
        arm: ArmId,
        kind: InteractionKind,
        click_increment: u64,
    ) -> Result<InteractionOutcome>;

    fn append_rank_log(&mut self, entries: &[RankLogEntry]) -> Result<()>;

    /// The actor's cycles, newest first.
    fn cycles_for_actor(&mut self, actor: &ActorId) -> Result<Vec<RankingCycle>>;

    /// The actor's statistic rows, by cycle id ascending.
    fn statistics_for_actor(&mut self, actor: &ActorId) -> Result<Vec<ArmStatistic>>;

    /// Rank-log rows matching `query`, oldest first, then by rank.
    fn rank_logs(&mut self, query: &RankLogQuery) -> Result<Vec<RankLogEntry>>;

    /// Interaction rows of one cycle, in insertion order.
    fn interactions_for_cycle(&mut self, cycle: CycleId) -> Result<Vec<Interaction>>;

    /// Interaction rows of every actor in `office`, newest first.
    fn interactions_for_office(&mut self, office: &OfficeId) -> Result<Vec<Interaction>>;
}

/// A transactional store of ranking cycles and arm statistics.
pub trait Ledger {
    /// Run `f` in one transaction: commit on `Ok`, roll back on `Err`.
    fn transaction<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut dyn LedgerTx) -> Result<R>;
}

impl<L: Ledger + ?Sized> Ledger for &L {
    fn transaction<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut dyn LedgerTx) -> Result<R>,
    {
        (**self).transaction(f)
    }
}

impl<L: Ledger + ?Sized> Ledger for Arc<L> {
    fn transaction<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut dyn LedgerTx) -> Result<R>,
    {
        (**self).transaction(f)
    }
}
