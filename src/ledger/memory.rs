//! In-process ledger for tests and single-process deployments.
//!
//! A transaction writes straight into the shared state while holding the lock
//! and journals one undo record per write. The journal is replayed in reverse
//! when the closure returns `Err` or panics, and discarded on commit, so
//! read-only transactions copy nothing.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use parking_lot::Mutex;

use super::{
    ArmStatistic, Interaction, InteractionKind, InteractionOutcome, Ledger, LedgerTx,
    RankLogEntry, RankLogQuery, RankingCycle,
};
use crate::candidates::CandidateFilter;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::rank::ArmCounts;
use crate::{ActorId, ArmId, CycleId, OfficeId, SessionId};

type StatKey = (CycleId, OfficeId, ActorId, ArmId);
type ImpressionKey = (ActorId, ArmId, SessionId, CycleId);

#[derive(Debug, Default)]
struct State {
    last_cycle_id: i64,
    cycles: BTreeMap<CycleId, RankingCycle>,
    statistics: BTreeMap<StatKey, ArmStatistic>,
    impressions: BTreeSet<ImpressionKey>,
    interactions: Vec<Interaction>,
    rank_logs: Vec<RankLogEntry>,
}

impl State {
    fn latest_cycle(&self, actor: &ActorId, arm: ArmId) -> Option<CycleId> {
        self.cycles
            .values()
            .filter(|c| c.actor == *actor && c.arm == arm)
            .max_by_key(|c| (c.created_at, c.id))
            .map(|c| c.id)
    }
}

/// How to reverse one write.
enum Undo {
    LastCycleId(i64),
    Cycle(CycleId),
    Statistic(StatKey, Option<ArmStatistic>),
    Impression(ImpressionKey),
    Interactions(usize),
    RankLogs(usize),
}

/// Ledger kept entirely in memory behind a `parking_lot::Mutex`.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: Mutex<State>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Ledger for InMemoryLedger {
    fn transaction<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut dyn LedgerTx) -> Result<R>,
    {
        let mut guard = self.state.lock();
        let mut tx = MemoryTx {
            state: &mut *guard,
            undo: Vec::new(),
        };
        // Dropping `tx` without `commit` rolls it back.
        let out = f(&mut tx)?;
        tx.commit();
        Ok(out)
    }
}

struct MemoryTx<'a> {
    state: &'a mut State,
    undo: Vec<Undo>,
}

impl MemoryTx<'_> {
    fn commit(mut self) {
        self.undo.clear();
    }

    fn rollback(&mut self) {
        while let Some(step) = self.undo.pop() {
            match step {
                Undo::LastCycleId(id) => self.state.last_cycle_id = id,
                Undo::Cycle(id) => {
                    self.state.cycles.remove(&id);
                }
                Undo::Statistic(key, Some(prev)) => {
                    self.state.statistics.insert(key, prev);
                }
                Undo::Statistic(key, None) => {
                    self.state.statistics.remove(&key);
                }
                Undo::Impression(key) => {
                    self.state.impressions.remove(&key);
                }
                Undo::Interactions(len) => self.state.interactions.truncate(len),
                Undo::RankLogs(len) => self.state.rank_logs.truncate(len),
            }
        }
    }

    /// The statistic row for `(cycle, who, arm)`, created if absent, with its
    /// current value journaled.
    fn statistic_mut(
        &mut self,
        cycle: CycleId,
        who: &Identity,
        arm: ArmId,
    ) -> Result<&mut ArmStatistic> {
        if !self.state.cycles.contains_key(&cycle) {
            return Err(Error::Persistence(format!("unknown ranking cycle {cycle}")));
        }
        let key = (cycle, who.office.clone(), who.actor.clone(), arm);
        let prev = self.state.statistics.get(&key).cloned();
        self.undo.push(Undo::Statistic(key.clone(), prev));
        Ok(self
            .state
            .statistics
            .entry(key)
            .or_insert_with(|| ArmStatistic::zero(cycle, who, arm)))
    }
}

impl Drop for MemoryTx<'_> {
    fn drop(&mut self) {
        self.rollback();
    }
}

impl LedgerTx for MemoryTx<'_> {
    fn load_aggregate_counts(
        &mut self,
        actor: &ActorId,
        arms: &[ArmId],
    ) -> Result<BTreeMap<ArmId, ArmCounts>> {
        let wanted: BTreeSet<ArmId> = arms.iter().copied().collect();
        let mut out: BTreeMap<ArmId, ArmCounts> = BTreeMap::new();
        for stat in self.state.statistics.values() {
            if stat.actor != *actor || !wanted.contains(&stat.arm) {
                continue;
            }
            let entry = out.entry(stat.arm).or_default();
            entry.pulls = entry.pulls.saturating_add(stat.pulls);
            entry.successes = entry.successes.saturating_add(stat.successes);
        }
        Ok(out)
    }

    fn open_cycle(
        &mut self,
        who: &Identity,
        arm: ArmId,
        page_offset: usize,
        filters: &CandidateFilter,
    ) -> Result<CycleId> {
        self.undo.push(Undo::LastCycleId(self.state.last_cycle_id));
        self.state.last_cycle_id += 1;
        let id = CycleId(self.state.last_cycle_id);
        self.undo.push(Undo::Cycle(id));
        self.state.cycles.insert(
            id,
            RankingCycle {
                id,
                office: who.office.clone(),
                actor: who.actor.clone(),
                session: who.session.clone(),
                arm,
                page_offset,
                filters: filters.clone(),
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    fn ensure_statistic_row(&mut self, cycle: CycleId, who: &Identity, arm: ArmId) -> Result<()> {
        self.statistic_mut(cycle, who, arm).map(|_| ())
    }

    fn record_impression(&mut self, who: &Identity, arm: ArmId, cycle: CycleId) -> Result<bool> {
        // Check the cycle before touching the impression set.
        self.statistic_mut(cycle, who, arm)?;
        let key = (who.actor.clone(), arm, who.session.clone(), cycle);
        if !self.state.impressions.insert(key.clone()) {
            return Ok(false);
        }
        self.undo.push(Undo::Impression(key));
        let row = self.statistic_mut(cycle, who, arm)?;
        row.pulls = row.pulls.saturating_add(1);
        Ok(true)
    }

    fn record_interaction(
        &mut self,
        who: &Identity,
        arm: ArmId,
        kind: InteractionKind,
        click_increment: u64,
    ) -> Result<InteractionOutcome> {
        let cycle = self
            .state
            .latest_cycle(&who.actor, arm)
            .ok_or_else(|| Error::NoActiveCycle {
                actor: who.actor.clone(),
                arm,
            })?;

        if kind == InteractionKind::Click {
            let already = self.state.interactions.iter().any(|i| {
                i.cycle == cycle
                    && i.actor == who.actor
                    && i.arm == arm
                    && i.kind == InteractionKind::Click
            });
            if already {
                return Ok(InteractionOutcome::DuplicateClickIgnored { cycle });
            }
        }

        let now = Utc::now();
        self.undo.push(Undo::Interactions(self.state.interactions.len()));
        self.state.interactions.push(Interaction {
            cycle,
            office: who.office.clone(),
            actor: who.actor.clone(),
            session: who.session.clone(),
            arm,
            kind,
            created_at: now,
        });
        let row = self.statistic_mut(cycle, who, arm)?;
        match kind {
            InteractionKind::Click => {
                row.successes = row.successes.saturating_add(click_increment)
            }
            InteractionKind::Bookmark => row.bookmarks = row.bookmarks.saturating_add(1),
            InteractionKind::Add => row.adds = row.adds.saturating_add(1),
        }
        row.last_interaction = Some(now);
        Ok(InteractionOutcome::Recorded { cycle, kind })
    }

    fn append_rank_log(&mut self, entries: &[RankLogEntry]) -> Result<()> {
        self.undo.push(Undo::RankLogs(self.state.rank_logs.len()));
        self.state.rank_logs.extend_from_slice(entries);
        Ok(())
    }

    fn cycles_for_actor(&mut self, actor: &ActorId) -> Result<Vec<RankingCycle>> {
        let mut out: Vec<RankingCycle> = self
            .state
            .cycles
            .values()
            .filter(|c| c.actor == *actor)
            .cloned()
            .collect();
        out.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(out)
    }

    fn statistics_for_actor(&mut self, actor: &ActorId) -> Result<Vec<ArmStatistic>> {
        // Keys lead with the cycle id, so iteration is already in cycle order.
        Ok(self
            .state
            .statistics
            .values()
            .filter(|s| s.actor == *actor)
            .cloned()
            .collect())
    }

    fn rank_logs(&mut self, query: &RankLogQuery) -> Result<Vec<RankLogEntry>> {
        let mut out: Vec<RankLogEntry> = self
            .state
            .rank_logs
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        out.sort_by(|a, b| (a.created_at, a.rank).cmp(&(b.created_at, b.rank)));
        Ok(out)
    }

    fn interactions_for_cycle(&mut self, cycle: CycleId) -> Result<Vec<Interaction>> {
        Ok(self
            .state
            .interactions
            .iter()
            .filter(|i| i.cycle == cycle)
            .cloned()
            .collect())
    }

    fn interactions_for_office(&mut self, office: &OfficeId) -> Result<Vec<Interaction>> {
        // Pushed in commit order, so reversing gives newest first.
        Ok(self
            .state
            .interactions
            .iter()
            .rev()
            .filter(|i| i.office == *office)
            .cloned()
            .collect())
    }
}
