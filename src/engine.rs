//! Ranking-cycle orchestration.
//!
//! One request moves through [`Stage`]s in a fixed order. Everything from
//! loading statistics to logging impressions runs inside a single ledger
//! transaction, so a failure at any stage leaves no cycle, statistic row, or
//! impression behind. Counts are read once, before any write, which freezes
//! the time index `t` at its value when the request started.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};

use crate::candidates::{Candidate, CandidateFilter, CandidateProvider};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::identity::{Identity, IdentityResolver};
use crate::ledger::{InteractionKind, InteractionOutcome, Ledger, LedgerTx, RankLogEntry};
use crate::rank::{rank_with_context, time_index, ArmCounts, RankedArm};
use crate::score::BanditContext;
use crate::{ArmId, CycleId};

/// Orchestrator states, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    AuthenticateActor,
    LoadCandidates,
    LoadStatistics,
    Rank,
    Paginate,
    PersistCycles,
    RecordImpressions,
    Respond,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One returned arm with its display metadata and the cycle that exposed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedCandidate {
    pub candidate: Candidate,
    /// 1-based position in the full ranking.
    pub rank: usize,
    pub score: f64,
    /// Aggregate counts the score was computed from.
    pub counts: ArmCounts,
    pub cycle: CycleId,
}

/// One page of a ranking.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RankedPage {
    pub items: Vec<RankedCandidate>,
    /// Number of distinct candidates ranked, independent of the page window.
    pub total_count: usize,
    pub offset: usize,
    pub limit: usize,
}

impl RankedPage {
    fn empty(offset: usize, limit: usize) -> Self {
        Self {
            items: Vec::new(),
            total_count: 0,
            offset,
            limit,
        }
    }

    pub fn arms(&self) -> Vec<ArmId> {
        self.items.iter().map(|i| i.candidate.arm).collect()
    }
}

/// The ranking engine: a validated config plus its three collaborators.
#[derive(Debug)]
pub struct Engine<L, P, R> {
    config: EngineConfig,
    ledger: L,
    candidates: P,
    identity: R,
}

impl<L, P, R> Engine<L, P, R>
where
    L: Ledger,
    P: CandidateProvider,
    R: IdentityResolver,
{
    /// Build an engine; fails with [`crate::Error::Configuration`] on an invalid config.
    pub fn new(config: EngineConfig, ledger: L, candidates: P, identity: R) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            ledger,
            candidates,
            identity,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    /// Rank every candidate matching `filter` for `who` and return the page
    /// `[offset, offset + limit)`.
    ///
    /// Opens one ranking cycle per returned arm and logs one impression for
    /// it. Zero matching candidates is not an error: the page is empty with
    /// `total_count = 0` and nothing is written.
    pub fn rank_and_paginate(
        &self,
        who: &Identity,
        filter: &CandidateFilter,
        offset: usize,
        limit: usize,
    ) -> Result<RankedPage> {
        let span = info_span!("rank_cycle", actor = %who.actor, office = %who.office);
        let _enter = span.enter();

        let mut stage = Stage::LoadCandidates;
        let result = self.run_cycle(who, filter, offset, limit, &mut stage);
        match &result {
            Ok(page) => {
                debug!(stage = ?Stage::Respond, "stage");
                info!(
                    returned = page.items.len(),
                    total = page.total_count,
                    offset,
                    limit,
                    "ranked"
                );
            }
            Err(err) => warn!(stage = ?stage, error = %err, "ranking cycle failed"),
        }
        result
    }

    /// [`Engine::rank_and_paginate`] for a session credential.
    ///
    /// `limit = None` uses the configured default page size.
    pub fn rank_for_session(
        &self,
        credential: &str,
        filter: &CandidateFilter,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<RankedPage> {
        debug!(stage = ?Stage::AuthenticateActor, "stage");
        let who = self.identity.resolve(credential).map_err(|err| {
            warn!(stage = ?Stage::AuthenticateActor, error = %err, "ranking cycle failed");
            err
        })?;
        self.rank_and_paginate(&who, filter, offset, limit.unwrap_or(self.config.default_limit))
    }

    /// Attribute an interaction to the newest cycle of `(who.actor, arm)`.
    pub fn record_interaction(
        &self,
        who: &Identity,
        arm: ArmId,
        kind: InteractionKind,
    ) -> Result<InteractionOutcome> {
        let span = info_span!("interaction", actor = %who.actor, arm = %arm, kind = %kind);
        let _enter = span.enter();

        let increment = self.config.click_increment;
        let result = self
            .ledger
            .transaction(|tx| tx.record_interaction(who, arm, kind, increment));
        match &result {
            Ok(InteractionOutcome::DuplicateClickIgnored { cycle }) => {
                debug!(cycle = %cycle, "duplicate click ignored");
            }
            Ok(InteractionOutcome::Recorded { cycle, .. }) => {
                debug!(cycle = %cycle, "interaction recorded");
            }
            Err(err) if err.is_client_error() => debug!(error = %err, "interaction rejected"),
            Err(err) => warn!(error = %err, "interaction failed"),
        }
        result
    }

    /// [`Engine::record_interaction`] for a session credential and a wire kind
    /// (`click`, `bookmark`, `add`).
    pub fn interact_for_session(
        &self,
        credential: &str,
        arm: ArmId,
        kind: &str,
    ) -> Result<InteractionOutcome> {
        let who = self.identity.resolve(credential)?;
        let kind: InteractionKind = kind.parse()?;
        self.record_interaction(&who, arm, kind)
    }

    fn run_cycle(
        &self,
        who: &Identity,
        filter: &CandidateFilter,
        offset: usize,
        limit: usize,
        stage: &mut Stage,
    ) -> Result<RankedPage> {
        enter(stage, Stage::LoadCandidates);
        let candidates = dedup_by_arm(self.candidates.candidates(filter)?);
        if candidates.is_empty() {
            debug!("no candidates match filter");
            return Ok(RankedPage::empty(offset, limit));
        }
        let arms: Vec<ArmId> = candidates.iter().map(|c| c.arm).collect();
        let mut by_arm: BTreeMap<ArmId, Candidate> =
            candidates.into_iter().map(|c| (c.arm, c)).collect();

        let config = &self.config;
        let placed = self.ledger.transaction(|tx| {
            enter(stage, Stage::LoadStatistics);
            let counts = tx.load_aggregate_counts(&who.actor, &arms)?;

            enter(stage, Stage::Rank);
            let ctx = BanditContext {
                t: time_index(&arms, &counts),
                c: config.exploration,
                tol: config.tolerance,
            };
            let ranked = rank_with_context(&arms, &counts, &ctx);
            debug!(t = ctx.t, candidates = ranked.len(), "scored");
            if config.rank_log_enabled {
                tx.append_rank_log(&rank_log_rows(who, filter, &ctx, &ranked))?;
            }

            enter(stage, Stage::Paginate);
            let total = ranked.len();
            let page: Vec<(usize, RankedArm)> = ranked
                .into_iter()
                .enumerate()
                .skip(offset)
                .take(limit)
                .collect();

            enter(stage, Stage::PersistCycles);
            let cycles = persist_cycles(tx, who, filter, offset, &page)?;

            enter(stage, Stage::RecordImpressions);
            for ((_, ranked), cycle) in page.iter().zip(&cycles) {
                if !tx.record_impression(who, ranked.arm, *cycle)? {
                    debug!(arm = %ranked.arm, cycle = %cycle, "impression already logged");
                }
            }
            Ok((total, page, cycles))
        })?;

        let (total_count, page, cycles) = placed;
        let mut items = Vec::with_capacity(page.len());
        for ((idx, ranked), cycle) in page.into_iter().zip(cycles) {
            if let Some(candidate) = by_arm.remove(&ranked.arm) {
                items.push(RankedCandidate {
                    candidate,
                    rank: idx + 1,
                    score: ranked.score,
                    counts: ranked.counts,
                    cycle,
                });
            }
        }
        Ok(RankedPage {
            items,
            total_count,
            offset,
            limit,
        })
    }
}

fn enter(stage: &mut Stage, next: Stage) {
    *stage = next;
    debug!(stage = ?next, "stage");
}

/// Keep the first occurrence of every arm, preserving provider order.
fn dedup_by_arm(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut seen = BTreeSet::new();
    candidates
        .into_iter()
        .filter(|c| seen.insert(c.arm))
        .collect()
}

fn persist_cycles(
    tx: &mut dyn LedgerTx,
    who: &Identity,
    filter: &CandidateFilter,
    offset: usize,
    page: &[(usize, RankedArm)],
) -> Result<Vec<CycleId>> {
    let mut cycles = Vec::with_capacity(page.len());
    for (_, ranked) in page {
        let cycle = tx.open_cycle(who, ranked.arm, offset, filter)?;
        tx.ensure_statistic_row(cycle, who, ranked.arm)?;
        cycles.push(cycle);
    }
    Ok(cycles)
}

fn rank_log_rows(
    who: &Identity,
    filter: &CandidateFilter,
    ctx: &BanditContext,
    ranked: &[RankedArm],
) -> Vec<RankLogEntry> {
    let created_at = Utc::now();
    ranked
        .iter()
        .enumerate()
        .map(|(idx, r)| RankLogEntry {
            office: who.office.clone(),
            actor: who.actor.clone(),
            session: who.session.clone(),
            arm: r.arm,
            rank: idx + 1,
            pulls: r.counts.pulls,
            successes: r.counts.successes,
            ucb: r.score,
            t: ctx.t,
            c: ctx.c.get(),
            topics: filter.topics.clone(),
            date_min: filter.date_min,
            created_at,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidates::InMemoryCatalog;
    use crate::identity::SessionTable;
    use crate::ledger::{InMemoryLedger, RankLogQuery};
    use crate::{ActorId, Error};
    use chrono::Duration;

    type TestEngine = Engine<InMemoryLedger, InMemoryCatalog, SessionTable>;

    fn engine_with(config: EngineConfig, arms: &[i64]) -> TestEngine {
        let catalog = InMemoryCatalog::new(
            arms.iter()
                .map(|&a| Candidate::new(ArmId(a), format!("article {a}"))),
        );
        Engine::new(config, InMemoryLedger::new(), catalog, SessionTable::new()).unwrap()
    }

    fn who() -> Identity {
        Identity::new("u1", "office-a", "s1")
    }

    #[test]
    fn invalid_config_is_rejected_at_construction() {
        for inc in [0, u64::MAX] {
            let config = EngineConfig::default().with_click_increment(inc);
            let err = Engine::new(
                config,
                InMemoryLedger::new(),
                InMemoryCatalog::default(),
                SessionTable::new(),
            )
            .unwrap_err();
            assert!(matches!(err, Error::Configuration(_)), "{inc}: {err:?}");
        }
    }

    #[test]
    fn empty_candidate_set_is_an_empty_page() {
        let engine = engine_with(EngineConfig::default(), &[]);
        let page = engine
            .rank_and_paginate(&who(), &CandidateFilter::default(), 0, 10)
            .unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.total_count, 0);
    }

    #[test]
    fn page_past_the_end_writes_nothing() {
        let engine = engine_with(EngineConfig::default(), &[1, 2, 3]);
        let page = engine
            .rank_and_paginate(&who(), &CandidateFilter::default(), 5, 10)
            .unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.total_count, 3);
        let cycles = engine
            .ledger()
            .transaction(|tx| tx.cycles_for_actor(&ActorId::from("u1")))
            .unwrap();
        assert!(cycles.is_empty());
    }

    #[test]
    fn ranks_are_positions_in_the_full_ranking() {
        let engine = engine_with(EngineConfig::default(), &[1, 2, 3, 4]);
        let page = engine
            .rank_and_paginate(&who(), &CandidateFilter::default(), 2, 2)
            .unwrap();
        let ranks: Vec<usize> = page.items.iter().map(|i| i.rank).collect();
        assert_eq!(ranks, vec![3, 4]);
        assert_eq!(page.arms(), vec![ArmId(3), ArmId(4)]);
    }

    #[test]
    fn duplicate_candidates_are_ranked_once() {
        let catalog = InMemoryCatalog::new([
            Candidate::new(ArmId(1), "first"),
            Candidate::new(ArmId(1), "dup"),
            Candidate::new(ArmId(2), "second"),
        ]);
        let engine = Engine::new(
            EngineConfig::default(),
            InMemoryLedger::new(),
            catalog,
            SessionTable::new(),
        )
        .unwrap();
        let page = engine
            .rank_and_paginate(&who(), &CandidateFilter::default(), 0, 10)
            .unwrap();
        assert_eq!(page.total_count, 2);
        assert_eq!(page.items[0].candidate.title, "first");
    }

    #[test]
    fn rank_log_covers_every_candidate_when_enabled() {
        let engine = engine_with(EngineConfig::default().with_rank_log(), &[1, 2, 3]);
        engine
            .rank_and_paginate(&who(), &CandidateFilter::default(), 0, 1)
            .unwrap();
        let rows = engine
            .ledger()
            .transaction(|tx| tx.rank_logs(&RankLogQuery::for_actor("u1")))
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.t == 1.0 && r.c == 0.26 && r.ucb == 1.0));
        assert_eq!(rows.iter().map(|r| r.rank).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn rank_log_is_off_by_default() {
        let engine = engine_with(EngineConfig::default(), &[1, 2]);
        engine
            .rank_and_paginate(&who(), &CandidateFilter::default(), 0, 2)
            .unwrap();
        let rows = engine
            .ledger()
            .transaction(|tx| tx.rank_logs(&RankLogQuery::default()))
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn session_entry_points_resolve_credentials() {
        let engine = engine_with(EngineConfig::default().with_default_limit(2), &[1, 2, 3]);
        engine
            .identity
            .insert("tok", who(), Utc::now() + Duration::hours(1));

        let err = engine
            .rank_for_session("bad", &CandidateFilter::default(), 0, None)
            .unwrap_err();
        assert_eq!(err, Error::InvalidSession);

        let page = engine
            .rank_for_session("tok", &CandidateFilter::default(), 0, None)
            .unwrap();
        assert_eq!(page.items.len(), 2);

        let outcome = engine.interact_for_session("tok", ArmId(1), "click").unwrap();
        assert!(matches!(outcome, InteractionOutcome::Recorded { .. }));
        let err = engine
            .interact_for_session("tok", ArmId(1), "share")
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn interaction_without_cycle_is_a_client_error() {
        let engine = engine_with(EngineConfig::default(), &[1]);
        let err = engine
            .record_interaction(&who(), ArmId(1), InteractionKind::Click)
            .unwrap_err();
        assert!(err.is_client_error());
        assert_eq!(
            err,
            Error::NoActiveCycle {
                actor: ActorId::from("u1"),
                arm: ArmId(1)
            }
        );
    }

    #[test]
    fn clicked_arm_overtakes_ignored_arms() {
        let engine = engine_with(EngineConfig::default(), &[1, 2, 3]);
        let f = CandidateFilter::default();
        // Show everything a few times; click arm 3 each round.
        for _ in 0..4 {
            engine.rank_and_paginate(&who(), &f, 0, 3).unwrap();
            engine
                .record_interaction(&who(), ArmId(3), InteractionKind::Click)
                .unwrap();
        }
        let page = engine.rank_and_paginate(&who(), &f, 0, 3).unwrap();
        assert_eq!(page.items[0].candidate.arm, ArmId(3));
        assert_eq!(page.items[0].counts, ArmCounts::new(4, 4));
        assert!(page.items[1].score < page.items[0].score);
    }
}
