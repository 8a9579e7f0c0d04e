//! `ucbrank`: Hellinger-UCB ranking of candidate items per actor, with a
//! transactional ledger of per-arm statistics.
//!
//! Designed for "rank a pool of articles for this user" problems: every
//! request scores each candidate arm by an optimistic estimate of its click
//! probability, returns one page of the sorted list, and records which arms
//! were shown so later clicks can be attributed to the ranking decision that
//! exposed them.
//!
//! **Layers, leaves first:**
//! - [`hellinger_squared`]: squared Hellinger distance between two Bernoulli parameters.
//! - [`find_hellinger_ucb`]: bisection for the upper end of the Hellinger ball around `p̂`.
//! - [`hellinger_ucb`] / [`BanditContext`]: per-arm score from `(N, S, t, c)`.
//! - [`rank_articles`] / [`rank_with_context`]: stable descending sort by score.
//! - [`Ledger`] / [`LedgerTx`]: persisted counters ([`InMemoryLedger`], and
//!   `SqliteLedger` with the `sqlite` feature).
//! - [`Engine`]: one ranking cycle per request (load counts, rank, paginate,
//!   open cycles, log impressions) inside one ledger transaction.
//!
//! **Counting semantics:**
//! - One *ranking cycle* is opened per arm returned on a page.
//! - An impression is logged at most once per `(actor, arm, session, cycle)`;
//!   a repeated impression never bumps `pulls` twice.
//! - The first click per cycle adds to `successes`; later clicks on the same
//!   cycle are ignored. Bookmarks and adds are cumulative.
//!
//! **Non-goals:**
//! - Not a general bandit framework (no contextual policies, no A/B routing).
//! - No cross-database consistency beyond one transaction per request.
//!
//! # The score
//!
//! ```text
//!   α(N, t) = 1 − exp(−c · ln(t + 1) / N)
//!   UCB     = sup { q ∈ [0,1] : H²(S/N, q) ≤ α }
//! ```
//!
//! `t` is the actor's total pulls over the candidate set (floored at 1) and
//! `c ∈ (0.25, 0.5]` trades exploitation (low `c`) for exploration (high `c`).
//! Cold arms score exactly `1.0`.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

mod error;
pub use error::*;

mod hellinger;
pub use hellinger::*;

mod score;
pub use score::*;

mod rank;
pub use rank::*;

mod config;
pub use config::*;

pub mod candidates;
pub use candidates::{Candidate, CandidateFilter, CandidateProvider, InMemoryCatalog};

pub mod identity;
pub use identity::{Identity, IdentityResolver, SessionTable};

pub mod ledger;
pub use ledger::{
    ArmStatistic, InMemoryLedger, Interaction, InteractionKind, InteractionOutcome, Ledger,
    LedgerTx, RankLogEntry, RankLogQuery, RankingCycle,
};
#[cfg(feature = "sqlite")]
pub use ledger::SqliteLedger;

mod engine;
pub use engine::*;

pub mod report;

/// Crate version, for embedding in logs and rank-log rows.
pub const UCBRANK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Opaque, stable identifier of an arm (an article).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArmId(pub i64);

impl fmt::Display for ArmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a persisted ranking cycle ("pull").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CycleId(pub i64);

impl fmt::Display for CycleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// The user being ranked for.
    ActorId
);
string_id!(
    /// The office (tenant) an actor belongs to.
    OfficeId
);
string_id!(
    /// One authenticated session of an actor.
    SessionId
);
