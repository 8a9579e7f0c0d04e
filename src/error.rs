//! Error taxonomy for ranking and ledger operations.

use thiserror::Error;

use crate::{ActorId, ArmId};

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the scoring functions, the ledger, and the engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Invalid policy configuration (e.g. exploration constant outside `(0.25, 0.5]`).
    ///
    /// Fatal at config-load time; never recovered at request time.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An interaction arrived for an (actor, arm) pair that has never been ranked.
    #[error("no active ranking cycle for actor {actor} and arm {arm}")]
    NoActiveCycle { actor: ActorId, arm: ArmId },

    /// A storage operation failed; the request transaction was rolled back.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// The session credential is unknown or expired.
    #[error("invalid or expired session")]
    InvalidSession,

    /// The caller sent a malformed request (unknown interaction kind, bad filter, ...).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The candidate provider failed to produce a candidate set.
    #[error("candidate provider error: {0}")]
    Candidates(String),
}

impl Error {
    /// Whether the caller is at fault (maps to a 4xx-class response).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::NoActiveCycle { .. } | Error::InvalidSession | Error::InvalidRequest(_)
        )
    }

    /// Whether the same request may succeed if retried unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Persistence(_) | Error::Candidates(_))
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Persistence(format!("encoding error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_taxonomy() {
        let no_cycle = Error::NoActiveCycle {
            actor: ActorId::from("u1"),
            arm: ArmId(7),
        };
        assert!(no_cycle.is_client_error());
        assert!(!no_cycle.is_retryable());

        let persist = Error::Persistence("disk full".into());
        assert!(persist.is_retryable());
        assert!(!persist.is_client_error());

        let cfg = Error::Configuration("c".into());
        assert!(!cfg.is_client_error());
        assert!(!cfg.is_retryable());
    }

    #[test]
    fn display_names_the_pair() {
        let e = Error::NoActiveCycle {
            actor: ActorId::from("alice"),
            arm: ArmId(42),
        };
        assert_eq!(
            e.to_string(),
            "no active ranking cycle for actor alice and arm 42"
        );
    }
}
