//! Session-to-identity resolution.
//!
//! Authentication itself lives outside this crate; the engine only needs to
//! turn an opaque credential into `(actor, office, session)` or learn that the
//! credential is invalid.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::{ActorId, OfficeId, SessionId};

/// Who a ranking request is for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub actor: ActorId,
    pub office: OfficeId,
    pub session: SessionId,
}

impl Identity {
    pub fn new(
        actor: impl Into<ActorId>,
        office: impl Into<OfficeId>,
        session: impl Into<SessionId>,
    ) -> Self {
        Self {
            actor: actor.into(),
            office: office.into(),
            session: session.into(),
        }
    }
}

/// Resolves a session credential to an [`Identity`].
pub trait IdentityResolver {
    /// Returns [`Error::InvalidSession`] for unknown or expired credentials.
    fn resolve(&self, credential: &str) -> Result<Identity>;
}

#[derive(Debug, Clone)]
struct SessionEntry {
    identity: Identity,
    expires_at: DateTime<Utc>,
}

/// In-process session table with expiry.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a credential.
    pub fn insert(
        &self,
        credential: impl Into<String>,
        identity: Identity,
        expires_at: DateTime<Utc>,
    ) {
        self.sessions.write().insert(
            credential.into(),
            SessionEntry {
                identity,
                expires_at,
            },
        );
    }

    /// Drop a credential (logout). Returns whether it existed.
    pub fn revoke(&self, credential: &str) -> bool {
        self.sessions.write().remove(credential).is_some()
    }

    /// Resolve against an explicit clock.
    pub fn resolve_at(&self, credential: &str, now: DateTime<Utc>) -> Result<Identity> {
        let sessions = self.sessions.read();
        match sessions.get(credential) {
            Some(entry) if entry.expires_at > now => Ok(entry.identity.clone()),
            _ => Err(Error::InvalidSession),
        }
    }
}

impl IdentityResolver for SessionTable {
    fn resolve(&self, credential: &str) -> Result<Identity> {
        self.resolve_at(credential, Utc::now())
    }
}
