//! Bearer token custody.
//!
//! The cached pair and the secure-store slot change together under one write
//! lock, so `current()` sees either the old pair or the new one.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{Result, SecurityError};
use crate::secure_storage::{SecureStore, Slot};

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expiry: DateTime<Utc>,
}

impl TokenPair {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        access_expiry: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            access_expiry,
        }
    }

    /// True once `now + skew` reaches the access expiry.
    pub fn is_expired(&self, skew: chrono::Duration) -> bool {
        Utc::now() + skew >= self.access_expiry
    }
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("access_expiry", &self.access_expiry)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenState {
    Unauthenticated,
    Authenticated,
    Refreshing,
}

#[derive(Serialize, Deserialize)]
struct StoredSession {
    #[serde(flatten)]
    pair: TokenPair,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
}

struct Session {
    pair: Option<TokenPair>,
    user_id: Option<String>,
    state: TokenState,
}

pub struct TokenStore {
    store: Arc<dyn SecureStore>,
    session: RwLock<Session>,
}

impl TokenStore {
    /// Empty store; the slot is not read.
    pub fn new(store: Arc<dyn SecureStore>) -> Self {
        Self {
            store,
            session: RwLock::new(Session {
                pair: None,
                user_id: None,
                state: TokenState::Unauthenticated,
            }),
        }
    }

    /// Restore a previously persisted session. An unreadable slot is
    /// surfaced; an unparseable one is discarded.
    pub fn load(store: Arc<dyn SecureStore>) -> Result<Self> {
        let this = Self::new(store);
        let Some(bytes) = this.store.get(Slot::TokenPair)? else {
            return Ok(this);
        };
        match serde_json::from_slice::<StoredSession>(&bytes) {
            Ok(stored) => {
                let mut session = this.session.write();
                session.pair = Some(stored.pair);
                session.user_id = stored.user_id;
                session.state = TokenState::Authenticated;
            }
            Err(err) => {
                tracing::warn!(error = %err, "discarding unreadable token slot");
                this.store.delete(Slot::TokenPair)?;
            }
        }
        Ok(this)
    }

    pub fn current(&self) -> Option<TokenPair> {
        self.session.read().pair.clone()
    }

    pub fn user_id(&self) -> Option<String> {
        self.session.read().user_id.clone()
    }

    pub fn state(&self) -> TokenState {
        self.session.read().state
    }

    /// Persist and publish a new pair, keeping the current user id.
    pub fn replace(&self, pair: TokenPair) -> Result<()> {
        let user_id = self.session.read().user_id.clone();
        self.replace_session(pair, user_id)
    }

    /// Persist and publish a new pair and user id. On storage failure the
    /// previous pair remains current.
    pub fn replace_session(&self, pair: TokenPair, user_id: Option<String>) -> Result<()> {
        let stored = StoredSession { pair, user_id };
        let json = Zeroizing::new(serde_json::to_vec(&stored)?);

        let mut session = self.session.write();
        if let Err(err) = self.store.put(Slot::TokenPair, &json) {
            tracing::warn!(error = %err, "token pair write failed; keeping previous pair");
            return Err(SecurityError::Storage(err));
        }
        let expiry = stored.pair.access_expiry;
        session.pair = Some(stored.pair);
        session.user_id = stored.user_id;
        session.state = TokenState::Authenticated;
        tracing::debug!(%expiry, "token pair replaced");
        Ok(())
    }

    /// Drop the session. Memory is cleared even if the slot delete fails.
    pub fn invalidate(&self) -> Result<()> {
        let mut session = self.session.write();
        session.pair = None;
        session.user_id = None;
        session.state = TokenState::Unauthenticated;
        self.store.delete(Slot::TokenPair)?;
        tracing::info!("token pair invalidated");
        Ok(())
    }

    /// Enter `Refreshing`. Returns false when there is nothing to refresh.
    pub(crate) fn begin_refresh(&self) -> bool {
        let mut session = self.session.write();
        match session.state {
            TokenState::Unauthenticated => false,
            TokenState::Authenticated | TokenState::Refreshing => {
                session.state = TokenState::Refreshing;
                true
            }
        }
    }

    /// Leave `Refreshing` without a new pair.
    pub(crate) fn abort_refresh(&self) {
        let mut session = self.session.write();
        if session.state == TokenState::Refreshing {
            session.state = if session.pair.is_some() {
                TokenState::Authenticated
            } else {
                TokenState::Unauthenticated
            };
        }
    }
}
