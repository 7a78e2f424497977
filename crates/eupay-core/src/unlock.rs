//! Single-use unlock tickets.
//!
//! A ticket is minted after a successful passkey assertion and authorizes
//! exactly one sensitive operation. The ledger is the source of truth: a
//! ticket is valid only while its id is outstanding and unexpired. Dropping
//! a ticket (for example when the owning future is cancelled) revokes it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{Result, SecurityError};

pub struct UnlockTicket {
    id: Uuid,
    ledger_id: Uuid,
    expires_at: Instant,
    ledger: Weak<TicketLedger>,
}

impl UnlockTicket {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

impl fmt::Debug for UnlockTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnlockTicket")
            .field("id", &self.id)
            .field("remaining", &self.remaining())
            .finish()
    }
}

impl Drop for UnlockTicket {
    fn drop(&mut self) {
        if let Some(ledger) = self.ledger.upgrade() {
            ledger.revoke(self.id);
        }
    }
}

pub struct TicketLedger {
    id: Uuid,
    ttl: Duration,
    outstanding: Mutex<HashMap<Uuid, Instant>>,
}

impl TicketLedger {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            ttl,
            outstanding: Mutex::new(HashMap::new()),
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub(crate) fn mint(self: &Arc<Self>) -> UnlockTicket {
        let id = Uuid::new_v4();
        let expires_at = Instant::now() + self.ttl;
        let mut outstanding = self.outstanding.lock();
        outstanding.retain(|_, exp| *exp > Instant::now());
        outstanding.insert(id, expires_at);
        UnlockTicket {
            id,
            ledger_id: self.id,
            expires_at,
            ledger: Arc::downgrade(self),
        }
    }

    /// Consume the ticket. Any second use, expiry, or foreign ticket is `Locked`.
    pub fn redeem(&self, ticket: &UnlockTicket) -> Result<()> {
        if ticket.ledger_id != self.id {
            return Err(SecurityError::Locked);
        }
        let expires_at = self
            .outstanding
            .lock()
            .remove(&ticket.id)
            .ok_or(SecurityError::Locked)?;
        if Instant::now() >= expires_at {
            return Err(SecurityError::Locked);
        }
        Ok(())
    }

    pub fn revoke(&self, id: Uuid) {
        self.outstanding.lock().remove(&id);
    }

    pub fn revoke_all(&self) {
        self.outstanding.lock().clear();
    }

    /// Count of unexpired, unused tickets.
    pub fn outstanding(&self) -> usize {
        let now = Instant::now();
        self.outstanding
            .lock()
            .values()
            .filter(|exp| **exp > now)
            .count()
    }
}
