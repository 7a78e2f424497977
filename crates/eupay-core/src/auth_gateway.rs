//! Bearer attachment and single-flight token refresh.
//!
//! Every refresh bumps `epoch`. A call that was rejected compares the epoch
//! it observed before sending with the current one: if another caller has
//! refreshed in between, it reuses that outcome instead of starting its own.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::{Result, SecurityError, StoreError, TransportError};
use crate::token_store::TokenStore;
use crate::transport::Transport;

#[derive(Debug, Clone)]
enum RefreshOutcome {
    Refreshed,
    Rejected,
    TransportFailed(TransportError),
    StoreFailed(StoreError),
}

/// Puts the token store back from `Refreshing` if the refresh future is
/// dropped before it completes.
struct RefreshGuard<'a> {
    tokens: &'a TokenStore,
    armed: bool,
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!("refresh cancelled; reverting token state");
            self.tokens.abort_refresh();
        }
    }
}

pub struct AuthGateway {
    tokens: Arc<TokenStore>,
    transport: Arc<dyn Transport>,
    skew: chrono::Duration,
    epoch: AtomicU64,
    last_refresh: Mutex<Option<RefreshOutcome>>,
}

impl AuthGateway {
    pub fn new(tokens: Arc<TokenStore>, transport: Arc<dyn Transport>, skew: chrono::Duration) -> Self {
        Self {
            tokens,
            transport,
            skew,
            epoch: AtomicU64::new(0),
            last_refresh: Mutex::new(None),
        }
    }

    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    /// Run `call` with the current access token. On `Unauthorized` the
    /// token is refreshed (at most one refresh in flight) and `call` is
    /// replayed once; a second rejection is `Unauthenticated`.
    pub async fn execute<T, F, Fut>(&self, operation: &str, call: F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let (token, epoch) = self.bearer().await?;
        match call(token).await {
            Ok(value) => Ok(value),
            Err(TransportError::Unauthorized) => {
                tracing::debug!(operation, "authorization rejected; refreshing");
                let (token, _) = self.refresh_after(epoch).await?;
                match call(token).await {
                    Ok(value) => Ok(value),
                    Err(TransportError::Unauthorized) => {
                        tracing::warn!(operation, "rejected again after refresh");
                        Err(SecurityError::Unauthenticated)
                    }
                    Err(err) => Err(err.into()),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Access token for the next request, refreshed first when it is within
    /// the skew window of expiry.
    async fn bearer(&self) -> Result<(String, u64)> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let pair = self.tokens.current().ok_or(SecurityError::Unauthenticated)?;
        if pair.is_expired(self.skew) {
            tracing::debug!(expiry = %pair.access_expiry, "access token near expiry");
            return self.refresh_after(epoch).await;
        }
        Ok((pair.access_token, epoch))
    }

    async fn refresh_after(&self, seen_epoch: u64) -> Result<(String, u64)> {
        let mut last = self.last_refresh.lock().await;
        let current = self.epoch.load(Ordering::SeqCst);
        if current != seen_epoch {
            let outcome = last.clone();
            return self.settle(outcome, current);
        }

        if !self.tokens.begin_refresh() {
            return Err(SecurityError::Unauthenticated);
        }
        let mut guard = RefreshGuard {
            tokens: &self.tokens,
            armed: true,
        };
        let refresh_token = match self.tokens.current() {
            Some(pair) => pair.refresh_token,
            None => return Err(SecurityError::Unauthenticated),
        };

        let outcome = match self.transport.refresh_tokens(&refresh_token).await {
            Ok(grant) => match grant.into_pair(Utc::now()) {
                Ok((pair, user_id)) => {
                    let user_id = user_id.or_else(|| self.tokens.user_id());
                    match self.tokens.replace_session(pair, user_id) {
                        Ok(()) => RefreshOutcome::Refreshed,
                        Err(SecurityError::Storage(err)) => RefreshOutcome::StoreFailed(err),
                        Err(other) => {
                            RefreshOutcome::StoreFailed(StoreError::WriteFailed(other.to_string()))
                        }
                    }
                }
                Err(err) => RefreshOutcome::TransportFailed(err),
            },
            Err(TransportError::Unauthorized) => {
                if let Err(err) = self.tokens.invalidate() {
                    tracing::error!(error = %err, "failed to clear rejected token pair");
                }
                RefreshOutcome::Rejected
            }
            Err(err) => RefreshOutcome::TransportFailed(err),
        };
        guard.armed = false;
        if !matches!(outcome, RefreshOutcome::Refreshed | RefreshOutcome::Rejected) {
            self.tokens.abort_refresh();
        }

        tracing::info!(outcome = ?outcome, "token refresh finished");
        *last = Some(outcome.clone());
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.settle(Some(outcome), epoch)
    }

    fn settle(&self, outcome: Option<RefreshOutcome>, epoch: u64) -> Result<(String, u64)> {
        match outcome {
            Some(RefreshOutcome::Refreshed) => self
                .tokens
                .current()
                .map(|pair| (pair.access_token, epoch))
                .ok_or(SecurityError::Unauthenticated),
            Some(RefreshOutcome::TransportFailed(err)) => Err(SecurityError::Transport(err)),
            Some(RefreshOutcome::StoreFailed(err)) => Err(SecurityError::Storage(err)),
            Some(RefreshOutcome::Rejected) | None => Err(SecurityError::Unauthenticated),
        }
    }
}
