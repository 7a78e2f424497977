//! Keeps the server's copy of this device's public identity current.
//!
//! Peers encrypt to whatever key the server hands out, so every local
//! provisioning, rotation or recovery is followed by a publication. A
//! publication that fails after a rotation leaves the new key local only;
//! `publish` can be called again once the session is back.

use std::sync::Arc;

use crate::auth_gateway::AuthGateway;
use crate::error::Result;
use crate::key_vault::KeyVault;
use crate::keys::IdentityPublicKey;
use crate::transport::Transport;
use crate::unlock::UnlockTicket;

pub struct IdentityPublisher {
    vault: Arc<KeyVault>,
    gateway: Arc<AuthGateway>,
    transport: Arc<dyn Transport>,
}

impl IdentityPublisher {
    pub fn new(vault: Arc<KeyVault>, gateway: Arc<AuthGateway>, transport: Arc<dyn Transport>) -> Self {
        Self {
            vault,
            gateway,
            transport,
        }
    }

    /// Ensure an identity exists and that the server holds its public half.
    pub async fn provision(&self) -> Result<IdentityPublicKey> {
        let public = self.vault.ensure_identity()?;
        self.upload(public).await?;
        Ok(public)
    }

    /// Re-send the current public identity. Never provisions.
    pub async fn publish(&self) -> Result<IdentityPublicKey> {
        let public = self.vault.require_public()?;
        self.upload(public).await?;
        Ok(public)
    }

    /// Rotate the identity and publish the new key.
    pub async fn rotate(&self, ticket: &UnlockTicket) -> Result<IdentityPublicKey> {
        let public = self.vault.reset_identity(ticket)?;
        self.upload(public).await?;
        Ok(public)
    }

    /// Replace a corrupted identity and publish the new key.
    pub async fn recover(&self, ticket: &UnlockTicket) -> Result<IdentityPublicKey> {
        let public = self.vault.recover_corrupted(ticket)?;
        self.upload(public).await?;
        Ok(public)
    }

    async fn upload(&self, public: IdentityPublicKey) -> Result<()> {
        let result = self
            .gateway
            .execute("publish_identity", |bearer| {
                let transport = self.transport.clone();
                async move { transport.publish_identity(&bearer, &public).await }
            })
            .await;
        match &result {
            Ok(()) => tracing::info!(fingerprint = %public.fingerprint(), "identity published"),
            Err(err) => tracing::warn!(
                fingerprint = %public.fingerprint(),
                error = %err,
                "identity not published"
            ),
        }
        result
    }
}
