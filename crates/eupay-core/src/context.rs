use std::sync::Arc;

use crate::audit::AuditLog;
use crate::auth_gateway::AuthGateway;
use crate::config::CoreConfig;
use crate::error::{Result, SecurityError};
use crate::identity::IdentityPublisher;
use crate::key_vault::KeyVault;
use crate::passkey::{
    AssertionVerifier, PasskeyLogin, PasskeyProvider, PasskeyRegistration, PasskeyUnlock,
};
use crate::secure_storage::SecureStore;
use crate::session_crypto::SessionCrypto;
use crate::token_store::TokenStore;
use crate::transfer::P2PTransferCoordinator;
use crate::transport::Transport;
use crate::unlock::TicketLedger;

/// Every component, wired once at process start.
pub struct SecurityCore {
    pub config: CoreConfig,
    pub audit: Arc<AuditLog>,
    pub tickets: Arc<TicketLedger>,
    pub vault: Arc<KeyVault>,
    pub identity: Arc<IdentityPublisher>,
    pub session: Arc<SessionCrypto>,
    pub tokens: Arc<TokenStore>,
    pub gateway: Arc<AuthGateway>,
    pub unlock: Arc<PasskeyUnlock>,
    pub login: Arc<PasskeyLogin>,
    pub registration: Arc<PasskeyRegistration>,
    pub transfers: Arc<P2PTransferCoordinator>,
}

impl SecurityCore {
    pub fn new(
        config: CoreConfig,
        store: Arc<dyn SecureStore>,
        passkey: Arc<dyn PasskeyProvider>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| SecurityError::Config(e.to_string()))?;

        let audit = Arc::new(match &config.audit_log_path {
            Some(path) => AuditLog::open(path, config.audit_log_max_bytes)
                .map_err(|e| SecurityError::Config(format!("audit log {}: {e}", path.display())))?,
            None => AuditLog::in_memory(),
        });
        let tickets = TicketLedger::new(config.ticket_ttl());
        let vault = Arc::new(KeyVault::new(store.clone(), tickets.clone(), audit.clone()));
        let session = Arc::new(SessionCrypto::new(vault.clone()));
        let tokens = Arc::new(TokenStore::load(store)?);
        let gateway = Arc::new(AuthGateway::new(
            tokens.clone(),
            transport.clone(),
            config.refresh_skew(),
        ));
        let verifier = Arc::new(AssertionVerifier::new(
            config.relying_party_id.clone(),
            config.require_user_verification,
        ));
        let unlock = Arc::new(PasskeyUnlock::new(passkey.clone(), verifier.clone(), tickets.clone()));
        let login = Arc::new(PasskeyLogin::new(
            passkey.clone(),
            verifier.clone(),
            transport.clone(),
            tokens.clone(),
        ));
        let registration = Arc::new(PasskeyRegistration::new(
            passkey,
            verifier,
            transport.clone(),
            tokens.clone(),
            vault.clone(),
        ));
        let identity = Arc::new(IdentityPublisher::new(
            vault.clone(),
            gateway.clone(),
            transport.clone(),
        ));
        let transfers = Arc::new(P2PTransferCoordinator::new(
            session.clone(),
            gateway.clone(),
            unlock.clone(),
            transport,
        ));

        tracing::info!(
            api = %config.api_base_url,
            authenticated = tokens.current().is_some(),
            "security core ready"
        );
        Ok(Self {
            config,
            audit,
            tickets,
            vault,
            identity,
            session,
            tokens,
            gateway,
            unlock,
            login,
            registration,
            transfers,
        })
    }

    /// Revoke outstanding tickets without touching the session.
    pub fn lock(&self) {
        self.tickets.revoke_all();
        tracing::info!("unlock tickets revoked");
    }

    /// Revoke tickets and drop the token pair.
    pub fn logout(&self) -> Result<()> {
        self.lock();
        self.tokens.invalidate()
    }
}
