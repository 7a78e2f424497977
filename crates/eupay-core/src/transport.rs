//! Server capability consumed by the core.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TransportError;
use crate::keys::{IdentityPublicKey, PeerPublicKey};
use crate::passkey::{AssertionResponse, AttestationResponse};
use crate::payload::EncryptedPayload;
use crate::token_store::TokenPair;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerKeyRecord {
    pub account_id: String,
    pub public_key: PeerPublicKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSubmission {
    pub transfer_id: Uuid,
    pub recipient: String,
    pub payload: EncryptedPayload,
    /// SHA-256 of the payload wire bytes, hex.
    pub payload_digest: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Accepted,
    Queued,
    Rejected,
}

impl ReceiptStatus {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ReceiptStatus::Accepted | ReceiptStatus::Queued)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub transfer_id: Uuid,
    pub status: ReceiptStatus,
    pub payload_digest: String,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Challenge issued by the public passkey login endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginChallenge {
    /// Opaque server handle echoed back on completion.
    pub challenge_token: String,
    /// 32 random bytes, base64url without padding.
    pub challenge: String,
    #[serde(default)]
    pub rp_id: Option<String>,
}

/// Sign-up request for the public passkey registration endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationRequest {
    /// Empty lets the server derive one from the identity.
    pub display_name: String,
    pub gdpr_consent: bool,
    pub privacy_policy_version: String,
    pub identity: IdentityPublicKey,
}

/// Creation challenge for a new account's passkey.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationChallenge {
    pub challenge_token: String,
    /// 32 random bytes, base64url without padding.
    pub challenge: String,
    #[serde(default)]
    pub rp_id: Option<String>,
    /// WebAuthn user handle, base64url.
    pub user_handle: String,
}

/// Tokens issued by login or refresh.
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    /// Access token lifetime in seconds.
    pub expires_in: i64,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Longest access token lifetime accepted from the server.
pub const MAX_TOKEN_LIFETIME_SECS: i64 = 7 * 24 * 60 * 60;

impl TokenGrant {
    /// Anchor the grant at `issued_at`. A lifetime that is not positive or
    /// exceeds `MAX_TOKEN_LIFETIME_SECS` is rejected as undecodable.
    pub fn into_pair(
        self,
        issued_at: DateTime<Utc>,
    ) -> Result<(TokenPair, Option<String>), TransportError> {
        if !(1..=MAX_TOKEN_LIFETIME_SECS).contains(&self.expires_in) {
            return Err(TransportError::Decode(format!(
                "token lifetime {}s out of range",
                self.expires_in
            )));
        }
        let expiry = TimeDelta::try_seconds(self.expires_in)
            .and_then(|lifetime| issued_at.checked_add_signed(lifetime))
            .ok_or_else(|| TransportError::Decode("token expiry overflows".into()))?;
        Ok((
            TokenPair::new(self.access_token, self.refresh_token, expiry),
            self.user_id,
        ))
    }
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("expires_in", &self.expires_in)
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

/// REST operations the core needs. Implementations report 401/403 as
/// `TransportError::Unauthorized` and leave retry policy to the caller.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch_peer_key(
        &self,
        bearer: &str,
        account_id: &str,
    ) -> Result<PeerKeyRecord, TransportError>;

    async fn submit_transfer(
        &self,
        bearer: &str,
        submission: &TransferSubmission,
    ) -> Result<TransferReceipt, TransportError>;

    async fn refresh_tokens(&self, refresh_token: &str) -> Result<TokenGrant, TransportError>;

    async fn login_options(&self) -> Result<LoginChallenge, TransportError>;

    async fn complete_login(
        &self,
        challenge_token: &str,
        assertion: &AssertionResponse,
    ) -> Result<TokenGrant, TransportError>;

    async fn registration_options(
        &self,
        request: &RegistrationRequest,
    ) -> Result<RegistrationChallenge, TransportError>;

    async fn complete_registration(
        &self,
        challenge_token: &str,
        attestation: &AttestationResponse,
    ) -> Result<TokenGrant, TransportError>;

    /// Replace the public identity the server hands to peers for the
    /// signed-in account.
    async fn publish_identity(
        &self,
        bearer: &str,
        identity: &IdentityPublicKey,
    ) -> Result<(), TransportError>;
}
