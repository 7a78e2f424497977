//! Passkey (WebAuthn) assertions as the only path to unlock tickets and to
//! a fresh login.
//!
//! The server verifies the assertion signature. Before a ticket is minted
//! the client checks what it can: client data type and challenge, relying
//! party hash, user presence and verification flags, and that the
//! authenticator's signature counter moved forward.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crypto;
use crate::error::{PasskeyError, Result, SecurityError, TransportError};
use crate::key_vault::KeyVault;
use crate::token_store::TokenStore;
use crate::transport::{RegistrationRequest, Transport};
use crate::unlock::{TicketLedger, UnlockTicket};

pub const CHALLENGE_LEN: usize = 32;
const FLAG_USER_PRESENT: u8 = 0x01;
const FLAG_USER_VERIFIED: u8 = 0x04;
const AUTH_DATA_MIN_LEN: usize = 37;

#[derive(Debug, Clone)]
pub struct AssertionRequest {
    pub rp_id: String,
    pub challenge: [u8; CHALLENGE_LEN],
    pub user_verification: bool,
}

/// Platform assertion, each binary field base64url without padding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertionResponse {
    pub credential_id: String,
    pub client_data_json: String,
    pub authenticator_data: String,
    pub signature: String,
    #[serde(default)]
    pub user_handle: Option<String>,
}

/// Request to create a new platform credential at sign-up.
#[derive(Debug, Clone)]
pub struct CreationRequest {
    pub rp_id: String,
    pub challenge: [u8; CHALLENGE_LEN],
    pub user_handle: Vec<u8>,
    pub display_name: String,
    pub user_verification: bool,
}

/// New credential, each binary field base64url without padding. The
/// attestation object is forwarded to the server untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationResponse {
    pub credential_id: String,
    pub client_data_json: String,
    pub attestation_object: String,
}

#[async_trait]
pub trait PasskeyProvider: Send + Sync {
    async fn get_assertion(&self, request: AssertionRequest) -> Result<AssertionResponse, PasskeyError>;

    async fn create_credential(
        &self,
        request: CreationRequest,
    ) -> Result<AttestationResponse, PasskeyError>;
}

#[derive(Deserialize)]
struct ClientData {
    #[serde(rename = "type")]
    kind: String,
    challenge: String,
}

/// Client-side assertion checks, with per-credential counter memory.
pub struct AssertionVerifier {
    rp_id: String,
    require_user_verification: bool,
    counters: Mutex<HashMap<String, u32>>,
}

impl AssertionVerifier {
    pub fn new(rp_id: impl Into<String>, require_user_verification: bool) -> Self {
        Self {
            rp_id: rp_id.into(),
            require_user_verification,
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn rp_id(&self) -> &str {
        &self.rp_id
    }

    pub fn request(&self, challenge: [u8; CHALLENGE_LEN]) -> AssertionRequest {
        AssertionRequest {
            rp_id: self.rp_id.clone(),
            challenge,
            user_verification: self.require_user_verification,
        }
    }

    pub fn check(&self, challenge: &[u8; CHALLENGE_LEN], response: &AssertionResponse) -> Result<()> {
        check_client_data(&response.client_data_json, "webauthn.get", challenge)?;

        let auth_data = b64(&response.authenticator_data, "authenticator data")?;
        if auth_data.len() < AUTH_DATA_MIN_LEN {
            return Err(invalid("authenticator data too short"));
        }
        let rp_hash = Sha256::digest(self.rp_id.as_bytes());
        if !crypto::ct_eq(&auth_data[..32], rp_hash.as_slice()) {
            return Err(invalid("relying party mismatch"));
        }
        let flags = auth_data[32];
        if flags & FLAG_USER_PRESENT == 0 {
            return Err(invalid("user presence not asserted"));
        }
        if self.require_user_verification && flags & FLAG_USER_VERIFIED == 0 {
            return Err(invalid("user verification required"));
        }
        if b64(&response.signature, "signature")?.is_empty() {
            return Err(invalid("empty signature"));
        }

        let counter = u32::from_be_bytes([auth_data[33], auth_data[34], auth_data[35], auth_data[36]]);
        if counter != 0 {
            let mut counters = self.counters.lock();
            let previous = counters.get(&response.credential_id).copied().unwrap_or(0);
            if counter <= previous {
                tracing::warn!(
                    credential = %response.credential_id,
                    counter,
                    previous,
                    "signature counter did not advance; possible cloned authenticator"
                );
                return Err(invalid("signature counter did not advance"));
            }
            counters.insert(response.credential_id.clone(), counter);
        }
        Ok(())
    }

    /// Client data of a new credential. The attestation itself is verified
    /// by the server.
    pub fn check_creation(
        &self,
        challenge: &[u8; CHALLENGE_LEN],
        response: &AttestationResponse,
    ) -> Result<()> {
        check_client_data(&response.client_data_json, "webauthn.create", challenge)?;
        if response.credential_id.is_empty() {
            return Err(invalid("empty credential id"));
        }
        if b64(&response.attestation_object, "attestation object")?.is_empty() {
            return Err(invalid("empty attestation object"));
        }
        Ok(())
    }
}

fn check_client_data(encoded: &str, kind: &str, challenge: &[u8; CHALLENGE_LEN]) -> Result<()> {
    let client_data = b64(encoded, "client data")?;
    let client_data: ClientData = serde_json::from_slice(&client_data)
        .map_err(|e| invalid(format!("client data: {e}")))?;
    if client_data.kind != kind {
        return Err(invalid(format!("unexpected client data type {}", client_data.kind)));
    }
    let echoed = b64(&client_data.challenge, "challenge")?;
    if !crypto::ct_eq(&echoed, challenge) {
        return Err(invalid("challenge mismatch"));
    }
    Ok(())
}

fn b64(value: &str, field: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .map_err(|e| invalid(format!("{field}: {e}")))
}

fn invalid(reason: impl Into<String>) -> SecurityError {
    SecurityError::AssertionInvalid(reason.into())
}

fn decode_challenge(encoded: &str) -> Result<[u8; CHALLENGE_LEN]> {
    URL_SAFE_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| {
            SecurityError::Transport(TransportError::Decode(format!(
                "challenge must be {CHALLENGE_LEN} bytes"
            )))
        })
}

fn check_rp(requested: Option<&str>, verifier: &AssertionVerifier) -> Result<()> {
    match requested {
        Some(rp_id) if rp_id != verifier.rp_id() => {
            Err(invalid(format!("server requested relying party {rp_id}")))
        }
        _ => Ok(()),
    }
}

async fn assert_with(
    provider: &dyn PasskeyProvider,
    verifier: &AssertionVerifier,
    challenge: [u8; CHALLENGE_LEN],
) -> Result<AssertionResponse> {
    let response = provider
        .get_assertion(verifier.request(challenge))
        .await
        .map_err(|err| {
            tracing::info!(error = %err, "passkey assertion not obtained");
            SecurityError::from(err)
        })?;
    verifier.check(&challenge, &response)?;
    Ok(response)
}

pub struct PasskeyUnlock {
    provider: Arc<dyn PasskeyProvider>,
    verifier: Arc<AssertionVerifier>,
    tickets: Arc<TicketLedger>,
}

impl PasskeyUnlock {
    pub fn new(
        provider: Arc<dyn PasskeyProvider>,
        verifier: Arc<AssertionVerifier>,
        tickets: Arc<TicketLedger>,
    ) -> Self {
        Self {
            provider,
            verifier,
            tickets,
        }
    }

    /// Prompt for a fresh assertion and mint a ticket on success. There is
    /// no fallback when the user declines.
    pub async fn request_unlock(&self) -> Result<UnlockTicket> {
        let challenge = crypto::random_bytes::<CHALLENGE_LEN>();
        assert_with(self.provider.as_ref(), &self.verifier, challenge).await?;
        let ticket = self.tickets.mint();
        tracing::info!(ticket = %ticket.id(), ttl_secs = self.tickets.ttl().as_secs(), "unlock ticket issued");
        Ok(ticket)
    }
}

pub struct PasskeyLogin {
    provider: Arc<dyn PasskeyProvider>,
    verifier: Arc<AssertionVerifier>,
    transport: Arc<dyn Transport>,
    tokens: Arc<TokenStore>,
}

impl PasskeyLogin {
    pub fn new(
        provider: Arc<dyn PasskeyProvider>,
        verifier: Arc<AssertionVerifier>,
        transport: Arc<dyn Transport>,
        tokens: Arc<TokenStore>,
    ) -> Self {
        Self {
            provider,
            verifier,
            transport,
            tokens,
        }
    }

    /// Sign in with a passkey and store the issued token pair. Returns the
    /// authenticated user id when the server reports one.
    pub async fn login(&self) -> Result<Option<String>> {
        let options = self.transport.login_options().await?;
        check_rp(options.rp_id.as_deref(), &self.verifier)?;
        let challenge = decode_challenge(&options.challenge)?;

        let assertion = assert_with(self.provider.as_ref(), &self.verifier, challenge).await?;
        let grant = self
            .transport
            .complete_login(&options.challenge_token, &assertion)
            .await
            .map_err(|err| match err {
                TransportError::Unauthorized => invalid("server rejected assertion"),
                other => SecurityError::Transport(other),
            })?;
        let (pair, user_id) = grant.into_pair(Utc::now())?;
        self.tokens.replace_session(pair, user_id.clone())?;
        tracing::info!(user_id = ?user_id, "passkey login complete");
        Ok(user_id)
    }
}

pub const PRIVACY_POLICY_VERSION: &str = "1.0";

/// Account sign-up with a new passkey. The device identity travels with
/// the sign-up request, so the server can hand it to peers from the start.
pub struct PasskeyRegistration {
    provider: Arc<dyn PasskeyProvider>,
    verifier: Arc<AssertionVerifier>,
    transport: Arc<dyn Transport>,
    tokens: Arc<TokenStore>,
    vault: Arc<KeyVault>,
}

impl PasskeyRegistration {
    pub fn new(
        provider: Arc<dyn PasskeyProvider>,
        verifier: Arc<AssertionVerifier>,
        transport: Arc<dyn Transport>,
        tokens: Arc<TokenStore>,
        vault: Arc<KeyVault>,
    ) -> Self {
        Self {
            provider,
            verifier,
            transport,
            tokens,
            vault,
        }
    }

    /// Create an account, register a passkey for it and store the issued
    /// token pair. Consent to data processing is mandatory.
    pub async fn register(&self, display_name: &str, gdpr_consent: bool) -> Result<Option<String>> {
        if !gdpr_consent {
            return Err(SecurityError::InvalidRequest(
                "consent to data processing is required".into(),
            ));
        }
        let identity = self.vault.ensure_identity()?;
        let request = RegistrationRequest {
            display_name: display_name.trim().to_string(),
            gdpr_consent,
            privacy_policy_version: PRIVACY_POLICY_VERSION.to_string(),
            identity,
        };
        let options = self.transport.registration_options(&request).await?;
        check_rp(options.rp_id.as_deref(), &self.verifier)?;
        let challenge = decode_challenge(&options.challenge)?;
        let user_handle = URL_SAFE_NO_PAD
            .decode(options.user_handle.trim_end_matches('='))
            .map_err(|e| SecurityError::Transport(TransportError::Decode(format!("user handle: {e}"))))?;

        let attestation = self
            .provider
            .create_credential(CreationRequest {
                rp_id: self.verifier.rp_id().to_string(),
                challenge,
                user_handle,
                display_name: request.display_name.clone(),
                user_verification: self.verifier.require_user_verification,
            })
            .await
            .map_err(|err| {
                tracing::info!(error = %err, "passkey not created");
                SecurityError::from(err)
            })?;
        self.verifier.check_creation(&challenge, &attestation)?;

        let grant = self
            .transport
            .complete_registration(&options.challenge_token, &attestation)
            .await
            .map_err(|err| match err {
                TransportError::Unauthorized => invalid("server rejected registration"),
                other => SecurityError::Transport(other),
            })?;
        let (pair, user_id) = grant.into_pair(Utc::now())?;
        self.tokens.replace_session(pair, user_id.clone())?;
        tracing::info!(
            user_id = ?user_id,
            fingerprint = %identity.fingerprint(),
            "passkey registration complete"
        );
        Ok(user_id)
    }
}
