#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use eupay_core::config::CoreConfig;
use eupay_core::passkey::{
    AssertionRequest, AssertionResponse, AttestationResponse, CreationRequest, PasskeyProvider,
};
use eupay_core::secure_storage::MemoryStore;
use eupay_core::transport::{
    LoginChallenge, PeerKeyRecord, ReceiptStatus, RegistrationChallenge, RegistrationRequest,
    TokenGrant, TransferReceipt, TransferSubmission, Transport,
};
use eupay_core::{
    IdentityPublicKey, PasskeyError, PeerPublicKey, SecurityCore, TokenPair, TransportError,
};

pub const INITIAL_ACCESS: &str = "access-0";
pub const INITIAL_REFRESH: &str = "refresh-0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    Rotate,
    Reject,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptMode {
    Accept,
    Reject,
    WrongDigest,
}

/// In-memory server. Bearer tokens are accepted only while listed in
/// `valid_access`.
pub struct ScriptedTransport {
    pub valid_access: Mutex<HashSet<String>>,
    pub peer_keys: Mutex<HashMap<String, PeerPublicKey>>,
    pub submissions: Mutex<Vec<TransferSubmission>>,
    pub refresh_mode: Mutex<RefreshMode>,
    pub receipt_mode: Mutex<ReceiptMode>,
    /// `expires_in` of every grant the server issues.
    pub grant_lifetime: Mutex<i64>,
    pub published: Mutex<Vec<IdentityPublicKey>>,
    pub registrations: Mutex<Vec<RegistrationRequest>>,
    pub refresh_delay: Duration,
    pub refresh_calls: AtomicUsize,
    pub fetch_calls: AtomicUsize,
    pub login_calls: AtomicUsize,
    issued: AtomicU32,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            valid_access: Mutex::new(HashSet::from([INITIAL_ACCESS.to_string()])),
            peer_keys: Mutex::new(HashMap::new()),
            submissions: Mutex::new(Vec::new()),
            refresh_mode: Mutex::new(RefreshMode::Rotate),
            receipt_mode: Mutex::new(ReceiptMode::Accept),
            grant_lifetime: Mutex::new(900),
            published: Mutex::new(Vec::new()),
            registrations: Mutex::new(Vec::new()),
            refresh_delay: Duration::from_millis(50),
            refresh_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            login_calls: AtomicUsize::new(0),
            issued: AtomicU32::new(0),
        })
    }

    /// Make every access token issued so far stale.
    pub fn expire_all_access(&self) {
        self.valid_access.lock().clear();
    }

    pub fn register_peer(&self, account_id: &str, key: PeerPublicKey) {
        self.peer_keys.lock().insert(account_id.to_string(), key);
    }

    fn authorize(&self, bearer: &str) -> Result<(), TransportError> {
        if self.valid_access.lock().contains(bearer) {
            Ok(())
        } else {
            Err(TransportError::Unauthorized)
        }
    }

    fn grant(&self) -> TokenGrant {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let access = format!("access-{n}");
        self.valid_access.lock().insert(access.clone());
        TokenGrant {
            access_token: access,
            refresh_token: format!("refresh-{n}"),
            expires_in: *self.grant_lifetime.lock(),
            user_id: Some("user-alice".into()),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn fetch_peer_key(
        &self,
        bearer: &str,
        account_id: &str,
    ) -> Result<PeerKeyRecord, TransportError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.authorize(bearer)?;
        let key = self
            .peer_keys
            .lock()
            .get(account_id)
            .copied()
            .ok_or_else(|| TransportError::NotFound(account_id.to_string()))?;
        Ok(PeerKeyRecord {
            account_id: account_id.to_string(),
            public_key: key,
        })
    }

    async fn submit_transfer(
        &self,
        bearer: &str,
        submission: &TransferSubmission,
    ) -> Result<TransferReceipt, TransportError> {
        self.authorize(bearer)?;
        self.submissions.lock().push(submission.clone());
        let mode = *self.receipt_mode.lock();
        let digest = match mode {
            ReceiptMode::WrongDigest => "00".repeat(32),
            _ => submission.payload.digest(),
        };
        Ok(TransferReceipt {
            transfer_id: submission.transfer_id,
            status: if mode == ReceiptMode::Reject {
                ReceiptStatus::Rejected
            } else {
                ReceiptStatus::Accepted
            },
            payload_digest: digest,
            reference: Some("P2P-0001".into()),
            message: None,
        })
    }

    async fn refresh_tokens(&self, _refresh_token: &str) -> Result<TokenGrant, TransportError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.refresh_delay).await;
        let mode = *self.refresh_mode.lock();
        match mode {
            RefreshMode::Rotate => Ok(self.grant()),
            RefreshMode::Reject => Err(TransportError::Unauthorized),
            RefreshMode::Fail => Err(TransportError::Network("connection reset".into())),
        }
    }

    async fn login_options(&self) -> Result<LoginChallenge, TransportError> {
        Ok(LoginChallenge {
            challenge_token: "challenge-token-1".into(),
            challenge: URL_SAFE_NO_PAD.encode([42u8; 32]),
            rp_id: Some("eupay.eu".into()),
        })
    }

    async fn complete_login(
        &self,
        challenge_token: &str,
        assertion: &AssertionResponse,
    ) -> Result<TokenGrant, TransportError> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        if challenge_token != "challenge-token-1" || assertion.signature.is_empty() {
            return Err(TransportError::Unauthorized);
        }
        Ok(self.grant())
    }

    async fn registration_options(
        &self,
        request: &RegistrationRequest,
    ) -> Result<RegistrationChallenge, TransportError> {
        if !request.gdpr_consent {
            return Err(TransportError::Status {
                status: 400,
                message: "consent required".into(),
            });
        }
        self.registrations.lock().push(request.clone());
        Ok(RegistrationChallenge {
            challenge_token: "registration-token-1".into(),
            challenge: URL_SAFE_NO_PAD.encode([24u8; 32]),
            rp_id: Some("eupay.eu".into()),
            user_handle: URL_SAFE_NO_PAD.encode("user-alice"),
        })
    }

    async fn complete_registration(
        &self,
        challenge_token: &str,
        attestation: &AttestationResponse,
    ) -> Result<TokenGrant, TransportError> {
        if challenge_token != "registration-token-1" || attestation.attestation_object.is_empty() {
            return Err(TransportError::Unauthorized);
        }
        Ok(self.grant())
    }

    async fn publish_identity(
        &self,
        bearer: &str,
        identity: &IdentityPublicKey,
    ) -> Result<(), TransportError> {
        self.authorize(bearer)?;
        self.published.lock().push(*identity);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptMode {
    Approve,
    Cancel,
    Reject,
}

/// Platform authenticator stand-in producing well-formed assertions.
pub struct ScriptedPasskey {
    pub mode: Mutex<PromptMode>,
    pub prompts: AtomicUsize,
    counter: AtomicU32,
}

impl ScriptedPasskey {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(PromptMode::Approve),
            prompts: AtomicUsize::new(0),
            counter: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl PasskeyProvider for ScriptedPasskey {
    async fn get_assertion(
        &self,
        request: AssertionRequest,
    ) -> Result<AssertionResponse, PasskeyError> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        match *self.mode.lock() {
            PromptMode::Cancel => return Err(PasskeyError::Cancelled),
            PromptMode::Reject => return Err(PasskeyError::Rejected("authenticator error".into())),
            PromptMode::Approve => {}
        }
        let counter = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let client_data = serde_json::json!({
            "type": "webauthn.get",
            "challenge": URL_SAFE_NO_PAD.encode(request.challenge),
            "origin": format!("https://{}", request.rp_id),
        });
        let mut auth_data = Sha256::digest(request.rp_id.as_bytes()).to_vec();
        auth_data.push(0x05);
        auth_data.extend_from_slice(&counter.to_be_bytes());
        Ok(AssertionResponse {
            credential_id: "platform-credential".into(),
            client_data_json: URL_SAFE_NO_PAD.encode(client_data.to_string()),
            authenticator_data: URL_SAFE_NO_PAD.encode(auth_data),
            signature: URL_SAFE_NO_PAD.encode([7u8; 64]),
            user_handle: Some(URL_SAFE_NO_PAD.encode("user-alice")),
        })
    }

    async fn create_credential(
        &self,
        request: CreationRequest,
    ) -> Result<AttestationResponse, PasskeyError> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        match *self.mode.lock() {
            PromptMode::Cancel => return Err(PasskeyError::Cancelled),
            PromptMode::Reject => return Err(PasskeyError::Rejected("authenticator error".into())),
            PromptMode::Approve => {}
        }
        let client_data = serde_json::json!({
            "type": "webauthn.create",
            "challenge": URL_SAFE_NO_PAD.encode(request.challenge),
            "origin": format!("https://{}", request.rp_id),
        });
        Ok(AttestationResponse {
            credential_id: "platform-credential".into(),
            client_data_json: URL_SAFE_NO_PAD.encode(client_data.to_string()),
            attestation_object: URL_SAFE_NO_PAD.encode(b"fmt:none"),
        })
    }
}

pub struct Harness {
    pub core: SecurityCore,
    pub store: Arc<MemoryStore>,
    pub transport: Arc<ScriptedTransport>,
    pub passkey: Arc<ScriptedPasskey>,
}

/// Core over in-memory fakes, signed in with `INITIAL_ACCESS`.
pub fn signed_in() -> Harness {
    let h = signed_out();
    h.core
        .tokens
        .replace(TokenPair::new(
            INITIAL_ACCESS,
            INITIAL_REFRESH,
            Utc::now() + chrono::Duration::minutes(15),
        ))
        .unwrap();
    h
}

pub fn signed_out() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let transport = ScriptedTransport::new();
    let passkey = ScriptedPasskey::new();
    let core = SecurityCore::new(
        CoreConfig::default(),
        store.clone(),
        passkey.clone(),
        transport.clone(),
    )
    .unwrap();
    Harness {
        core,
        store,
        transport,
        passkey,
    }
}
