//! Peer-to-peer transfer orchestration.
//!
//! `Pending -> Unlocking -> KeyResolved -> Encrypted -> Submitted -> Acknowledged`,
//! or `Failed` with the stage that broke. Nothing here retries: a failed
//! transfer is reported and the caller decides whether to start a new one.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::auth_gateway::AuthGateway;
use crate::crypto;
use crate::error::{Result, SecurityError, TransferStage, TransportError};
use crate::iban::Iban;
use crate::keys::PeerPublicKey;
use crate::passkey::PasskeyUnlock;
use crate::payload::EncryptedPayload;
use crate::session_crypto::SessionCrypto;
use crate::transport::{TransferReceipt, TransferSubmission, Transport};
use crate::unlock::UnlockTicket;

pub const MIN_AMOUNT_CENTS: u64 = 1;
pub const MAX_AMOUNT_CENTS: u64 = 1_500_000;
pub const MAX_MEMO_CHARS: usize = 140;
pub const CURRENCY: &str = "EUR";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    /// EU Pay account, addressed by email.
    Account(String),
    Iban(Iban),
}

impl Recipient {
    pub fn parse(input: &str) -> std::result::Result<Self, String> {
        let trimmed = input.trim();
        if let Some((local, domain)) = trimmed.split_once('@') {
            if !valid_local_part(local) || !valid_domain(domain) {
                return Err(format!("invalid recipient email {trimmed}"));
            }
            return Ok(Recipient::Account(trimmed.to_ascii_lowercase()));
        }
        Iban::parse(trimmed)
            .map(Recipient::Iban)
            .map_err(|e| e.to_string())
    }

    /// Identifier the server resolves to a public key.
    pub fn account_id(&self) -> &str {
        match self {
            Recipient::Account(email) => email,
            Recipient::Iban(iban) => iban.as_str(),
        }
    }
}

/// Dot-atom local part. Path and URL delimiters (`/ ? # %`) never appear.
fn valid_local_part(local: &str) -> bool {
    const SPECIALS: &str = "!$&'*+=^_`{|}~-";
    !local.is_empty()
        && local.len() <= 64
        && local.split('.').all(|atom| {
            !atom.is_empty()
                && atom
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || SPECIALS.contains(c))
        })
}

fn valid_domain(domain: &str) -> bool {
    let labels: Vec<&str> = domain.split('.').collect();
    domain.len() <= 253
        && labels.len() >= 2
        && labels.iter().all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub recipient: String,
    pub amount_cents: u64,
    pub memo: Option<String>,
}

/// Plaintext sealed into the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferInstruction {
    pub transfer_id: Uuid,
    pub recipient: String,
    pub amount_cents: u64,
    pub currency: String,
    #[serde(default)]
    pub memo: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferState {
    Pending,
    Unlocking,
    KeyResolved,
    Encrypted,
    Submitted,
    Acknowledged,
    Failed { stage: TransferStage, reason: String },
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferState::Pending => f.write_str("pending"),
            TransferState::Unlocking => f.write_str("unlocking"),
            TransferState::KeyResolved => f.write_str("key resolved"),
            TransferState::Encrypted => f.write_str("encrypted"),
            TransferState::Submitted => f.write_str("submitted"),
            TransferState::Acknowledged => f.write_str("acknowledged"),
            TransferState::Failed { stage, .. } => write!(f, "failed at {stage}"),
        }
    }
}

/// One transfer attempt and the states it went through.
#[derive(Debug)]
pub struct Transfer {
    pub id: Uuid,
    history: Vec<TransferState>,
    receipt: Option<TransferReceipt>,
    error: Option<SecurityError>,
}

impl Transfer {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            history: vec![TransferState::Pending],
            receipt: None,
            error: None,
        }
    }

    pub fn state(&self) -> &TransferState {
        self.history.last().unwrap_or(&TransferState::Pending)
    }

    pub fn history(&self) -> &[TransferState] {
        &self.history
    }

    pub fn receipt(&self) -> Option<&TransferReceipt> {
        self.receipt.as_ref()
    }

    /// Underlying error for a failed transfer.
    pub fn error(&self) -> Option<&SecurityError> {
        self.error.as_ref()
    }

    pub fn into_result(self) -> Result<TransferReceipt> {
        match (self.state().clone(), self.receipt) {
            (TransferState::Acknowledged, Some(receipt)) => Ok(receipt),
            (TransferState::Failed { stage, reason }, _) => {
                Err(SecurityError::TransferFailed { stage, reason })
            }
            (state, _) => Err(SecurityError::TransferFailed {
                stage: TransferStage::Acknowledgment,
                reason: format!("transfer stopped in state {state}"),
            }),
        }
    }

    fn advance(&mut self, state: TransferState) {
        tracing::info!(transfer_id = %self.id, state = %state, "transfer state");
        self.history.push(state);
    }

    fn fail(&mut self, stage: TransferStage, error: SecurityError) {
        let reason = error.to_string();
        tracing::warn!(transfer_id = %self.id, %stage, %reason, "transfer failed");
        self.history.push(TransferState::Failed { stage, reason });
        self.error = Some(error);
    }
}

pub struct P2PTransferCoordinator {
    session: Arc<SessionCrypto>,
    gateway: Arc<AuthGateway>,
    unlock: Arc<PasskeyUnlock>,
    transport: Arc<dyn Transport>,
}

impl P2PTransferCoordinator {
    pub fn new(
        session: Arc<SessionCrypto>,
        gateway: Arc<AuthGateway>,
        unlock: Arc<PasskeyUnlock>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            session,
            gateway,
            unlock,
            transport,
        }
    }

    /// Run a transfer to completion and return its receipt.
    pub async fn send(&self, request: TransferRequest, ticket: Option<UnlockTicket>) -> Result<TransferReceipt> {
        self.execute(request, ticket).await.into_result()
    }

    /// Run a transfer and return the full record, failed or not. When no
    /// ticket is supplied the user is prompted for a passkey.
    pub async fn execute(&self, request: TransferRequest, ticket: Option<UnlockTicket>) -> Transfer {
        let mut transfer = Transfer::new();

        let recipient = match validate(&request) {
            Ok(recipient) => recipient,
            Err(err) => {
                transfer.fail(TransferStage::Validation, err);
                return transfer;
            }
        };

        transfer.advance(TransferState::Unlocking);
        let ticket = match ticket {
            Some(ticket) => ticket,
            None => match self.unlock.request_unlock().await {
                Ok(ticket) => ticket,
                Err(err) => {
                    transfer.fail(TransferStage::Unlocking, err);
                    return transfer;
                }
            },
        };

        let peer_key = match self.resolve_key(&recipient).await {
            Ok(key) => key,
            Err(err) => {
                transfer.fail(TransferStage::KeyResolution, err);
                return transfer;
            }
        };
        transfer.advance(TransferState::KeyResolved);

        let instruction = TransferInstruction {
            transfer_id: transfer.id,
            recipient: recipient.account_id().to_string(),
            amount_cents: request.amount_cents,
            currency: CURRENCY.to_string(),
            memo: request.memo.clone(),
            created_at: Utc::now(),
        };
        let payload = match self.seal(instruction, peer_key, ticket).await {
            Ok(payload) => payload,
            Err(err) => {
                transfer.fail(TransferStage::Encryption, err);
                return transfer;
            }
        };
        transfer.advance(TransferState::Encrypted);

        let submission = TransferSubmission {
            transfer_id: transfer.id,
            recipient: recipient.account_id().to_string(),
            payload_digest: payload.digest(),
            payload,
        };
        let receipt = match self.submit(&submission).await {
            Ok(receipt) => receipt,
            Err(err) => {
                transfer.fail(TransferStage::Submission, err);
                return transfer;
            }
        };
        transfer.advance(TransferState::Submitted);

        if let Err(err) = verify_receipt(&submission, &receipt) {
            transfer.fail(TransferStage::Acknowledgment, err);
            transfer.receipt = Some(receipt);
            return transfer;
        }
        transfer.receipt = Some(receipt);
        transfer.advance(TransferState::Acknowledged);
        transfer
    }

    /// Encrypt on the blocking pool, since the vault reads the platform
    /// keystore synchronously. The ticket is released when the task ends.
    async fn seal(
        &self,
        instruction: TransferInstruction,
        peer_key: PeerPublicKey,
        ticket: UnlockTicket,
    ) -> Result<EncryptedPayload> {
        let session = self.session.clone();
        tokio::task::spawn_blocking(move || -> Result<EncryptedPayload> {
            let plaintext = Zeroizing::new(serde_json::to_vec(&instruction)?);
            session.encrypt_for_peer(&plaintext, &peer_key, &ticket)
        })
        .await
        .map_err(|e| SecurityError::Crypto(format!("encryption task: {e}")))?
    }

    async fn resolve_key(&self, recipient: &Recipient) -> Result<PeerPublicKey> {
        let account_id = recipient.account_id().to_string();
        let record = self
            .gateway
            .execute("fetch_peer_key", |bearer| {
                let transport = self.transport.clone();
                let account_id = account_id.clone();
                async move { transport.fetch_peer_key(&bearer, &account_id).await }
            })
            .await?;
        if !record.account_id.eq_ignore_ascii_case(&account_id) {
            return Err(SecurityError::InvalidPublicKey(format!(
                "server returned a key for {}",
                record.account_id
            )));
        }
        Ok(record.public_key)
    }

    async fn submit(&self, submission: &TransferSubmission) -> Result<TransferReceipt> {
        self.gateway
            .execute("submit_transfer", |bearer| {
                let transport = self.transport.clone();
                async move { transport.submit_transfer(&bearer, submission).await }
            })
            .await
    }
}

fn validate(request: &TransferRequest) -> Result<Recipient> {
    if !(MIN_AMOUNT_CENTS..=MAX_AMOUNT_CENTS).contains(&request.amount_cents) {
        return Err(SecurityError::InvalidRequest(format!(
            "amount must be between {MIN_AMOUNT_CENTS} and {MAX_AMOUNT_CENTS} cents"
        )));
    }
    if let Some(memo) = &request.memo {
        if memo.chars().count() > MAX_MEMO_CHARS {
            return Err(SecurityError::InvalidRequest(format!(
                "memo exceeds {MAX_MEMO_CHARS} characters"
            )));
        }
    }
    Recipient::parse(&request.recipient).map_err(SecurityError::InvalidRequest)
}

fn verify_receipt(submission: &TransferSubmission, receipt: &TransferReceipt) -> Result<()> {
    if receipt.transfer_id != submission.transfer_id {
        return Err(SecurityError::Transport(TransportError::Decode(
            "receipt is for a different transfer".into(),
        )));
    }
    if !receipt.status.is_accepted() {
        return Err(SecurityError::Transport(TransportError::Status {
            status: 422,
            message: receipt
                .message
                .clone()
                .unwrap_or_else(|| "transfer rejected".into()),
        }));
    }
    if !crypto::ct_eq(
        receipt.payload_digest.to_ascii_lowercase().as_bytes(),
        submission.payload_digest.as_bytes(),
    ) {
        return Err(SecurityError::Transport(TransportError::Decode(
            "receipt digest does not match submitted payload".into(),
        )));
    }
    Ok(())
}
