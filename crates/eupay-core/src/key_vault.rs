//! Device identity custody.
//!
//! The identity is an Ed25519 signing key plus an X25519 agreement key, held
//! as a checksummed JSON record in the `Identity` slot of the secure store.
//! Private halves only leave storage for the duration of a single ticketed
//! operation and are never handed to callers.

use std::sync::Arc;

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::{Mutex, RwLock};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as AgreementPublic, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::audit::{AuditLog, AuditOutcome};
use crate::crypto::{self, KEY_LEN};
use crate::error::{Result, SecurityError, StoreError};
use crate::keys::{IdentityPublicKey, PeerPublicKey, SharedSecret};
use crate::secure_storage::{SecureStore, Slot};
use crate::unlock::{TicketLedger, UnlockTicket};

const COMPONENT: &str = "key_vault";
pub const IDENTITY_RECORD_VERSION: u32 = 1;

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct IdentityRecord {
    version: u32,
    #[zeroize(skip)]
    created_at: DateTime<Utc>,
    signing_secret: String,
    agreement_secret: String,
    signing_public: String,
    agreement_public: String,
    checksum: String,
}

impl IdentityRecord {
    fn generate() -> (Self, IdentityPublicKey) {
        let signing = SigningKey::generate(&mut OsRng);
        let agreement = StaticSecret::random_from_rng(OsRng);
        let public = IdentityPublicKey {
            agreement: PeerPublicKey::from_bytes(AgreementPublic::from(&agreement).to_bytes()),
            signing: signing.verifying_key().to_bytes(),
        };
        let signing_secret = Zeroizing::new(signing.to_bytes());
        let agreement_secret = Zeroizing::new(agreement.to_bytes());
        let record = IdentityRecord {
            version: IDENTITY_RECORD_VERSION,
            created_at: Utc::now(),
            signing_secret: general_purpose::STANDARD.encode(&signing_secret[..]),
            agreement_secret: general_purpose::STANDARD.encode(&agreement_secret[..]),
            signing_public: general_purpose::STANDARD.encode(public.signing),
            agreement_public: general_purpose::STANDARD.encode(public.agreement.as_bytes()),
            checksum: checksum(IDENTITY_RECORD_VERSION, &signing_secret[..], &agreement_secret[..]),
        };
        (record, public)
    }

    fn parse(bytes: &[u8]) -> Result<Self> {
        let record: IdentityRecord = serde_json::from_slice(bytes)
            .map_err(|e| SecurityError::Corrupted(format!("identity record: {e}")))?;
        if record.version != IDENTITY_RECORD_VERSION {
            return Err(SecurityError::Corrupted(format!(
                "unsupported identity record version {}",
                record.version
            )));
        }
        let material = record.material()?;
        let expected = checksum(
            record.version,
            &material.signing.to_bytes(),
            &material.agreement.to_bytes(),
        );
        if !crypto::ct_eq(expected.as_bytes(), record.checksum.as_bytes()) {
            return Err(SecurityError::Corrupted("identity checksum mismatch".into()));
        }
        Ok(record)
    }

    fn material(&self) -> Result<IdentityMaterial> {
        let signing = decode_secret(&self.signing_secret, "signing_secret")?;
        let agreement = decode_secret(&self.agreement_secret, "agreement_secret")?;
        Ok(IdentityMaterial {
            signing: SigningKey::from_bytes(&signing),
            agreement: StaticSecret::from(*agreement),
        })
    }

    fn public(&self) -> Result<IdentityPublicKey> {
        let material = self.material()?;
        Ok(material.public())
    }
}

fn decode_secret(encoded: &str, field: &str) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    let bytes = Zeroizing::new(
        general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| SecurityError::Corrupted(format!("{field}: {e}")))?,
    );
    if bytes.len() != KEY_LEN {
        return Err(SecurityError::Corrupted(format!(
            "{field}: expected {KEY_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    let mut out = Zeroizing::new([0u8; KEY_LEN]);
    out.copy_from_slice(&bytes);
    Ok(out)
}

fn not_provisioned() -> SecurityError {
    SecurityError::KeyUnavailable(StoreError::ReadFailed("identity not provisioned".into()))
}

fn checksum(version: u32, signing_secret: &[u8], agreement_secret: &[u8]) -> String {
    crypto::sha256_hex(&[&version.to_be_bytes(), signing_secret, agreement_secret])
}

/// Private halves, alive for one operation.
struct IdentityMaterial {
    signing: SigningKey,
    agreement: StaticSecret,
}

impl IdentityMaterial {
    fn public(&self) -> IdentityPublicKey {
        IdentityPublicKey {
            agreement: PeerPublicKey::from_bytes(AgreementPublic::from(&self.agreement).to_bytes()),
            signing: self.signing.verifying_key().to_bytes(),
        }
    }

    fn agree(&self, counterparty: &PeerPublicKey) -> Result<SharedSecret> {
        let shared = self
            .agreement
            .diffie_hellman(&AgreementPublic::from(*counterparty.as_bytes()));
        if !shared.was_contributory() {
            return Err(SecurityError::InvalidPublicKey(
                "counterparty key is a low-order point".into(),
            ));
        }
        Ok(SharedSecret::new(*shared.as_bytes()))
    }
}

pub struct KeyVault {
    store: Arc<dyn SecureStore>,
    tickets: Arc<TicketLedger>,
    audit: Arc<AuditLog>,
    provision: Mutex<()>,
    public: RwLock<Option<IdentityPublicKey>>,
}

impl KeyVault {
    pub fn new(store: Arc<dyn SecureStore>, tickets: Arc<TicketLedger>, audit: Arc<AuditLog>) -> Self {
        Self {
            store,
            tickets,
            audit,
            provision: Mutex::new(()),
            public: RwLock::new(None),
        }
    }

    /// Load the identity, generating and persisting one on first use.
    pub fn ensure_identity(&self) -> Result<IdentityPublicKey> {
        if let Some(public) = *self.public.read() {
            return Ok(public);
        }
        let _guard = self.provision.lock();
        if let Some(public) = *self.public.read() {
            return Ok(public);
        }
        let public = match self.load_record()? {
            Some(record) => record.public()?,
            None => self.provision_locked()?,
        };
        *self.public.write() = Some(public);
        Ok(public)
    }

    /// Public half of an existing identity. Never provisions.
    pub fn public_key(&self) -> Result<Option<IdentityPublicKey>> {
        if let Some(public) = *self.public.read() {
            return Ok(Some(public));
        }
        match self.load_record()? {
            Some(record) => {
                let public = record.public()?;
                *self.public.write() = Some(public);
                Ok(Some(public))
            }
            None => Ok(None),
        }
    }

    /// Public half of the identity, `KeyUnavailable` if none was provisioned.
    pub fn require_public(&self) -> Result<IdentityPublicKey> {
        self.public_key()?.ok_or_else(not_provisioned)
    }

    pub fn has_identity(&self) -> Result<bool> {
        Ok(self.public_key()?.is_some())
    }

    pub fn fingerprint(&self) -> Result<Option<String>> {
        Ok(self.public_key()?.map(|pk| pk.fingerprint()))
    }

    pub fn sign(&self, data: &[u8], ticket: &UnlockTicket) -> Result<Signature> {
        let material = self.unlock_material(ticket, "sign")?;
        Ok(material.signing.sign(data))
    }

    pub fn agree_shared(&self, counterparty: &PeerPublicKey, ticket: &UnlockTicket) -> Result<SharedSecret> {
        let material = self.unlock_material(ticket, "agree_shared")?;
        material.agree(counterparty)
    }

    /// One unlock, several agreements. Entries are `None` for rejected keys.
    pub(crate) fn agree_shared_many(
        &self,
        counterparties: &[PeerPublicKey],
        ticket: &UnlockTicket,
    ) -> Result<Vec<Option<SharedSecret>>> {
        let material = self.unlock_material(ticket, "agree_shared_many")?;
        Ok(counterparties
            .iter()
            .map(|peer| material.agree(peer).ok())
            .collect())
    }

    /// Rotate the identity. The old private material is deleted first.
    pub fn reset_identity(&self, ticket: &UnlockTicket) -> Result<IdentityPublicKey> {
        if let Err(err) = self.tickets.redeem(ticket) {
            self.audit_access("reset_identity", AuditOutcome::Denied);
            return Err(err);
        }
        let _guard = self.provision.lock();
        self.store.delete(Slot::Identity).map_err(|e| {
            self.audit_access("reset_identity", AuditOutcome::Failed);
            SecurityError::KeyUnavailable(e)
        })?;
        *self.public.write() = None;
        let public = self.provision_locked()?;
        *self.public.write() = Some(public);
        self.audit_access("reset_identity", AuditOutcome::Granted);
        tracing::warn!(fingerprint = %public.fingerprint(), "identity rotated");
        Ok(public)
    }

    /// Discard a slot that fails to parse or checksum, and provision anew.
    /// A healthy or absent slot is left untouched.
    pub fn recover_corrupted(&self, ticket: &UnlockTicket) -> Result<IdentityPublicKey> {
        if let Err(err) = self.tickets.redeem(ticket) {
            self.audit_access("recover_corrupted", AuditOutcome::Denied);
            return Err(err);
        }
        let _guard = self.provision.lock();
        match self.load_record() {
            Err(SecurityError::Corrupted(reason)) => {
                tracing::warn!(%reason, "discarding corrupted identity slot");
                self.store
                    .delete(Slot::Identity)
                    .map_err(SecurityError::KeyUnavailable)?;
                *self.public.write() = None;
                let public = self.provision_locked()?;
                *self.public.write() = Some(public);
                self.audit_access("recover_corrupted", AuditOutcome::Granted);
                Ok(public)
            }
            Err(other) => Err(other),
            Ok(_) => Err(SecurityError::InvalidRequest(
                "identity slot is not corrupted".into(),
            )),
        }
    }

    /// Check an Ed25519 signature against an identity's signing key.
    pub fn verify(public: &IdentityPublicKey, data: &[u8], signature: &Signature) -> Result<()> {
        let key = VerifyingKey::from_bytes(&public.signing)
            .map_err(|e| SecurityError::InvalidPublicKey(e.to_string()))?;
        key.verify(data, signature)
            .map_err(|_| SecurityError::SignatureInvalid)
    }

    fn load_record(&self) -> Result<Option<IdentityRecord>> {
        let bytes = self
            .store
            .get(Slot::Identity)
            .map_err(SecurityError::KeyUnavailable)?;
        bytes.map(|b| IdentityRecord::parse(&b)).transpose()
    }

    /// Caller holds `provision`.
    fn provision_locked(&self) -> Result<IdentityPublicKey> {
        let (record, public) = IdentityRecord::generate();
        let json = Zeroizing::new(serde_json::to_vec(&record)?);
        self.store
            .put(Slot::Identity, &json)
            .map_err(SecurityError::KeyUnavailable)?;
        tracing::info!(
            component = COMPONENT,
            fingerprint = %public.fingerprint(),
            "identity provisioned"
        );
        Ok(public)
    }

    fn unlock_material(&self, ticket: &UnlockTicket, operation: &str) -> Result<IdentityMaterial> {
        if let Err(err) = self.tickets.redeem(ticket) {
            self.audit_access(operation, AuditOutcome::Denied);
            return Err(err);
        }
        let material = self.load_record().and_then(|record| match record {
            Some(record) => record.material(),
            None => Err(not_provisioned()),
        });
        let outcome = if material.is_ok() {
            AuditOutcome::Granted
        } else {
            AuditOutcome::Failed
        };
        self.audit_access(operation, outcome);
        material
    }

    fn audit_access(&self, operation: &str, outcome: AuditOutcome) {
        if let Err(err) = self.audit.record(COMPONENT, operation, outcome) {
            tracing::error!(operation, error = %err, "failed to append audit entry");
        }
    }
}
