//! Per-payload session keys and authenticated encryption between peers.

use std::collections::BTreeMap;
use std::sync::Arc;

use zeroize::Zeroizing;

use crate::crypto::{self, generate_nonce};
use crate::error::{Result, SecurityError};
use crate::key_vault::KeyVault;
use crate::keys::PeerPublicKey;
use crate::payload::{self, EncryptedPayload, PAYLOAD_VERSION};
use crate::unlock::UnlockTicket;

pub struct SessionCrypto {
    vault: Arc<KeyVault>,
}

impl SessionCrypto {
    pub fn new(vault: Arc<KeyVault>) -> Self {
        Self { vault }
    }

    /// Encrypt to `recipient` under a fresh nonce. Consumes `ticket`.
    pub fn encrypt_for_peer(
        &self,
        plaintext: &[u8],
        recipient: &PeerPublicKey,
        ticket: &UnlockTicket,
    ) -> Result<EncryptedPayload> {
        let sender = self.vault.require_public()?.agreement;
        let shared = self.vault.agree_shared(recipient, ticket)?;
        let nonce = generate_nonce();
        let key = crypto::derive_session_key(
            shared.as_bytes(),
            &nonce,
            sender.as_bytes(),
            recipient.as_bytes(),
        )?;
        let aad = payload::associated_data(PAYLOAD_VERSION, sender.as_bytes(), &nonce);
        let (ciphertext, tag) = crypto::seal_detached(&key, &nonce, &aad, plaintext)?;
        Ok(EncryptedPayload {
            version: PAYLOAD_VERSION,
            sender_public_key: sender,
            nonce,
            ciphertext,
            tag,
        })
    }

    /// Verify and decrypt a payload addressed to this device. Consumes `ticket`.
    pub fn decrypt_from_peer(
        &self,
        payload: &EncryptedPayload,
        ticket: &UnlockTicket,
    ) -> Result<Zeroizing<Vec<u8>>> {
        check_version(payload)?;
        let recipient = self.vault.require_public()?.agreement;
        let shared = self
            .vault
            .agree_shared(&payload.sender_public_key, ticket)
            .map_err(|err| match err {
                SecurityError::InvalidPublicKey(_) => SecurityError::TamperedPayload,
                other => other,
            })?;
        let key = crypto::derive_session_key(
            shared.as_bytes(),
            &payload.nonce,
            payload.sender_public_key.as_bytes(),
            recipient.as_bytes(),
        )?;
        crypto::open_detached(
            &key,
            &payload.nonce,
            &payload.associated_data(),
            &payload.ciphertext,
            &payload.tag,
        )
    }

    /// Parse raw wire bytes, then decrypt. Length and version are checked
    /// before the ticket is touched.
    pub fn decrypt_bytes(&self, bytes: &[u8], ticket: &UnlockTicket) -> Result<Zeroizing<Vec<u8>>> {
        let payload = EncryptedPayload::from_bytes(bytes)?;
        self.decrypt_from_peer(&payload, ticket)
    }

    /// Encrypt data that only this device can read back.
    pub fn seal_for_self(&self, plaintext: &[u8], ticket: &UnlockTicket) -> Result<EncryptedPayload> {
        let own = self.vault.require_public()?.agreement;
        self.encrypt_for_peer(plaintext, &own, ticket)
    }

    pub fn open_for_self(
        &self,
        payload: &EncryptedPayload,
        ticket: &UnlockTicket,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let own = self.vault.require_public()?.agreement;
        if payload.sender_public_key != own {
            return Err(SecurityError::TamperedPayload);
        }
        self.decrypt_from_peer(payload, ticket)
    }

    /// Decrypt a set of optional text fields under a single ticket. A field
    /// that is absent, malformed, tampered or not UTF-8 comes back as `None`.
    pub fn decrypt_fields(
        &self,
        fields: &BTreeMap<String, Option<EncryptedPayload>>,
        ticket: &UnlockTicket,
    ) -> Result<BTreeMap<String, Option<Zeroizing<String>>>> {
        let recipient = self.vault.require_public()?.agreement;
        let present: Vec<(&String, &EncryptedPayload)> = fields
            .iter()
            .filter_map(|(name, value)| value.as_ref().map(|p| (name, p)))
            .filter(|(_, p)| check_version(p).is_ok())
            .collect();
        let senders: Vec<PeerPublicKey> = present.iter().map(|(_, p)| p.sender_public_key).collect();
        let secrets = self.vault.agree_shared_many(&senders, ticket)?;

        let mut out: BTreeMap<String, Option<Zeroizing<String>>> =
            fields.keys().map(|name| (name.clone(), None)).collect();
        for ((name, payload), shared) in present.into_iter().zip(secrets) {
            let Some(shared) = shared else { continue };
            let opened = crypto::derive_session_key(
                shared.as_bytes(),
                &payload.nonce,
                payload.sender_public_key.as_bytes(),
                recipient.as_bytes(),
            )
            .and_then(|key| {
                crypto::open_detached(
                    &key,
                    &payload.nonce,
                    &payload.associated_data(),
                    &payload.ciphertext,
                    &payload.tag,
                )
            });
            match opened {
                Ok(plaintext) => {
                    if let Ok(text) = std::str::from_utf8(&plaintext) {
                        out.insert(name.clone(), Some(Zeroizing::new(text.to_owned())));
                    }
                }
                Err(err) => tracing::debug!(field = %name, error = %err, "field decryption failed"),
            }
        }
        Ok(out)
    }
}

fn check_version(payload: &EncryptedPayload) -> Result<()> {
    if payload.version != PAYLOAD_VERSION {
        return Err(SecurityError::MalformedPayload(format!(
            "unsupported payload version {}",
            payload.version
        )));
    }
    Ok(())
}
