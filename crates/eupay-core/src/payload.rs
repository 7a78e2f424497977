//! Encrypted payload wire format.
//!
//! `version(1) || sender_public_key(32) || nonce(24) || ciphertext(n) || tag(16)`

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::crypto::{self, NONCE_LEN, PUBLIC_KEY_LEN, TAG_LEN};
use crate::error::{Result, SecurityError};
use crate::keys::PeerPublicKey;

pub const PAYLOAD_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 1 + PUBLIC_KEY_LEN + NONCE_LEN;
pub const MIN_PAYLOAD_LEN: usize = HEADER_LEN + TAG_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    pub version: u8,
    pub sender_public_key: PeerPublicKey,
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

impl EncryptedPayload {
    /// Assemble from loose parts, checking every fixed length.
    pub fn from_parts(
        version: u8,
        sender_public_key: &[u8],
        nonce: &[u8],
        ciphertext: Vec<u8>,
        tag: &[u8],
    ) -> Result<Self> {
        check_version(version)?;
        let sender: [u8; PUBLIC_KEY_LEN] = fixed(sender_public_key, "sender public key")?;
        Ok(Self {
            version,
            sender_public_key: PeerPublicKey::from_bytes(sender),
            nonce: fixed(nonce, "nonce")?,
            ciphertext,
            tag: fixed(tag, "tag")?,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < MIN_PAYLOAD_LEN {
            return Err(SecurityError::MalformedPayload(format!(
                "payload is {} bytes, minimum is {MIN_PAYLOAD_LEN}",
                bytes.len()
            )));
        }
        let (header, rest) = bytes.split_at(HEADER_LEN);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);
        Self::from_parts(
            header[0],
            &header[1..1 + PUBLIC_KEY_LEN],
            &header[1 + PUBLIC_KEY_LEN..],
            ciphertext.to_vec(),
            tag,
        )
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MIN_PAYLOAD_LEN + self.ciphertext.len());
        out.push(self.version);
        out.extend_from_slice(self.sender_public_key.as_bytes());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&self.tag);
        out
    }

    pub fn to_b64(&self) -> String {
        general_purpose::STANDARD.encode(self.to_bytes())
    }

    pub fn from_b64(s: &str) -> Result<Self> {
        let bytes = general_purpose::STANDARD
            .decode(s.trim())
            .map_err(|e| SecurityError::MalformedPayload(format!("base64: {e}")))?;
        Self::from_bytes(&bytes)
    }

    /// Bytes bound as associated data: version, sender key and nonce.
    pub fn associated_data(&self) -> Vec<u8> {
        associated_data(self.version, self.sender_public_key.as_bytes(), &self.nonce)
    }

    /// SHA-256 of the wire bytes, hex. The server echoes this in its receipt.
    pub fn digest(&self) -> String {
        crypto::sha256_hex(&[&self.to_bytes()])
    }
}

pub(crate) fn associated_data(
    version: u8,
    sender_public_key: &[u8; PUBLIC_KEY_LEN],
    nonce: &[u8; NONCE_LEN],
) -> Vec<u8> {
    let mut aad = Vec::with_capacity(HEADER_LEN);
    aad.push(version);
    aad.extend_from_slice(sender_public_key);
    aad.extend_from_slice(nonce);
    aad
}

fn check_version(version: u8) -> Result<()> {
    if version != PAYLOAD_VERSION {
        return Err(SecurityError::MalformedPayload(format!(
            "unsupported payload version {version}"
        )));
    }
    Ok(())
}

fn fixed<const N: usize>(bytes: &[u8], field: &str) -> Result<[u8; N]> {
    bytes.try_into().map_err(|_| {
        SecurityError::MalformedPayload(format!("{field} must be {N} bytes, got {}", bytes.len()))
    })
}

impl Serialize for EncryptedPayload {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_b64())
    }
}

impl<'de> Deserialize<'de> for EncryptedPayload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        EncryptedPayload::from_b64(&s).map_err(serde::de::Error::custom)
    }
}
