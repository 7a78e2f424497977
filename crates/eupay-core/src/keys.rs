//! Public key newtypes and the opaque shared-secret handle.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::Zeroizing;

use crate::crypto::{self, KEY_LEN, PUBLIC_KEY_LEN};
use crate::error::{Result, SecurityError};

/// X25519 public key of a counterparty (or of this device), base64url on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerPublicKey([u8; PUBLIC_KEY_LEN]);

impl PeerPublicKey {
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; PUBLIC_KEY_LEN] = bytes.try_into().map_err(|_| {
            SecurityError::InvalidPublicKey(format!(
                "public key must be {PUBLIC_KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    pub fn from_b64(s: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s.trim())
            .map_err(|e| SecurityError::InvalidPublicKey(format!("base64: {e}")))?;
        Self::from_slice(&bytes)
    }

    pub fn to_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    pub fn fingerprint(&self) -> String {
        crypto::fingerprint(&self.0)
    }
}

impl Serialize for PeerPublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_b64())
    }
}

impl<'de> Deserialize<'de> for PeerPublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PeerPublicKey::from_b64(&s).map_err(serde::de::Error::custom)
    }
}

/// Exportable half of the device identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityPublicKey {
    /// X25519 key used for payload key agreement.
    pub agreement: PeerPublicKey,
    /// Ed25519 verifying key, base64url.
    #[serde(with = "b64_array")]
    pub signing: [u8; PUBLIC_KEY_LEN],
}

impl IdentityPublicKey {
    /// Fingerprint over both halves, for out-of-band verification.
    pub fn fingerprint(&self) -> String {
        let mut both = [0u8; 2 * PUBLIC_KEY_LEN];
        both[..PUBLIC_KEY_LEN].copy_from_slice(self.agreement.as_bytes());
        both[PUBLIC_KEY_LEN..].copy_from_slice(&self.signing);
        crypto::fingerprint(&both)
    }
}

/// Raw X25519 output. Only crate code can read the bytes; zeroed on drop.
pub struct SharedSecret(Zeroizing<[u8; KEY_LEN]>);

impl SharedSecret {
    pub(crate) fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

mod b64_array {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = URL_SAFE_NO_PAD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}
