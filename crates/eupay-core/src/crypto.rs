//! Primitive wrappers shared by the vault and session layers.
//!
//! Agreement: X25519. Signatures: Ed25519. KDF: HKDF-SHA256.
//! AEAD: XChaCha20-Poly1305 with a detached 16-byte tag.

use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{Key, Tag, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{Result, SecurityError};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;
pub const PUBLIC_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;

const SESSION_KDF_INFO: &[u8] = b"eupay-p2p-session-v1";

pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

/// Expand an X25519 shared secret into a one-time session key.
///
/// The nonce is the HKDF salt, so a fresh nonce always yields a fresh key.
/// Both public keys are bound into `info` in sender/recipient order.
pub fn derive_session_key(
    shared_secret: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    sender_public: &[u8; PUBLIC_KEY_LEN],
    recipient_public: &[u8; PUBLIC_KEY_LEN],
) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    let mut info = Vec::with_capacity(SESSION_KDF_INFO.len() + 2 * PUBLIC_KEY_LEN);
    info.extend_from_slice(SESSION_KDF_INFO);
    info.extend_from_slice(sender_public);
    info.extend_from_slice(recipient_public);

    let hk = Hkdf::<Sha256>::new(Some(nonce), shared_secret);
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(&info, &mut key[..])
        .map_err(|e| SecurityError::Crypto(format!("hkdf expand: {e}")))?;
    Ok(key)
}

/// Encrypt `plaintext`, returning the ciphertext and the detached tag.
pub fn seal_detached(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; TAG_LEN])> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(XNonce::from_slice(nonce), aad, &mut buffer)
        .map_err(|e| SecurityError::Crypto(format!("encrypt: {e}")))?;
    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(tag.as_slice());
    Ok((buffer, tag_bytes))
}

/// Verify the tag and decrypt. The buffer is only decrypted after the tag
/// checks out; any failure maps to `TamperedPayload`.
pub fn open_detached(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    ciphertext: &[u8],
    tag: &[u8; TAG_LEN],
) -> Result<Zeroizing<Vec<u8>>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let mut buffer = Zeroizing::new(ciphertext.to_vec());
    cipher
        .decrypt_in_place_detached(
            XNonce::from_slice(nonce),
            aad,
            buffer.as_mut_slice(),
            Tag::from_slice(tag),
        )
        .map_err(|_| SecurityError::TamperedPayload)?;
    Ok(buffer)
}

pub fn sha256_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}

/// Human-readable fingerprint: BLAKE3 of the key truncated to 20 bytes,
/// hex in groups of 4.
pub fn fingerprint(public_key: &[u8]) -> String {
    let hash = blake3::hash(public_key);
    let hex = hex::encode(&hash.as_bytes()[..20]);
    hex.as_bytes()
        .chunks(4)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Constant-time equality for digests and tags.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
