//! Platform secure-storage capability.
//!
//! Each slot holds one opaque blob. Implementations must make `put` atomic
//! per slot: after a failed `put` the previous value is still readable.

use std::collections::HashMap;

use base64::{engine::general_purpose, Engine as _};
use keyring::Entry;
use parking_lot::RwLock;
use zeroize::Zeroizing;

use crate::error::StoreError;

const SERVICE_NAME: &str = "EuPay";

/// Named slots used by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Identity,
    TokenPair,
}

impl Slot {
    pub fn key(&self) -> &'static str {
        match self {
            Slot::Identity => "identity_private_key",
            Slot::TokenPair => "token_pair",
        }
    }
}

pub trait SecureStore: Send + Sync {
    fn get(&self, slot: Slot) -> Result<Option<Zeroizing<Vec<u8>>>, StoreError>;
    fn put(&self, slot: Slot, value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, slot: Slot) -> Result<(), StoreError>;
}

/// In-process store for tests and for hosts without a platform keystore.
#[derive(Default)]
pub struct MemoryStore {
    slots: RwLock<HashMap<Slot, Zeroizing<Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecureStore for MemoryStore {
    fn get(&self, slot: Slot) -> Result<Option<Zeroizing<Vec<u8>>>, StoreError> {
        Ok(self.slots.read().get(&slot).cloned())
    }

    fn put(&self, slot: Slot, value: &[u8]) -> Result<(), StoreError> {
        self.slots
            .write()
            .insert(slot, Zeroizing::new(value.to_vec()));
        Ok(())
    }

    fn delete(&self, slot: Slot) -> Result<(), StoreError> {
        self.slots.write().remove(&slot);
        Ok(())
    }
}

/// OS credential store (Secret Service, Keychain, Credential Manager).
/// Values are base64-encoded since the keyring API stores strings.
pub struct KeyringStore {
    account: String,
}

impl KeyringStore {
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
        }
    }

    fn entry(&self, slot: Slot) -> Result<Entry, StoreError> {
        Entry::new(SERVICE_NAME, &format!("{}:{}", slot.key(), self.account))
            .map_err(|e| StoreError::Unavailable(format!("keyring init: {e}")))
    }
}

impl SecureStore for KeyringStore {
    fn get(&self, slot: Slot) -> Result<Option<Zeroizing<Vec<u8>>>, StoreError> {
        let entry = self.entry(slot)?;
        let encoded = match entry.get_password() {
            Ok(value) => Zeroizing::new(value),
            Err(keyring::Error::NoEntry) => return Ok(None),
            Err(e) => return Err(StoreError::ReadFailed(format!("load {}: {e}", slot.key()))),
        };
        let decoded = general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| StoreError::ReadFailed(format!("decode {}: {e}", slot.key())))?;
        Ok(Some(Zeroizing::new(decoded)))
    }

    fn put(&self, slot: Slot, value: &[u8]) -> Result<(), StoreError> {
        let entry = self.entry(slot)?;
        let encoded = Zeroizing::new(general_purpose::STANDARD.encode(value));
        entry
            .set_password(&encoded)
            .map_err(|e| StoreError::WriteFailed(format!("store {}: {e}", slot.key())))
    }

    fn delete(&self, slot: Slot) -> Result<(), StoreError> {
        let entry = self.entry(slot)?;
        match entry.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(StoreError::WriteFailed(format!("delete {}: {e}", slot.key()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_slots_are_independent() {
        let store = MemoryStore::new();
        store.put(Slot::Identity, b"id").unwrap();
        store.put(Slot::TokenPair, b"tok").unwrap();
        assert_eq!(store.get(Slot::Identity).unwrap().unwrap().as_slice(), b"id");
        store.delete(Slot::Identity).unwrap();
        assert!(store.get(Slot::Identity).unwrap().is_none());
        assert_eq!(store.get(Slot::TokenPair).unwrap().unwrap().as_slice(), b"tok");
    }
}
