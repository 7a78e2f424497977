//! eupay-core: client-side security core for EU Pay.
//!
//! # Module layout
//! - `key_vault`     : device identity (Ed25519 + X25519), ticket-gated use
//! - `identity`      : publication of the public identity to the server
//! - `session_crypto`: per-payload HKDF session keys, XChaCha20-Poly1305
//! - `payload`       : encrypted payload wire format
//! - `token_store`   : access/refresh token pair custody
//! - `auth_gateway`  : bearer attachment and single-flight refresh
//! - `passkey`       : passkey unlock tickets, login and registration
//! - `transfer`      : peer-to-peer transfer orchestration
//! - `audit`         : hash-chained log of private-key access
//! - `secure_storage`: platform key/credential store capability
//! - `transport`     : server capability, `http_transport` for reqwest

pub mod audit;
pub mod auth_gateway;
pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod http_transport;
pub mod iban;
pub mod identity;
pub mod key_vault;
pub mod keys;
pub mod passkey;
pub mod paths;
pub mod payload;
pub mod secure_storage;
pub mod session_crypto;
pub mod token_store;
pub mod transfer;
pub mod transport;
pub mod unlock;

pub use context::SecurityCore;
pub use error::{PasskeyError, SecurityError, StoreError, TransferStage, TransportError};
pub use keys::{IdentityPublicKey, PeerPublicKey};
pub use payload::EncryptedPayload;
pub use token_store::{TokenPair, TokenState};
pub use unlock::UnlockTicket;
