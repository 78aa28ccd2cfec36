//! LE security core
//!
//! This module holds everything the host needs to secure LE links:
//! - Per-peer security records and their store
//! - Local identity and encryption root generation
//! - Resolvable private address generation and resolution
//! - Link encryption decisions and the start-encryption / LTK exchange
//! - Integration with the pairing protocol
//! - Data signing with sign counters
//!
//! [`SecurityManager`] ties the pieces together.

pub mod constants;
pub mod crypto;
pub mod encryption;
pub mod keygen;
pub mod keys;
pub mod manager;
pub mod ports;
pub mod privacy;
pub mod record;
pub mod router;
pub mod signing;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod mock;
#[cfg(test)]
mod tests;

// Re-export public API
pub use self::crypto::SoftCrypto;
pub use self::encryption::EncryptionKey;
pub use self::keygen::LocalIdentityKeys;
pub use self::keys::*;
pub use self::manager::SecurityManager;
pub use self::ports::{CryptoPort, PairingPort, RandomPurpose, RandomSource, ThreadRngSource};
pub use self::privacy::ResolveCallback;
pub use self::record::{ConnParams, DeviceSecurityRecord};
pub use self::router::{IoCapabilityRequest, PairingEvent, PairingSession, PairingState};
pub use self::signing::DataSignature;
pub use self::store::{RecordHandle, RecordStore};
pub use self::types::*;
