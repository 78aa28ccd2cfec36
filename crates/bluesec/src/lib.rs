//! bluesec - LE security core for a Bluetooth host stack
//!
//! This library keeps per-peer security records, generates the local key
//! hierarchy, generates and resolves resolvable private addresses, decides
//! when links must be encrypted or paired, drives the HCI encryption
//! exchange, and signs and verifies data with per-peer sign counters.
//! The pairing protocol, the HCI transport and the crypto engine are
//! reached through traits supplied by the host stack.

pub mod config;
pub mod error;
pub mod gap;
pub mod hci;
pub mod smp;

// Re-export common types for convenience
pub use config::SecurityConfig;
pub use error::{HciError, SecResult, SecurityError};
pub use gap::{AddressType, BdAddr, DeviceType, LinkRole};
pub use hci::{HciCommand, HciEvent, HciTransport, RecordingTransport};
pub use smp::{
    DataSignature, LeKey, PairingEvent, SecurityAction, SecurityEvent, SecurityLevel,
    SecurityManager, ServiceSecurity,
};
