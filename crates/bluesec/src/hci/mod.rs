//! Bluetooth HCI (Host Controller Interface) command and event codec
//!
//! Only the commands and events the security core issues or consumes are
//! modelled here. Delivery of packets is left to an [`HciTransport`].

pub mod constants;
pub mod packet;
pub mod transport;


pub use packet::{
    DisconnectionComplete, EncryptionChange, HciCommand, HciEvent, LeLongTermKeyRequest,
    SecurityHciEvent,
};
pub use transport::{HciTransport, RecordingTransport};
