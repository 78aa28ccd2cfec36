//! Error types for the bluesec library
//!
//! This module defines the error types used throughout the library.

use crate::smp::SmpReason;
use thiserror::Error;

/// Errors produced while encoding or handing HCI packets to the transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HciError {
    #[error("Command rejected by transport: {0}")]
    CommandRejected(String),

    #[error("Invalid parameter length: {0}")]
    InvalidParamLength(usize),

    #[error("Invalid HCI packet format")]
    InvalidPacketFormat,
}

/// Errors that can occur in the security core
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecurityError {
    #[error("No security record for device")]
    NotFound,

    #[error("Unrecognized key type: 0x{0:02x}")]
    WrongType(u8),

    #[error("Security operation already in progress")]
    Busy,

    #[error("Device record store is full")]
    Exhausted,

    #[error("Cryptographic operation failed: {0}")]
    CryptoFailure(String),

    #[error("Pairing failed: {0}")]
    ProtocolFailure(SmpReason),

    #[error("Link is not in a state that allows this operation")]
    WrongMode,

    #[error("Required key is not available")]
    MissingKey,

    #[error("Link encryption failed with HCI status 0x{0:02x}")]
    EncryptionFailed(u8),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Operation timeout")]
    Timeout,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HCI error: {0}")]
    Hci(#[from] HciError),
}

/// Result type for security operations
pub type SecResult<T> = Result<T, SecurityError>;
