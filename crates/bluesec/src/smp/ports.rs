//! Collaborator interfaces
//!
//! The security core talks to the crypto engine, the random number source
//! and the pairing protocol only through these traits. Results that need a
//! round trip come back later through the manager's entry points.

use super::types::SmpStatus;
use crate::error::{SecResult, SecurityError};
use crate::gap::BdAddr;
use rand::RngCore;
use std::collections::VecDeque;

/// Synchronous block cipher and CMAC.
///
/// Keys, plaintexts and outputs are little-endian byte arrays, the order
/// they travel in over HCI.
pub trait CryptoPort {
    /// AES-128 of a plaintext of at most 16 bytes, zero-padded at the high end
    fn encrypt(&self, key: &[u8; 16], plaintext: &[u8]) -> SecResult<[u8; 16]>;

    /// AES-CMAC over `message`
    fn cmac(&self, key: &[u8; 16], message: &[u8]) -> SecResult<[u8; 16]>;
}

/// Which chain a random request belongs to; at most one request per chain is outstanding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RandomPurpose {
    IdentityRoot,
    EncryptionRoot,
    PrivateAddress,
}

/// Asynchronous random source
pub trait RandomSource {
    /// Start a request. The bytes arrive later via `poll_completion` or
    /// through `SecurityManager::on_random` when the host owns the source.
    fn request_random(&mut self, purpose: RandomPurpose, len: usize) -> SecResult<()>;

    /// Next finished request, if any
    fn poll_completion(&mut self) -> Option<(RandomPurpose, SecResult<Vec<u8>>)> {
        None
    }
}

/// Random source backed by the thread-local CSPRNG; requests complete on the next poll
#[derive(Debug, Default)]
pub struct ThreadRngSource {
    completed: VecDeque<(RandomPurpose, SecResult<Vec<u8>>)>,
}

impl ThreadRngSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RandomSource for ThreadRngSource {
    fn request_random(&mut self, purpose: RandomPurpose, len: usize) -> SecResult<()> {
        if self.completed.iter().any(|(p, _)| *p == purpose) {
            return Err(SecurityError::Busy);
        }
        let mut bytes = vec![0u8; len];
        let result = rand::thread_rng()
            .try_fill_bytes(&mut bytes)
            .map(|_| bytes)
            .map_err(|e| SecurityError::CryptoFailure(e.to_string()));
        self.completed.push_back((purpose, result));
        Ok(())
    }

    fn poll_completion(&mut self) -> Option<(RandomPurpose, SecResult<Vec<u8>>)> {
        self.completed.pop_front()
    }
}

/// Commands the security core issues to the pairing protocol
pub trait PairingPort {
    /// Begin pairing, or send a security request when we are the slave
    fn start_pairing(&mut self, peer: BdAddr) -> SecResult<()>;

    fn cancel_pairing(&mut self, peer: BdAddr) -> SecResult<()>;

    fn security_grant(&mut self, peer: BdAddr, status: SmpStatus);

    fn passkey_reply(&mut self, peer: BdAddr, status: SmpStatus, passkey: u32);

    fn confirm_reply(&mut self, peer: BdAddr, status: SmpStatus);

    fn oob_data_reply(&mut self, peer: BdAddr, status: SmpStatus, data: &[u8]);

    /// Offer an LTK request to the pairing protocol. Returns false when no
    /// pairing is running that could supply a session key.
    fn ltk_request(&mut self, peer: BdAddr, rand: &[u8; 8], ediv: u16) -> bool;

    /// Link encryption finished on a link the pairing protocol may be using
    fn link_encrypted(&mut self, peer: BdAddr, encrypted: bool);
}
