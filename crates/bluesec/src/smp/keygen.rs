//! Local key hierarchy generation
//!
//! Identity Root (IR) and Encryption Root (ER) are each assembled from two
//! 8-byte random draws. Once IR is complete the Diversifier Hiding Key and
//! the Identity Resolving Key are derived from it:
//!
//! ```text
//! DHK = e(IR, 0x03)
//! IRK = e(IR, 0x01)
//! ```
//!
//! A full identity reset continues into ER generation. A failed step zeroes
//! the keys of its own chain and stops; the other chain is untouched.

use super::constants::{DHK_PLAINTEXT_ID, IRK_PLAINTEXT_ID};
use super::ports::{CryptoPort, RandomPurpose, RandomSource};
use super::types::{LocalKeyType, SecurityEvent};
use crate::error::{SecResult, SecurityError};
use tracing::{debug, error, info};

const HALF_ROOT_LEN: usize = 8;

/// Device-wide key material
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalIdentityKeys {
    pub ir: [u8; 16],
    pub irk: [u8; 16],
    pub dhk: [u8; 16],
    pub er: [u8; 16],
}

impl LocalIdentityKeys {
    pub fn has_identity(&self) -> bool {
        self.irk != [0u8; 16]
    }

    pub fn has_encryption_root(&self) -> bool {
        self.er != [0u8; 16]
    }
}

/// Generation progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeygenState {
    #[default]
    Idle,
    AwaitingIrLow,
    AwaitingIrHigh,
    AwaitingErLow,
    AwaitingErHigh,
}

/// Input that moves the chain forward
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeygenEvent {
    RandomReady(Vec<u8>),
    RandomFailed(SecurityError),
}

#[derive(Debug, Default)]
pub struct LocalIdentityKeyGenerator {
    keys: LocalIdentityKeys,
    state: KeygenState,
}

impl LocalIdentityKeyGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> &LocalIdentityKeys {
        &self.keys
    }

    pub fn state(&self) -> KeygenState {
        self.state
    }

    /// Purpose of the outstanding random request, if any
    pub fn pending_purpose(&self) -> Option<RandomPurpose> {
        match self.state {
            KeygenState::Idle => None,
            KeygenState::AwaitingIrLow | KeygenState::AwaitingIrHigh => {
                Some(RandomPurpose::IdentityRoot)
            }
            KeygenState::AwaitingErLow | KeygenState::AwaitingErHigh => {
                Some(RandomPurpose::EncryptionRoot)
            }
        }
    }

    /// Regenerate IR, DHK, IRK and then ER
    pub fn reset_identity(
        &mut self,
        rng: &mut dyn RandomSource,
        events: &mut Vec<SecurityEvent>,
    ) -> SecResult<()> {
        if self.state != KeygenState::Idle {
            return Err(SecurityError::Busy);
        }
        info!("generating local identity root");
        self.state = KeygenState::AwaitingIrLow;
        if let Err(e) = rng.request_random(RandomPurpose::IdentityRoot, HALF_ROOT_LEN) {
            self.fail(LocalKeyType::Identity, &e, events);
            return Err(e);
        }
        Ok(())
    }

    /// Regenerate ER alone
    pub fn generate_encryption_root(
        &mut self,
        rng: &mut dyn RandomSource,
        events: &mut Vec<SecurityEvent>,
    ) -> SecResult<()> {
        if self.state != KeygenState::Idle {
            return Err(SecurityError::Busy);
        }
        self.start_encryption_root(rng, events);
        if self.state == KeygenState::Idle {
            return Err(SecurityError::CryptoFailure(
                "random request for encryption root rejected".to_string(),
            ));
        }
        Ok(())
    }

    /// Load persisted keys instead of generating them
    pub fn restore(&mut self, kind: LocalKeyType, keys: &LocalIdentityKeys) {
        match kind {
            LocalKeyType::Identity => {
                self.keys.ir = keys.ir;
                self.keys.irk = keys.irk;
                self.keys.dhk = keys.dhk;
            }
            LocalKeyType::EncryptionRoot => self.keys.er = keys.er,
        }
        debug!(?kind, "restored local keys");
    }

    /// Feed a random completion. Returns false if no step was waiting for it.
    pub fn on_random(
        &mut self,
        purpose: RandomPurpose,
        result: SecResult<Vec<u8>>,
        crypto: &dyn CryptoPort,
        rng: &mut dyn RandomSource,
        events: &mut Vec<SecurityEvent>,
    ) -> bool {
        if self.pending_purpose() != Some(purpose) {
            return false;
        }
        let event = match result {
            Ok(bytes) => KeygenEvent::RandomReady(bytes),
            Err(e) => KeygenEvent::RandomFailed(e),
        };
        self.advance(event, crypto, rng, events);
        true
    }

    /// Single entry point of the state machine
    pub fn advance(
        &mut self,
        event: KeygenEvent,
        crypto: &dyn CryptoPort,
        rng: &mut dyn RandomSource,
        events: &mut Vec<SecurityEvent>,
    ) {
        let chain = match self.state {
            KeygenState::Idle => return,
            KeygenState::AwaitingIrLow | KeygenState::AwaitingIrHigh => LocalKeyType::Identity,
            KeygenState::AwaitingErLow | KeygenState::AwaitingErHigh => {
                LocalKeyType::EncryptionRoot
            }
        };

        let bytes = match event {
            KeygenEvent::RandomReady(bytes) if bytes.len() >= HALF_ROOT_LEN => bytes,
            KeygenEvent::RandomReady(bytes) => {
                let e = SecurityError::CryptoFailure(format!(
                    "random source returned {} bytes",
                    bytes.len()
                ));
                self.fail(chain, &e, events);
                return;
            }
            KeygenEvent::RandomFailed(e) => {
                self.fail(chain, &e, events);
                return;
            }
        };
        let half = &bytes[..HALF_ROOT_LEN];

        match self.state {
            KeygenState::AwaitingIrLow => {
                self.keys.ir[..HALF_ROOT_LEN].copy_from_slice(half);
                self.state = KeygenState::AwaitingIrHigh;
                if let Err(e) = rng.request_random(RandomPurpose::IdentityRoot, HALF_ROOT_LEN) {
                    self.fail(LocalKeyType::Identity, &e, events);
                }
            }
            KeygenState::AwaitingIrHigh => {
                self.keys.ir[HALF_ROOT_LEN..].copy_from_slice(half);
                if let Err(e) = self.derive_identity(crypto) {
                    self.fail(LocalKeyType::Identity, &e, events);
                    return;
                }
                info!("local identity keys ready");
                events.push(SecurityEvent::LocalKeysReady(LocalKeyType::Identity));
                self.start_encryption_root(rng, events);
            }
            KeygenState::AwaitingErLow => {
                self.keys.er[..HALF_ROOT_LEN].copy_from_slice(half);
                self.state = KeygenState::AwaitingErHigh;
                if let Err(e) = rng.request_random(RandomPurpose::EncryptionRoot, HALF_ROOT_LEN) {
                    self.fail(LocalKeyType::EncryptionRoot, &e, events);
                }
            }
            KeygenState::AwaitingErHigh => {
                self.keys.er[HALF_ROOT_LEN..].copy_from_slice(half);
                self.state = KeygenState::Idle;
                info!("local encryption root ready");
                events.push(SecurityEvent::LocalKeysReady(LocalKeyType::EncryptionRoot));
            }
            KeygenState::Idle => {}
        }
    }

    fn derive_identity(&mut self, crypto: &dyn CryptoPort) -> SecResult<()> {
        self.keys.dhk = crypto.encrypt(&self.keys.ir, &[DHK_PLAINTEXT_ID])?;
        self.keys.irk = crypto.encrypt(&self.keys.ir, &[IRK_PLAINTEXT_ID])?;
        Ok(())
    }

    fn start_encryption_root(&mut self, rng: &mut dyn RandomSource, events: &mut Vec<SecurityEvent>) {
        debug!("generating local encryption root");
        self.state = KeygenState::AwaitingErLow;
        if let Err(e) = rng.request_random(RandomPurpose::EncryptionRoot, HALF_ROOT_LEN) {
            self.fail(LocalKeyType::EncryptionRoot, &e, events);
        }
    }

    fn fail(&mut self, chain: LocalKeyType, cause: &SecurityError, events: &mut Vec<SecurityEvent>) {
        error!(?chain, %cause, "local key generation failed, zeroing keys");
        match chain {
            LocalKeyType::Identity => {
                self.keys.ir = [0u8; 16];
                self.keys.irk = [0u8; 16];
                self.keys.dhk = [0u8; 16];
            }
            LocalKeyType::EncryptionRoot => self.keys.er = [0u8; 16],
        }
        self.state = KeygenState::Idle;
        events.push(SecurityEvent::LocalKeysFailed(chain));
    }
}
