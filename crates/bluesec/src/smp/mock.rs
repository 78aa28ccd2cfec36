//! Port doubles for unit tests

use super::ports::{PairingPort, RandomPurpose, RandomSource};
use super::types::SmpStatus;
use crate::error::{HciError, SecResult, SecurityError};
use crate::gap::BdAddr;
use crate::hci::{HciCommand, HciTransport, RecordingTransport};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Random source whose requests are answered by the test
#[derive(Debug, Default)]
pub struct ScriptedRandom {
    pub requests: VecDeque<(RandomPurpose, usize)>,
    pub completions: VecDeque<(RandomPurpose, SecResult<Vec<u8>>)>,
    pub reject_requests: bool,
}

impl ScriptedRandom {
    pub fn take_request(&mut self) -> Option<(RandomPurpose, usize)> {
        self.requests.pop_front()
    }

    /// Answer every outstanding request with `fill`, delivered on the next poll
    pub fn complete_all(&mut self, fill: u8) {
        while let Some((purpose, len)) = self.requests.pop_front() {
            self.completions.push_back((purpose, Ok(vec![fill; len])));
        }
    }

    pub fn fail_next(&mut self) {
        if let Some((purpose, _)) = self.requests.pop_front() {
            self.completions
                .push_back((purpose, Err(SecurityError::CryptoFailure("rng".into()))));
        }
    }
}

impl RandomSource for ScriptedRandom {
    fn request_random(&mut self, purpose: RandomPurpose, len: usize) -> SecResult<()> {
        if self.reject_requests {
            return Err(SecurityError::CryptoFailure("random source offline".into()));
        }
        self.requests.push_back((purpose, len));
        Ok(())
    }

    fn poll_completion(&mut self) -> Option<(RandomPurpose, SecResult<Vec<u8>>)> {
        self.completions.pop_front()
    }
}

/// Handle to a [`ScriptedRandom`] kept by the test after the manager takes ownership
#[derive(Debug, Clone, Default)]
pub struct SharedRandom(pub Arc<Mutex<ScriptedRandom>>);

impl SharedRandom {
    pub fn with<R>(&self, f: impl FnOnce(&mut ScriptedRandom) -> R) -> R {
        let mut guard = self.0.lock().unwrap();
        f(&mut guard)
    }
}

impl RandomSource for SharedRandom {
    fn request_random(&mut self, purpose: RandomPurpose, len: usize) -> SecResult<()> {
        self.with(|r| r.request_random(purpose, len))
    }

    fn poll_completion(&mut self) -> Option<(RandomPurpose, SecResult<Vec<u8>>)> {
        self.with(|r| r.poll_completion())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SharedTransport(pub Arc<Mutex<RecordingTransport>>);

impl SharedTransport {
    pub fn pop(&self) -> Option<HciCommand> {
        self.0.lock().unwrap().pop()
    }

    pub fn drain(&self) -> Vec<HciCommand> {
        let mut inner = self.0.lock().unwrap();
        std::iter::from_fn(|| inner.pop()).collect()
    }
}

impl HciTransport for SharedTransport {
    fn send_command(&mut self, command: HciCommand) -> Result<(), HciError> {
        self.0.lock().unwrap().send_command(command)
    }
}

/// Commands received by [`RecordingPairingPort`]
#[derive(Debug, Clone, PartialEq)]
pub enum PairingCall {
    Start(BdAddr),
    Cancel(BdAddr),
    Grant(BdAddr, SmpStatus),
    Passkey(BdAddr, SmpStatus, u32),
    Confirm(BdAddr, SmpStatus),
    Oob(BdAddr, SmpStatus, Vec<u8>),
    LtkRequest(BdAddr, [u8; 8], u16),
    LinkEncrypted(BdAddr, bool),
}

#[derive(Debug, Default)]
pub struct PairingLog {
    pub calls: Vec<PairingCall>,
    pub refuse_start: bool,
    /// Answer LTK requests as the pairing protocol's own business
    pub claim_ltk_requests: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RecordingPairingPort(pub Arc<Mutex<PairingLog>>);

impl RecordingPairingPort {
    pub fn calls(&self) -> Vec<PairingCall> {
        self.0.lock().unwrap().calls.clone()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().calls.clear();
    }

    pub fn set_refuse_start(&self, refuse: bool) {
        self.0.lock().unwrap().refuse_start = refuse;
    }

    pub fn set_claim_ltk_requests(&self, claim: bool) {
        self.0.lock().unwrap().claim_ltk_requests = claim;
    }

    fn record(&self, call: PairingCall) {
        self.0.lock().unwrap().calls.push(call);
    }
}

impl PairingPort for RecordingPairingPort {
    fn start_pairing(&mut self, peer: BdAddr) -> SecResult<()> {
        self.record(PairingCall::Start(peer));
        if self.0.lock().unwrap().refuse_start {
            return Err(SecurityError::WrongMode);
        }
        Ok(())
    }

    fn cancel_pairing(&mut self, peer: BdAddr) -> SecResult<()> {
        self.record(PairingCall::Cancel(peer));
        Ok(())
    }

    fn security_grant(&mut self, peer: BdAddr, status: SmpStatus) {
        self.record(PairingCall::Grant(peer, status));
    }

    fn passkey_reply(&mut self, peer: BdAddr, status: SmpStatus, passkey: u32) {
        self.record(PairingCall::Passkey(peer, status, passkey));
    }

    fn confirm_reply(&mut self, peer: BdAddr, status: SmpStatus) {
        self.record(PairingCall::Confirm(peer, status));
    }

    fn oob_data_reply(&mut self, peer: BdAddr, status: SmpStatus, data: &[u8]) {
        self.record(PairingCall::Oob(peer, status, data.to_vec()));
    }

    fn ltk_request(&mut self, peer: BdAddr, rand: &[u8; 8], ediv: u16) -> bool {
        self.record(PairingCall::LtkRequest(peer, *rand, ediv));
        self.0.lock().unwrap().claim_ltk_requests
    }

    fn link_encrypted(&mut self, peer: BdAddr, encrypted: bool) {
        self.record(PairingCall::LinkEncrypted(peer, encrypted));
    }
}
