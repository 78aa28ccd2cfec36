//! Data signing with per-peer CSRKs and sign counters

use super::constants::{SIGNATURE_LEN, SIGN_COUNTER_LEN, SIGN_MAC_LEN};
use super::ports::CryptoPort;
use super::store::RecordStore;
use crate::error::{SecResult, SecurityError};
use crate::gap::BdAddr;
use byteorder::{ByteOrder, LittleEndian};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

/// Sign counter followed by the truncated MAC, as carried over the air
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataSignature {
    pub counter: u32,
    pub mac: [u8; SIGN_MAC_LEN],
}

impl DataSignature {
    pub fn to_bytes(&self) -> [u8; SIGNATURE_LEN] {
        let mut out = [0u8; SIGNATURE_LEN];
        LittleEndian::write_u32(&mut out[..SIGN_COUNTER_LEN], self.counter);
        out[SIGN_COUNTER_LEN..].copy_from_slice(&self.mac);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> SecResult<Self> {
        if bytes.len() != SIGNATURE_LEN {
            return Err(SecurityError::InvalidParameter(format!(
                "signature must be {SIGNATURE_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut mac = [0u8; SIGN_MAC_LEN];
        mac.copy_from_slice(&bytes[SIGN_COUNTER_LEN..]);
        Ok(Self {
            counter: LittleEndian::read_u32(&bytes[..SIGN_COUNTER_LEN]),
            mac,
        })
    }
}

/// CMAC over `payload || counter`, truncated to the most significant 64 bits
fn compute_mac(
    crypto: &dyn CryptoPort,
    csrk: &[u8; 16],
    payload: &[u8],
    counter: u32,
) -> SecResult<[u8; SIGN_MAC_LEN]> {
    let mut message = Vec::with_capacity(payload.len() + SIGN_COUNTER_LEN);
    message.extend_from_slice(payload);
    let mut counter_bytes = [0u8; SIGN_COUNTER_LEN];
    LittleEndian::write_u32(&mut counter_bytes, counter);
    message.extend_from_slice(&counter_bytes);

    let full = crypto.cmac(csrk, &message)?;
    let mut mac = [0u8; SIGN_MAC_LEN];
    mac.copy_from_slice(&full[16 - SIGN_MAC_LEN..]);
    Ok(mac)
}

pub struct DataSigningEngine<'a> {
    crypto: &'a dyn CryptoPort,
}

impl<'a> DataSigningEngine<'a> {
    pub fn new(crypto: &'a dyn CryptoPort) -> Self {
        Self { crypto }
    }

    /// Sign `payload` with the local CSRK for `addr`. The local counter only
    /// moves forward once the MAC has been produced.
    pub fn sign(&self, store: &mut RecordStore, addr: &BdAddr, payload: &[u8]) -> SecResult<DataSignature> {
        let record = store
            .find(addr)
            .and_then(|h| store.get_mut(h))
            .ok_or(SecurityError::NotFound)?;
        let Some(lcsrk) = record.keys.local_csrk.as_mut() else {
            warn!(%addr, "no local signing key");
            return Err(SecurityError::MissingKey);
        };

        let counter = lcsrk.counter;
        let mac = compute_mac(self.crypto, &lcsrk.csrk, payload, counter)?;
        lcsrk.counter = counter.wrapping_add(1);
        debug!(%addr, counter, "signed data");
        Ok(DataSignature { counter, mac })
    }

    /// Check a peer's signature. Replayed counters and unknown peers are
    /// rejected without touching the record.
    pub fn verify(
        &self,
        store: &mut RecordStore,
        addr: &BdAddr,
        payload: &[u8],
        signature: &DataSignature,
    ) -> bool {
        let Some(record) = store.find(addr).and_then(|h| store.get_mut(h)) else {
            debug!(%addr, "verify for unknown device");
            return false;
        };
        let Some(pcsrk) = record.keys.peer_csrk.as_mut() else {
            debug!(%addr, "no peer signing key");
            return false;
        };
        if signature.counter < pcsrk.counter {
            warn!(%addr, counter = signature.counter, expected = pcsrk.counter, "replayed sign counter");
            return false;
        }

        let expected = match compute_mac(self.crypto, &pcsrk.csrk, payload, signature.counter) {
            Ok(mac) => mac,
            Err(e) => {
                warn!(%addr, error = %e, "signature check failed");
                return false;
            }
        };
        if !bool::from(expected.ct_eq(&signature.mac)) {
            debug!(%addr, "signature mismatch");
            return false;
        }
        pcsrk.counter = signature.counter.saturating_add(1);
        true
    }
}
