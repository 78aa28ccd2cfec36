//! Resolvable private addresses
//!
//! Generation draws a 24-bit `prand`, tags its two top bits as resolvable,
//! and prepends `hash = ah(IRK, prand)`:
//!
//! ```text
//! octet:  0    1    2  | 3    4    5
//!         hash (LSB..) | prand (.., 0b01xxxxxx)
//! ```
//!
//! Resolution checks one bonded candidate per step so that a long bonded
//! list never blocks the event loop. Only one resolution runs at a time.

use super::crypto::ah;
use super::ports::{CryptoPort, RandomPurpose, RandomSource};
use super::record::DeviceSecurityRecord;
use super::store::{RecordHandle, RecordStore};
use super::types::{ActiveAddressType, SecurityEvent};
use crate::error::{SecResult, SecurityError};
use crate::gap::{AddressType, BdAddr, RANDOM_ADDRESS_RESOLVABLE};
use crate::hci::{HciCommand, HciTransport};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

const PRAND_LEN: usize = 3;

/// Completion for [`AddressPrivacyEngine::resolve`]
pub type ResolveCallback = Box<dyn FnOnce(Option<RecordHandle>) + Send>;

struct ResolutionState {
    rpa: BdAddr,
    candidates: Vec<RecordHandle>,
    cursor: usize,
    on_done: ResolveCallback,
}

/// A bonded peer known to the local (and optionally controller) resolving list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvingListEntry {
    pub addr_type: AddressType,
    pub identity: BdAddr,
    pub irk: [u8; 16],
}

/// Build an RPA from an IRK and a 24-bit random value
pub fn generate_with_irk(
    crypto: &dyn CryptoPort,
    irk: &[u8; 16],
    prand: [u8; 3],
) -> SecResult<BdAddr> {
    let mut prand = prand;
    prand[2] = (prand[2] & 0x3F) | RANDOM_ADDRESS_RESOLVABLE;
    let hash = ah(crypto, irk, &prand)?;
    Ok(BdAddr::new([
        hash[0], hash[1], hash[2], prand[0], prand[1], prand[2],
    ]))
}

/// True if `rpa` was generated from `irk`
pub fn rpa_matches_irk(crypto: &dyn CryptoPort, irk: &[u8; 16], rpa: &BdAddr) -> SecResult<bool> {
    Ok(ah(crypto, irk, &rpa.rpa_prand())? == rpa.rpa_hash())
}

fn is_candidate(record: &DeviceSecurityRecord) -> bool {
    record.device_type.is_le_capable() && record.keys.peer_id.is_some()
}

pub struct AddressPrivacyEngine {
    rpa_timeout: Duration,
    controller_resolving_list: bool,
    local_rpa: Option<BdAddr>,
    rpa_requested: bool,
    next_refresh: Option<Instant>,
    resolution: Option<ResolutionState>,
    resolving_list: Vec<ResolvingListEntry>,
}

impl std::fmt::Debug for AddressPrivacyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressPrivacyEngine")
            .field("local_rpa", &self.local_rpa)
            .field("rpa_requested", &self.rpa_requested)
            .field("next_refresh", &self.next_refresh)
            .field("resolving", &self.resolution.as_ref().map(|r| r.rpa))
            .field("resolving_list_len", &self.resolving_list.len())
            .finish()
    }
}

impl AddressPrivacyEngine {
    pub fn new(rpa_timeout: Duration, controller_resolving_list: bool) -> Self {
        Self {
            rpa_timeout,
            controller_resolving_list,
            local_rpa: None,
            rpa_requested: false,
            next_refresh: None,
            resolution: None,
            resolving_list: Vec::new(),
        }
    }

    pub fn local_rpa(&self) -> Option<BdAddr> {
        self.local_rpa
    }

    pub fn is_resolving(&self) -> bool {
        self.resolution.is_some()
    }

    pub fn resolving_list(&self) -> &[ResolvingListEntry] {
        &self.resolving_list
    }

    pub fn next_refresh(&self) -> Option<Instant> {
        self.next_refresh
    }

    /// Ask for the random part of a new local RPA
    pub fn request_rpa(&mut self, rng: &mut dyn RandomSource) -> SecResult<()> {
        if self.rpa_requested {
            return Err(SecurityError::Busy);
        }
        rng.request_random(RandomPurpose::PrivateAddress, PRAND_LEN)?;
        self.rpa_requested = true;
        Ok(())
    }

    /// Finish RPA generation once the random bytes arrive
    pub fn on_random(
        &mut self,
        result: SecResult<Vec<u8>>,
        local_irk: &[u8; 16],
        crypto: &dyn CryptoPort,
        hci: &mut dyn HciTransport,
        now: Instant,
        events: &mut Vec<SecurityEvent>,
    ) -> SecResult<BdAddr> {
        if !self.rpa_requested {
            return Err(SecurityError::InvalidParameter(
                "no private address requested".to_string(),
            ));
        }
        self.rpa_requested = false;

        let bytes = result?;
        if bytes.len() < PRAND_LEN {
            return Err(SecurityError::CryptoFailure(format!(
                "random source returned {} bytes",
                bytes.len()
            )));
        }
        let rpa = generate_with_irk(crypto, local_irk, [bytes[0], bytes[1], bytes[2]])?;

        hci.send_command(HciCommand::LeSetRandomAddress { address: rpa.bytes })?;
        self.local_rpa = Some(rpa);
        self.next_refresh = Some(now + self.rpa_timeout);
        info!(%rpa, "new local resolvable private address");
        events.push(SecurityEvent::LocalAddressChanged(rpa));
        Ok(rpa)
    }

    /// True when the local RPA is due for rotation
    pub fn refresh_due(&self, now: Instant) -> bool {
        !self.rpa_requested && self.next_refresh.is_some_and(|t| now >= t)
    }

    /// Stop rotating the local address
    pub fn stop_refresh(&mut self) {
        self.next_refresh = None;
    }

    /// Start resolving `rpa` against every bonded LE record holding a peer IRK.
    ///
    /// `on_done` runs exactly once: immediately with `None` if another
    /// resolution is running or the address is not resolvable, otherwise when
    /// [`advance_resolution`](Self::advance_resolution) finds a match or runs
    /// out of candidates.
    pub fn resolve(
        &mut self,
        rpa: BdAddr,
        store: &RecordStore,
        on_done: ResolveCallback,
    ) -> SecResult<()> {
        if self.resolution.is_some() {
            debug!(%rpa, "address resolution already in progress");
            on_done(None);
            return Err(SecurityError::Busy);
        }
        if !rpa.is_resolvable_private() {
            warn!(%rpa, "refusing to resolve a non-resolvable address");
            on_done(None);
            return Err(SecurityError::InvalidParameter(format!(
                "{rpa} is not a resolvable private address"
            )));
        }

        let candidates = store
            .iter()
            .filter(|(_, r)| is_candidate(r))
            .map(|(h, _)| h)
            .collect();
        self.resolution = Some(ResolutionState {
            rpa,
            candidates,
            cursor: 0,
            on_done,
        });
        Ok(())
    }

    /// Test the next candidate. Returns true while the resolution is still running.
    pub fn advance_resolution(&mut self, store: &mut RecordStore, crypto: &dyn CryptoPort) -> bool {
        let Some(state) = self.resolution.as_mut() else {
            return false;
        };
        let rpa = state.rpa;
        let next = state.candidates.get(state.cursor).copied();
        state.cursor += 1;

        let Some(handle) = next else {
            if let Some(done) = self.resolution.take() {
                debug!(%rpa, "address did not resolve");
                (done.on_done)(None);
            }
            return false;
        };

        // The record may have been removed or rekeyed since the scan started
        let irk = match store.get(handle) {
            Some(r) if is_candidate(r) => r.keys.peer_id.map(|k| k.irk),
            _ => None,
        };
        let Some(irk) = irk else {
            return true;
        };

        match rpa_matches_irk(crypto, &irk, &rpa) {
            Ok(true) => {
                if let Some(record) = store.get_mut(handle) {
                    record.cur_rand_addr = Some(rpa);
                    record.active_addr_type = ActiveAddressType::ResolvedRandom;
                }
                store.index_rpa(rpa, handle);
                if let Some(done) = self.resolution.take() {
                    info!(%rpa, "resolved private address");
                    (done.on_done)(Some(handle));
                }
                false
            }
            Ok(false) => true,
            Err(e) => {
                warn!(%rpa, error = %e, "resolution step failed, skipping candidate");
                true
            }
        }
    }

    /// Drive any outstanding resolution to completion
    pub fn run_resolution(&mut self, store: &mut RecordStore, crypto: &dyn CryptoPort) {
        while self.advance_resolution(store, crypto) {}
    }

    /// Add a bonded peer's IRK to the resolving list
    pub fn register_peer(
        &mut self,
        record: &DeviceSecurityRecord,
        local_irk: &[u8; 16],
        hci: &mut dyn HciTransport,
    ) -> SecResult<()> {
        let Some(id) = record.keys.peer_id else {
            return Ok(());
        };
        let entry = ResolvingListEntry {
            addr_type: id.addr_type,
            identity: id.static_addr,
            irk: id.irk,
        };
        if self.resolving_list.contains(&entry) {
            trace!(identity = %entry.identity, "peer already on resolving list");
            return Ok(());
        }
        self.resolving_list.retain(|e| e.identity != entry.identity);
        self.resolving_list.push(entry);
        debug!(identity = %entry.identity, "added peer to resolving list");

        if self.controller_resolving_list {
            hci.send_command(HciCommand::LeAddDeviceToResolvingList {
                peer_identity_address_type: entry.addr_type.into(),
                peer_identity_address: entry.identity.bytes,
                peer_irk: entry.irk,
                local_irk: *local_irk,
            })?;
        }
        Ok(())
    }

    /// Drop a peer from the resolving list
    pub fn unregister_peer(&mut self, identity: BdAddr, hci: &mut dyn HciTransport) -> SecResult<()> {
        let Some(pos) = self.resolving_list.iter().position(|e| e.identity == identity) else {
            return Ok(());
        };
        let entry = self.resolving_list.remove(pos);
        if self.controller_resolving_list {
            hci.send_command(HciCommand::LeRemoveDeviceFromResolvingList {
                peer_identity_address_type: entry.addr_type.into(),
                peer_identity_address: entry.identity.bytes,
            })?;
        }
        Ok(())
    }
}
