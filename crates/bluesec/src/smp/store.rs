//! Bounded store of device security records
//!
//! Records live in an arena of slots and are addressed by [`RecordHandle`],
//! a slot index paired with the slot's generation. A handle taken before an
//! asynchronous step stays valid until its record is removed, and a stale
//! handle never aliases a record allocated later in the same slot.

use super::record::DeviceSecurityRecord;
use super::types::{SecurityFlags, SecurityState};
use crate::error::{SecResult, SecurityError};
use crate::gap::{AddressType, BdAddr};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Stable reference to a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordHandle {
    index: usize,
    generation: u32,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    record: Option<DeviceSecurityRecord>,
}

/// Indexed collection of per-peer records
#[derive(Debug)]
pub struct RecordStore {
    slots: Vec<Slot>,
    capacity: usize,
    /// Resolved random address to owning record
    rpa_index: HashMap<BdAddr, RecordHandle>,
}

impl RecordStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            rpa_index: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.record.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, handle: RecordHandle) -> Option<&DeviceSecurityRecord> {
        self.slots
            .get(handle.index)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.record.as_ref())
    }

    pub fn get_mut(&mut self, handle: RecordHandle) -> Option<&mut DeviceSecurityRecord> {
        self.slots
            .get_mut(handle.index)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.record.as_mut())
    }

    /// Look up a record by handle, failing with `NotFound` if it is gone
    pub fn find_by_handle(&self, handle: RecordHandle) -> SecResult<&DeviceSecurityRecord> {
        self.get(handle).ok_or(SecurityError::NotFound)
    }

    pub fn iter(&self) -> impl Iterator<Item = (RecordHandle, &DeviceSecurityRecord)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.record.as_ref().map(|r| {
                (
                    RecordHandle {
                        index,
                        generation: slot.generation,
                    },
                    r,
                )
            })
        })
    }

    /// Find by identity, pseudo or current resolved address
    pub fn find(&self, addr: &BdAddr) -> Option<RecordHandle> {
        if let Some(handle) = self.rpa_index.get(addr) {
            if self.get(*handle).is_some() {
                return Some(*handle);
            }
        }
        self.iter()
            .find(|(_, r)| r.matches_addr(addr))
            .map(|(h, _)| h)
    }

    /// Find the record bound to an HCI connection handle
    pub fn find_by_conn_handle(&self, conn_handle: u16) -> Option<RecordHandle> {
        self.iter()
            .find(|(_, r)| r.ble_hci_handle == Some(conn_handle))
            .map(|(h, _)| h)
    }

    /// Find by identity address, matching the type only where the peer told us one
    pub fn find_by_identity(&self, addr: &BdAddr, addr_type: AddressType) -> Option<RecordHandle> {
        self.iter()
            .find(|(_, r)| match &r.keys.peer_id {
                Some(id) => id.static_addr == *addr && id.addr_type == addr_type,
                None => r.bd_addr == *addr && r.ble_addr_type == addr_type,
            })
            .map(|(h, _)| h)
    }

    /// Allocate a fresh record. Fails with `Exhausted` when every slot is taken.
    pub fn alloc(&mut self, addr: BdAddr) -> SecResult<RecordHandle> {
        let record = DeviceSecurityRecord::new(addr);

        if let Some(index) = self.slots.iter().position(|s| s.record.is_none()) {
            let slot = &mut self.slots[index];
            slot.record = Some(record);
            debug!(%addr, index, "reused security record slot");
            return Ok(RecordHandle {
                index,
                generation: slot.generation,
            });
        }

        if self.slots.len() >= self.capacity {
            warn!(%addr, capacity = self.capacity, "security record store exhausted");
            return Err(SecurityError::Exhausted);
        }

        self.slots.push(Slot {
            generation: 0,
            record: Some(record),
        });
        let index = self.slots.len() - 1;
        debug!(%addr, index, "allocated security record");
        Ok(RecordHandle {
            index,
            generation: 0,
        })
    }

    pub fn find_or_alloc(&mut self, addr: BdAddr) -> SecResult<RecordHandle> {
        match self.find(&addr) {
            Some(handle) => Ok(handle),
            None => self.alloc(addr),
        }
    }

    /// Remove a record, invalidating every handle to it
    pub fn remove(&mut self, handle: RecordHandle) -> Option<DeviceSecurityRecord> {
        let slot = self
            .slots
            .get_mut(handle.index)
            .filter(|s| s.generation == handle.generation)?;
        let record = slot.record.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.rpa_index.retain(|_, h| *h != handle);
        debug!(addr = %record.bd_addr, "removed security record");
        Some(record)
    }

    /// Point a resolved random address at its record
    pub fn index_rpa(&mut self, rpa: BdAddr, handle: RecordHandle) {
        self.rpa_index.retain(|_, h| *h != handle);
        self.rpa_index.insert(rpa, handle);
    }

    /// Merge every other record sharing this record's identity address into it.
    ///
    /// Keys present on this record win; keys only the duplicate holds are
    /// carried over along with its BR/EDR state. Returns the handles of the
    /// merged records, which are no longer valid; a repeated call returns none.
    pub fn consolidate(&mut self, handle: RecordHandle) -> SecResult<Vec<RecordHandle>> {
        let identity = self.find_by_handle(handle)?.bd_addr;

        let duplicates: Vec<RecordHandle> = self
            .iter()
            .filter(|(h, r)| {
                *h != handle && (r.bd_addr == identity || r.pseudo_addr == identity)
            })
            .map(|(h, _)| h)
            .collect();

        let mut merged = Vec::with_capacity(duplicates.len());
        for dup in duplicates {
            let Some(other) = self.remove(dup) else {
                continue;
            };
            let Some(target) = self.get_mut(handle) else {
                return Err(SecurityError::NotFound);
            };
            target.device_type |= other.device_type;
            target.keys.merge_missing(&other.keys);
            if target.link_key.is_none() {
                target.link_key = other.link_key;
            }
            if target.name.is_none() {
                target.name = other.name;
            }
            target.sec_flags |= other.sec_flags
                & (SecurityFlags::LINK_KEY_KNOWN
                    | SecurityFlags::LINK_KEY_AUTHED
                    | SecurityFlags::NAME_KNOWN
                    | SecurityFlags::AUTHENTICATED);
            if target.ble_hci_handle.is_none() && other.ble_hci_handle.is_some() {
                // The live link and whatever is running on it move along
                target.ble_hci_handle = other.ble_hci_handle;
                target.role = other.role;
                target.sec_flags |=
                    other.sec_flags & (SecurityFlags::LE_ENCRYPTED | SecurityFlags::LE_AUTHENTICATED);
                if target.sec_state == SecurityState::Idle {
                    target.sec_state = other.sec_state;
                }
                if target.enc_key_size == 0 {
                    target.enc_key_size = other.enc_key_size;
                }
            }
            if let Some(rpa) = other.cur_rand_addr {
                if target.cur_rand_addr.is_none() {
                    target.cur_rand_addr = Some(rpa);
                    target.active_addr_type = other.active_addr_type;
                }
            }
            merged.push(dup);
        }

        if !merged.is_empty() {
            info!(addr = %identity, merged = merged.len(), "consolidated security records");
            if let Some(rpa) = self.get(handle).and_then(|r| r.cur_rand_addr) {
                self.index_rpa(rpa, handle);
            }
        }
        Ok(merged)
    }
}
