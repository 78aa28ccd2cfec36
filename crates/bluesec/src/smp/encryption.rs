//! Link encryption decisions and the start-encryption exchange

use super::ports::PairingPort;
use super::record::DeviceSecurityRecord;
use super::store::{RecordHandle, RecordStore};
use super::types::*;
use crate::error::{SecResult, SecurityError};
use crate::gap::{BdAddr, LinkRole};
use crate::hci::constants::HCI_SUCCESS;
use crate::hci::{HciCommand, HciTransport};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Key used to start encryption
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionKey {
    /// Short-term key handed over by the pairing protocol
    SessionKey([u8; 16]),
    /// The stored peer LTK with its RAND and EDIV
    Stored,
}

/// How far `set_encryption` got on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionProgress {
    /// Result already delivered
    Done,
    /// LE Start Encryption sent, completion follows Encryption Change
    Encrypting,
    /// The link needs pairing with `peer` before the callback can fire
    PairingNeeded { handle: RecordHandle, peer: BdAddr },
}

/// Level the link offers right now
pub fn current_level(record: &DeviceSecurityRecord) -> SecurityLevel {
    if record.is_link_encrypted() {
        if record.sec_flags.contains(SecurityFlags::LE_AUTHENTICATED) {
            SecurityLevel::Authenticated
        } else {
            SecurityLevel::Unauthenticated
        }
    } else if let Some(key) = &record.keys.peer_enc {
        key.sec_level
    } else {
        SecurityLevel::None
    }
}

/// Compare the link against a required level, ignoring any running procedure
pub fn link_sec_check(record: &DeviceSecurityRecord, mitm_required: bool) -> SecurityAction {
    let required = if mitm_required {
        SecurityLevel::Authenticated
    } else {
        SecurityLevel::Unauthenticated
    };
    let current = current_level(record);
    debug!(?current, ?required, "link security check");

    if current >= required {
        if record.is_link_encrypted() {
            SecurityAction::Ok
        } else {
            SecurityAction::EncryptExisting
        }
    } else if mitm_required {
        SecurityAction::PairMitm
    } else {
        SecurityAction::PairNoMitm
    }
}

/// Decide what a link needs before `required` is satisfied
pub fn determine_action(
    is_originator: bool,
    record: &DeviceSecurityRecord,
    required: ServiceSecurity,
) -> SecurityAction {
    if record.sec_state.is_busy() {
        debug!(addr = %record.bd_addr, state = ?record.sec_state, "security procedure racing, discarding");
        return SecurityAction::Discard;
    }
    if !required.requires_security(is_originator) {
        return SecurityAction::Ok;
    }
    link_sec_check(record, required.requires_mitm(is_originator))
}

#[derive(Default)]
pub struct EncryptionNegotiator {
    pending: HashMap<RecordHandle, EncryptionCallback>,
    last_rand: [u8; 8],
    last_ediv: u16,
}

impl std::fmt::Debug for EncryptionNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionNegotiator")
            .field("pending", &self.pending.len())
            .field("last_ediv", &self.last_ediv)
            .finish()
    }
}

impl EncryptionNegotiator {
    pub fn new() -> Self {
        Self::default()
    }

    /// RAND and EDIV of the most recent LTK request
    pub fn last_ltk_request(&self) -> ([u8; 8], u16) {
        (self.last_rand, self.last_ediv)
    }

    pub fn has_pending(&self, handle: RecordHandle) -> bool {
        self.pending.contains_key(&handle)
    }

    /// Register the completion for a record, failing any completion it replaces
    pub fn register_callback(&mut self, handle: RecordHandle, addr: BdAddr, callback: EncryptionCallback) {
        if let Some(previous) = self.pending.insert(handle, callback) {
            warn!(%addr, "replacing pending encryption callback");
            previous(addr, Err(SecurityError::Busy));
        }
    }

    /// Report the terminal result for a record. Returns false if nobody was waiting.
    pub fn complete(&mut self, handle: RecordHandle, addr: BdAddr, result: SecResult<()>) -> bool {
        match self.pending.remove(&handle) {
            Some(callback) => {
                callback(addr, result);
                true
            }
            None => false,
        }
    }

    /// Hand a pending completion over to the record that absorbed `from`
    pub fn transfer(&mut self, from: RecordHandle, to: RecordHandle, addr: BdAddr) {
        if let Some(callback) = self.pending.remove(&from) {
            debug!(%addr, "moving pending encryption callback to merged record");
            self.register_callback(to, addr, callback);
        }
    }

    /// Run a `determine_action` result. `callback` fires exactly once, right
    /// away when the outcome is already known, otherwise when encryption or
    /// pairing finishes. Pairing is left to the caller, which must fail the
    /// registered callback if it cannot start it.
    pub fn set_encryption(
        &mut self,
        store: &mut RecordStore,
        addr: &BdAddr,
        action: SecurityAction,
        callback: Option<EncryptionCallback>,
        hci: &mut dyn HciTransport,
    ) -> SecResult<EncryptionProgress> {
        let finish = |callback: Option<EncryptionCallback>, result: SecResult<()>| {
            if let Some(cb) = callback {
                cb(*addr, result.clone());
            }
            result.map(|_| EncryptionProgress::Done)
        };

        let Some(handle) = store.find(addr) else {
            warn!(%addr, ?action, "set_encryption without a device record");
            return finish(callback, Err(SecurityError::WrongMode));
        };

        match action {
            SecurityAction::Ok => return finish(callback, Ok(())),
            SecurityAction::Discard => return finish(callback, Err(SecurityError::Busy)),
            _ => {}
        }

        let (role, has_penc, bd_addr) = {
            let Some(record) = store.get_mut(handle) else {
                return finish(callback, Err(SecurityError::NotFound));
            };
            if action == SecurityAction::PairMitm {
                record.security_required |= ServiceSecurity::IN_MITM;
            }
            (record.role, record.keys.peer_enc.is_some(), record.bd_addr)
        };
        debug!(%addr, ?action, ?role, "set encryption");

        let mut encrypt = action == SecurityAction::EncryptExisting && role == LinkRole::Master && has_penc;
        if role == LinkRole::Master && action != SecurityAction::EncryptExisting {
            // Existing keys may already be good enough
            if let Some(record) = store.get(handle) {
                let recheck = link_sec_check(record, action == SecurityAction::PairMitm);
                encrypt = matches!(recheck, SecurityAction::EncryptExisting | SecurityAction::Ok);
            }
        }

        if encrypt {
            if let Err(e) = self.start_encrypt(store, addr, EncryptionKey::Stored, hci) {
                return finish(callback, Err(e));
            }
        }
        if let Some(cb) = callback {
            self.register_callback(handle, bd_addr, cb);
        }

        Ok(if encrypt {
            EncryptionProgress::Encrypting
        } else {
            EncryptionProgress::PairingNeeded {
                handle,
                peer: bd_addr,
            }
        })
    }

    /// Send LE Start Encryption for the record's link
    pub fn start_encrypt(
        &mut self,
        store: &mut RecordStore,
        addr: &BdAddr,
        key: EncryptionKey,
        hci: &mut dyn HciTransport,
    ) -> SecResult<()> {
        let record = store
            .find(addr)
            .and_then(|h| store.get_mut(h))
            .ok_or(SecurityError::WrongMode)?;
        let Some(conn_handle) = record.ble_hci_handle else {
            warn!(%addr, "link is not active, cannot encrypt");
            return Err(SecurityError::WrongMode);
        };
        if record.sec_state == SecurityState::Encrypting {
            warn!(%addr, "link encryption already in progress");
            return Err(SecurityError::Busy);
        }

        let command = match key {
            EncryptionKey::SessionKey(stk) => HciCommand::LeStartEncryption {
                handle: conn_handle,
                rand: [0u8; 8],
                ediv: 0,
                ltk: stk,
            },
            EncryptionKey::Stored => {
                let Some(penc) = record.keys.peer_enc else {
                    warn!(%addr, "no key available to encrypt the link");
                    return Err(SecurityError::MissingKey);
                };
                HciCommand::LeStartEncryption {
                    handle: conn_handle,
                    rand: penc.rand,
                    ediv: penc.ediv,
                    ltk: penc.ltk,
                }
            }
        };

        hci.send_command(command)?;
        // A pairing in progress keeps its Authenticating state
        if record.sec_state == SecurityState::Idle {
            record.sec_state = SecurityState::Encrypting;
        }
        info!(%addr, conn_handle, "started link encryption");
        Ok(())
    }

    /// Controller asks the host for an LTK (we are the slave)
    pub fn on_ltk_request(
        &mut self,
        store: &mut RecordStore,
        conn_handle: u16,
        rand: [u8; 8],
        ediv: u16,
        pairing: &mut dyn PairingPort,
        hci: &mut dyn HciTransport,
    ) -> SecResult<()> {
        self.last_rand = rand;
        self.last_ediv = ediv;

        let Some(addr) = store
            .find_by_conn_handle(conn_handle)
            .and_then(|h| store.get(h))
            .map(|r| r.bd_addr)
        else {
            warn!(conn_handle, "LTK request for unknown link");
            hci.send_command(HciCommand::LeLtkRequestNegativeReply { handle: conn_handle })?;
            return Ok(());
        };

        debug!(%addr, conn_handle, ediv, "LTK request");
        if pairing.ltk_request(addr, &rand, ediv) {
            return Ok(());
        }
        self.ltk_request_reply(store, &addr, None, hci)
    }

    /// Answer an LTK request with the session key, the local LTK, or a negative reply
    pub fn ltk_request_reply(
        &mut self,
        store: &RecordStore,
        addr: &BdAddr,
        session_key: Option<[u8; 16]>,
        hci: &mut dyn HciTransport,
    ) -> SecResult<()> {
        let record = store
            .find(addr)
            .and_then(|h| store.get(h))
            .ok_or(SecurityError::NotFound)?;
        let handle = record.ble_hci_handle.ok_or(SecurityError::WrongMode)?;

        let command = match (session_key, record.keys.local_enc) {
            (Some(stk), _) => HciCommand::LeLtkRequestReply { handle, ltk: stk },
            (None, Some(lenc)) => HciCommand::LeLtkRequestReply {
                handle,
                ltk: lenc.ltk,
            },
            (None, None) => {
                debug!(%addr, "no local LTK, rejecting LTK request");
                HciCommand::LeLtkRequestNegativeReply { handle }
            }
        };
        hci.send_command(command)?;
        Ok(())
    }

    /// Encryption Change for a record's link
    pub fn on_link_encrypted(
        &mut self,
        store: &mut RecordStore,
        handle: RecordHandle,
        status: u8,
        enabled: bool,
        pairing: &mut dyn PairingPort,
    ) {
        let Some(record) = store.get_mut(handle) else {
            warn!("encryption change for a removed record");
            return;
        };
        let encrypted = status == HCI_SUCCESS && enabled;
        let was_encrypting = record.sec_state == SecurityState::Encrypting;
        let addr = record.bd_addr;

        if encrypted {
            record.sec_flags |= SecurityFlags::LE_ENCRYPTED;
            if record.sec_flags.contains(SecurityFlags::LE_LINK_KEY_AUTHED) {
                record.sec_flags |= SecurityFlags::LE_AUTHENTICATED;
            }
            if record.enc_key_size == 0 {
                if let Some(penc) = &record.keys.peer_enc {
                    record.enc_key_size = penc.key_size;
                }
            }
        } else {
            record.sec_flags.remove(SecurityFlags::LE_ENCRYPTED);
        }
        record.sec_state = SecurityState::Idle;
        info!(%addr, encrypted, status, "link encryption changed");

        pairing.link_encrypted(addr, encrypted);

        if was_encrypting {
            let result = if encrypted {
                Ok(())
            } else {
                Err(SecurityError::EncryptionFailed(status))
            };
            self.complete(handle, addr, result);
        }
    }

    /// Fail any callback left behind by a dropped link
    pub fn on_disconnected(&mut self, handle: RecordHandle, addr: BdAddr) {
        self.complete(handle, addr, Err(SecurityError::WrongMode));
    }
}
