//! Security manager
//!
//! This module provides the main interface of the security core. The
//! manager owns the record store and every engine, talks to the outside
//! world through the port traits, and hands the application one
//! [`SecurityEvent`] at a time through its callback. All entry points take
//! `&mut self`: the core is driven from a single event loop.

use super::crypto::SoftCrypto;
use super::encryption::{self, EncryptionKey, EncryptionNegotiator, EncryptionProgress};
use super::keygen::{LocalIdentityKeyGenerator, LocalIdentityKeys};
use super::keys::LeKey;
use super::ports::{CryptoPort, PairingPort, RandomPurpose, RandomSource, ThreadRngSource};
use super::privacy::{AddressPrivacyEngine, ResolveCallback, ResolvingListEntry};
use super::record::{ConnParams, DeviceSecurityRecord};
use super::router::{
    IoCapabilityRequest, PairingCallbackRouter, PairingEvent, PairingPolicy, PairingSession,
    RouterContext,
};
use super::signing::{DataSignature, DataSigningEngine};
use super::store::{RecordHandle, RecordStore};
use super::types::*;
use crate::config::{BondedDevice, LocalKeysConfig, PersistedKey, SecurityConfig};
use crate::error::{SecResult, SecurityError};
use crate::gap::{AddressType, BdAddr, DeviceType, LinkRole};
use crate::hci::constants::HCI_SUCCESS;
use crate::hci::{HciEvent, HciTransport, SecurityHciEvent};
use std::time::Instant;
use tracing::{debug, info, warn};

/// BLE security manager
pub struct SecurityManager {
    config: SecurityConfig,
    store: RecordStore,
    router: PairingCallbackRouter,
    keygen: LocalIdentityKeyGenerator,
    privacy: AddressPrivacyEngine,
    negotiator: EncryptionNegotiator,

    crypto: Box<dyn CryptoPort + Send>,
    rng: Box<dyn RandomSource + Send>,
    hci: Box<dyn HciTransport + Send>,
    pairing: Box<dyn PairingPort + Send>,

    /// Event callback
    event_callback: Option<SecurityEventCallback>,
    /// Events raised since the last dispatch
    outbox: Vec<SecurityEvent>,
}

impl SecurityManager {
    /// Create a manager, restoring local keys and bonded devices from `config`
    pub fn new(
        config: SecurityConfig,
        crypto: Box<dyn CryptoPort + Send>,
        rng: Box<dyn RandomSource + Send>,
        hci: Box<dyn HciTransport + Send>,
        pairing: Box<dyn PairingPort + Send>,
    ) -> SecResult<Self> {
        config.validate()?;

        let mut manager = Self {
            store: RecordStore::new(config.max_device_records),
            router: PairingCallbackRouter::new(PairingPolicy::from(&config.pairing)),
            keygen: LocalIdentityKeyGenerator::new(),
            privacy: AddressPrivacyEngine::new(
                config.privacy.rpa_timeout(),
                config.privacy.controller_resolving_list,
            ),
            negotiator: EncryptionNegotiator::new(),
            crypto,
            rng,
            hci,
            pairing,
            event_callback: None,
            outbox: Vec::new(),
            config,
        };

        if let Some(local) = manager.config.local_keys.clone() {
            let (identity, er) = local.to_keys()?;
            if let Some(keys) = identity {
                manager.load_local_keys(LocalKeyType::Identity, &keys);
            }
            if let Some(er) = er {
                let keys = LocalIdentityKeys {
                    er,
                    ..Default::default()
                };
                manager.load_local_keys(LocalKeyType::EncryptionRoot, &keys);
            }
        }

        for device in manager.config.bonded.clone() {
            manager.restore_bonded(&device)?;
        }
        info!(
            bonded = manager.config.bonded.len(),
            capacity = manager.store.capacity(),
            "security manager ready"
        );

        if manager.config.privacy.enabled && manager.keygen.keys().has_identity() {
            manager.generate_rpa()?;
        }
        Ok(manager)
    }

    /// Manager backed by the software crypto engine and the thread-local CSPRNG
    pub fn with_software_ports(
        config: SecurityConfig,
        hci: Box<dyn HciTransport + Send>,
        pairing: Box<dyn PairingPort + Send>,
    ) -> SecResult<Self> {
        Self::new(
            config,
            Box::new(SoftCrypto),
            Box::new(ThreadRngSource::new()),
            hci,
            pairing,
        )
    }

    /// Set the event callback
    pub fn set_event_callback<F>(&mut self, callback: F)
    where
        F: FnMut(SecurityEvent) + Send + 'static,
    {
        self.event_callback = Some(Box::new(callback));
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn record(&self, addr: &BdAddr) -> Option<&DeviceSecurityRecord> {
        self.store.find(addr).and_then(|h| self.store.get(h))
    }

    pub fn pairing_session(&self) -> &PairingSession {
        self.router.session()
    }

    fn dispatch(&mut self) {
        if self.outbox.is_empty() {
            return;
        }
        let events = std::mem::take(&mut self.outbox);
        match self.event_callback.as_mut() {
            Some(callback) => {
                for event in events {
                    callback(event);
                }
            }
            None => debug!(dropped = events.len(), "no event callback registered"),
        }
    }

    /// Run `f` on the router with the collaborators it needs
    fn with_router<R>(
        &mut self,
        now: Instant,
        f: impl FnOnce(&mut PairingCallbackRouter, &mut RouterContext<'_>) -> R,
    ) -> R {
        let local_irk = self.keygen.keys().irk;
        let mut ctx = RouterContext {
            store: &mut self.store,
            negotiator: &mut self.negotiator,
            privacy: &mut self.privacy,
            local_irk,
            hci: self.hci.as_mut(),
            pairing: self.pairing.as_mut(),
            events: &mut self.outbox,
            now,
        };
        f(&mut self.router, &mut ctx)
    }

    fn handle_of(&self, addr: &BdAddr) -> SecResult<RecordHandle> {
        self.store.find(addr).ok_or(SecurityError::NotFound)
    }

    // Device records

    /// Add or update an LE device, typically when restoring from storage
    pub fn add_le_device(
        &mut self,
        addr: BdAddr,
        name: Option<&str>,
        device_type: DeviceType,
        addr_type: AddressType,
    ) -> SecResult<RecordHandle> {
        let handle = self.store.find_or_alloc(addr)?;
        let record = self.store.get_mut(handle).ok_or(SecurityError::NotFound)?;
        if let Some(name) = name {
            record.name = Some(name.to_string());
            record.sec_flags |= SecurityFlags::NAME_KNOWN;
        }
        record.device_type |= device_type;
        record.ble_addr_type = addr_type;
        debug!(%addr, ?device_type, ?addr_type, "added LE device");
        Ok(handle)
    }

    /// Restore a key into an existing record without notifying the application
    pub fn add_le_key(&mut self, addr: &BdAddr, key: LeKey) -> SecResult<()> {
        let handle = self.handle_of(addr)?;
        self.with_router(Instant::now(), |router, ctx| {
            router.save_key(ctx, handle, key, false)?;
            if matches!(key, LeKey::PeerId(_)) {
                if let Some(record) = ctx.store.get(handle) {
                    ctx.privacy.register_peer(record, &ctx.local_irk, ctx.hci)?;
                }
            }
            Ok(())
        })
    }

    fn restore_bonded(&mut self, device: &BondedDevice) -> SecResult<()> {
        let device_type = DeviceType::from_bits_truncate(device.device_type);
        self.add_le_device(
            device.address,
            device.name.as_deref(),
            device_type,
            device.address_type,
        )?;
        // The identity key may move the record, so look it up by its current address
        let mut addr = device.address;
        for persisted in &device.keys {
            let key = persisted.to_key()?;
            self.add_le_key(&addr, key)?;
            if let LeKey::PeerId(id) = key {
                addr = id.static_addr;
            }
        }
        Ok(())
    }

    /// Bonded records in their persisted form
    pub fn bonded_devices(&self) -> Vec<BondedDevice> {
        self.store
            .iter()
            .filter(|(_, r)| !r.keys.is_empty())
            .map(|(_, r)| BondedDevice {
                address: r.bd_addr,
                address_type: r.ble_addr_type,
                device_type: r.device_type.bits(),
                name: r.name.clone(),
                keys: r.keys.to_list().iter().map(PersistedKey::from_key).collect(),
            })
            .collect()
    }

    /// Forget a device. Refused while a procedure is running on it.
    pub fn remove_device(&mut self, addr: &BdAddr) -> SecResult<()> {
        let handle = self.handle_of(addr)?;
        let record = self.store.find_by_handle(handle)?;
        if record.sec_state.is_busy() {
            warn!(%addr, state = ?record.sec_state, "cannot remove device during a security procedure");
            return Err(SecurityError::Busy);
        }
        let identity = record.keys.peer_id.map(|id| id.static_addr);
        if let Some(identity) = identity {
            self.privacy.unregister_peer(identity, self.hci.as_mut())?;
        }
        if let Some(record) = self.store.remove(handle) {
            info!(addr = %record.bd_addr, "removed device");
        }
        Ok(())
    }

    pub fn set_pref_conn_params(
        &mut self,
        addr: &BdAddr,
        min_interval: u16,
        max_interval: u16,
        slave_latency: u16,
        supervision_timeout: u16,
    ) -> SecResult<()> {
        let params = ConnParams::new(min_interval, max_interval, slave_latency, supervision_timeout)?;
        let handle = self.handle_of(addr)?;
        let record = self.store.get_mut(handle).ok_or(SecurityError::NotFound)?;
        if !record.device_type.is_le_capable() {
            return Err(SecurityError::WrongMode);
        }
        record.conn_params = params;
        debug!(%addr, ?params, "preferred connection parameters");
        Ok(())
    }

    /// LE link security flags and key size
    pub fn le_security_state(&self, addr: &BdAddr) -> SecResult<(u8, u8)> {
        let handle = self.handle_of(addr)?;
        Ok(self.store.find_by_handle(handle)?.le_security_state())
    }

    pub fn security_procedure_is_running(&self, addr: &BdAddr) -> bool {
        self.record(addr).is_some_and(|r| r.sec_state.is_busy())
    }

    /// Address the peer currently uses on air
    pub fn remote_connection_addr(&self, addr: &BdAddr) -> BdAddr {
        self.record(addr)
            .map(|r| r.remote_connection_addr())
            .unwrap_or(*addr)
    }

    // Connection lifecycle

    /// Bind a new LE connection to its record. On `Exhausted` the link
    /// simply runs without security.
    pub fn on_connected(
        &mut self,
        addr: BdAddr,
        addr_type: AddressType,
        conn_handle: u16,
        role: LinkRole,
    ) -> SecResult<RecordHandle> {
        let existing = self.store.find(&addr);
        let handle = match existing {
            Some(h) => h,
            None => self.store.alloc(addr).map_err(|e| {
                warn!(%addr, error = %e, "no record for new connection, link stays unsecured");
                e
            })?,
        };
        let record = self.store.get_mut(handle).ok_or(SecurityError::NotFound)?;
        if existing.is_none() {
            record.ble_addr_type = addr_type;
        }
        record.device_type |= DeviceType::LE;
        record.ble_hci_handle = Some(conn_handle);
        record.role = role;
        record.enc_key_size = 0;
        if record.cur_rand_addr != Some(addr) && addr != record.bd_addr {
            record.pseudo_addr = addr;
        }
        info!(%addr, conn_handle, ?role, "LE connection");
        Ok(handle)
    }

    pub fn on_disconnected(&mut self, conn_handle: u16) {
        self.router.on_disconnected(conn_handle);
        let Some(handle) = self.store.find_by_conn_handle(conn_handle) else {
            debug!(conn_handle, "disconnection of untracked link");
            return;
        };
        let addr = match self.store.get_mut(handle) {
            Some(record) => {
                record.clear_link();
                record.bd_addr
            }
            None => return,
        };
        info!(%addr, conn_handle, "LE disconnection");
        self.negotiator.on_disconnected(handle, addr);
        self.dispatch();
    }

    /// Feed an HCI event. Events the core does not handle are ignored.
    pub fn handle_hci_event(&mut self, event: &HciEvent) -> SecResult<()> {
        let Some(decoded) = SecurityHciEvent::decode(event)? else {
            return Ok(());
        };
        let result = match decoded {
            SecurityHciEvent::EncryptionChange(change) => {
                match self.store.find_by_conn_handle(change.handle) {
                    Some(handle) => self.negotiator.on_link_encrypted(
                        &mut self.store,
                        handle,
                        change.status,
                        change.enabled,
                        self.pairing.as_mut(),
                    ),
                    None => debug!(handle = change.handle, "encryption change for untracked link"),
                }
                Ok(())
            }
            SecurityHciEvent::DisconnectionComplete(disc) => {
                if disc.status == HCI_SUCCESS {
                    self.on_disconnected(disc.handle);
                }
                Ok(())
            }
            SecurityHciEvent::LongTermKeyRequest(req) => self.negotiator.on_ltk_request(
                &mut self.store,
                req.handle,
                req.rand,
                req.ediv,
                self.pairing.as_mut(),
                self.hci.as_mut(),
            ),
        };
        self.dispatch();
        result
    }

    // Encryption

    /// What has to happen before the link to `addr` meets `required`
    pub fn determine_action(
        &self,
        addr: &BdAddr,
        is_originator: bool,
        required: ServiceSecurity,
    ) -> SecResult<SecurityAction> {
        let handle = self.handle_of(addr)?;
        let record = self.store.find_by_handle(handle)?;
        Ok(encryption::determine_action(is_originator, record, required))
    }

    /// Carry out a security action. `callback` gets exactly one result.
    pub fn set_encryption(
        &mut self,
        addr: &BdAddr,
        action: SecurityAction,
        callback: Option<EncryptionCallback>,
    ) -> SecResult<()> {
        let progress = self.negotiator.set_encryption(
            &mut self.store,
            addr,
            action,
            callback,
            self.hci.as_mut(),
        );
        let result = match progress {
            Ok(EncryptionProgress::PairingNeeded { handle, peer }) => {
                // Slaves end up sending a security request through the same call
                let started =
                    self.with_router(Instant::now(), |router, ctx| router.start_pairing(ctx, peer));
                if let Err(e) = &started {
                    self.negotiator.complete(handle, peer, Err(e.clone()));
                }
                started
            }
            Ok(EncryptionProgress::Done | EncryptionProgress::Encrypting) => Ok(()),
            Err(e) => Err(e),
        };
        self.dispatch();
        result
    }

    /// Encrypt the link with a session key or the stored LTK
    pub fn start_encryption(&mut self, addr: &BdAddr, key: EncryptionKey) -> SecResult<()> {
        self.negotiator
            .start_encrypt(&mut self.store, addr, key, self.hci.as_mut())
    }

    pub fn ltk_request_reply(&mut self, addr: &BdAddr, session_key: Option<[u8; 16]>) -> SecResult<()> {
        self.negotiator
            .ltk_request_reply(&self.store, addr, session_key, self.hci.as_mut())
    }

    // Pairing

    pub fn start_pairing(&mut self, addr: BdAddr) -> SecResult<()> {
        let result = self.with_router(Instant::now(), |router, ctx| router.start_pairing(ctx, addr));
        self.dispatch();
        result
    }

    pub fn cancel_pairing(&mut self, addr: BdAddr) -> SecResult<()> {
        let result = self.with_router(Instant::now(), |router, ctx| router.cancel_pairing(ctx, addr));
        self.dispatch();
        result
    }

    pub fn security_grant(&mut self, addr: BdAddr, accept: bool) -> SecResult<()> {
        self.with_router(Instant::now(), |router, ctx| {
            router.security_grant(ctx, addr, accept)
        })
    }

    pub fn passkey_reply(&mut self, addr: BdAddr, accept: bool, passkey: u32) -> SecResult<()> {
        self.with_router(Instant::now(), |router, ctx| {
            router.passkey_reply(ctx, addr, accept, passkey)
        })
    }

    pub fn confirm_reply(&mut self, addr: BdAddr, accept: bool) -> SecResult<()> {
        self.with_router(Instant::now(), |router, ctx| {
            router.confirm_reply(ctx, addr, accept)
        })
    }

    pub fn oob_data_reply(&mut self, addr: BdAddr, accept: bool, data: &[u8]) -> SecResult<()> {
        self.with_router(Instant::now(), |router, ctx| {
            router.oob_data_reply(ctx, addr, accept, data)
        })
    }

    /// Entry point for the pairing protocol
    pub fn on_pairing_event(
        &mut self,
        peer: BdAddr,
        event: PairingEvent,
    ) -> SecResult<Option<IoCapabilityRequest>> {
        self.on_pairing_event_at(peer, event, Instant::now())
    }

    pub fn on_pairing_event_at(
        &mut self,
        peer: BdAddr,
        event: PairingEvent,
        now: Instant,
    ) -> SecResult<Option<IoCapabilityRequest>> {
        let result = self.with_router(now, |router, ctx| router.on_event(ctx, peer, event));
        self.dispatch();
        result
    }

    // Data signing

    pub fn sign(&mut self, addr: &BdAddr, payload: &[u8]) -> SecResult<DataSignature> {
        DataSigningEngine::new(self.crypto.as_ref()).sign(&mut self.store, addr, payload)
    }

    pub fn verify(&mut self, addr: &BdAddr, payload: &[u8], signature: &DataSignature) -> bool {
        DataSigningEngine::new(self.crypto.as_ref()).verify(&mut self.store, addr, payload, signature)
    }

    // Local keys

    /// Regenerate the whole local key hierarchy
    pub fn reset_identity(&mut self) -> SecResult<()> {
        let result = self.keygen.reset_identity(self.rng.as_mut(), &mut self.outbox);
        self.dispatch();
        result
    }

    pub fn generate_encryption_root(&mut self) -> SecResult<()> {
        let result = self
            .keygen
            .generate_encryption_root(self.rng.as_mut(), &mut self.outbox);
        self.dispatch();
        result
    }

    /// Install persisted local keys instead of generating them
    pub fn load_local_keys(&mut self, kind: LocalKeyType, keys: &LocalIdentityKeys) {
        self.keygen.restore(kind, keys);
    }

    pub fn local_keys(&self) -> &LocalIdentityKeys {
        self.keygen.keys()
    }

    pub fn local_keys_config(&self) -> LocalKeysConfig {
        LocalKeysConfig::from_keys(self.keygen.keys())
    }

    /// Deliver random bytes requested from a host-owned random source
    pub fn on_random(&mut self, purpose: RandomPurpose, result: SecResult<Vec<u8>>) {
        self.on_random_at(purpose, result, Instant::now());
        self.dispatch();
    }

    fn on_random_at(&mut self, purpose: RandomPurpose, result: SecResult<Vec<u8>>, now: Instant) {
        match purpose {
            RandomPurpose::PrivateAddress => {
                let irk = self.keygen.keys().irk;
                if let Err(e) = self.privacy.on_random(
                    result,
                    &irk,
                    self.crypto.as_ref(),
                    self.hci.as_mut(),
                    now,
                    &mut self.outbox,
                ) {
                    warn!(error = %e, "private address generation failed");
                }
            }
            RandomPurpose::IdentityRoot | RandomPurpose::EncryptionRoot => {
                let before = self.outbox.len();
                let handled = self.keygen.on_random(
                    purpose,
                    result,
                    self.crypto.as_ref(),
                    self.rng.as_mut(),
                    &mut self.outbox,
                );
                if !handled {
                    debug!(?purpose, "unexpected random completion");
                }
                let identity_ready = self.outbox[before..]
                    .contains(&SecurityEvent::LocalKeysReady(LocalKeyType::Identity));
                if identity_ready && self.config.privacy.enabled {
                    if let Err(e) = self.generate_rpa() {
                        warn!(error = %e, "could not start private address generation");
                    }
                }
            }
        }
    }

    // Privacy

    /// Start generating a new local resolvable private address
    pub fn generate_rpa(&mut self) -> SecResult<()> {
        if !self.keygen.keys().has_identity() {
            return Err(SecurityError::MissingKey);
        }
        self.privacy.request_rpa(self.rng.as_mut())
    }

    pub fn local_rpa(&self) -> Option<BdAddr> {
        self.privacy.local_rpa()
    }

    /// Bonded peers whose identity keys are registered for resolution
    pub fn resolving_list(&self) -> &[ResolvingListEntry] {
        self.privacy.resolving_list()
    }

    /// Resolve a peer RPA against the bonded records. The work is done by
    /// [`poll`](Self::poll); `on_done` runs exactly once.
    pub fn resolve(&mut self, rpa: BdAddr, on_done: ResolveCallback) -> SecResult<()> {
        self.privacy.resolve(rpa, &self.store, on_done)
    }

    // Event loop

    pub fn process_timeouts(&mut self) {
        self.process_timeouts_at(Instant::now());
    }

    /// Run pairing timeouts, post-failure teardowns and RPA rotation due at `now`
    pub fn process_timeouts_at(&mut self, now: Instant) {
        self.with_router(now, |router, ctx| router.process_timeouts(ctx));

        if self.config.privacy.enabled && self.privacy.refresh_due(now) {
            debug!("rotating local private address");
            if let Err(e) = self.generate_rpa() {
                warn!(error = %e, "private address rotation failed");
            }
        }
        self.dispatch();
    }

    /// Earliest instant at which `process_timeouts` has work
    pub fn next_deadline(&self) -> Option<Instant> {
        let refresh = self
            .privacy
            .next_refresh()
            .filter(|_| self.config.privacy.enabled);
        self.router.next_deadline().into_iter().chain(refresh).min()
    }

    /// Drain random completions and finish any outstanding address resolution
    pub fn poll(&mut self) {
        let now = Instant::now();
        while let Some((purpose, result)) = self.rng.poll_completion() {
            self.on_random_at(purpose, result, now);
        }
        self.privacy
            .run_resolution(&mut self.store, self.crypto.as_ref());
        self.dispatch();
    }
}
