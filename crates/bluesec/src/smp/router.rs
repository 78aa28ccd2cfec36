//! Pairing protocol integration
//!
//! The pairing protocol reports everything through [`PairingEvent`]s. The
//! router updates the affected record, tracks the single pairing session,
//! arms the post-failure teardown timer and reports one terminal
//! `PairingComplete` per pairing attempt.

use super::encryption::EncryptionNegotiator;
use super::keys::LeKey;
use super::ports::PairingPort;
use super::privacy::AddressPrivacyEngine;
use super::store::{RecordHandle, RecordStore};
use super::types::*;
use crate::error::{SecResult, SecurityError};
use crate::gap::BdAddr;
use crate::hci::constants::HCI_ERR_PEER_USER;
use crate::hci::{HciCommand, HciTransport};
use bitflags::bitflags;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Pairing exchange parameters, as proposed and as answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoCapabilityRequest {
    pub io_capability: IoCapability,
    pub oob_data_present: bool,
    pub auth_req: AuthRequirements,
    pub max_key_size: u8,
    pub init_keys: KeyDistribution,
    pub resp_keys: KeyDistribution,
}

/// Events raised by the pairing protocol
#[derive(Debug, Clone, PartialEq)]
pub enum PairingEvent {
    IoCapabilityRequest(IoCapabilityRequest),
    SecurityRequest,
    PasskeyNotification(u32),
    PasskeyRequest,
    NumericComparisonRequest(u32),
    OobRequest,
    KeyDistributed(LeKey),
    Complete {
        status: SmpStatus,
        is_pair_cancel: bool,
    },
}

/// Local pairing preferences
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingPolicy {
    pub io_capability: IoCapability,
    pub oob_data_present: bool,
    pub bonding: bool,
    pub mitm: bool,
    pub secure_connections: bool,
    pub max_key_size: u8,
    pub pairing_timeout: Duration,
    pub disconnect_on_failure: bool,
    pub post_failure_disconnect: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PairingState {
    #[default]
    Idle,
    AwaitingCapabilities,
    AwaitingUserInput,
    AwaitingCompletion,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PairingFlags: u8 {
        const LOCALLY_INITIATED = 0x01;
        const PEER_INITIATED = 0x02;
        const DISCONNECT_WHEN_DONE = 0x04;
        const LE_ACTIVE = 0x08;
    }
}

/// The one pairing attempt in progress
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PairingSession {
    pub state: PairingState,
    pub flags: PairingFlags,
    pub peer: Option<BdAddr>,
    pub deadline: Option<Instant>,
}

impl PairingSession {
    pub fn is_active(&self) -> bool {
        self.state != PairingState::Idle
    }

    fn reset(&mut self) {
        *self = PairingSession::default();
    }
}

/// Collaborators the router works on, borrowed from the manager per call
pub struct RouterContext<'a> {
    pub store: &'a mut RecordStore,
    pub negotiator: &'a mut EncryptionNegotiator,
    pub privacy: &'a mut AddressPrivacyEngine,
    pub local_irk: [u8; 16],
    pub hci: &'a mut dyn HciTransport,
    pub pairing: &'a mut dyn PairingPort,
    pub events: &'a mut Vec<SecurityEvent>,
    pub now: Instant,
}

#[derive(Debug)]
pub struct PairingCallbackRouter {
    policy: PairingPolicy,
    session: PairingSession,
    /// Pending ACL teardowns: connection handle and due time
    teardowns: Vec<(u16, Instant)>,
    /// Peers whose attempt already ended in a reported timeout
    timed_out: HashSet<BdAddr>,
}

impl PairingCallbackRouter {
    pub fn new(policy: PairingPolicy) -> Self {
        Self {
            policy,
            session: PairingSession::default(),
            teardowns: Vec::new(),
            timed_out: HashSet::new(),
        }
    }

    pub fn session(&self) -> &PairingSession {
        &self.session
    }

    pub fn policy(&self) -> &PairingPolicy {
        &self.policy
    }

    pub fn pending_teardown(&self, conn_handle: u16) -> Option<Instant> {
        self.teardowns
            .iter()
            .find(|(h, _)| *h == conn_handle)
            .map(|(_, t)| *t)
    }

    fn record_handle(ctx: &RouterContext<'_>, peer: &BdAddr) -> SecResult<RecordHandle> {
        ctx.store.find(peer).ok_or_else(|| {
            error!(%peer, "pairing event for unknown device");
            SecurityError::NotFound
        })
    }

    fn begin_session(&mut self, peer: BdAddr, state: PairingState, flags: PairingFlags, now: Instant) {
        if self.session.peer != Some(peer) {
            self.session.flags = PairingFlags::empty();
        }
        self.session.peer = Some(peer);
        self.session.state = state;
        self.session.flags |= flags;
        if self.session.deadline.is_none() {
            self.session.deadline = Some(now + self.policy.pairing_timeout);
        }
        self.timed_out.remove(&peer);
    }

    fn set_state_for(&mut self, peer: &BdAddr, state: PairingState) {
        if self.session.peer.as_ref() == Some(peer) {
            self.session.state = state;
        }
    }

    /// Handle one event from the pairing protocol. Capability requests are
    /// answered with the parameters to use.
    pub fn on_event(
        &mut self,
        ctx: &mut RouterContext<'_>,
        peer: BdAddr,
        event: PairingEvent,
    ) -> SecResult<Option<IoCapabilityRequest>> {
        let handle = Self::record_handle(ctx, &peer)?;
        debug!(%peer, ?event, "pairing event");

        match event {
            PairingEvent::IoCapabilityRequest(request) => {
                if !self.session.is_active() {
                    self.begin_session(
                        peer,
                        PairingState::AwaitingCompletion,
                        PairingFlags::PEER_INITIATED | PairingFlags::LE_ACTIVE,
                        ctx.now,
                    );
                } else {
                    self.set_state_for(&peer, PairingState::AwaitingCompletion);
                }
                let required = ctx
                    .store
                    .get(handle)
                    .map(|r| r.security_required)
                    .unwrap_or_default();
                Ok(Some(self.io_capabilities(request, required)))
            }

            PairingEvent::SecurityRequest => {
                if self.session.is_active() && self.session.peer != Some(peer) {
                    debug!(%peer, "ignoring security request while pairing another device");
                    return Ok(None);
                }
                self.begin_session(
                    peer,
                    PairingState::AwaitingCapabilities,
                    PairingFlags::PEER_INITIATED | PairingFlags::LE_ACTIVE,
                    ctx.now,
                );
                if let Some(record) = ctx.store.get_mut(handle) {
                    record.sec_state = SecurityState::Authenticating;
                }
                ctx.events.push(SecurityEvent::SecurityRequest(peer));
                Ok(None)
            }

            PairingEvent::PasskeyNotification(_)
            | PairingEvent::PasskeyRequest
            | PairingEvent::NumericComparisonRequest(_)
            | PairingEvent::OobRequest => {
                if let Some(record) = ctx.store.get_mut(handle) {
                    record.sec_flags |= SecurityFlags::LE_AUTHENTICATED;
                    record.sec_state = SecurityState::Authenticating;
                }
                self.begin_session(
                    peer,
                    PairingState::AwaitingUserInput,
                    PairingFlags::LE_ACTIVE,
                    ctx.now,
                );
                ctx.events.push(match event {
                    PairingEvent::PasskeyNotification(passkey) => {
                        SecurityEvent::PasskeyNotification(peer, passkey)
                    }
                    PairingEvent::NumericComparisonRequest(value) => {
                        SecurityEvent::NumericComparisonRequest(peer, value)
                    }
                    PairingEvent::OobRequest => SecurityEvent::OobRequest(peer),
                    _ => SecurityEvent::PasskeyRequest(peer),
                });
                Ok(None)
            }

            PairingEvent::KeyDistributed(key) => {
                self.save_key(ctx, handle, key, true)?;
                Ok(None)
            }

            PairingEvent::Complete {
                status,
                is_pair_cancel,
            } => {
                self.on_complete(ctx, handle, peer, status, is_pair_cancel);
                Ok(None)
            }
        }
    }

    /// Apply local policy and the record's requirements to a capability request
    fn io_capabilities(
        &self,
        request: IoCapabilityRequest,
        required: ServiceSecurity,
    ) -> IoCapabilityRequest {
        let mut req = request;
        req.io_capability = self.policy.io_capability;
        req.oob_data_present = self.policy.oob_data_present;
        req.max_key_size = req.max_key_size.min(self.policy.max_key_size);
        req.auth_req.bonding = self.policy.bonding;
        req.auth_req.mitm |= self.policy.mitm;
        req.auth_req.secure_connections = self.policy.secure_connections;

        if required.contains(ServiceSecurity::IN_MITM) {
            req.auth_req.mitm = true;
        }
        if !req.auth_req.bonding {
            debug!("non-bonding pairing, no keys exchanged");
            req.init_keys = KeyDistribution::none();
            req.resp_keys = KeyDistribution::none();
        }
        if req.io_capability == IoCapability::NoInputNoOutput && !req.oob_data_present {
            req.auth_req.mitm = false;
        }
        if !req.auth_req.secure_connections {
            req.auth_req.keypress_notifications = false;
            req.init_keys.link_key = false;
            req.resp_keys.link_key = false;
        }
        debug!(
            io_cap = %req.io_capability,
            io_cap_code = req.io_capability.to_u8(),
            auth_req = req.auth_req.to_u8(),
            init_keys = req.init_keys.to_u8(),
            resp_keys = req.resp_keys.to_u8(),
            "answering capability request"
        );
        req
    }

    /// Store a key on a record. A peer IRK moves the record to its identity
    /// address and folds in any older record for the same device.
    pub fn save_key(
        &mut self,
        ctx: &mut RouterContext<'_>,
        handle: RecordHandle,
        key: LeKey,
        notify: bool,
    ) -> SecResult<()> {
        let record = ctx.store.get_mut(handle).ok_or(SecurityError::NotFound)?;
        let previous_identity = record.keys.peer_id.map(|id| id.static_addr);
        let key_type = key.key_type();
        record.save_key(key);
        let addr = record.bd_addr;
        info!(%addr, ?key_type, "saved key");

        if let LeKey::PeerId(id) = key {
            if let Some(old) = previous_identity.filter(|old| *old != id.static_addr) {
                debug!(%old, new = %id.static_addr, "peer identity changed");
                ctx.privacy.unregister_peer(old, ctx.hci)?;
            }
            for merged in ctx.store.consolidate(handle)? {
                ctx.negotiator.transfer(merged, handle, addr);
            }
        }
        if notify {
            ctx.events.push(SecurityEvent::KeyReceived(addr, key));
        }
        Ok(())
    }

    fn on_complete(
        &mut self,
        ctx: &mut RouterContext<'_>,
        handle: RecordHandle,
        peer: BdAddr,
        status: SmpStatus,
        is_pair_cancel: bool,
    ) {
        let already_reported = self.timed_out.remove(&peer);

        let mut bonded = false;
        if let Some(record) = ctx.store.get_mut(handle) {
            match status {
                SmpStatus::Success => {
                    record.sec_state = SecurityState::Idle;
                    bonded = !record.keys.is_empty();
                }
                SmpStatus::Failed(reason) => {
                    let arm = self.policy.disconnect_on_failure
                        && reason != SmpReason::ConnectionTimeout;
                    match (arm, record.ble_hci_handle) {
                        (true, Some(conn_handle)) => {
                            debug!(%peer, %reason, code = reason.to_u8(), "pairing failed, scheduling link teardown");
                            let due = ctx.now + self.policy.post_failure_disconnect;
                            self.teardowns.retain(|(h, _)| *h != conn_handle);
                            self.teardowns.push((conn_handle, due));
                        }
                        _ => {
                            debug!(%peer, %reason, code = reason.to_u8(), "pairing failed, keeping link");
                            record.sec_state = SecurityState::Idle;
                        }
                    }
                }
            }
        }

        if self.session.peer == Some(peer) {
            self.session.reset();
        }

        if bonded {
            if let Some(record) = ctx.store.get(handle) {
                if let Err(e) = ctx.privacy.register_peer(record, &ctx.local_irk, ctx.hci) {
                    warn!(%peer, error = %e, "failed to add peer to resolving list");
                }
            }
        }

        let result = match status {
            SmpStatus::Success => Ok(()),
            SmpStatus::Failed(reason) => Err(SecurityError::ProtocolFailure(reason)),
        };
        ctx.negotiator.complete(handle, peer, result);

        if is_pair_cancel {
            ctx.events.push(SecurityEvent::PairingCancelled(peer));
        }
        if already_reported {
            debug!(%peer, "completion after reported timeout");
            return;
        }
        info!(%peer, ?status, bonded, "pairing complete");
        ctx.events.push(SecurityEvent::PairingComplete {
            peer,
            status,
            bonded,
        });
    }

    /// Application asks to pair with `peer`
    pub fn start_pairing(&mut self, ctx: &mut RouterContext<'_>, peer: BdAddr) -> SecResult<()> {
        let handle = Self::record_handle(ctx, &peer)?;
        if self.session.is_active() && self.session.peer != Some(peer) {
            return Err(SecurityError::Busy);
        }
        let addr = ctx.store.find_by_handle(handle)?.bd_addr;

        if let Err(e) = ctx.pairing.start_pairing(addr) {
            warn!(%peer, error = %e, "pairing could not be started");
            ctx.events.push(SecurityEvent::PairingComplete {
                peer,
                status: SmpStatus::Failed(SmpReason::UnspecifiedReason),
                bonded: false,
            });
            return Err(e);
        }

        self.begin_session(
            peer,
            PairingState::AwaitingCapabilities,
            PairingFlags::LOCALLY_INITIATED | PairingFlags::LE_ACTIVE,
            ctx.now,
        );
        if let Some(record) = ctx.store.get_mut(handle) {
            record.sec_state = SecurityState::Authenticating;
        }
        Ok(())
    }

    pub fn cancel_pairing(&mut self, ctx: &mut RouterContext<'_>, peer: BdAddr) -> SecResult<()> {
        Self::record_handle(ctx, &peer)?;
        ctx.pairing.cancel_pairing(peer)
    }

    pub fn security_grant(&mut self, ctx: &mut RouterContext<'_>, peer: BdAddr, accept: bool) -> SecResult<()> {
        Self::record_handle(ctx, &peer)?;
        let status = SmpStatus::from_accept(accept, SmpReason::RepeatedAttempts);
        ctx.pairing.security_grant(peer, status);
        Ok(())
    }

    fn mark_authenticated(&mut self, ctx: &mut RouterContext<'_>, peer: &BdAddr) -> SecResult<()> {
        let handle = Self::record_handle(ctx, peer)?;
        if let Some(record) = ctx.store.get_mut(handle) {
            record.sec_flags |= SecurityFlags::LE_AUTHENTICATED;
        }
        self.set_state_for(peer, PairingState::AwaitingCompletion);
        Ok(())
    }

    pub fn passkey_reply(
        &mut self,
        ctx: &mut RouterContext<'_>,
        peer: BdAddr,
        accept: bool,
        passkey: u32,
    ) -> SecResult<()> {
        if passkey > 999_999 {
            return Err(SecurityError::InvalidParameter(format!(
                "passkey {passkey} has more than six digits"
            )));
        }
        self.mark_authenticated(ctx, &peer)?;
        let status = SmpStatus::from_accept(accept, SmpReason::PasskeyEntryFailed);
        ctx.pairing.passkey_reply(peer, status, passkey);
        Ok(())
    }

    pub fn confirm_reply(&mut self, ctx: &mut RouterContext<'_>, peer: BdAddr, accept: bool) -> SecResult<()> {
        self.mark_authenticated(ctx, &peer)?;
        let status = SmpStatus::from_accept(accept, SmpReason::PasskeyEntryFailed);
        ctx.pairing.confirm_reply(peer, status);
        Ok(())
    }

    pub fn oob_data_reply(
        &mut self,
        ctx: &mut RouterContext<'_>,
        peer: BdAddr,
        accept: bool,
        data: &[u8],
    ) -> SecResult<()> {
        self.mark_authenticated(ctx, &peer)?;
        let status = SmpStatus::from_accept(accept, SmpReason::OobNotAvailable);
        ctx.pairing.oob_data_reply(peer, status, data);
        Ok(())
    }

    /// Drop teardown timers for a link that is already gone
    pub fn on_disconnected(&mut self, conn_handle: u16) {
        self.teardowns.retain(|(h, _)| *h != conn_handle);
    }

    /// Expire the pairing session and run due link teardowns
    pub fn process_timeouts(&mut self, ctx: &mut RouterContext<'_>) {
        if let (true, Some(deadline)) = (self.session.is_active(), self.session.deadline) {
            if ctx.now >= deadline {
                self.expire_session(ctx);
            }
        }

        let now = ctx.now;
        let (due, pending): (Vec<_>, Vec<_>) =
            self.teardowns.drain(..).partition(|(_, t)| now >= *t);
        self.teardowns = pending;
        for (conn_handle, _) in due {
            info!(conn_handle, "tearing down link after failed pairing");
            if let Err(e) = ctx.hci.send_command(HciCommand::Disconnect {
                handle: conn_handle,
                reason: HCI_ERR_PEER_USER,
            }) {
                warn!(conn_handle, error = %e, "disconnect command rejected");
            }
        }
    }

    fn expire_session(&mut self, ctx: &mut RouterContext<'_>) {
        let peer = self.session.peer;
        self.session.reset();
        let Some(peer) = peer else {
            return;
        };
        warn!(%peer, "pairing timed out");

        let handle = ctx.store.find(&peer);
        if let Some(record) = handle.and_then(|h| ctx.store.get_mut(h)) {
            record.sec_state = SecurityState::Idle;
        }
        if let Err(e) = ctx.pairing.cancel_pairing(peer) {
            debug!(%peer, error = %e, "cancel after timeout rejected");
        }
        self.timed_out.insert(peer);
        if let Some(h) = handle {
            ctx.negotiator.complete(h, peer, Err(SecurityError::Timeout));
        }
        ctx.events.push(SecurityEvent::PairingComplete {
            peer,
            status: SmpStatus::Failed(SmpReason::PairingTimeout),
            bonded: false,
        });
    }

    /// Next instant at which `process_timeouts` has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        let session = self.session.deadline.filter(|_| self.session.is_active());
        self.teardowns
            .iter()
            .map(|(_, t)| *t)
            .chain(session)
            .min()
    }
}
