use super::constants::*;
use super::crypto::SoftCrypto;
use super::encryption::EncryptionKey;
use super::keys::*;
use super::mock::{PairingCall, RecordingPairingPort, SharedRandom, SharedTransport};
use super::ports::{CryptoPort, RandomPurpose};
use super::privacy::{generate_with_irk, rpa_matches_irk, AddressPrivacyEngine};
use super::router::{IoCapabilityRequest, PairingEvent, PairingFlags, PairingState};
use super::signing::DataSigningEngine;
use super::store::{RecordHandle, RecordStore};
use super::types::*;
use super::SecurityManager;
use crate::config::{BondedDevice, PersistedKey, SecurityConfig};
use crate::error::{SecResult, SecurityError};
use crate::gap::{AddressType, BdAddr, DeviceType, LinkRole};
use crate::hci::{HciCommand, HciEvent};
use proptest::prelude::*;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const PEER: BdAddr = BdAddr {
    bytes: [0x01, 0x02, 0x03, 0x04, 0x05, 0xC6],
};
const OTHER: BdAddr = BdAddr {
    bytes: [0x11, 0x12, 0x13, 0x14, 0x15, 0xD6],
};

struct Harness {
    mgr: SecurityManager,
    hci: SharedTransport,
    rng: SharedRandom,
    pairing: RecordingPairingPort,
    events: Arc<Mutex<Vec<SecurityEvent>>>,
}

impl Harness {
    fn new(config: SecurityConfig) -> Self {
        let hci = SharedTransport::default();
        let rng = SharedRandom::default();
        let pairing = RecordingPairingPort::default();
        let mut mgr = SecurityManager::new(
            config,
            Box::new(SoftCrypto),
            Box::new(rng.clone()),
            Box::new(hci.clone()),
            Box::new(pairing.clone()),
        )
        .unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        mgr.set_event_callback(move |event| sink.lock().unwrap().push(event));
        Self {
            mgr,
            hci,
            rng,
            pairing,
            events,
        }
    }

    fn take_events(&self) -> Vec<SecurityEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    fn connect(&mut self, addr: BdAddr, conn_handle: u16, role: LinkRole) -> RecordHandle {
        self.mgr
            .on_connected(addr, AddressType::Public, conn_handle, role)
            .unwrap()
    }
}

fn peer_enc(level: SecurityLevel) -> LeKey {
    LeKey::PeerEnc(PeerEncKey {
        ltk: [0x77; 16],
        rand: [1, 2, 3, 4, 5, 6, 7, 8],
        ediv: 0xBEEF,
        sec_level: level,
        key_size: 16,
    })
}

fn peer_id(irk: [u8; 16], identity: BdAddr) -> LeKey {
    LeKey::PeerId(PeerIdKey {
        irk,
        addr_type: AddressType::Public,
        static_addr: identity,
    })
}

type Results = Arc<Mutex<Vec<SecResult<()>>>>;

fn capture() -> (EncryptionCallback, Results) {
    let results: Results = Arc::new(Mutex::new(Vec::new()));
    let sink = results.clone();
    let callback: EncryptionCallback = Box::new(move |_, result| sink.lock().unwrap().push(result));
    (callback, results)
}

fn encryption_change(conn_handle: u16, status: u8, enabled: bool) -> HciEvent {
    let h = conn_handle.to_le_bytes();
    HciEvent::new(0x08, vec![status, h[0], h[1], enabled as u8]).unwrap()
}

fn ltk_request(conn_handle: u16, rand: [u8; 8], ediv: u16) -> HciEvent {
    let mut params = vec![0x05];
    params.extend_from_slice(&conn_handle.to_le_bytes());
    params.extend_from_slice(&rand);
    params.extend_from_slice(&ediv.to_le_bytes());
    HciEvent::new(0x3E, params).unwrap()
}

fn capability_request() -> IoCapabilityRequest {
    IoCapabilityRequest {
        io_capability: IoCapability::KeyboardDisplay,
        oob_data_present: false,
        auth_req: AuthRequirements::new(true, false, true),
        max_key_size: 16,
        init_keys: KeyDistribution::all(),
        resp_keys: KeyDistribution::all(),
    }
}

fn failed(reason: SmpReason) -> PairingEvent {
    PairingEvent::Complete {
        status: SmpStatus::Failed(reason),
        is_pair_cancel: false,
    }
}

fn succeeded() -> PairingEvent {
    PairingEvent::Complete {
        status: SmpStatus::Success,
        is_pair_cancel: false,
    }
}

#[test]
fn test_master_encrypts_with_stored_key() {
    let mut h = Harness::new(SecurityConfig::default());
    h.mgr
        .add_le_device(PEER, None, DeviceType::LE, AddressType::Public)
        .unwrap();
    h.mgr.add_le_key(&PEER, peer_enc(SecurityLevel::Authenticated)).unwrap();
    h.connect(PEER, 0x0040, LinkRole::Master);

    let action = h
        .mgr
        .determine_action(&PEER, true, ServiceSecurity::OUT_ENCRYPT)
        .unwrap();
    assert_eq!(action, SecurityAction::EncryptExisting);

    let (callback, results) = capture();
    h.mgr.set_encryption(&PEER, action, Some(callback)).unwrap();
    assert_eq!(
        h.hci.pop(),
        Some(HciCommand::LeStartEncryption {
            handle: 0x0040,
            rand: [1, 2, 3, 4, 5, 6, 7, 8],
            ediv: 0xBEEF,
            ltk: [0x77; 16],
        })
    );
    assert!(h.mgr.security_procedure_is_running(&PEER));
    assert_eq!(
        h.mgr.determine_action(&PEER, true, ServiceSecurity::OUT_ENCRYPT),
        Ok(SecurityAction::Discard)
    );
    assert!(results.lock().unwrap().is_empty());

    h.mgr.handle_hci_event(&encryption_change(0x0040, 0, true)).unwrap();
    assert_eq!(*results.lock().unwrap(), vec![Ok(())]);

    let record = h.mgr.record(&PEER).unwrap();
    assert_eq!(record.sec_state, SecurityState::Idle);
    assert!(record.sec_flags.contains(SecurityFlags::LE_AUTHENTICATED));
    assert_eq!(
        h.mgr.le_security_state(&PEER),
        Ok((LE_SEC_LINK_ENCRYPTED | LE_SEC_PAIRED_WITH_MITM, 16))
    );
    assert_eq!(
        h.pairing.calls(),
        vec![PairingCall::LinkEncrypted(PEER, true)]
    );

    // A later toggle is not reported to anyone
    h.mgr.handle_hci_event(&encryption_change(0x0040, 0, true)).unwrap();
    assert_eq!(results.lock().unwrap().len(), 1);
}

#[test]
fn test_encryption_failure_reported_once() {
    let mut h = Harness::new(SecurityConfig::default());
    h.mgr
        .add_le_device(PEER, None, DeviceType::LE, AddressType::Public)
        .unwrap();
    h.mgr.add_le_key(&PEER, peer_enc(SecurityLevel::Unauthenticated)).unwrap();
    h.connect(PEER, 0x0041, LinkRole::Master);

    let (callback, results) = capture();
    h.mgr
        .set_encryption(&PEER, SecurityAction::EncryptExisting, Some(callback))
        .unwrap();
    h.mgr.handle_hci_event(&encryption_change(0x0041, 0x06, false)).unwrap();

    assert_eq!(
        *results.lock().unwrap(),
        vec![Err(SecurityError::EncryptionFailed(0x06))]
    );
    let record = h.mgr.record(&PEER).unwrap();
    assert!(!record.is_link_encrypted());
    assert_eq!(record.sec_state, SecurityState::Idle);
}

#[test]
fn test_immediate_results_fire_callback() {
    let mut h = Harness::new(SecurityConfig::default());
    h.connect(PEER, 0x0042, LinkRole::Master);

    let (callback, results) = capture();
    h.mgr.set_encryption(&PEER, SecurityAction::Ok, Some(callback)).unwrap();
    let (callback, busy) = capture();
    assert_eq!(
        h.mgr.set_encryption(&PEER, SecurityAction::Discard, Some(callback)),
        Err(SecurityError::Busy)
    );
    let (callback, unknown) = capture();
    assert_eq!(
        h.mgr.set_encryption(&OTHER, SecurityAction::PairNoMitm, Some(callback)),
        Err(SecurityError::WrongMode)
    );

    assert_eq!(*results.lock().unwrap(), vec![Ok(())]);
    assert_eq!(*busy.lock().unwrap(), vec![Err(SecurityError::Busy)]);
    assert_eq!(*unknown.lock().unwrap(), vec![Err(SecurityError::WrongMode)]);
    assert!(h.hci.drain().is_empty());
}

#[test]
fn test_slave_pairs_through_protocol() {
    let mut h = Harness::new(SecurityConfig::default());
    h.connect(PEER, 0x0043, LinkRole::Slave);

    let action = h
        .mgr
        .determine_action(&PEER, false, ServiceSecurity::IN_ENCRYPT | ServiceSecurity::IN_MITM)
        .unwrap();
    assert_eq!(action, SecurityAction::PairMitm);

    let (callback, results) = capture();
    h.mgr.set_encryption(&PEER, action, Some(callback)).unwrap();
    assert_eq!(h.pairing.calls(), vec![PairingCall::Start(PEER)]);

    let record = h.mgr.record(&PEER).unwrap();
    assert_eq!(record.sec_state, SecurityState::Authenticating);
    assert!(record.security_required.contains(ServiceSecurity::IN_MITM));

    h.mgr.on_pairing_event(PEER, succeeded()).unwrap();
    assert_eq!(*results.lock().unwrap(), vec![Ok(())]);
    assert_eq!(
        h.take_events(),
        vec![SecurityEvent::PairingComplete {
            peer: PEER,
            status: SmpStatus::Success,
            bonded: false,
        }]
    );
    assert!(!h.mgr.security_procedure_is_running(&PEER));
}

#[test]
fn test_pairing_failure_fails_pending_encryption() {
    let mut h = Harness::new(SecurityConfig::default());
    h.connect(PEER, 0x0044, LinkRole::Slave);

    let (callback, results) = capture();
    h.mgr
        .set_encryption(&PEER, SecurityAction::PairNoMitm, Some(callback))
        .unwrap();
    h.mgr
        .on_pairing_event(PEER, failed(SmpReason::ConfirmValueFailed))
        .unwrap();
    assert_eq!(
        *results.lock().unwrap(),
        vec![Err(SecurityError::ProtocolFailure(SmpReason::ConfirmValueFailed))]
    );
}

#[test]
fn test_ltk_request_replies() {
    let mut h = Harness::new(SecurityConfig::default());
    h.mgr
        .add_le_device(PEER, None, DeviceType::LE, AddressType::Public)
        .unwrap();
    h.mgr
        .add_le_key(
            &PEER,
            LeKey::LocalEnc(LocalEncKey {
                ltk: [0x99; 16],
                div: 7,
                sec_level: SecurityLevel::Unauthenticated,
                key_size: 16,
            }),
        )
        .unwrap();
    h.connect(PEER, 0x0045, LinkRole::Slave);

    h.mgr.handle_hci_event(&ltk_request(0x0045, [9; 8], 0x1234)).unwrap();
    assert_eq!(
        h.hci.pop(),
        Some(HciCommand::LeLtkRequestReply {
            handle: 0x0045,
            ltk: [0x99; 16],
        })
    );
    assert_eq!(
        h.pairing.calls(),
        vec![PairingCall::LtkRequest(PEER, [9; 8], 0x1234)]
    );

    // The pairing protocol answers with the session key itself
    h.pairing.set_claim_ltk_requests(true);
    h.mgr.handle_hci_event(&ltk_request(0x0045, [0; 8], 0)).unwrap();
    assert_eq!(h.hci.pop(), None);
    h.mgr.ltk_request_reply(&PEER, Some([0x55; 16])).unwrap();
    assert_eq!(
        h.hci.pop(),
        Some(HciCommand::LeLtkRequestReply {
            handle: 0x0045,
            ltk: [0x55; 16],
        })
    );

    // Unknown link fails closed
    h.mgr.handle_hci_event(&ltk_request(0x0099, [0; 8], 0)).unwrap();
    assert_eq!(
        h.hci.pop(),
        Some(HciCommand::LeLtkRequestNegativeReply { handle: 0x0099 })
    );
}

#[test]
fn test_ltk_request_without_local_key_rejected() {
    let mut h = Harness::new(SecurityConfig::default());
    h.connect(PEER, 0x0046, LinkRole::Slave);
    h.mgr.handle_hci_event(&ltk_request(0x0046, [0; 8], 0)).unwrap();
    assert_eq!(
        h.hci.pop(),
        Some(HciCommand::LeLtkRequestNegativeReply { handle: 0x0046 })
    );
}

#[test]
fn test_security_request_single_session() {
    let mut h = Harness::new(SecurityConfig::default());
    h.connect(PEER, 0x0047, LinkRole::Master);
    h.connect(OTHER, 0x0048, LinkRole::Master);

    h.mgr.on_pairing_event(PEER, PairingEvent::SecurityRequest).unwrap();
    assert_eq!(h.take_events(), vec![SecurityEvent::SecurityRequest(PEER)]);
    assert_eq!(h.mgr.pairing_session().peer, Some(PEER));
    assert_eq!(
        h.mgr.pairing_session().state,
        PairingState::AwaitingCapabilities
    );

    h.mgr.on_pairing_event(OTHER, PairingEvent::SecurityRequest).unwrap();
    assert!(h.take_events().is_empty());
    assert_eq!(h.mgr.pairing_session().peer, Some(PEER));
    assert!(!h.mgr.security_procedure_is_running(&OTHER));

    // A foreign completion leaves the session alone
    h.mgr.on_pairing_event(OTHER, failed(SmpReason::UnspecifiedReason)).unwrap();
    assert_eq!(h.mgr.pairing_session().peer, Some(PEER));

    h.mgr.security_grant(PEER, true).unwrap();
    h.mgr.security_grant(PEER, false).unwrap();
    assert_eq!(
        h.pairing.calls(),
        vec![
            PairingCall::Grant(PEER, SmpStatus::Success),
            PairingCall::Grant(PEER, SmpStatus::Failed(SmpReason::RepeatedAttempts)),
        ]
    );

    h.mgr.on_pairing_event(PEER, succeeded()).unwrap();
    assert_eq!(h.mgr.pairing_session().state, PairingState::Idle);
    assert_eq!(h.mgr.pairing_session().peer, None);
}

#[test]
fn test_unknown_peer_event_rejected() {
    let mut h = Harness::new(SecurityConfig::default());
    assert_eq!(
        h.mgr.on_pairing_event(PEER, PairingEvent::PasskeyRequest),
        Err(SecurityError::NotFound)
    );
    assert!(h.take_events().is_empty());
}

#[test]
fn test_capability_request_policy() {
    let mut h = Harness::new(SecurityConfig::default());
    h.connect(PEER, 0x0049, LinkRole::Slave);

    // No input or output and no OOB data: MITM cannot be offered
    let reply = h
        .mgr
        .on_pairing_event(PEER, PairingEvent::IoCapabilityRequest(capability_request()))
        .unwrap()
        .unwrap();
    assert_eq!(reply.io_capability, IoCapability::NoInputNoOutput);
    assert!(!reply.auth_req.mitm);
    assert!(reply.auth_req.bonding);
    assert!(reply.auth_req.secure_connections);
    assert_eq!(reply.init_keys, KeyDistribution::all());
}

#[test]
fn test_capability_request_merges_required_mitm() {
    let mut config = SecurityConfig::default();
    config.pairing.io_capability = IoCapability::DisplayYesNo;
    config.pairing.secure_connections = false;
    config.pairing.max_key_size = 12;
    let mut h = Harness::new(config);
    h.connect(PEER, 0x004A, LinkRole::Master);
    h.connect(OTHER, 0x004B, LinkRole::Slave);

    // PairMitm on a master link records the requirement, then pairs
    h.mgr.set_encryption(&PEER, SecurityAction::PairMitm, None).unwrap();

    let mut request = capability_request();
    request.auth_req.keypress_notifications = true;
    let reply = h
        .mgr
        .on_pairing_event(PEER, PairingEvent::IoCapabilityRequest(request))
        .unwrap()
        .unwrap();
    assert!(reply.auth_req.mitm);
    assert!(!reply.auth_req.secure_connections);
    assert!(!reply.auth_req.keypress_notifications);
    assert!(!reply.init_keys.link_key);
    assert!(!reply.resp_keys.link_key);
    assert!(reply.init_keys.encryption_key);
    assert_eq!(reply.max_key_size, 12);
}

#[test]
fn test_capability_request_without_bonding() {
    let mut config = SecurityConfig::default();
    config.pairing.bonding = false;
    let mut h = Harness::new(config);
    h.connect(PEER, 0x004C, LinkRole::Slave);

    let reply = h
        .mgr
        .on_pairing_event(PEER, PairingEvent::IoCapabilityRequest(capability_request()))
        .unwrap()
        .unwrap();
    assert!(!reply.auth_req.bonding);
    assert_eq!(reply.init_keys, KeyDistribution::none());
    assert_eq!(reply.resp_keys, KeyDistribution::none());
    assert_eq!(h.mgr.pairing_session().peer, Some(PEER));
}

#[test]
fn test_user_replies() {
    let mut h = Harness::new(SecurityConfig::default());
    h.connect(PEER, 0x004D, LinkRole::Master);

    h.mgr.on_pairing_event(PEER, PairingEvent::PasskeyRequest).unwrap();
    h.mgr.on_pairing_event(PEER, PairingEvent::NumericComparisonRequest(123456)).unwrap();
    h.mgr.on_pairing_event(PEER, PairingEvent::OobRequest).unwrap();
    h.mgr.on_pairing_event(PEER, PairingEvent::PasskeyNotification(42)).unwrap();
    assert_eq!(
        h.take_events(),
        vec![
            SecurityEvent::PasskeyRequest(PEER),
            SecurityEvent::NumericComparisonRequest(PEER, 123456),
            SecurityEvent::OobRequest(PEER),
            SecurityEvent::PasskeyNotification(PEER, 42),
        ]
    );
    assert_eq!(h.mgr.pairing_session().state, PairingState::AwaitingUserInput);

    h.mgr.passkey_reply(PEER, true, 987654).unwrap();
    h.mgr.passkey_reply(PEER, false, 0).unwrap();
    h.mgr.confirm_reply(PEER, false).unwrap();
    h.mgr.oob_data_reply(PEER, false, &[]).unwrap();
    h.mgr.oob_data_reply(PEER, true, &[1, 2, 3]).unwrap();
    assert!(h.mgr.passkey_reply(PEER, true, 1_000_000).is_err());
    assert_eq!(h.mgr.passkey_reply(OTHER, true, 1), Err(SecurityError::NotFound));

    assert_eq!(
        h.pairing.calls(),
        vec![
            PairingCall::Passkey(PEER, SmpStatus::Success, 987654),
            PairingCall::Passkey(PEER, SmpStatus::Failed(SmpReason::PasskeyEntryFailed), 0),
            PairingCall::Confirm(PEER, SmpStatus::Failed(SmpReason::PasskeyEntryFailed)),
            PairingCall::Oob(PEER, SmpStatus::Failed(SmpReason::OobNotAvailable), vec![]),
            PairingCall::Oob(PEER, SmpStatus::Success, vec![1, 2, 3]),
        ]
    );
    let record = h.mgr.record(&PEER).unwrap();
    assert!(record.sec_flags.contains(SecurityFlags::LE_AUTHENTICATED));
    assert_eq!(
        h.mgr.pairing_session().state,
        PairingState::AwaitingCompletion
    );
}

#[test]
fn test_failed_pairing_tears_link_down() {
    let mut h = Harness::new(SecurityConfig::default());
    h.connect(PEER, 0x004E, LinkRole::Master);

    let t0 = Instant::now();
    h.mgr
        .on_pairing_event_at(PEER, failed(SmpReason::ConfirmValueFailed), t0)
        .unwrap();
    assert_eq!(
        h.take_events(),
        vec![SecurityEvent::PairingComplete {
            peer: PEER,
            status: SmpStatus::Failed(SmpReason::ConfirmValueFailed),
            bonded: false,
        }]
    );
    assert_eq!(h.mgr.next_deadline(), Some(t0 + Duration::from_secs(3)));

    h.mgr.process_timeouts_at(t0 + Duration::from_secs(2));
    assert!(h.hci.drain().is_empty());

    h.mgr.process_timeouts_at(t0 + Duration::from_secs(3));
    assert_eq!(
        h.hci.drain(),
        vec![HciCommand::Disconnect {
            handle: 0x004E,
            reason: 0x13,
        }]
    );
    h.mgr.process_timeouts_at(t0 + Duration::from_secs(10));
    assert!(h.hci.drain().is_empty());
}

#[test]
fn test_teardown_cancelled_by_disconnect() {
    let mut h = Harness::new(SecurityConfig::default());
    h.connect(PEER, 0x004F, LinkRole::Master);

    let t0 = Instant::now();
    h.mgr
        .on_pairing_event_at(PEER, failed(SmpReason::UnspecifiedReason), t0)
        .unwrap();
    let disconnect = HciEvent::new(0x05, vec![0x00, 0x4F, 0x00, 0x13]).unwrap();
    h.mgr.handle_hci_event(&disconnect).unwrap();

    h.mgr.process_timeouts_at(t0 + Duration::from_secs(5));
    assert!(h.hci.drain().is_empty());
    let record = h.mgr.record(&PEER).unwrap();
    assert!(!record.is_connected());
    assert_eq!(record.sec_state, SecurityState::Idle);
}

#[test]
fn test_failure_keeps_link_when_configured() {
    let mut config = SecurityConfig::default();
    config.pairing.disconnect_on_failure = false;
    let mut h = Harness::new(config);
    h.connect(PEER, 0x0050, LinkRole::Master);
    h.mgr.start_pairing(PEER).unwrap();

    let t0 = Instant::now();
    h.mgr
        .on_pairing_event_at(PEER, failed(SmpReason::PairingNotSupported), t0)
        .unwrap();
    assert_eq!(h.mgr.record(&PEER).unwrap().sec_state, SecurityState::Idle);
    h.mgr.process_timeouts_at(t0 + Duration::from_secs(60));
    assert!(h.hci.drain().is_empty());
}

#[test]
fn test_connection_timeout_never_arms_teardown() {
    let mut h = Harness::new(SecurityConfig::default());
    h.connect(PEER, 0x0051, LinkRole::Master);

    let t0 = Instant::now();
    h.mgr
        .on_pairing_event_at(PEER, failed(SmpReason::ConnectionTimeout), t0)
        .unwrap();
    assert_eq!(h.mgr.next_deadline(), None);
    h.mgr.process_timeouts_at(t0 + Duration::from_secs(60));
    assert!(h.hci.drain().is_empty());
}

#[test]
fn test_pairing_timeout_reports_once() {
    let mut h = Harness::new(SecurityConfig::default());
    h.connect(PEER, 0x0052, LinkRole::Master);

    let (callback, results) = capture();
    h.mgr
        .set_encryption(&PEER, SecurityAction::PairNoMitm, Some(callback))
        .unwrap();
    assert!(h.mgr.security_procedure_is_running(&PEER));
    h.pairing.clear();

    h.mgr.process_timeouts_at(Instant::now() + Duration::from_secs(31));
    assert_eq!(h.pairing.calls(), vec![PairingCall::Cancel(PEER)]);
    assert_eq!(h.mgr.pairing_session().state, PairingState::Idle);
    assert!(!h.mgr.security_procedure_is_running(&PEER));
    assert_eq!(*results.lock().unwrap(), vec![Err(SecurityError::Timeout)]);
    assert_eq!(
        h.take_events(),
        vec![SecurityEvent::PairingComplete {
            peer: PEER,
            status: SmpStatus::Failed(SmpReason::PairingTimeout),
            bonded: false,
        }]
    );

    // A late acknowledgement of the cancel is not a second completion
    h.mgr
        .on_pairing_event(
            PEER,
            PairingEvent::Complete {
                status: SmpStatus::Failed(SmpReason::PairingCancelled),
                is_pair_cancel: true,
            },
        )
        .unwrap();
    assert_eq!(h.take_events(), vec![SecurityEvent::PairingCancelled(PEER)]);
    assert_eq!(results.lock().unwrap().len(), 1);
}

#[test]
fn test_slave_security_request_times_out() {
    let mut h = Harness::new(SecurityConfig::default());
    h.connect(PEER, 0x0058, LinkRole::Slave);
    h.connect(OTHER, 0x0059, LinkRole::Master);

    let (callback, results) = capture();
    h.mgr
        .set_encryption(&PEER, SecurityAction::PairNoMitm, Some(callback))
        .unwrap();
    let session = h.mgr.pairing_session().clone();
    assert_eq!(session.peer, Some(PEER));
    assert_eq!(session.state, PairingState::AwaitingCapabilities);
    assert!(session.flags.contains(PairingFlags::LOCALLY_INITIATED));
    assert!(h.mgr.next_deadline().is_some());

    // The peer never answers, and another device cannot take over meanwhile
    h.mgr.on_pairing_event(OTHER, PairingEvent::SecurityRequest).unwrap();
    assert_eq!(h.mgr.pairing_session().peer, Some(PEER));
    assert!(h.take_events().is_empty());

    h.mgr.process_timeouts_at(Instant::now() + Duration::from_secs(31));
    assert_eq!(
        h.pairing.calls(),
        vec![PairingCall::Start(PEER), PairingCall::Cancel(PEER)]
    );
    assert_eq!(h.mgr.record(&PEER).unwrap().sec_state, SecurityState::Idle);
    assert_eq!(*results.lock().unwrap(), vec![Err(SecurityError::Timeout)]);
    assert_eq!(
        h.take_events(),
        vec![SecurityEvent::PairingComplete {
            peer: PEER,
            status: SmpStatus::Failed(SmpReason::PairingTimeout),
            bonded: false,
        }]
    );
    assert_eq!(
        h.mgr.determine_action(&PEER, false, ServiceSecurity::IN_ENCRYPT),
        Ok(SecurityAction::PairNoMitm)
    );
    h.mgr.remove_device(&PEER).unwrap();
}

#[test]
fn test_set_encryption_pairing_refused_while_other_pairs() {
    let mut h = Harness::new(SecurityConfig::default());
    h.connect(PEER, 0x005B, LinkRole::Master);
    h.connect(OTHER, 0x005C, LinkRole::Slave);

    h.mgr.start_pairing(PEER).unwrap();
    let (callback, results) = capture();
    assert_eq!(
        h.mgr.set_encryption(&OTHER, SecurityAction::PairNoMitm, Some(callback)),
        Err(SecurityError::Busy)
    );
    assert_eq!(*results.lock().unwrap(), vec![Err(SecurityError::Busy)]);
    assert!(!h.mgr.security_procedure_is_running(&OTHER));
    assert_eq!(h.pairing.calls(), vec![PairingCall::Start(PEER)]);
}

#[test]
fn test_encryption_change_during_pairing_clears_state() {
    let mut h = Harness::new(SecurityConfig::default());
    h.connect(PEER, 0x005D, LinkRole::Master);

    h.mgr.start_pairing(PEER).unwrap();
    assert_eq!(
        h.mgr.record(&PEER).unwrap().sec_state,
        SecurityState::Authenticating
    );
    h.mgr
        .start_encryption(&PEER, EncryptionKey::SessionKey([0x42; 16]))
        .unwrap();
    assert_eq!(
        h.hci.pop(),
        Some(HciCommand::LeStartEncryption {
            handle: 0x005D,
            rand: [0; 8],
            ediv: 0,
            ltk: [0x42; 16],
        })
    );

    h.mgr.handle_hci_event(&encryption_change(0x005D, 0, true)).unwrap();
    let record = h.mgr.record(&PEER).unwrap();
    assert_eq!(record.sec_state, SecurityState::Idle);
    assert!(record.is_link_encrypted());
    assert!(h.pairing.calls().contains(&PairingCall::LinkEncrypted(PEER, true)));
}

#[test]
fn test_rejected_start_reports_failure() {
    let mut h = Harness::new(SecurityConfig::default());
    h.connect(PEER, 0x0053, LinkRole::Master);
    h.pairing.set_refuse_start(true);

    assert!(h.mgr.start_pairing(PEER).is_err());
    assert_eq!(
        h.take_events(),
        vec![SecurityEvent::PairingComplete {
            peer: PEER,
            status: SmpStatus::Failed(SmpReason::UnspecifiedReason),
            bonded: false,
        }]
    );
    assert!(!h.mgr.pairing_session().is_active());
    assert_eq!(h.mgr.start_pairing(OTHER), Err(SecurityError::NotFound));
}

#[test]
fn test_second_pairing_refused_while_busy() {
    let mut h = Harness::new(SecurityConfig::default());
    h.connect(PEER, 0x0054, LinkRole::Master);
    h.connect(OTHER, 0x0055, LinkRole::Master);

    h.mgr.start_pairing(PEER).unwrap();
    assert_eq!(h.mgr.start_pairing(OTHER), Err(SecurityError::Busy));
    assert_eq!(h.mgr.remove_device(&PEER), Err(SecurityError::Busy));

    h.mgr.cancel_pairing(PEER).unwrap();
    assert_eq!(
        h.pairing.calls(),
        vec![PairingCall::Start(PEER), PairingCall::Cancel(PEER)]
    );
}

#[test]
fn test_identity_key_consolidates_and_bonds() {
    let mut config = SecurityConfig::default();
    config.privacy.controller_resolving_list = true;
    let mut h = Harness::new(config);

    let identity = BdAddr::new([0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0x00]);
    let irk = [0x3C; 16];
    let rpa = generate_with_irk(&SoftCrypto, &irk, [0x10, 0x20, 0x30]).unwrap();

    // Classic record for the same device, known by name
    h.mgr
        .add_le_device(identity, Some("headset"), DeviceType::BREDR, AddressType::Public)
        .unwrap();
    h.connect(rpa, 0x0056, LinkRole::Master);
    assert_eq!(h.mgr.store().len(), 2);

    h.mgr.start_pairing(rpa).unwrap();
    let enc = peer_enc(SecurityLevel::Unauthenticated);
    let id = peer_id(irk, identity);
    h.mgr.on_pairing_event(rpa, PairingEvent::KeyDistributed(enc)).unwrap();
    h.mgr.on_pairing_event(rpa, PairingEvent::KeyDistributed(id)).unwrap();
    h.mgr.on_pairing_event(rpa, PairingEvent::KeyDistributed(id)).unwrap();
    assert_eq!(h.mgr.store().len(), 1);

    let record = h.mgr.record(&rpa).unwrap();
    assert_eq!(record.bd_addr, identity);
    assert_eq!(record.pseudo_addr, rpa);
    assert_eq!(record.name.as_deref(), Some("headset"));
    assert!(record.device_type.contains(DeviceType::BREDR | DeviceType::LE));
    assert_eq!(record.ble_hci_handle, Some(0x0056));
    assert_eq!(h.mgr.record(&identity).map(|r| r.bd_addr), Some(identity));

    h.mgr.on_pairing_event(rpa, succeeded()).unwrap();
    assert_eq!(
        h.take_events(),
        vec![
            SecurityEvent::KeyReceived(rpa, enc),
            SecurityEvent::KeyReceived(identity, id),
            SecurityEvent::KeyReceived(identity, id),
            SecurityEvent::PairingComplete {
                peer: rpa,
                status: SmpStatus::Success,
                bonded: true,
            },
        ]
    );
    assert_eq!(h.mgr.resolving_list().len(), 1);
    assert_eq!(h.mgr.resolving_list()[0].identity, identity);
    assert!(matches!(
        h.hci.pop(),
        Some(HciCommand::LeAddDeviceToResolvingList { peer_irk, .. }) if peer_irk == irk
    ));

    let bonded = h.mgr.bonded_devices();
    assert_eq!(bonded.len(), 1);
    assert_eq!(bonded[0].address, identity);
    assert_eq!(bonded[0].keys.len(), 2);
}

#[test]
fn test_merged_record_keeps_pending_encryption() {
    let mut h = Harness::new(SecurityConfig::default());
    h.mgr
        .add_le_device(PEER, None, DeviceType::LE, AddressType::Public)
        .unwrap();
    h.mgr.add_le_key(&PEER, peer_enc(SecurityLevel::Unauthenticated)).unwrap();
    h.connect(PEER, 0x005E, LinkRole::Master);

    let (callback, results) = capture();
    h.mgr
        .set_encryption(&PEER, SecurityAction::EncryptExisting, Some(callback))
        .unwrap();

    // A second record turns out to be the same device
    let alias = BdAddr::new([0x21, 0x22, 0x23, 0x24, 0x25, 0x46]);
    h.mgr
        .add_le_device(alias, None, DeviceType::LE, AddressType::Random)
        .unwrap();
    h.mgr.add_le_key(&alias, peer_id([0x5A; 16], PEER)).unwrap();
    assert_eq!(h.mgr.store().len(), 1);

    let record = h.mgr.record(&PEER).unwrap();
    assert_eq!(record.ble_hci_handle, Some(0x005E));
    assert_eq!(record.sec_state, SecurityState::Encrypting);
    assert!(results.lock().unwrap().is_empty());

    h.mgr.handle_hci_event(&encryption_change(0x005E, 0, true)).unwrap();
    assert_eq!(*results.lock().unwrap(), vec![Ok(())]);
    assert!(h.mgr.record(&PEER).unwrap().is_link_encrypted());
}

#[test]
fn test_new_identity_replaces_resolving_entry() {
    let mut config = SecurityConfig::default();
    config.privacy.controller_resolving_list = true;
    let mut h = Harness::new(config);

    let first = BdAddr::new([0xB1, 0xB2, 0xB3, 0xB4, 0xB5, 0xC0]);
    let second = BdAddr::new([0xE1, 0xE2, 0xE3, 0xE4, 0xE5, 0xC0]);
    h.mgr
        .add_le_device(PEER, None, DeviceType::LE, AddressType::Public)
        .unwrap();
    h.mgr.add_le_key(&PEER, peer_id([0x01; 16], first)).unwrap();
    h.mgr.add_le_key(&first, peer_id([0x02; 16], second)).unwrap();

    let identities: Vec<BdAddr> = h.mgr.resolving_list().iter().map(|e| e.identity).collect();
    assert_eq!(identities, vec![second]);

    let commands = h.hci.drain();
    assert_eq!(commands.len(), 3);
    assert!(matches!(
        &commands[1],
        HciCommand::LeRemoveDeviceFromResolvingList { peer_identity_address, .. }
            if *peer_identity_address == first.bytes
    ));
    assert!(matches!(
        &commands[2],
        HciCommand::LeAddDeviceToResolvingList { peer_irk, .. } if *peer_irk == [0x02; 16]
    ));
    assert!(h.mgr.record(&first).is_none());
    assert_eq!(h.mgr.record(&second).map(|r| r.bd_addr), Some(second));
}

#[test]
fn test_local_key_chain_with_privacy() {
    let mut config = SecurityConfig::default();
    config.privacy.enabled = true;
    let mut h = Harness::new(config);

    h.mgr.reset_identity().unwrap();
    for fill in 1..=4u8 {
        h.rng.with(|r| r.complete_all(fill));
        h.mgr.poll();
    }

    let keys = *h.mgr.local_keys();
    assert!(keys.has_identity());
    assert!(keys.has_encryption_root());
    assert_eq!(keys.irk, SoftCrypto.encrypt(&keys.ir, &[0x01]).unwrap());

    let rpa = h.mgr.local_rpa().unwrap();
    assert!(rpa.is_resolvable_private());
    assert!(rpa_matches_irk(&SoftCrypto, &keys.irk, &rpa).unwrap());
    assert_eq!(
        h.hci.drain(),
        vec![HciCommand::LeSetRandomAddress { address: rpa.bytes }]
    );
    assert_eq!(
        h.take_events(),
        vec![
            SecurityEvent::LocalKeysReady(LocalKeyType::Identity),
            SecurityEvent::LocalAddressChanged(rpa),
            SecurityEvent::LocalKeysReady(LocalKeyType::EncryptionRoot),
        ]
    );

    // Rotation once the address expires
    let due = h.mgr.next_deadline().unwrap();
    h.mgr.process_timeouts_at(due);
    assert_eq!(
        h.rng.with(|r| r.take_request()),
        Some((RandomPurpose::PrivateAddress, 3))
    );

    let persisted = h.mgr.local_keys_config();
    let mut config = SecurityConfig::default();
    config.local_keys = Some(persisted);
    let restored = Harness::new(config);
    assert_eq!(*restored.mgr.local_keys(), keys);
}

#[test]
fn test_identity_failure_keeps_encryption_root_path() {
    let mut h = Harness::new(SecurityConfig::default());

    h.mgr.reset_identity().unwrap();
    h.rng.with(|r| r.complete_all(0xAB));
    h.mgr.poll();
    h.rng.with(|r| r.fail_next());
    h.mgr.poll();

    assert!(!h.mgr.local_keys().has_identity());
    assert_eq!(h.mgr.local_keys().ir, [0; 16]);
    assert_eq!(
        h.take_events(),
        vec![SecurityEvent::LocalKeysFailed(LocalKeyType::Identity)]
    );
    assert_eq!(h.mgr.generate_rpa(), Err(SecurityError::MissingKey));

    h.mgr.generate_encryption_root().unwrap();
    for fill in [5u8, 6] {
        h.rng.with(|r| r.complete_all(fill));
        h.mgr.poll();
    }
    assert!(h.mgr.local_keys().has_encryption_root());
    assert_eq!(
        h.take_events(),
        vec![SecurityEvent::LocalKeysReady(LocalKeyType::EncryptionRoot)]
    );
}

#[test]
fn test_resolve_through_manager() {
    let mut h = Harness::new(SecurityConfig::default());
    let identity = BdAddr::new([0xB1, 0xB2, 0xB3, 0xB4, 0xB5, 0x00]);
    let irk = [0x42; 16];
    h.mgr
        .add_le_device(identity, None, DeviceType::LE, AddressType::Public)
        .unwrap();
    h.mgr.add_le_key(&identity, peer_id(irk, identity)).unwrap();

    let rpa = generate_with_irk(&SoftCrypto, &irk, [1, 2, 3]).unwrap();
    let stranger = generate_with_irk(&SoftCrypto, &[0x24; 16], [4, 5, 6]).unwrap();

    let first: Arc<Mutex<Option<Option<RecordHandle>>>> = Arc::new(Mutex::new(None));
    let second = Arc::new(Mutex::new(None));
    let sink = first.clone();
    h.mgr
        .resolve(rpa, Box::new(move |r| *sink.lock().unwrap() = Some(r)))
        .unwrap();
    let sink = second.clone();
    assert_eq!(
        h.mgr
            .resolve(stranger, Box::new(move |r| *sink.lock().unwrap() = Some(r))),
        Err(SecurityError::Busy)
    );
    assert_eq!(*second.lock().unwrap(), Some(None));
    assert_eq!(*first.lock().unwrap(), None);

    h.mgr.poll();
    let handle = first.lock().unwrap().unwrap().unwrap();
    assert_eq!(h.mgr.store().get(handle).unwrap().bd_addr, identity);
    assert_eq!(h.mgr.remote_connection_addr(&identity), rpa);

    // The peer reconnects with that RPA and lands on the bonded record
    assert_eq!(h.mgr.on_connected(rpa, AddressType::Random, 0x0057, LinkRole::Slave), Ok(handle));

    let none = Arc::new(Mutex::new(None));
    let sink = none.clone();
    h.mgr
        .resolve(stranger, Box::new(move |r| *sink.lock().unwrap() = Some(r)))
        .unwrap();
    h.mgr.poll();
    assert_eq!(*none.lock().unwrap(), Some(None));
}

#[test]
fn test_restore_bonded_from_config() {
    let addr = BdAddr::new([0xC1, 0xC2, 0xC3, 0xC4, 0xC5, 0x00]);
    let mut config = SecurityConfig::default();
    config.bonded.push(BondedDevice {
        address: addr,
        address_type: AddressType::Public,
        device_type: 0x02,
        name: None,
        keys: vec![PersistedKey::from_key(&peer_enc(SecurityLevel::Authenticated))],
    });
    let h = Harness::new(config.clone());

    assert_eq!(
        h.mgr.le_security_state(&addr),
        Ok((LE_SEC_PAIRED_WITH_MITM, 16))
    );
    assert_eq!(h.mgr.bonded_devices(), config.bonded);
    assert!(h.take_events().is_empty());
}

#[test]
fn test_device_management() {
    let mut h = Harness::new(SecurityConfig::default());
    assert_eq!(h.mgr.remove_device(&PEER), Err(SecurityError::NotFound));
    assert_eq!(h.mgr.le_security_state(&PEER), Err(SecurityError::NotFound));
    assert_eq!(h.mgr.remote_connection_addr(&PEER), PEER);

    h.mgr
        .add_le_device(PEER, Some("tag"), DeviceType::LE, AddressType::Random)
        .unwrap();
    let record = h.mgr.record(&PEER).unwrap();
    assert!(record.sec_flags.contains(SecurityFlags::NAME_KNOWN));
    assert_eq!(record.ble_addr_type, AddressType::Random);

    h.mgr
        .set_pref_conn_params(&PEER, 0x0010, 0xFFFF, 0xFFFF, 0x0200)
        .unwrap();
    let params = h.mgr.record(&PEER).unwrap().conn_params;
    assert_eq!((params.min_interval, params.max_interval), (0x0010, 0x0010));
    assert!(h.mgr.set_pref_conn_params(&PEER, 0x0001, 0x0010, 0, 0x0200).is_err());

    h.mgr.remove_device(&PEER).unwrap();
    assert!(h.mgr.record(&PEER).is_none());
}

#[test]
fn test_store_exhaustion_leaves_link_unsecured() {
    let mut config = SecurityConfig::default();
    config.max_device_records = 1;
    let mut h = Harness::new(config);
    h.connect(PEER, 0x0058, LinkRole::Master);
    assert_eq!(
        h.mgr.on_connected(OTHER, AddressType::Public, 0x0059, LinkRole::Master),
        Err(SecurityError::Exhausted)
    );
    assert!(h.mgr.record(&OTHER).is_none());
}

#[test]
fn test_disconnect_fails_pending_encryption() {
    let mut h = Harness::new(SecurityConfig::default());
    h.mgr
        .add_le_device(PEER, None, DeviceType::LE, AddressType::Public)
        .unwrap();
    h.mgr.add_le_key(&PEER, peer_enc(SecurityLevel::Unauthenticated)).unwrap();
    h.connect(PEER, 0x005A, LinkRole::Master);

    let (callback, results) = capture();
    h.mgr
        .set_encryption(&PEER, SecurityAction::EncryptExisting, Some(callback))
        .unwrap();
    h.mgr.on_disconnected(0x005A);

    assert_eq!(*results.lock().unwrap(), vec![Err(SecurityError::WrongMode)]);
    let record = h.mgr.record(&PEER).unwrap();
    assert_eq!(record.sec_state, SecurityState::Idle);
    assert_eq!(record.ble_hci_handle, None);
}

#[test]
fn test_signing_through_manager() {
    let mut h = Harness::new(SecurityConfig::default());
    h.mgr
        .add_le_device(PEER, None, DeviceType::LE, AddressType::Public)
        .unwrap();
    assert_eq!(h.mgr.sign(&PEER, b"x"), Err(SecurityError::MissingKey));

    h.mgr
        .add_le_key(
            &PEER,
            LeKey::LocalCsrk(LocalCsrk {
                csrk: [0x61; 16],
                div: 0,
                sec_level: SecurityLevel::Unauthenticated,
                counter: 5,
            }),
        )
        .unwrap();
    h.mgr
        .add_le_key(
            &PEER,
            LeKey::PeerCsrk(PeerCsrk {
                csrk: [0x61; 16],
                sec_level: SecurityLevel::Unauthenticated,
                counter: 5,
            }),
        )
        .unwrap();

    let sig = h.mgr.sign(&PEER, b"attribute value").unwrap();
    assert_eq!(sig.counter, 5);
    assert!(h.mgr.verify(&PEER, b"attribute value", &sig));
    assert!(!h.mgr.verify(&PEER, b"attribute value", &sig));
}

fn signing_store(csrk: [u8; 16], counter: u32) -> (RecordStore, BdAddr) {
    let mut store = RecordStore::new(1);
    let handle = store.alloc(PEER).unwrap();
    let record = store.get_mut(handle).unwrap();
    record.save_key(LeKey::LocalCsrk(LocalCsrk {
        csrk,
        div: 0,
        sec_level: SecurityLevel::Unauthenticated,
        counter,
    }));
    record.save_key(LeKey::PeerCsrk(PeerCsrk {
        csrk,
        sec_level: SecurityLevel::Unauthenticated,
        counter: 0,
    }));
    (store, PEER)
}

fn peer_counter(store: &RecordStore, addr: &BdAddr) -> u32 {
    let handle = store.find(addr).unwrap();
    store.get(handle).unwrap().keys.peer_csrk.unwrap().counter
}

proptest! {
    #[test]
    fn prop_signature_verifies(
        csrk in any::<[u8; 16]>(),
        counter in 0u32..u32::MAX - 1,
        payload in proptest::collection::vec(any::<u8>(), 0..64),
    ) {
        let (mut store, addr) = signing_store(csrk, counter);
        let engine = DataSigningEngine::new(&SoftCrypto);

        let sig = engine.sign(&mut store, &addr, &payload).unwrap();
        prop_assert_eq!(sig.counter, counter);
        prop_assert!(engine.verify(&mut store, &addr, &payload, &sig));
        prop_assert!(peer_counter(&store, &addr) > counter);
    }

    #[test]
    fn prop_replayed_counter_rejected(
        csrk in any::<[u8; 16]>(),
        start in 0u32..1000,
        gap in 1u32..16,
        payload in proptest::collection::vec(any::<u8>(), 0..32),
    ) {
        let (mut store, addr) = signing_store(csrk, start);
        let engine = DataSigningEngine::new(&SoftCrypto);

        let old = engine.sign(&mut store, &addr, &payload).unwrap();
        let mut newest = old;
        for _ in 0..gap {
            newest = engine.sign(&mut store, &addr, &payload).unwrap();
        }
        prop_assert!(engine.verify(&mut store, &addr, &payload, &newest));
        let accepted = peer_counter(&store, &addr);

        prop_assert!(!engine.verify(&mut store, &addr, &payload, &old));
        prop_assert_eq!(peer_counter(&store, &addr), accepted);
    }

    #[test]
    fn prop_rpa_round_trip(irk in any::<[u8; 16]>(), prand in any::<[u8; 3]>()) {
        let identity = BdAddr::new([0xE1, 0xE2, 0xE3, 0xE4, 0xE5, 0x00]);
        let rpa = generate_with_irk(&SoftCrypto, &irk, prand).unwrap();
        prop_assert!(rpa.is_resolvable_private());

        let mut other_irk = irk;
        other_irk[0] ^= 0xFF;
        for (key, expect_match) in [(irk, true), (other_irk, false)] {
            let mut store = RecordStore::new(2);
            let handle = store.alloc(identity).unwrap();
            store.get_mut(handle).unwrap().save_key(peer_id(key, identity));

            let mut engine = AddressPrivacyEngine::new(Duration::from_secs(900), false);
            let outcome = Arc::new(Mutex::new(None));
            let sink = outcome.clone();
            engine
                .resolve(rpa, &store, Box::new(move |r| *sink.lock().unwrap() = Some(r)))
                .unwrap();
            engine.run_resolution(&mut store, &SoftCrypto);

            let expected = if expect_match { Some(handle) } else { None };
            prop_assert_eq!(*outcome.lock().unwrap(), Some(expected));
        }
    }
}
