//! Per-peer security record

use super::keys::{LeKey, LeKeys};
use super::types::*;
use crate::gap::{
    AddressType, BdAddr, DeviceType, LinkRole, LE_CONN_INTERVAL_MAX, LE_CONN_INTERVAL_MIN,
    LE_CONN_LATENCY_DEFAULT, LE_CONN_LATENCY_MAX, LE_CONN_PARAM_UNDEF,
    LE_SUPERVISION_TIMEOUT_DEFAULT, LE_SUPERVISION_TIMEOUT_MAX, LE_SUPERVISION_TIMEOUT_MIN,
};
use crate::error::{SecResult, SecurityError};

/// Preferred LE connection parameters; `LE_CONN_PARAM_UNDEF` marks an unset field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnParams {
    pub min_interval: u16,
    pub max_interval: u16,
    pub slave_latency: u16,
    pub supervision_timeout: u16,
}

impl Default for ConnParams {
    fn default() -> Self {
        Self {
            min_interval: LE_CONN_PARAM_UNDEF,
            max_interval: LE_CONN_PARAM_UNDEF,
            slave_latency: LE_CONN_PARAM_UNDEF,
            supervision_timeout: LE_CONN_PARAM_UNDEF,
        }
    }
}

fn in_range_or_undef(value: u16, min: u16, max: u16) -> bool {
    value == LE_CONN_PARAM_UNDEF || (min..=max).contains(&value)
}

impl ConnParams {
    /// Validate a preference and fill in undefined counterparts
    pub fn new(
        min_interval: u16,
        max_interval: u16,
        slave_latency: u16,
        supervision_timeout: u16,
    ) -> SecResult<Self> {
        if !in_range_or_undef(min_interval, LE_CONN_INTERVAL_MIN, LE_CONN_INTERVAL_MAX)
            || !in_range_or_undef(max_interval, LE_CONN_INTERVAL_MIN, LE_CONN_INTERVAL_MAX)
            || !in_range_or_undef(
                supervision_timeout,
                LE_SUPERVISION_TIMEOUT_MIN,
                LE_SUPERVISION_TIMEOUT_MAX,
            )
            || (slave_latency != LE_CONN_PARAM_UNDEF && slave_latency > LE_CONN_LATENCY_MAX)
        {
            return Err(SecurityError::InvalidParameter(format!(
                "connection parameters out of range: interval {min_interval:#06x}..{max_interval:#06x} \
                 latency {slave_latency} timeout {supervision_timeout:#06x}"
            )));
        }

        let mut params = Self {
            min_interval,
            max_interval,
            slave_latency,
            supervision_timeout,
        };
        if params.min_interval == LE_CONN_PARAM_UNDEF {
            params.min_interval = params.max_interval;
        }
        if params.max_interval == LE_CONN_PARAM_UNDEF {
            params.max_interval = params.min_interval;
        }
        if params.min_interval != LE_CONN_PARAM_UNDEF && params.min_interval > params.max_interval
        {
            return Err(SecurityError::InvalidParameter(
                "minimum interval above maximum".to_string(),
            ));
        }
        if params.slave_latency == LE_CONN_PARAM_UNDEF {
            params.slave_latency = LE_CONN_LATENCY_DEFAULT;
        }
        if params.supervision_timeout == LE_CONN_PARAM_UNDEF {
            params.supervision_timeout = LE_SUPERVISION_TIMEOUT_DEFAULT;
        }
        Ok(params)
    }
}

/// Everything known about one peer
#[derive(Debug, Clone)]
pub struct DeviceSecurityRecord {
    /// Identity address; becomes the static address once the peer IRK arrives
    pub bd_addr: BdAddr,
    /// Address the peer connected with
    pub pseudo_addr: BdAddr,
    pub ble_addr_type: AddressType,
    /// Last RPA resolved to this record
    pub cur_rand_addr: Option<BdAddr>,
    pub active_addr_type: ActiveAddressType,
    pub device_type: DeviceType,
    pub name: Option<String>,
    pub sec_flags: SecurityFlags,
    pub sec_state: SecurityState,
    pub role: LinkRole,
    pub ble_hci_handle: Option<u16>,
    /// Negotiated key size of the current link, 0 when unknown
    pub enc_key_size: u8,
    /// Requirements this record has been asked to satisfy
    pub security_required: ServiceSecurity,
    pub keys: LeKeys,
    pub conn_params: ConnParams,
    /// BR/EDR link key carried over from a classic record
    pub link_key: Option<[u8; 16]>,
}

impl DeviceSecurityRecord {
    pub fn new(bd_addr: BdAddr) -> Self {
        Self {
            bd_addr,
            pseudo_addr: bd_addr,
            ble_addr_type: AddressType::Public,
            cur_rand_addr: None,
            active_addr_type: ActiveAddressType::Pseudo,
            device_type: DeviceType::LE,
            name: None,
            sec_flags: SecurityFlags::empty(),
            sec_state: SecurityState::Idle,
            role: LinkRole::Master,
            ble_hci_handle: None,
            enc_key_size: 0,
            security_required: ServiceSecurity::empty(),
            keys: LeKeys::default(),
            conn_params: ConnParams::default(),
            link_key: None,
        }
    }

    pub fn key_types(&self) -> KeyType {
        self.keys.key_types()
    }

    /// True if `addr` is any address this record answers to
    pub fn matches_addr(&self, addr: &BdAddr) -> bool {
        self.bd_addr == *addr || self.pseudo_addr == *addr || self.cur_rand_addr == Some(*addr)
    }

    pub fn is_link_encrypted(&self) -> bool {
        self.sec_flags.contains(SecurityFlags::LE_ENCRYPTED)
    }

    pub fn is_connected(&self) -> bool {
        self.ble_hci_handle.is_some()
    }

    /// Address currently used on air
    pub fn remote_connection_addr(&self) -> BdAddr {
        match (self.active_addr_type, self.cur_rand_addr) {
            (ActiveAddressType::ResolvedRandom, Some(rpa)) => rpa,
            _ => self.pseudo_addr,
        }
    }

    /// Store a key and update the flags it implies
    pub fn save_key(&mut self, key: LeKey) {
        match &key {
            LeKey::PeerEnc(k) => {
                self.sec_flags |= SecurityFlags::LE_LINK_KEY_KNOWN;
                if k.sec_level.is_authenticated() {
                    self.sec_flags |= SecurityFlags::LE_LINK_KEY_AUTHED;
                } else {
                    self.sec_flags.remove(SecurityFlags::LE_LINK_KEY_AUTHED);
                }
                if self.enc_key_size == 0 {
                    self.enc_key_size = k.key_size;
                }
            }
            LeKey::PeerId(k) => {
                self.bd_addr = k.static_addr;
                self.ble_addr_type = k.addr_type;
            }
            LeKey::LocalEnc(k) if self.enc_key_size == 0 => {
                self.enc_key_size = k.key_size;
            }
            _ => {}
        }
        self.keys.insert(key);
    }

    /// Link-security summary: encrypted bit, plus paired with or without MITM
    pub fn le_security_state(&self) -> (u8, u8) {
        let mut state = 0u8;
        if self.is_link_encrypted() {
            state |= super::constants::LE_SEC_LINK_ENCRYPTED;
        }
        if self.sec_flags.contains(SecurityFlags::LE_LINK_KEY_KNOWN) {
            if self.sec_flags.contains(SecurityFlags::LE_LINK_KEY_AUTHED) {
                state |= super::constants::LE_SEC_PAIRED_WITH_MITM;
            } else {
                state |= super::constants::LE_SEC_PAIRED_WITHOUT_MITM;
            }
        }
        (state, self.enc_key_size)
    }

    /// Drop link-scoped state after a disconnection
    pub fn clear_link(&mut self) {
        self.sec_flags.remove(
            SecurityFlags::LE_ENCRYPTED | SecurityFlags::LE_AUTHENTICATED | SecurityFlags::ENCRYPTED,
        );
        self.sec_state = SecurityState::Idle;
        self.ble_hci_handle = None;
        self.enc_key_size = 0;
    }
}
