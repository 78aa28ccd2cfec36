use crate::gap::constants::*;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressType {
    Public,
    Random,
    PublicIdentity,
    RandomIdentity,
}

impl From<u8> for AddressType {
    fn from(value: u8) -> Self {
        match value {
            PUBLIC_DEVICE_ADDRESS => AddressType::Public,
            RANDOM_DEVICE_ADDRESS => AddressType::Random,
            PUBLIC_IDENTITY_ADDRESS => AddressType::PublicIdentity,
            RANDOM_IDENTITY_ADDRESS => AddressType::RandomIdentity,
            _ => AddressType::Public,
        }
    }
}

impl From<AddressType> for u8 {
    fn from(value: AddressType) -> Self {
        match value {
            AddressType::Public => PUBLIC_DEVICE_ADDRESS,
            AddressType::Random => RANDOM_DEVICE_ADDRESS,
            AddressType::PublicIdentity => PUBLIC_IDENTITY_ADDRESS,
            AddressType::RandomIdentity => RANDOM_IDENTITY_ADDRESS,
        }
    }
}

impl AddressType {
    pub fn is_random(&self) -> bool {
        matches!(self, AddressType::Random | AddressType::RandomIdentity)
    }
}

/// Bluetooth device address, stored least significant octet first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BdAddr {
    pub bytes: [u8; 6],
}

impl BdAddr {
    pub fn new(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() >= 6 {
            let mut bytes = [0u8; 6];
            bytes.copy_from_slice(&slice[0..6]);
            Some(Self { bytes })
        } else {
            None
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Sub-type bits of a random address (the two most significant bits)
    pub fn random_subtype(&self) -> u8 {
        self.bytes[5] & RANDOM_ADDRESS_TYPE_MASK
    }

    /// True if the address follows the resolvable private address layout
    pub fn is_resolvable_private(&self) -> bool {
        self.random_subtype() == RANDOM_ADDRESS_RESOLVABLE
    }

    /// True if the address follows the static random address layout
    pub fn is_static_random(&self) -> bool {
        self.random_subtype() == RANDOM_ADDRESS_STATIC
    }

    /// The 24-bit hash part of a resolvable private address
    pub fn rpa_hash(&self) -> [u8; 3] {
        [self.bytes[0], self.bytes[1], self.bytes[2]]
    }

    /// The 24-bit random part of a resolvable private address
    pub fn rpa_prand(&self) -> [u8; 3] {
        [self.bytes[3], self.bytes[4], self.bytes[5]]
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.bytes[5],
            self.bytes[4],
            self.bytes[3],
            self.bytes[2],
            self.bytes[1],
            self.bytes[0]
        )
    }
}

impl FromStr for BdAddr {
    type Err = String;

    /// Parses the `AA:BB:CC:DD:EE:FF` form produced by `Display`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s.split(':').collect();
        let mut raw = hex::decode(&digits).map_err(|e| format!("invalid address {s}: {e}"))?;
        if raw.len() != 6 {
            return Err(format!("invalid address {s}: expected 6 octets"));
        }
        raw.reverse();
        BdAddr::from_slice(&raw).ok_or_else(|| format!("invalid address {s}"))
    }
}

impl TryFrom<String> for BdAddr {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BdAddr> for String {
    fn from(value: BdAddr) -> Self {
        value.to_string()
    }
}

bitflags! {
    /// Transports a device has been seen on
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceType: u8 {
        const BREDR = DEVICE_TYPE_BREDR;
        const LE = DEVICE_TYPE_LE;
        const DUMO = DEVICE_TYPE_DUMO;
    }
}

impl DeviceType {
    pub fn is_le_capable(&self) -> bool {
        self.contains(DeviceType::LE)
    }
}

/// Local role on an active link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Master,
    Slave,
}
