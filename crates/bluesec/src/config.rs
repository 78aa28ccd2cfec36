//! Configuration management
//!
//! Settings come from a TOML document. Every field has a default, so an
//! empty document is a valid configuration.

use crate::error::{SecResult, SecurityError};
use crate::gap::{AddressType, BdAddr};
use crate::smp::constants::{
    DEFAULT_MAX_DEVICE_RECORDS, DEFAULT_PAIRING_TIMEOUT_SECS, DEFAULT_POST_FAILURE_DISCONNECT_SECS,
    DEFAULT_RPA_TIMEOUT_SECS, SMP_MAX_ENCRYPTION_KEY_SIZE, SMP_MIN_ENCRYPTION_KEY_SIZE,
};
use crate::smp::keygen::LocalIdentityKeys;
use crate::smp::router::PairingPolicy;
use crate::smp::{IoCapability, LeKey};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level security configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Bound of the device record store
    pub max_device_records: usize,
    pub pairing: PairingConfig,
    pub privacy: PrivacyConfig,
    pub local_keys: Option<LocalKeysConfig>,
    pub bonded: Vec<BondedDevice>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_device_records: DEFAULT_MAX_DEVICE_RECORDS,
            pairing: PairingConfig::default(),
            privacy: PrivacyConfig::default(),
            local_keys: None,
            bonded: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    pub io_capability: IoCapability,
    pub oob_data_present: bool,
    pub bonding: bool,
    pub mitm: bool,
    pub secure_connections: bool,
    pub max_key_size: u8,
    pub pairing_timeout_secs: u64,
    /// When false, a failed pairing leaves the link up
    pub disconnect_on_failure: bool,
    pub post_failure_disconnect_secs: u64,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            io_capability: IoCapability::NoInputNoOutput,
            oob_data_present: false,
            bonding: true,
            mitm: false,
            secure_connections: true,
            max_key_size: SMP_MAX_ENCRYPTION_KEY_SIZE,
            pairing_timeout_secs: DEFAULT_PAIRING_TIMEOUT_SECS,
            disconnect_on_failure: true,
            post_failure_disconnect_secs: DEFAULT_POST_FAILURE_DISCONNECT_SECS,
        }
    }
}

impl From<&PairingConfig> for PairingPolicy {
    fn from(config: &PairingConfig) -> Self {
        PairingPolicy {
            io_capability: config.io_capability,
            oob_data_present: config.oob_data_present,
            bonding: config.bonding,
            mitm: config.mitm,
            secure_connections: config.secure_connections,
            max_key_size: config.max_key_size,
            pairing_timeout: Duration::from_secs(config.pairing_timeout_secs),
            disconnect_on_failure: config.disconnect_on_failure,
            post_failure_disconnect: Duration::from_secs(config.post_failure_disconnect_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    pub enabled: bool,
    pub rpa_timeout_secs: u64,
    /// Push bonded IRKs to the controller's resolving list
    pub controller_resolving_list: bool,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rpa_timeout_secs: DEFAULT_RPA_TIMEOUT_SECS,
            controller_resolving_list: false,
        }
    }
}

impl PrivacyConfig {
    pub fn rpa_timeout(&self) -> Duration {
        Duration::from_secs(self.rpa_timeout_secs)
    }
}

/// Persisted local key hierarchy, as hex strings (little-endian bytes)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalKeysConfig {
    pub ir: Option<String>,
    pub irk: Option<String>,
    pub dhk: Option<String>,
    pub er: Option<String>,
}

fn parse_key16(name: &str, value: &str) -> SecResult<[u8; 16]> {
    let bytes = hex::decode(value)
        .map_err(|e| SecurityError::Config(format!("local_keys.{name}: {e}")))?;
    <[u8; 16]>::try_from(bytes.as_slice()).map_err(|_| {
        SecurityError::Config(format!(
            "local_keys.{name}: expected 16 bytes, got {}",
            bytes.len()
        ))
    })
}

impl LocalKeysConfig {
    /// Keys present in the document. The identity set counts only when IR,
    /// IRK and DHK are all given.
    pub fn to_keys(&self) -> SecResult<(Option<LocalIdentityKeys>, Option<[u8; 16]>)> {
        let identity = match (&self.ir, &self.irk, &self.dhk) {
            (Some(ir), Some(irk), Some(dhk)) => Some(LocalIdentityKeys {
                ir: parse_key16("ir", ir)?,
                irk: parse_key16("irk", irk)?,
                dhk: parse_key16("dhk", dhk)?,
                er: [0u8; 16],
            }),
            (None, None, None) => None,
            _ => {
                return Err(SecurityError::Config(
                    "local_keys needs ir, irk and dhk together".to_string(),
                ))
            }
        };
        let er = self.er.as_deref().map(|er| parse_key16("er", er)).transpose()?;
        Ok((identity, er))
    }

    pub fn from_keys(keys: &LocalIdentityKeys) -> Self {
        let identity = keys.has_identity();
        Self {
            ir: identity.then(|| hex::encode(keys.ir)),
            irk: identity.then(|| hex::encode(keys.irk)),
            dhk: identity.then(|| hex::encode(keys.dhk)),
            er: keys.has_encryption_root().then(|| hex::encode(keys.er)),
        }
    }
}

/// One persisted key: its type bit and the hex of its stored layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedKey {
    pub key_type: u8,
    pub value: String,
}

impl PersistedKey {
    pub fn from_key(key: &LeKey) -> Self {
        Self {
            key_type: key.key_type().bits(),
            value: hex::encode(key.encode()),
        }
    }

    pub fn to_key(&self) -> SecResult<LeKey> {
        let bytes = hex::decode(&self.value).map_err(|e| {
            SecurityError::Config(format!("key 0x{:02x}: {e}", self.key_type))
        })?;
        LeKey::decode(self.key_type, &bytes)
    }
}

/// A bonded peer restored at start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BondedDevice {
    pub address: BdAddr,
    pub address_type: AddressType,
    /// Device type bits: 0x01 BR/EDR, 0x02 LE
    #[serde(default = "default_device_type")]
    pub device_type: u8,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub keys: Vec<PersistedKey>,
}

fn default_device_type() -> u8 {
    crate::gap::constants::DEVICE_TYPE_LE
}

impl SecurityConfig {
    pub fn from_toml_str(text: &str) -> SecResult<Self> {
        let config: SecurityConfig =
            toml::from_str(text).map_err(|e| SecurityError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> SecResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SecurityError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> SecResult<String> {
        toml::to_string(self).map_err(|e| SecurityError::Config(e.to_string()))
    }

    /// Validate configuration
    pub fn validate(&self) -> SecResult<()> {
        if self.max_device_records == 0 {
            return Err(SecurityError::Config(
                "max_device_records must be > 0".to_string(),
            ));
        }
        if !(SMP_MIN_ENCRYPTION_KEY_SIZE..=SMP_MAX_ENCRYPTION_KEY_SIZE).contains(&self.pairing.max_key_size) {
            return Err(SecurityError::Config(format!(
                "pairing.max_key_size must be within {SMP_MIN_ENCRYPTION_KEY_SIZE}..={SMP_MAX_ENCRYPTION_KEY_SIZE}"
            )));
        }
        if self.pairing.pairing_timeout_secs == 0 {
            return Err(SecurityError::Config(
                "pairing.pairing_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.privacy.enabled && self.privacy.rpa_timeout_secs == 0 {
            return Err(SecurityError::Config(
                "privacy.rpa_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.bonded.len() > self.max_device_records {
            return Err(SecurityError::Config(format!(
                "{} bonded devices exceed max_device_records ({})",
                self.bonded.len(),
                self.max_device_records
            )));
        }
        if let Some(local) = &self.local_keys {
            local.to_keys()?;
        }
        for device in &self.bonded {
            for key in &device.keys {
                key.to_key().map_err(|e| {
                    SecurityError::Config(format!("bonded device {}: {e}", device.address))
                })?;
            }
        }
        Ok(())
    }
}
