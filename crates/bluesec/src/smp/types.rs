//! Type definitions for the security core
use super::constants::*;
use super::keys::LeKey;
use crate::error::SecResult;
use crate::gap::BdAddr;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

/// IO Capability types for pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoCapability {
    /// Display only capability
    DisplayOnly,
    /// Display with yes/no capability
    DisplayYesNo,
    /// Keyboard only
    KeyboardOnly,
    /// No input, no output
    #[default]
    NoInputNoOutput,
    /// Both keyboard and display
    KeyboardDisplay,
}

impl IoCapability {
    /// Convert to u8 value for protocol
    pub fn to_u8(&self) -> u8 {
        match self {
            IoCapability::DisplayOnly => SMP_IO_CAPABILITY_DISPLAY_ONLY,
            IoCapability::DisplayYesNo => SMP_IO_CAPABILITY_DISPLAY_YES_NO,
            IoCapability::KeyboardOnly => SMP_IO_CAPABILITY_KEYBOARD_ONLY,
            IoCapability::NoInputNoOutput => SMP_IO_CAPABILITY_NO_INPUT_NO_OUTPUT,
            IoCapability::KeyboardDisplay => SMP_IO_CAPABILITY_KEYBOARD_DISPLAY,
        }
    }

}

impl fmt::Display for IoCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoCapability::DisplayOnly => write!(f, "Display Only"),
            IoCapability::DisplayYesNo => write!(f, "Display Yes/No"),
            IoCapability::KeyboardOnly => write!(f, "Keyboard Only"),
            IoCapability::NoInputNoOutput => write!(f, "No Input No Output"),
            IoCapability::KeyboardDisplay => write!(f, "Keyboard Display"),
        }
    }
}

/// Authentication requirements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuthRequirements {
    /// Whether bonding is required
    pub bonding: bool,
    /// Whether MITM protection is required
    pub mitm: bool,
    /// Whether Secure Connections is required
    pub secure_connections: bool,
    /// Whether keypress notifications are required
    pub keypress_notifications: bool,
    /// Whether CT2 feature is supported
    pub ct2: bool,
}

impl AuthRequirements {
    pub fn new(bonding: bool, mitm: bool, secure_connections: bool) -> Self {
        Self {
            bonding,
            mitm,
            secure_connections,
            keypress_notifications: false,
            ct2: false,
        }
    }

    /// Convert to u8 value for protocol
    pub fn to_u8(&self) -> u8 {
        let mut value = 0;

        if self.bonding {
            value |= SMP_AUTH_REQ_BONDING;
        }

        if self.mitm {
            value |= SMP_AUTH_REQ_MITM;
        }

        if self.secure_connections {
            value |= SMP_AUTH_REQ_SC;
        }

        if self.keypress_notifications {
            value |= SMP_AUTH_REQ_KEYPRESS;
        }

        if self.ct2 {
            value |= SMP_AUTH_REQ_CT2;
        }

        value
    }

}

/// Key distribution preferences
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyDistribution {
    /// Encryption key (LTK, EDIV, RAND)
    pub encryption_key: bool,
    /// Identity key (IRK, public address)
    pub identity_key: bool,
    /// Signing key (CSRK)
    pub signing_key: bool,
    /// Link key derivation
    pub link_key: bool,
}

impl KeyDistribution {
    /// Encryption, identity and signing keys
    pub fn all() -> Self {
        Self {
            encryption_key: true,
            identity_key: true,
            signing_key: true,
            link_key: false,
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    /// Convert to u8 value for protocol
    pub fn to_u8(&self) -> u8 {
        let mut value = 0;

        if self.encryption_key {
            value |= SMP_KEY_DIST_ENC_KEY;
        }

        if self.identity_key {
            value |= SMP_KEY_DIST_ID_KEY;
        }

        if self.signing_key {
            value |= SMP_KEY_DIST_SIGN_KEY;
        }

        if self.link_key {
            value |= SMP_KEY_DIST_LINK_KEY;
        }

        value
    }

}

/// Pairing failure reasons reported by the pairing protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SmpReason {
    PasskeyEntryFailed,
    OobNotAvailable,
    AuthenticationRequirements,
    ConfirmValueFailed,
    PairingNotSupported,
    EncryptionKeySize,
    CommandNotSupported,
    UnspecifiedReason,
    RepeatedAttempts,
    InvalidParameters,
    DhKeyCheckFailed,
    NumericComparisonFailed,
    BrEdrPairingInProgress,
    CrossTransportKeyNotAllowed,
    PairingTimeout,
    ConnectionTimeout,
    PairingCancelled,
}

impl SmpReason {
    pub fn to_u8(&self) -> u8 {
        match self {
            SmpReason::PasskeyEntryFailed => SMP_REASON_PASSKEY_ENTRY_FAILED,
            SmpReason::OobNotAvailable => SMP_REASON_OOB_NOT_AVAILABLE,
            SmpReason::AuthenticationRequirements => SMP_REASON_AUTHENTICATION_REQUIREMENTS,
            SmpReason::ConfirmValueFailed => SMP_REASON_CONFIRM_VALUE_FAILED,
            SmpReason::PairingNotSupported => SMP_REASON_PAIRING_NOT_SUPPORTED,
            SmpReason::EncryptionKeySize => SMP_REASON_ENCRYPTION_KEY_SIZE,
            SmpReason::CommandNotSupported => SMP_REASON_COMMAND_NOT_SUPPORTED,
            SmpReason::UnspecifiedReason => SMP_REASON_UNSPECIFIED_REASON,
            SmpReason::RepeatedAttempts => SMP_REASON_REPEATED_ATTEMPTS,
            SmpReason::InvalidParameters => SMP_REASON_INVALID_PARAMETERS,
            SmpReason::DhKeyCheckFailed => SMP_REASON_DHKEY_CHECK_FAILED,
            SmpReason::NumericComparisonFailed => SMP_REASON_NUMERIC_COMPARISON_FAILED,
            SmpReason::BrEdrPairingInProgress => SMP_REASON_BR_EDR_PAIRING_IN_PROGRESS,
            SmpReason::CrossTransportKeyNotAllowed => SMP_REASON_CROSS_TRANSPORT_KEY_NOT_ALLOWED,
            SmpReason::PairingTimeout => SMP_REASON_PAIRING_TIMEOUT,
            SmpReason::ConnectionTimeout => SMP_REASON_CONNECTION_TIMEOUT,
            SmpReason::PairingCancelled => SMP_REASON_PAIRING_CANCELLED,
        }
    }
}

impl fmt::Display for SmpReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SmpReason::PasskeyEntryFailed => "passkey entry failed",
            SmpReason::OobNotAvailable => "OOB data not available",
            SmpReason::AuthenticationRequirements => "authentication requirements not met",
            SmpReason::ConfirmValueFailed => "confirm value failed",
            SmpReason::PairingNotSupported => "pairing not supported",
            SmpReason::EncryptionKeySize => "encryption key size",
            SmpReason::CommandNotSupported => "command not supported",
            SmpReason::UnspecifiedReason => "unspecified reason",
            SmpReason::RepeatedAttempts => "too many pairing attempts",
            SmpReason::InvalidParameters => "invalid parameters",
            SmpReason::DhKeyCheckFailed => "DHKey check failed",
            SmpReason::NumericComparisonFailed => "numeric comparison failed",
            SmpReason::BrEdrPairingInProgress => "BR/EDR pairing in progress",
            SmpReason::CrossTransportKeyNotAllowed => "cross-transport key not allowed",
            SmpReason::PairingTimeout => "pairing timed out",
            SmpReason::ConnectionTimeout => "connection timed out",
            SmpReason::PairingCancelled => "pairing cancelled",
        };
        write!(f, "{} (0x{:02x})", text, self.to_u8())
    }
}

/// Outcome reported by the pairing protocol or passed back to it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmpStatus {
    Success,
    Failed(SmpReason),
}

impl SmpStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, SmpStatus::Success)
    }

    /// Map a reply decision onto a status, using `reason` when rejected
    pub fn from_accept(accept: bool, reason: SmpReason) -> Self {
        if accept {
            SmpStatus::Success
        } else {
            SmpStatus::Failed(reason)
        }
    }
}

/// Protection a key or link offers against man-in-the-middle attack
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum SecurityLevel {
    #[default]
    None,
    Unauthenticated,
    Authenticated,
}

impl SecurityLevel {
    /// Value used in persisted key layouts
    pub fn to_persisted(&self) -> u8 {
        match self {
            SecurityLevel::None => SEC_LEVEL_NONE,
            SecurityLevel::Unauthenticated => SEC_LEVEL_UNAUTHENTICATED,
            SecurityLevel::Authenticated => SEC_LEVEL_AUTHENTICATED,
        }
    }

    /// Anything at or above the authenticated value counts as authenticated
    pub fn from_persisted(value: u8) -> Self {
        match value {
            SEC_LEVEL_NONE => SecurityLevel::None,
            v if v >= SEC_LEVEL_AUTHENTICATED => SecurityLevel::Authenticated,
            _ => SecurityLevel::Unauthenticated,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        *self == SecurityLevel::Authenticated
    }
}

bitflags! {
    /// Per-record security flags, bit-exact with the persisted layout
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SecurityFlags: u16 {
        const AUTHORIZED = 0x0001;
        const AUTHENTICATED = 0x0002;
        const ENCRYPTED = 0x0004;
        const NAME_KNOWN = 0x0008;
        const LINK_KEY_KNOWN = 0x0010;
        const LINK_KEY_AUTHED = 0x0020;
        const ROLE_SWITCHED = 0x0040;
        const IN_USE = 0x0080;
        const LE_AUTHORIZATION = 0x0100;
        const LE_AUTHENTICATED = 0x0200;
        const LE_ENCRYPTED = 0x0400;
        const LE_NAME_KNOWN = 0x0800;
        const LE_LINK_KEY_KNOWN = 0x1000;
        const LE_LINK_KEY_AUTHED = 0x2000;
        const SIXTEEN_DIGIT_PIN = 0x4000;
    }
}

bitflags! {
    /// Key types held by a record
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct KeyType: u8 {
        /// Peer encryption key
        const PENC = 0x01;
        /// Peer identity key
        const PID = 0x02;
        /// Peer signing key
        const PCSRK = 0x04;
        /// BR/EDR link key
        const PLK = 0x08;
        /// Local encryption key
        const LENC = 0x10;
        /// Local identity key
        const LID = 0x20;
        /// Local signing key
        const LCSRK = 0x40;
        const LLK = 0x80;
    }
}

bitflags! {
    /// Security a service or link demands of a peer
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ServiceSecurity: u16 {
        const IN_AUTHORIZE = 0x0001;
        const IN_AUTHENTICATE = 0x0002;
        const IN_ENCRYPT = 0x0004;
        const OUT_AUTHORIZE = 0x0008;
        const OUT_AUTHENTICATE = 0x0010;
        const OUT_ENCRYPT = 0x0020;
        const IN_MITM = 0x1000;
        const OUT_MITM = 0x2000;
    }
}

impl ServiceSecurity {
    /// True if the given direction needs any link protection at all
    pub fn requires_security(&self, is_originator: bool) -> bool {
        let mask = if is_originator {
            ServiceSecurity::OUT_AUTHENTICATE | ServiceSecurity::OUT_ENCRYPT | ServiceSecurity::OUT_MITM
        } else {
            ServiceSecurity::IN_AUTHENTICATE | ServiceSecurity::IN_ENCRYPT | ServiceSecurity::IN_MITM
        };
        self.intersects(mask)
    }

    /// True if the given direction needs MITM protection
    pub fn requires_mitm(&self, is_originator: bool) -> bool {
        if is_originator {
            self.contains(ServiceSecurity::OUT_MITM)
        } else {
            self.contains(ServiceSecurity::IN_MITM)
        }
    }
}

/// Procedure currently running on a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityState {
    #[default]
    Idle,
    Authenticating,
    Encrypting,
}

impl SecurityState {
    pub fn is_busy(&self) -> bool {
        !matches!(self, SecurityState::Idle)
    }
}

/// Which address a peer is currently using on air
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActiveAddressType {
    #[default]
    Pseudo,
    ResolvedRandom,
}

/// What must happen before a link satisfies a security requirement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityAction {
    /// Link already qualifies
    Ok,
    /// Encrypt with the stored key
    EncryptExisting,
    /// Pair without MITM protection
    PairNoMitm,
    /// Pair with MITM protection
    PairMitm,
    /// Another procedure is running on this record
    Discard,
}

/// Which local key set a load or notification refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalKeyType {
    /// IR, IRK and DHK
    Identity,
    /// ER
    EncryptionRoot,
}

/// Events delivered to the application callback
#[derive(Debug, Clone, PartialEq)]
pub enum SecurityEvent {
    /// Peer sent a security request
    SecurityRequest(BdAddr),
    /// Show this passkey to the user
    PasskeyNotification(BdAddr, u32),
    /// Ask the user for the peer's passkey
    PasskeyRequest(BdAddr),
    /// Ask the user to confirm a numeric comparison value
    NumericComparisonRequest(BdAddr, u32),
    /// Ask the application for OOB data
    OobRequest(BdAddr),
    /// A key was distributed by the peer or generated for it
    KeyReceived(BdAddr, LeKey),
    /// A cancel request finished
    PairingCancelled(BdAddr),
    /// Pairing finished, one event per attempt
    PairingComplete {
        peer: BdAddr,
        status: SmpStatus,
        bonded: bool,
    },
    /// Local key hierarchy became available
    LocalKeysReady(LocalKeyType),
    /// Local key generation failed and the keys were zeroed
    LocalKeysFailed(LocalKeyType),
    /// A new resolvable private address was programmed
    LocalAddressChanged(BdAddr),
}

/// Application callback type
pub type SecurityEventCallback = Box<dyn FnMut(SecurityEvent) + Send>;

/// Per-request completion for `set_encryption`
pub type EncryptionCallback = Box<dyn FnOnce(BdAddr, SecResult<()>) + Send>;
