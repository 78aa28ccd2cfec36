//! Constants for the security core

// IO Capability values
pub const SMP_IO_CAPABILITY_DISPLAY_ONLY: u8 = 0x00;
pub const SMP_IO_CAPABILITY_DISPLAY_YES_NO: u8 = 0x01;
pub const SMP_IO_CAPABILITY_KEYBOARD_ONLY: u8 = 0x02;
pub const SMP_IO_CAPABILITY_NO_INPUT_NO_OUTPUT: u8 = 0x03;
pub const SMP_IO_CAPABILITY_KEYBOARD_DISPLAY: u8 = 0x04;

// Authentication Requirements bit masks
pub const SMP_AUTH_REQ_BONDING: u8 = 0x01;
pub const SMP_AUTH_REQ_MITM: u8 = 0x04;
pub const SMP_AUTH_REQ_SC: u8 = 0x08;
pub const SMP_AUTH_REQ_KEYPRESS: u8 = 0x10;
pub const SMP_AUTH_REQ_CT2: u8 = 0x20;

// Pairing Failed reason codes
pub const SMP_REASON_PASSKEY_ENTRY_FAILED: u8 = 0x01;
pub const SMP_REASON_OOB_NOT_AVAILABLE: u8 = 0x02;
pub const SMP_REASON_AUTHENTICATION_REQUIREMENTS: u8 = 0x03;
pub const SMP_REASON_CONFIRM_VALUE_FAILED: u8 = 0x04;
pub const SMP_REASON_PAIRING_NOT_SUPPORTED: u8 = 0x05;
pub const SMP_REASON_ENCRYPTION_KEY_SIZE: u8 = 0x06;
pub const SMP_REASON_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const SMP_REASON_UNSPECIFIED_REASON: u8 = 0x08;
pub const SMP_REASON_REPEATED_ATTEMPTS: u8 = 0x09;
pub const SMP_REASON_INVALID_PARAMETERS: u8 = 0x0A;
pub const SMP_REASON_DHKEY_CHECK_FAILED: u8 = 0x0B;
pub const SMP_REASON_NUMERIC_COMPARISON_FAILED: u8 = 0x0C;
pub const SMP_REASON_BR_EDR_PAIRING_IN_PROGRESS: u8 = 0x0D;
pub const SMP_REASON_CROSS_TRANSPORT_KEY_NOT_ALLOWED: u8 = 0x0E;
// Host-side reasons, outside the over-the-air range
pub const SMP_REASON_PAIRING_TIMEOUT: u8 = 0x16;
pub const SMP_REASON_CONNECTION_TIMEOUT: u8 = 0x17;
pub const SMP_REASON_PAIRING_CANCELLED: u8 = 0x18;

// SMP key distribution bit masks
pub const SMP_KEY_DIST_ENC_KEY: u8 = 0x01;
pub const SMP_KEY_DIST_ID_KEY: u8 = 0x02;
pub const SMP_KEY_DIST_SIGN_KEY: u8 = 0x04;
pub const SMP_KEY_DIST_LINK_KEY: u8 = 0x08;

// SMP encryption key size limits
pub const SMP_MIN_ENCRYPTION_KEY_SIZE: u8 = 7;
pub const SMP_MAX_ENCRYPTION_KEY_SIZE: u8 = 16;

// Persisted security level values
pub const SEC_LEVEL_NONE: u8 = 0;
pub const SEC_LEVEL_UNAUTHENTICATED: u8 = 1;
pub const SEC_LEVEL_AUTHENTICATED: u8 = 4;

// LE security state summary bits
pub const LE_SEC_LINK_ENCRYPTED: u8 = 0x01;
pub const LE_SEC_PAIRED_WITHOUT_MITM: u8 = 0x02;
pub const LE_SEC_PAIRED_WITH_MITM: u8 = 0x04;

// Plaintexts for the local key hierarchy
pub const DHK_PLAINTEXT_ID: u8 = 0x03;
pub const IRK_PLAINTEXT_ID: u8 = 0x01;

// Signature layout
pub const SIGN_COUNTER_LEN: usize = 4;
pub const SIGN_MAC_LEN: usize = 8;
pub const SIGNATURE_LEN: usize = SIGN_COUNTER_LEN + SIGN_MAC_LEN;

// Defaults
pub const DEFAULT_MAX_DEVICE_RECORDS: usize = 15;
pub const DEFAULT_PAIRING_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_POST_FAILURE_DISCONNECT_SECS: u64 = 3;
pub const DEFAULT_RPA_TIMEOUT_SECS: u64 = 900;
