//! HCI protocol constants
//!
//! Opcodes, event codes and reason codes used by the security core.

// HCI packet types
pub const HCI_COMMAND_PKT: u8 = 0x01;
pub const HCI_EVENT_PKT: u8 = 0x04;

// Maximum size of HCI command parameters
pub const HCI_MAX_PARAM_LEN: usize = 255;

// OGF (Opcode Group Field) values
pub const OGF_LINK_CTL: u8 = 0x01;
pub const OGF_LE: u8 = 0x08;

// Link Control Commands (OGF: 0x01)
pub const OCF_DISCONNECT: u16 = 0x0006;

// LE Command OCF values (OGF: 0x08)
pub const OCF_LE_SET_RANDOM_ADDRESS: u16 = 0x0005;
pub const OCF_LE_START_ENCRYPTION: u16 = 0x0019;
pub const OCF_LE_LTK_REQUEST_REPLY: u16 = 0x001A;
pub const OCF_LE_LTK_REQUEST_NEG_REPLY: u16 = 0x001B;
pub const OCF_LE_ADD_DEVICE_TO_RESOLVING_LIST: u16 = 0x0027;
pub const OCF_LE_REMOVE_DEVICE_FROM_RESOLVING_LIST: u16 = 0x0028;

// HCI Events
pub const EVT_DISCONN_COMPLETE: u8 = 0x05;
pub const EVT_ENCRYPTION_CHANGE: u8 = 0x08;
pub const EVT_CMD_COMPLETE: u8 = 0x0E;
pub const EVT_CMD_STATUS: u8 = 0x0F;
pub const EVT_ENCRYPTION_KEY_REFRESH: u8 = 0x30;
pub const EVT_LE_META_EVENT: u8 = 0x3E;

// LE Meta Events
pub const EVT_LE_CONN_COMPLETE: u8 = 0x01;
pub const EVT_LE_LTK_REQUEST: u8 = 0x05;

// Status and disconnect reason codes
pub const HCI_SUCCESS: u8 = 0x00;
pub const HCI_ERR_AUTH_FAILURE: u8 = 0x05;
pub const HCI_ERR_CONNECTION_TIMEOUT: u8 = 0x08;
pub const HCI_ERR_PEER_USER: u8 = 0x13;
