//! HCI packet structures and parsing
//!
//! This module contains the commands the security core sends and the
//! events it decodes.

use crate::error::HciError;
use crate::hci::constants::*;
use byteorder::{ByteOrder, LittleEndian};

/// HCI commands issued by the security core
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum HciCommand {
    // Link Control Commands (OGF: 0x01)
    Disconnect { handle: u16, reason: u8 },

    // LE Commands (OGF: 0x08)
    LeSetRandomAddress { address: [u8; 6] },
    LeStartEncryption {
        handle: u16,
        rand: [u8; 8],
        ediv: u16,
        ltk: [u8; 16],
    },
    LeLtkRequestReply { handle: u16, ltk: [u8; 16] },
    LeLtkRequestNegativeReply { handle: u16 },
    LeAddDeviceToResolvingList {
        peer_identity_address_type: u8,
        peer_identity_address: [u8; 6],
        peer_irk: [u8; 16],
        local_irk: [u8; 16],
    },
    LeRemoveDeviceFromResolvingList {
        peer_identity_address_type: u8,
        peer_identity_address: [u8; 6],
    },
}

impl HciCommand {
    /// Get the OGF and OCF for this command
    pub fn opcode_parts(&self) -> (u8, u16) {
        match self {
            Self::Disconnect { .. } => (OGF_LINK_CTL, OCF_DISCONNECT),

            Self::LeSetRandomAddress { .. } => (OGF_LE, OCF_LE_SET_RANDOM_ADDRESS),
            Self::LeStartEncryption { .. } => (OGF_LE, OCF_LE_START_ENCRYPTION),
            Self::LeLtkRequestReply { .. } => (OGF_LE, OCF_LE_LTK_REQUEST_REPLY),
            Self::LeLtkRequestNegativeReply { .. } => (OGF_LE, OCF_LE_LTK_REQUEST_NEG_REPLY),
            Self::LeAddDeviceToResolvingList { .. } => {
                (OGF_LE, OCF_LE_ADD_DEVICE_TO_RESOLVING_LIST)
            }
            Self::LeRemoveDeviceFromResolvingList { .. } => {
                (OGF_LE, OCF_LE_REMOVE_DEVICE_FROM_RESOLVING_LIST)
            }
        }
    }

    /// Full 16-bit opcode
    pub fn opcode(&self) -> u16 {
        let (ogf, ocf) = self.opcode_parts();
        ((ogf as u16) << 10) | (ocf & 0x3ff)
    }

    /// Convert the command to its raw parameter bytes
    fn parameters(&self) -> Vec<u8> {
        match *self {
            Self::Disconnect { handle, reason } => {
                let mut params = Vec::with_capacity(3);
                params.extend_from_slice(&handle.to_le_bytes());
                params.push(reason);
                params
            }

            Self::LeSetRandomAddress { address } => address.to_vec(),

            Self::LeStartEncryption {
                handle,
                rand,
                ediv,
                ltk,
            } => {
                let mut params = Vec::with_capacity(28);
                params.extend_from_slice(&handle.to_le_bytes());
                params.extend_from_slice(&rand);
                params.extend_from_slice(&ediv.to_le_bytes());
                params.extend_from_slice(&ltk);
                params
            }

            Self::LeLtkRequestReply { handle, ltk } => {
                let mut params = Vec::with_capacity(18);
                params.extend_from_slice(&handle.to_le_bytes());
                params.extend_from_slice(&ltk);
                params
            }

            Self::LeLtkRequestNegativeReply { handle } => handle.to_le_bytes().to_vec(),

            Self::LeAddDeviceToResolvingList {
                peer_identity_address_type,
                peer_identity_address,
                peer_irk,
                local_irk,
            } => {
                let mut params = Vec::with_capacity(39);
                params.push(peer_identity_address_type);
                params.extend_from_slice(&peer_identity_address);
                params.extend_from_slice(&peer_irk);
                params.extend_from_slice(&local_irk);
                params
            }

            Self::LeRemoveDeviceFromResolvingList {
                peer_identity_address_type,
                peer_identity_address,
            } => {
                let mut params = Vec::with_capacity(7);
                params.push(peer_identity_address_type);
                params.extend_from_slice(&peer_identity_address);
                params
            }
        }
    }

    /// Convert the command to a raw HCI packet
    pub fn to_packet(&self) -> Vec<u8> {
        let params = self.parameters();

        let mut packet = vec![HCI_COMMAND_PKT];
        packet.extend_from_slice(&self.opcode().to_le_bytes());
        packet.push(params.len() as u8);
        packet.extend_from_slice(&params);
        packet
    }
}

/// HCI Event packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HciEvent {
    pub event_code: u8,
    pub parameter_total_length: u8,
    pub parameters: Vec<u8>,
}

impl HciEvent {
    /// Parse an HCI event from raw bytes (without the packet type indicator)
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 2 {
            return None;
        }

        let event_code = data[0];
        let parameter_total_length = data[1];

        if data.len() < (parameter_total_length as usize + 2) {
            return None;
        }

        let parameters = data[2..(parameter_total_length as usize + 2)].to_vec();

        Some(HciEvent {
            event_code,
            parameter_total_length,
            parameters,
        })
    }

    /// Build an event from its code and parameters
    pub fn new(event_code: u8, parameters: Vec<u8>) -> Result<Self, HciError> {
        if parameters.len() > HCI_MAX_PARAM_LEN {
            return Err(HciError::InvalidParamLength(parameters.len()));
        }
        Ok(HciEvent {
            event_code,
            parameter_total_length: parameters.len() as u8,
            parameters,
        })
    }

    /// LE meta sub-event code, if this is an LE meta event
    pub fn le_subevent(&self) -> Option<u8> {
        if self.event_code == EVT_LE_META_EVENT {
            self.parameters.first().copied()
        } else {
            None
        }
    }
}

/// Encryption Change (and Encryption Key Refresh Complete) event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptionChange {
    pub status: u8,
    pub handle: u16,
    pub enabled: bool,
}

impl EncryptionChange {
    pub fn parse(event: &HciEvent) -> Result<Self, HciError> {
        let p = &event.parameters;
        match event.event_code {
            EVT_ENCRYPTION_CHANGE => {
                if p.len() < 4 {
                    return Err(HciError::InvalidParamLength(p.len()));
                }
                Ok(EncryptionChange {
                    status: p[0],
                    handle: LittleEndian::read_u16(&p[1..3]) & 0x0FFF,
                    enabled: p[3] != 0,
                })
            }
            EVT_ENCRYPTION_KEY_REFRESH => {
                if p.len() < 3 {
                    return Err(HciError::InvalidParamLength(p.len()));
                }
                // A refreshed key leaves the link encrypted
                Ok(EncryptionChange {
                    status: p[0],
                    handle: LittleEndian::read_u16(&p[1..3]) & 0x0FFF,
                    enabled: true,
                })
            }
            _ => Err(HciError::InvalidPacketFormat),
        }
    }

    /// True if the link ended up encrypted
    pub fn is_encrypted(&self) -> bool {
        self.status == HCI_SUCCESS && self.enabled
    }
}

/// Disconnection Complete event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectionComplete {
    pub status: u8,
    pub handle: u16,
    pub reason: u8,
}

impl DisconnectionComplete {
    pub fn parse(event: &HciEvent) -> Result<Self, HciError> {
        if event.event_code != EVT_DISCONN_COMPLETE {
            return Err(HciError::InvalidPacketFormat);
        }
        let p = &event.parameters;
        if p.len() < 4 {
            return Err(HciError::InvalidParamLength(p.len()));
        }
        Ok(DisconnectionComplete {
            status: p[0],
            handle: LittleEndian::read_u16(&p[1..3]) & 0x0FFF,
            reason: p[3],
        })
    }
}

/// LE Long Term Key Request sub-event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeLongTermKeyRequest {
    pub handle: u16,
    pub rand: [u8; 8],
    pub ediv: u16,
}

impl LeLongTermKeyRequest {
    pub fn parse(event: &HciEvent) -> Result<Self, HciError> {
        if event.le_subevent() != Some(EVT_LE_LTK_REQUEST) {
            return Err(HciError::InvalidPacketFormat);
        }
        let p = &event.parameters;
        if p.len() < 13 {
            return Err(HciError::InvalidParamLength(p.len()));
        }
        let mut rand = [0u8; 8];
        rand.copy_from_slice(&p[3..11]);
        Ok(LeLongTermKeyRequest {
            handle: LittleEndian::read_u16(&p[1..3]) & 0x0FFF,
            rand,
            ediv: LittleEndian::read_u16(&p[11..13]),
        })
    }
}

/// Events the security core reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityHciEvent {
    EncryptionChange(EncryptionChange),
    DisconnectionComplete(DisconnectionComplete),
    LongTermKeyRequest(LeLongTermKeyRequest),
}

impl SecurityHciEvent {
    /// Decode an event, returning `Ok(None)` for events the security core ignores
    pub fn decode(event: &HciEvent) -> Result<Option<Self>, HciError> {
        match event.event_code {
            EVT_ENCRYPTION_CHANGE | EVT_ENCRYPTION_KEY_REFRESH => {
                EncryptionChange::parse(event).map(|e| Some(Self::EncryptionChange(e)))
            }
            EVT_DISCONN_COMPLETE => {
                DisconnectionComplete::parse(event).map(|e| Some(Self::DisconnectionComplete(e)))
            }
            EVT_LE_META_EVENT if event.le_subevent() == Some(EVT_LE_LTK_REQUEST) => {
                LeLongTermKeyRequest::parse(event).map(|e| Some(Self::LongTermKeyRequest(e)))
            }
            _ => Ok(None),
        }
    }
}
