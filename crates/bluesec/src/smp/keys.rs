//! Key material held per peer
//!
//! This module handles the LE key types a record can hold: the peer's and
//! our own Long Term Keys, the peer's Identity Resolving Key, and both
//! Connection Signature Resolving Keys. Each key has a fixed little-endian
//! layout used when records are persisted and reloaded.

use super::types::*;
use crate::error::{SecResult, SecurityError};
use crate::gap::{AddressType, BdAddr};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};

/// Long Term Key distributed by the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerEncKey {
    /// Key value
    pub ltk: [u8; 16],
    /// RAND (Random number)
    pub rand: [u8; 8],
    /// EDIV (Encrypted Diversifier)
    pub ediv: u16,
    pub sec_level: SecurityLevel,
    pub key_size: u8,
}

/// Identity Resolving Key distributed by the peer, with its identity address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerIdKey {
    pub irk: [u8; 16],
    pub addr_type: AddressType,
    pub static_addr: BdAddr,
}

/// Peer signing key and the lowest counter we still accept from it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCsrk {
    pub csrk: [u8; 16],
    pub sec_level: SecurityLevel,
    pub counter: u32,
}

/// Long Term Key we distributed to the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalEncKey {
    pub ltk: [u8; 16],
    /// Diversifier used to derive the key
    pub div: u16,
    pub sec_level: SecurityLevel,
    pub key_size: u8,
}

/// Our signing key for this peer and the next counter to send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalCsrk {
    pub csrk: [u8; 16],
    pub div: u16,
    pub sec_level: SecurityLevel,
    pub counter: u32,
}

/// One key of any type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeKey {
    PeerEnc(PeerEncKey),
    PeerId(PeerIdKey),
    PeerCsrk(PeerCsrk),
    LocalEnc(LocalEncKey),
    /// Marks that our identity was distributed; carries no material
    LocalId,
    LocalCsrk(LocalCsrk),
}

fn short_buffer(_: std::io::Error) -> SecurityError {
    SecurityError::InvalidParameter("key value too short".to_string())
}

fn read_key(cursor: &mut Cursor<&[u8]>) -> SecResult<[u8; 16]> {
    let mut key = [0u8; 16];
    cursor.read_exact(&mut key).map_err(short_buffer)?;
    Ok(key)
}

impl LeKey {
    pub fn key_type(&self) -> KeyType {
        match self {
            LeKey::PeerEnc(_) => KeyType::PENC,
            LeKey::PeerId(_) => KeyType::PID,
            LeKey::PeerCsrk(_) => KeyType::PCSRK,
            LeKey::LocalEnc(_) => KeyType::LENC,
            LeKey::LocalId => KeyType::LID,
            LeKey::LocalCsrk(_) => KeyType::LCSRK,
        }
    }

    /// Serialize to the persisted layout
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(28);
        match self {
            LeKey::PeerEnc(k) => {
                out.extend_from_slice(&k.ltk);
                out.extend_from_slice(&k.rand);
                out.extend_from_slice(&k.ediv.to_le_bytes());
                out.push(k.sec_level.to_persisted());
                out.push(k.key_size);
            }
            LeKey::PeerId(k) => {
                out.extend_from_slice(&k.irk);
                out.push(k.addr_type.into());
                out.extend_from_slice(k.static_addr.as_slice());
            }
            LeKey::PeerCsrk(k) => {
                out.extend_from_slice(&k.csrk);
                out.push(k.sec_level.to_persisted());
                out.extend_from_slice(&k.counter.to_le_bytes());
            }
            LeKey::LocalEnc(k) => {
                out.extend_from_slice(&k.ltk);
                out.extend_from_slice(&k.div.to_le_bytes());
                out.push(k.sec_level.to_persisted());
                out.push(k.key_size);
            }
            LeKey::LocalId => {}
            LeKey::LocalCsrk(k) => {
                out.extend_from_slice(&k.csrk);
                out.extend_from_slice(&k.div.to_le_bytes());
                out.push(k.sec_level.to_persisted());
                out.extend_from_slice(&k.counter.to_le_bytes());
            }
        }
        out
    }

    /// Parse a persisted key of the given type
    pub fn decode(key_type: u8, value: &[u8]) -> SecResult<Self> {
        let kind = KeyType::from_bits(key_type)
            .filter(|k| k.bits().count_ones() == 1)
            .ok_or(SecurityError::WrongType(key_type))?;
        let mut cursor = Cursor::new(value);

        let key = if kind == KeyType::PENC {
            let ltk = read_key(&mut cursor)?;
            let mut rand = [0u8; 8];
            cursor.read_exact(&mut rand).map_err(short_buffer)?;
            LeKey::PeerEnc(PeerEncKey {
                ltk,
                rand,
                ediv: cursor.read_u16::<LittleEndian>().map_err(short_buffer)?,
                sec_level: SecurityLevel::from_persisted(cursor.read_u8().map_err(short_buffer)?),
                key_size: cursor.read_u8().map_err(short_buffer)?,
            })
        } else if kind == KeyType::PID {
            let irk = read_key(&mut cursor)?;
            let addr_type = AddressType::from(cursor.read_u8().map_err(short_buffer)?);
            let mut addr = [0u8; 6];
            cursor.read_exact(&mut addr).map_err(short_buffer)?;
            LeKey::PeerId(PeerIdKey {
                irk,
                addr_type,
                static_addr: BdAddr::new(addr),
            })
        } else if kind == KeyType::PCSRK {
            LeKey::PeerCsrk(PeerCsrk {
                csrk: read_key(&mut cursor)?,
                sec_level: SecurityLevel::from_persisted(cursor.read_u8().map_err(short_buffer)?),
                counter: cursor.read_u32::<LittleEndian>().map_err(short_buffer)?,
            })
        } else if kind == KeyType::LENC {
            LeKey::LocalEnc(LocalEncKey {
                ltk: read_key(&mut cursor)?,
                div: cursor.read_u16::<LittleEndian>().map_err(short_buffer)?,
                sec_level: SecurityLevel::from_persisted(cursor.read_u8().map_err(short_buffer)?),
                key_size: cursor.read_u8().map_err(short_buffer)?,
            })
        } else if kind == KeyType::LID {
            LeKey::LocalId
        } else if kind == KeyType::LCSRK {
            LeKey::LocalCsrk(LocalCsrk {
                csrk: read_key(&mut cursor)?,
                div: cursor.read_u16::<LittleEndian>().map_err(short_buffer)?,
                sec_level: SecurityLevel::from_persisted(cursor.read_u8().map_err(short_buffer)?),
                counter: cursor.read_u32::<LittleEndian>().map_err(short_buffer)?,
            })
        } else {
            return Err(SecurityError::WrongType(key_type));
        };
        Ok(key)
    }
}

/// The LE key set of one record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeKeys {
    pub peer_enc: Option<PeerEncKey>,
    pub peer_id: Option<PeerIdKey>,
    pub peer_csrk: Option<PeerCsrk>,
    pub local_enc: Option<LocalEncKey>,
    pub local_id: bool,
    pub local_csrk: Option<LocalCsrk>,
}

impl LeKeys {
    /// Key-type mask derived from the keys present
    pub fn key_types(&self) -> KeyType {
        let mut types = KeyType::empty();
        types.set(KeyType::PENC, self.peer_enc.is_some());
        types.set(KeyType::PID, self.peer_id.is_some());
        types.set(KeyType::PCSRK, self.peer_csrk.is_some());
        types.set(KeyType::LENC, self.local_enc.is_some());
        types.set(KeyType::LID, self.local_id);
        types.set(KeyType::LCSRK, self.local_csrk.is_some());
        types
    }

    /// Store a key, replacing any key of the same type
    pub fn insert(&mut self, key: LeKey) {
        match key {
            LeKey::PeerEnc(k) => self.peer_enc = Some(k),
            LeKey::PeerId(k) => self.peer_id = Some(k),
            LeKey::PeerCsrk(k) => self.peer_csrk = Some(k),
            LeKey::LocalEnc(k) => self.local_enc = Some(k),
            LeKey::LocalId => self.local_id = true,
            LeKey::LocalCsrk(k) => self.local_csrk = Some(k),
        }
    }

    /// Fill in every key type missing here from `other`
    pub fn merge_missing(&mut self, other: &LeKeys) {
        self.peer_enc = self.peer_enc.or(other.peer_enc);
        self.peer_id = self.peer_id.or(other.peer_id);
        self.peer_csrk = self.peer_csrk.or(other.peer_csrk);
        self.local_enc = self.local_enc.or(other.local_enc);
        self.local_id |= other.local_id;
        self.local_csrk = self.local_csrk.or(other.local_csrk);
    }

    /// All keys, in persisted form
    pub fn to_list(&self) -> Vec<LeKey> {
        let mut keys = Vec::new();
        keys.extend(self.peer_enc.map(LeKey::PeerEnc));
        keys.extend(self.peer_id.map(LeKey::PeerId));
        keys.extend(self.peer_csrk.map(LeKey::PeerCsrk));
        keys.extend(self.local_enc.map(LeKey::LocalEnc));
        if self.local_id {
            keys.push(LeKey::LocalId);
        }
        keys.extend(self.local_csrk.map(LeKey::LocalCsrk));
        keys
    }

    pub fn is_empty(&self) -> bool {
        self.key_types().is_empty()
    }
}
