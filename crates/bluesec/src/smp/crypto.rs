//! Cryptographic functions for the security core
//!
//! Software AES-128 and AES-CMAC, plus the `ah` random address hash.
//! The Bluetooth functions are specified MSB-first while the stack keeps
//! every value little-endian, so the LE entry points reverse on the way in
//! and out.

use super::ports::CryptoPort;
use crate::error::{SecResult, SecurityError};
use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};

/// AES-128 on big-endian key and block
pub fn aes_128(key: &[u8; 16], block: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut out = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut out);
    let mut result = [0u8; 16];
    result.copy_from_slice(&out);
    result
}

/// AES-CMAC (RFC 4493) on big-endian key and message
pub fn aes_cmac(key: &[u8; 16], message: &[u8]) -> SecResult<[u8; 16]> {
    let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(key)
        .map_err(|e| SecurityError::CryptoFailure(e.to_string()))?;
    mac.update(message);
    let tag = mac.finalize().into_bytes();
    let mut result = [0u8; 16];
    result.copy_from_slice(&tag);
    Ok(result)
}

fn reversed16(bytes: &[u8; 16]) -> [u8; 16] {
    let mut out = *bytes;
    out.reverse();
    out
}

/// Software crypto engine
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftCrypto;

impl CryptoPort for SoftCrypto {
    fn encrypt(&self, key: &[u8; 16], plaintext: &[u8]) -> SecResult<[u8; 16]> {
        if plaintext.len() > 16 {
            return Err(SecurityError::CryptoFailure(format!(
                "plaintext of {} bytes exceeds one block",
                plaintext.len()
            )));
        }
        let mut block = [0u8; 16];
        block[..plaintext.len()].copy_from_slice(plaintext);
        block.reverse();

        let mut out = aes_128(&reversed16(key), &block);
        out.reverse();
        Ok(out)
    }

    fn cmac(&self, key: &[u8; 16], message: &[u8]) -> SecResult<[u8; 16]> {
        let msg: Vec<u8> = message.iter().rev().copied().collect();
        let mut out = aes_cmac(&reversed16(key), &msg)?;
        out.reverse();
        Ok(out)
    }
}

/// Random address hash: the low 24 bits of e(irk, prand)
pub fn ah(crypto: &dyn CryptoPort, irk: &[u8; 16], prand: &[u8; 3]) -> SecResult<[u8; 3]> {
    let out = crypto.encrypt(irk, prand)?;
    Ok([out[0], out[1], out[2]])
}
