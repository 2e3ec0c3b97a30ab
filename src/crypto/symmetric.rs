use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes256;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::DerivedKeys;
use crate::error::UaError;
use crate::status::StatusCode;

type HmacSha256 = Hmac<Sha256>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

pub const SIGNATURE_SIZE: usize = 32;

fn security_error(message: impl Into<String>) -> UaError {
    UaError::security(StatusCode::BAD_SECURITY_CHECKS_FAILED, message)
}

fn mac_for(keys: &DerivedKeys) -> Result<HmacSha256, UaError> {
    HmacSha256::new_from_slice(&keys.signing_key)
        .map_err(|e| security_error(format!("hmac key: {}", e)))
}

pub fn sign(keys: &DerivedKeys, data: &[u8]) -> Result<Vec<u8>, UaError> {
    let mut mac = mac_for(keys)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

pub fn verify(keys: &DerivedKeys, data: &[u8], signature: &[u8]) -> Result<(), UaError> {
    let mut mac = mac_for(keys)?;
    mac.update(data);
    mac.verify_slice(signature)
        .map_err(|_| security_error("symmetric signature mismatch"))
}

/// Encrypts `buf` in place. The length must already be a multiple of the block size.
pub fn encrypt(keys: &DerivedKeys, buf: &mut [u8]) -> Result<(), UaError> {
    let len = buf.len();
    Aes256CbcEnc::new_from_slices(&keys.encrypting_key, &keys.iv)
        .map_err(|e| security_error(format!("cipher init: {}", e)))?
        .encrypt_padded_mut::<NoPadding>(buf, len)
        .map_err(|_| security_error("plaintext is not block aligned"))?;
    Ok(())
}

pub fn decrypt(keys: &DerivedKeys, buf: &mut [u8]) -> Result<(), UaError> {
    Aes256CbcDec::new_from_slices(&keys.encrypting_key, &keys.iv)
        .map_err(|e| security_error(format!("cipher init: {}", e)))?
        .decrypt_padded_mut::<NoPadding>(buf)
        .map_err(|_| security_error("ciphertext is not block aligned"))?;
    Ok(())
}
