//! Security policies and the primitives behind them.
//!
//! Channel establishment (OPN) is protected with Ed25519 signatures and an X25519 sealed box
//! toward the receiver's certificate key. Once nonces are exchanged, MSG/CLO chunks use keys
//! derived with P_SHA256: HMAC-SHA256 signatures and AES-256-CBC encryption.
use rand::rngs::OsRng;
use rand_core::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::UaError;
use crate::status::StatusCode;

pub mod asymmetric;
pub mod certificate;
pub mod keys;
pub mod symmetric;

pub use certificate::{ApplicationCredentials, Certificate};
pub use keys::{derive_channel_keys, DerivedKeys, SymmetricKeys};

pub const POLICY_URI_NONE: &str = "http://opcfoundation.org/UA/SecurityPolicy#None";
pub const POLICY_URI_AES256_SHA256_ED25519: &str =
    "urn:uasc:SecurityPolicy#Aes256_Sha256_Ed25519";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageSecurityMode {
    None,
    Sign,
    SignAndEncrypt,
}

impl MessageSecurityMode {
    pub fn signs(&self) -> bool {
        !matches!(self, MessageSecurityMode::None)
    }

    pub fn encrypts(&self) -> bool {
        matches!(self, MessageSecurityMode::SignAndEncrypt)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityPolicy {
    None,
    Aes256Sha256Ed25519,
}

impl SecurityPolicy {
    pub fn uri(&self) -> &'static str {
        match self {
            SecurityPolicy::None => POLICY_URI_NONE,
            SecurityPolicy::Aes256Sha256Ed25519 => POLICY_URI_AES256_SHA256_ED25519,
        }
    }

    pub fn from_uri(uri: &str) -> Result<Self, UaError> {
        match uri {
            POLICY_URI_NONE => Ok(SecurityPolicy::None),
            POLICY_URI_AES256_SHA256_ED25519 => Ok(SecurityPolicy::Aes256Sha256Ed25519),
            other => Err(UaError::security(
                StatusCode::BAD_SECURITY_POLICY_REJECTED,
                format!("unsupported security policy {}", other),
            )),
        }
    }

    /// Nonce length exchanged during OPN; equals the symmetric key length.
    pub fn nonce_length(&self) -> usize {
        self.encrypting_key_length()
    }

    pub fn signing_key_length(&self) -> usize {
        match self {
            SecurityPolicy::None => 0,
            SecurityPolicy::Aes256Sha256Ed25519 => 32,
        }
    }

    pub fn encrypting_key_length(&self) -> usize {
        match self {
            SecurityPolicy::None => 0,
            SecurityPolicy::Aes256Sha256Ed25519 => 32,
        }
    }

    /// Cipher block size; plaintext handed to the cipher is a whole number of blocks.
    pub fn block_size(&self) -> usize {
        match self {
            SecurityPolicy::None => 1,
            SecurityPolicy::Aes256Sha256Ed25519 => 16,
        }
    }

    pub fn symmetric_signature_size(&self) -> usize {
        match self {
            SecurityPolicy::None => 0,
            SecurityPolicy::Aes256Sha256Ed25519 => symmetric::SIGNATURE_SIZE,
        }
    }

    pub fn asymmetric_signature_size(&self) -> usize {
        match self {
            SecurityPolicy::None => 0,
            SecurityPolicy::Aes256Sha256Ed25519 => asymmetric::SIGNATURE_SIZE,
        }
    }

    /// Bytes added when an asymmetric region is sealed.
    pub fn asymmetric_encryption_overhead(&self) -> usize {
        match self {
            SecurityPolicy::None => 0,
            SecurityPolicy::Aes256Sha256Ed25519 => asymmetric::SEAL_OVERHEAD,
        }
    }
}

pub fn random_nonce(len: usize) -> Vec<u8> {
    let mut nonce = vec![0u8; len];
    OsRng.fill_bytes(&mut nonce);
    nonce
}
