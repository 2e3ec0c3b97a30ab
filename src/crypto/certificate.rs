use std::path::Path;

use ed25519_dalek::pkcs8::DecodePrivateKey;
use ed25519_dalek::SigningKey;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::UaError;
use crate::status::StatusCode;

/// Compact application certificate: identity plus the two public keys used during OPN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub application_uri: String,
    /// Ed25519 verifying key.
    pub signing_key: [u8; 32],
    /// X25519 public key used to seal OPN payloads for this application.
    pub encryption_key: [u8; 32],
}

impl Certificate {
    pub fn encode(&self) -> Result<Vec<u8>, UaError> {
        serde_cbor::to_vec(self).map_err(|e| {
            UaError::protocol(StatusCode::BAD_ENCODING_ERROR, format!("certificate: {}", e))
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, UaError> {
        serde_cbor::from_slice(bytes).map_err(|e| {
            UaError::security(
                StatusCode::BAD_CERTIFICATE_INVALID,
                format!("certificate decode: {}", e),
            )
        })
    }

    /// SHA-256 over the encoded certificate.
    pub fn thumbprint(&self) -> Result<Vec<u8>, UaError> {
        Ok(Sha256::digest(self.encode()?).to_vec())
    }
}

/// Private keys and certificate of the local application.
#[derive(Clone)]
pub struct ApplicationCredentials {
    signing: SigningKey,
    encryption: StaticSecret,
    certificate: Certificate,
}

impl std::fmt::Debug for ApplicationCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplicationCredentials")
            .field("certificate", &self.certificate)
            .finish()
    }
}

impl ApplicationCredentials {
    /// Fresh random credentials.
    pub fn generate(application_uri: &str) -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self::from_signing_key(SigningKey::from_bytes(&seed), application_uri)
    }

    /// Builds credentials around an Ed25519 key; the X25519 key is derived from its seed so
    /// one PEM file is enough to reproduce the certificate.
    pub fn from_signing_key(signing: SigningKey, application_uri: &str) -> Self {
        let hk = Hkdf::<Sha256>::new(Some(b"uasc-certificate"), signing.as_bytes());
        let mut x_seed = [0u8; 32];
        if hk.expand(b"x25519", &mut x_seed).is_err() {
            unreachable!("32 bytes is a valid HKDF-SHA256 output length");
        }
        let encryption = StaticSecret::from(x_seed);
        let certificate = Certificate {
            application_uri: application_uri.to_string(),
            signing_key: signing.verifying_key().to_bytes(),
            encryption_key: PublicKey::from(&encryption).to_bytes(),
        };
        Self {
            signing,
            encryption,
            certificate,
        }
    }

    /// Loads a PKCS#8 Ed25519 private key from PEM text.
    pub fn from_pem(pem: &str, application_uri: &str) -> Result<Self, UaError> {
        let mut reader = std::io::BufReader::new(pem.as_bytes());
        for item in rustls_pemfile::read_all(&mut reader) {
            let item = item.map_err(|e| {
                UaError::security(StatusCode::BAD_CERTIFICATE_INVALID, format!("pem: {}", e))
            })?;
            if let rustls_pemfile::Item::Pkcs8Key(key) = item {
                let signing = SigningKey::from_pkcs8_der(key.secret_pkcs8_der()).map_err(|e| {
                    UaError::security(
                        StatusCode::BAD_CERTIFICATE_INVALID,
                        format!("pkcs8: {}", e),
                    )
                })?;
                return Ok(Self::from_signing_key(signing, application_uri));
            }
        }
        Err(UaError::security(
            StatusCode::BAD_CERTIFICATE_INVALID,
            "no PKCS#8 private key in PEM input",
        ))
    }

    pub fn from_pem_file(path: impl AsRef<Path>, application_uri: &str) -> Result<Self, UaError> {
        let pem = std::fs::read_to_string(path)?;
        Self::from_pem(&pem, application_uri)
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing
    }

    pub(crate) fn encryption_secret(&self) -> &StaticSecret {
        &self.encryption
    }
}
