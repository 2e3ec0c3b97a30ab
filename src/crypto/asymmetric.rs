use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signature, Signer, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey};

use super::{ApplicationCredentials, Certificate};
use crate::error::UaError;
use crate::status::StatusCode;

pub const SIGNATURE_SIZE: usize = 64;
/// Ephemeral public key plus the AEAD tag.
pub const SEAL_OVERHEAD: usize = 32 + 16;

const SEAL_INFO: &[u8] = b"uasc-open-channel-seal";

fn security_error(message: impl Into<String>) -> UaError {
    UaError::security(StatusCode::BAD_SECURITY_CHECKS_FAILED, message)
}

pub fn sign(credentials: &ApplicationCredentials, data: &[u8]) -> Vec<u8> {
    credentials.signing_key().sign(data).to_bytes().to_vec()
}

pub fn verify(certificate: &Certificate, data: &[u8], signature: &[u8]) -> Result<(), UaError> {
    let key = VerifyingKey::from_bytes(&certificate.signing_key)
        .map_err(|e| UaError::security(StatusCode::BAD_CERTIFICATE_INVALID, e.to_string()))?;
    let signature = Signature::from_slice(signature)
        .map_err(|_| security_error("malformed asymmetric signature"))?;
    key.verify(data, &signature)
        .map_err(|_| security_error("asymmetric signature mismatch"))
}

fn seal_cipher(shared: &[u8], ephemeral: &[u8; 32], recipient: &[u8; 32]) -> Result<(ChaCha20Poly1305, [u8; 12]), UaError> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral);
    salt[32..].copy_from_slice(recipient);
    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut okm = [0u8; 44];
    hk.expand(SEAL_INFO, &mut okm)
        .map_err(|_| security_error("seal key expansion failed"))?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&okm[..32]));
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&okm[32..]);
    Ok((cipher, nonce))
}

/// Seals `plaintext` so only the holder of `recipient`'s private key can read it.
/// Output layout: `ephemeral_public[32] || ciphertext || tag[16]`.
pub fn seal(recipient: &Certificate, plaintext: &[u8]) -> Result<Vec<u8>, UaError> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral).to_bytes();
    let shared = ephemeral.diffie_hellman(&PublicKey::from(recipient.encryption_key));
    let (cipher, nonce) = seal_cipher(
        shared.as_bytes(),
        &ephemeral_public,
        &recipient.encryption_key,
    )?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| security_error("seal failed"))?;
    let mut out = Vec::with_capacity(32 + ciphertext.len());
    out.extend_from_slice(&ephemeral_public);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn open(credentials: &ApplicationCredentials, sealed: &[u8]) -> Result<Vec<u8>, UaError> {
    if sealed.len() < SEAL_OVERHEAD {
        return Err(security_error("sealed region shorter than its overhead"));
    }
    let mut ephemeral_public = [0u8; 32];
    ephemeral_public.copy_from_slice(&sealed[..32]);
    let shared = credentials
        .encryption_secret()
        .diffie_hellman(&PublicKey::from(ephemeral_public));
    let (cipher, nonce) = seal_cipher(
        shared.as_bytes(),
        &ephemeral_public,
        &credentials.certificate().encryption_key,
    )?;
    cipher
        .decrypt(Nonce::from_slice(&nonce), &sealed[32..])
        .map_err(|_| security_error("asymmetric decryption failed"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_between_applications() {
        let server = ApplicationCredentials::generate("urn:server");
        let sealed = seal(server.certificate(), b"open channel body").unwrap();
        assert_eq!(sealed.len(), b"open channel body".len() + SEAL_OVERHEAD);
        assert_eq!(open(&server, &sealed).unwrap(), b"open channel body");

        let intruder = ApplicationCredentials::generate("urn:intruder");
        assert!(open(&intruder, &sealed).is_err());
    }

    #[test]
    fn signature_bound_to_certificate() {
        let client = ApplicationCredentials::generate("urn:client");
        let other = ApplicationCredentials::generate("urn:other");
        let sig = sign(&client, b"data");
        assert_eq!(sig.len(), SIGNATURE_SIZE);
        assert!(verify(client.certificate(), b"data", &sig).is_ok());
        assert!(verify(other.certificate(), b"data", &sig).is_err());
    }
}
