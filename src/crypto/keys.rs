use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::SecurityPolicy;

type HmacSha256 = Hmac<Sha256>;

/// One direction's key material: HMAC key, AES key and CBC initialisation vector.
#[derive(Clone, PartialEq, Eq)]
pub struct DerivedKeys {
    pub signing_key: Vec<u8>,
    pub encrypting_key: Vec<u8>,
    pub iv: Vec<u8>,
}

impl std::fmt::Debug for DerivedKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKeys")
            .field("signing_key", &format_args!("[{} bytes]", self.signing_key.len()))
            .field("encrypting_key", &format_args!("[{} bytes]", self.encrypting_key.len()))
            .finish()
    }
}

/// Keys for both directions of one security token, seen from the local side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymmetricKeys {
    pub sending: DerivedKeys,
    pub receiving: DerivedKeys,
}

/// P_SHA256 pseudo-random function: `A(i) = HMAC(secret, A(i-1))`,
/// output = `HMAC(secret, A(1) || seed) || HMAC(secret, A(2) || seed) || ...`.
pub fn p_sha256(secret: &[u8], seed: &[u8], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len + 32);
    let mut a = hmac_once(secret, &[seed]);
    while out.len() < len {
        out.extend_from_slice(&hmac_once(secret, &[&a, seed]));
        a = hmac_once(secret, &[&a]);
    }
    out.truncate(len);
    out
}

fn hmac_once(secret: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => unreachable!("hmac key length is unrestricted"),
    };
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().to_vec()
}

fn split(policy: SecurityPolicy, material: &[u8]) -> DerivedKeys {
    let s = policy.signing_key_length();
    let e = policy.encrypting_key_length();
    let b = policy.block_size();
    DerivedKeys {
        signing_key: material[..s].to_vec(),
        encrypting_key: material[s..s + e].to_vec(),
        iv: material[s + e..s + e + b].to_vec(),
    }
}

/// Derives the token keys from the exchanged nonces.
///
/// Each side sends with `P(remote_nonce, local_nonce)` and receives with
/// `P(local_nonce, remote_nonce)`, so the client's sending keys are the server's receiving
/// keys and vice versa.
pub fn derive_channel_keys(
    policy: SecurityPolicy,
    local_nonce: &[u8],
    remote_nonce: &[u8],
) -> SymmetricKeys {
    let len = policy.signing_key_length() + policy.encrypting_key_length() + policy.block_size();
    SymmetricKeys {
        sending: split(policy, &p_sha256(remote_nonce, local_nonce, len)),
        receiving: split(policy, &p_sha256(local_nonce, remote_nonce, len)),
    }
}
