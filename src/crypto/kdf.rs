//! Password-to-key derivation.
//!
//! A master key is derived from the password with a single SHA-256 pass
//! (enough entropy stretching for a shared-secret tunnel password, not a
//! general-purpose password hash), then HKDF-expanded into a fresh key for
//! each connection using a random salt, so that two sessions sharing a
//! password never reuse a keystream.

use hkdf::Hkdf;
use sha2::{Digest, Sha256};

const HKDF_INFO: &[u8] = b"ss-local-rs-subkey";

/// Derives a `key_len`-byte connection key from `password` and a per-connection
/// `salt`. The salt is not secret; it travels with the connection (as the
/// cipher context's nonce material) so the peer can reproduce the same key.
pub fn derive_key(password: &[u8], salt: &[u8], key_len: usize) -> Vec<u8> {
    let master = Sha256::digest(password);
    let hk = Hkdf::<Sha256>::new(Some(salt), &master);
    let mut out = vec![0u8; key_len];
    hk.expand(HKDF_INFO, &mut out)
        .expect("key_len is within HKDF's output limit for SHA-256");
    out
}
