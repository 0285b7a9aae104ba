//! The cipher collaborator.
//!
//! Key derivation and stream-cipher encrypt/decrypt live behind a small
//! `StreamCipher` trait operating in place on a caller-owned buffer, with a
//! `CipherKind` naming the supported methods (including the `none` sentinel).
//! A cipher context is built from `(password, method)` once per session
//! direction and dropped when the session ends.

mod kdf;

use std::fmt;

use strum::{Display, EnumString};

use crate::error::CipherError;

pub use kdf::derive_key;

/// Supported stream cipher methods. `None` is the sentinel that disables
/// encryption entirely and runs the session as if it were `direct`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum CipherKind {
    None,
    #[strum(serialize = "chacha20")]
    ChaCha20,
}

impl CipherKind {
    /// Key length in bytes required by this method's KDF output.
    pub fn key_len(self) -> usize {
        match self {
            CipherKind::None => 0,
            CipherKind::ChaCha20 => 32,
        }
    }

    /// Nonce length in bytes prepended to the very first bytes a fresh
    /// context sends, establishing per-connection state from the shared key.
    pub fn nonce_len(self) -> usize {
        match self {
            CipherKind::None => 0,
            CipherKind::ChaCha20 => 12,
        }
    }

    pub fn is_none(self) -> bool {
        matches!(self, CipherKind::None)
    }
}

/// Direction a cipher context was constructed for. Kept for parity with the
/// collaborator's `enc_ctx_init(method, ctx, dir)` signature even though the
/// two directions use independently keyed contexts rather than shared state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

/// Basic operation of a stream cipher context: encrypt/decrypt a caller-owned
/// buffer in place, consuming keystream as a continuous stream across calls.
pub trait StreamCipher: fmt::Debug + Send {
    fn encrypt(&mut self, data: &mut [u8]) -> Result<(), CipherError>;
    fn decrypt(&mut self, data: &mut [u8]) -> Result<(), CipherError>;
}

/// The `none` cipher: encrypt/decrypt are no-ops. Used when `CipherKind::None`
/// is configured, or implicitly for the `direct` path.
#[derive(Debug, Default)]
pub struct NoneCipher;

impl StreamCipher for NoneCipher {
    fn encrypt(&mut self, _data: &mut [u8]) -> Result<(), CipherError> {
        Ok(())
    }

    fn decrypt(&mut self, _data: &mut [u8]) -> Result<(), CipherError> {
        Ok(())
    }
}

/// ChaCha20 keystream cipher, keyed from the session key via HKDF and an
/// explicit per-context nonce (see `kdf::derive_key`).
pub struct ChaCha20Stream {
    cipher: chacha20::ChaCha20,
}

impl fmt::Debug for ChaCha20Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChaCha20Stream").finish_non_exhaustive()
    }
}

impl ChaCha20Stream {
    pub fn new(key: &[u8], nonce: &[u8]) -> Self {
        use chacha20::cipher::KeyIvInit;
        let cipher = chacha20::ChaCha20::new(key.into(), nonce.into());
        ChaCha20Stream { cipher }
    }
}

impl StreamCipher for ChaCha20Stream {
    fn encrypt(&mut self, data: &mut [u8]) -> Result<(), CipherError> {
        use chacha20::cipher::StreamCipher as _;
        self.cipher.apply_keystream(data);
        Ok(())
    }

    fn decrypt(&mut self, data: &mut [u8]) -> Result<(), CipherError> {
        // A keystream cipher is its own inverse.
        self.encrypt(data)
    }
}

/// Constructs the cipher implementation for one direction of one session.
///
/// `nonce` must be unique per (key, direction); callers generate a fresh
/// random nonce per connection and send it ahead of the address header so
/// the peer can reconstruct the same keystream.
pub fn new_cipher(method: CipherKind, key: &[u8], nonce: &[u8]) -> Box<dyn StreamCipher> {
    match method {
        CipherKind::None => Box::new(NoneCipher),
        CipherKind::ChaCha20 => Box::new(ChaCha20Stream::new(key, nonce)),
    }
}
