//! V2SL handshake and per-block AES-128-GCM encryption.
//!
//! The client picks a random 16-byte AES key, wraps it with RSA-OAEP(SHA-1)
//! under the protocol's public key and sends it once, unacknowledged. All
//! further traffic in both directions travels as encrypted blocks:
//!
//! ```text
//! +------------------+-----------+----------------+-------------+
//! | u32 block_size   | iv (12B)  | ciphertext     | tag (16B)   |
//! +------------------+-----------+----------------+-------------+
//! ```
//!
//! `block_size` counts everything after itself.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Key, Nonce};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use once_cell::sync::Lazy;
use rand::RngCore;
use rsa::{BigUint, Oaep, RsaPublicKey};

use crate::{CryptoError, WireError};

/// AES key size in bytes
pub const KEY_SIZE: usize = 16;

/// GCM nonce size in bytes
pub const IV_SIZE: usize = 12;

/// GCM tag size in bytes
pub const TAG_SIZE: usize = 16;

/// Size of the block length prefix
pub const BLOCK_PREFIX_SIZE: usize = 4;

/// Largest `block_size` a peer may announce
pub const MAX_BLOCK_SIZE: u32 = 131_068;

/// Handshake header size
pub const HANDSHAKE_HEADER_SIZE: usize = 12;

/// Key encapsulation type announced in the handshake (RSA-OAEP, SHA-1)
pub const KEY_ENCRYPT_TYPE: i32 = 16;

/// Block cipher announced in the handshake (AES-128-GCM)
pub const CIPHER_SUITE: i32 = 3;

/// Public modulus embedded in every official client
pub const LOCO_PUBLIC_MODULUS: &str = "A44960441C7E83BB27898156ECB13C8AFAF05D284A4D1155F255CD22D3176CDE\
50482F2F27F71348E4D2EB5F57BF9671EF15C9224E042B1B567AC1066E066911\
43F6C50F88787F68CF42716B210CBEF0F59D53405A0A56138A6872212802BB0A\
EEA6376305DBD428831E8F61A232EFEDD8DBA377305EF972321E1352B5F64630\
993E5549C64FCB563CDC97DA2124B925DDEA12ADFD00138910F66937FAB68486\
AE43BFE203C4A617F9F232B5458A9AB409BAC8EDADEF685545F9B01398674773\
7B3FD76A9BAC121516226981EA67225577D15D0F082B8207EAF7CDCB13123937\
CB12145837648C2F3A65018162315E77EAD2D2DD5986E46251764A43B9BA8F79";

/// Public exponent paired with [`LOCO_PUBLIC_MODULUS`]
pub const LOCO_PUBLIC_EXPONENT: u32 = 3;

static LOCO_HANDSHAKE_KEY: Lazy<Result<HandshakeKey, CryptoError>> =
    Lazy::new(|| HandshakeKey::from_hex(LOCO_PUBLIC_MODULUS, LOCO_PUBLIC_EXPONENT));

/// RSA public key used to wrap session keys
#[derive(Debug, Clone)]
pub struct HandshakeKey {
    key: RsaPublicKey,
}

impl HandshakeKey {
    /// The protocol's fixed public key
    pub fn loco() -> Result<Self, CryptoError> {
        LOCO_HANDSHAKE_KEY.clone()
    }

    /// Build a key from a hex modulus and exponent
    pub fn from_hex(modulus_hex: &str, exponent: u32) -> Result<Self, CryptoError> {
        let n = BigUint::parse_bytes(modulus_hex.as_bytes(), 16)
            .ok_or_else(|| CryptoError::PublicKey("modulus is not hex".into()))?;
        let e = BigUint::from(exponent);
        let key = RsaPublicKey::new(n, e).map_err(|e| CryptoError::PublicKey(e.to_string()))?;
        Ok(Self { key })
    }

    /// Wrap an existing RSA public key
    pub fn from_public_key(key: RsaPublicKey) -> Self {
        Self { key }
    }
}

/// Per-session AES-128 key
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey {
    key: [u8; KEY_SIZE],
}

impl SessionKey {
    /// Generate a fresh random key
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        Self { key }
    }

    /// Create a key from raw bytes
    pub fn from_bytes(key: [u8; KEY_SIZE]) -> Self {
        Self { key }
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    fn cipher(&self) -> Aes128Gcm {
        Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&self.key))
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Build the handshake message announcing `key` to the server
pub fn build_handshake(key: &SessionKey, public_key: &HandshakeKey) -> Result<Bytes, CryptoError> {
    let encrypted = public_key
        .key
        .encrypt(
            &mut rand::thread_rng(),
            Oaep::new::<sha1::Sha1>(),
            key.as_bytes(),
        )
        .map_err(|e| CryptoError::Encapsulation(e.to_string()))?;

    let mut buf = BytesMut::with_capacity(HANDSHAKE_HEADER_SIZE + encrypted.len());
    buf.put_i32_le(encrypted.len() as i32);
    buf.put_i32_le(KEY_ENCRYPT_TYPE);
    buf.put_i32_le(CIPHER_SUITE);
    buf.put_slice(&encrypted);
    Ok(buf.freeze())
}

/// Parsed handshake header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeHeader {
    /// Length of the wrapped key that follows
    pub encrypted_key_len: i32,
    /// Key encapsulation type
    pub key_encrypt_type: i32,
    /// Block cipher suite
    pub cipher_suite: i32,
}

impl HandshakeHeader {
    /// Parse the 12-byte header, if present
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < HANDSHAKE_HEADER_SIZE {
            return None;
        }
        let mut cur = &buf[..HANDSHAKE_HEADER_SIZE];
        Some(Self {
            encrypted_key_len: cur.get_i32_le(),
            key_encrypt_type: cur.get_i32_le(),
            cipher_suite: cur.get_i32_le(),
        })
    }
}

/// Encrypt `plaintext` into one length-prefixed block
pub fn encrypt_block(key: &SessionKey, plaintext: &[u8]) -> Result<Bytes, CryptoError> {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);

    let sealed = key
        .cipher()
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| CryptoError::Seal)?;

    let block_size = IV_SIZE + sealed.len();
    let mut buf = BytesMut::with_capacity(BLOCK_PREFIX_SIZE + block_size);
    buf.put_u32_le(block_size as u32);
    buf.put_slice(&iv);
    buf.put_slice(&sealed);
    Ok(buf.freeze())
}

/// Read the announced size of the block at the front of `buf`.
///
/// Oversized announcements are rejected from the prefix alone, so a hostile
/// length never causes the remainder to be awaited or allocated.
pub fn peek_block_size(buf: &[u8]) -> Result<Option<u32>, WireError> {
    if buf.len() < BLOCK_PREFIX_SIZE {
        return Ok(None);
    }
    let block_size = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if block_size > MAX_BLOCK_SIZE {
        return Err(WireError::BlockTooLarge(block_size));
    }
    if (block_size as usize) < IV_SIZE + TAG_SIZE {
        return Err(WireError::MalformedBlock(block_size));
    }
    Ok(Some(block_size))
}

/// Decrypt one complete block (prefix included)
pub fn decrypt_block(key: &SessionKey, block: &[u8]) -> Result<Bytes, WireError> {
    let block_size = match peek_block_size(block)? {
        Some(size) => size as usize,
        None => return Err(WireError::MalformedBlock(block.len() as u32)),
    };
    if block.len() != BLOCK_PREFIX_SIZE + block_size {
        return Err(WireError::MalformedBlock(block_size as u32));
    }

    let body = &block[BLOCK_PREFIX_SIZE..];
    let (iv, sealed) = body.split_at(IV_SIZE);
    let plaintext = key
        .cipher()
        .decrypt(Nonce::from_slice(iv), sealed)
        .map_err(|_| CryptoError::Open)?;
    Ok(Bytes::from(plaintext))
}
