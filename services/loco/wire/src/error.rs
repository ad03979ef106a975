//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Method name longer than the 11-byte header field
    #[error("method too long: {0:?}")]
    MethodTooLong(String),

    /// Method name contains non-ASCII or NUL bytes
    #[error("method not ascii: {0:?}")]
    MethodNotAscii(String),

    /// Body length field is negative or above [`MAX_BODY_SIZE`](crate::MAX_BODY_SIZE)
    #[error("invalid body length {0}")]
    BodyLength(i32),

    /// Reserved header byte is not zero
    #[error("reserved header byte {0:#04x}")]
    ReservedByte(u8),

    /// Body exceeds the size representable in the header
    #[error("body too large: {0}")]
    BodyTooLarge(usize),

    /// Encrypted block length exceeds the accepted maximum
    #[error("block size {0} exceeds limit")]
    BlockTooLarge(u32),

    /// Encrypted block too short to hold an IV and a tag
    #[error("malformed block of {0} bytes")]
    MalformedBlock(u32),

    /// Cryptographic failure
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Handshake and block cipher errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// RSA-OAEP encryption of the session key failed
    #[error("key encapsulation failed: {0}")]
    Encapsulation(String),

    /// The embedded public key could not be parsed
    #[error("invalid public key: {0}")]
    PublicKey(String),

    /// AES-GCM encryption failed
    #[error("seal failed")]
    Seal,

    /// Authentication tag mismatch or otherwise undecryptable block
    #[error("authentication failed")]
    Open,
}
