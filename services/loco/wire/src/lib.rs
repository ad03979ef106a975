//! LOCO wire protocol: packet framing, V2SL encryption and stream demultiplexing.
//!
//! This crate provides the byte-level layer of the LOCO client: the fixed
//! 22-byte packet header, the RSA/AES-GCM handshake and block cipher that
//! secure a session, and decoders that reassemble packets from arbitrarily
//! fragmented socket reads.
//!
//! ## Wire Format
//!
//! ```text
//! handshake (once, client -> server)
//! +-------------+-----------+-----------+---------------------------+
//! | i32 enc_len | i32 16    | i32 3     | RSA-OAEP(SHA-1)(aes key)  |
//! +-------------+-----------+-----------+---------------------------+
//!
//! every following block (both directions)
//! +----------------+------------+---------------------------+----------+
//! | u32 block_size | iv (12B)   | AES-128-GCM(packet bytes) | tag(16B) |
//! +----------------+------------+---------------------------+----------+
//!
//! packet bytes (possibly spanning several blocks)
//! +--------+--------+-------------------+------+----------+------------+
//! | i32 id | i16 st | method (11 bytes) | 0x00 | i32 blen | BSON body  |
//! +--------+--------+-------------------+------+----------+------------+
//! ```
//!
//! All integers are little-endian.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod crypto;
pub mod demux;
pub mod document;
pub mod error;
pub mod packet;

// Re-export main types
pub use crypto::{
    build_handshake, decrypt_block, encrypt_block, peek_block_size, HandshakeHeader,
    HandshakeKey, SessionKey, CIPHER_SUITE, HANDSHAKE_HEADER_SIZE, KEY_ENCRYPT_TYPE,
    MAX_BLOCK_SIZE,
};
pub use demux::{BlockDecoder, PacketDecoder, SecureDecoder};
pub use document::{
    decode_doc, encode_doc, get_int, get_int_array, get_nonempty_str, get_status, get_str,
    get_str_array, DocumentError,
};
pub use error::{CryptoError, WireError};
pub use packet::{
    Packet, PacketHeader, MAX_BODY_SIZE, METHOD_FIELD_SIZE, PACKET_HEADER_SIZE,
};

pub use bson;
