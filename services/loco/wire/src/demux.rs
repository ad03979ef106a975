//! Incremental stream demultiplexing.
//!
//! Bytes arrive from the socket in chunks of any size. [`PacketDecoder`]
//! turns a plaintext stream into packets; [`BlockDecoder`] extracts encrypted
//! blocks; [`SecureDecoder`] stacks the two, feeding decrypted block contents
//! into an inner packet stream. Block and packet boundaries are unrelated: a
//! block may carry several packets and a packet may span several blocks.

use bytes::{Buf, Bytes, BytesMut};
use tracing::trace;

use crate::crypto::{decrypt_block, peek_block_size, SessionKey, BLOCK_PREFIX_SIZE};
use crate::packet::Packet;
use crate::WireError;

/// Plaintext packet decoder
#[derive(Debug, Default)]
pub struct PacketDecoder {
    buffer: BytesMut,
}

impl PacketDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Decode the next complete packet, if one is buffered
    pub fn decode(&mut self) -> Result<Option<Packet>, WireError> {
        match Packet::decode(&self.buffer)? {
            Some((packet, used)) => {
                self.buffer.advance(used);
                Ok(Some(packet))
            }
            None => Ok(None),
        }
    }

    /// Append bytes and drain every packet now complete
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Packet>, WireError> {
        self.extend(bytes);
        let mut packets = Vec::new();
        while let Some(packet) = self.decode()? {
            packets.push(packet);
        }
        Ok(packets)
    }

    /// Number of bytes waiting for a complete packet
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Encrypted block extractor
#[derive(Debug, Default)]
pub struct BlockDecoder {
    buffer: BytesMut,
}

impl BlockDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Split off the next complete block (prefix included).
    ///
    /// An oversized length prefix fails here before the body is awaited.
    pub fn decode(&mut self) -> Result<Option<Bytes>, WireError> {
        let block_size = match peek_block_size(&self.buffer)? {
            Some(size) => size as usize,
            None => return Ok(None),
        };

        let total = BLOCK_PREFIX_SIZE + block_size;
        if self.buffer.len() < total {
            return Ok(None);
        }
        Ok(Some(self.buffer.split_to(total).freeze()))
    }

    /// Number of bytes waiting for a complete block
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Two-level decoder for encrypted sessions
#[derive(Debug)]
pub struct SecureDecoder {
    key: SessionKey,
    blocks: BlockDecoder,
    packets: PacketDecoder,
    blocks_opened: u64,
}

impl SecureDecoder {
    /// Create a decoder for blocks sealed with `key`
    pub fn new(key: SessionKey) -> Self {
        Self {
            key,
            blocks: BlockDecoder::new(),
            packets: PacketDecoder::new(),
            blocks_opened: 0,
        }
    }

    /// Append raw socket bytes and return every packet now complete
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Packet>, WireError> {
        self.blocks.extend(bytes);

        while let Some(block) = self.blocks.decode()? {
            let plaintext = decrypt_block(&self.key, &block)?;
            self.blocks_opened += 1;
            trace!(
                "Opened block of {} bytes ({} plaintext)",
                block.len(),
                plaintext.len()
            );
            self.packets.extend(&plaintext);
        }

        let mut packets = Vec::new();
        while let Some(packet) = self.packets.decode()? {
            packets.push(packet);
        }
        Ok(packets)
    }

    /// Number of blocks successfully decrypted so far
    pub fn blocks_opened(&self) -> u64 {
        self.blocks_opened
    }
}
