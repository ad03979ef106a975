//! LOCO packet header and packet encoding.
//!
//! Every LOCO packet starts with a 22-byte little-endian header followed by
//! `body_len` bytes of BSON. The body is carried as opaque bytes here.
//!
//! ```text
//! +--------+--------+-------------------+------+----------+
//! | i32 id | i16 st | method (11 bytes) | 0x00 | i32 blen |
//! +--------+--------+-------------------+------+----------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::WireError;

/// Packet header size in bytes
pub const PACKET_HEADER_SIZE: usize = 22;

/// Width of the method field
pub const METHOD_FIELD_SIZE: usize = 11;

/// Largest accepted body, the BSON document size limit
pub const MAX_BODY_SIZE: i32 = 16 * 1024 * 1024;

/// Packet header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    /// Correlation id
    pub packet_id: i32,
    /// Transport status
    pub status: i16,
    /// Method name
    pub method: String,
    /// Reserved byte (body type, always zero)
    pub reserved: u8,
    /// Body length in bytes
    pub body_len: i32,
}

impl PacketHeader {
    /// Parse a header from the front of `buf` without consuming it.
    ///
    /// Returns `None` when fewer than [`PACKET_HEADER_SIZE`] bytes are
    /// available. The method ends at the first NUL inside its field.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < PACKET_HEADER_SIZE {
            return None;
        }

        let mut cur = &buf[..PACKET_HEADER_SIZE];
        let packet_id = cur.get_i32_le();
        let status = cur.get_i16_le();

        let field = &cur[..METHOD_FIELD_SIZE];
        let end = field
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(METHOD_FIELD_SIZE);
        let method = String::from_utf8_lossy(&field[..end]).into_owned();
        cur.advance(METHOD_FIELD_SIZE);

        let reserved = cur.get_u8();
        let body_len = cur.get_i32_le();

        Some(Self {
            packet_id,
            status,
            method,
            reserved,
            body_len,
        })
    }

    /// Validate the fields that cannot be trusted from the wire.
    ///
    /// The body length must lie in `0..=MAX_BODY_SIZE` and the reserved
    /// byte must be zero; anything else means the stream lost framing.
    pub fn validate(&self) -> Result<(), WireError> {
        if !(0..=MAX_BODY_SIZE).contains(&self.body_len) {
            return Err(WireError::BodyLength(self.body_len));
        }
        if self.reserved != 0 {
            return Err(WireError::ReservedByte(self.reserved));
        }
        Ok(())
    }

    /// Encode the header (little-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.packet_id);
        buf.put_i16_le(self.status);

        let mut field = [0u8; METHOD_FIELD_SIZE];
        let raw = self.method.as_bytes();
        let n = raw.len().min(METHOD_FIELD_SIZE);
        field[..n].copy_from_slice(&raw[..n]);
        buf.put_slice(&field);

        buf.put_u8(self.reserved);
        buf.put_i32_le(self.body_len);
    }
}

/// Complete LOCO packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Correlation id
    pub packet_id: i32,
    /// Transport status
    pub status: i16,
    /// Method name (ASCII, at most 11 bytes)
    pub method: String,
    /// BSON document bytes
    pub body: Bytes,
}

impl Packet {
    /// Create a packet, rejecting method names that do not fit the header
    pub fn new(
        packet_id: i32,
        method: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Result<Self, WireError> {
        let method = method.into();
        check_method(&method)?;
        Ok(Self {
            packet_id,
            status: 0,
            method,
            body: body.into(),
        })
    }

    /// Set the transport status
    pub fn with_status(mut self, status: i16) -> Self {
        self.status = status;
        self
    }

    /// Header describing this packet
    pub fn header(&self) -> Result<PacketHeader, WireError> {
        let body_len = i32::try_from(self.body.len())
            .ok()
            .filter(|len| *len <= MAX_BODY_SIZE)
            .ok_or(WireError::BodyTooLarge(self.body.len()))?;
        Ok(PacketHeader {
            packet_id: self.packet_id,
            status: self.status,
            method: self.method.clone(),
            reserved: 0,
            body_len,
        })
    }

    /// Total encoded size
    pub fn encoded_size(&self) -> usize {
        PACKET_HEADER_SIZE + self.body.len()
    }

    /// Encode header and body into a contiguous buffer
    pub fn encode(&self) -> Result<Bytes, WireError> {
        check_method(&self.method)?;
        let header = self.header()?;

        let mut buf = BytesMut::with_capacity(self.encoded_size());
        header.encode(&mut buf);
        buf.put_slice(&self.body);
        Ok(buf.freeze())
    }

    /// Decode one packet from the front of `buf`, if complete.
    ///
    /// Returns the packet and the number of bytes it occupied.
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>, WireError> {
        let header = match PacketHeader::parse(buf) {
            Some(header) => header,
            None => return Ok(None),
        };
        header.validate()?;

        let total = PACKET_HEADER_SIZE + header.body_len as usize;
        if buf.len() < total {
            return Ok(None);
        }

        let packet = Self {
            packet_id: header.packet_id,
            status: header.status,
            method: header.method,
            body: Bytes::copy_from_slice(&buf[PACKET_HEADER_SIZE..total]),
        };
        Ok(Some((packet, total)))
    }
}

fn check_method(method: &str) -> Result<(), WireError> {
    if method.len() > METHOD_FIELD_SIZE {
        return Err(WireError::MethodTooLong(method.to_string()));
    }
    if !method.bytes().all(|b| b.is_ascii() && b != 0) {
        return Err(WireError::MethodNotAscii(method.to_string()));
    }
    Ok(())
}
