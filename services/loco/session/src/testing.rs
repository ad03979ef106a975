//! In-process LOCO server side for tests.
//!
//! [`MockServer`] performs the server half of the V2SL handshake with a test
//! RSA key pair and then speaks encrypted packets over any stream, usually
//! one end of `tokio::io::duplex`. [`DuplexConnector`] hands out such pipes
//! in place of real TCP connections and records every endpoint it was asked
//! for.

use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use loco_wire::bson::Document;
use loco_wire::crypto::KEY_SIZE;
use loco_wire::{
    decrypt_block, encode_doc, encrypt_block, BlockDecoder, CryptoError, HandshakeHeader,
    HandshakeKey, Packet, SessionKey, HANDSHAKE_HEADER_SIZE,
};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};

use crate::error::SessionError;
use crate::session::SessionConfig;
use crate::transport::{Connector, Endpoint, IoStream};

const TEST_KEY_BITS: usize = 1024;
const PIPE_CAPACITY: usize = 256 * 1024;

fn test_private_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| {
        RsaPrivateKey::new(&mut rand::thread_rng(), TEST_KEY_BITS)
            .unwrap_or_else(|e| panic!("test key generation failed: {}", e))
    })
}

/// Public half of the test key pair
pub fn test_handshake_key() -> HandshakeKey {
    HandshakeKey::from_public_key(RsaPublicKey::from(test_private_key()))
}

/// Session configuration whose handshake the mock server can open
pub fn test_config() -> SessionConfig {
    SessionConfig {
        handshake_key: Some(test_handshake_key()),
        ..SessionConfig::default()
    }
}

/// Server end of an encrypted session
pub struct MockServer<S> {
    stream: S,
    key: SessionKey,
    blocks: BlockDecoder,
    plaintext: BytesMut,
}

impl<S> MockServer<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Read the client's handshake and recover its session key
    pub async fn accept(mut stream: S) -> Result<Self, SessionError> {
        let mut header = [0u8; HANDSHAKE_HEADER_SIZE];
        stream.read_exact(&mut header).await?;
        let header = HandshakeHeader::parse(&header)
            .ok_or_else(|| SessionError::Io("short handshake".into()))?;

        let mut wrapped = vec![0u8; header.encrypted_key_len.max(0) as usize];
        stream.read_exact(&mut wrapped).await?;
        let raw = test_private_key()
            .decrypt(Oaep::new::<sha1::Sha1>(), &wrapped)
            .map_err(|e| CryptoError::Encapsulation(e.to_string()))?;

        let key: [u8; KEY_SIZE] = raw
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::Encapsulation(format!("key of {} bytes", raw.len())))?;

        Ok(Self {
            stream,
            key: SessionKey::from_bytes(key),
            blocks: BlockDecoder::new(),
            plaintext: BytesMut::new(),
        })
    }

    /// Session key announced by the client
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    async fn fill(&mut self) -> Result<(), SessionError> {
        let mut chunk = [0u8; 16 * 1024];
        let n = self.stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(SessionError::Disconnected);
        }
        self.blocks.extend(&chunk[..n]);
        while let Some(block) = self.blocks.decode()? {
            let opened = decrypt_block(&self.key, &block)?;
            self.plaintext.extend_from_slice(&opened);
        }
        Ok(())
    }

    /// Next packet sent by the client
    pub async fn recv_packet(&mut self) -> Result<Packet, SessionError> {
        loop {
            if let Some((packet, used)) = Packet::decode(&self.plaintext)? {
                self.plaintext.advance(used);
                return Ok(packet);
            }
            self.fill().await?;
        }
    }

    /// Next `len` plaintext bytes, regardless of packet framing
    pub async fn recv_raw(&mut self, len: usize) -> Result<Bytes, SessionError> {
        while self.plaintext.len() < len {
            self.fill().await?;
        }
        Ok(self.plaintext.split_to(len).freeze())
    }

    /// Encrypt and send one packet in its own block
    pub async fn send(&mut self, packet: &Packet) -> Result<(), SessionError> {
        let block = encrypt_block(&self.key, &packet.encode()?)?;
        self.send_bytes(&block).await
    }

    /// Answer `request` with `body`
    pub async fn reply(&mut self, request: &Packet, body: Document) -> Result<(), SessionError> {
        let body = encode_doc(&body).map_err(|e| SessionError::body(&request.method, e))?;
        let packet = Packet::new(request.packet_id, request.method.clone(), body)?;
        self.send(&packet).await
    }

    /// Send an unsolicited packet
    pub async fn push(
        &mut self,
        packet_id: i32,
        method: &str,
        body: Document,
    ) -> Result<(), SessionError> {
        let body = encode_doc(&body).map_err(|e| SessionError::body(method, e))?;
        let packet = Packet::new(packet_id, method, body)?;
        self.send(&packet).await
    }

    /// Write raw wire bytes
    pub async fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

type AcceptFn = dyn Fn(&Endpoint, DuplexStream) -> Result<(), SessionError> + Send + Sync;

/// Connector producing in-memory pipes.
///
/// Each connect creates a duplex pair and passes the server end to the
/// accept callback, which typically spawns a [`MockServer`] task. An error
/// from the callback fails the connect.
#[derive(Clone)]
pub struct DuplexConnector {
    accept: Arc<AcceptFn>,
    attempts: Arc<Mutex<Vec<Endpoint>>>,
}

impl DuplexConnector {
    /// Create a connector around `accept`
    pub fn new<F>(accept: F) -> Self
    where
        F: Fn(&Endpoint, DuplexStream) -> Result<(), SessionError> + Send + Sync + 'static,
    {
        Self {
            accept: Arc::new(accept),
            attempts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every endpoint connected to so far, in order
    pub fn attempts(&self) -> Vec<Endpoint> {
        self.attempts
            .lock()
            .map(|attempts| attempts.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<IoStream, SessionError> {
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.push(endpoint.clone());
        }
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        (self.accept)(endpoint, server)?;
        Ok(IoStream::Duplex(client))
    }
}
