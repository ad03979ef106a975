//! Connection preambles.
//!
//! Encrypted sessions open with the V2SL handshake, written once and never
//! acknowledged. Plaintext exchanges (booking over TLS) skip it and read
//! packets straight off the stream.

use bytes::BytesMut;
use loco_wire::{build_handshake, HandshakeKey, Packet, PacketDecoder, SessionKey};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::error::SessionError;

/// Send the handshake announcing `key`, returning the bytes written
pub async fn send_handshake<W: AsyncWriteExt + Unpin>(
    mut writer: W,
    key: &SessionKey,
    public_key: &HandshakeKey,
) -> Result<usize, SessionError> {
    let message = build_handshake(key, public_key)?;
    writer.write_all(&message).await?;
    writer.flush().await?;
    debug!("Sent V2SL handshake ({} bytes)", message.len());
    Ok(message.len())
}

/// Write one plaintext packet
pub async fn send_packet<W: AsyncWriteExt + Unpin>(
    mut writer: W,
    packet: &Packet,
) -> Result<(), SessionError> {
    let bytes = packet.encode()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    trace!("Sent plaintext {} ({} bytes)", packet.method, bytes.len());
    Ok(())
}

/// Read the next plaintext packet from the stream
pub async fn recv_packet<R: AsyncReadExt + Unpin>(
    mut reader: R,
    decoder: &mut PacketDecoder,
) -> Result<Packet, SessionError> {
    let mut buffer = BytesMut::with_capacity(4096);
    loop {
        if let Some(packet) = decoder.decode()? {
            return Ok(packet);
        }

        buffer.clear();
        let bytes_read = reader.read_buf(&mut buffer).await?;
        if bytes_read == 0 {
            return Err(SessionError::Disconnected);
        }
        trace!(
            "Read {} bytes, decoder now has {} bytes",
            bytes_read,
            decoder.buffered() + bytes_read
        );
        decoder.extend(&buffer);
    }
}

/// Send `packet` and wait for the reply carrying the same packet id.
///
/// Packets with other ids are skipped.
pub async fn plain_exchange<S>(stream: &mut S, packet: &Packet) -> Result<Packet, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_packet(&mut *stream, packet).await?;
    let mut decoder = PacketDecoder::new();
    loop {
        let reply = recv_packet(&mut *stream, &mut decoder).await?;
        if reply.packet_id == packet.packet_id {
            return Ok(reply);
        }
        debug!(
            "Ignoring plaintext {} with packet id {}",
            reply.method, reply.packet_id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loco_wire::HandshakeHeader;

    #[tokio::test]
    async fn test_handshake_written_whole() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let key = SessionKey::generate();
        let written = send_handshake(&mut client, &key, &HandshakeKey::loco().unwrap())
            .await
            .unwrap();

        let mut buf = vec![0u8; written];
        server.read_exact(&mut buf).await.unwrap();
        let header = HandshakeHeader::parse(&buf).unwrap();
        assert_eq!(header.encrypted_key_len as usize, written - 12);
        assert_eq!(header.key_encrypt_type, 16);
        assert_eq!(header.cipher_suite, 3);
    }

    #[tokio::test]
    async fn test_plain_exchange_matches_packet_id() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(async move {
            let mut decoder = PacketDecoder::new();
            let request = recv_packet(&mut server, &mut decoder).await.unwrap();
            assert_eq!(request.method, "CHECKIN");

            let unrelated = Packet::new(request.packet_id + 1, "MSG", Vec::new()).unwrap();
            send_packet(&mut server, &unrelated).await.unwrap();
            let reply = Packet::new(request.packet_id, "CHECKIN", vec![5, 0, 0, 0, 0]).unwrap();
            send_packet(&mut server, &reply).await.unwrap();
        });

        let request = Packet::new(1, "CHECKIN", Vec::new()).unwrap();
        let reply = plain_exchange(&mut client, &request).await.unwrap();
        assert_eq!(reply.packet_id, 1);
        assert_eq!(reply.method, "CHECKIN");
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_recv_packet_eof() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut server = server;
        let mut decoder = PacketDecoder::new();
        assert_eq!(
            recv_packet(&mut server, &mut decoder).await,
            Err(SessionError::Disconnected)
        );
    }
}
