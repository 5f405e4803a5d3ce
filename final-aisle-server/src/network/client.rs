//! Peer-role client.
//!
//! Performs the client half of the handshake over TCP and then exchanges
//! typed messages. Used by integration tests, benches and tooling.

use std::net::SocketAddr;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::core::codec::{open_packet, seal_packet, FrameCodec, FrameError, DEFAULT_MAX_FRAME_SIZE};
use crate::core::crypto::{SymmetricKey, DEFAULT_RSA_BITS};
use crate::core::packet::Packet;
use crate::network::handshake::{ClientHandshake, HandshakeError};
use crate::network::protocol::{ClientRequest, ProtocolError, ServerMessage};

/// Client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Socket failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Unreadable frame.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Handshake failed.
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// Server sent a packet outside the vocabulary.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Server closed the connection.
    #[error("connection closed")]
    Closed,
}

/// A connected, handshaken client.
#[derive(Debug)]
pub struct RelayClient {
    framed: Framed<TcpStream, FrameCodec>,
    key: SymmetricKey,
    max_frame_size: usize,
}

impl RelayClient {
    /// Connect with a default-size handshake key.
    pub async fn connect(addr: SocketAddr) -> Result<Self, ClientError> {
        Self::connect_with_bits(addr, DEFAULT_RSA_BITS).await
    }

    /// Connect and complete the handshake with an RSA key of `bits`.
    pub async fn connect_with_bits(addr: SocketAddr, bits: usize) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;

        let max_frame_size = DEFAULT_MAX_FRAME_SIZE;
        let mut framed = Framed::new(stream, FrameCodec::new(max_frame_size));
        let mut handshake = ClientHandshake::new(bits)?;

        framed.send(Bytes::from(handshake.hello()?)).await?;
        let reply = framed.next().await.ok_or(ClientError::Closed)??;
        let sentinel = handshake.accept_wrapped_key(&reply, max_frame_size)?;

        let key = handshake.key().cloned().ok_or(ClientError::Closed)?;
        framed.send(Bytes::from(seal_packet(&sentinel, &key)?)).await?;
        debug!(%addr, key = %key.fingerprint(), "Secure connection established");

        Ok(Self {
            framed,
            key,
            max_frame_size,
        })
    }

    /// Shared session key.
    pub fn key(&self) -> &SymmetricKey {
        &self.key
    }

    /// Send a typed request.
    pub async fn send(&mut self, request: &ClientRequest) -> Result<(), ClientError> {
        self.send_packet(&request.to_packet()).await
    }

    /// Send a raw packet.
    pub async fn send_packet(&mut self, packet: &Packet) -> Result<(), ClientError> {
        let body = seal_packet(packet, &self.key)?;
        self.framed.send(Bytes::from(body)).await?;
        Ok(())
    }

    /// Receive the next packet.
    pub async fn recv_packet(&mut self) -> Result<Packet, ClientError> {
        let body = self.framed.next().await.ok_or(ClientError::Closed)??;
        Ok(open_packet(&body, &self.key, self.max_frame_size)?)
    }

    /// Receive the next typed message.
    pub async fn recv(&mut self) -> Result<ServerMessage, ClientError> {
        let packet = self.recv_packet().await?;
        Ok(ServerMessage::from_packet(&packet)?)
    }

    /// Close the write half.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.framed.close().await?;
        Ok(())
    }
}
