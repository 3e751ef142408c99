//! Transport contract and the reference framed transport.
//!
//! The engine drives connections through the [`Transport`] trait; the
//! encrypted production transport is an external collaborator. The
//! [`FramedTransport`] here implements the same contract over
//! length-delimited frames so the engine runs end-to-end on plain TCP
//! (and over in-memory pipes in tests). It performs no encryption.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use trellis_common::{Cap, DisconnectReason, Node, NodeId, SecretKey};

use crate::metrics::counters;

/// Timeout for an outbound TCP connect.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(15);
/// Maximum time allowed for reading a complete frame. This is
/// effectively the amount of time a connection can be idle.
pub const FRAME_READ_TIMEOUT: Duration = Duration::from_secs(30);
/// Maximum time allowed for writing a complete frame.
pub const FRAME_WRITE_TIMEOUT: Duration = Duration::from_secs(20);

/// Base wire protocol version exchanged in the hello.
pub const BASE_PROTOCOL_VERSION: u32 = 5;
/// Message codes below this value belong to the base protocol;
/// sub-protocol code spaces are stacked above it.
pub const BASE_PROTOCOL_LENGTH: u8 = 16;

/// Base protocol message codes.
pub mod base_msg {
    /// Protocol handshake payload.
    pub const HELLO: u8 = 0x00;
    /// Disconnect notice; payload is a single reason code byte.
    pub const DISCONNECT: u8 = 0x01;
    /// Liveness probe.
    pub const PING: u8 = 0x02;
    /// Liveness reply.
    pub const PONG: u8 = 0x03;
    /// Identity announcement used by the framed transport in place of
    /// an encryption handshake.
    pub const IDENT: u8 = 0x0f;
}

/// A single wire frame: message code plus payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Absolute message code.
    pub code: u8,
    /// Frame payload.
    pub data: Bytes,
}

impl Frame {
    /// Build a frame.
    #[must_use]
    pub fn new(code: u8, data: Bytes) -> Self {
        Self { code, data }
    }

    /// A disconnect frame carrying `reason`.
    #[must_use]
    pub fn disconnect(reason: DisconnectReason) -> Self {
        Self::new(base_msg::DISCONNECT, Bytes::copy_from_slice(&[reason.code()]))
    }
}

/// Protocol handshake payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Base protocol version.
    pub version: u32,
    /// Human-readable client name.
    pub name: String,
    /// Advertised sub-protocol capabilities.
    pub caps: Vec<Cap>,
    /// The port this node listens on, 0 when not listening.
    pub listen_port: u16,
    /// The sender's node identifier.
    pub id: NodeId,
}

/// Errors from transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Underlying I/O failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// The remote closed the stream.
    #[error("connection closed by remote")]
    Closed,
    /// Frame or payload failed to decode.
    #[error("frame decode error: {0}")]
    Decode(String),
    /// No complete frame arrived within the read deadline.
    #[error("frame read timeout")]
    ReadTimeout,
    /// The frame could not be flushed within the write deadline.
    #[error("frame write timeout")]
    WriteTimeout,
    /// The remote sent a disconnect instead of the expected frame.
    #[error("remote disconnected: {0}")]
    Disconnected(DisconnectReason),
    /// The remote speaks an incompatible base protocol version.
    #[error("incompatible base protocol version {0}")]
    IncompatibleVersion(u32),
    /// An unexpected message code arrived during a handshake.
    #[error("unexpected frame code {0:#04x}")]
    UnexpectedFrame(u8),
}

impl TransportError {
    /// The disconnect reason to send to the remote for this failure.
    #[must_use]
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            Self::Io(_) | Self::Closed => DisconnectReason::TcpError,
            Self::Decode(_) | Self::UnexpectedFrame(_) => DisconnectReason::ProtocolBreach,
            Self::ReadTimeout => DisconnectReason::ReadTimeout,
            Self::WriteTimeout => DisconnectReason::TcpError,
            Self::Disconnected(_) => DisconnectReason::Requested,
            Self::IncompatibleVersion(_) => DisconnectReason::IncompatibleVersion,
        }
    }
}

/// Byte stream usable by transports: the acceptor hands over TCP
/// sockets, tests hand over in-memory duplex pipes.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> AsyncStream for T {}

/// Per-connection transport driven by the handshake runner and the
/// peer runner.
///
/// `read_frame` must be cancel-safe: dropping its future mid-read must
/// not discard buffered partial frames.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Phase-1 handshake; returns the remote identifier.
    async fn do_enc_handshake(
        &mut self,
        key: &SecretKey,
        dial_dest: Option<NodeId>,
    ) -> Result<NodeId, TransportError>;

    /// Phase-2 handshake; returns the remote hello and the time the
    /// first frame of the reply was received.
    async fn do_proto_handshake(
        &mut self,
        our: &Hello,
    ) -> Result<(Hello, DateTime<Utc>), TransportError>;

    /// Read the next frame, honouring the 30 s read deadline.
    async fn read_frame(&mut self) -> Result<Frame, TransportError>;

    /// Write a frame, honouring the 20 s write deadline.
    async fn write_frame(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Close the connection, sending `reason` to the remote when one is
    /// given. Best-effort; never blocks past a short deadline.
    async fn close(&mut self, reason: Option<DisconnectReason>);
}

/// Creates a [`Transport`] for each raw socket.
pub trait TransportFactory: Send + Sync {
    /// Bind a transport to a freshly accepted or dialed stream.
    fn new_transport(&self, stream: Box<dyn AsyncStream>) -> Box<dyn Transport>;
}

/// Socket factory for outbound dials.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to the node's TCP endpoint.
    async fn dial(&self, node: &Node) -> io::Result<Box<dyn AsyncStream>>;
}

/// Default dialer: plain TCP with a connect timeout.
#[derive(Clone, Debug)]
pub struct TcpDialer {
    /// Connect timeout, [`DIAL_TIMEOUT`] by default.
    pub timeout: Duration,
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self {
            timeout: DIAL_TIMEOUT,
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, node: &Node) -> io::Result<Box<dyn AsyncStream>> {
        let stream = timeout(self.timeout, TcpStream::connect(node.tcp_addr()))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial timed out"))??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// NAT port mapper contract. The server renews the mapping until stop.
#[async_trait]
pub trait NatMapper: Send + Sync {
    /// Request an external mapping of `port` for `lease`.
    async fn map_port(&self, protocol: &str, port: u16, lease: Duration) -> io::Result<()>;
}

/// Stream wrapper that feeds ingress/egress byte counters.
pub struct MeteredStream<S> {
    inner: S,
    inbound: bool,
}

impl<S> MeteredStream<S> {
    /// Wrap a stream; `inbound` selects the direction label.
    pub fn new(inner: S, inbound: bool) -> Self {
        Self { inner, inbound }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for MeteredStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let res = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = res {
            let n = buf.filled().len() - before;
            if n > 0 {
                counters::net_bytes_total("ingress", self.inbound, n as u64);
            }
        }
        res
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for MeteredStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let res = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = res {
            if n > 0 {
                counters::net_bytes_total("egress", self.inbound, n as u64);
            }
        }
        res
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Factory for the reference framed transport.
#[derive(Clone, Copy, Debug, Default)]
pub struct FramedFactory;

impl TransportFactory for FramedFactory {
    fn new_transport(&self, stream: Box<dyn AsyncStream>) -> Box<dyn Transport> {
        Box::new(FramedTransport::new(stream))
    }
}

/// Reference transport: length-delimited frames, bincode-encoded hello,
/// identity announced in plaintext. Implements the [`Transport`]
/// contract without encryption.
pub struct FramedTransport {
    framed: Framed<Box<dyn AsyncStream>, LengthDelimitedCodec>,
}

impl FramedTransport {
    /// Bind the framed codec to a raw stream.
    #[must_use]
    pub fn new(stream: Box<dyn AsyncStream>) -> Self {
        Self {
            framed: Framed::new(stream, LengthDelimitedCodec::new()),
        }
    }

    async fn read_frame_inner(&mut self) -> Result<Frame, TransportError> {
        let next = timeout(FRAME_READ_TIMEOUT, self.framed.next())
            .await
            .map_err(|_| TransportError::ReadTimeout)?;
        let buf = match next {
            Some(Ok(buf)) => buf,
            Some(Err(e)) => return Err(TransportError::Io(e)),
            None => return Err(TransportError::Closed),
        };
        if buf.is_empty() {
            return Err(TransportError::Decode("empty frame".into()));
        }
        let bytes = buf.freeze();
        Ok(Frame {
            code: bytes[0],
            data: bytes.slice(1..),
        })
    }

    async fn write_frame_inner(&mut self, frame: Frame) -> Result<(), TransportError> {
        let mut buf = BytesMut::with_capacity(1 + frame.data.len());
        buf.put_u8(frame.code);
        buf.extend_from_slice(&frame.data);
        timeout(FRAME_WRITE_TIMEOUT, self.framed.send(buf.freeze()))
            .await
            .map_err(|_| TransportError::WriteTimeout)?
            .map_err(TransportError::Io)
    }

    /// Read a frame, translating an early disconnect into a typed error.
    async fn expect_frame(&mut self, code: u8) -> Result<Frame, TransportError> {
        let frame = self.read_frame_inner().await?;
        if frame.code == base_msg::DISCONNECT {
            let reason = frame
                .data
                .first()
                .map(|b| DisconnectReason::from_code(*b))
                .unwrap_or(DisconnectReason::Other);
            return Err(TransportError::Disconnected(reason));
        }
        if frame.code != code {
            return Err(TransportError::UnexpectedFrame(frame.code));
        }
        Ok(frame)
    }
}

#[async_trait]
impl Transport for FramedTransport {
    async fn do_enc_handshake(
        &mut self,
        key: &SecretKey,
        _dial_dest: Option<NodeId>,
    ) -> Result<NodeId, TransportError> {
        // Both sides announce their identity; the dialed-target check
        // happens in the handshake runner against the returned id.
        let our_id = key.node_id();
        self.write_frame_inner(Frame::new(
            base_msg::IDENT,
            Bytes::copy_from_slice(our_id.as_bytes()),
        ))
        .await?;

        let frame = self.expect_frame(base_msg::IDENT).await?;
        NodeId::from_slice(&frame.data).map_err(|e| TransportError::Decode(e.to_string()))
    }

    async fn do_proto_handshake(
        &mut self,
        our: &Hello,
    ) -> Result<(Hello, DateTime<Utc>), TransportError> {
        let payload =
            bincode::serialize(our).map_err(|e| TransportError::Decode(e.to_string()))?;
        self.write_frame_inner(Frame::new(base_msg::HELLO, Bytes::from(payload)))
            .await?;

        let frame = self.expect_frame(base_msg::HELLO).await?;
        let received_at = Utc::now();
        let hello: Hello = bincode::deserialize(&frame.data)
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        if hello.version != BASE_PROTOCOL_VERSION {
            return Err(TransportError::IncompatibleVersion(hello.version));
        }
        Ok((hello, received_at))
    }

    async fn read_frame(&mut self) -> Result<Frame, TransportError> {
        self.read_frame_inner().await
    }

    async fn write_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.write_frame_inner(frame).await
    }

    async fn close(&mut self, reason: Option<DisconnectReason>) {
        if let Some(reason) = reason {
            let _ = timeout(
                Duration::from_secs(2),
                self.framed.send({
                    let mut buf = BytesMut::with_capacity(2);
                    buf.put_u8(base_msg::DISCONNECT);
                    buf.put_u8(reason.code());
                    buf.freeze()
                }),
            )
            .await;
        }
        let _ = self.framed.close().await;
    }
}
