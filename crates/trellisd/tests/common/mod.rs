use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use trellis_common::{Cap, DisconnectReason, NodeId, SecretKey};
use trellisd::transport::{
    base_msg, FramedTransport, Frame, Hello, Transport, TransportError, BASE_PROTOCOL_VERSION,
};
use trellisd::{Config, PeerEvent, PeerEventKind, ProtoPeer, Protocol, Server};

pub fn key(byte: u8) -> SecretKey {
    SecretKey::from_bytes(&[byte; 32]).unwrap()
}

/// Test sub-protocol: echoes every message back to the sender.
pub struct EchoProtocol;

#[async_trait]
impl Protocol for EchoProtocol {
    fn name(&self) -> &str {
        "mesh"
    }
    fn version(&self) -> u32 {
        1
    }
    fn msg_count(&self) -> u8 {
        4
    }
    async fn run(&self, mut peer: ProtoPeer) -> Result<(), DisconnectReason> {
        while let Some(msg) = peer.rx.recv().await {
            if peer.tx.send(msg.code, msg.data).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

pub fn mesh_caps() -> Vec<Cap> {
    vec![Cap::new("mesh", 1)]
}

/// A config listening on a loopback port with the echo protocol and a
/// short dial cooldown, ready for lifecycle tests.
pub fn base_config(key_byte: u8) -> Config {
    let mut config = Config::new(key(key_byte));
    config.listen_addr = Some("127.0.0.1:0".parse().unwrap());
    config.protocols = vec![Arc::new(EchoProtocol)];
    config.no_discovery = true;
    config.dial_cooldown = Duration::from_millis(200);
    config.name = format!("test-node-{key_byte}");
    config
}

pub async fn start_server(config: Config) -> Server {
    let server = Server::new(config);
    server.start().await.expect("server failed to start");
    server
}

/// Raw framed client driving the reference transport by hand, the way
/// a remote node would.
pub struct TestClient {
    pub transport: FramedTransport,
    pub id: NodeId,
    pub server_id: NodeId,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr, key: SecretKey) -> Result<Self, TransportError> {
        Self::connect_with_caps(addr, key, mesh_caps()).await
    }

    pub async fn connect_with_caps(
        addr: SocketAddr,
        key: SecretKey,
        caps: Vec<Cap>,
    ) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let mut transport = FramedTransport::new(Box::new(stream));

        let server_id = transport.do_enc_handshake(&key, None).await?;
        let hello = Hello {
            version: BASE_PROTOCOL_VERSION,
            name: "test-client".to_string(),
            caps,
            listen_port: 0,
            id: key.node_id(),
        };
        let (_remote, _received_at) = transport.do_proto_handshake(&hello).await?;

        Ok(Self {
            transport,
            id: key.node_id(),
            server_id,
        })
    }

    /// Wait for a disconnect frame, answering pings along the way.
    /// `None` when the deadline passes or the stream just closes.
    pub async fn try_recv_disconnect(&mut self, deadline: Duration) -> Option<DisconnectReason> {
        let wait = async {
            loop {
                match self.transport.read_frame().await {
                    Ok(frame) if frame.code == base_msg::DISCONNECT => {
                        return frame.data.first().map(|b| DisconnectReason::from_code(*b));
                    }
                    Ok(frame) if frame.code == base_msg::PING => {
                        let _ = self
                            .transport
                            .write_frame(Frame::new(base_msg::PONG, bytes::Bytes::new()))
                            .await;
                    }
                    Ok(_) => {}
                    Err(_) => return None,
                }
            }
        };
        tokio::time::timeout(deadline, wait).await.ok().flatten()
    }

    /// Read the next non-base frame, answering pings along the way.
    pub async fn recv_msg(&mut self, deadline: Duration) -> Frame {
        let wait = async {
            loop {
                let frame = self.transport.read_frame().await.expect("read frame");
                match frame.code {
                    c if c == base_msg::PING => {
                        let _ = self
                            .transport
                            .write_frame(Frame::new(base_msg::PONG, bytes::Bytes::new()))
                            .await;
                    }
                    c if c == base_msg::PONG => {}
                    _ => return frame,
                }
            }
        };
        tokio::time::timeout(deadline, wait)
            .await
            .expect("timeout waiting for message")
    }

    pub async fn close(mut self, reason: DisconnectReason) {
        self.transport.close(Some(reason)).await;
    }
}

/// Wait until an event of the given kind arrives, skipping others.
pub async fn wait_for_event(
    events: &mut broadcast::Receiver<PeerEvent>,
    kind: PeerEventKind,
    deadline: Duration,
) -> PeerEvent {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if event.kind == kind => return event,
                Ok(_) => {}
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    };
    tokio::time::timeout(deadline, wait)
        .await
        .unwrap_or_else(|_| panic!("timeout waiting for {kind:?} event"))
}

/// Poll until the server reports the expected peer count.
pub async fn wait_peer_count(server: &Server, expected: usize, deadline: Duration) {
    let wait = async {
        loop {
            if server.peer_count().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(deadline, wait)
        .await
        .unwrap_or_else(|_| panic!("timeout waiting for peer count {expected}"));
}
