use log::{debug, error, info};
use shared::transport::Envelope;
use shared::{ConnectionId, SendFlags, Transport, TransportError};
use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

const RECV_BUFFER_SIZE: usize = 2048;

/// UDP transport with one socket per logical connection, so the server sees
/// the primary and the dummy as two separate clients
pub struct UdpTransport {
    sockets: [Option<UdpSocket>; 2],
    server_addr: SocketAddr,
    buffer: Vec<u8>,
}

impl UdpTransport {
    /// Binds the primary socket
    pub async fn bind(server_addr: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let server_addr = server_addr.parse()?;
        let mut transport = UdpTransport {
            sockets: [None, None],
            server_addr,
            buffer: vec![0; RECV_BUFFER_SIZE],
        };
        transport.open(ConnectionId::Primary).await?;
        Ok(transport)
    }

    /// Binds a fresh socket for `conn`, replacing any previous one
    pub async fn open(&mut self, conn: ConnectionId) -> Result<(), TransportError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.writable().await?;
        info!("[{}] Bound to {}", conn, socket.local_addr()?);
        self.sockets[conn.index()] = Some(socket);
        Ok(())
    }

    pub fn close(&mut self, conn: ConnectionId) {
        self.sockets[conn.index()] = None;
    }

    pub fn is_open(&self, conn: ConnectionId) -> bool {
        self.sockets[conn.index()].is_some()
    }

    pub fn local_addr(&self, conn: ConnectionId) -> Option<SocketAddr> {
        self.sockets[conn.index()]
            .as_ref()
            .and_then(|socket| socket.local_addr().ok())
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }
}

impl Transport for UdpTransport {
    fn send(
        &mut self,
        conn: ConnectionId,
        data: &[u8],
        flags: SendFlags,
    ) -> Result<(), TransportError> {
        let socket = self.sockets[conn.index()]
            .as_ref()
            .ok_or(TransportError::NotConnected(conn))?;
        let datagram = Envelope::new(flags, data.to_vec()).encode()?;
        socket.try_send_to(&datagram, self.server_addr)?;
        Ok(())
    }

    fn try_receive(&mut self) -> Option<(Vec<u8>, ConnectionId)> {
        for conn in ConnectionId::ALL {
            let Some(socket) = self.sockets[conn.index()].as_ref() else {
                continue;
            };

            loop {
                match socket.try_recv_from(&mut self.buffer) {
                    Ok((len, from)) => {
                        if from != self.server_addr {
                            debug!("[{}] Ignoring datagram from {}", conn, from);
                            continue;
                        }
                        match Envelope::decode(&self.buffer[..len]) {
                            Ok(envelope) => return Some((envelope.payload, conn)),
                            Err(e) => debug!("[{}] Dropped unframed datagram: {}", conn, e),
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        error!("[{}] Error receiving packet: {}", conn, e);
                        break;
                    }
                }
            }
        }
        None
    }
}
