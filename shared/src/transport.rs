//! Datagram framing and the transport seam between the client core and the
//! socket layer.
//!
//! The core never touches sockets. It hands packed messages to a
//! [`Transport`] tagged with the logical connection they belong to, and
//! polls it for whatever arrived since the last call.

use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

/// The two logical connections a client keeps to the same server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionId {
    Primary,
    Dummy,
}

impl ConnectionId {
    pub const ALL: [ConnectionId; 2] = [ConnectionId::Primary, ConnectionId::Dummy];

    pub fn index(self) -> usize {
        match self {
            ConnectionId::Primary => 0,
            ConnectionId::Dummy => 1,
        }
    }

    pub fn other(self) -> Self {
        match self {
            ConnectionId::Primary => ConnectionId::Dummy,
            ConnectionId::Dummy => ConnectionId::Primary,
        }
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionId::Primary => write!(f, "primary"),
            ConnectionId::Dummy => write!(f, "dummy"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendFlags {
    /// Must be resent until acknowledged
    pub vital: bool,
    /// Send now instead of batching
    pub flush: bool,
}

impl SendFlags {
    pub const NONE: SendFlags = SendFlags {
        vital: false,
        flush: false,
    };
    pub const FLUSH: SendFlags = SendFlags {
        vital: false,
        flush: true,
    };
    pub const VITAL_FLUSH: SendFlags = SendFlags {
        vital: true,
        flush: true,
    };
}

/// What actually goes into a UDP datagram
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub flags: SendFlags,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(flags: SendFlags, payload: Vec<u8>) -> Self {
        Self { flags, payload }
    }

    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, TransportError> {
        Ok(bincode::deserialize(datagram)?)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("framing error: {0}")]
    Framing(#[from] bincode::Error),
    #[error("{0} connection is not open")]
    NotConnected(ConnectionId),
}

/// Non-blocking datagram transport multiplexing both logical connections
pub trait Transport {
    fn send(&mut self, conn: ConnectionId, data: &[u8], flags: SendFlags)
        -> Result<(), TransportError>;

    /// Next received payload and the connection it arrived on, if any
    fn try_receive(&mut self) -> Option<(Vec<u8>, ConnectionId)>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentPacket {
    pub conn: ConnectionId,
    pub data: Vec<u8>,
    pub flags: SendFlags,
}

#[derive(Debug, Default)]
struct LoopbackQueues {
    incoming: VecDeque<(Vec<u8>, ConnectionId)>,
    outgoing: Vec<SentPacket>,
    closed: [bool; 2],
}

/// In-memory transport. Clones share the same queues, so a test can keep a
/// handle while the coordinator owns another.
#[derive(Debug, Clone, Default)]
pub struct LoopbackTransport {
    queues: Rc<RefCell<LoopbackQueues>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a payload as if it had arrived on `conn`
    pub fn push_incoming(&self, conn: ConnectionId, data: Vec<u8>) {
        self.queues.borrow_mut().incoming.push_back((data, conn));
    }

    /// Drains everything sent since the last call
    pub fn take_outgoing(&self) -> Vec<SentPacket> {
        std::mem::take(&mut self.queues.borrow_mut().outgoing)
    }

    pub fn set_closed(&self, conn: ConnectionId, closed: bool) {
        self.queues.borrow_mut().closed[conn.index()] = closed;
    }
}

impl Transport for LoopbackTransport {
    fn send(
        &mut self,
        conn: ConnectionId,
        data: &[u8],
        flags: SendFlags,
    ) -> Result<(), TransportError> {
        let mut queues = self.queues.borrow_mut();
        if queues.closed[conn.index()] {
            return Err(TransportError::NotConnected(conn));
        }
        queues.outgoing.push(SentPacket {
            conn,
            data: data.to_vec(),
            flags,
        });
        Ok(())
    }

    fn try_receive(&mut self) -> Option<(Vec<u8>, ConnectionId)> {
        self.queues.borrow_mut().incoming.pop_front()
    }
}
