//! Code shared by the client and the reference server: the wire codec,
//! the snapshot model and its delta compression, the system messages, the
//! deterministic character physics, and datagram framing.

pub mod delta;
pub mod packer;
pub mod physics;
pub mod protocol;
pub mod snapshot;
pub mod transport;
pub mod varint;

pub use delta::{DecodeError, SnapshotDelta};
pub use protocol::{PlayerInput, SystemMessage};
pub use snapshot::{ItemKey, Snapshot, SnapshotBuilder, SnapshotItem};
pub use transport::{ConnectionId, SendFlags, Transport, TransportError};

/// Simulation ticks per second
pub const SERVER_TICK_SPEED: i32 = 50;
/// Client slots on a server, and character slots in a world
pub const MAX_CLIENTS: usize = 64;
