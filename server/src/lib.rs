//! # Reference Game Server
//!
//! A small authoritative server that speaks the same snapshot protocol the
//! client library consumes. It exists so the client's synchronisation and
//! prediction can be exercised end to end against a real peer.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Simulation
//! The server steps the shared character physics at the fixed tick rate.
//! Clients predict with exactly the same code, so a prediction that saw
//! the same inputs reproduces the server's state bit for bit.
//!
//! ### Input Scheduling
//! Every `INPUT` names the tick the client predicted it for. The server
//! applies it on that tick, or on the next one when it arrived late, and
//! answers with `INPUT_TIMING` so the client can steer its prediction
//! clock.
//!
//! ### Snapshot Streaming
//! After every tick each client gets its own snapshot (the local player is
//! flagged), delta-encoded against the newest snapshot it acknowledged and
//! split into parts when it does not fit one datagram. A client that has
//! acknowledged nothing, or asks for a resync, receives keyframes.
//!
//! ## Module Organization
//!
//! ### Client Manager Module (`client_manager`)
//! - Slot assignment, timeouts and address lookup
//! - Acknowledged ticks and latency measurement
//! - Inputs keyed by the tick they apply to
//!
//! ### Game Module (`game`)
//! - The authoritative world
//! - Per-client snapshot building
//!
//! ### Snapshots Module (`snapshots`)
//! - Snapshots each client may still use as a delta base
//! - Encoding into `SNAP`, `SNAP_SINGLE` and `SNAP_EMPTY` messages
//!
//! ### Network Module (`network`)
//! - UDP socket tasks for receiving, sending and timeout checks
//! - The tick loop tying everything together
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Bind and accept at most 16 clients
//!     let mut server = Server::new("127.0.0.1:8080", 16).await?;
//!
//!     // Runs the tick loop until the process is stopped
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod game;
pub mod network;
pub mod snapshots;
