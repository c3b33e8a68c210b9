//! # Game Client Library
//!
//! Client-side network synchronization and prediction for the multiplayer
//! game. The server streams delta-compressed world snapshots over UDP; this
//! library turns them back into confirmed world states, keeps a clock that
//! tracks the server's tick rate, and predicts the local player ahead of the
//! last confirmed tick so input feels immediate.
//!
//! ## Architecture Overview
//!
//! Everything below the [`coordinator`] is synchronous and owns its state
//! outright. A frame loop calls into it once per frame; nothing spawns
//! tasks or blocks.
//!
//! ### Snapshot Pipeline
//! Snapshot parts are reassembled by the [`fragment`] assembler, decoded
//! against a base snapshot from the [`history`], checksummed, and stored.
//! A missing base or repeated checksum failures make the connection ask the
//! server for a full snapshot.
//!
//! ### Clocks
//! Two [`smooth_time`] clocks run per connection. The game clock trails the
//! newest snapshot and drives interpolation between the previous and
//! current snapshot. The prediction clock runs a little ahead of the server
//! and is steered by the server's input timing feedback.
//!
//! ### Client-Side Prediction
//! Whenever the prediction clock reaches a new tick the [`prediction`]
//! engine rebuilds the world from the latest confirmed snapshot and replays
//! every input sent since, using the same physics as the server.
//!
//! ### Dummy Connection
//! A second connection (the dummy) can join the same server. Both run a
//! complete pipeline of their own; the [`coordinator`] decides which one the
//! player steers and what the other one sends.
//!
//! ## Module Organization
//!
//! - `clock`: wall-clock sources
//! - `fragment`: snapshot part reassembly
//! - `history`: stored snapshots with interpolation cursors
//! - `smooth_time`: jitter-tolerant game and prediction clocks
//! - `input`: history of sent inputs
//! - `prediction`: replay of confirmed state plus inputs
//! - `connection`: one complete per-connection pipeline
//! - `coordinator`: both connections, input sending, packet routing
//! - `network`: UDP transport
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::clock::SystemClock;
//! use client::coordinator::{ClientConfig, ConnectionCoordinator, InputSource, NoHooks};
//! use client::network::UdpTransport;
//! use shared::physics::{CollisionMap, ARENA_HEIGHT, ARENA_WIDTH};
//! use shared::{ConnectionId, PlayerInput};
//! use std::sync::Arc;
//!
//! struct HoldRight;
//!
//! impl InputSource for HoldRight {
//!     fn sample(&mut self, _conn: ConnectionId, input: &mut PlayerInput) {
//!         input.direction = 1;
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = UdpTransport::bind("127.0.0.1:8080").await?;
//! let map = Arc::new(CollisionMap::arena(ARENA_WIDTH, ARENA_HEIGHT));
//! let mut client =
//!     ConnectionCoordinator::new(transport, SystemClock::new(), ClientConfig::default(), map);
//!
//! client.connect(ConnectionId::Primary)?;
//! loop {
//!     client.pump_network(&mut NoHooks)?;
//!     client.update(&mut HoldRight, &mut NoHooks)?;
//!     tokio::time::sleep(std::time::Duration::from_millis(16)).await;
//! }
//! # }
//! ```
//!
//! ## Design Philosophy
//!
//! ### Nothing Panics On Network Input
//! Malformed, stale or superseded packets are dropped and logged at debug
//! level. Every decode path returns a typed error instead.
//!
//! ### No Shared Mutable State
//! The primary and the dummy never write to each other's state. The only
//! cross-connection read is the other side's input history while its
//! prediction is valid.

pub mod clock;
pub mod connection;
pub mod coordinator;
pub mod fragment;
pub mod history;
pub mod input;
pub mod network;
pub mod prediction;
pub mod smooth_time;

pub use connection::{Connection, SyncError};
pub use coordinator::{ClientConfig, ConnectionCoordinator, DummyConfig, ResetOnSwitch};
pub use prediction::PredictionConfig;
pub use smooth_time::ClockConfig;
