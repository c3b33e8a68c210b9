//! Drives both connections from one frame loop.
//!
//! The coordinator owns the transport and the clock, routes every received
//! datagram to the connection it arrived on, advances both pipelines once
//! per frame and sends inputs whenever the active connection reaches a new
//! predicted tick. The player steers the *active* connection; the other one
//! (the dummy, or the primary while the dummy is active) is fed by
//! [`DummyConfig`] rules: idle, mirroring the player's moves, or hammering.

use crate::clock::Clock;
use crate::connection::{Connection, Handled, SyncError};
use crate::input::InputSample;
use crate::prediction::PredictionConfig;
use crate::smooth_time::ClockConfig;
use log::{debug, error, info, warn};
use shared::physics::{CollisionMap, Vec2, WorldCore};
use shared::{
    ConnectionId, PlayerInput, SendFlags, Snapshot, SystemMessage, Transport, TransportError,
};
use std::ops::{Index, IndexMut};
use std::sync::Arc;

/// `wanted_weapon` value selecting the hammer
const HAMMER_WEAPON: i32 = 1;
/// Prediction ticks between two automatic hammer hits
const HAMMER_INTERVAL: i32 = 25;

/// One value per logical connection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerConnection<T> {
    items: [T; 2],
}

impl<T> PerConnection<T> {
    pub fn from_fn(f: impl FnMut(ConnectionId) -> T) -> Self {
        Self {
            items: ConnectionId::ALL.map(f),
        }
    }

    /// Mutable access to `first` alongside shared access to the other one
    pub fn split_mut(&mut self, first: ConnectionId) -> (&mut T, &T) {
        let [primary, dummy] = &mut self.items;
        match first {
            ConnectionId::Primary => (primary, &*dummy),
            ConnectionId::Dummy => (dummy, &*primary),
        }
    }
}

impl<T> Index<ConnectionId> for PerConnection<T> {
    type Output = T;

    fn index(&self, conn: ConnectionId) -> &T {
        &self.items[conn.index()]
    }
}

impl<T> IndexMut<ConnectionId> for PerConnection<T> {
    fn index_mut(&mut self, conn: ConnectionId) -> &mut T {
        &mut self.items[conn.index()]
    }
}

/// Whose controls are cleared when the active connection switches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResetOnSwitch {
    #[default]
    Off,
    /// The connection that just became inactive
    Inactive,
    /// The connection that just became active
    Active,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DummyConfig {
    /// Hit the active player with the hammer every 25 predicted ticks
    pub hammer: bool,
    /// Mirror the player's moves onto the inactive connection
    pub copy_moves: bool,
    pub reset_on_switch: ResetOnSwitch,
    /// Keep the inactive player's weapon while hammering
    pub restore_weapon: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientConfig {
    /// Game clock of both connections
    pub clock: ClockConfig,
    pub prediction: PredictionConfig,
    pub dummy: DummyConfig,
}

/// Input state of whichever connection is not being steered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DummyControl {
    pub input: PlayerInput,
    pub hammer_input: PlayerInput,
    /// Pending fire request, or the hammer countdown in hammer mode
    pub fire: i32,
}

impl DummyControl {
    fn copy_moves(&mut self, previous: &PlayerInput, current: &PlayerInput) {
        self.input.direction = current.direction;
        self.input.hook = current.hook;
        self.input.jump = current.jump;
        self.input.player_flags = current.player_flags;
        self.input.target_x = current.target_x;
        self.input.target_y = current.target_y;
        self.input.wanted_weapon = current.wanted_weapon;

        self.input.fire += current.fire - previous.fire;
        self.input.next_weapon += current.next_weapon - previous.next_weapon;
        self.input.prev_weapon += current.prev_weapon - previous.prev_weapon;
    }
}

/// Produces the player's controls
pub trait InputSource {
    /// Updates `input`, the controls of the connection being steered
    fn sample(&mut self, conn: ConnectionId, input: &mut PlayerInput);
}

/// Notifications for the game layer
pub trait ClientHooks {
    fn on_new_snapshot(&mut self, _conn: ConnectionId, _tick: i32, _snapshot: &Snapshot) {}

    /// `previous` is the world one tick before `current`, for interpolating
    /// the predicted characters between them
    fn on_predicted_tick(
        &mut self,
        _conn: ConnectionId,
        _tick: i32,
        _previous: Option<&WorldCore>,
        _current: Option<&WorldCore>,
    ) {
    }
}

/// Hooks that ignore everything
#[derive(Debug, Default)]
pub struct NoHooks;

impl ClientHooks for NoHooks {}

pub struct ConnectionCoordinator<T: Transport, C: Clock> {
    transport: T,
    clock: C,
    dummy_config: DummyConfig,
    connections: PerConnection<Connection>,
    active: ConnectionId,
    controls: PerConnection<PlayerInput>,
    dummy: DummyControl,
}

impl<T: Transport, C: Clock> ConnectionCoordinator<T, C> {
    pub fn new(transport: T, clock: C, config: ClientConfig, collision: Arc<CollisionMap>) -> Self {
        let connections = PerConnection::from_fn(|conn| {
            Connection::new(
                conn,
                config.clock.clone(),
                config.prediction.clone(),
                Arc::clone(&collision),
            )
        });

        Self {
            transport,
            clock,
            dummy_config: config.dummy,
            connections,
            active: ConnectionId::Primary,
            controls: PerConnection::default(),
            dummy: DummyControl::default(),
        }
    }

    /// Starts a session on `conn`. The dummy needs the primary online.
    pub fn connect(&mut self, conn: ConnectionId) -> Result<(), TransportError> {
        if conn == ConnectionId::Dummy && !self.connections[ConnectionId::Primary].is_online() {
            warn!("Dummy cannot connect while the primary connection is offline");
            return Err(TransportError::NotConnected(ConnectionId::Primary));
        }

        let message = self.connections[conn].connect();
        self.send(conn, &message, SendFlags::VITAL_FLUSH)
    }

    /// Drops `conn`; dropping the primary takes the dummy down with it
    pub fn disconnect(&mut self, conn: ConnectionId) {
        self.connections[conn].disconnect();
        self.controls[conn] = PlayerInput::default();
        if conn == ConnectionId::Primary {
            self.connections[ConnectionId::Dummy].disconnect();
            self.controls[ConnectionId::Dummy] = PlayerInput::default();
        }
        self.active = ConnectionId::Primary;
        self.dummy = DummyControl::default();
    }

    /// Switches which connection the player steers. Returns false while
    /// the dummy is offline.
    pub fn toggle_active_dummy(&mut self) -> bool {
        if !self.connections[ConnectionId::Dummy].is_online() {
            return false;
        }

        self.active = self.active.other();
        let inactive = self.active.other();
        match self.dummy_config.reset_on_switch {
            ResetOnSwitch::Off => {}
            ResetOnSwitch::Inactive => self.controls[inactive].reset_movement(),
            ResetOnSwitch::Active => self.controls[self.active].reset_movement(),
        }

        let fire = self.dummy.input.fire;
        self.dummy.input = self.controls[inactive];
        self.controls[self.active].fire = fire;

        info!("Now steering the {} connection", self.active);
        true
    }

    /// Makes the inactive connection fire once with its next input
    pub fn request_dummy_fire(&mut self) {
        if self.dummy.fire == 0 {
            self.dummy.fire = 1;
        }
    }

    /// Handles every datagram waiting on the transport. Returns how many
    /// were processed.
    pub fn pump_network(&mut self, hooks: &mut impl ClientHooks) -> Result<usize, TransportError> {
        let mut processed = 0;
        while let Some((data, conn)) = self.transport.try_receive() {
            processed += 1;
            let message = match SystemMessage::unpack(&data) {
                Ok(message) => message,
                Err(e) => {
                    debug!("[{}] Dropped malformed packet: {}", conn, e);
                    continue;
                }
            };

            let now = self.clock.now();
            match self.connections[conn].handle(now, &message) {
                Ok(Handled::Stored(tick)) => {
                    if let Some(snapshot) = self.connections[conn].history().get(tick) {
                        hooks.on_new_snapshot(conn, tick, snapshot);
                    }
                }
                Ok(Handled::PingRequest) => {
                    self.send(conn, &SystemMessage::PingReply, SendFlags::FLUSH)?;
                }
                Ok(Handled::PingReply(latency)) => {
                    debug!("[{}] Latency {}ms", conn, latency);
                }
                Ok(_) => {}
                Err(SyncError::CrcMismatch { .. }) => {}
                Err(e) => debug!("[{}] Dropped message {}: {}", conn, message.id(), e),
            }
        }
        Ok(processed)
    }

    /// Advances both connections to the current time, re-predicts where
    /// needed and sends inputs when due
    pub fn update(
        &mut self,
        source: &mut impl InputSource,
        hooks: &mut impl ClientHooks,
    ) -> Result<(), TransportError> {
        let now = self.clock.now();
        let mut input_due = false;

        for conn in [self.active, self.active.other()] {
            if !self.connections[conn].is_online() {
                continue;
            }

            let frame = self.connections[conn].update(now);
            if frame.new_snapshot || frame.pred_tick_advanced {
                let (connection, other) = self.connections.split_mut(conn);
                let partner = if other.prediction().is_valid() {
                    other.local_id().map(|id| (id, other.inputs()))
                } else {
                    None
                };
                if connection.predict(partner) {
                    let prediction = connection.prediction();
                    hooks.on_predicted_tick(
                        conn,
                        prediction.pred_tick(),
                        prediction.previous(),
                        prediction.current(),
                    );
                }
            }

            if (conn == self.active && frame.pred_tick_advanced)
                || self.connections[conn].force_input()
            {
                input_due = true;
            }
        }

        if input_due {
            self.send_inputs(source)?;
        }
        Ok(())
    }

    /// Samples and sends one input per online connection, active first
    pub fn send_inputs(&mut self, source: &mut impl InputSource) -> Result<(), TransportError> {
        let now = self.clock.now();
        let mut force = false;

        for conn in [self.active, self.active.other()] {
            if !self.connections[conn].is_online() {
                if conn == self.active {
                    continue;
                }
                break;
            }

            let input = if conn == self.active {
                let previous = self.controls[conn];
                source.sample(conn, &mut self.controls[conn]);
                if self.dummy_config.copy_moves {
                    self.dummy.copy_moves(&previous, &self.controls[conn]);
                }
                Some(self.controls[conn])
            } else {
                let force = force || self.connections[conn].force_input();
                self.next_dummy_input(force)
            };

            let Some(input) = input else {
                continue;
            };
            let Some(message) = self.connections[conn].make_input(now, input) else {
                continue;
            };
            self.send(conn, &message, SendFlags::FLUSH)?;

            // the inactive side must keep sending now and then or its
            // prediction clock resets
            if self.dummy_config.copy_moves || self.connections[conn].inputs().cursor() % 2 == 1 {
                force = true;
            }
        }
        Ok(())
    }

    fn next_dummy_input(&mut self, force: bool) -> Option<PlayerInput> {
        if !self.dummy_config.hammer {
            if self.dummy.fire != 0 {
                self.dummy.input.fire = (self.dummy.hammer_input.fire + 1) & !1;
                self.dummy.fire = 0;
            }

            let input = &self.dummy.input;
            if !force && input.direction == 0 && input.jump == 0 && input.hook == 0 {
                return None;
            }
            return Some(self.dummy.input);
        }

        if self.dummy.fire % HAMMER_INTERVAL != 0 {
            self.dummy.fire += 1;
            return None;
        }
        self.dummy.fire += 1;

        self.dummy.hammer_input.fire = (self.dummy.hammer_input.fire + 1) | 1;
        self.dummy.hammer_input.wanted_weapon = HAMMER_WEAPON;
        if !self.dummy_config.restore_weapon {
            self.dummy.input.wanted_weapon = HAMMER_WEAPON;
        }

        if let Some((main, dummy)) = self.hammer_positions() {
            let dir = main - dummy;
            self.dummy.hammer_input.target_x = dir.x as i32;
            self.dummy.hammer_input.target_y = dir.y as i32;
        }
        Some(self.dummy.hammer_input)
    }

    /// Predicted positions of the steered and the inactive character, as
    /// seen by the active connection
    fn hammer_positions(&self) -> Option<(Vec2, Vec2)> {
        let active = &self.connections[self.active];
        let inactive = &self.connections[self.active.other()];
        let world = active.prediction().current()?;
        let main = world.character(active.local_id()?)?.pos;
        let dummy = world.character(inactive.local_id()?)?.pos;
        Some((main, dummy))
    }

    /// Measures the round trip on the primary connection
    pub fn send_ping(&mut self) -> Result<(), TransportError> {
        let now = self.clock.now();
        let message = self.connections[ConnectionId::Primary].make_ping(now);
        self.send(ConnectionId::Primary, &message, SendFlags::FLUSH)
    }

    fn send(
        &mut self,
        conn: ConnectionId,
        message: &SystemMessage,
        flags: SendFlags,
    ) -> Result<(), TransportError> {
        self.transport
            .send(conn, &message.pack(), flags)
            .map_err(|e| {
                error!("[{}] Failed to send message {}: {}", conn, message.id(), e);
                e
            })
    }

    /// Input sent on `conn` for `tick`, or the latest one before it
    pub fn input_for_tick(&self, conn: ConnectionId, tick: i32) -> Option<&InputSample> {
        self.connections[conn].inputs().get_for_tick(tick)
    }

    pub fn active(&self) -> ConnectionId {
        self.active
    }

    pub fn connection(&self, conn: ConnectionId) -> &Connection {
        &self.connections[conn]
    }

    pub fn controls(&self, conn: ConnectionId) -> &PlayerInput {
        &self.controls[conn]
    }

    pub fn controls_mut(&mut self, conn: ConnectionId) -> &mut PlayerInput {
        &mut self.controls[conn]
    }

    pub fn dummy(&self) -> &DummyControl {
        &self.dummy
    }

    pub fn dummy_mut(&mut self) -> &mut DummyControl {
        &mut self.dummy
    }

    pub fn latency_ms(&self) -> Option<i64> {
        self.connections[ConnectionId::Primary].latency_ms()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }
}
