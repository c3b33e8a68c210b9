//! One full snapshot pipeline: fragments in, confirmed snapshots, clocks
//! and predicted worlds out.
//!
//! The primary and the dummy connection each own a [`Connection`]; nothing
//! in here is shared between the two.

use crate::clock::TIME_FREQ;
use crate::fragment::{FragmentAssembler, FragmentError};
use crate::history::SnapshotHistory;
use crate::input::{InputHistory, InputSample};
use crate::prediction::{tick_start, PredictionConfig, PredictionEngine, PredictionInputs};
use crate::smooth_time::{AdjustDirection, ClockConfig, ClockSmoother};
use log::{debug, info, warn};
use shared::physics::CollisionMap;
use shared::protocol::{self, SnapPart};
use shared::{ConnectionId, DecodeError, PlayerInput, Snapshot, SnapshotDelta, SystemMessage};
use std::sync::Arc;
use thiserror::Error;

/// Consecutive checksum failures that trigger a resync
pub const CRC_ERROR_LIMIT: i32 = 10;

/// Delta of a `SNAP_EMPTY`: nothing deleted, nothing changed
const EMPTY_DELTA: [i32; 3] = [0, 0, 0];

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Fragment(#[from] FragmentError),
    #[error("snapshot {tick} is older than tick {current}")]
    Stale { tick: i32, current: i32 },
    #[error("base snapshot {0} is not in history")]
    MissingBase(i32),
    #[error("failed to decode snapshot {tick}: {source}")]
    Decode {
        tick: i32,
        #[source]
        source: DecodeError,
    },
    #[error("checksum mismatch for snapshot {tick}: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch { tick: i32, expected: u32, actual: u32 },
    #[error("{0} is not connected")]
    Offline(ConnectionId),
}

/// What a handled message amounted to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// A part was stored, more are needed
    Incomplete,
    /// A snapshot was confirmed and stored for this tick
    Stored(i32),
    /// Input timing feedback; false when the sample was discarded
    Timing(bool),
    /// The server wants a `PING_REPLY`
    PingRequest,
    /// Round trip in milliseconds
    PingReply(i64),
    Ignored,
}

/// Result of one frame update
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameUpdate {
    /// The snapshot cursors moved
    pub new_snapshot: bool,
    /// The predicted tick advanced; an input is due
    pub pred_tick_advanced: bool,
}

enum Payload<'a> {
    Empty,
    Delta { data: &'a [u8], crc: u32 },
}

#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    online: bool,
    assembler: FragmentAssembler,
    delta: SnapshotDelta,
    history: SnapshotHistory,
    game_time: ClockSmoother,
    prediction: PredictionEngine,
    inputs: InputHistory,
    ack_tick: i32,
    current_recv_tick: i32,
    received_snapshots: u32,
    first_tick: i32,
    crc_errors: i32,
    resyncs: u32,
    force_input: bool,
    local_id: Option<usize>,
    intra_tick: f32,
    ping_sent_at: Option<i64>,
    latency_ms: Option<i64>,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        clock: ClockConfig,
        prediction: PredictionConfig,
        collision: Arc<CollisionMap>,
    ) -> Self {
        Self {
            id,
            online: false,
            assembler: FragmentAssembler::new(),
            delta: SnapshotDelta::new(),
            history: SnapshotHistory::new(),
            game_time: ClockSmoother::new(clock),
            prediction: PredictionEngine::new(prediction, collision),
            inputs: InputHistory::new(),
            ack_tick: -1,
            current_recv_tick: 0,
            received_snapshots: 0,
            first_tick: 0,
            crc_errors: 0,
            resyncs: 0,
            force_input: false,
            local_id: None,
            intra_tick: 0.0,
            ping_sent_at: None,
            latency_ms: None,
        }
    }

    /// Starts a fresh session and returns the message announcing it
    pub fn connect(&mut self) -> SystemMessage {
        self.reset();
        self.online = true;
        self.prediction.start();
        info!("[{}] Entering game", self.id);
        SystemMessage::EnterGame
    }

    /// Discards all derived state
    pub fn disconnect(&mut self) {
        if self.online {
            info!("[{}] Disconnected", self.id);
        }
        self.reset();
    }

    fn reset(&mut self) {
        self.online = false;
        self.assembler.reset();
        self.delta.reset_stats();
        self.history.purge_all();
        self.prediction.stop();
        self.inputs.clear();
        self.ack_tick = -1;
        self.current_recv_tick = 0;
        self.received_snapshots = 0;
        self.first_tick = 0;
        self.crc_errors = 0;
        self.force_input = false;
        self.local_id = None;
        self.intra_tick = 0.0;
        self.ping_sent_at = None;
        self.latency_ms = None;
    }

    pub fn handle(&mut self, now: i64, message: &SystemMessage) -> Result<Handled, SyncError> {
        if !self.online {
            return Err(SyncError::Offline(self.id));
        }

        match message {
            SystemMessage::Snap(part) => self.on_snap_part(now, part),
            SystemMessage::SnapEmpty { tick, delta_tick } => {
                self.check_recv_tick(*tick)?;
                self.store(now, *tick, *delta_tick, Payload::Empty)
            }
            SystemMessage::InputTiming {
                intended_tick,
                time_left_ms,
            } => {
                let Some(sample) = self.inputs.find_exact(*intended_tick).copied() else {
                    debug!(
                        "[{}] Input timing for unknown tick {}",
                        self.id, intended_tick
                    );
                    return Ok(Handled::Ignored);
                };
                let applied = self.prediction.on_input_timing(now, &sample, *time_left_ms);
                Ok(Handled::Timing(applied))
            }
            SystemMessage::Ping => Ok(Handled::PingRequest),
            SystemMessage::PingReply => match self.ping_sent_at.take() {
                Some(sent_at) => {
                    let latency = (now - sent_at) * 1000 / TIME_FREQ;
                    self.latency_ms = Some(latency);
                    Ok(Handled::PingReply(latency))
                }
                None => Ok(Handled::Ignored),
            },
            SystemMessage::EnterGame | SystemMessage::Input { .. } => Ok(Handled::Ignored),
        }
    }

    fn check_recv_tick(&mut self, tick: i32) -> Result<(), SyncError> {
        if tick < self.current_recv_tick || tick <= self.ack_tick {
            return Err(SyncError::Stale {
                tick,
                current: self.current_recv_tick.max(self.ack_tick),
            });
        }
        self.current_recv_tick = tick;
        Ok(())
    }

    fn on_snap_part(&mut self, now: i64, part: &SnapPart) -> Result<Handled, SyncError> {
        self.check_recv_tick(part.tick)?;

        let Some(complete) = self
            .assembler
            .accept(part.tick, part.part, part.num_parts, &part.data)?
        else {
            return Ok(Handled::Incomplete);
        };

        self.store(
            now,
            complete.tick,
            part.delta_tick,
            Payload::Delta {
                data: &complete.data,
                crc: part.crc,
            },
        )
    }

    fn store(
        &mut self,
        now: i64,
        tick: i32,
        delta_tick: i32,
        payload: Payload<'_>,
    ) -> Result<Handled, SyncError> {
        let empty = Snapshot::empty();
        let base = if delta_tick < 0 {
            &empty
        } else {
            match self.history.get(delta_tick) {
                Some(base) => base,
                None => {
                    debug!(
                        "[{}] Dropped snapshot {}: base {} missing",
                        self.id, tick, delta_tick
                    );
                    self.ack_tick = -1;
                    self.force_input = true;
                    return Err(SyncError::MissingBase(delta_tick));
                }
            }
        };

        let (decoded, expected_crc) = match payload {
            Payload::Empty => (self.delta.apply(base, &EMPTY_DELTA), None),
            Payload::Delta { data, crc } => (self.delta.decode(base, data), Some(crc)),
        };
        let snapshot = decoded.map_err(|source| {
            debug!("[{}] Failed to decode snapshot {}: {}", self.id, tick, source);
            SyncError::Decode { tick, source }
        })?;

        if let Some(expected) = expected_crc {
            let actual = snapshot.crc();
            if actual != expected {
                self.crc_errors += 1;
                warn!(
                    "[{}] Snapshot {} checksum mismatch ({} in a row)",
                    self.id, tick, self.crc_errors
                );
                if self.crc_errors >= CRC_ERROR_LIMIT {
                    self.resync();
                    self.crc_errors = 0;
                }
                return Err(SyncError::CrcMismatch {
                    tick,
                    expected,
                    actual,
                });
            }
            if self.crc_errors > 0 {
                self.crc_errors -= 1;
            }
        }

        if let Some(local_id) = protocol::local_client_id(&snapshot) {
            self.local_id = Some(local_id);
        }

        // a keyframe needs no base, so everything the cursors do not hold goes
        let purge_tick = if delta_tick < 0 { tick } else { delta_tick };
        self.history.purge_until(purge_tick);
        self.history.add(tick, now, snapshot);
        self.received_snapshots += 1;
        if self.received_snapshots == 1 {
            self.first_tick = tick;
        }

        self.prediction
            .on_snapshot_stored(now, self.received_snapshots, self.first_tick);
        if self.received_snapshots == 2 {
            self.game_time.init(now, tick_start(self.first_tick));
            self.history.reset_cursors();
            info!("[{}] Synchronised at tick {}", self.id, self.first_tick);
        } else if self.received_snapshots > 2 {
            let time_left_ms =
                ((tick_start(tick) - self.game_time.get(now)) * 1000 / TIME_FREQ) as i32;
            self.game_time.retarget(
                now,
                tick_start(tick - 1),
                time_left_ms,
                AdjustDirection::Down,
            );
        }

        self.ack_tick = tick;
        Ok(Handled::Stored(tick))
    }

    /// Asks the server for a keyframe with the next input
    pub fn resync(&mut self) {
        warn!("[{}] Requesting full snapshot", self.id);
        self.ack_tick = -1;
        self.force_input = true;
        self.resyncs += 1;
    }

    /// Advances the snapshot cursors and the prediction clock to `now`
    pub fn update(&mut self, now: i64) -> FrameUpdate {
        let mut frame = FrameUpdate::default();
        if !self.online || self.received_snapshots < 2 {
            return frame;
        }

        let game_now = self.game_time.get(now);
        while let Some(current) = self.history.current() {
            if tick_start(current.tick) >= game_now || !self.history.advance_cursors() {
                break;
            }
            frame.new_snapshot = true;
        }

        if let (Some(previous), Some(current)) = (self.history.previous(), self.history.current()) {
            let previous_start = tick_start(previous.tick);
            let span = tick_start(current.tick) - previous_start;
            if span > 0 {
                self.intra_tick = (game_now - previous_start) as f32 / span as f32;
            }
        }

        if frame.new_snapshot {
            self.detect_strong_hooks();
        }

        frame.pred_tick_advanced = self.prediction.advance(now, self.current_tick());
        frame
    }

    fn detect_strong_hooks(&mut self) {
        if let (Some(previous), Some(current)) = (self.history.previous(), self.history.current()) {
            self.prediction.detect_strong_hooks(
                &previous.snapshot,
                previous.tick,
                &current.snapshot,
                current.tick,
                self.local_id,
            );
        }
    }

    /// Replays from the current confirmed snapshot up to the predicted tick
    pub fn predict(&mut self, partner: Option<(usize, &InputHistory)>) -> bool {
        let Some(current) = self.history.current() else {
            return false;
        };
        let inputs = PredictionInputs {
            local_id: self.local_id,
            local: &self.inputs,
            partner,
        };
        self.prediction
            .predict(&current.snapshot, current.tick, &inputs)
    }

    /// Records `input` for the predicted tick and builds the `INPUT` message
    pub fn make_input(&mut self, now: i64, input: PlayerInput) -> Option<SystemMessage> {
        let tick = self.prediction.pred_tick();
        if !self.online || tick <= 0 {
            return None;
        }

        self.inputs.push(InputSample {
            tick,
            input,
            sent_at: now,
            predicted_time: self.prediction.predicted_time(now),
            margin: self.prediction.margin(now),
        });
        self.force_input = false;

        Some(SystemMessage::Input {
            ack_tick: self.ack_tick,
            predicted_tick: tick,
            input,
        })
    }

    pub fn make_ping(&mut self, now: i64) -> SystemMessage {
        self.ping_sent_at = Some(now);
        SystemMessage::Ping
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn history(&self) -> &SnapshotHistory {
        &self.history
    }

    pub fn prediction(&self) -> &PredictionEngine {
        &self.prediction
    }

    pub fn inputs(&self) -> &InputHistory {
        &self.inputs
    }

    pub fn delta_stats(&self) -> &SnapshotDelta {
        &self.delta
    }

    pub fn game_time(&self, now: i64) -> i64 {
        self.game_time.get(now)
    }

    /// Last stored tick, or -1 while waiting for a keyframe
    pub fn ack_tick(&self) -> i32 {
        self.ack_tick
    }

    /// Tick of the current interpolation cursor
    pub fn current_tick(&self) -> i32 {
        self.history.current().map_or(0, |holder| holder.tick)
    }

    pub fn previous_tick(&self) -> i32 {
        self.history.previous().map_or(0, |holder| holder.tick)
    }

    pub fn received_snapshots(&self) -> u32 {
        self.received_snapshots
    }

    pub fn crc_errors(&self) -> i32 {
        self.crc_errors
    }

    pub fn resyncs(&self) -> u32 {
        self.resyncs
    }

    /// An input should go out even if nothing changed
    pub fn force_input(&self) -> bool {
        self.force_input
    }

    pub fn local_id(&self) -> Option<usize> {
        self.local_id
    }

    /// Progress between the previous and current snapshot, for interpolation
    pub fn intra_tick(&self) -> f32 {
        self.intra_tick
    }

    pub fn pred_intra_tick(&self) -> f32 {
        self.prediction.intra_tick()
    }

    pub fn latency_ms(&self) -> Option<i64> {
        self.latency_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::millis;
    use shared::protocol::{NetPlayerInfo, OBJ_PLAYER_INFO};
    use shared::SnapshotBuilder;

    fn connection() -> Connection {
        let mut connection = Connection::new(
            ConnectionId::Primary,
            ClockConfig::default(),
            PredictionConfig::default(),
            Arc::new(CollisionMap::arena(30, 12)),
        );
        connection.connect();
        connection
    }

    fn world(tick: i32) -> Snapshot {
        let mut builder = SnapshotBuilder::new();
        let info = NetPlayerInfo {
            local: true,
            client_id: 4,
            team: 0,
            score: tick,
            latency: 0,
        };
        builder.add_item(OBJ_PLAYER_INFO, 4, &info.to_ints()).unwrap();
        builder.finish()
    }

    fn keyframe(tick: i32, snapshot: &Snapshot) -> SystemMessage {
        SystemMessage::Snap(SnapPart {
            tick,
            delta_tick: -1,
            num_parts: 1,
            part: 0,
            crc: snapshot.crc(),
            data: SnapshotDelta::encode(&Snapshot::empty(), snapshot).unwrap(),
        })
    }

    fn delta(tick: i32, base_tick: i32, base: &Snapshot, snapshot: &Snapshot) -> SystemMessage {
        SystemMessage::Snap(SnapPart {
            tick,
            delta_tick: base_tick,
            num_parts: 1,
            part: 0,
            crc: snapshot.crc(),
            data: SnapshotDelta::encode(base, snapshot).unwrap(),
        })
    }

    #[test]
    fn test_keyframe_then_delta() {
        let mut connection = connection();
        let first = world(10);
        let second = world(11);

        assert_eq!(
            connection.handle(0, &keyframe(10, &first)).unwrap(),
            Handled::Stored(10)
        );
        assert_eq!(
            connection
                .handle(millis(20), &delta(11, 10, &first, &second))
                .unwrap(),
            Handled::Stored(11)
        );
        assert_eq!(connection.history().get(11), Some(&second));
        assert_eq!(connection.ack_tick(), 11);
        assert_eq!(connection.local_id(), Some(4));
        assert_eq!(
            connection.prediction().state(),
            crate::prediction::PredictionState::Predicting
        );
        assert_eq!(connection.current_tick(), 11);
        assert_eq!(connection.previous_tick(), 10);
    }

    #[test]
    fn test_keyframe_stream_stays_bounded() {
        let mut connection = connection();
        for tick in 1..=300 {
            let now = millis(i64::from(tick) * 20);
            connection.handle(now, &keyframe(tick, &world(tick))).unwrap();
            connection.update(now);
        }

        assert_eq!(connection.received_snapshots(), 300);
        assert!(connection.history().len() < 10);
        assert!(connection.history().get(300).is_some());
        assert!(connection.history().current().is_some());
    }

    #[test]
    fn test_snap_empty_repeats_base() {
        let mut connection = connection();
        let first = world(1);
        connection.handle(0, &keyframe(1, &first)).unwrap();
        let handled = connection
            .handle(0, &SystemMessage::SnapEmpty { tick: 2, delta_tick: 1 })
            .unwrap();
        assert_eq!(handled, Handled::Stored(2));
        assert_eq!(connection.history().get(2), Some(&first));
    }

    #[test]
    fn test_missing_base_forces_resync() {
        let mut connection = connection();
        for tick in [70, 75, 80] {
            connection.handle(0, &keyframe(tick, &world(tick))).unwrap();
        }
        let result = connection.handle(0, &delta(81, 77, &world(77), &world(81)));
        assert!(matches!(result, Err(SyncError::MissingBase(77))));
        assert_eq!(connection.ack_tick(), -1);
        assert!(connection.force_input());
    }

    #[test]
    fn test_crc_errors_resync_once() {
        let mut connection = connection();
        for tick in 10..20 {
            let snapshot = world(tick);
            let mut message = keyframe(tick, &snapshot);
            if let SystemMessage::Snap(part) = &mut message {
                part.crc ^= 1;
            }
            let result = connection.handle(0, &message);
            assert!(matches!(result, Err(SyncError::CrcMismatch { .. })));
            if tick < 19 {
                assert_eq!(connection.resyncs(), 0);
                assert_eq!(connection.crc_errors(), tick - 9);
            }
        }
        assert_eq!(connection.resyncs(), 1);
        assert_eq!(connection.crc_errors(), 0);
        assert!(connection.history().is_empty());
    }

    #[test]
    fn test_successful_snapshot_decrements_crc_errors() {
        let mut connection = connection();
        let mut bad = keyframe(1, &world(1));
        if let SystemMessage::Snap(part) = &mut bad {
            part.crc = part.crc.wrapping_add(7);
        }
        assert!(connection.handle(0, &bad).is_err());
        assert_eq!(connection.crc_errors(), 1);
        connection.handle(0, &keyframe(2, &world(2))).unwrap();
        assert_eq!(connection.crc_errors(), 0);
    }

    #[test]
    fn test_stale_snapshots_are_dropped() {
        let mut connection = connection();
        connection.handle(0, &keyframe(5, &world(5))).unwrap();
        assert!(matches!(
            connection.handle(0, &keyframe(5, &world(5))),
            Err(SyncError::Stale { tick: 5, .. })
        ));
        assert!(matches!(
            connection.handle(0, &keyframe(4, &world(4))),
            Err(SyncError::Stale { tick: 4, .. })
        ));
    }

    #[test]
    fn test_offline_connection_rejects_messages() {
        let mut connection = connection();
        connection.disconnect();
        assert!(matches!(
            connection.handle(0, &SystemMessage::Ping),
            Err(SyncError::Offline(ConnectionId::Primary))
        ));
    }

    #[test]
    fn test_first_prediction_tick() {
        let mut connection = connection();
        connection.handle(0, &keyframe(100, &world(100))).unwrap();
        connection
            .handle(0, &delta(101, 100, &world(100), &world(101)))
            .unwrap();
        assert_eq!(
            connection.prediction().predicted_time(0) - connection.prediction().margin(0),
            tick_start(100)
        );

        let frame = connection.update(millis(16));
        assert!(frame.pred_tick_advanced);
        let pred_tick = connection.prediction().pred_tick();
        assert!((101..=102).contains(&pred_tick));
    }

    #[test]
    fn test_cursors_follow_game_time() {
        let mut connection = connection();
        connection.handle(0, &keyframe(1, &world(1))).unwrap();
        connection.handle(0, &keyframe(2, &world(2))).unwrap();
        connection.handle(millis(20), &keyframe(3, &world(3))).unwrap();

        let frame = connection.update(millis(30));
        assert!(frame.new_snapshot);
        assert_eq!(connection.current_tick(), 3);
        assert_eq!(connection.previous_tick(), 2);
        assert!(connection.intra_tick() >= 0.0);
    }

    #[test]
    fn test_input_history_and_timing() {
        let mut connection = connection();
        assert!(connection.make_input(0, PlayerInput::default()).is_none());

        connection.handle(0, &keyframe(100, &world(100))).unwrap();
        connection.handle(0, &keyframe(101, &world(101))).unwrap();
        connection.update(millis(16));

        let message = connection
            .make_input(millis(16), PlayerInput::default())
            .unwrap();
        let SystemMessage::Input {
            ack_tick,
            predicted_tick,
            ..
        } = message
        else {
            panic!("expected an input message");
        };
        assert_eq!(ack_tick, 101);
        assert_eq!(predicted_tick, connection.prediction().pred_tick());
        assert_eq!(connection.inputs().len(), 1);

        let timing = SystemMessage::InputTiming {
            intended_tick: predicted_tick,
            time_left_ms: 20,
        };
        assert_eq!(
            connection.handle(millis(40), &timing).unwrap(),
            Handled::Timing(true)
        );
        let unknown = SystemMessage::InputTiming {
            intended_tick: 5,
            time_left_ms: 20,
        };
        assert_eq!(connection.handle(millis(40), &unknown).unwrap(), Handled::Ignored);
    }

    #[test]
    fn test_ping_measures_latency() {
        let mut connection = connection();
        assert_eq!(connection.make_ping(millis(100)), SystemMessage::Ping);
        assert_eq!(
            connection.handle(millis(142), &SystemMessage::PingReply).unwrap(),
            Handled::PingReply(42)
        );
        assert_eq!(connection.latency_ms(), Some(42));
        assert_eq!(
            connection.handle(millis(150), &SystemMessage::PingReply).unwrap(),
            Handled::Ignored
        );
    }
}
