//! Client-side prediction.
//!
//! The engine runs its own smoothed clock that stays a little ahead of the
//! server, so inputs arrive just before the tick they are meant for. Every
//! time that clock reaches a new tick (or a new snapshot is confirmed) the
//! world is rebuilt from the latest confirmed snapshot and replayed forward
//! to the predicted tick with the inputs that were sent for each tick.
//!
//! ## Simulation order
//!
//! When two characters hook each other the result depends on which one is
//! simulated first. The server's order is not sent, so it is inferred: the
//! previous confirmed interval is re-simulated in both orders and the order
//! that reproduces the confirmed velocity wins. A verdict only changes the
//! order after it has repeated `strong_hook_threshold` times in a row.

use crate::clock::{millis, TIME_FREQ};
use crate::input::{InputHistory, InputSample};
use crate::smooth_time::{AdjustDirection, ClockConfig, ClockSmoother};
use log::{debug, info, warn};
use shared::physics::{CharacterCore, CollisionMap, TuningParams, WorldCore};
use shared::protocol::{self, NetCharacter};
use shared::{PlayerInput, Snapshot, MAX_CLIENTS, SERVER_TICK_SPEED};
use std::collections::HashMap;
use std::sync::Arc;

pub fn tick_duration() -> i64 {
    TIME_FREQ / i64::from(SERVER_TICK_SPEED)
}

/// Wall-clock offset at which `tick` begins
pub fn tick_start(tick: i32) -> i64 {
    i64::from(tick) * TIME_FREQ / i64::from(SERVER_TICK_SPEED)
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredictionConfig {
    pub tuning: TuningParams,
    pub clock: ClockConfig,
    /// How far ahead of the server the prediction clock aims to be
    pub margin_ms: i64,
    /// Speed-up gain right after the clock starts
    pub catch_up_gain: f32,
    pub strong_hook_threshold: i32,
    /// Velocity error below which an order counts as matching the server
    pub strong_hook_low: f32,
    /// Velocity error above which an order counts as wrong
    pub strong_hook_high: f32,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            tuning: TuningParams::default(),
            clock: ClockConfig::default(),
            margin_ms: 10,
            catch_up_gain: 1000.0,
            strong_hook_threshold: 3,
            strong_hook_low: 0.0001,
            strong_hook_high: 0.07,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionState {
    Idle,
    /// Waiting for the first two confirmed snapshots
    Priming,
    Predicting,
}

/// Order characters are simulated in. Strong characters go last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharOrder {
    ids: Vec<usize>,
}

impl CharOrder {
    pub fn new() -> Self {
        Self {
            ids: (0..MAX_CLIENTS).collect(),
        }
    }

    pub fn give_strong(&mut self, id: usize) {
        if id < MAX_CLIENTS {
            self.ids.retain(|&other| other != id);
            self.ids.push(id);
        }
    }

    pub fn give_weak(&mut self, id: usize) {
        if id < MAX_CLIENTS {
            self.ids.retain(|&other| other != id);
            self.ids.insert(0, id);
        }
    }

    /// Whether `a` is simulated after `b`
    pub fn is_stronger(&self, a: usize, b: usize) -> bool {
        let position = |id| self.ids.iter().position(|&other| other == id);
        matches!((position(a), position(b)), (Some(a), Some(b)) if a > b)
    }

    /// The subset of `active` in simulation order
    pub fn order_for(&self, active: &[usize]) -> Vec<usize> {
        self.ids
            .iter()
            .copied()
            .filter(|id| active.contains(id))
            .collect()
    }
}

impl Default for CharOrder {
    fn default() -> Self {
        Self::new()
    }
}

/// Where the replay takes each character's input from
#[derive(Debug, Clone, Copy)]
pub struct PredictionInputs<'a> {
    pub local_id: Option<usize>,
    pub local: &'a InputHistory,
    /// Character and inputs of the other connection, while its prediction is valid
    pub partner: Option<(usize, &'a InputHistory)>,
}

impl PredictionInputs<'_> {
    /// The local character always gets an input; others only if one was sent
    pub fn input_for(&self, id: usize, tick: i32) -> Option<PlayerInput> {
        if self.local_id == Some(id) {
            return Some(
                self.local
                    .get_for_tick(tick)
                    .map(|sample| sample.input)
                    .unwrap_or_default(),
            );
        }
        match self.partner {
            Some((partner_id, history)) if partner_id == id => {
                history.get_for_tick(tick).map(|sample| sample.input)
            }
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct PredictionEngine {
    config: PredictionConfig,
    collision: Arc<CollisionMap>,
    state: PredictionState,
    clock: ClockSmoother,
    pred_tick: i32,
    intra_tick: f32,
    char_order: CharOrder,
    hook_evidence: HashMap<(usize, usize), i32>,
    last_hook_check: Vec<i32>,
    previous: Option<WorldCore>,
    current: Option<WorldCore>,
    resets: u32,
}

impl PredictionEngine {
    pub fn new(config: PredictionConfig, collision: Arc<CollisionMap>) -> Self {
        let clock = ClockSmoother::new(config.clock.clone());
        Self {
            config,
            collision,
            state: PredictionState::Idle,
            clock,
            pred_tick: 0,
            intra_tick: 0.0,
            char_order: CharOrder::new(),
            hook_evidence: HashMap::new(),
            last_hook_check: vec![i32::MIN / 2; MAX_CLIENTS],
            previous: None,
            current: None,
            resets: 0,
        }
    }

    /// Forgets everything and waits for two fresh snapshots
    pub fn start(&mut self) {
        self.clear();
        self.state = PredictionState::Priming;
    }

    pub fn stop(&mut self) {
        self.clear();
        self.state = PredictionState::Idle;
    }

    fn clear(&mut self) {
        self.pred_tick = 0;
        self.intra_tick = 0.0;
        self.char_order = CharOrder::new();
        self.hook_evidence.clear();
        self.last_hook_check.iter_mut().for_each(|tick| *tick = i32::MIN / 2);
        self.previous = None;
        self.current = None;
    }

    /// Called after each stored snapshot with the running count
    pub fn on_snapshot_stored(&mut self, now: i64, received: u32, first_tick: i32) {
        if self.state != PredictionState::Priming || received != 2 {
            return;
        }

        self.clock.init(now, tick_start(first_tick));
        self.clock
            .set_gain(AdjustDirection::Up, self.config.catch_up_gain);
        self.clock.update_margin(now, millis(self.config.margin_ms));
        self.state = PredictionState::Predicting;
        info!("Prediction started from tick {}", first_tick);
    }

    /// Server feedback on how early the input sent for `sample.tick` arrived
    pub fn on_input_timing(&mut self, now: i64, sample: &InputSample, time_left_ms: i32) -> bool {
        if self.state != PredictionState::Predicting {
            return false;
        }
        let target = sample.predicted_time + (now - sample.sent_at)
            - millis(i64::from(time_left_ms))
            + sample.margin;
        self.clock
            .retarget(now, target, time_left_ms, AdjustDirection::Up)
    }

    fn max_latency_ticks(&self) -> i32 {
        SERVER_TICK_SPEED + (self.config.margin_ms as i32 * SERVER_TICK_SPEED) / 1000
    }

    /// Moves the prediction clock to `now`. Returns true when the predicted
    /// tick advanced, which is when a new input is due.
    pub fn advance(&mut self, now: i64, confirmed_tick: i32) -> bool {
        if self.state != PredictionState::Predicting {
            return false;
        }
        self.clock.update_margin(now, millis(self.config.margin_ms));

        let pred_now = self.clock.get(now);
        let prev_pred_tick = (pred_now * i64::from(SERVER_TICK_SPEED) / TIME_FREQ) as i32;
        let new_pred_tick = prev_pred_tick + 1;
        self.intra_tick = (pred_now - tick_start(prev_pred_tick)) as f32 / tick_duration() as f32;

        if (new_pred_tick - confirmed_tick).abs() > self.max_latency_ticks() {
            warn!(
                "Prediction time reset: predicted tick {} is too far from confirmed tick {}",
                new_pred_tick, confirmed_tick
            );
            self.clock.init(now, tick_start(confirmed_tick));
            self.clock.update_margin(now, millis(self.config.margin_ms));
            self.resets += 1;
            self.pred_tick = confirmed_tick + 1;
            self.intra_tick = 0.0;
            return true;
        }

        if new_pred_tick > self.pred_tick {
            self.pred_tick = new_pred_tick;
            return true;
        }
        false
    }

    fn world_from_snapshot(&self, snapshot: &Snapshot, tick: i32) -> WorldCore {
        let mut world = WorldCore::new(self.config.tuning.clone(), Arc::clone(&self.collision));
        world.tick = tick;
        for (id, character) in protocol::characters(snapshot) {
            world.insert_character(id, CharacterCore::from_net(&character));
        }
        world
    }

    /// Rebuilds the predicted worlds from the confirmed snapshot. Returns
    /// false when the predicted tick is not in a sane range to replay.
    pub fn predict(
        &mut self,
        confirmed: &Snapshot,
        confirmed_tick: i32,
        inputs: &PredictionInputs<'_>,
    ) -> bool {
        if self.state != PredictionState::Predicting {
            return false;
        }
        if self.pred_tick <= confirmed_tick
            || self.pred_tick >= confirmed_tick + self.max_latency_ticks()
        {
            return false;
        }

        let mut world = self.world_from_snapshot(confirmed, confirmed_tick);
        let order = self.char_order.order_for(&world.active_ids());
        let mut has_input = vec![false; MAX_CLIENTS];

        for tick in confirmed_tick + 1..=self.pred_tick {
            if tick == self.pred_tick {
                self.previous = Some(world.clone());
            }

            for &id in &order {
                has_input[id] = false;
                if let Some(input) = inputs.input_for(id, tick) {
                    if let Some(core) = world.character_mut(id) {
                        core.input = input;
                        has_input[id] = true;
                    }
                }
            }

            world.step(&order, |id| has_input[id]);
        }

        self.current = Some(world);
        true
    }

    /// Infers hook strength between characters from the last confirmed interval
    pub fn detect_strong_hooks(
        &mut self,
        previous: &Snapshot,
        previous_tick: i32,
        current: &Snapshot,
        current_tick: i32,
        local_id: Option<usize>,
    ) {
        let prev_chars: HashMap<usize, NetCharacter> =
            protocol::characters(previous).into_iter().collect();
        let cur_chars: HashMap<usize, NetCharacter> =
            protocol::characters(current).into_iter().collect();

        let mut ids: Vec<usize> = cur_chars.keys().copied().collect();
        ids.sort_unstable();

        for from in ids {
            let (Some(from_prev), Some(from_cur)) = (prev_chars.get(&from), cur_chars.get(&from))
            else {
                continue;
            };
            let Ok(to) = usize::try_from(from_prev.core.hooked_player) else {
                continue;
            };
            if to >= MAX_CLIENTS || from_cur.core.hooked_player != from_prev.core.hooked_player {
                continue;
            }
            let (Some(to_prev), Some(to_cur)) = (prev_chars.get(&to), cur_chars.get(&to)) else {
                continue;
            };

            let last_check = self.last_hook_check[to].min(self.last_hook_check[from]);
            if (last_check - current_tick).abs() < SERVER_TICK_SPEED / 4 {
                continue;
            }
            if from_prev.core.direction != from_cur.core.direction
                || to_prev.core.direction != to_cur.core.direction
            {
                continue;
            }

            self.last_hook_check[to] = current_tick;
            self.last_hook_check[from] = current_tick;

            let target_vel = CharacterCore::from_net(to_cur).vel;
            let mut errors = [f32::MAX; 2];
            for (dir, error) in errors.iter_mut().enumerate() {
                let mut world =
                    WorldCore::new(self.config.tuning.clone(), Arc::clone(&self.collision));
                world.insert_character(from, CharacterCore::from_net(from_prev));
                world.insert_character(to, CharacterCore::from_net(to_prev));
                let order = if dir == 0 { [from, to] } else { [to, from] };

                for _ in previous_tick..current_tick {
                    world.tick_character(order[0], false);
                    world.tick_character(order[1], false);
                    for id in [from, to] {
                        world.move_character(id);
                        if let Some(core) = world.character_mut(id) {
                            core.quantize();
                        }
                    }
                }

                if let Some(core) = world.character(to) {
                    *error = core.vel.distance(target_vel);
                }
            }

            self.record_hook_evidence(from, to, errors, local_id);
        }
    }

    /// `errors[0]`: hooker simulated first. `errors[1]`: hooked simulated first.
    fn record_hook_evidence(
        &mut self,
        from: usize,
        to: usize,
        errors: [f32; 2],
        local_id: Option<usize>,
    ) {
        let low = self.config.strong_hook_low;
        let high = self.config.strong_hook_high;
        let to_first = errors[1] < low && errors[0] > high;
        let from_first = errors[0] < low && errors[1] > high;

        let evidence = self.hook_evidence.entry((from, to)).or_insert(0);
        if to_first && self.char_order.is_stronger(to, from) {
            *evidence = (*evidence).max(0) + 1;
        } else if from_first && self.char_order.is_stronger(from, to) {
            *evidence = (*evidence).min(0) - 1;
        } else {
            *evidence = 0;
            return;
        }

        if evidence.abs() < self.config.strong_hook_threshold {
            return;
        }

        let to_first = *evidence > 0;
        *evidence = 0;
        let to_is_local = local_id == Some(to);
        match (to_first, to_is_local) {
            (true, false) => self.char_order.give_weak(to),
            (true, true) => self.char_order.give_strong(from),
            (false, false) => self.char_order.give_strong(to),
            (false, true) => self.char_order.give_weak(from),
        }
        debug!(
            "Simulation order changed for hook {} -> {}: {}",
            from,
            to,
            if to_first { "hooked first" } else { "hooker first" }
        );
    }

    pub fn state(&self) -> PredictionState {
        self.state
    }

    /// True once predicting with a usable tick
    pub fn is_valid(&self) -> bool {
        self.state == PredictionState::Predicting && self.pred_tick > 0
    }

    pub fn pred_tick(&self) -> i32 {
        self.pred_tick
    }

    /// Progress through the current predicted tick, 0 to 1
    pub fn intra_tick(&self) -> f32 {
        self.intra_tick
    }

    /// Prediction clock reading at `now`
    pub fn predicted_time(&self, now: i64) -> i64 {
        self.clock.get(now)
    }

    pub fn margin(&self, now: i64) -> i64 {
        self.clock.margin(now)
    }

    pub fn clock(&self) -> &ClockSmoother {
        &self.clock
    }

    pub fn char_order(&self) -> &CharOrder {
        &self.char_order
    }

    /// Predicted world one tick before `current`
    pub fn previous(&self) -> Option<&WorldCore> {
        self.previous.as_ref()
    }

    pub fn current(&self) -> Option<&WorldCore> {
        self.current.as_ref()
    }

    /// How often the clock had to be re-initialised
    pub fn resets(&self) -> u32 {
        self.resets
    }
}
