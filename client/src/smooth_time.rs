//! Jitter-tolerant mapping from wall time to game time.
//!
//! A [`ClockSmoother`] extrapolates a synthetic clock from the last point it
//! was anchored at and eases towards a moving target. The easing speed is a
//! per-direction gain that grows while the clock keeps running late and
//! decays back once it is on time. Isolated late samples (ping spikes) are
//! ignored until enough of them pile up to look like a real shift.

use crate::clock::TIME_FREQ;

/// Which gain a timing sample tunes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustDirection {
    /// Slowing the clock down
    Down,
    /// Speeding the clock up
    Up,
}

impl AdjustDirection {
    fn index(self) -> usize {
        match self {
            AdjustDirection::Down => 0,
            AdjustDirection::Up => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClockConfig {
    /// Gain of both directions after `init`
    pub initial_gain: f32,
    /// Floor the gain decays to while samples are on time
    pub min_gain: f32,
    pub max_gain: f32,
    /// Per-sample gain decay while on time
    pub gain_decay: f32,
    /// Errors below `-spike_threshold_ms` count as spikes
    pub spike_threshold_ms: i32,
    pub spike_step: i32,
    pub spike_cap: i32,
    /// Spikes are ignored while the counter is below this
    pub spike_tolerance: i32,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            initial_gain: 0.3,
            min_gain: 2.0,
            max_gain: 30.0,
            gain_decay: 0.95,
            spike_threshold_ms: 50,
            spike_step: 5,
            spike_cap: 50,
            spike_tolerance: 15,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClockSmoother {
    config: ClockConfig,
    snap: i64,
    current: i64,
    target: i64,
    /// Anchor of the margin easing, separate from `snap`
    snap_margin: i64,
    margin: i64,
    target_margin: i64,
    gains: [f32; 2],
    spike_counter: i32,
}

impl ClockSmoother {
    pub fn new(config: ClockConfig) -> Self {
        let gain = config.initial_gain;
        Self {
            config,
            snap: 0,
            current: 0,
            target: 0,
            snap_margin: 0,
            margin: 0,
            target_margin: 0,
            gains: [gain; 2],
            spike_counter: 0,
        }
    }

    /// Jumps straight to `target`, resetting gains and the spike counter
    pub fn init(&mut self, now: i64, target: i64) {
        self.snap = now;
        self.current = target;
        self.target = target;
        self.snap_margin = now;
        self.margin = 0;
        self.target_margin = 0;
        self.gains = [self.config.initial_gain; 2];
        self.spike_counter = 0;
    }

    /// Synthetic time at wall time `now`, margin included
    pub fn get(&self, now: i64) -> i64 {
        let elapsed = now - self.snap;
        let current = self.current + elapsed;
        let target = self.target + elapsed;

        let gain = if target > current {
            self.gains[AdjustDirection::Up.index()]
        } else {
            self.gains[AdjustDirection::Down.index()]
        };

        let blend = (elapsed as f64 / TIME_FREQ as f64 * f64::from(gain)).clamp(0.0, 1.0);
        current + ((target - current) as f64 * blend) as i64 + self.margin(now)
    }

    /// Margin at `now`, eased towards the target margin at a bounded rate
    pub fn margin(&self, now: i64) -> i64 {
        let passed = now - self.snap_margin;
        let diff = self.target_margin - self.margin;
        let blend = (passed as f64 / TIME_FREQ as f64).clamp(-1.0, 1.0);
        let limit = ((blend * diff.abs() as f64) as i64)
            .max(1 + passed / 100)
            .max(0);
        self.margin + diff.clamp(-limit, limit)
    }

    pub fn update_margin(&mut self, now: i64, target_margin: i64) {
        self.margin = self.margin(now);
        self.snap_margin = now;
        self.target_margin = target_margin;
    }

    /// Re-anchors at `now` and starts easing towards `target`, which is a
    /// reading with the margin included
    pub fn set_target(&mut self, now: i64, target: i64) {
        let margin = self.margin(now);
        self.current = self.get(now) - margin;
        self.snap = now;
        self.target = target - margin;
    }

    /// Feeds one timing sample. `error_ms` is how early the clock was
    /// (negative: late). Returns false when the sample was discarded as a spike.
    pub fn retarget(
        &mut self,
        now: i64,
        target: i64,
        error_ms: i32,
        direction: AdjustDirection,
    ) -> bool {
        let gain = &mut self.gains[direction.index()];

        if error_ms < 0 {
            let is_spike = error_ms < -self.config.spike_threshold_ms;
            if is_spike {
                self.spike_counter =
                    (self.spike_counter + self.config.spike_step).min(self.config.spike_cap);
            }

            if is_spike && self.spike_counter < self.config.spike_tolerance {
                return false;
            }

            *gain = (*gain * 2.0).min(self.config.max_gain);
        } else {
            if self.spike_counter > 0 {
                self.spike_counter -= 1;
            }
            *gain = (*gain * self.config.gain_decay).max(self.config.min_gain);
        }

        self.set_target(now, target);
        true
    }

    pub fn gain(&self, direction: AdjustDirection) -> f32 {
        self.gains[direction.index()]
    }

    pub fn set_gain(&mut self, direction: AdjustDirection, gain: f32) {
        self.gains[direction.index()] = gain;
    }

    pub fn spike_counter(&self) -> i32 {
        self.spike_counter
    }
}
