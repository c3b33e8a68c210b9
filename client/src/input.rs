//! Ring of sent inputs, looked up by tick for prediction replay

use shared::PlayerInput;

/// Inputs remembered per connection
pub const INPUT_HISTORY_SIZE: usize = 200;

/// One input as it was sent to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSample {
    /// Predicted tick the input was generated for
    pub tick: i32,
    pub input: PlayerInput,
    /// Wall time of sending
    pub sent_at: i64,
    /// Prediction clock reading at send time
    pub predicted_time: i64,
    /// Prediction margin in effect at send time
    pub margin: i64,
}

/// Fixed-size ring of sent inputs, indexed by position rather than tick
#[derive(Debug, Clone)]
pub struct InputHistory {
    samples: Vec<Option<InputSample>>,
    cursor: usize,
}

impl InputHistory {
    pub fn new() -> Self {
        Self {
            samples: vec![None; INPUT_HISTORY_SIZE],
            cursor: 0,
        }
    }

    /// Stores a sample over the oldest one and returns the new write position
    pub fn push(&mut self, sample: InputSample) -> usize {
        self.samples[self.cursor] = Some(sample);
        self.cursor = (self.cursor + 1) % INPUT_HISTORY_SIZE;
        self.cursor
    }

    /// Position the next sample will be written to
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn latest(&self) -> Option<&InputSample> {
        let index = (self.cursor + INPUT_HISTORY_SIZE - 1) % INPUT_HISTORY_SIZE;
        self.samples[index].as_ref()
    }

    /// Most recent sample generated for a tick at or before `tick`
    pub fn get_for_tick(&self, tick: i32) -> Option<&InputSample> {
        self.samples
            .iter()
            .flatten()
            .filter(|sample| sample.tick <= tick)
            .max_by_key(|sample| sample.tick)
    }

    /// Sample generated for exactly `tick`
    pub fn find_exact(&self, tick: i32) -> Option<&InputSample> {
        self.samples.iter().flatten().find(|sample| sample.tick == tick)
    }

    pub fn len(&self) -> usize {
        self.samples.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.iter().all(Option::is_none)
    }

    pub fn clear(&mut self) {
        self.samples.iter_mut().for_each(|sample| *sample = None);
        self.cursor = 0;
    }
}

impl Default for InputHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(tick: i32, direction: i32) -> InputSample {
        InputSample {
            tick,
            input: PlayerInput {
                direction,
                ..PlayerInput::default()
            },
            sent_at: i64::from(tick) * 10,
            predicted_time: 0,
            margin: 0,
        }
    }

    #[test]
    fn test_lookup_picks_newest_at_or_before_tick() {
        let mut history = InputHistory::new();
        history.push(sample(10, 1));
        history.push(sample(12, -1));
        history.push(sample(15, 1));

        assert_eq!(history.get_for_tick(14).map(|s| s.tick), Some(12));
        assert_eq!(history.get_for_tick(15).map(|s| s.tick), Some(15));
        assert_eq!(history.get_for_tick(100).map(|s| s.tick), Some(15));
        assert!(history.get_for_tick(9).is_none());
        assert!(history.find_exact(11).is_none());
        assert_eq!(history.find_exact(12).map(|s| s.input.direction), Some(-1));
    }

    #[test]
    fn test_ring_overwrites_oldest() {
        let mut history = InputHistory::new();
        for tick in 0..(INPUT_HISTORY_SIZE as i32 + 5) {
            history.push(sample(tick, 0));
        }
        assert_eq!(history.len(), INPUT_HISTORY_SIZE);
        assert!(history.find_exact(4).is_none());
        assert!(history.find_exact(5).is_some());
        assert_eq!(history.latest().map(|s| s.tick), Some(204));
        assert_eq!(history.cursor(), 5);
    }

    #[test]
    fn test_clear() {
        let mut history = InputHistory::new();
        assert!(history.is_empty());
        assert!(history.latest().is_none());
        history.push(sample(1, 0));
        assert!(!history.is_empty());
        history.clear();
        assert!(history.is_empty());
        assert_eq!(history.cursor(), 0);
    }
}
