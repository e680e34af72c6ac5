//! Per-connection variable difficulty

use crate::config::DifficultyConfig;
use std::collections::VecDeque;

/// Retarget controller fed with share submission times.
///
/// Keeps a bounded window of the seconds between consecutive submissions and,
/// once every `retarget_time` seconds, scales the difficulty so the average
/// interval moves toward `target_time`.
#[derive(Debug, Clone)]
pub struct Difficulty {
    config: DifficultyConfig,
    max_size: f64,
    min_time: f64,
    max_time: f64,
    queue: VecDeque<u64>,
    last_retarget: Option<f64>,
    last_saved: u64,
}

impl Difficulty {
    pub fn new(config: DifficultyConfig) -> Self {
        let max_size = config.retarget_time / config.target_time * 4.0;
        let min_time = config.target_time * (1.0 + config.variance);
        let max_time = config.target_time * (1.0 - config.variance);
        Self { config, max_size, min_time, max_time, queue: VecDeque::new(), last_retarget: None, last_saved: 0 }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Records a submission at `now` (unix seconds) for a connection mining at
    /// `current`. Returns the new difficulty when a retarget is due and needed.
    pub fn on_submit(&mut self, now: u64, current: f64) -> Option<f64> {
        let Some(last_retarget) = self.last_retarget else {
            self.last_retarget = Some(now as f64 - self.config.retarget_time / 2.0);
            self.last_saved = now;
            return None;
        };

        // a fractional capacity admits one more sample than its floor
        if self.queue.len() as f64 >= self.max_size {
            self.queue.pop_front();
        }
        self.queue.push_back(now.saturating_sub(self.last_saved));
        self.last_saved = now;

        if now as f64 - last_retarget < self.config.retarget_time {
            return None;
        }

        let updated = self.ratio(current).map(|ratio| {
            self.queue.clear();
            ((current * ratio) * 1e8).round() / 1e8
        });
        self.last_retarget = Some(now as f64);
        updated
    }

    fn ratio(&self, current: f64) -> Option<f64> {
        if self.queue.is_empty() {
            return None;
        }
        let average = self.queue.iter().sum::<u64>() as f64 / self.queue.len() as f64;
        let ratio = self.config.target_time / average;

        if average > self.max_time && current > self.config.minimum {
            Some(if ratio * current < self.config.minimum { self.config.minimum / current } else { ratio })
        } else if average < self.min_time && current < self.config.maximum {
            Some(if ratio * current > self.config.maximum { self.config.maximum / current } else { ratio })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_634_742_080;

    fn config() -> DifficultyConfig {
        DifficultyConfig { initial: 32.0, minimum: 8.0, maximum: 512.0, target_time: 15.0, retarget_time: 90.0, variance: 0.3 }
    }

    fn difficulty(last_retarget: u64, last_saved: u64, zeros: usize) -> Difficulty {
        let mut difficulty = Difficulty::new(config());
        difficulty.last_retarget = Some(last_retarget as f64);
        difficulty.last_saved = last_saved;
        difficulty.queue.extend(std::iter::repeat_n(0, zeros));
        difficulty
    }

    #[test]
    fn test_first_submission_seeds_window() {
        let mut difficulty = difficulty(0, 0, 0);
        difficulty.last_retarget = None;
        assert_eq!(difficulty.max_size, 24.0);
        assert_eq!(difficulty.on_submit(NOW, 32.0), None);
        assert_eq!(difficulty.last_retarget, Some((NOW - 45) as f64));
        assert_eq!(difficulty.last_saved, NOW);
        assert_eq!(difficulty.queue_len(), 0);
    }

    #[test]
    fn test_no_retarget_inside_window() {
        let mut difficulty = difficulty(NOW - 10, NOW - 5, 0);
        assert_eq!(difficulty.on_submit(NOW, 32.0), None);
        assert_eq!(difficulty.last_retarget, Some((NOW - 10) as f64));
        assert_eq!(difficulty.last_saved, NOW);

        let mut difficulty = self::difficulty(NOW - 10, NOW - 5, 24);
        assert_eq!(difficulty.on_submit(NOW, 32.0), None);
        assert_eq!(difficulty.queue_len(), 24);
        assert_eq!(difficulty.queue.back(), Some(&5));
    }

    #[test]
    fn test_slow_shares_lower_difficulty() {
        let mut difficulty = difficulty(NOW - 580, NOW - 575, 0);
        assert_eq!(difficulty.on_submit(NOW, 32.0), Some(8.0));
        assert_eq!(difficulty.queue_len(), 0);

        let mut difficulty = self::difficulty(NOW - 580, NOW - 575, 0);
        assert_eq!(difficulty.on_submit(NOW, 510.0), Some(13.30434783));
        assert_eq!(difficulty.queue_len(), 0);

        let mut difficulty = self::difficulty(NOW - 580, NOW - 1500, 24);
        assert_eq!(difficulty.on_submit(NOW, 32.0), Some(8.0));
        assert_eq!(difficulty.queue_len(), 0);
    }

    #[test]
    fn test_fast_shares_raise_difficulty() {
        let mut difficulty = difficulty(NOW - 580, NOW - 80, 24);
        assert_eq!(difficulty.on_submit(NOW, 32.0), Some(144.0));
        assert_eq!(difficulty.queue_len(), 0);

        let mut difficulty = self::difficulty(NOW - 580, NOW - 80, 24);
        assert_eq!(difficulty.on_submit(NOW, 510.0), Some(512.0));
        assert_eq!(difficulty.queue_len(), 0);
    }

    #[test]
    fn test_bounds_hold_difficulty() {
        let mut difficulty = difficulty(NOW - 180, NOW - 100, 0);
        assert_eq!(difficulty.on_submit(NOW, 8.0), None);
        assert_eq!(difficulty.last_retarget, Some(NOW as f64));
        assert_eq!(difficulty.last_saved, NOW);

        let mut difficulty = self::difficulty(NOW - 180, NOW - 100, 24);
        assert_eq!(difficulty.on_submit(NOW, 512.0), None);
        assert_eq!(difficulty.last_retarget, Some(NOW as f64));
        assert_eq!(difficulty.queue_len(), 24);
    }

    #[test]
    fn test_twenty_second_average_lowers_difficulty() {
        // 23 zeros and one 480s sample average 20s, above max_time
        let mut difficulty = difficulty(NOW - 580, NOW - 480, 24);
        assert_eq!(difficulty.on_submit(NOW, 32.0), Some(24.0));
        assert_eq!(difficulty.queue_len(), 0);
    }

    #[test]
    fn test_fractional_window() {
        let seeded = |retarget_time: f64| {
            let mut difficulty = Difficulty::new(DifficultyConfig { retarget_time, target_time: 10.0, ..config() });
            assert_eq!(difficulty.on_submit(NOW, 32.0), None);
            difficulty
        };
        assert_eq!(seeded(25.0).last_retarget, Some(NOW as f64 - 12.5));

        let filled = |retarget_time: f64| {
            let mut difficulty = seeded(retarget_time);
            for i in 1..=12 {
                difficulty.last_retarget = Some((NOW + i) as f64);
                assert_eq!(difficulty.on_submit(NOW + i, 32.0), None);
            }
            difficulty.queue_len()
        };
        // capacity 10 holds 10 samples, 10.2 admits an eleventh
        assert_eq!(filled(25.0), 10);
        assert_eq!(filled(25.5), 11);
    }
}
