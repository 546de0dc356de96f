//! Congestion-driven object skipping, SPEC_FULL.md §4.7.
//!
//! Consulted before emitting each warp object and before each single-stream
//! fragment; decides whether the producer should skip the current object
//! and emit the `flags = 0xff`, `length = 0` sentinel instead. No teacher
//! analog — `server/src/qos.rs`'s priority-level enum shape is reused as the
//! idiom (small `enum` + an evaluator struct), not its USB device-class
//! priority table.

use std::time::Duration;

/// Skip-decision policy, selected per context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionMode {
    /// Never skip.
    None,
    /// Skip when the QUIC path's estimated queueing delay exceeds a
    /// threshold.
    Delay,
    /// Skip remaining objects of a group once the consumer's backlog
    /// exceeds a threshold object count.
    Group,
    /// Always skip (used in tests and for simulating a fully congested
    /// path).
    Zero,
}

/// Signals the evaluator reads to make a skip decision.
#[derive(Debug, Clone, Copy)]
pub struct PathSignals {
    /// Estimated queueing delay on the QUIC path.
    pub pacing_delay: Duration,
    /// Number of objects the consumer has not yet drained.
    pub consumer_backlog: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct CongestionEvaluator {
    mode: CongestionMode,
    delay_threshold: Duration,
    backlog_threshold: usize,
}

impl CongestionEvaluator {
    pub fn new(mode: CongestionMode) -> Self {
        Self {
            mode,
            delay_threshold: Duration::from_millis(100),
            backlog_threshold: 8,
        }
    }

    pub fn with_thresholds(
        mode: CongestionMode,
        delay_threshold: Duration,
        backlog_threshold: usize,
    ) -> Self {
        Self {
            mode,
            delay_threshold,
            backlog_threshold,
        }
    }

    /// Decide whether the object about to be sent should be skipped.
    pub fn should_skip(&self, signals: PathSignals) -> bool {
        match self.mode {
            CongestionMode::None => false,
            CongestionMode::Delay => signals.pacing_delay > self.delay_threshold,
            CongestionMode::Group => signals.consumer_backlog > self.backlog_threshold,
            CongestionMode::Zero => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_mode_never_skips() {
        let eval = CongestionEvaluator::new(CongestionMode::None);
        let signals = PathSignals {
            pacing_delay: Duration::from_secs(10),
            consumer_backlog: 1000,
        };
        assert!(!eval.should_skip(signals));
    }

    #[test]
    fn delay_mode_skips_past_threshold() {
        let eval = CongestionEvaluator::new(CongestionMode::Delay);
        let under = PathSignals {
            pacing_delay: Duration::from_millis(10),
            consumer_backlog: 0,
        };
        let over = PathSignals {
            pacing_delay: Duration::from_millis(200),
            consumer_backlog: 0,
        };
        assert!(!eval.should_skip(under));
        assert!(eval.should_skip(over));
    }

    #[test]
    fn zero_mode_always_skips() {
        let eval = CongestionEvaluator::new(CongestionMode::Zero);
        let signals = PathSignals {
            pacing_delay: Duration::ZERO,
            consumer_backlog: 0,
        };
        assert!(eval.should_skip(signals));
    }
}
