//! Admission control at the submission boundary. Submissions are accepted,
//! delayed with exponential backoff, or rejected outright based on the
//! current queue depth.

use std::sync::Mutex;
use std::time::Instant;

use crate::sync_ext::MutexExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureAction {
    Accept,
    Delay,
    Reject,
}

/// Policy parameters. Construction normalizes inconsistent values instead
/// of failing: the soft limit is at least one and the hard limit is never
/// below the soft limit.
#[derive(Debug, Clone, PartialEq)]
pub struct BackpressurePolicy {
    pub enabled: bool,
    pub soft_limit: usize,
    pub hard_limit: usize,
    pub base_delay_seconds: f64,
    pub max_delay_seconds: f64,
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            soft_limit: 10,
            hard_limit: 50,
            base_delay_seconds: 0.5,
            max_delay_seconds: 30.0,
        }
    }
}

impl BackpressurePolicy {
    pub fn normalized(mut self) -> Self {
        self.soft_limit = self.soft_limit.max(1);
        self.hard_limit = self.hard_limit.max(self.soft_limit);
        self.base_delay_seconds = self.base_delay_seconds.max(0.0);
        self.max_delay_seconds = self.max_delay_seconds.max(0.0);
        self
    }
}

/// Observable controller state, for dashboards and tests.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackpressureState {
    pub queue_depth: usize,
    pub rejection_count: u64,
    pub delay_count: u64,
    pub total_delay_seconds: f64,
    pub is_under_pressure: bool,
}

#[derive(Debug, Default)]
struct Counters {
    rejection_count: u64,
    delay_count: u64,
    total_delay_seconds: f64,
    last_pressure_at: Option<Instant>,
}

#[derive(Debug, thiserror::Error)]
#[error("job queue is full (depth {queue_depth}, hard limit {hard_limit})")]
pub struct QueueFullError {
    pub queue_depth: usize,
    pub hard_limit: usize,
}

#[derive(Debug)]
pub struct BackpressureController {
    policy: Mutex<BackpressurePolicy>,
    counters: Mutex<Counters>,
}

impl BackpressureController {
    pub fn new(policy: BackpressurePolicy) -> Self {
        Self {
            policy: Mutex::new(policy.normalized()),
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn policy(&self) -> BackpressurePolicy {
        self.policy.lock_unpoisoned().clone()
    }

    pub fn update_policy(&self, policy: BackpressurePolicy) {
        *self.policy.lock_unpoisoned() = policy.normalized();
    }

    /// Evaluate admission for the given queue depth. `Accept` and `Reject`
    /// carry a zero delay; `Delay` returns the recommended sleep in
    /// seconds, scaled by how far over the soft limit the queue sits.
    pub fn check(&self, queue_depth: usize) -> (BackpressureAction, f64) {
        let policy = self.policy.lock_unpoisoned().clone();
        if !policy.enabled {
            return (BackpressureAction::Accept, 0.0);
        }

        let mut counters = self.counters.lock_unpoisoned();
        if queue_depth >= policy.hard_limit {
            counters.rejection_count += 1;
            counters.last_pressure_at = Some(Instant::now());
            return (BackpressureAction::Reject, 0.0);
        }

        if queue_depth >= policy.soft_limit {
            counters.last_pressure_at = Some(Instant::now());
            let span = policy.hard_limit.saturating_sub(policy.soft_limit).max(1);
            let pressure_ratio = (queue_depth - policy.soft_limit) as f64 / span as f64;
            let delay = (policy.base_delay_seconds * 2f64.powf(pressure_ratio * 3.0))
                .min(policy.max_delay_seconds);
            counters.delay_count += 1;
            counters.total_delay_seconds += delay;
            return (BackpressureAction::Delay, delay);
        }

        (BackpressureAction::Accept, 0.0)
    }

    /// Whether a submission at `queue_depth` would be admitted at all.
    pub fn is_accepting(&self, queue_depth: usize) -> bool {
        let policy = self.policy.lock_unpoisoned().clone();
        !policy.enabled || queue_depth < policy.hard_limit
    }

    pub fn state(&self, queue_depth: usize) -> BackpressureState {
        let policy = self.policy.lock_unpoisoned().clone();
        let counters = self.counters.lock_unpoisoned();
        BackpressureState {
            queue_depth,
            rejection_count: counters.rejection_count,
            delay_count: counters.delay_count,
            total_delay_seconds: counters.total_delay_seconds,
            is_under_pressure: policy.enabled && queue_depth >= policy.soft_limit,
        }
    }

    pub fn reset_stats(&self) {
        let mut counters = self.counters.lock_unpoisoned();
        *counters = Counters::default();
    }
}

impl Default for BackpressureController {
    fn default() -> Self {
        Self::new(BackpressurePolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(soft: usize, hard: usize) -> BackpressureController {
        BackpressureController::new(BackpressurePolicy {
            enabled: true,
            soft_limit: soft,
            hard_limit: hard,
            base_delay_seconds: 0.5,
            max_delay_seconds: 30.0,
        })
    }

    #[test]
    fn accepts_below_soft_limit() {
        let controller = controller(2, 4);
        assert_eq!(controller.check(0), (BackpressureAction::Accept, 0.0));
        assert_eq!(controller.check(1), (BackpressureAction::Accept, 0.0));
    }

    #[test]
    fn delays_between_soft_and_hard_limit_with_growing_backoff() {
        let controller = controller(2, 4);
        let (action_low, delay_low) = controller.check(2);
        let (action_high, delay_high) = controller.check(3);
        assert_eq!(action_low, BackpressureAction::Delay);
        assert_eq!(action_high, BackpressureAction::Delay);
        assert!(delay_low > 0.0);
        assert!(delay_high > delay_low);
    }

    #[test]
    fn rejects_at_hard_limit_and_counts_rejections() {
        let controller = controller(2, 4);
        assert_eq!(controller.check(4), (BackpressureAction::Reject, 0.0));
        assert_eq!(controller.check(9), (BackpressureAction::Reject, 0.0));
        let state = controller.state(9);
        assert_eq!(state.rejection_count, 2);
        assert!(state.is_under_pressure);
        assert!(!controller.is_accepting(9));
    }

    #[test]
    fn delay_is_capped_at_the_maximum() {
        let controller = BackpressureController::new(BackpressurePolicy {
            enabled: true,
            soft_limit: 1,
            hard_limit: 100,
            base_delay_seconds: 10.0,
            max_delay_seconds: 12.0,
        });
        let (_, delay) = controller.check(99);
        assert!(delay <= 12.0);
    }

    #[test]
    fn disabled_controller_accepts_everything() {
        let controller = BackpressureController::new(BackpressurePolicy {
            enabled: false,
            ..BackpressurePolicy::default()
        });
        assert_eq!(controller.check(10_000), (BackpressureAction::Accept, 0.0));
        assert!(controller.is_accepting(10_000));
    }

    #[test]
    fn normalization_repairs_inverted_limits() {
        let policy = BackpressurePolicy {
            enabled: true,
            soft_limit: 0,
            hard_limit: 0,
            base_delay_seconds: -1.0,
            max_delay_seconds: -5.0,
        }
        .normalized();
        assert_eq!(policy.soft_limit, 1);
        assert_eq!(policy.hard_limit, 1);
        assert_eq!(policy.base_delay_seconds, 0.0);
    }

    #[test]
    fn reset_stats_clears_counters() {
        let controller = controller(1, 2);
        let _ = controller.check(1);
        let _ = controller.check(5);
        controller.reset_stats();
        let state = controller.state(0);
        assert_eq!(state.delay_count, 0);
        assert_eq!(state.rejection_count, 0);
        assert_eq!(state.total_delay_seconds, 0.0);
    }
}
