//! Aggregate progress for one bounded batch run.
//!
//! [`ProgressTracker`] is a small state machine:
//!
//! ```text
//! Accumulating ──(completed + failed == total)──► Finished
//!      │
//!      └──────────────(fail)────────────────────► Failed
//! ```
//!
//! Both terminal states absorb every later call. Presentation lives behind
//! [`ProgressSink`], so the tracker itself never prints.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressPhase {
    Accumulating,
    Finished,
    Failed,
}

impl ProgressPhase {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ProgressPhase::Accumulating)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressState {
    pub total: usize,
    pub completed: usize,
    pub in_progress: usize,
    pub failed: usize,
    pub phase: ProgressPhase,
    pub started_at: Instant,
}

impl ProgressState {
    fn new(total: usize) -> Self {
        Self {
            total,
            completed: 0,
            in_progress: 0,
            failed: 0,
            phase: ProgressPhase::Accumulating,
            started_at: Instant::now(),
        }
    }

    /// Items that have settled either way.
    pub fn settled(&self) -> usize {
        self.completed + self.failed
    }

    /// Items not yet started.
    pub fn unstarted(&self) -> usize {
        self.total
            .saturating_sub(self.settled() + self.in_progress)
    }

    /// `(elapsed / completed) * (total - completed - in_progress)`.
    ///
    /// Failed items stay in the remaining count. `None` until something has
    /// completed, and again once nothing is left to start.
    pub fn eta(&self, elapsed: Duration) -> Option<Duration> {
        if self.completed == 0 || self.unstarted() == 0 {
            return None;
        }
        let remaining = self
            .total
            .saturating_sub(self.completed + self.in_progress);
        Some(elapsed.mul_f64(remaining as f64 / self.completed as f64))
    }
}

/// Observer of progress transitions.
pub trait ProgressSink: Send + Sync {
    fn on_update(&self, _state: &ProgressState) {}
    fn on_finished(&self, _state: &ProgressState) {}
    fn on_failed(&self, _state: &ProgressState, _reason: &str) {}
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgressSink;

impl ProgressSink for NoopProgressSink {}

/// Reports progress through `tracing`.
#[derive(Debug, Clone)]
pub struct TracingProgressSink {
    label: String,
}

impl TracingProgressSink {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl ProgressSink for TracingProgressSink {
    fn on_update(&self, state: &ProgressState) {
        let eta_secs = state
            .eta(state.started_at.elapsed())
            .map(|eta| eta.as_secs());
        info!(
            batch = %self.label,
            completed = state.completed,
            failed = state.failed,
            in_progress = state.in_progress,
            total = state.total,
            eta_secs = ?eta_secs,
            "[PROGRESS] Batch progress"
        );
    }

    fn on_finished(&self, state: &ProgressState) {
        info!(
            batch = %self.label,
            completed = state.completed,
            failed = state.failed,
            elapsed_ms = state.started_at.elapsed().as_millis() as u64,
            "[PROGRESS] Batch finished"
        );
    }

    fn on_failed(&self, state: &ProgressState, reason: &str) {
        error!(
            batch = %self.label,
            completed = state.completed,
            failed = state.failed,
            reason,
            "[PROGRESS] Batch aborted"
        );
    }
}

enum Event {
    Update,
    Finished,
    Failed(String),
}

pub struct ProgressTracker {
    state: Mutex<ProgressState>,
    sink: Arc<dyn ProgressSink>,
}

impl ProgressTracker {
    pub fn new(total: usize, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            state: Mutex::new(ProgressState::new(total)),
            sink,
        }
    }

    pub fn snapshot(&self) -> ProgressState {
        self.lock().clone()
    }

    pub fn eta(&self) -> Option<Duration> {
        let state = self.lock();
        state.eta(state.started_at.elapsed())
    }

    pub fn start_item(&self) {
        self.transition(|state| {
            state.in_progress += 1;
            vec![Event::Update]
        });
    }

    /// Settles one in-progress item; finishes the batch when everything has settled.
    pub fn complete_item(&self, success: bool) {
        self.transition(|state| {
            state.in_progress = state.in_progress.saturating_sub(1);
            if success {
                state.completed += 1;
            } else {
                state.failed += 1;
            }
            let mut events = vec![Event::Update];
            if state.settled() >= state.total {
                state.phase = ProgressPhase::Finished;
                events.push(Event::Finished);
            }
            events
        });
    }

    /// Normal terminal transition, used when a batch ends without settling every item.
    pub fn finish(&self) {
        self.transition(|state| {
            state.phase = ProgressPhase::Finished;
            vec![Event::Finished]
        });
    }

    /// Forced terminal transition.
    pub fn fail(&self, reason: &str) {
        let reason = reason.to_string();
        self.transition(move |state| {
            state.phase = ProgressPhase::Failed;
            vec![Event::Failed(reason)]
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProgressState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition<F>(&self, apply: F)
    where
        F: FnOnce(&mut ProgressState) -> Vec<Event>,
    {
        let (events, snapshot) = {
            let mut state = self.lock();
            if state.phase.is_terminal() {
                return;
            }
            let events = apply(&mut *state);
            (events, state.clone())
        };
        for event in events {
            match event {
                Event::Update => self.sink.on_update(&snapshot),
                Event::Finished => self.sink.on_finished(&snapshot),
                Event::Failed(reason) => self.sink.on_failed(&snapshot, &reason),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl ProgressSink for RecordingSink {
        fn on_update(&self, state: &ProgressState) {
            self.events.lock().unwrap().push(format!(
                "update {}/{}/{}",
                state.completed, state.failed, state.in_progress
            ));
        }
        fn on_finished(&self, _state: &ProgressState) {
            self.events.lock().unwrap().push("finished".into());
        }
        fn on_failed(&self, _state: &ProgressState, reason: &str) {
            self.events.lock().unwrap().push(format!("failed {reason}"));
        }
    }

    #[test]
    fn auto_finishes_when_all_items_settle() {
        let sink = Arc::new(RecordingSink::default());
        let tracker = ProgressTracker::new(2, sink.clone());

        tracker.start_item();
        tracker.start_item();
        tracker.complete_item(true);
        assert_eq!(tracker.snapshot().phase, ProgressPhase::Accumulating);
        tracker.complete_item(false);

        let state = tracker.snapshot();
        assert_eq!(state.phase, ProgressPhase::Finished);
        assert_eq!((state.completed, state.failed, state.in_progress), (1, 1, 0));
        assert_eq!(sink.events().last().map(String::as_str), Some("finished"));
    }

    #[test]
    fn terminal_states_ignore_later_calls() {
        let sink = Arc::new(RecordingSink::default());
        let tracker = ProgressTracker::new(3, sink.clone());
        tracker.start_item();
        tracker.fail("upstream gone");
        tracker.fail("again");
        tracker.complete_item(true);
        tracker.finish();

        let state = tracker.snapshot();
        assert_eq!(state.phase, ProgressPhase::Failed);
        assert_eq!(state.completed, 0);
        assert_eq!(
            sink.events(),
            vec!["update 0/0/1".to_string(), "failed upstream gone".to_string()]
        );
    }

    #[test]
    fn eta_is_undefined_before_first_settlement() {
        let mut state = ProgressState::new(10);
        state.in_progress = 2;
        assert_eq!(state.eta(Duration::from_secs(5)), None);
    }

    #[test]
    fn eta_scales_elapsed_by_remaining_items() {
        let mut state = ProgressState::new(10);
        state.completed = 2;
        state.in_progress = 2;
        // 6 remaining, 2 completed in 10s -> 30s
        assert_eq!(
            state.eta(Duration::from_secs(10)),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn eta_is_suppressed_once_nothing_is_left_to_start() {
        let mut state = ProgressState::new(4);
        state.completed = 2;
        state.in_progress = 2;
        assert_eq!(state.eta(Duration::from_secs(10)), None);
    }

    #[test]
    fn eta_divides_by_completions_only() {
        let mut state = ProgressState::new(10);
        state.failed = 2;
        assert_eq!(state.eta(Duration::from_secs(10)), None);

        state.completed = 1;
        state.failed = 3;
        // 10 - 1 completed - 0 in progress = 9 remaining at 10s each
        assert_eq!(
            state.eta(Duration::from_secs(10)),
            Some(Duration::from_secs(90))
        );
    }
}
