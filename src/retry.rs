//! Transform-then-verify loop over one document.
//!
//! The orchestrator knows nothing about what the transform does. It runs
//! the pass, asks the predicate whether the result is acceptable, and
//! decides whether another pass can still make progress.

use std::future::Future;

use tracing::{debug, info, warn};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// What one pass of the transform produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassOutput {
    pub text: String,
    pub remaining_forbidden: usize,
    pub resolved: usize,
    pub failed: usize,
    pub bytes_saved: u64,
}

/// Diagnostics for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAttemptRecord {
    pub attempt: u32,
    pub remaining_forbidden: usize,
    pub resolved: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStatus {
    /// The predicate held.
    Success,
    /// An attempt returned its input unchanged; further attempts cannot help.
    Stuck,
    /// Every attempt was used and the predicate never held.
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOutcome {
    /// Best text obtained, also on failure.
    pub text: String,
    pub status: RetryStatus,
    pub attempts_used: u32,
    pub attempts: Vec<RetryAttemptRecord>,
    /// Summed over every attempt.
    pub bytes_saved: u64,
    pub remaining_forbidden: usize,
}

impl RetryOutcome {
    pub fn is_success(&self) -> bool {
        self.status == RetryStatus::Success
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryOrchestrator {
    max_attempts: u32,
}

impl Default for RetryOrchestrator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl RetryOrchestrator {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Runs `transform` until `is_valid` accepts its output, an attempt makes
    /// no change, or `max_attempts` passes have run.
    pub async fn run<P, T, Fut>(&self, input: String, is_valid: P, mut transform: T) -> RetryOutcome
    where
        P: Fn(&str) -> bool,
        T: FnMut(String) -> Fut,
        Fut: Future<Output = PassOutput>,
    {
        let mut current = input;
        let mut attempts = Vec::new();
        let mut bytes_saved = 0u64;

        for attempt in 1..=self.max_attempts {
            let pass = transform(current.clone()).await;
            bytes_saved += pass.bytes_saved;
            attempts.push(RetryAttemptRecord {
                attempt,
                remaining_forbidden: pass.remaining_forbidden,
                resolved: pass.resolved,
                failed: pass.failed,
            });
            debug!(
                attempt,
                remaining_forbidden = pass.remaining_forbidden,
                resolved = pass.resolved,
                failed = pass.failed,
                "[RETRY] Pass complete"
            );

            let status = if is_valid(&pass.text) {
                Some(RetryStatus::Success)
            } else if pass.text == current {
                Some(RetryStatus::Stuck)
            } else {
                None
            };

            if let Some(status) = status {
                match status {
                    RetryStatus::Success if attempt > 1 => {
                        info!(attempt, "[RETRY] Document healed on a later attempt")
                    }
                    RetryStatus::Stuck => warn!(
                        attempt,
                        remaining_forbidden = pass.remaining_forbidden,
                        "[RETRY] No progress between attempts, giving up early"
                    ),
                    _ => {}
                }
                return RetryOutcome {
                    text: pass.text,
                    status,
                    attempts_used: attempt,
                    attempts,
                    bytes_saved,
                    remaining_forbidden: pass.remaining_forbidden,
                };
            }
            current = pass.text;
        }

        let remaining_forbidden = attempts.last().map_or(0, |a| a.remaining_forbidden);
        warn!(
            attempts = self.max_attempts,
            remaining_forbidden, "[RETRY] Attempts exhausted"
        );
        RetryOutcome {
            text: current,
            status: RetryStatus::Exhausted,
            attempts_used: self.max_attempts,
            attempts,
            bytes_saved,
            remaining_forbidden,
        }
    }
}
