//! Per-statement retry state machine.
//!
//! `Pending → Retrying(n) → Applied | Abandoned`. The machine is pure: the
//! caller executes the statement, feeds the outcome to [`StatementState::advance`]
//! and sleeps for [`RetryPolicy::delay`] while the state is `Retrying`.

use serde::Serialize;
use std::time::Duration;

use crate::domain::error::ErrorKind;

/// Bounded fixed-delay retry for contention errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

/// Lifecycle of one statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "attempts", rename_all = "snake_case")]
pub enum StatementState {
    /// Not attempted yet.
    Pending,
    /// `n` attempts failed with contention; another one is allowed.
    Retrying(u32),
    Applied,
    /// Given up after a non-retryable error or too many contention errors.
    Abandoned,
}

impl StatementState {
    /// Number of attempts made so far, counting the one whose outcome is
    /// being fed next.
    fn attempt_number(self) -> u32 {
        match self {
            StatementState::Retrying(n) => n + 1,
            _ => 1,
        }
    }

    /// Transition on the outcome of one attempt.
    pub fn advance(self, outcome: Result<(), ErrorKind>, policy: &RetryPolicy) -> Self {
        if self.is_terminal() {
            return self;
        }
        let attempt = self.attempt_number();
        match outcome {
            Ok(()) => StatementState::Applied,
            Err(ErrorKind::Contention) if attempt < policy.max_attempts => {
                StatementState::Retrying(attempt)
            }
            Err(_) => StatementState::Abandoned,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StatementState::Applied | StatementState::Abandoned)
    }
}
