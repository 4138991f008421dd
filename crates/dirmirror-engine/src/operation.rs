//! Pending remote operations owned by the dispatcher

use chrono::Utc;
use dirmirror_types::{
    DeadLetter, Error, Intent, IntentOp, OperationEvent, OperationId, OperationOutcome,
    OperationState, RelativePath,
};
use std::time::Duration;
use tokio::time::Instant;

/// A unit of work for one relative path
#[derive(Debug, Clone)]
pub struct PendingOperation {
    /// Unique operation identifier, stable across retries
    pub id: OperationId,
    /// What to apply
    pub intent: Intent,
    /// Attempts made so far
    pub attempts: u32,
    /// Earliest instant a worker may pick the operation up
    pub next_eligible_at: Instant,
    /// Current lifecycle state
    pub state: OperationState,
    /// Failure of the most recent attempt
    pub last_error: Option<Error>,
}

impl PendingOperation {
    /// Create a queued operation, eligible immediately
    pub fn new(intent: Intent) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            intent,
            attempts: 0,
            next_eligible_at: Instant::now(),
            state: OperationState::Queued,
            last_error: None,
        }
    }

    /// Path the operation targets
    pub fn path(&self) -> &RelativePath {
        &self.intent.path
    }

    /// Mutation to apply
    pub fn op(&self) -> IntentOp {
        self.intent.op
    }

    /// Whether a worker may take the operation at `now`
    pub fn is_eligible(&self, now: Instant) -> bool {
        matches!(self.state, OperationState::Queued | OperationState::Retrying)
            && self.next_eligible_at <= now
    }

    /// Mark the operation as being executed
    pub fn start(&mut self) {
        self.state = OperationState::InFlight;
        self.attempts += 1;
    }

    /// Schedule another attempt `delay` after `now`
    pub fn retry_after(&mut self, delay: Duration, error: Error, now: Instant) {
        self.state = OperationState::Retrying;
        self.next_eligible_at = now + delay;
        self.last_error = Some(error);
    }

    /// Give up on the operation
    pub fn dead_letter(mut self, error: Error) -> DeadLetter {
        self.state = OperationState::DeadLettered;
        DeadLetter {
            operation_id: self.id,
            intent: self.intent,
            attempts: self.attempts,
            error,
            failed_at: Utc::now(),
        }
    }

    /// Observability record for the outcome of the latest attempt
    pub fn event(
        &self,
        outcome: OperationOutcome,
        latency: Duration,
        error: Option<Error>,
    ) -> OperationEvent {
        OperationEvent {
            operation_id: self.id,
            path: self.intent.path.clone(),
            operation: self.intent.op,
            outcome,
            attempts: self.attempts,
            latency,
            error,
            timestamp: Utc::now(),
        }
    }
}
