//! Best-effort compensation for multi-step writes.
//!
//! The store has no transactions. A multi-step operation records one
//! compensation per forward step it starts; on failure they run newest
//! first and their own failures are only logged.

use uuid::Uuid;

use crate::error::Result;
use crate::store::{AssignmentFilter, CircleFilter, CircleStore, MemberFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compensation {
    DeleteCircle(Uuid),
    DeleteMembers(Uuid),
    DeleteAssignments(Uuid),
}

impl Compensation {
    async fn run(&self, store: &dyn CircleStore) -> Result<u64> {
        match *self {
            Compensation::DeleteCircle(id) => store.delete_circles(&CircleFilter::by_id(id)).await,
            Compensation::DeleteMembers(id) => {
                store.delete_members(&MemberFilter::in_circle(id)).await
            }
            Compensation::DeleteAssignments(id) => {
                store
                    .delete_assignments(&AssignmentFilter::in_circle(id))
                    .await
            }
        }
    }
}

/// Ordered list of compensations for one operation
#[derive(Debug, Default)]
pub struct Saga {
    steps: Vec<Compensation>,
}

impl Saga {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, step: Compensation) {
        self.steps.push(step);
    }

    /// Undo recorded steps in reverse order. Never fails.
    pub async fn compensate(self, store: &dyn CircleStore) {
        for step in self.steps.into_iter().rev() {
            match step.run(store).await {
                Ok(rows) => tracing::debug!(?step, rows, "Compensation applied"),
                Err(e) => tracing::warn!(?step, error = %e, "Compensation failed, continuing"),
            }
        }
    }
}
