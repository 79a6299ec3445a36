//! Completion counters derived from assignment state

use std::sync::Arc;

use uuid::Uuid;

use crate::error::{CircleError, Result};
use crate::models::{AssignmentStatus, CircleStatus, Progress, TOTAL_UNITS};
use crate::store::{AssignmentFilter, CirclePatch, CircleFilter, CircleStore};

/// Result of writing fresh counters onto a circle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub progress: Progress,
    /// True only for the call that moved the circle from active to completed
    pub circle_completed: bool,
}

#[derive(Clone)]
pub struct ProgressAggregator {
    store: Arc<dyn CircleStore>,
}

impl ProgressAggregator {
    pub fn new(store: Arc<dyn CircleStore>) -> Self {
        Self { store }
    }

    async fn completed_count(&self, circle_id: Uuid) -> Result<u8> {
        let count = self
            .store
            .count_assignments(
                &AssignmentFilter::in_circle(circle_id).with_status(AssignmentStatus::Completed),
            )
            .await?;
        Ok(count.min(u64::from(TOTAL_UNITS)) as u8)
    }

    /// Current progress, read-only
    pub async fn progress(&self, circle_id: Uuid) -> Result<Progress> {
        Ok(Progress::from_completed(self.completed_count(circle_id).await?))
    }

    /// Count completed units and write the total onto the circle.
    ///
    /// Reaching 30 flips the circle to completed. The flip is filtered on the
    /// circle still being active so exactly one caller observes it.
    pub async fn recompute(&self, circle_id: Uuid) -> Result<ProgressUpdate> {
        let progress = Progress::from_completed(self.completed_count(circle_id).await?);

        if progress.is_complete() {
            let flipped = self
                .store
                .update_circles(
                    &CircleFilter::active().with_id(circle_id),
                    &CirclePatch {
                        completed_units: Some(progress.completed),
                        status: Some(CircleStatus::Completed),
                    },
                )
                .await?;
            if flipped > 0 {
                tracing::info!(%circle_id, "Circle completed all units");
                return Ok(ProgressUpdate {
                    progress,
                    circle_completed: true,
                });
            }
        }

        let affected = self
            .store
            .update_circles(
                &CircleFilter::by_id(circle_id),
                &CirclePatch {
                    completed_units: Some(progress.completed),
                    status: None,
                },
            )
            .await?;
        if affected == 0 {
            return Err(CircleError::not_found("Circle not found"));
        }

        tracing::debug!(%circle_id, completed = progress.completed, "Progress recomputed");
        Ok(ProgressUpdate {
            progress,
            circle_completed: false,
        })
    }
}
