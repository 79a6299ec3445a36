//! Circle creation and deletion

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::code::CodeGenerator;
use super::membership::active_membership;
use super::saga::{Compensation, Saga};
use super::validation;
use crate::error::{CircleError, Result};
use crate::models::{Assignment, Circle, CircleMembership, Member};
use crate::store::{AssignmentFilter, CircleFilter, CircleStore, MemberFilter};

/// Parameters for a new circle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCircle {
    pub name: String,
    pub organizer_nickname: String,
    pub expires_at: DateTime<Utc>,
    pub organizer_device_id: String,
}

#[derive(Clone)]
pub struct CircleLifecycleManager {
    store: Arc<dyn CircleStore>,
    codes: CodeGenerator,
}

impl CircleLifecycleManager {
    pub fn new(store: Arc<dyn CircleStore>, codes: CodeGenerator) -> Self {
        Self { store, codes }
    }

    /// Create a circle with its organizer and 30 unassigned units.
    ///
    /// If anything after the circle row fails, rows already written for this
    /// attempt are removed best-effort and the original error is returned.
    pub async fn create(&self, request: &NewCircle) -> Result<CircleMembership> {
        if let Some(existing) =
            active_membership(self.store.as_ref(), &request.organizer_device_id).await?
        {
            return Err(CircleError::conflict(format!(
                "You are already a member of the circle \"{}\"",
                existing.circle.name
            )));
        }

        let name = validation::circle_name(&request.name)?;
        let nickname = validation::nickname(&request.organizer_nickname)?;
        validation::expiry(request.expires_at, Utc::now())?;

        let code = self.codes.generate().await?;
        let circle = Circle::new(
            code,
            name,
            request.organizer_device_id.clone(),
            request.expires_at,
        );
        self.store.insert_circle(&circle).await?;

        let mut saga = Saga::new();
        saga.record(Compensation::DeleteCircle(circle.id));

        match self.populate(&circle, &nickname, &mut saga).await {
            Ok(membership) => {
                tracing::info!(
                    circle_id = %circle.id,
                    code = %circle.code,
                    "Circle created"
                );
                Ok(CircleMembership { circle, membership })
            }
            Err(e) => {
                tracing::error!(
                    circle_id = %circle.id,
                    error = %e,
                    "Circle creation failed, rolling back"
                );
                saga.compensate(self.store.as_ref()).await;
                Err(e)
            }
        }
    }

    /// Organizer row and the initial assignments
    async fn populate(&self, circle: &Circle, nickname: &str, saga: &mut Saga) -> Result<Member> {
        let organizer = Member::new(circle.id, circle.organizer_device_id.clone(), nickname, true);
        saga.record(Compensation::DeleteMembers(circle.id));
        self.store.insert_member(&organizer).await?;

        saga.record(Compensation::DeleteAssignments(circle.id));
        for assignment in Assignment::initial_set(circle.id) {
            self.store.insert_assignment(&assignment).await?;
        }

        Ok(organizer)
    }

    /// Remove a circle with all its members and assignments.
    ///
    /// Each step runs even if an earlier one failed. Returns whether the
    /// circle row was removed; an error means the circle row itself could
    /// not be deleted.
    pub async fn delete(&self, circle_id: Uuid) -> Result<bool> {
        if let Err(e) = self
            .store
            .delete_assignments(&AssignmentFilter::in_circle(circle_id))
            .await
        {
            tracing::warn!(%circle_id, error = %e, "Failed to delete circle assignments");
        }

        if let Err(e) = self
            .store
            .delete_members(&MemberFilter::in_circle(circle_id))
            .await
        {
            tracing::warn!(%circle_id, error = %e, "Failed to delete circle members");
        }

        let removed = self
            .store
            .delete_circles(&CircleFilter::by_id(circle_id))
            .await
            .map_err(|e| {
                tracing::warn!(%circle_id, error = %e, "Failed to delete circle");
                e
            })?;

        if removed > 0 {
            tracing::info!(%circle_id, "Circle deleted");
        }
        Ok(removed > 0)
    }
}
