//! Public operations over circles.
//!
//! Every call answers with an [`ApiResponse`]. Business-rule failures come
//! back as their own message; anything unexpected is logged here and replaced
//! with a generic one.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::circle::{
    AssignmentStateMachine, BatchOutcome, CircleLifecycleManager, CodeGenerator,
    CompletionOutcome, ExpirationSweeper, LeaveOutcome, MembershipManager, NewCircle,
    PendingEdits, ProgressAggregator,
};
use crate::config::CircleSettings;
use crate::error::{CircleError, Result};
use crate::models::{
    Assignment, Circle, CircleMembership, CircleOverview, ExpirationStatus, MemberSummary,
    Progress,
};
use crate::store::{CircleFilter, CircleStore};

/// Uniform result envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    /// Fold a result into the envelope, logging what the caller will not see
    pub fn from_result(operation: &str, result: Result<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) if e.is_expected() => {
                tracing::debug!(operation, error = %e, "Request rejected");
                Self::failure(e.user_message())
            }
            Err(e) => {
                tracing::error!(operation, error = %e, "Request failed");
                Self::failure(e.user_message())
            }
        }
    }
}

impl<T: Serialize> ApiResponse<T> {
    /// Same envelope with the payload as JSON
    pub fn into_json(self) -> ApiResponse<serde_json::Value> {
        let data = match self.data.map(serde_json::to_value).transpose() {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode response payload");
                return ApiResponse::failure(crate::error::GENERIC_FAILURE);
            }
        };
        ApiResponse {
            success: self.success,
            data,
            error: self.error,
        }
    }
}

impl ApiResponse<BatchOutcome> {
    /// Batches carry their tally even when some units failed
    fn from_batch(outcome: BatchOutcome) -> Self {
        if outcome.is_success() {
            return Self::ok(outcome);
        }
        let total = outcome.succeeded.len() + outcome.error_count();
        Self {
            success: false,
            error: Some(format!(
                "{} of {} units could not be saved",
                outcome.error_count(),
                total
            )),
            data: Some(outcome),
        }
    }
}

#[derive(Clone)]
pub struct CircleService {
    store: Arc<dyn CircleStore>,
    codes: CodeGenerator,
    lifecycle: CircleLifecycleManager,
    membership: MembershipManager,
    assignments: AssignmentStateMachine,
    progress: ProgressAggregator,
    sweeper: ExpirationSweeper,
}

impl CircleService {
    pub fn new(store: Arc<dyn CircleStore>, settings: CircleSettings) -> Self {
        let codes = CodeGenerator::new(store.clone(), settings.code_attempts);
        let lifecycle = CircleLifecycleManager::new(store.clone(), codes.clone());
        let progress = ProgressAggregator::new(store.clone());
        let assignments =
            AssignmentStateMachine::new(store.clone(), progress.clone(), settings.update_mode);
        let membership =
            MembershipManager::new(store.clone(), lifecycle.clone(), assignments.clone());
        let sweeper = ExpirationSweeper::new(store.clone(), lifecycle.clone());

        Self {
            store,
            codes,
            lifecycle,
            membership,
            assignments,
            progress,
            sweeper,
        }
    }

    /// Short-circuit when the store is down, then run `call`
    async fn run<T, F>(&self, operation: &'static str, call: F) -> ApiResponse<T>
    where
        F: Future<Output = Result<T>>,
    {
        if !self.store.is_available() {
            return ApiResponse::from_result(
                operation,
                Err(CircleError::BackendUnavailable(
                    "store is not reachable".to_string(),
                )),
            );
        }
        ApiResponse::from_result(operation, call.await)
    }

    async fn run_batch<F>(&self, operation: &'static str, call: F) -> ApiResponse<BatchOutcome>
    where
        F: Future<Output = BatchOutcome>,
    {
        match self.run(operation, async { Ok(call.await) }).await {
            ApiResponse {
                data: Some(outcome),
                ..
            } => ApiResponse::from_batch(outcome),
            unavailable => unavailable,
        }
    }

    pub async fn create_circle(&self, request: NewCircle) -> ApiResponse<CircleMembership> {
        self.run("create_circle", self.lifecycle.create(&request))
            .await
    }

    pub async fn join_circle(
        &self,
        code: &str,
        nickname: &str,
        device_id: &str,
    ) -> ApiResponse<CircleMembership> {
        self.run("join_circle", self.membership.join(code, nickname, device_id))
            .await
    }

    pub async fn leave_circle(&self, circle_id: Uuid, device_id: &str) -> ApiResponse<LeaveOutcome> {
        self.run("leave_circle", self.membership.leave(circle_id, device_id))
            .await
    }

    pub async fn remove_member_from_circle(&self, circle_id: Uuid, member_id: Uuid) -> ApiResponse<()> {
        self.run(
            "remove_member_from_circle",
            self.membership.remove(circle_id, member_id),
        )
        .await
    }

    pub async fn get_circle_members(&self, circle_id: Uuid) -> ApiResponse<Vec<MemberSummary>> {
        self.run("get_circle_members", self.membership.members(circle_id))
            .await
    }

    pub async fn get_circle_assignments(&self, circle_id: Uuid) -> ApiResponse<Vec<Assignment>> {
        self.run("get_circle_assignments", self.assignments.list(circle_id))
            .await
    }

    pub async fn get_circle_progress(&self, circle_id: Uuid) -> ApiResponse<Progress> {
        self.run("get_circle_progress", async {
            self.require_circle(circle_id).await?;
            self.progress.progress(circle_id).await
        })
        .await
    }

    pub async fn get_my_assignments(
        &self,
        circle_id: Uuid,
        device_id: &str,
    ) -> ApiResponse<Vec<Assignment>> {
        self.run(
            "get_my_assignments",
            self.assignments.list_for_device(circle_id, device_id),
        )
        .await
    }

    pub async fn assign_juz_to_member(
        &self,
        circle_id: Uuid,
        unit_number: u8,
        member_id: Uuid,
    ) -> ApiResponse<Assignment> {
        self.run(
            "assign_juz_to_member",
            self.assignments.assign(circle_id, unit_number, member_id),
        )
        .await
    }

    pub async fn assign_multiple_juz(
        &self,
        circle_id: Uuid,
        units: &[u8],
        member_id: Uuid,
    ) -> ApiResponse<BatchOutcome> {
        self.run_batch(
            "assign_multiple_juz",
            self.assignments.assign_many(circle_id, units, member_id),
        )
        .await
    }

    pub async fn unassign_juz(&self, circle_id: Uuid, unit_number: u8) -> ApiResponse<Assignment> {
        self.run("unassign_juz", self.assignments.unassign(circle_id, unit_number))
            .await
    }

    pub async fn unassign_multiple_juz(
        &self,
        circle_id: Uuid,
        units: &[u8],
    ) -> ApiResponse<BatchOutcome> {
        self.run_batch(
            "unassign_multiple_juz",
            self.assignments.unassign_many(circle_id, units),
        )
        .await
    }

    pub async fn apply_pending_edits(
        &self,
        circle_id: Uuid,
        edits: &PendingEdits,
    ) -> ApiResponse<BatchOutcome> {
        self.run_batch(
            "apply_pending_edits",
            self.assignments.apply_edits(circle_id, edits),
        )
        .await
    }

    pub async fn mark_juz_in_progress(
        &self,
        circle_id: Uuid,
        unit_number: u8,
        device_id: &str,
    ) -> ApiResponse<Assignment> {
        self.run(
            "mark_juz_in_progress",
            self.assignments
                .mark_in_progress(circle_id, unit_number, device_id),
        )
        .await
    }

    pub async fn mark_juz_completed(
        &self,
        circle_id: Uuid,
        unit_number: u8,
        device_id: &str,
    ) -> ApiResponse<CompletionOutcome> {
        self.run(
            "mark_juz_completed",
            self.assignments
                .mark_completed(circle_id, unit_number, device_id),
        )
        .await
    }

    /// The device's current circle, after clearing out expired ones
    pub async fn check_user_circle(&self, device_id: &str) -> ApiResponse<Option<CircleMembership>> {
        self.run("check_user_circle", async {
            if let Err(e) = self.sweeper.sweep().await {
                tracing::warn!(error = %e, "Expiration sweep failed before membership lookup");
            }
            self.membership.find_active(device_id).await
        })
        .await
    }

    pub async fn validate_circle_code(&self, code: &str) -> ApiResponse<Circle> {
        self.run("validate_circle_code", self.membership.resolve_code(code))
            .await
    }

    pub async fn generate_circle_code(&self) -> ApiResponse<String> {
        self.run("generate_circle_code", self.codes.generate())
            .await
    }

    /// Pure date arithmetic, never touches the store
    pub fn check_circle_expiration(&self, expires_at: DateTime<Utc>) -> ApiResponse<ExpirationStatus> {
        ApiResponse::ok(ExpirationStatus::at(expires_at, Utc::now()))
    }

    pub async fn cleanup_expired_circles(&self) -> ApiResponse<usize> {
        self.run("cleanup_expired_circles", self.sweeper.sweep())
            .await
    }

    pub async fn delete_circle(&self, circle_id: Uuid) -> ApiResponse<()> {
        self.run("delete_circle", async {
            if self.lifecycle.delete(circle_id).await? {
                Ok(())
            } else {
                Err(CircleError::not_found("Circle not found"))
            }
        })
        .await
    }

    pub async fn get_circle(&self, circle_id: Uuid) -> ApiResponse<CircleOverview> {
        self.run("get_circle", async {
            let circle = self.require_circle(circle_id).await?;
            let progress = self.progress.progress(circle_id).await?;
            Ok(CircleOverview { circle, progress })
        })
        .await
    }

    async fn require_circle(&self, circle_id: Uuid) -> Result<Circle> {
        self.store
            .find_circle(&CircleFilter::by_id(circle_id))
            .await?
            .ok_or_else(|| CircleError::not_found("Circle not found"))
    }
}
