//! Per-unit assignment state machine
//!
//! `unassigned -> assigned -> in_progress -> completed`, where completed is
//! terminal. Every row write goes through [`AssignmentStateMachine::write_assignment`]
//! so the update mode is applied in one place.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::progress::ProgressAggregator;
use super::validation;
use crate::error::{CircleError, Result};
use crate::models::{Assignment, AssignmentStatus, Member, Progress};
use crate::store::{AssignmentFilter, AssignmentPatch, CircleStore, MemberFilter};

/// How concurrent writes to the same unit are resolved
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    /// Overwrite whatever is stored; the last writer wins
    #[default]
    LastWriteWins,
    /// Only write if the row still has the status that was read
    CompareStatus,
}

/// Unsaved unit edits: `Some(member)` assigns, `None` unassigns
pub type PendingEdits = BTreeMap<u8, Option<Uuid>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitFailure {
    pub unit_number: u8,
    pub error: String,
}

/// Per-unit tally of a batch; units are processed independently
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub succeeded: Vec<u8>,
    pub failed: Vec<UnitFailure>,
}

impl BatchOutcome {
    pub fn error_count(&self) -> usize {
        self.failed.len()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    fn record<T>(&mut self, unit_number: u8, result: Result<T>) {
        match result {
            Ok(_) => self.succeeded.push(unit_number),
            Err(e) => {
                tracing::debug!(unit_number, error = %e, "Batch unit failed");
                self.failed.push(UnitFailure {
                    unit_number,
                    error: e.user_message(),
                });
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionOutcome {
    pub assignment: Assignment,
    pub progress: Progress,
    /// This call finished the last unit of the circle
    pub circle_completed: bool,
}

#[derive(Clone)]
pub struct AssignmentStateMachine {
    store: Arc<dyn CircleStore>,
    progress: ProgressAggregator,
    mode: UpdateMode,
}

impl AssignmentStateMachine {
    pub fn new(store: Arc<dyn CircleStore>, progress: ProgressAggregator, mode: UpdateMode) -> Self {
        Self {
            store,
            progress,
            mode,
        }
    }

    async fn load(&self, circle_id: Uuid, unit_number: u8) -> Result<Assignment> {
        let unit_number = validation::unit_number(unit_number)?;
        self.store
            .find_assignment(&AssignmentFilter::unit(circle_id, unit_number))
            .await?
            .ok_or_else(|| CircleError::not_found("Unit not found in this circle"))
    }

    async fn caller(&self, circle_id: Uuid, device_id: &str) -> Result<Member> {
        self.store
            .find_member(&MemberFilter::in_circle(circle_id).with_device(device_id))
            .await?
            .ok_or_else(|| CircleError::not_found("You are not a member of this circle"))
    }

    /// Apply `patch` to the row `current` was read from
    async fn write_assignment(
        &self,
        current: &Assignment,
        patch: AssignmentPatch,
    ) -> Result<Assignment> {
        let mut filter = AssignmentFilter::unit(current.circle_id, current.unit_number);
        if self.mode == UpdateMode::CompareStatus {
            filter = filter.with_status(current.status);
        }

        let affected = self.store.update_assignments(&filter, &patch).await?;
        if affected == 0 {
            return Err(match self.mode {
                UpdateMode::CompareStatus => CircleError::conflict(format!(
                    "Unit {} was changed concurrently, please retry",
                    current.unit_number
                )),
                UpdateMode::LastWriteWins => CircleError::not_found("Unit not found in this circle"),
            });
        }

        let mut next = current.clone();
        patch.apply(&mut next);
        tracing::debug!(
            circle_id = %next.circle_id,
            unit_number = next.unit_number,
            from = current.status.as_str(),
            to = next.status.as_str(),
            "Assignment updated"
        );
        Ok(next)
    }

    fn reject_completed(assignment: &Assignment) -> Result<()> {
        if assignment.status.is_terminal() {
            return Err(CircleError::conflict(format!(
                "Unit {} is already completed",
                assignment.unit_number
            )));
        }
        Ok(())
    }

    /// Give a unit to a member, taking it from any previous holder
    pub async fn assign(&self, circle_id: Uuid, unit_number: u8, member_id: Uuid) -> Result<Assignment> {
        let current = self.load(circle_id, unit_number).await?;
        self.store
            .find_member(&MemberFilter::in_circle(circle_id).with_id(member_id))
            .await?
            .ok_or_else(|| CircleError::not_found("Member not found in this circle"))?;
        Self::reject_completed(&current)?;

        self.write_assignment(&current, AssignmentPatch::assign(member_id, Utc::now()))
            .await
    }

    pub async fn unassign(&self, circle_id: Uuid, unit_number: u8) -> Result<Assignment> {
        let current = self.load(circle_id, unit_number).await?;
        Self::reject_completed(&current)?;
        if current.status == AssignmentStatus::Unassigned {
            return Ok(current);
        }

        self.write_assignment(&current, AssignmentPatch::release()).await
    }

    /// The caller's own unit, checked for ownership
    async fn owned_unit(&self, circle_id: Uuid, unit_number: u8, device_id: &str) -> Result<Assignment> {
        let member = self.caller(circle_id, device_id).await?;
        let current = self.load(circle_id, unit_number).await?;
        if !current.is_owned_by(member.id) {
            return Err(CircleError::conflict(format!(
                "Unit {} is not assigned to you",
                current.unit_number
            )));
        }
        Ok(current)
    }

    pub async fn mark_in_progress(
        &self,
        circle_id: Uuid,
        unit_number: u8,
        device_id: &str,
    ) -> Result<Assignment> {
        let current = self.owned_unit(circle_id, unit_number, device_id).await?;
        Self::reject_completed(&current)?;
        if current.status == AssignmentStatus::InProgress {
            return Ok(current);
        }

        self.write_assignment(&current, AssignmentPatch::status(AssignmentStatus::InProgress))
            .await
    }

    /// Finish a unit and refresh the circle's counters
    pub async fn mark_completed(
        &self,
        circle_id: Uuid,
        unit_number: u8,
        device_id: &str,
    ) -> Result<CompletionOutcome> {
        let current = self.owned_unit(circle_id, unit_number, device_id).await?;
        Self::reject_completed(&current)?;

        let assignment = self
            .write_assignment(&current, AssignmentPatch::complete(Utc::now()))
            .await?;
        let update = self.progress.recompute(circle_id).await?;

        tracing::info!(
            %circle_id,
            unit_number = assignment.unit_number,
            completed = update.progress.completed,
            "Unit completed"
        );
        Ok(CompletionOutcome {
            assignment,
            progress: update.progress,
            circle_completed: update.circle_completed,
        })
    }

    /// Return a departing member's held units to the pool. Completed units
    /// keep their holder.
    pub async fn release_member(&self, member: &Member) -> Result<usize> {
        let owned = self
            .store
            .select_assignments(
                &AssignmentFilter::in_circle(member.circle_id).with_member(member.id),
            )
            .await?;

        let mut released = 0;
        for current in owned.iter().filter(|a| a.status.is_held()) {
            self.write_assignment(current, AssignmentPatch::release()).await?;
            released += 1;
        }
        Ok(released)
    }

    pub async fn assign_many(&self, circle_id: Uuid, units: &[u8], member_id: Uuid) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for unit in ascending(units) {
            outcome.record(unit, self.assign(circle_id, unit, member_id).await);
        }
        outcome
    }

    pub async fn unassign_many(&self, circle_id: Uuid, units: &[u8]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for unit in ascending(units) {
            outcome.record(unit, self.unassign(circle_id, unit).await);
        }
        outcome
    }

    /// Save a set of unit edits in ascending unit order. Not atomic.
    pub async fn apply_edits(&self, circle_id: Uuid, edits: &PendingEdits) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for (&unit, target) in edits {
            let result = match target {
                Some(member_id) => self.assign(circle_id, unit, *member_id).await,
                None => self.unassign(circle_id, unit).await,
            };
            outcome.record(unit, result);
        }

        if !outcome.is_success() {
            tracing::warn!(
                %circle_id,
                failed = outcome.error_count(),
                succeeded = outcome.succeeded.len(),
                "Some unit edits could not be saved"
            );
        }
        outcome
    }

    /// All units of a circle by unit number
    pub async fn list(&self, circle_id: Uuid) -> Result<Vec<Assignment>> {
        self.store
            .select_assignments(&AssignmentFilter::in_circle(circle_id))
            .await
    }

    pub async fn list_for_device(&self, circle_id: Uuid, device_id: &str) -> Result<Vec<Assignment>> {
        let member = self.caller(circle_id, device_id).await?;
        self.store
            .select_assignments(&AssignmentFilter::in_circle(circle_id).with_member(member.id))
            .await
    }
}

fn ascending(units: &[u8]) -> Vec<u8> {
    let mut units = units.to_vec();
    units.sort_unstable();
    units.dedup();
    units
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Circle, CircleStatus};
    use crate::store::{CircleFilter, FailPoint, MemoryStore};
    use chrono::Duration;

    struct Fixture {
        store: Arc<MemoryStore>,
        machine: AssignmentStateMachine,
        circle_id: Uuid,
        organizer: Member,
        reader: Member,
    }

    async fn fixture(mode: UpdateMode) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let circle = Circle::new("ABCD-EFGH", "Family", "device-a", Utc::now() + Duration::days(5));
        store.insert_circle(&circle).await.unwrap();
        let organizer = Member::new(circle.id, "device-a", "Dad", true);
        let reader = Member::new(circle.id, "device-b", "Mom", false);
        store.insert_member(&organizer).await.unwrap();
        store.insert_member(&reader).await.unwrap();
        for row in Assignment::initial_set(circle.id) {
            store.insert_assignment(&row).await.unwrap();
        }

        let progress = ProgressAggregator::new(store.clone());
        let machine = AssignmentStateMachine::new(store.clone(), progress, mode);
        Fixture {
            store,
            machine,
            circle_id: circle.id,
            organizer,
            reader,
        }
    }

    async fn unit(f: &Fixture, n: u8) -> Assignment {
        f.store
            .find_assignment(&AssignmentFilter::unit(f.circle_id, n))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_assign_and_reassign() {
        let f = fixture(UpdateMode::default()).await;
        let row = f.machine.assign(f.circle_id, 5, f.reader.id).await.unwrap();
        assert_eq!(row.status, AssignmentStatus::Assigned);
        assert_eq!(row.member_id, Some(f.reader.id));
        assert!(row.assigned_at.is_some());

        f.machine.assign(f.circle_id, 5, f.organizer.id).await.unwrap();
        assert_eq!(unit(&f, 5).await.member_id, Some(f.organizer.id));
    }

    #[tokio::test]
    async fn test_release_member_keeps_completed_units() {
        let f = fixture(UpdateMode::CompareStatus).await;
        f.machine
            .assign_many(f.circle_id, &[1, 2, 3], f.reader.id)
            .await;
        f.machine.assign(f.circle_id, 4, f.organizer.id).await.unwrap();
        f.machine.mark_in_progress(f.circle_id, 2, "device-b").await.unwrap();
        f.machine.mark_completed(f.circle_id, 3, "device-b").await.unwrap();

        let released = f.machine.release_member(&f.reader).await.unwrap();
        assert_eq!(released, 2);

        for n in [1, 2] {
            let row = unit(&f, n).await;
            assert_eq!(row.status, AssignmentStatus::Unassigned);
            assert!(row.member_id.is_none());
        }
        let done = unit(&f, 3).await;
        assert_eq!(done.status, AssignmentStatus::Completed);
        assert_eq!(done.member_id, Some(f.reader.id));
        assert_eq!(unit(&f, 4).await.member_id, Some(f.organizer.id));

        assert_eq!(f.machine.release_member(&f.reader).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_assign_validates_unit_and_member() {
        let f = fixture(UpdateMode::default()).await;
        assert!(matches!(
            f.machine.assign(f.circle_id, 0, f.reader.id).await,
            Err(CircleError::Validation(_))
        ));
        assert!(matches!(
            f.machine.assign(f.circle_id, 31, f.reader.id).await,
            Err(CircleError::Validation(_))
        ));
        assert!(matches!(
            f.machine.assign(f.circle_id, 3, Uuid::new_v4()).await,
            Err(CircleError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_full_lifecycle_of_a_unit() {
        let f = fixture(UpdateMode::default()).await;
        f.machine.assign(f.circle_id, 1, f.reader.id).await.unwrap();

        let row = f
            .machine
            .mark_in_progress(f.circle_id, 1, "device-b")
            .await
            .unwrap();
        assert_eq!(row.status, AssignmentStatus::InProgress);

        let again = f
            .machine
            .mark_in_progress(f.circle_id, 1, "device-b")
            .await
            .unwrap();
        assert_eq!(again.status, AssignmentStatus::InProgress);

        let outcome = f
            .machine
            .mark_completed(f.circle_id, 1, "device-b")
            .await
            .unwrap();
        assert_eq!(outcome.assignment.status, AssignmentStatus::Completed);
        assert!(outcome.assignment.completed_at.is_some());
        assert_eq!(outcome.progress.completed, 1);
        assert_eq!(outcome.progress.percentage, 3);
        assert!(!outcome.circle_completed);
    }

    #[tokio::test]
    async fn test_completed_unit_is_frozen() {
        let f = fixture(UpdateMode::default()).await;
        f.machine.assign(f.circle_id, 2, f.reader.id).await.unwrap();
        f.machine
            .mark_completed(f.circle_id, 2, "device-b")
            .await
            .unwrap();
        let before = unit(&f, 2).await;

        assert!(matches!(
            f.machine.assign(f.circle_id, 2, f.organizer.id).await,
            Err(CircleError::Conflict(_))
        ));
        assert!(matches!(
            f.machine.unassign(f.circle_id, 2).await,
            Err(CircleError::Conflict(_))
        ));
        assert!(matches!(
            f.machine.mark_in_progress(f.circle_id, 2, "device-b").await,
            Err(CircleError::Conflict(_))
        ));
        assert!(matches!(
            f.machine.mark_completed(f.circle_id, 2, "device-b").await,
            Err(CircleError::Conflict(_))
        ));
        assert_eq!(unit(&f, 2).await, before);
    }

    #[tokio::test]
    async fn test_ownership_checks() {
        let f = fixture(UpdateMode::default()).await;
        f.machine.assign(f.circle_id, 4, f.organizer.id).await.unwrap();

        match f.machine.mark_in_progress(f.circle_id, 4, "device-b").await {
            Err(CircleError::Conflict(msg)) => assert!(msg.contains("not assigned to you")),
            other => panic!("expected conflict, got {:?}", other),
        }
        match f.machine.mark_completed(f.circle_id, 4, "stranger").await {
            Err(CircleError::NotFound(msg)) => assert!(msg.contains("not a member")),
            other => panic!("expected not found, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_completing_last_unit_completes_circle() {
        let f = fixture(UpdateMode::default()).await;
        let all: Vec<u8> = (1..=30).collect();
        let batch = f.machine.assign_many(f.circle_id, &all, f.reader.id).await;
        assert_eq!(batch.succeeded.len(), 30);

        for n in 1..30 {
            let outcome = f
                .machine
                .mark_completed(f.circle_id, n, "device-b")
                .await
                .unwrap();
            assert!(!outcome.circle_completed);
            let circle = f
                .store
                .find_circle(&CircleFilter::by_id(f.circle_id))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(circle.completed_units, n);
        }

        let last = f
            .machine
            .mark_completed(f.circle_id, 30, "device-b")
            .await
            .unwrap();
        assert!(last.circle_completed);
        assert_eq!(last.progress.percentage, 100);

        let circle = f
            .store
            .find_circle(&CircleFilter::by_id(f.circle_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(circle.status, CircleStatus::Completed);
    }

    #[tokio::test]
    async fn test_unassign() {
        let f = fixture(UpdateMode::default()).await;
        f.machine.assign(f.circle_id, 6, f.reader.id).await.unwrap();
        let row = f.machine.unassign(f.circle_id, 6).await.unwrap();
        assert_eq!(row.status, AssignmentStatus::Unassigned);
        assert!(row.member_id.is_none());
        assert!(row.assigned_at.is_none());

        // Already free
        let row = f.machine.unassign(f.circle_id, 6).await.unwrap();
        assert_eq!(row.status, AssignmentStatus::Unassigned);
    }

    #[tokio::test]
    async fn test_apply_edits_reports_per_unit() {
        let f = fixture(UpdateMode::default()).await;
        f.machine.assign(f.circle_id, 9, f.reader.id).await.unwrap();
        f.machine
            .mark_completed(f.circle_id, 9, "device-b")
            .await
            .unwrap();

        let mut edits = PendingEdits::new();
        edits.insert(12, Some(f.reader.id));
        edits.insert(9, Some(f.organizer.id));
        edits.insert(3, Some(f.organizer.id));
        edits.insert(7, None);
        edits.insert(40, Some(f.reader.id));

        let outcome = f.machine.apply_edits(f.circle_id, &edits).await;
        assert_eq!(outcome.succeeded, vec![3, 7, 12]);
        assert_eq!(outcome.error_count(), 2);
        assert_eq!(outcome.failed[0].unit_number, 9);
        assert!(outcome.failed[0].error.contains("completed"));
        assert_eq!(outcome.failed[1].unit_number, 40);

        assert_eq!(unit(&f, 3).await.member_id, Some(f.organizer.id));
        assert_eq!(unit(&f, 12).await.member_id, Some(f.reader.id));
    }

    #[tokio::test]
    async fn test_batch_failures_hide_internal_errors() {
        let f = fixture(UpdateMode::default()).await;
        f.store.fail_on(FailPoint::UpdateAssignments).await;

        let outcome = f.machine.assign_many(f.circle_id, &[2, 1, 2], f.reader.id).await;
        assert!(outcome.succeeded.is_empty());
        assert_eq!(
            outcome.failed.iter().map(|u| u.unit_number).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(outcome.failed[0].error, crate::error::GENERIC_FAILURE);
    }

    #[tokio::test]
    async fn test_unassign_many() {
        let f = fixture(UpdateMode::default()).await;
        f.machine
            .assign_many(f.circle_id, &[1, 2, 3], f.reader.id)
            .await;
        let outcome = f.machine.unassign_many(f.circle_id, &[3, 1]).await;
        assert_eq!(outcome.succeeded, vec![1, 3]);

        let mine = f
            .machine
            .list_for_device(f.circle_id, "device-b")
            .await
            .unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].unit_number, 2);
    }

    #[tokio::test]
    async fn test_last_write_wins_overwrites_stale_read() {
        let f = fixture(UpdateMode::LastWriteWins).await;
        let stale = unit(&f, 8).await;
        f.machine.assign(f.circle_id, 8, f.reader.id).await.unwrap();

        let row = f
            .machine
            .write_assignment(&stale, AssignmentPatch::assign(f.organizer.id, Utc::now()))
            .await
            .unwrap();
        assert_eq!(row.member_id, Some(f.organizer.id));
        assert_eq!(unit(&f, 8).await.member_id, Some(f.organizer.id));
    }

    #[tokio::test]
    async fn test_compare_status_rejects_stale_read() {
        let f = fixture(UpdateMode::CompareStatus).await;
        let stale = unit(&f, 8).await;
        f.machine.assign(f.circle_id, 8, f.reader.id).await.unwrap();

        match f
            .machine
            .write_assignment(&stale, AssignmentPatch::assign(f.organizer.id, Utc::now()))
            .await
        {
            Err(CircleError::Conflict(msg)) => assert!(msg.contains("changed concurrently")),
            other => panic!("expected conflict, got {:?}", other),
        }
        assert_eq!(unit(&f, 8).await.member_id, Some(f.reader.id));
    }

    #[tokio::test]
    async fn test_list_is_ordered() {
        let f = fixture(UpdateMode::default()).await;
        let rows = f.machine.list(f.circle_id).await.unwrap();
        let units: Vec<u8> = rows.iter().map(|a| a.unit_number).collect();
        assert_eq!(units, (1..=30).collect::<Vec<u8>>());
    }
}
