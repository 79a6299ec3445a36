//! Row-store abstraction for circles, members and assignments.
//!
//! The coordination logic only ever talks to a [`CircleStore`]: insert one
//! row, select/count/update/delete rows matching equality filters. No
//! operation spans more than one table and there are no transactions, so
//! callers must be prepared for a multi-step operation to stop half way.

mod memory;
mod sqlite;

pub use memory::{FailPoint, MemoryStore};
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Assignment, AssignmentStatus, Circle, CircleStatus, Member};

/// Filter over the `circles` table; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CircleFilter {
    pub id: Option<Uuid>,
    pub code: Option<String>,
    pub status: Option<CircleStatus>,
    /// Matches circles whose `expires_at` is strictly earlier
    pub expires_before: Option<DateTime<Utc>>,
}

impl CircleFilter {
    pub fn by_id(id: Uuid) -> Self {
        Self {
            id: Some(id),
            ..Default::default()
        }
    }

    pub fn active() -> Self {
        Self {
            status: Some(CircleStatus::Active),
            ..Default::default()
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn expiring_before(mut self, instant: DateTime<Utc>) -> Self {
        self.expires_before = Some(instant);
        self
    }

    pub fn matches(&self, circle: &Circle) -> bool {
        self.id.map_or(true, |id| circle.id == id)
            && self.code.as_deref().map_or(true, |code| circle.code == code)
            && self.status.map_or(true, |status| circle.status == status)
            && self
                .expires_before
                .map_or(true, |instant| circle.is_expired_at(instant))
    }
}

/// Filter over the `circle_members` table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemberFilter {
    pub id: Option<Uuid>,
    pub circle_id: Option<Uuid>,
    pub device_id: Option<String>,
}

impl MemberFilter {
    pub fn by_id(id: Uuid) -> Self {
        Self {
            id: Some(id),
            ..Default::default()
        }
    }

    pub fn in_circle(circle_id: Uuid) -> Self {
        Self {
            circle_id: Some(circle_id),
            ..Default::default()
        }
    }

    pub fn by_device(device_id: impl Into<String>) -> Self {
        Self {
            device_id: Some(device_id.into()),
            ..Default::default()
        }
    }

    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn matches(&self, member: &Member) -> bool {
        self.id.map_or(true, |id| member.id == id)
            && self.circle_id.map_or(true, |id| member.circle_id == id)
            && self
                .device_id
                .as_deref()
                .map_or(true, |device| member.device_id == device)
    }
}

/// Filter over the `circle_assignments` table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssignmentFilter {
    pub id: Option<Uuid>,
    pub circle_id: Option<Uuid>,
    pub unit_number: Option<u8>,
    pub member_id: Option<Uuid>,
    pub status: Option<AssignmentStatus>,
}

impl AssignmentFilter {
    pub fn in_circle(circle_id: Uuid) -> Self {
        Self {
            circle_id: Some(circle_id),
            ..Default::default()
        }
    }

    pub fn unit(circle_id: Uuid, unit_number: u8) -> Self {
        Self {
            circle_id: Some(circle_id),
            unit_number: Some(unit_number),
            ..Default::default()
        }
    }

    pub fn with_member(mut self, member_id: Uuid) -> Self {
        self.member_id = Some(member_id);
        self
    }

    pub fn with_status(mut self, status: AssignmentStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, assignment: &Assignment) -> bool {
        self.id.map_or(true, |id| assignment.id == id)
            && self.circle_id.map_or(true, |id| assignment.circle_id == id)
            && self
                .unit_number
                .map_or(true, |unit| assignment.unit_number == unit)
            && self
                .member_id
                .map_or(true, |id| assignment.member_id == Some(id))
            && self.status.map_or(true, |status| assignment.status == status)
    }
}

/// Column changes for `circles`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CirclePatch {
    pub completed_units: Option<u8>,
    pub status: Option<CircleStatus>,
}

impl CirclePatch {
    pub fn is_empty(&self) -> bool {
        self.completed_units.is_none() && self.status.is_none()
    }

    pub fn apply(&self, circle: &mut Circle) {
        if let Some(units) = self.completed_units {
            circle.completed_units = units;
        }
        if let Some(status) = self.status {
            circle.status = status;
        }
    }
}

/// Column changes for `circle_assignments`.
///
/// Nullable columns use `Option<Option<_>>`: `Some(None)` writes NULL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssignmentPatch {
    pub member_id: Option<Option<Uuid>>,
    pub status: Option<AssignmentStatus>,
    pub assigned_at: Option<Option<DateTime<Utc>>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
}

impl AssignmentPatch {
    pub fn assign(member_id: Uuid, at: DateTime<Utc>) -> Self {
        Self {
            member_id: Some(Some(member_id)),
            status: Some(AssignmentStatus::Assigned),
            assigned_at: Some(Some(at)),
            completed_at: None,
        }
    }

    pub fn release() -> Self {
        Self {
            member_id: Some(None),
            status: Some(AssignmentStatus::Unassigned),
            assigned_at: Some(None),
            completed_at: None,
        }
    }

    pub fn status(status: AssignmentStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn complete(at: DateTime<Utc>) -> Self {
        Self {
            status: Some(AssignmentStatus::Completed),
            completed_at: Some(Some(at)),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.member_id.is_none()
            && self.status.is_none()
            && self.assigned_at.is_none()
            && self.completed_at.is_none()
    }

    pub fn apply(&self, assignment: &mut Assignment) {
        if let Some(member_id) = self.member_id {
            assignment.member_id = member_id;
        }
        if let Some(status) = self.status {
            assignment.status = status;
        }
        if let Some(assigned_at) = self.assigned_at {
            assignment.assigned_at = assigned_at;
        }
        if let Some(completed_at) = self.completed_at {
            assignment.completed_at = completed_at;
        }
    }
}

/// Generic filtered-row store backing the coordination logic.
///
/// Selects return rows in a stable order: circles by creation time, members
/// by join time, assignments by unit number. Update and delete return the
/// number of affected rows.
#[async_trait]
pub trait CircleStore: Send + Sync {
    /// Whether the store is configured and reachable. Checked before any call.
    fn is_available(&self) -> bool;

    async fn insert_circle(&self, circle: &Circle) -> Result<()>;
    async fn select_circles(&self, filter: &CircleFilter) -> Result<Vec<Circle>>;
    async fn count_circles(&self, filter: &CircleFilter) -> Result<u64>;
    async fn update_circles(&self, filter: &CircleFilter, patch: &CirclePatch) -> Result<u64>;
    async fn delete_circles(&self, filter: &CircleFilter) -> Result<u64>;

    async fn insert_member(&self, member: &Member) -> Result<()>;
    async fn select_members(&self, filter: &MemberFilter) -> Result<Vec<Member>>;
    async fn count_members(&self, filter: &MemberFilter) -> Result<u64>;
    async fn delete_members(&self, filter: &MemberFilter) -> Result<u64>;

    async fn insert_assignment(&self, assignment: &Assignment) -> Result<()>;
    async fn select_assignments(&self, filter: &AssignmentFilter) -> Result<Vec<Assignment>>;
    async fn count_assignments(&self, filter: &AssignmentFilter) -> Result<u64>;
    async fn update_assignments(
        &self,
        filter: &AssignmentFilter,
        patch: &AssignmentPatch,
    ) -> Result<u64>;
    async fn delete_assignments(&self, filter: &AssignmentFilter) -> Result<u64>;

    /// First circle matching `filter`, if any
    async fn find_circle(&self, filter: &CircleFilter) -> Result<Option<Circle>> {
        Ok(self.select_circles(filter).await?.into_iter().next())
    }

    async fn find_member(&self, filter: &MemberFilter) -> Result<Option<Member>> {
        Ok(self.select_members(filter).await?.into_iter().next())
    }

    async fn find_assignment(&self, filter: &AssignmentFilter) -> Result<Option<Assignment>> {
        Ok(self.select_assignments(filter).await?.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_circle_filter_matches() {
        let circle = Circle::new("ABCD-EFGH", "Family", "dev-a", Utc::now() + Duration::days(3));
        assert!(CircleFilter::default().matches(&circle));
        assert!(CircleFilter::active().with_code("ABCD-EFGH").matches(&circle));
        assert!(!CircleFilter::active().with_code("ABCD-EFGX").matches(&circle));
        assert!(!CircleFilter::active()
            .expiring_before(Utc::now())
            .matches(&circle));
        assert!(CircleFilter::active()
            .expiring_before(Utc::now() + Duration::days(4))
            .matches(&circle));
    }

    #[test]
    fn test_assignment_filter_member_requires_holder() {
        let circle_id = Uuid::new_v4();
        let member_id = Uuid::new_v4();
        let mut row = Assignment::unassigned(circle_id, 7);
        let filter = AssignmentFilter::in_circle(circle_id).with_member(member_id);
        assert!(!filter.matches(&row));

        AssignmentPatch::assign(member_id, Utc::now()).apply(&mut row);
        assert!(filter.matches(&row));
        assert!(AssignmentFilter::unit(circle_id, 7)
            .with_status(AssignmentStatus::Assigned)
            .matches(&row));
    }

    #[test]
    fn test_release_patch_clears_holder() {
        let mut row = Assignment::unassigned(Uuid::new_v4(), 1);
        AssignmentPatch::assign(Uuid::new_v4(), Utc::now()).apply(&mut row);
        AssignmentPatch::release().apply(&mut row);
        assert_eq!(row.status, AssignmentStatus::Unassigned);
        assert!(row.member_id.is_none());
        assert!(row.assigned_at.is_none());
    }

    #[test]
    fn test_empty_patches() {
        assert!(CirclePatch::default().is_empty());
        assert!(AssignmentPatch::default().is_empty());
        assert!(!AssignmentPatch::status(AssignmentStatus::InProgress).is_empty());
    }
}
