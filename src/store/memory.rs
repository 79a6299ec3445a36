//! In-memory implementation of `CircleStore`.
//!
//! Each table is a `Vec` behind its own `RwLock`, so every call is atomic on
//! its own but nothing spans tables, mirroring the hosted row store. Failure
//! injection lets tests exercise partial-failure paths.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    AssignmentFilter, AssignmentPatch, CircleFilter, CirclePatch, CircleStore, MemberFilter,
};
use crate::error::{CircleError, Result};
use crate::models::{Assignment, Circle, Member};

/// A store call that can be made to fail on purpose
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    InsertCircle,
    InsertMember,
    /// Fails when inserting the assignment for this unit
    InsertAssignment { unit_number: u8 },
    UpdateAssignments,
    DeleteAssignments,
    DeleteMembers,
    DeleteCircles,
}

/// Volatile row store. All data is lost when dropped.
pub struct MemoryStore {
    circles: RwLock<Vec<Circle>>,
    members: RwLock<Vec<Member>>,
    assignments: RwLock<Vec<Assignment>>,
    fail_points: RwLock<Vec<FailPoint>>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            circles: RwLock::new(Vec::new()),
            members: RwLock::new(Vec::new()),
            assignments: RwLock::new(Vec::new()),
            fail_points: RwLock::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Make every future call hitting `point` fail until cleared
    pub async fn fail_on(&self, point: FailPoint) {
        self.fail_points.write().await.push(point);
    }

    pub async fn clear_failures(&self) {
        self.fail_points.write().await.clear();
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    async fn check(&self, point: FailPoint) -> Result<()> {
        if self.fail_points.read().await.contains(&point) {
            return Err(CircleError::Unexpected(format!(
                "injected failure at {:?}",
                point
            )));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CircleStore for MemoryStore {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn insert_circle(&self, circle: &Circle) -> Result<()> {
        self.check(FailPoint::InsertCircle).await?;
        self.circles.write().await.push(circle.clone());
        Ok(())
    }

    async fn select_circles(&self, filter: &CircleFilter) -> Result<Vec<Circle>> {
        let circles = self.circles.read().await;
        let mut rows: Vec<Circle> = circles.iter().filter(|c| filter.matches(c)).cloned().collect();
        rows.sort_by_key(|c| c.created_at);
        Ok(rows)
    }

    async fn count_circles(&self, filter: &CircleFilter) -> Result<u64> {
        let circles = self.circles.read().await;
        Ok(circles.iter().filter(|c| filter.matches(c)).count() as u64)
    }

    async fn update_circles(&self, filter: &CircleFilter, patch: &CirclePatch) -> Result<u64> {
        let mut circles = self.circles.write().await;
        let mut affected = 0;
        for circle in circles.iter_mut().filter(|c| filter.matches(c)) {
            patch.apply(circle);
            affected += 1;
        }
        Ok(affected)
    }

    async fn delete_circles(&self, filter: &CircleFilter) -> Result<u64> {
        self.check(FailPoint::DeleteCircles).await?;
        let mut circles = self.circles.write().await;
        let before = circles.len();
        circles.retain(|c| !filter.matches(c));
        Ok((before - circles.len()) as u64)
    }

    async fn insert_member(&self, member: &Member) -> Result<()> {
        self.check(FailPoint::InsertMember).await?;
        self.members.write().await.push(member.clone());
        Ok(())
    }

    async fn select_members(&self, filter: &MemberFilter) -> Result<Vec<Member>> {
        let members = self.members.read().await;
        let mut rows: Vec<Member> = members.iter().filter(|m| filter.matches(m)).cloned().collect();
        rows.sort_by_key(|m| m.joined_at);
        Ok(rows)
    }

    async fn count_members(&self, filter: &MemberFilter) -> Result<u64> {
        let members = self.members.read().await;
        Ok(members.iter().filter(|m| filter.matches(m)).count() as u64)
    }

    async fn delete_members(&self, filter: &MemberFilter) -> Result<u64> {
        self.check(FailPoint::DeleteMembers).await?;
        let mut members = self.members.write().await;
        let before = members.len();
        members.retain(|m| !filter.matches(m));
        Ok((before - members.len()) as u64)
    }

    async fn insert_assignment(&self, assignment: &Assignment) -> Result<()> {
        self.check(FailPoint::InsertAssignment {
            unit_number: assignment.unit_number,
        })
        .await?;
        self.assignments.write().await.push(assignment.clone());
        Ok(())
    }

    async fn select_assignments(&self, filter: &AssignmentFilter) -> Result<Vec<Assignment>> {
        let assignments = self.assignments.read().await;
        let mut rows: Vec<Assignment> = assignments
            .iter()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.unit_number);
        Ok(rows)
    }

    async fn count_assignments(&self, filter: &AssignmentFilter) -> Result<u64> {
        let assignments = self.assignments.read().await;
        Ok(assignments.iter().filter(|a| filter.matches(a)).count() as u64)
    }

    async fn update_assignments(
        &self,
        filter: &AssignmentFilter,
        patch: &AssignmentPatch,
    ) -> Result<u64> {
        self.check(FailPoint::UpdateAssignments).await?;
        let mut assignments = self.assignments.write().await;
        let mut affected = 0;
        for assignment in assignments.iter_mut().filter(|a| filter.matches(a)) {
            patch.apply(assignment);
            affected += 1;
        }
        Ok(affected)
    }

    async fn delete_assignments(&self, filter: &AssignmentFilter) -> Result<u64> {
        self.check(FailPoint::DeleteAssignments).await?;
        let mut assignments = self.assignments.write().await;
        let before = assignments.len();
        assignments.retain(|a| !filter.matches(a));
        Ok((before - assignments.len()) as u64)
    }
}
