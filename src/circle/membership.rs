//! Joining, leaving and removing circle members

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::assignment::AssignmentStateMachine;
use super::lifecycle::CircleLifecycleManager;
use super::validation;
use crate::error::{CircleError, Result};
use crate::models::{
    AssignmentStatus, Circle, CircleMembership, Member, MemberSummary, MAX_MEMBERS,
};
use crate::store::{AssignmentFilter, CircleFilter, CircleStore, MemberFilter};

/// Outcome of a member leaving
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveOutcome {
    /// The organizer left, so the whole circle was deleted
    pub circle_deleted: bool,
}

/// The device's membership in an active circle, if it has one
pub(crate) async fn active_membership(
    store: &dyn CircleStore,
    device_id: &str,
) -> Result<Option<CircleMembership>> {
    for membership in store.select_members(&MemberFilter::by_device(device_id)).await? {
        let circle = store
            .find_circle(&CircleFilter::active().with_id(membership.circle_id))
            .await?;
        if let Some(circle) = circle {
            return Ok(Some(CircleMembership { circle, membership }));
        }
    }
    Ok(None)
}

#[derive(Clone)]
pub struct MembershipManager {
    store: Arc<dyn CircleStore>,
    lifecycle: CircleLifecycleManager,
    assignments: AssignmentStateMachine,
}

impl MembershipManager {
    pub fn new(
        store: Arc<dyn CircleStore>,
        lifecycle: CircleLifecycleManager,
        assignments: AssignmentStateMachine,
    ) -> Self {
        Self {
            store,
            lifecycle,
            assignments,
        }
    }

    pub async fn find_active(&self, device_id: &str) -> Result<Option<CircleMembership>> {
        active_membership(self.store.as_ref(), device_id).await
    }

    /// Resolve an invite code to a joinable circle
    pub async fn resolve_code(&self, code: &str) -> Result<Circle> {
        let code = validation::code(code)?;
        let circle = self
            .store
            .find_circle(&CircleFilter::active().with_code(code))
            .await?
            .ok_or_else(|| CircleError::not_found("Circle not found. Please check the code"))?;

        if circle.is_expired_at(Utc::now()) {
            return Err(CircleError::conflict("This circle has expired"));
        }
        Ok(circle)
    }

    pub async fn join(&self, code: &str, nickname: &str, device_id: &str) -> Result<CircleMembership> {
        let circle = self.resolve_code(code).await?;

        if let Some(existing) = self.find_active(device_id).await? {
            return Err(CircleError::conflict(format!(
                "You are already a member of the circle \"{}\"",
                existing.circle.name
            )));
        }

        let members = self
            .store
            .select_members(&MemberFilter::in_circle(circle.id))
            .await?;
        if members.len() >= MAX_MEMBERS {
            return Err(CircleError::conflict(format!(
                "This circle is full ({} members)",
                MAX_MEMBERS
            )));
        }
        if members.iter().any(|m| m.has_nickname(nickname)) {
            return Err(CircleError::conflict(format!(
                "The nickname \"{}\" is already taken in this circle",
                nickname.trim()
            )));
        }
        let nickname = validation::nickname(nickname)?;

        let membership = Member::new(circle.id, device_id, nickname, false);
        self.store.insert_member(&membership).await?;

        tracing::info!(
            circle_id = %circle.id,
            member_id = %membership.id,
            "Member joined circle"
        );
        Ok(CircleMembership { circle, membership })
    }

    pub async fn leave(&self, circle_id: Uuid, device_id: &str) -> Result<LeaveOutcome> {
        let member = self
            .store
            .find_member(&MemberFilter::in_circle(circle_id).with_device(device_id))
            .await?
            .ok_or_else(|| CircleError::not_found("You are not a member of this circle"))?;

        if member.is_organizer {
            tracing::info!(%circle_id, "Organizer left, deleting circle");
            self.lifecycle.delete(circle_id).await?;
            return Ok(LeaveOutcome {
                circle_deleted: true,
            });
        }

        self.detach(&member).await?;
        tracing::info!(%circle_id, member_id = %member.id, "Member left circle");
        Ok(LeaveOutcome {
            circle_deleted: false,
        })
    }

    /// Remove another member. The organizer cannot be removed.
    pub async fn remove(&self, circle_id: Uuid, member_id: Uuid) -> Result<()> {
        let member = self
            .store
            .find_member(&MemberFilter::in_circle(circle_id).with_id(member_id))
            .await?
            .ok_or_else(|| CircleError::not_found("Member not found in this circle"))?;

        if member.is_organizer {
            return Err(CircleError::conflict(
                "The organizer cannot be removed from the circle",
            ));
        }

        self.detach(&member).await?;
        tracing::info!(%circle_id, %member_id, "Member removed from circle");
        Ok(())
    }

    /// Release the member's units, then drop the member row
    async fn detach(&self, member: &Member) -> Result<()> {
        let released = self.assignments.release_member(member).await?;
        if released > 0 {
            tracing::debug!(member_id = %member.id, released, "Released member units");
        }
        self.store
            .delete_members(&MemberFilter::by_id(member.id))
            .await?;
        Ok(())
    }

    /// Members with their unit counts, organizer first then by join time
    pub async fn members(&self, circle_id: Uuid) -> Result<Vec<MemberSummary>> {
        let mut members = self
            .store
            .select_members(&MemberFilter::in_circle(circle_id))
            .await?;
        members.sort_by_key(|m| (!m.is_organizer, m.joined_at));

        let assignments = self
            .store
            .select_assignments(&AssignmentFilter::in_circle(circle_id))
            .await?;

        Ok(members
            .into_iter()
            .map(|member| {
                let held = assignments.iter().filter(|a| a.is_owned_by(member.id));
                let (assigned, completed) = held.fold((0u8, 0u8), |(assigned, completed), a| {
                    if a.status == AssignmentStatus::Completed {
                        (assigned, completed + 1)
                    } else {
                        (assigned + 1, completed)
                    }
                });
                MemberSummary {
                    member,
                    assigned_units: assigned,
                    completed_units: completed,
                }
            })
            .collect())
    }
}
