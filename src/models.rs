//! Data models for circles, members and unit assignments

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Number of units every circle is split into
pub const TOTAL_UNITS: u8 = 30;

/// Upper bound on members per circle
pub const MAX_MEMBERS: usize = 30;

pub const MAX_NAME_LEN: usize = 50;
pub const MAX_NICKNAME_LEN: usize = 20;

/// A reading circle: a group jointly completing all 30 units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Circle {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub organizer_device_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub total_units: u8,
    pub completed_units: u8,
    pub status: CircleStatus,
}

impl Circle {
    /// A fresh active circle with nothing completed
    pub fn new(
        code: impl Into<String>,
        name: impl Into<String>,
        organizer_device_id: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            code: code.into(),
            name: name.into(),
            organizer_device_id: organizer_device_id.into(),
            created_at: Utc::now(),
            expires_at,
            total_units: TOTAL_UNITS,
            completed_units: 0,
            status: CircleStatus::Active,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        is_expired(self.expires_at, now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircleStatus {
    Active,
    Completed,
}

impl CircleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircleStatus::Active => "active",
            CircleStatus::Completed => "completed",
        }
    }
}

impl std::str::FromStr for CircleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(CircleStatus::Active),
            "completed" => Ok(CircleStatus::Completed),
            _ => Err(format!("Invalid circle status: {}", s)),
        }
    }
}

/// A device participating in a circle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: Uuid,
    pub circle_id: Uuid,
    pub device_id: String,
    pub nickname: String,
    pub joined_at: DateTime<Utc>,
    pub is_organizer: bool,
}

impl Member {
    pub fn new(
        circle_id: Uuid,
        device_id: impl Into<String>,
        nickname: impl Into<String>,
        is_organizer: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            circle_id,
            device_id: device_id.into(),
            nickname: nickname.into(),
            joined_at: Utc::now(),
            is_organizer,
        }
    }

    /// Case-insensitive nickname comparison
    pub fn has_nickname(&self, nickname: &str) -> bool {
        self.nickname.to_lowercase() == nickname.trim().to_lowercase()
    }
}

/// Progress status of a single unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    /// Nobody holds the unit
    Unassigned,
    /// Held by a member, not started
    Assigned,
    /// Holder is reading it
    InProgress,
    /// Read; never changes again
    Completed,
}

impl AssignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentStatus::Unassigned => "unassigned",
            AssignmentStatus::Assigned => "assigned",
            AssignmentStatus::InProgress => "in_progress",
            AssignmentStatus::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AssignmentStatus::Completed)
    }

    /// Whether a member currently holds the unit
    pub fn is_held(&self) -> bool {
        matches!(self, AssignmentStatus::Assigned | AssignmentStatus::InProgress)
    }
}

impl std::str::FromStr for AssignmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unassigned" => Ok(AssignmentStatus::Unassigned),
            "assigned" => Ok(AssignmentStatus::Assigned),
            "in_progress" => Ok(AssignmentStatus::InProgress),
            "completed" => Ok(AssignmentStatus::Completed),
            _ => Err(format!("Invalid assignment status: {}", s)),
        }
    }
}

/// Binding of one unit of a circle to at most one member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: Uuid,
    pub circle_id: Uuid,
    pub unit_number: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub member_id: Option<Uuid>,
    pub status: AssignmentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Assignment {
    pub fn unassigned(circle_id: Uuid, unit_number: u8) -> Self {
        Self {
            id: Uuid::new_v4(),
            circle_id,
            unit_number,
            member_id: None,
            status: AssignmentStatus::Unassigned,
            assigned_at: None,
            completed_at: None,
        }
    }

    /// The full set of rows a new circle starts with
    pub fn initial_set(circle_id: Uuid) -> Vec<Self> {
        (1..=TOTAL_UNITS)
            .map(|unit| Self::unassigned(circle_id, unit))
            .collect()
    }

    pub fn is_owned_by(&self, member_id: Uuid) -> bool {
        self.member_id == Some(member_id)
    }
}

/// Completion figures for a circle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub completed: u8,
    pub total: u8,
    pub percentage: u8,
}

impl Progress {
    pub fn from_completed(completed: u8) -> Self {
        let percentage = (f64::from(completed) / f64::from(TOTAL_UNITS) * 100.0).round() as u8;
        Self {
            completed,
            total: TOTAL_UNITS,
            percentage,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed >= self.total
    }
}

/// A member together with how many units they hold and have finished
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberSummary {
    #[serde(flatten)]
    pub member: Member,
    pub assigned_units: u8,
    pub completed_units: u8,
}

/// A circle with its live progress
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircleOverview {
    pub circle: Circle,
    pub progress: Progress,
}

/// A device's membership in an active circle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircleMembership {
    pub circle: Circle,
    pub membership: Member,
}

/// A deadline has passed once it lies strictly before `now`
pub fn is_expired(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    expires_at < now
}

/// Expiry check for a given deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpirationStatus {
    pub expired: bool,
    pub days_remaining: i64,
}

impl ExpirationStatus {
    pub fn at(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        if is_expired(expires_at, now) {
            return Self {
                expired: true,
                days_remaining: 0,
            };
        }
        let millis = (expires_at - now).num_milliseconds();
        let day = 86_400_000;
        Self {
            expired: false,
            days_remaining: (millis + day - 1) / day,
        }
    }
}
