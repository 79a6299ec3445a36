//! SQLite-backed `CircleStore`

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

use super::{
    AssignmentFilter, AssignmentPatch, CircleFilter, CirclePatch, CircleStore, MemberFilter,
};
use crate::error::{CircleError, Result};
use crate::models::{Assignment, Circle, Member};

const CIRCLE_COLUMNS: &str = "id, code, name, organizer_device_id, created_at, expires_at, \
                              total_units, completed_units, status";
const MEMBER_COLUMNS: &str = "id, circle_id, device_id, nickname, joined_at, is_organizer";
const ASSIGNMENT_COLUMNS: &str =
    "id, circle_id, unit_number, member_id, status, assigned_at, completed_at";

/// Database store
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Apply the embedded schema migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| CircleError::Unexpected(format!("Migration failed: {}", e)))
    }
}

/// Pushes `WHERE` before the first condition and `AND` before the rest
struct WhereClause {
    started: bool,
}

impl WhereClause {
    fn new() -> Self {
        Self { started: false }
    }

    fn next(&mut self, qb: &mut QueryBuilder<'_, Sqlite>) {
        qb.push(if self.started { " AND " } else { " WHERE " });
        self.started = true;
    }
}

/// Pushes `SET` before the first assignment and a comma before the rest
struct SetClause {
    started: bool,
}

impl SetClause {
    fn new() -> Self {
        Self { started: false }
    }

    fn next(&mut self, qb: &mut QueryBuilder<'_, Sqlite>) {
        qb.push(if self.started { ", " } else { " SET " });
        self.started = true;
    }
}

fn push_circle_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &CircleFilter) {
    let mut cond = WhereClause::new();
    if let Some(id) = filter.id {
        cond.next(qb);
        qb.push("id = ").push_bind(id.to_string());
    }
    if let Some(code) = &filter.code {
        cond.next(qb);
        qb.push("code = ").push_bind(code.clone());
    }
    if let Some(status) = filter.status {
        cond.next(qb);
        qb.push("status = ").push_bind(status.as_str());
    }
    if let Some(instant) = filter.expires_before {
        cond.next(qb);
        qb.push("expires_at < ").push_bind(instant);
    }
}

fn push_member_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &MemberFilter) {
    let mut cond = WhereClause::new();
    if let Some(id) = filter.id {
        cond.next(qb);
        qb.push("id = ").push_bind(id.to_string());
    }
    if let Some(circle_id) = filter.circle_id {
        cond.next(qb);
        qb.push("circle_id = ").push_bind(circle_id.to_string());
    }
    if let Some(device_id) = &filter.device_id {
        cond.next(qb);
        qb.push("device_id = ").push_bind(device_id.clone());
    }
}

fn push_assignment_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &AssignmentFilter) {
    let mut cond = WhereClause::new();
    if let Some(id) = filter.id {
        cond.next(qb);
        qb.push("id = ").push_bind(id.to_string());
    }
    if let Some(circle_id) = filter.circle_id {
        cond.next(qb);
        qb.push("circle_id = ").push_bind(circle_id.to_string());
    }
    if let Some(unit) = filter.unit_number {
        cond.next(qb);
        qb.push("unit_number = ").push_bind(i64::from(unit));
    }
    if let Some(member_id) = filter.member_id {
        cond.next(qb);
        qb.push("member_id = ").push_bind(member_id.to_string());
    }
    if let Some(status) = filter.status {
        cond.next(qb);
        qb.push("status = ").push_bind(status.as_str());
    }
}

#[async_trait]
impl CircleStore for SqliteStore {
    fn is_available(&self) -> bool {
        !self.pool.is_closed()
    }

    // Circle operations

    async fn insert_circle(&self, circle: &Circle) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO circles (id, code, name, organizer_device_id, created_at, expires_at, total_units, completed_units, status)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(circle.id.to_string())
        .bind(&circle.code)
        .bind(&circle.name)
        .bind(&circle.organizer_device_id)
        .bind(circle.created_at)
        .bind(circle.expires_at)
        .bind(i64::from(circle.total_units))
        .bind(i64::from(circle.completed_units))
        .bind(circle.status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn select_circles(&self, filter: &CircleFilter) -> Result<Vec<Circle>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM circles", CIRCLE_COLUMNS));
        push_circle_filter(&mut qb, filter);
        qb.push(" ORDER BY created_at ASC");

        let rows = qb
            .build_query_as::<CircleRow>()
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    async fn count_circles(&self, filter: &CircleFilter) -> Result<u64> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM circles");
        push_circle_filter(&mut qb, filter);

        let (count,): (i64,) = qb.build_query_as().fetch_one(&self.pool).await?;
        Ok(count as u64)
    }

    async fn update_circles(&self, filter: &CircleFilter, patch: &CirclePatch) -> Result<u64> {
        if patch.is_empty() {
            return Ok(0);
        }

        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE circles");
        let mut set = SetClause::new();
        if let Some(units) = patch.completed_units {
            set.next(&mut qb);
            qb.push("completed_units = ").push_bind(i64::from(units));
        }
        if let Some(status) = patch.status {
            set.next(&mut qb);
            qb.push("status = ").push_bind(status.as_str());
        }
        push_circle_filter(&mut qb, filter);

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn delete_circles(&self, filter: &CircleFilter) -> Result<u64> {
        let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM circles");
        push_circle_filter(&mut qb, filter);

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    // Member operations

    async fn insert_member(&self, member: &Member) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO circle_members (id, circle_id, device_id, nickname, joined_at, is_organizer)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(member.id.to_string())
        .bind(member.circle_id.to_string())
        .bind(&member.device_id)
        .bind(&member.nickname)
        .bind(member.joined_at)
        .bind(member.is_organizer)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn select_members(&self, filter: &MemberFilter) -> Result<Vec<Member>> {
        let mut qb =
            QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM circle_members", MEMBER_COLUMNS));
        push_member_filter(&mut qb, filter);
        qb.push(" ORDER BY joined_at ASC");

        let rows = qb
            .build_query_as::<MemberRow>()
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    async fn count_members(&self, filter: &MemberFilter) -> Result<u64> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM circle_members");
        push_member_filter(&mut qb, filter);

        let (count,): (i64,) = qb.build_query_as().fetch_one(&self.pool).await?;
        Ok(count as u64)
    }

    async fn delete_members(&self, filter: &MemberFilter) -> Result<u64> {
        let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM circle_members");
        push_member_filter(&mut qb, filter);

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    // Assignment operations

    async fn insert_assignment(&self, assignment: &Assignment) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO circle_assignments (id, circle_id, unit_number, member_id, status, assigned_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(assignment.id.to_string())
        .bind(assignment.circle_id.to_string())
        .bind(i64::from(assignment.unit_number))
        .bind(assignment.member_id.map(|u| u.to_string()))
        .bind(assignment.status.as_str())
        .bind(assignment.assigned_at)
        .bind(assignment.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn select_assignments(&self, filter: &AssignmentFilter) -> Result<Vec<Assignment>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM circle_assignments",
            ASSIGNMENT_COLUMNS
        ));
        push_assignment_filter(&mut qb, filter);
        qb.push(" ORDER BY unit_number ASC");

        let rows = qb
            .build_query_as::<AssignmentRow>()
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    async fn count_assignments(&self, filter: &AssignmentFilter) -> Result<u64> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM circle_assignments");
        push_assignment_filter(&mut qb, filter);

        let (count,): (i64,) = qb.build_query_as().fetch_one(&self.pool).await?;
        Ok(count as u64)
    }

    async fn update_assignments(
        &self,
        filter: &AssignmentFilter,
        patch: &AssignmentPatch,
    ) -> Result<u64> {
        if patch.is_empty() {
            return Ok(0);
        }

        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE circle_assignments");
        let mut set = SetClause::new();
        if let Some(member_id) = patch.member_id {
            set.next(&mut qb);
            qb.push("member_id = ")
                .push_bind(member_id.map(|u| u.to_string()));
        }
        if let Some(status) = patch.status {
            set.next(&mut qb);
            qb.push("status = ").push_bind(status.as_str());
        }
        if let Some(assigned_at) = patch.assigned_at {
            set.next(&mut qb);
            qb.push("assigned_at = ").push_bind(assigned_at);
        }
        if let Some(completed_at) = patch.completed_at {
            set.next(&mut qb);
            qb.push("completed_at = ").push_bind(completed_at);
        }
        push_assignment_filter(&mut qb, filter);

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn delete_assignments(&self, filter: &AssignmentFilter) -> Result<u64> {
        let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM circle_assignments");
        push_assignment_filter(&mut qb, filter);

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

// Internal row types for sqlx

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| CircleError::Unexpected(format!("Invalid UUID: {}", e)))
}

fn small_int(value: i64, column: &str) -> Result<u8> {
    u8::try_from(value)
        .map_err(|_| CircleError::Unexpected(format!("{} out of range: {}", column, value)))
}

#[derive(sqlx::FromRow)]
struct CircleRow {
    id: String,
    code: String,
    name: String,
    organizer_device_id: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    total_units: i64,
    completed_units: i64,
    status: String,
}

impl TryFrom<CircleRow> for Circle {
    type Error = CircleError;

    fn try_from(row: CircleRow) -> Result<Self> {
        Ok(Circle {
            id: parse_uuid(&row.id)?,
            code: row.code,
            name: row.name,
            organizer_device_id: row.organizer_device_id,
            created_at: row.created_at,
            expires_at: row.expires_at,
            total_units: small_int(row.total_units, "total_units")?,
            completed_units: small_int(row.completed_units, "completed_units")?,
            status: row.status.parse().map_err(CircleError::Unexpected)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MemberRow {
    id: String,
    circle_id: String,
    device_id: String,
    nickname: String,
    joined_at: DateTime<Utc>,
    is_organizer: bool,
}

impl TryFrom<MemberRow> for Member {
    type Error = CircleError;

    fn try_from(row: MemberRow) -> Result<Self> {
        Ok(Member {
            id: parse_uuid(&row.id)?,
            circle_id: parse_uuid(&row.circle_id)?,
            device_id: row.device_id,
            nickname: row.nickname,
            joined_at: row.joined_at,
            is_organizer: row.is_organizer,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AssignmentRow {
    id: String,
    circle_id: String,
    unit_number: i64,
    member_id: Option<String>,
    status: String,
    assigned_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<AssignmentRow> for Assignment {
    type Error = CircleError;

    fn try_from(row: AssignmentRow) -> Result<Self> {
        Ok(Assignment {
            id: parse_uuid(&row.id)?,
            circle_id: parse_uuid(&row.circle_id)?,
            unit_number: small_int(row.unit_number, "unit_number")?,
            member_id: row.member_id.as_deref().map(parse_uuid).transpose()?,
            status: row.status.parse().map_err(CircleError::Unexpected)?,
            assigned_at: row.assigned_at,
            completed_at: row.completed_at,
        })
    }
}
