//! End-to-end circle flows through the service layer

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use khatm::circle::{NewCircle, PendingEdits, UpdateMode};
use khatm::circle::validation::is_code_format;
use khatm::config::CircleSettings;
use khatm::models::{AssignmentStatus, Circle, CircleMembership, CircleStatus, Member};
use khatm::service::CircleService;
use khatm::store::{AssignmentFilter, CircleFilter, CircleStore, MemberFilter, MemoryStore};
use uuid::Uuid;

fn setup() -> (Arc<MemoryStore>, CircleService) {
    let store = Arc::new(MemoryStore::new());
    let service = CircleService::new(store.clone(), CircleSettings::default());
    (store, service)
}

fn family(device_id: &str) -> NewCircle {
    NewCircle {
        name: "Family".to_string(),
        organizer_nickname: "Dad".to_string(),
        expires_at: Utc::now() + Duration::days(10),
        organizer_device_id: device_id.to_string(),
    }
}

async fn create(service: &CircleService, device_id: &str) -> CircleMembership {
    let response = service.create_circle(family(device_id)).await;
    assert!(response.success, "create failed: {:?}", response.error);
    response.data.unwrap()
}

async fn join(service: &CircleService, code: &str, nickname: &str, device_id: &str) -> Member {
    let response = service.join_circle(code, nickname, device_id).await;
    assert!(response.success, "join failed: {:?}", response.error);
    response.data.unwrap().membership
}

/// A circle always owns exactly one row for each of units 1..=30
async fn assert_full_unit_set(store: &MemoryStore, circle_id: Uuid) {
    let mut units: Vec<u8> = store
        .select_assignments(&AssignmentFilter::in_circle(circle_id))
        .await
        .unwrap()
        .iter()
        .map(|a| a.unit_number)
        .collect();
    units.sort_unstable();
    assert_eq!(units, (1..=30).collect::<Vec<u8>>());
}

#[tokio::test]
async fn test_create_circle_starts_empty() {
    let (store, service) = setup();
    let created = create(&service, "device-a").await;

    let assignments = service
        .get_circle_assignments(created.circle.id)
        .await
        .data
        .unwrap();
    assert_eq!(assignments.len(), 30);
    assert!(assignments
        .iter()
        .all(|a| a.status == AssignmentStatus::Unassigned && a.member_id.is_none()));
    assert_full_unit_set(&store, created.circle.id).await;

    let progress = service
        .get_circle_progress(created.circle.id)
        .await
        .data
        .unwrap();
    assert_eq!((progress.completed, progress.total, progress.percentage), (0, 30, 0));
}

#[tokio::test]
async fn test_join_full_circle_fails() {
    let (_, service) = setup();
    let created = create(&service, "device-a").await;
    for i in 1..30 {
        join(
            &service,
            &created.circle.code,
            &format!("Reader {}", i),
            &format!("device-{}", i),
        )
        .await;
    }

    let response = service
        .join_circle(&created.circle.code, "Mom", "device-b")
        .await;
    assert!(!response.success);
    assert!(response.error.unwrap().contains("full"));
}

#[tokio::test]
async fn test_assign_then_complete_unit() {
    let (store, service) = setup();
    let created = create(&service, "device-a").await;
    let mom = join(&service, &created.circle.code, "Mom", "device-b").await;

    assert!(service
        .assign_juz_to_member(created.circle.id, 5, mom.id)
        .await
        .success);
    let outcome = service
        .mark_juz_completed(created.circle.id, 5, "device-b")
        .await
        .data
        .unwrap();

    assert_eq!(outcome.assignment.status, AssignmentStatus::Completed);
    assert!(!outcome.circle_completed);
    let circle = store
        .find_circle(&CircleFilter::by_id(created.circle.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(circle.completed_units, 1);
}

#[tokio::test]
async fn test_completing_every_unit_completes_circle() {
    let (store, service) = setup();
    let created = create(&service, "device-a").await;
    let mom = join(&service, &created.circle.code, "Mom", "device-b").await;
    let all: Vec<u8> = (1..=30).collect();
    assert!(service
        .assign_multiple_juz(created.circle.id, &all, mom.id)
        .await
        .success);

    for unit in 1..=30u8 {
        let outcome = service
            .mark_juz_completed(created.circle.id, unit, "device-b")
            .await
            .data
            .unwrap();
        assert_eq!(outcome.circle_completed, unit == 30);

        let circle = store
            .find_circle(&CircleFilter::by_id(created.circle.id))
            .await
            .unwrap()
            .unwrap();
        let completed = store
            .count_assignments(
                &AssignmentFilter::in_circle(created.circle.id)
                    .with_status(AssignmentStatus::Completed),
            )
            .await
            .unwrap();
        assert_eq!(u64::from(circle.completed_units), completed);
    }

    let overview = service.get_circle(created.circle.id).await.data.unwrap();
    assert_eq!(overview.circle.status, CircleStatus::Completed);
    assert_eq!(overview.progress.percentage, 100);
}

#[tokio::test]
async fn test_expired_circle_is_cleaned_up() {
    let (store, service) = setup();
    let created = create(&service, "device-a").await;
    join(&service, &created.circle.code, "Mom", "device-b").await;

    // Pretend the deadline passed
    let mut stale = created.circle.clone();
    store
        .delete_circles(&CircleFilter::by_id(stale.id))
        .await
        .unwrap();
    stale.expires_at = Utc::now() - Duration::hours(1);
    store.insert_circle(&stale).await.unwrap();

    let cleaned = service.cleanup_expired_circles().await.data.unwrap();
    assert_eq!(cleaned, 1);
    assert_eq!(service.cleanup_expired_circles().await.data, Some(0));

    assert_eq!(
        store
            .count_members(&MemberFilter::in_circle(stale.id))
            .await
            .unwrap(),
        0
    );
    assert_eq!(
        store
            .count_assignments(&AssignmentFilter::in_circle(stale.id))
            .await
            .unwrap(),
        0
    );
    for device in ["device-a", "device-b"] {
        let found = service.check_user_circle(device).await;
        assert!(found.success);
        assert!(found.data.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_check_user_circle_sweeps_first() {
    let (store, service) = setup();
    let expired = Circle::new("WXYZ-2345", "Old", "device-x", Utc::now() - Duration::days(1));
    store.insert_circle(&expired).await.unwrap();
    store
        .insert_member(&Member::new(expired.id, "device-x", "Org", true))
        .await
        .unwrap();

    let found = service.check_user_circle("device-x").await;
    assert!(found.data.unwrap().is_none());
    assert_eq!(store.count_circles(&CircleFilter::default()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_device_holds_one_membership() {
    let (_, service) = setup();
    let first = create(&service, "device-a").await;
    let second = create(&service, "device-b").await;

    let response = service
        .join_circle(&second.circle.code, "Dad again", "device-a")
        .await;
    assert!(!response.success);
    assert!(response.error.unwrap().contains(&first.circle.name));

    let current = service.check_user_circle("device-a").await.data.unwrap();
    assert_eq!(current.unwrap().circle.id, first.circle.id);
}

#[tokio::test]
async fn test_nickname_collision_ignores_case() {
    let (_, service) = setup();
    let created = create(&service, "device-a").await;
    join(&service, &created.circle.code, "Ali", "device-b").await;

    let response = service
        .join_circle(&created.circle.code, "ali", "device-c")
        .await;
    assert!(!response.success);
}

#[tokio::test]
async fn test_generated_codes_avoid_active_codes() {
    let (_, service) = setup();
    let mut seen = HashSet::new();
    for i in 0..20 {
        let created = create(&service, &format!("device-{}", i)).await;
        seen.insert(created.circle.code);
    }

    for _ in 0..50 {
        let code = service.generate_circle_code().await.data.unwrap();
        assert!(is_code_format(&code));
        assert!(!seen.contains(&code));
    }
}

#[tokio::test]
async fn test_removing_organizer_changes_nothing() {
    let (store, service) = setup();
    let created = create(&service, "device-a").await;
    let mom = join(&service, &created.circle.code, "Mom", "device-b").await;
    service
        .assign_juz_to_member(created.circle.id, 1, created.membership.id)
        .await;
    let before = store
        .select_assignments(&AssignmentFilter::in_circle(created.circle.id))
        .await
        .unwrap();

    let response = service
        .remove_member_from_circle(created.circle.id, created.membership.id)
        .await;
    assert!(!response.success);

    let after = store
        .select_assignments(&AssignmentFilter::in_circle(created.circle.id))
        .await
        .unwrap();
    assert_eq!(before, after);
    let members = service.get_circle_members(created.circle.id).await.data.unwrap();
    assert_eq!(members.len(), 2);
    assert_eq!(members[0].member.id, created.membership.id);
    assert_eq!(members[0].assigned_units, 1);
    assert_eq!(members[1].member.id, mom.id);
}

#[tokio::test]
async fn test_organizer_leave_dissolves_circle() {
    let (store, service) = setup();
    let created = create(&service, "device-a").await;
    let mom = join(&service, &created.circle.code, "Mom", "device-b").await;
    service
        .assign_juz_to_member(created.circle.id, 3, mom.id)
        .await;

    let outcome = service
        .leave_circle(created.circle.id, "device-a")
        .await
        .data
        .unwrap();
    assert!(outcome.circle_deleted);

    for device in ["device-a", "device-b"] {
        assert!(service
            .check_user_circle(device)
            .await
            .data
            .unwrap()
            .is_none());
    }
    assert_eq!(store.count_circles(&CircleFilter::default()).await.unwrap(), 0);
    assert_eq!(store.count_members(&MemberFilter::default()).await.unwrap(), 0);
    assert_eq!(
        store
            .count_assignments(&AssignmentFilter::default())
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn test_member_leave_frees_units() {
    let (store, service) = setup();
    let created = create(&service, "device-a").await;
    let mom = join(&service, &created.circle.code, "Mom", "device-b").await;
    let son = join(&service, &created.circle.code, "Son", "device-c").await;
    service
        .assign_multiple_juz(created.circle.id, &[4, 5], mom.id)
        .await;
    service
        .mark_juz_in_progress(created.circle.id, 5, "device-b")
        .await;
    service
        .assign_multiple_juz(created.circle.id, &[6, 7], son.id)
        .await;
    service
        .mark_juz_completed(created.circle.id, 7, "device-c")
        .await;

    let outcome = service
        .leave_circle(created.circle.id, "device-b")
        .await
        .data
        .unwrap();
    assert!(!outcome.circle_deleted);
    assert_full_unit_set(&store, created.circle.id).await;

    assert!(service
        .remove_member_from_circle(created.circle.id, son.id)
        .await
        .success);
    assert_full_unit_set(&store, created.circle.id).await;

    let assignments = service
        .get_circle_assignments(created.circle.id)
        .await
        .data
        .unwrap();
    for a in &assignments {
        if a.unit_number == 7 {
            assert_eq!(a.status, AssignmentStatus::Completed);
            assert_eq!(a.member_id, Some(son.id));
        } else {
            assert_eq!(a.status, AssignmentStatus::Unassigned);
        }
    }
}

#[tokio::test]
async fn test_pending_edits_round() {
    let (store, service) = setup();
    let created = create(&service, "device-a").await;
    let mom = join(&service, &created.circle.code, "Mom", "device-b").await;

    let mut edits = PendingEdits::new();
    edits.insert(10, Some(mom.id));
    edits.insert(11, Some(mom.id));
    edits.insert(12, Some(created.membership.id));
    let response = service.apply_pending_edits(created.circle.id, &edits).await;
    assert!(response.success);

    assert_full_unit_set(&store, created.circle.id).await;

    let mut edits = PendingEdits::new();
    edits.insert(11, None);
    let response = service.apply_pending_edits(created.circle.id, &edits).await;
    assert!(response.success);
    assert_full_unit_set(&store, created.circle.id).await;

    let mine = service
        .get_my_assignments(created.circle.id, "device-b")
        .await
        .data
        .unwrap();
    assert_eq!(mine.iter().map(|a| a.unit_number).collect::<Vec<_>>(), vec![10]);
}

#[tokio::test]
async fn test_strict_mode_flows_like_default_without_races() {
    let store = Arc::new(MemoryStore::new());
    let service = CircleService::new(
        store,
        CircleSettings {
            update_mode: UpdateMode::CompareStatus,
            ..CircleSettings::default()
        },
    );
    let created = create(&service, "device-a").await;

    assert!(service
        .assign_juz_to_member(created.circle.id, 1, created.membership.id)
        .await
        .success);
    assert!(service
        .mark_juz_in_progress(created.circle.id, 1, "device-a")
        .await
        .success);
    let outcome = service
        .mark_juz_completed(created.circle.id, 1, "device-a")
        .await
        .data
        .unwrap();
    assert_eq!(outcome.progress.completed, 1);
}
