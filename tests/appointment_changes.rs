mod common;

use std::time::Duration as StdDuration;

use assert_matches::assert_matches;
use chrono::Duration;

use common::{Clinic, at, date};
use dcms_scheduler::scheduling::SchedulingError;
use dcms_scheduler::scheduling::allocation::RescheduleRequest;
use dcms_scheduler::scheduling::appointment::{AppointmentStatus, ResourceDimension};
use dcms_scheduler::scheduling::flow::{FlowEvent, FlowPriority, FlowStage};
use dcms_scheduler::store::ScheduleStore;

fn move_to(start_at: chrono::DateTime<chrono::Utc>, chair_id: Option<uuid::Uuid>) -> RescheduleRequest {
    RescheduleRequest {
        start_at,
        end_at: None,
        duration_min: None,
        provider_id: None,
        chair_id: chair_id.map(Some),
        room_id: None,
    }
}

/* ==== edits racing a check-in ==== */

#[tokio::test]
async fn cancel_wins_over_a_concurrent_check_in() {
    let c = Clinic::new();
    let appt = c.book(c.provider, Some(c.chair), at(3, 9, 0), 30).await;
    let id = appt.appointment_id;
    c.scripted.delay_appointment_writes(StdDuration::from_millis(100));

    let core = c.core.clone();
    let cancel = tokio::spawn(async move { core.allocation.cancel(id).await });
    tokio::time::sleep(StdDuration::from_millis(20)).await;

    let check_in = c.core.flows.transition(id, FlowEvent::CheckIn, None).await;
    let cancelled = cancel.await.unwrap().unwrap();

    assert_eq!(cancelled.status, AppointmentStatus::Cancelled);
    assert_matches!(check_in, Err(SchedulingError::Validation(_)));
    let stored = c.store.appointment(id).await.unwrap().unwrap();
    assert_eq!(stored.status, AppointmentStatus::Cancelled);
    assert!(c.store.flow_for_appointment(id).await.unwrap().is_none());
}

#[tokio::test]
async fn delete_wins_over_a_concurrent_check_in() {
    let c = Clinic::new();
    let appt = c.book(c.provider, Some(c.chair), at(3, 9, 0), 30).await;
    let id = appt.appointment_id;
    c.scripted.delay_appointment_writes(StdDuration::from_millis(100));

    let core = c.core.clone();
    let delete = tokio::spawn(async move { core.allocation.delete(id).await });
    tokio::time::sleep(StdDuration::from_millis(20)).await;

    let check_in = c.core.flows.transition(id, FlowEvent::CheckIn, None).await;
    delete.await.unwrap().unwrap();

    assert_matches!(check_in, Err(SchedulingError::Validation(_)));
    let stored = c.store.appointment(id).await.unwrap().unwrap();
    assert!(stored.deleted_at.is_some());
    assert_eq!(stored.status, AppointmentStatus::Scheduled);
    assert!(c.store.flow_for_appointment(id).await.unwrap().is_none());
}

#[tokio::test]
async fn check_in_after_a_concurrent_reschedule_sees_the_new_time() {
    let c = Clinic::new();
    let appt = c.book(c.provider, Some(c.chair), at(3, 9, 0), 30).await;
    let id = appt.appointment_id;
    c.core.flows.open_flow(id, None).await.unwrap();
    c.scripted.delay_appointment_writes(StdDuration::from_millis(100));

    let core = c.core.clone();
    let reschedule =
        tokio::spawn(async move { core.allocation.reschedule(id, move_to(at(3, 10, 0), None)).await });
    tokio::time::sleep(StdDuration::from_millis(20)).await;

    let checked_in = c.core.flows.transition(id, FlowEvent::CheckIn, None).await.unwrap();
    let moved = reschedule.await.unwrap().unwrap();

    assert_eq!(moved.start_at, at(3, 10, 0));
    assert_eq!(checked_in.flow.stage, FlowStage::CheckedIn);
    assert_eq!(checked_in.flow.scheduled_at, at(3, 10, 0));
    let stored = c.store.appointment(id).await.unwrap().unwrap();
    assert_eq!(stored.start_at, at(3, 10, 0));
    assert_eq!(stored.status, AppointmentStatus::Arrived);
}

/* ==== reschedule with a flow ==== */

#[tokio::test]
async fn reschedule_carries_an_opened_flow_along() {
    let c = Clinic::new();
    let appt = c.book(c.provider, Some(c.chair), at(3, 9, 0), 30).await;
    let id = appt.appointment_id;
    let opened = c.core.flows.open_flow(id, None).await.unwrap();

    c.core
        .allocation
        .reschedule(id, move_to(at(4, 9, 0), Some(c.second_chair)))
        .await
        .unwrap();

    let flow = c.core.flows.get(id).await.unwrap().flow;
    assert_eq!(flow.flow_id, opened.flow.flow_id);
    assert_eq!(flow.stage, FlowStage::Scheduled);
    assert_eq!(flow.service_date, date(2025, 3, 4));
    assert_eq!(flow.scheduled_at, at(4, 9, 0));
    assert_eq!(flow.chair_id, Some(c.second_chair));
    assert_eq!(flow.version, opened.flow.version + 1);

    let flows = &c.core.flows;
    assert_eq!(flows.list_flows(c.clinic_id, date(2025, 3, 4)).await.unwrap().len(), 1);
    assert!(flows.list_flows(c.clinic_id, date(2025, 3, 3)).await.unwrap().is_empty());

    // the flow still checks in against the moved appointment
    c.clock.set(at(4, 8, 55));
    let checked_in = flows.transition(id, FlowEvent::CheckIn, None).await.unwrap();
    assert_eq!(checked_in.flow.stage, FlowStage::CheckedIn);
}

#[tokio::test]
async fn a_checked_in_visit_cannot_be_rescheduled() {
    let c = Clinic::new();
    let appt = c.book(c.provider, Some(c.chair), at(3, 9, 0), 30).await;
    let id = appt.appointment_id;
    c.core.flows.transition(id, FlowEvent::CheckIn, None).await.unwrap();

    let err = c
        .core
        .allocation
        .reschedule(id, move_to(at(3, 11, 0), None))
        .await
        .unwrap_err();
    assert_matches!(err, SchedulingError::Validation(_));

    let flow = c.store.flow_for_appointment(id).await.unwrap().unwrap();
    assert_eq!(flow.scheduled_at, at(3, 9, 0));
    assert_eq!(c.store.appointment(id).await.unwrap().unwrap().start_at, at(3, 9, 0));
}

/* ==== flow upkeep ==== */

#[tokio::test]
async fn escalation_is_stored_after_a_lost_version_race() {
    let c = Clinic::new();
    c.directory.set_active(c.second_chair, false);
    let first = c.book(c.provider, Some(c.chair), at(3, 9, 0), 60).await;
    let second = c.book(c.second_provider, None, at(3, 9, 0), 30).await;
    let flows = &c.core.flows;

    c.clock.set(at(3, 9, 0));
    flows.transition(first.appointment_id, FlowEvent::CheckIn, None).await.unwrap();
    flows
        .transition(first.appointment_id, FlowEvent::Call { chair_id: c.chair }, None)
        .await
        .unwrap();
    flows.transition(first.appointment_id, FlowEvent::Seat, None).await.unwrap();
    let waiting = flows
        .transition(second.appointment_id, FlowEvent::CheckIn, None)
        .await
        .unwrap();
    assert_eq!(waiting.flow.stage, FlowStage::Waiting);

    c.clock.advance(Duration::minutes(25));
    c.scripted.fail_flow_saves(1);
    let view = flows.get(second.appointment_id).await.unwrap();
    assert_eq!(view.flow.priority, FlowPriority::High);

    let stored = c.store.flow_for_appointment(second.appointment_id).await.unwrap().unwrap();
    assert_eq!(stored.priority, FlowPriority::High);
    assert_eq!(stored.version, waiting.flow.version + 1);
}

#[tokio::test]
async fn seating_requires_the_chair_to_still_be_active() {
    let c = Clinic::new();
    let appt = c.book(c.provider, Some(c.chair), at(3, 9, 0), 30).await;
    let id = appt.appointment_id;
    let flows = &c.core.flows;

    c.clock.set(at(3, 8, 55));
    flows.transition(id, FlowEvent::CheckIn, None).await.unwrap();
    flows
        .transition(id, FlowEvent::Call { chair_id: c.chair }, None)
        .await
        .unwrap();
    c.directory.set_active(c.chair, false);

    let err = flows.transition(id, FlowEvent::Seat, None).await.unwrap_err();
    assert_matches!(
        err,
        SchedulingError::ResourceInactive { dimension: ResourceDimension::Chair, id: chair } if chair == c.chair
    );
    let flow = c.store.flow_for_appointment(id).await.unwrap().unwrap();
    assert_eq!(flow.stage, FlowStage::Called);
}
