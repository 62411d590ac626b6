mod common;

use assert_matches::assert_matches;
use chrono::{Duration, NaiveTime};
use uuid::Uuid;

use common::{Clinic, at, date};
use dcms_scheduler::scheduling::allocation::{
    ApplicationStatus, ApplyTemplateRequest, ResourceFilters, SlotOutcomeKind,
};
use dcms_scheduler::scheduling::expansion::ApplicationScope;
use dcms_scheduler::scheduling::recurrence::{Frequency, RecurringPattern};
use dcms_scheduler::scheduling::template::{
    CreateTemplateRequest, ScheduleTemplate, TemplateKind, TemplateSlotInput, TemplateStatus,
};
use dcms_scheduler::scheduling::{SchedulingError, SchedulingSettings};

fn slot(c: &Clinic, hour: u32, provider: Option<Uuid>) -> TemplateSlotInput {
    TemplateSlotInput {
        start_time: NaiveTime::from_hms_opt(hour, 0, 0).unwrap(),
        end_time: NaiveTime::from_hms_opt(hour, 30, 0).unwrap(),
        day_of_week: None,
        appointment_type_id: c.checkup,
        provider_id: provider,
        chair_id: None,
        room_id: None,
        capacity: None,
        prep_buffer_min: None,
        cleanup_buffer_min: None,
        label: None,
    }
}

async fn active_template(c: &Clinic, slots: Vec<TemplateSlotInput>) -> ScheduleTemplate {
    let template = c
        .core
        .templates
        .create(CreateTemplateRequest {
            clinic_id: c.clinic_id,
            name: "Hygiene morning".into(),
            kind: TemplateKind::Day,
            slots,
        })
        .await
        .unwrap();
    c.core.templates.activate(template.template_id).await.unwrap()
}

fn request(scope: ApplicationScope) -> ApplyTemplateRequest {
    ApplyTemplateRequest {
        scope,
        filters: ResourceFilters::default(),
    }
}

#[tokio::test]
async fn conflicting_slots_are_skipped_and_the_rest_booked() {
    let c = Clinic::new();
    let slots = (9..14).map(|h| slot(&c, h, Some(c.provider))).collect();
    let template = active_template(&c, slots).await;

    // provider already busy at 10:00 and 12:00 on the 4th
    let at_ten = c.book(c.provider, None, at(4, 10, 0), 30).await;
    c.book(c.provider, None, at(4, 12, 0), 30).await;

    let report = c
        .core
        .allocation
        .apply_template(
            template.template_id,
            request(ApplicationScope::SingleDate { date: date(2025, 3, 4) }),
            None,
        )
        .await
        .unwrap();

    assert_eq!(report.created, 3);
    assert_eq!(report.skipped_conflict, 2);
    assert_eq!(report.application.generated_slots, 3);
    assert_eq!(report.application.status, ApplicationStatus::Completed);
    assert_eq!(report.slots.len(), 5);

    let ten = report
        .slots
        .iter()
        .find(|s| s.outcome == SlotOutcomeKind::SkippedConflict)
        .unwrap();
    assert_eq!(ten.conflict.as_ref().unwrap().existing_appointment_id, Some(at_ten.appointment_id));

    let day = c.core.allocation.list_day(c.clinic_id, date(2025, 3, 4)).await.unwrap();
    assert_eq!(day.len(), 5);
    let generated: Vec<_> = day
        .iter()
        .filter(|a| a.template_application_id == Some(report.application.application_id))
        .collect();
    assert_eq!(generated.len(), 3);
    assert!(generated.iter().all(|a| a.patient_id.is_none()));

    // a second application of the same day creates nothing new
    let again = c
        .core
        .allocation
        .apply_template(
            template.template_id,
            request(ApplicationScope::SingleDate { date: date(2025, 3, 4) }),
            None,
        )
        .await
        .unwrap();
    assert_eq!(again.created, 0);
    assert_eq!(again.skipped_conflict, 5);
}

#[tokio::test]
async fn closed_days_are_counted_not_booked() {
    let c = Clinic::new();
    c.directory.add_closure(c.clinic_id, date(2025, 3, 5));
    let template = active_template(&c, vec![slot(&c, 9, Some(c.provider))]).await;

    let report = c
        .core
        .allocation
        .apply_template(
            template.template_id,
            request(ApplicationScope::DateRange {
                start_date: date(2025, 3, 3),
                end_date: date(2025, 3, 7),
            }),
            None,
        )
        .await
        .unwrap();

    assert_eq!(report.created, 4);
    assert_eq!(report.skipped_holiday, 1);
    let closed = report
        .slots
        .iter()
        .find(|s| s.outcome == SlotOutcomeKind::SkippedHoliday)
        .unwrap();
    assert_eq!(closed.date, date(2025, 3, 5));
}

#[tokio::test]
async fn defaults_fill_slots_and_unresolvable_ones_are_invalid() {
    let c = Clinic::new();
    let template = active_template(&c, vec![slot(&c, 9, None), slot(&c, 10, Some(c.second_provider))]).await;

    let bare = c
        .core
        .allocation
        .apply_template(
            template.template_id,
            request(ApplicationScope::SingleDate { date: date(2025, 3, 4) }),
            None,
        )
        .await
        .unwrap();
    assert_eq!(bare.created, 1);
    assert_eq!(bare.skipped_invalid, 1);

    let filled = c
        .core
        .allocation
        .apply_template(
            template.template_id,
            ApplyTemplateRequest {
                scope: ApplicationScope::SingleDate { date: date(2025, 3, 5) },
                filters: ResourceFilters {
                    default_provider_id: Some(c.provider),
                    default_chair_id: Some(c.chair),
                    ..Default::default()
                },
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(filled.created, 2);
    let nine = c
        .core
        .allocation
        .get(filled.slots[0].appointment_id.unwrap())
        .await
        .unwrap();
    assert_eq!(nine.provider_id, c.provider);
    assert_eq!(nine.chair_id, Some(c.chair));
}

#[tokio::test]
async fn only_active_templates_apply() {
    let c = Clinic::new();
    let draft = c
        .core
        .templates
        .create(CreateTemplateRequest {
            clinic_id: c.clinic_id,
            name: "Draft".into(),
            kind: TemplateKind::Day,
            slots: vec![slot(&c, 9, Some(c.provider))],
        })
        .await
        .unwrap();

    let err = c
        .core
        .allocation
        .apply_template(
            draft.template_id,
            request(ApplicationScope::SingleDate { date: date(2025, 3, 4) }),
            None,
        )
        .await
        .unwrap_err();
    assert_matches!(err, SchedulingError::Validation(_));
}

#[tokio::test]
async fn revising_an_active_template_archives_the_old_version() {
    let c = Clinic::new();
    let v1 = active_template(&c, vec![slot(&c, 9, Some(c.provider))]).await;

    let v2 = c
        .core
        .templates
        .revise(v1.template_id, vec![slot(&c, 9, Some(c.provider)), slot(&c, 10, Some(c.provider))])
        .await
        .unwrap();
    assert_eq!(v2.version, 2);
    assert_eq!(v2.parent_template_id, Some(v1.template_id));
    assert_eq!(v2.status, TemplateStatus::Active);
    assert_eq!(v2.slots.len(), 2);

    let old = c.core.templates.get(v1.template_id).await.unwrap();
    assert_eq!(old.status, TemplateStatus::Archived);
    assert_eq!(old.slots.len(), 1);
}

#[tokio::test]
async fn recurring_series_generates_one_horizon_at_a_time() {
    let c = Clinic::with_settings(SchedulingSettings {
        recurring_horizon_days: 14,
        ..SchedulingSettings::default()
    });
    let template = active_template(&c, vec![slot(&c, 9, Some(c.provider))]).await;

    // six Mondays from 2025-03-03
    let scope = ApplicationScope::Recurring {
        pattern: RecurringPattern {
            start_date: date(2025, 3, 3),
            frequency: Frequency::Weekly { days_of_week: vec![1] },
            interval: 1,
            end_date: None,
            max_occurrences: Some(6),
        },
    };
    let first = c
        .core
        .allocation
        .apply_template(template.template_id, request(scope), Some(Uuid::new_v4()))
        .await
        .unwrap();
    let application_id = first.application.application_id;
    assert_eq!(first.created, 3);
    assert_eq!(first.application.status, ApplicationStatus::Active);
    assert_eq!(first.application.generated_through, Some(date(2025, 3, 17)));

    // nothing new inside the same horizon
    let idle = c.core.allocation.continue_application(application_id).await.unwrap();
    assert_eq!(idle.created, 0);

    let paused = c.core.allocation.pause_application(application_id).await.unwrap();
    assert_eq!(paused.status, ApplicationStatus::Paused);
    assert_matches!(
        c.core.allocation.continue_application(application_id).await,
        Err(SchedulingError::Validation(_))
    );
    c.core.allocation.resume_application(application_id).await.unwrap();

    c.clock.advance(Duration::days(21));
    let rest = c.core.allocation.continue_application(application_id).await.unwrap();
    assert_eq!(rest.created, 3);
    assert_eq!(rest.application.status, ApplicationStatus::Completed);
    assert_eq!(rest.application.generated_slots, 6);

    let stored = c.core.allocation.get_application(application_id).await.unwrap();
    assert_eq!(stored.status, ApplicationStatus::Completed);
    assert_matches!(
        c.core.allocation.cancel_application(application_id).await,
        Err(SchedulingError::Validation(_))
    );
}
