use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::appointment::{
    Appointment, AppointmentStatus, BookingCandidate, BookingClaim, ConfirmationStatus, ConflictDetail,
    ResourceDimension, ResourceKey, find_conflict, resolve_duration,
};
use super::expansion::{
    ApplicationScope, ApplicationType, CandidateSlot, ExpansionItem, ExpansionWindow, TemplateExpansion,
    local_to_utc,
};
use super::flow::FlowStage;
use super::template::{ScheduleTemplate, TemplateStatus};
use super::{SchedulingError, SchedulingSettings};
use crate::clock::Clock;
use crate::directory::{AppointmentTypeCatalog, HolidayCalendar, ResourceDirectory};
use crate::locks::KeyedLocks;
use crate::store::{AppointmentMove, ScheduleStore, StoreError};

/* ============================================================
   Requests
   ============================================================ */

fn deserialize_double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    // Only called when the field is present: null => Some(None).
    let inner = Option::<T>::deserialize(deserializer)?;
    Ok(Some(inner))
}

#[derive(Debug, Clone, Deserialize)]
pub struct RescheduleRequest {
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    /// Neither this nor `end_at` keeps the current length.
    pub duration_min: Option<i32>,
    pub provider_id: Option<Uuid>,
    /// Absent keeps the chair; `null` unbinds it.
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub chair_id: Option<Option<Uuid>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub room_id: Option<Option<Uuid>>,
}

/// Narrows which template slots an application touches and fills in
/// resources for slots that have none pre-assigned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceFilters {
    #[serde(default)]
    pub slot_ids: Vec<Uuid>,
    #[serde(default)]
    pub provider_ids: Vec<Uuid>,
    #[serde(default)]
    pub chair_ids: Vec<Uuid>,
    pub default_provider_id: Option<Uuid>,
    pub default_chair_id: Option<Uuid>,
    pub default_room_id: Option<Uuid>,
}

impl ResourceFilters {
    /// The template restricted to the selected slots, defaults filled in.
    fn narrow(&self, template: &ScheduleTemplate) -> ScheduleTemplate {
        let mut narrowed = template.clone();
        narrowed.slots = template
            .slots
            .iter()
            .filter(|s| self.slot_ids.is_empty() || self.slot_ids.contains(&s.slot_id))
            .cloned()
            .map(|mut s| {
                s.provider_id = s.provider_id.or(self.default_provider_id);
                s.chair_id = s.chair_id.or(self.default_chair_id);
                s.room_id = s.room_id.or(self.default_room_id);
                s
            })
            .filter(|s| {
                self.provider_ids.is_empty()
                    || s.provider_id.is_some_and(|p| self.provider_ids.contains(&p))
            })
            .filter(|s| {
                self.chair_ids.is_empty() || s.chair_id.is_some_and(|c| self.chair_ids.contains(&c))
            })
            .collect();
        narrowed
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplyTemplateRequest {
    pub scope: ApplicationScope,
    #[serde(default)]
    pub filters: ResourceFilters,
}

/* ============================================================
   Template applications
   ============================================================ */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "smallint")]
#[repr(i16)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationStatus {
    Pending = 0,
    Active = 1,
    Completed = 2,
    Paused = 3,
    Cancelled = 4,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateApplication {
    pub application_id: Uuid,
    /// The exact template version the slots were generated from.
    pub template_id: Uuid,
    pub template_version: i32,
    pub clinic_id: Uuid,
    pub application_type: ApplicationType,
    pub scope: ApplicationScope,
    pub filters: ResourceFilters,
    pub status: ApplicationStatus,
    pub generated_slots: i32,
    pub skipped_conflict: i32,
    pub skipped_holiday: i32,
    pub skipped_invalid: i32,
    /// Last date a recurring series has been generated for.
    pub generated_through: Option<NaiveDate>,
    pub applied_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TemplateApplication {
    fn status_error(&self, action: &str) -> SchedulingError {
        SchedulingError::Validation(format!(
            "cannot {action} an application that is {:?}",
            self.status
        ))
    }

    pub fn pause(&mut self, now: DateTime<Utc>) -> Result<(), SchedulingError> {
        match self.status {
            ApplicationStatus::Active => {
                self.status = ApplicationStatus::Paused;
                self.updated_at = now;
                Ok(())
            }
            ApplicationStatus::Paused => Ok(()),
            _ => Err(self.status_error("pause")),
        }
    }

    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<(), SchedulingError> {
        match self.status {
            ApplicationStatus::Paused => {
                self.status = ApplicationStatus::Active;
                self.updated_at = now;
                Ok(())
            }
            ApplicationStatus::Active => Ok(()),
            _ => Err(self.status_error("resume")),
        }
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), SchedulingError> {
        match self.status {
            ApplicationStatus::Pending | ApplicationStatus::Active | ApplicationStatus::Paused => {
                self.status = ApplicationStatus::Cancelled;
                self.updated_at = now;
                Ok(())
            }
            ApplicationStatus::Cancelled => Ok(()),
            ApplicationStatus::Completed => Err(self.status_error("cancel")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotOutcomeKind {
    Created,
    SkippedConflict,
    SkippedHoliday,
    SkippedInvalid,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotOutcome {
    pub template_slot_id: Uuid,
    pub date: NaiveDate,
    pub outcome: SlotOutcomeKind,
    pub appointment_id: Option<Uuid>,
    pub conflict: Option<ConflictDetail>,
    pub reason: Option<String>,
}

/// Result of one application run. Counts cover this run only; the
/// application carries the running totals.
#[derive(Debug, Clone, Serialize)]
pub struct ApplicationReport {
    pub application: TemplateApplication,
    pub created: i32,
    pub skipped_conflict: i32,
    pub skipped_holiday: i32,
    pub skipped_invalid: i32,
    pub slots: Vec<SlotOutcome>,
}

impl ApplicationReport {
    fn new(application: TemplateApplication) -> Self {
        Self {
            application,
            created: 0,
            skipped_conflict: 0,
            skipped_holiday: 0,
            skipped_invalid: 0,
            slots: Vec::new(),
        }
    }

    fn record(&mut self, outcome: SlotOutcome) {
        match outcome.outcome {
            SlotOutcomeKind::Created => self.created += 1,
            SlotOutcomeKind::SkippedConflict => self.skipped_conflict += 1,
            SlotOutcomeKind::SkippedHoliday => self.skipped_holiday += 1,
            SlotOutcomeKind::SkippedInvalid => self.skipped_invalid += 1,
        }
        self.slots.push(outcome);
    }

    /// Folds this run's counts into the application totals.
    fn settle(&mut self, now: DateTime<Utc>) {
        let app = &mut self.application;
        app.generated_slots += self.created;
        app.skipped_conflict += self.skipped_conflict;
        app.skipped_holiday += self.skipped_holiday;
        app.skipped_invalid += self.skipped_invalid;
        app.updated_at = now;
    }
}

/* ============================================================
   Engine
   ============================================================ */

/// The single authority for "is this resource free at this time".
pub struct AllocationEngine {
    store: Arc<dyn ScheduleStore>,
    directory: Arc<dyn ResourceDirectory>,
    catalog: Arc<dyn AppointmentTypeCatalog>,
    calendar: Arc<dyn HolidayCalendar>,
    clock: Arc<dyn Clock>,
    booking_locks: KeyedLocks<ResourceKey>,
    /// Shared with the flow service; held by anything that changes an
    /// existing appointment.
    flow_locks: Arc<KeyedLocks<Uuid>>,
    application_locks: KeyedLocks<Uuid>,
    settings: SchedulingSettings,
}

/// Appointment writes lose the status guard only when someone else changed
/// the row in between.
fn write_error(e: StoreError, appointment_id: Uuid) -> SchedulingError {
    match e {
        StoreError::StaleVersion => SchedulingError::Validation(format!(
            "appointment {appointment_id} changed while being updated, reload and retry"
        )),
        other => other.into(),
    }
}

impl AllocationEngine {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        directory: Arc<dyn ResourceDirectory>,
        catalog: Arc<dyn AppointmentTypeCatalog>,
        calendar: Arc<dyn HolidayCalendar>,
        clock: Arc<dyn Clock>,
        flow_locks: Arc<KeyedLocks<Uuid>>,
        settings: SchedulingSettings,
    ) -> Self {
        Self {
            store,
            directory,
            catalog,
            calendar,
            clock,
            booking_locks: KeyedLocks::new(),
            flow_locks,
            application_locks: KeyedLocks::new(),
            settings,
        }
    }

    /* ---------- booking ---------- */

    /// Admits the candidate or rejects it. A conflict names the dimension and
    /// the appointment already holding the resource.
    pub async fn book(&self, candidate: BookingCandidate) -> Result<Appointment, SchedulingError> {
        if candidate.end_at.is_some_and(|end| end <= candidate.start_at) {
            return Err(SchedulingError::Validation("end_at must be after start_at".into()));
        }

        let appointment_type = self
            .catalog
            .appointment_type(candidate.appointment_type_id)
            .await?
            .ok_or(SchedulingError::NotFound {
                entity: "appointment_type",
                id: candidate.appointment_type_id,
            })?;
        if !appointment_type.is_active || appointment_type.clinic_id != candidate.clinic_id {
            return Err(SchedulingError::Validation(format!(
                "appointment type {} is not bookable in this clinic",
                appointment_type.display_name
            )));
        }

        let duration_min = resolve_duration(
            candidate.start_at,
            candidate.end_at,
            candidate.duration_min,
            appointment_type.default_duration_min,
        )?;
        if !appointment_type.allows(duration_min) {
            return Err(SchedulingError::Validation(format!(
                "{} takes {}-{} minutes, got {duration_min}",
                appointment_type.display_name,
                appointment_type.min_duration_min,
                appointment_type.max_duration_min
            )));
        }

        let capacity = candidate.capacity.unwrap_or(1);
        if capacity < 1 {
            return Err(SchedulingError::Validation("capacity must be at least 1".into()));
        }
        let cleanup_buffer_min = candidate
            .cleanup_buffer_min
            .unwrap_or(appointment_type.cleanup_buffer_min);
        if cleanup_buffer_min < 0 {
            return Err(SchedulingError::Validation("cleanup buffer cannot be negative".into()));
        }

        let now = self.clock.now();
        let appointment = Appointment {
            appointment_id: Uuid::new_v4(),
            clinic_id: candidate.clinic_id,
            patient_id: candidate.patient_id,
            provider_id: candidate.provider_id,
            appointment_type_id: candidate.appointment_type_id,
            chair_id: candidate.chair_id,
            room_id: candidate.room_id,
            start_at: candidate.start_at,
            end_at: candidate.start_at + Duration::minutes(i64::from(duration_min)),
            duration_min,
            status: AppointmentStatus::Scheduled,
            confirmation_status: ConfirmationStatus::Unconfirmed,
            capacity,
            cleanup_buffer_min,
            template_application_id: candidate.template_application_id,
            note: candidate.note.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        let claim = appointment.claim();
        self.ensure_active(&claim).await?;

        let _guards = self.booking_locks.lock_all(claim.resource_keys()).await;
        self.check_free(&claim, None).await?;
        self.store.insert_appointment(&appointment).await.map_err(|e| {
            let e = SchedulingError::from(e);
            if matches!(e, SchedulingError::Conflict(_)) {
                warn!(clinic_id = %claim.clinic_id, error = %e, "booking lost a race at commit");
            }
            e
        })?;

        info!(
            appointment_id = %appointment.appointment_id,
            provider_id = %appointment.provider_id,
            start_at = %appointment.start_at,
            duration_min,
            "appointment booked"
        );
        Ok(appointment)
    }

    /// Rejects disabled resources before any conflict check runs.
    async fn ensure_active(&self, claim: &BookingClaim) -> Result<(), SchedulingError> {
        for (dimension, id) in claim.resources() {
            let active = match dimension {
                ResourceDimension::Provider => self.directory.is_active_provider(id).await?,
                ResourceDimension::Chair => self.directory.is_active_chair(id).await?,
                ResourceDimension::Room => self.directory.is_active_room(id).await?,
            };
            if !active {
                return Err(SchedulingError::ResourceInactive { dimension, id });
            }
        }
        Ok(())
    }

    /// Caller must hold the booking locks for `claim`.
    async fn check_free(&self, claim: &BookingClaim, exclude: Option<Uuid>) -> Result<(), SchedulingError> {
        let existing = self
            .store
            .overlapping(claim.clinic_id, &claim.resources(), claim.start_at, claim.end_at)
            .await?;
        match find_conflict(claim, &existing, exclude) {
            Some(conflict) => {
                debug!(
                    dimension = %conflict.dimension,
                    resource_id = %conflict.resource_id,
                    start_at = %claim.start_at,
                    "booking rejected"
                );
                Err(SchedulingError::Conflict(conflict))
            }
            None => Ok(()),
        }
    }

    /* ---------- appointment lifecycle ---------- */

    pub async fn get(&self, appointment_id: Uuid) -> Result<Appointment, SchedulingError> {
        self.store
            .appointment(appointment_id)
            .await?
            .filter(|a| a.deleted_at.is_none())
            .ok_or(SchedulingError::NotFound {
                entity: "appointment",
                id: appointment_id,
            })
    }

    /// Moves the appointment. A flow opened for it follows to the new slot.
    pub async fn reschedule(
        &self,
        appointment_id: Uuid,
        req: RescheduleRequest,
    ) -> Result<Appointment, SchedulingError> {
        let _flow_guard = self.flow_locks.lock(appointment_id).await;
        let mut appointment = self.get(appointment_id).await?;
        let expected_status = appointment.status;
        if !expected_status.is_reschedulable() {
            return Err(SchedulingError::Validation(format!(
                "a {expected_status:?} appointment cannot be rescheduled"
            )));
        }

        let appointment_type = self
            .catalog
            .appointment_type(appointment.appointment_type_id)
            .await?
            .ok_or(SchedulingError::NotFound {
                entity: "appointment_type",
                id: appointment.appointment_type_id,
            })?;
        let duration_min = resolve_duration(req.start_at, req.end_at, req.duration_min, appointment.duration_min)?;
        if !appointment_type.allows(duration_min) {
            return Err(SchedulingError::Validation(format!(
                "{} takes {}-{} minutes, got {duration_min}",
                appointment_type.display_name,
                appointment_type.min_duration_min,
                appointment_type.max_duration_min
            )));
        }

        let claim = BookingClaim {
            clinic_id: appointment.clinic_id,
            provider_id: req.provider_id.unwrap_or(appointment.provider_id),
            chair_id: req.chair_id.unwrap_or(appointment.chair_id),
            room_id: req.room_id.unwrap_or(appointment.room_id),
            start_at: req.start_at,
            end_at: req.start_at + Duration::minutes(i64::from(duration_min)),
        };
        self.ensure_active(&claim).await?;

        let open_flow = match self.store.flow_for_appointment(appointment_id).await? {
            Some(flow) if flow.stage == FlowStage::Scheduled => Some(flow),
            Some(flow) if !flow.stage.is_terminal() => {
                return Err(SchedulingError::Validation(format!(
                    "the visit is already {}, it cannot be rescheduled",
                    flow.stage
                )));
            }
            _ => None,
        };

        let _guards = self.booking_locks.lock_all(claim.resource_keys()).await;
        self.check_free(&claim, Some(appointment_id)).await?;

        let now = self.clock.now();
        let previous_start = appointment.start_at;
        appointment.provider_id = claim.provider_id;
        appointment.chair_id = claim.chair_id;
        appointment.room_id = claim.room_id;
        appointment.start_at = claim.start_at;
        appointment.end_at = claim.end_at;
        appointment.duration_min = duration_min;
        appointment.updated_at = now;

        let flow_expected_version = open_flow.as_ref().map_or(0, |f| f.version);
        let flow = open_flow.map(|mut flow| {
            flow.provider_id = appointment.provider_id;
            flow.chair_id = appointment.chair_id;
            flow.scheduled_at = appointment.start_at;
            flow.service_date = appointment.start_at.with_timezone(&self.settings.utc_offset).date_naive();
            flow.version = flow_expected_version + 1;
            flow.updated_at = now;
            flow
        });
        let moves_flow = flow.is_some();

        let change = AppointmentMove {
            appointment,
            expected_status,
            flow,
            flow_expected_version,
        };
        self.store
            .reschedule_appointment(&change)
            .await
            .map_err(|e| write_error(e, appointment_id))?;

        info!(
            appointment_id = %appointment_id,
            from = %previous_start,
            to = %change.appointment.start_at,
            moves_flow,
            "appointment rescheduled"
        );
        Ok(change.appointment)
    }

    /// Frees the interval. An appointment whose visit has started is
    /// cancelled through its patient flow instead.
    pub async fn cancel(&self, appointment_id: Uuid) -> Result<Appointment, SchedulingError> {
        let _flow_guard = self.flow_locks.lock(appointment_id).await;
        let mut appointment = self.get(appointment_id).await?;
        let expected_status = appointment.status;
        match expected_status {
            AppointmentStatus::Cancelled => return Ok(appointment),
            AppointmentStatus::Scheduled | AppointmentStatus::Confirmed | AppointmentStatus::Arrived => {}
            other => {
                return Err(SchedulingError::Validation(format!(
                    "a {other:?} appointment cannot be cancelled"
                )));
            }
        }
        self.ensure_no_open_flow(appointment_id).await?;

        appointment.status = AppointmentStatus::Cancelled;
        appointment.updated_at = self.clock.now();
        self.store
            .update_appointment(&appointment, expected_status)
            .await
            .map_err(|e| write_error(e, appointment_id))?;
        info!(appointment_id = %appointment_id, "appointment cancelled");
        Ok(appointment)
    }

    async fn ensure_no_open_flow(&self, appointment_id: Uuid) -> Result<(), SchedulingError> {
        let open = self
            .store
            .flow_for_appointment(appointment_id)
            .await?
            .is_some_and(|f| !f.stage.is_terminal());
        if open {
            return Err(SchedulingError::Validation(
                "appointment has a patient flow; cancel it through the flow".into(),
            ));
        }
        Ok(())
    }

    pub async fn confirm(&self, appointment_id: Uuid) -> Result<Appointment, SchedulingError> {
        let _flow_guard = self.flow_locks.lock(appointment_id).await;
        let mut appointment = self.get(appointment_id).await?;
        let expected_status = appointment.status;
        match expected_status {
            AppointmentStatus::Scheduled => {}
            AppointmentStatus::Confirmed
                if appointment.confirmation_status == ConfirmationStatus::Confirmed =>
            {
                return Ok(appointment);
            }
            AppointmentStatus::Confirmed => {}
            other => {
                return Err(SchedulingError::Validation(format!(
                    "a {other:?} appointment cannot be confirmed"
                )));
            }
        }
        appointment.status = AppointmentStatus::Confirmed;
        appointment.confirmation_status = ConfirmationStatus::Confirmed;
        appointment.updated_at = self.clock.now();
        self.store
            .update_appointment(&appointment, expected_status)
            .await
            .map_err(|e| write_error(e, appointment_id))?;
        info!(appointment_id = %appointment_id, "appointment confirmed");
        Ok(appointment)
    }

    /// Soft delete. Deleting twice is a no-op.
    pub async fn delete(&self, appointment_id: Uuid) -> Result<(), SchedulingError> {
        let _flow_guard = self.flow_locks.lock(appointment_id).await;
        let Some(mut appointment) = self.store.appointment(appointment_id).await? else {
            return Err(SchedulingError::NotFound {
                entity: "appointment",
                id: appointment_id,
            });
        };
        if appointment.deleted_at.is_some() {
            return Ok(());
        }
        self.ensure_no_open_flow(appointment_id).await?;

        let now = self.clock.now();
        let expected_status = appointment.status;
        appointment.deleted_at = Some(now);
        appointment.updated_at = now;
        self.store
            .update_appointment(&appointment, expected_status)
            .await
            .map_err(|e| write_error(e, appointment_id))?;
        info!(appointment_id = %appointment_id, "appointment deleted");
        Ok(())
    }

    /// Live appointments starting on the clinic-local `date`.
    pub async fn list_day(&self, clinic_id: Uuid, date: NaiveDate) -> Result<Vec<Appointment>, SchedulingError> {
        let from = local_to_utc(date, NaiveTime::default(), self.settings.utc_offset)?;
        let to = from + Duration::days(1);
        Ok(self.store.appointments_between(clinic_id, from, to).await?)
    }

    /* ---------- template application ---------- */

    pub async fn apply_template(
        &self,
        template_id: Uuid,
        req: ApplyTemplateRequest,
        applied_by: Option<Uuid>,
    ) -> Result<ApplicationReport, SchedulingError> {
        let template = self
            .store
            .template(template_id)
            .await?
            .ok_or(SchedulingError::NotFound {
                entity: "template",
                id: template_id,
            })?;
        if template.status != TemplateStatus::Active {
            return Err(SchedulingError::Validation(
                "only active templates can be applied".into(),
            ));
        }
        req.scope.validate()?;

        let now = self.clock.now();
        let application = TemplateApplication {
            application_id: Uuid::new_v4(),
            template_id,
            template_version: template.version,
            clinic_id: template.clinic_id,
            application_type: req.scope.application_type(),
            scope: req.scope,
            filters: req.filters,
            status: ApplicationStatus::Pending,
            generated_slots: 0,
            skipped_conflict: 0,
            skipped_holiday: 0,
            skipped_invalid: 0,
            generated_through: None,
            applied_by,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_application(&application).await?;

        let _guard = self.application_locks.lock(application.application_id).await;
        self.run_application(application, &template).await
    }

    /// Generates the next horizon window of an ACTIVE recurring application.
    pub async fn continue_application(&self, application_id: Uuid) -> Result<ApplicationReport, SchedulingError> {
        let _guard = self.application_locks.lock(application_id).await;
        let application = self.get_application(application_id).await?;
        if application.status != ApplicationStatus::Active {
            return Err(application.status_error("continue"));
        }
        // The version the series was started from, archived or not.
        let template = self
            .store
            .template(application.template_id)
            .await?
            .ok_or(SchedulingError::NotFound {
                entity: "template",
                id: application.template_id,
            })?;
        self.run_application(application, &template).await
    }

    pub async fn get_application(&self, application_id: Uuid) -> Result<TemplateApplication, SchedulingError> {
        self.store
            .application(application_id)
            .await?
            .ok_or(SchedulingError::NotFound {
                entity: "template_application",
                id: application_id,
            })
    }

    pub async fn pause_application(&self, application_id: Uuid) -> Result<TemplateApplication, SchedulingError> {
        self.update_application_status(application_id, TemplateApplication::pause).await
    }

    pub async fn resume_application(&self, application_id: Uuid) -> Result<TemplateApplication, SchedulingError> {
        self.update_application_status(application_id, TemplateApplication::resume).await
    }

    pub async fn cancel_application(&self, application_id: Uuid) -> Result<TemplateApplication, SchedulingError> {
        self.update_application_status(application_id, TemplateApplication::cancel).await
    }

    async fn update_application_status(
        &self,
        application_id: Uuid,
        change: fn(&mut TemplateApplication, DateTime<Utc>) -> Result<(), SchedulingError>,
    ) -> Result<TemplateApplication, SchedulingError> {
        let _guard = self.application_locks.lock(application_id).await;
        let mut application = self.get_application(application_id).await?;
        let before = application.status;
        change(&mut application, self.clock.now())?;
        if application.status != before {
            self.store.update_application(&application).await?;
            info!(application_id = %application_id, from = ?before, to = ?application.status, "application status changed");
        }
        Ok(application)
    }

    /// Expands the scope window, then books every candidate independently.
    async fn run_application(
        &self,
        application: TemplateApplication,
        template: &ScheduleTemplate,
    ) -> Result<ApplicationReport, SchedulingError> {
        let offset = self.settings.utc_offset;
        let window = match application.scope {
            ApplicationScope::Recurring { .. } => {
                let today = self.clock.now().with_timezone(&offset).date_naive();
                ExpansionWindow {
                    after: application.generated_through,
                    through: Some(today + Duration::days(self.settings.recurring_horizon_days)),
                }
            }
            _ => ExpansionWindow::default(),
        };

        let narrowed = application.filters.narrow(template);
        let expanded = TemplateExpansion::new(&narrowed, &application.scope, window, self.calendar.as_ref(), offset)?
            .collect_all()
            .await?;

        let application_id = application.application_id;
        let mut report = ApplicationReport::new(application);
        let mut failure = None;
        for item in expanded.items {
            let outcome = match item {
                ExpansionItem::HolidaySkipped { template_slot_id, date } => SlotOutcome {
                    template_slot_id,
                    date,
                    outcome: SlotOutcomeKind::SkippedHoliday,
                    appointment_id: None,
                    conflict: None,
                    reason: None,
                },
                ExpansionItem::Candidate(candidate) => {
                    match self.book_candidate(&candidate, &report.application).await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
            };
            report.record(outcome);
        }

        let now = self.clock.now();
        report.settle(now);
        if failure.is_none() {
            let app = &mut report.application;
            if expanded.has_more {
                app.status = ApplicationStatus::Active;
                app.generated_through = window.through;
            } else {
                app.status = ApplicationStatus::Completed;
                app.generated_through = report.slots.iter().map(|s| s.date).max().or(app.generated_through);
            }
        }
        self.store.update_application(&report.application).await?;

        if let Some(e) = failure {
            warn!(application_id = %application_id, error = %e, created = report.created, "template application aborted");
            return Err(e);
        }

        info!(
            application_id = %application_id,
            template_id = %template.template_id,
            created = report.created,
            skipped_conflict = report.skipped_conflict,
            skipped_holiday = report.skipped_holiday,
            skipped_invalid = report.skipped_invalid,
            status = ?report.application.status,
            "template applied"
        );
        Ok(report)
    }

    /// One candidate's outcome. Only storage failures escape as errors.
    async fn book_candidate(
        &self,
        candidate: &CandidateSlot,
        application: &TemplateApplication,
    ) -> Result<SlotOutcome, SchedulingError> {
        let mut outcome = SlotOutcome {
            template_slot_id: candidate.template_slot_id,
            date: candidate.date,
            outcome: SlotOutcomeKind::Created,
            appointment_id: None,
            conflict: None,
            reason: None,
        };

        let Some(provider_id) = candidate.provider_id else {
            outcome.outcome = SlotOutcomeKind::SkippedInvalid;
            outcome.reason = Some("slot has no provider and no default_provider_id was given".into());
            return Ok(outcome);
        };

        let booking = BookingCandidate {
            clinic_id: application.clinic_id,
            patient_id: None,
            provider_id,
            appointment_type_id: candidate.appointment_type_id,
            chair_id: candidate.chair_id,
            room_id: candidate.room_id,
            start_at: candidate.start_at,
            end_at: Some(candidate.end_at),
            duration_min: None,
            capacity: Some(candidate.capacity),
            cleanup_buffer_min: Some(candidate.cleanup_buffer_min),
            template_application_id: Some(application.application_id),
            note: None,
        };

        match self.book(booking).await {
            Ok(appointment) => outcome.appointment_id = Some(appointment.appointment_id),
            Err(SchedulingError::Conflict(conflict)) => {
                outcome.outcome = SlotOutcomeKind::SkippedConflict;
                outcome.conflict = Some(conflict);
            }
            Err(
                e @ (SchedulingError::Validation(_)
                | SchedulingError::ResourceInactive { .. }
                | SchedulingError::NotFound { .. }),
            ) => {
                outcome.outcome = SlotOutcomeKind::SkippedInvalid;
                outcome.reason = Some(e.to_string());
            }
            Err(e) => return Err(e),
        }
        Ok(outcome)
    }
}
