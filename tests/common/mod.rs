#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use uuid::Uuid;

use dcms_scheduler::clock::ManualClock;
use dcms_scheduler::directory::InMemoryDirectory;
use dcms_scheduler::scheduling::allocation::TemplateApplication;
use dcms_scheduler::scheduling::appointment::{
    Appointment, AppointmentStatus, BookingCandidate, ResourceDimension,
};
use dcms_scheduler::scheduling::flow::{FlowStageHistory, PatientFlowState};
use dcms_scheduler::scheduling::occupancy::ResourceOccupancy;
use dcms_scheduler::scheduling::template::ScheduleTemplate;
use dcms_scheduler::scheduling::{SchedulingCore, SchedulingSettings};
use dcms_scheduler::store::{AppointmentMove, FlowCommit, MemoryStore, ScheduleStore, StoreError};

pub fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, day, hour, minute, 0).unwrap()
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// A `MemoryStore` whose appointment writes can be slowed down and whose
/// flow saves can be made to lose a version race.
#[derive(Default)]
pub struct ScriptedStore {
    inner: Arc<MemoryStore>,
    appointment_write_delay_ms: AtomicU64,
    stale_flow_saves: AtomicUsize,
}

impl ScriptedStore {
    pub fn delay_appointment_writes(&self, by: StdDuration) {
        self.appointment_write_delay_ms
            .store(by.as_millis() as u64, Ordering::SeqCst);
    }

    /// The next `n` calls to `save_flow` report `StaleVersion` without writing.
    pub fn fail_flow_saves(&self, n: usize) {
        self.stale_flow_saves.store(n, Ordering::SeqCst);
    }

    async fn appointment_write_pause(&self) {
        let ms = self.appointment_write_delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(StdDuration::from_millis(ms)).await;
        }
    }
}

#[async_trait]
impl ScheduleStore for ScriptedStore {
    async fn insert_appointment(&self, appointment: &Appointment) -> Result<(), StoreError> {
        self.inner.insert_appointment(appointment).await
    }

    async fn update_appointment(
        &self,
        appointment: &Appointment,
        expected_status: AppointmentStatus,
    ) -> Result<(), StoreError> {
        self.appointment_write_pause().await;
        self.inner.update_appointment(appointment, expected_status).await
    }

    async fn reschedule_appointment(&self, change: &AppointmentMove) -> Result<(), StoreError> {
        self.appointment_write_pause().await;
        self.inner.reschedule_appointment(change).await
    }

    async fn appointment(&self, appointment_id: Uuid) -> Result<Option<Appointment>, StoreError> {
        self.inner.appointment(appointment_id).await
    }

    async fn overlapping(
        &self,
        clinic_id: Uuid,
        resources: &[(ResourceDimension, Uuid)],
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
    ) -> Result<Vec<Appointment>, StoreError> {
        self.inner.overlapping(clinic_id, resources, start_at, end_at).await
    }

    async fn appointments_between(
        &self,
        clinic_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Appointment>, StoreError> {
        self.inner.appointments_between(clinic_id, from, to).await
    }

    async fn insert_template(&self, template: &ScheduleTemplate) -> Result<(), StoreError> {
        self.inner.insert_template(template).await
    }

    async fn update_template(&self, template: &ScheduleTemplate) -> Result<(), StoreError> {
        self.inner.update_template(template).await
    }

    async fn replace_template(
        &self,
        retired: &ScheduleTemplate,
        successor: &ScheduleTemplate,
    ) -> Result<(), StoreError> {
        self.inner.replace_template(retired, successor).await
    }

    async fn template(&self, template_id: Uuid) -> Result<Option<ScheduleTemplate>, StoreError> {
        self.inner.template(template_id).await
    }

    async fn insert_application(&self, application: &TemplateApplication) -> Result<(), StoreError> {
        self.inner.insert_application(application).await
    }

    async fn update_application(&self, application: &TemplateApplication) -> Result<(), StoreError> {
        self.inner.update_application(application).await
    }

    async fn application(&self, application_id: Uuid) -> Result<Option<TemplateApplication>, StoreError> {
        self.inner.application(application_id).await
    }

    async fn insert_flow(
        &self,
        flow: &PatientFlowState,
        history: &FlowStageHistory,
    ) -> Result<PatientFlowState, StoreError> {
        self.inner.insert_flow(flow, history).await
    }

    async fn flow_for_appointment(&self, appointment_id: Uuid) -> Result<Option<PatientFlowState>, StoreError> {
        self.inner.flow_for_appointment(appointment_id).await
    }

    async fn flows_on(&self, clinic_id: Uuid, service_date: NaiveDate) -> Result<Vec<PatientFlowState>, StoreError> {
        self.inner.flows_on(clinic_id, service_date).await
    }

    async fn seated_flows(&self, clinic_id: Uuid) -> Result<Vec<PatientFlowState>, StoreError> {
        self.inner.seated_flows(clinic_id).await
    }

    async fn save_flow(&self, flow: &PatientFlowState, expected_version: i32) -> Result<(), StoreError> {
        let lose = self
            .stale_flow_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lose {
            return Err(StoreError::StaleVersion);
        }
        self.inner.save_flow(flow, expected_version).await
    }

    async fn commit_flow_transition(&self, commit: &FlowCommit) -> Result<(), StoreError> {
        self.inner.commit_flow_transition(commit).await
    }

    async fn flow_history(&self, flow_id: Uuid) -> Result<Vec<FlowStageHistory>, StoreError> {
        self.inner.flow_history(flow_id).await
    }

    async fn occupancy(&self, resource_id: Uuid) -> Result<Option<ResourceOccupancy>, StoreError> {
        self.inner.occupancy(resource_id).await
    }

    async fn occupancy_for_clinic(&self, clinic_id: Uuid) -> Result<Vec<ResourceOccupancy>, StoreError> {
        self.inner.occupancy_for_clinic(clinic_id).await
    }

    async fn put_occupancy(&self, occupancy: &ResourceOccupancy) -> Result<(), StoreError> {
        self.inner.put_occupancy(occupancy).await
    }
}

/// One clinic with two providers, two chairs and a room, over in-memory
/// collaborators. The clock starts Monday 2025-03-03 08:00 UTC.
pub struct Clinic {
    pub core: Arc<SchedulingCore>,
    /// The rows behind `scripted`, for direct reads.
    pub store: Arc<MemoryStore>,
    pub scripted: Arc<ScriptedStore>,
    pub directory: Arc<InMemoryDirectory>,
    pub clock: Arc<ManualClock>,
    pub clinic_id: Uuid,
    pub provider: Uuid,
    pub second_provider: Uuid,
    pub chair: Uuid,
    pub second_chair: Uuid,
    pub room: Uuid,
    /// 15..=120 minutes, 30 by default.
    pub checkup: Uuid,
}

impl Clinic {
    pub fn new() -> Self {
        Self::with_settings(SchedulingSettings::default())
    }

    pub fn with_settings(settings: SchedulingSettings) -> Self {
        let clinic_id = Uuid::new_v4();
        let directory = Arc::new(InMemoryDirectory::new());
        let provider = directory.add_provider(clinic_id);
        let second_provider = directory.add_provider(clinic_id);
        let chair = directory.add_chair(clinic_id);
        let second_chair = directory.add_chair(clinic_id);
        let room = directory.add_room(clinic_id);
        let checkup = directory.add_appointment_type(clinic_id, "Checkup", 15, 120, 30);

        let store = Arc::new(MemoryStore::new());
        let scripted = Arc::new(ScriptedStore {
            inner: store.clone(),
            ..ScriptedStore::default()
        });
        let clock = Arc::new(ManualClock::new(at(3, 8, 0)));
        let core = SchedulingCore::new(
            scripted.clone(),
            directory.clone(),
            directory.clone(),
            directory.clone(),
            clock.clone(),
            settings,
        );

        Self {
            core: Arc::new(core),
            store,
            scripted,
            directory,
            clock,
            clinic_id,
            provider,
            second_provider,
            chair,
            second_chair,
            room,
            checkup,
        }
    }

    pub fn candidate(
        &self,
        provider: Uuid,
        chair: Option<Uuid>,
        start_at: DateTime<Utc>,
        minutes: i32,
    ) -> BookingCandidate {
        BookingCandidate {
            clinic_id: self.clinic_id,
            patient_id: Some(Uuid::new_v4()),
            provider_id: provider,
            appointment_type_id: self.checkup,
            chair_id: chair,
            room_id: None,
            start_at,
            end_at: None,
            duration_min: Some(minutes),
            capacity: None,
            cleanup_buffer_min: None,
            template_application_id: None,
            note: None,
        }
    }

    pub async fn book(
        &self,
        provider: Uuid,
        chair: Option<Uuid>,
        start_at: DateTime<Utc>,
        minutes: i32,
    ) -> Appointment {
        self.core
            .allocation
            .book(self.candidate(provider, chair, start_at, minutes))
            .await
            .unwrap()
    }
}
