use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::scheduling::allocation::TemplateApplication;
use crate::scheduling::appointment::{Appointment, AppointmentStatus, ConflictDetail, ResourceDimension};
use crate::scheduling::flow::{FlowStageHistory, PatientFlowState};
use crate::scheduling::occupancy::ResourceOccupancy;
use crate::scheduling::template::ScheduleTemplate;

pub mod memory;
pub mod pg;

pub use memory::MemoryStore;
pub use pg::PgStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The write would double-book a resource. Raised by the storage-level
    /// check that runs inside the same atomic unit as the write.
    #[error("{0}")]
    Overlap(ConflictDetail),

    /// Optimistic version check failed; the row changed since it was read.
    #[error("row was modified concurrently")]
    StaleVersion,

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("db error: {0}")]
    Database(#[from] sqlx::Error),
}

/// A reschedule: the moved row and, when the visit already has a flow, that
/// flow rebound to the new slot. Written together.
#[derive(Debug, Clone)]
pub struct AppointmentMove {
    pub appointment: Appointment,
    /// Status the caller read. The write fails with `StaleVersion` otherwise.
    pub expected_status: AppointmentStatus,
    /// Its `version` is `flow_expected_version + 1`.
    pub flow: Option<PatientFlowState>,
    pub flow_expected_version: i32,
}

/// Everything one accepted flow transition writes, committed together.
#[derive(Debug, Clone)]
pub struct FlowCommit {
    /// The flow after the transition. Its `version` is `expected_version + 1`.
    pub flow: PatientFlowState,
    pub expected_version: i32,
    pub history: FlowStageHistory,
    pub appointment_status: Option<AppointmentStatus>,
    /// Occupancy rows to upsert.
    pub occupancy: Vec<ResourceOccupancy>,
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /* ---------- appointments ---------- */

    /// Inserts after re-checking every claimed resource for overlap.
    async fn insert_appointment(&self, appointment: &Appointment) -> Result<(), StoreError>;

    /// Writes the row back if it is still undeleted with `expected_status`,
    /// otherwise `StaleVersion`. A live row is re-checked for overlap against
    /// everything but itself.
    async fn update_appointment(
        &self,
        appointment: &Appointment,
        expected_status: AppointmentStatus,
    ) -> Result<(), StoreError>;

    /// `update_appointment` plus the flow rewrite, in one unit.
    async fn reschedule_appointment(&self, change: &AppointmentMove) -> Result<(), StoreError>;

    async fn appointment(&self, appointment_id: Uuid) -> Result<Option<Appointment>, StoreError>;

    /// Live appointments of the clinic that hold any of `resources` during
    /// `[start_at, end_at)`.
    async fn overlapping(
        &self,
        clinic_id: Uuid,
        resources: &[(ResourceDimension, Uuid)],
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
    ) -> Result<Vec<Appointment>, StoreError>;

    /// Live appointments starting in `[from, to)`, ordered by start.
    async fn appointments_between(
        &self,
        clinic_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Appointment>, StoreError>;

    /* ---------- templates ---------- */

    async fn insert_template(&self, template: &ScheduleTemplate) -> Result<(), StoreError>;
    async fn update_template(&self, template: &ScheduleTemplate) -> Result<(), StoreError>;

    /// Archives `retired` and inserts its successor in one unit. Fails with
    /// `StaleVersion` unless `retired` is still ACTIVE.
    async fn replace_template(
        &self,
        retired: &ScheduleTemplate,
        successor: &ScheduleTemplate,
    ) -> Result<(), StoreError>;
    async fn template(&self, template_id: Uuid) -> Result<Option<ScheduleTemplate>, StoreError>;

    /* ---------- template applications ---------- */

    async fn insert_application(&self, application: &TemplateApplication) -> Result<(), StoreError>;
    async fn update_application(&self, application: &TemplateApplication) -> Result<(), StoreError>;
    async fn application(&self, application_id: Uuid) -> Result<Option<TemplateApplication>, StoreError>;

    /* ---------- patient flow ---------- */

    /// Creates the flow with its first history row. Returns the flow already
    /// stored for the appointment instead when there is one.
    async fn insert_flow(
        &self,
        flow: &PatientFlowState,
        history: &FlowStageHistory,
    ) -> Result<PatientFlowState, StoreError>;

    async fn flow_for_appointment(&self, appointment_id: Uuid) -> Result<Option<PatientFlowState>, StoreError>;

    async fn flows_on(&self, clinic_id: Uuid, service_date: NaiveDate) -> Result<Vec<PatientFlowState>, StoreError>;

    /// Flows currently IN_CHAIR in the clinic.
    async fn seated_flows(&self, clinic_id: Uuid) -> Result<Vec<PatientFlowState>, StoreError>;

    /// Writes a flow without a stage change (priority escalation).
    async fn save_flow(&self, flow: &PatientFlowState, expected_version: i32) -> Result<(), StoreError>;

    /// Version-checked. Fails with `StaleVersion` when the commit changes the
    /// appointment status but the appointment was cancelled or deleted, and
    /// with `Overlap` when it seats a second patient in the same chair.
    async fn commit_flow_transition(&self, commit: &FlowCommit) -> Result<(), StoreError>;

    async fn flow_history(&self, flow_id: Uuid) -> Result<Vec<FlowStageHistory>, StoreError>;

    /* ---------- occupancy ---------- */

    async fn occupancy(&self, resource_id: Uuid) -> Result<Option<ResourceOccupancy>, StoreError>;
    async fn occupancy_for_clinic(&self, clinic_id: Uuid) -> Result<Vec<ResourceOccupancy>, StoreError>;
    async fn put_occupancy(&self, occupancy: &ResourceOccupancy) -> Result<(), StoreError>;
}
