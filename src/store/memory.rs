use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{AppointmentMove, FlowCommit, ScheduleStore, StoreError};
use crate::scheduling::allocation::TemplateApplication;
use crate::scheduling::appointment::{
    Appointment, AppointmentStatus, ConflictDetail, ResourceDimension, find_conflict, intervals_overlap,
};
use crate::scheduling::flow::{FlowStage, FlowStageHistory, PatientFlowState};
use crate::scheduling::occupancy::ResourceOccupancy;
use crate::scheduling::template::{ScheduleTemplate, TemplateStatus};

#[derive(Default)]
struct Tables {
    appointments: HashMap<Uuid, Appointment>,
    templates: HashMap<Uuid, ScheduleTemplate>,
    applications: HashMap<Uuid, TemplateApplication>,
    /// keyed by appointment id
    flows: HashMap<Uuid, PatientFlowState>,
    history: Vec<FlowStageHistory>,
    occupancy: HashMap<Uuid, ResourceOccupancy>,
}

impl Tables {
    /// The same check the database constraint performs.
    fn check_overlap(&self, appointment: &Appointment) -> Result<(), StoreError> {
        if !appointment.is_live() {
            return Ok(());
        }
        let existing: Vec<Appointment> = self.appointments.values().cloned().collect();
        match find_conflict(&appointment.claim(), &existing, Some(appointment.appointment_id)) {
            Some(conflict) => Err(StoreError::Overlap(conflict)),
            None => Ok(()),
        }
    }

    /// The row guard `update_appointment` applies.
    fn check_appointment(&self, appointment_id: Uuid, expected_status: AppointmentStatus) -> Result<(), StoreError> {
        match self.appointments.get(&appointment_id) {
            None => Err(StoreError::NotFound {
                entity: "appointment",
                id: appointment_id,
            }),
            Some(row) if row.deleted_at.is_some() || row.status != expected_status => Err(StoreError::StaleVersion),
            Some(_) => Ok(()),
        }
    }

    fn check_flow_version(&self, flow: &PatientFlowState, expected_version: i32) -> Result<(), StoreError> {
        match self.flows.get(&flow.appointment_id) {
            None => Err(StoreError::NotFound {
                entity: "flow",
                id: flow.flow_id,
            }),
            Some(row) if row.version != expected_version => Err(StoreError::StaleVersion),
            Some(_) => Ok(()),
        }
    }

    /// Same rule as the `patient_flow_one_in_chair` index.
    fn check_one_in_chair(&self, flow: &PatientFlowState) -> Result<(), StoreError> {
        let Some(chair) = flow.chair_id.filter(|_| flow.stage == FlowStage::InChair) else {
            return Ok(());
        };
        let seated = self
            .flows
            .values()
            .find(|f| f.flow_id != flow.flow_id && f.stage == FlowStage::InChair && f.chair_id == Some(chair));
        match seated {
            Some(other) => Err(StoreError::Overlap(ConflictDetail {
                dimension: ResourceDimension::Chair,
                resource_id: chair,
                existing_appointment_id: Some(other.appointment_id),
            })),
            None => Ok(()),
        }
    }
}

/// Process-local store. Every method runs under one table lock, so each write
/// is atomic with its own re-validation and guards.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleStore for MemoryStore {
    async fn insert_appointment(&self, appointment: &Appointment) -> Result<(), StoreError> {
        let mut t = self.tables.write().await;
        t.check_overlap(appointment)?;
        t.appointments.insert(appointment.appointment_id, appointment.clone());
        Ok(())
    }

    async fn update_appointment(
        &self,
        appointment: &Appointment,
        expected_status: AppointmentStatus,
    ) -> Result<(), StoreError> {
        let mut t = self.tables.write().await;
        t.check_appointment(appointment.appointment_id, expected_status)?;
        t.check_overlap(appointment)?;
        t.appointments.insert(appointment.appointment_id, appointment.clone());
        Ok(())
    }

    async fn reschedule_appointment(&self, change: &AppointmentMove) -> Result<(), StoreError> {
        let mut t = self.tables.write().await;
        let appointment = &change.appointment;
        t.check_appointment(appointment.appointment_id, change.expected_status)?;
        if let Some(flow) = &change.flow {
            t.check_flow_version(flow, change.flow_expected_version)?;
        }
        t.check_overlap(appointment)?;

        t.appointments.insert(appointment.appointment_id, appointment.clone());
        if let Some(flow) = &change.flow {
            t.flows.insert(flow.appointment_id, flow.clone());
        }
        Ok(())
    }

    async fn appointment(&self, appointment_id: Uuid) -> Result<Option<Appointment>, StoreError> {
        Ok(self.tables.read().await.appointments.get(&appointment_id).cloned())
    }

    async fn overlapping(
        &self,
        clinic_id: Uuid,
        resources: &[(ResourceDimension, Uuid)],
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
    ) -> Result<Vec<Appointment>, StoreError> {
        let t = self.tables.read().await;
        Ok(t.appointments
            .values()
            .filter(|a| a.is_live() && a.clinic_id == clinic_id)
            .filter(|a| intervals_overlap(a.start_at, a.end_at, start_at, end_at))
            .filter(|a| resources.iter().any(|(dim, id)| a.resource(*dim) == Some(*id)))
            .cloned()
            .collect())
    }

    async fn appointments_between(
        &self,
        clinic_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Appointment>, StoreError> {
        let t = self.tables.read().await;
        let mut out: Vec<Appointment> = t
            .appointments
            .values()
            .filter(|a| a.is_live() && a.clinic_id == clinic_id)
            .filter(|a| a.start_at >= from && a.start_at < to)
            .cloned()
            .collect();
        out.sort_by_key(|a| (a.start_at, a.appointment_id));
        Ok(out)
    }

    async fn insert_template(&self, template: &ScheduleTemplate) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .templates
            .insert(template.template_id, template.clone());
        Ok(())
    }

    async fn update_template(&self, template: &ScheduleTemplate) -> Result<(), StoreError> {
        let mut t = self.tables.write().await;
        match t.templates.get_mut(&template.template_id) {
            Some(row) => {
                *row = template.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                entity: "template",
                id: template.template_id,
            }),
        }
    }

    async fn replace_template(
        &self,
        retired: &ScheduleTemplate,
        successor: &ScheduleTemplate,
    ) -> Result<(), StoreError> {
        let mut t = self.tables.write().await;
        match t.templates.get(&retired.template_id) {
            None => {
                return Err(StoreError::NotFound {
                    entity: "template",
                    id: retired.template_id,
                });
            }
            Some(row) if row.status != TemplateStatus::Active => return Err(StoreError::StaleVersion),
            Some(_) => {}
        }
        t.templates.insert(retired.template_id, retired.clone());
        t.templates.insert(successor.template_id, successor.clone());
        Ok(())
    }

    async fn template(&self, template_id: Uuid) -> Result<Option<ScheduleTemplate>, StoreError> {
        Ok(self.tables.read().await.templates.get(&template_id).cloned())
    }

    async fn insert_application(&self, application: &TemplateApplication) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .applications
            .insert(application.application_id, application.clone());
        Ok(())
    }

    async fn update_application(&self, application: &TemplateApplication) -> Result<(), StoreError> {
        let mut t = self.tables.write().await;
        match t.applications.get_mut(&application.application_id) {
            Some(row) => {
                *row = application.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                entity: "template_application",
                id: application.application_id,
            }),
        }
    }

    async fn application(&self, application_id: Uuid) -> Result<Option<TemplateApplication>, StoreError> {
        Ok(self.tables.read().await.applications.get(&application_id).cloned())
    }

    async fn insert_flow(
        &self,
        flow: &PatientFlowState,
        history: &FlowStageHistory,
    ) -> Result<PatientFlowState, StoreError> {
        let mut t = self.tables.write().await;
        if let Some(existing) = t.flows.get(&flow.appointment_id) {
            return Ok(existing.clone());
        }
        t.flows.insert(flow.appointment_id, flow.clone());
        t.history.push(history.clone());
        Ok(flow.clone())
    }

    async fn flow_for_appointment(&self, appointment_id: Uuid) -> Result<Option<PatientFlowState>, StoreError> {
        Ok(self.tables.read().await.flows.get(&appointment_id).cloned())
    }

    async fn flows_on(&self, clinic_id: Uuid, service_date: NaiveDate) -> Result<Vec<PatientFlowState>, StoreError> {
        let t = self.tables.read().await;
        let mut out: Vec<PatientFlowState> = t
            .flows
            .values()
            .filter(|f| f.clinic_id == clinic_id && f.service_date == service_date)
            .cloned()
            .collect();
        out.sort_by_key(|f| (f.scheduled_at, f.flow_id));
        Ok(out)
    }

    async fn seated_flows(&self, clinic_id: Uuid) -> Result<Vec<PatientFlowState>, StoreError> {
        let t = self.tables.read().await;
        Ok(t.flows
            .values()
            .filter(|f| f.clinic_id == clinic_id && f.stage == FlowStage::InChair)
            .cloned()
            .collect())
    }

    async fn save_flow(&self, flow: &PatientFlowState, expected_version: i32) -> Result<(), StoreError> {
        let mut t = self.tables.write().await;
        t.check_flow_version(flow, expected_version)?;
        t.flows.insert(flow.appointment_id, flow.clone());
        Ok(())
    }

    async fn commit_flow_transition(&self, commit: &FlowCommit) -> Result<(), StoreError> {
        let mut t = self.tables.write().await;
        let flow = &commit.flow;
        t.check_flow_version(flow, commit.expected_version)?;
        if commit.appointment_status.is_some() {
            let live = t.appointments.get(&flow.appointment_id).is_some_and(Appointment::is_live);
            if !live {
                return Err(StoreError::StaleVersion);
            }
        }
        t.check_one_in_chair(flow)?;

        t.flows.insert(flow.appointment_id, flow.clone());
        t.history.push(commit.history.clone());
        if let Some(status) = commit.appointment_status {
            if let Some(appointment) = t.appointments.get_mut(&flow.appointment_id) {
                appointment.status = status;
                appointment.updated_at = flow.updated_at;
            }
        }
        for record in &commit.occupancy {
            t.occupancy.insert(record.resource_id, record.clone());
        }
        Ok(())
    }

    async fn flow_history(&self, flow_id: Uuid) -> Result<Vec<FlowStageHistory>, StoreError> {
        let t = self.tables.read().await;
        Ok(t.history.iter().filter(|h| h.flow_id == flow_id).cloned().collect())
    }

    async fn occupancy(&self, resource_id: Uuid) -> Result<Option<ResourceOccupancy>, StoreError> {
        Ok(self.tables.read().await.occupancy.get(&resource_id).cloned())
    }

    async fn occupancy_for_clinic(&self, clinic_id: Uuid) -> Result<Vec<ResourceOccupancy>, StoreError> {
        let t = self.tables.read().await;
        Ok(t.occupancy
            .values()
            .filter(|r| r.clinic_id == clinic_id)
            .cloned()
            .collect())
    }

    async fn put_occupancy(&self, occupancy: &ResourceOccupancy) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .occupancy
            .insert(occupancy.resource_id, occupancy.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduling::appointment::{AppointmentStatus, ConfirmationStatus};
    use assert_matches::assert_matches;
    use chrono::{Duration, TimeZone};

    fn appt(provider: Uuid, start_h: u32) -> Appointment {
        let start = Utc.with_ymd_and_hms(2025, 3, 3, start_h, 0, 0).unwrap();
        Appointment {
            appointment_id: Uuid::new_v4(),
            clinic_id: Uuid::nil(),
            patient_id: None,
            provider_id: provider,
            appointment_type_id: Uuid::nil(),
            chair_id: None,
            room_id: None,
            start_at: start,
            end_at: start + Duration::minutes(60),
            duration_min: 60,
            status: AppointmentStatus::Scheduled,
            confirmation_status: ConfirmationStatus::Unconfirmed,
            capacity: 1,
            cleanup_buffer_min: 0,
            template_application_id: None,
            note: None,
            created_at: start,
            updated_at: start,
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn insert_rechecks_overlap() {
        let store = MemoryStore::new();
        let provider = Uuid::new_v4();
        let first = appt(provider, 9);
        store.insert_appointment(&first).await.unwrap();

        // a caller that skipped the engine's pre-check
        let err = store.insert_appointment(&appt(provider, 9)).await.unwrap_err();
        assert_matches!(err, StoreError::Overlap(c) if c.existing_appointment_id == Some(first.appointment_id));

        store.insert_appointment(&appt(provider, 10)).await.unwrap();
    }

    #[tokio::test]
    async fn cancelling_frees_the_interval() {
        let store = MemoryStore::new();
        let provider = Uuid::new_v4();
        let mut first = appt(provider, 9);
        store.insert_appointment(&first).await.unwrap();

        first.status = AppointmentStatus::Cancelled;
        store.update_appointment(&first, AppointmentStatus::Scheduled).await.unwrap();
        store.insert_appointment(&appt(provider, 9)).await.unwrap();
    }

    #[tokio::test]
    async fn update_requires_the_status_that_was_read() {
        let store = MemoryStore::new();
        let mut a = appt(Uuid::new_v4(), 9);
        store.insert_appointment(&a).await.unwrap();

        a.status = AppointmentStatus::Confirmed;
        store.update_appointment(&a, AppointmentStatus::Scheduled).await.unwrap();

        // a writer that read the row before the confirm
        a.status = AppointmentStatus::Cancelled;
        assert_matches!(
            store.update_appointment(&a, AppointmentStatus::Scheduled).await,
            Err(StoreError::StaleVersion)
        );
        let stored = store.appointment(a.appointment_id).await.unwrap().unwrap();
        assert_eq!(stored.status, AppointmentStatus::Confirmed);
    }

    fn seated(flow: &PatientFlowState, chair: Uuid) -> FlowCommit {
        let mut next = flow.clone();
        next.chair_id = Some(chair);
        next.stage = FlowStage::InChair;
        next.version = flow.version + 1;
        FlowCommit {
            history: FlowStageHistory::entry(&next, next.updated_at, None),
            appointment_status: Some(AppointmentStatus::InProgress),
            flow: next,
            expected_version: flow.version,
            occupancy: Vec::new(),
        }
    }

    async fn opened(store: &MemoryStore, a: &Appointment) -> PatientFlowState {
        store.insert_appointment(a).await.unwrap();
        let flow = PatientFlowState::open(a, a.start_at.date_naive(), a.start_at);
        store
            .insert_flow(&flow, &FlowStageHistory::entry(&flow, a.start_at, None))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn one_seated_flow_per_chair() {
        let store = MemoryStore::new();
        let chair = Uuid::new_v4();
        let first = appt(Uuid::new_v4(), 9);
        let second = appt(Uuid::new_v4(), 9);
        let first_flow = opened(&store, &first).await;
        let second_flow = opened(&store, &second).await;

        store.commit_flow_transition(&seated(&first_flow, chair)).await.unwrap();
        let err = store.commit_flow_transition(&seated(&second_flow, chair)).await.unwrap_err();
        assert_matches!(err, StoreError::Overlap(c) => {
            assert_eq!(c.dimension, ResourceDimension::Chair);
            assert_eq!(c.existing_appointment_id, Some(first.appointment_id));
        });

        // another chair is fine
        store
            .commit_flow_transition(&seated(&second_flow, Uuid::new_v4()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn flow_commit_refuses_a_cancelled_appointment() {
        let store = MemoryStore::new();
        let mut a = appt(Uuid::new_v4(), 9);
        let flow = opened(&store, &a).await;

        a.status = AppointmentStatus::Cancelled;
        store.update_appointment(&a, AppointmentStatus::Scheduled).await.unwrap();

        assert_matches!(
            store.commit_flow_transition(&seated(&flow, Uuid::new_v4())).await,
            Err(StoreError::StaleVersion)
        );
        let stored = store.flow_for_appointment(a.appointment_id).await.unwrap().unwrap();
        assert_eq!(stored.stage, FlowStage::Scheduled);
    }

    #[tokio::test]
    async fn flow_writes_check_version() {
        let store = MemoryStore::new();
        let a = appt(Uuid::new_v4(), 9);
        store.insert_appointment(&a).await.unwrap();

        let flow = PatientFlowState::open(&a, a.start_at.date_naive(), a.start_at);
        let history = FlowStageHistory::entry(&flow, a.start_at, None);
        store.insert_flow(&flow, &history).await.unwrap();

        // a second open returns the stored flow
        let again = PatientFlowState::open(&a, a.start_at.date_naive(), a.start_at);
        let stored = store.insert_flow(&again, &history).await.unwrap();
        assert_eq!(stored.flow_id, flow.flow_id);

        let mut next = flow.clone();
        next.version = 1;
        store.save_flow(&next, 0).await.unwrap();
        assert_matches!(store.save_flow(&next, 0).await, Err(StoreError::StaleVersion));
        assert_eq!(store.flow_history(flow.flow_id).await.unwrap().len(), 1);
    }
}
