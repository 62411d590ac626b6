use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::appointment::{Appointment, ResourceDimension};
use super::flow::{FlowEvent, FlowStageHistory, PatientFlowState, accepts};
use super::occupancy::ResourceOccupancy;
use super::{SchedulingError, SchedulingSettings};
use crate::clock::Clock;
use crate::directory::{ResourceDirectory, ResourceInfo};
use crate::locks::KeyedLocks;
use crate::store::{FlowCommit, ScheduleStore, StoreError};

const MAX_COMMIT_ATTEMPTS: usize = 3;

/// A flow as reported to callers, escalation already applied.
#[derive(Debug, Clone, Serialize)]
pub struct FlowView {
    #[serde(flatten)]
    pub flow: PatientFlowState,
    pub wait_minutes: Option<i64>,
}

enum Attempt {
    Done(FlowView),
    Stale,
}

pub struct PatientFlowService {
    store: Arc<dyn ScheduleStore>,
    directory: Arc<dyn ResourceDirectory>,
    clock: Arc<dyn Clock>,
    resource_locks: Arc<KeyedLocks<Uuid>>,
    flow_locks: Arc<KeyedLocks<Uuid>>,
    settings: SchedulingSettings,
}

impl PatientFlowService {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        directory: Arc<dyn ResourceDirectory>,
        clock: Arc<dyn Clock>,
        resource_locks: Arc<KeyedLocks<Uuid>>,
        flow_locks: Arc<KeyedLocks<Uuid>>,
        settings: SchedulingSettings,
    ) -> Self {
        Self {
            store,
            directory,
            clock,
            resource_locks,
            flow_locks,
            settings,
        }
    }

    fn service_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.settings.utc_offset).date_naive()
    }

    async fn appointment(&self, appointment_id: Uuid) -> Result<Appointment, SchedulingError> {
        self.store
            .appointment(appointment_id)
            .await?
            .ok_or(SchedulingError::NotFound {
                entity: "appointment",
                id: appointment_id,
            })
    }

    /* ---------- open ---------- */

    /// Creates the SCHEDULED flow for an appointment, or returns the one it
    /// already has.
    pub async fn open_flow(&self, appointment_id: Uuid, actor: Option<Uuid>) -> Result<FlowView, SchedulingError> {
        let _guard = self.flow_locks.lock(appointment_id).await;
        let appointment = self.appointment(appointment_id).await?;
        let flow = match self.store.flow_for_appointment(appointment_id).await? {
            Some(existing) => existing,
            None => self.insert_flow(&appointment, actor).await?,
        };
        self.refresh(flow).await
    }

    async fn insert_flow(
        &self,
        appointment: &Appointment,
        actor: Option<Uuid>,
    ) -> Result<PatientFlowState, SchedulingError> {
        if !appointment.is_live() {
            return Err(SchedulingError::Validation(format!(
                "appointment {} is cancelled or deleted",
                appointment.appointment_id
            )));
        }
        let now = self.clock.now();
        let flow = PatientFlowState::open(appointment, self.service_date(appointment.start_at), now);
        let history = FlowStageHistory::entry(&flow, now, actor);
        let stored = self.store.insert_flow(&flow, &history).await?;
        info!(appointment_id = %appointment.appointment_id, flow_id = %stored.flow_id, "flow opened");
        Ok(stored)
    }

    /* ---------- transitions ---------- */

    /// Applies one event to the appointment's flow. CHECK_IN opens the flow
    /// when the appointment has none yet.
    pub async fn transition(
        &self,
        appointment_id: Uuid,
        event: FlowEvent,
        actor: Option<Uuid>,
    ) -> Result<FlowView, SchedulingError> {
        let _guard = self.flow_locks.lock(appointment_id).await;

        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            match self.try_transition(appointment_id, &event, actor).await? {
                Attempt::Done(view) => return Ok(view),
                Attempt::Stale => {
                    debug!(appointment_id = %appointment_id, attempt, "flow version moved, retrying");
                }
            }
        }
        warn!(appointment_id = %appointment_id, event = %event.kind(), "flow transition gave up after repeated version conflicts");
        Err(SchedulingError::Storage(
            "flow was modified concurrently, try again".into(),
        ))
    }

    async fn try_transition(
        &self,
        appointment_id: Uuid,
        event: &FlowEvent,
        actor: Option<Uuid>,
    ) -> Result<Attempt, SchedulingError> {
        let appointment = self.appointment(appointment_id).await?;
        let mut flow = match self.store.flow_for_appointment(appointment_id).await? {
            Some(flow) => flow,
            None if matches!(event, FlowEvent::CheckIn) => self.insert_flow(&appointment, actor).await?,
            None => {
                return Err(SchedulingError::NotFound {
                    entity: "flow",
                    id: appointment_id,
                });
            }
        };

        let kind = event.kind();
        if !accepts(flow.stage, kind) {
            info!(appointment_id = %appointment_id, current = %flow.stage, attempted = %kind, "flow transition rejected");
            return Err(SchedulingError::InvalidTransition {
                current: flow.stage,
                attempted: kind,
            });
        }
        if !appointment.is_live() {
            return Err(SchedulingError::Validation(format!(
                "appointment {appointment_id} is cancelled or deleted"
            )));
        }

        // Resources whose occupancy this event reads or writes.
        let touched: Vec<Uuid> = match event {
            FlowEvent::Call { chair_id } => vec![*chair_id],
            FlowEvent::Seat | FlowEvent::Complete | FlowEvent::Depart => {
                [flow.chair_id, appointment.room_id].into_iter().flatten().collect()
            }
            _ => Vec::new(),
        };
        let _resource_guards = self.resource_locks.lock_all(touched).await;

        let now = self.clock.now();
        let expected_version = flow.version;
        let mut occupancy = Vec::new();

        match event {
            FlowEvent::CheckIn => {
                let free = self.chair_free_for_check_in(&appointment).await?;
                flow.apply(event, now, free)?;
            }
            FlowEvent::Call { chair_id } => {
                let info = self.callable_chair(*chair_id, flow.clinic_id).await?;
                let record = self.occupancy_of(&info, now).await?;
                if !record.is_available() {
                    return Err(SchedulingError::Conflict(record.busy_conflict()));
                }
                flow.apply(event, now, true)?;
            }
            FlowEvent::Seat => {
                let chair_id = flow.chair_id.ok_or_else(|| {
                    SchedulingError::Validation("flow has no chair to seat in".into())
                })?;
                let chair = self.resource_info(chair_id).await?;
                if !chair.is_active {
                    return Err(SchedulingError::ResourceInactive {
                        dimension: ResourceDimension::Chair,
                        id: chair_id,
                    });
                }
                let mut chair_record = self.occupancy_of(&chair, now).await?;
                let taken = chair_record.hold_status.is_some()
                    || chair_record.flow_id.is_some_and(|f| f != flow.flow_id);
                if taken {
                    return Err(SchedulingError::Conflict(chair_record.busy_conflict()));
                }

                flow.apply(event, now, true)?;
                chair_record.occupy(&flow, &appointment, now);
                occupancy.push(chair_record);

                if let Some(room_id) = appointment.room_id {
                    let room = self.resource_info(room_id).await?;
                    let mut room_record = self.occupancy_of(&room, now).await?;
                    if room_record.is_available() {
                        room_record.occupy(&flow, &appointment, now);
                        occupancy.push(room_record);
                    } else {
                        debug!(room_id = %room_id, status = ?room_record.status(), "room not free, seating without it");
                    }
                }
            }
            FlowEvent::Complete | FlowEvent::Depart => {
                flow.apply(event, now, true)?;
                for resource_id in [flow.chair_id, appointment.room_id].into_iter().flatten() {
                    let Some(mut record) = self.store.occupancy(resource_id).await? else {
                        continue;
                    };
                    if record.release(flow.flow_id, now) {
                        occupancy.push(record);
                    }
                }
            }
            _ => {
                flow.apply(event, now, true)?;
            }
        }

        flow.version = expected_version + 1;
        let commit = FlowCommit {
            history: FlowStageHistory::entry(&flow, now, actor),
            appointment_status: flow.stage.appointment_status(),
            flow,
            expected_version,
            occupancy,
        };

        match self.store.commit_flow_transition(&commit).await {
            Ok(()) => {}
            Err(StoreError::StaleVersion) => return Ok(Attempt::Stale),
            Err(e) => return Err(e.into()),
        }

        info!(
            appointment_id = %appointment_id,
            flow_id = %commit.flow.flow_id,
            event = %kind,
            stage = %commit.flow.stage,
            "flow transition"
        );
        Ok(Attempt::Done(self.view(commit.flow, now)))
    }

    async fn resource_info(&self, resource_id: Uuid) -> Result<ResourceInfo, SchedulingError> {
        self.directory
            .locate(resource_id)
            .await?
            .ok_or(SchedulingError::NotFound {
                entity: "resource",
                id: resource_id,
            })
    }

    async fn callable_chair(&self, chair_id: Uuid, clinic_id: Uuid) -> Result<ResourceInfo, SchedulingError> {
        let info = self.resource_info(chair_id).await?;
        if info.dimension != ResourceDimension::Chair || info.clinic_id != clinic_id {
            return Err(SchedulingError::Validation(format!(
                "{chair_id} is not a chair of this clinic"
            )));
        }
        if !info.is_active {
            return Err(SchedulingError::ResourceInactive {
                dimension: ResourceDimension::Chair,
                id: chair_id,
            });
        }
        Ok(info)
    }

    async fn occupancy_of(&self, info: &ResourceInfo, now: DateTime<Utc>) -> Result<ResourceOccupancy, SchedulingError> {
        Ok(self
            .store
            .occupancy(info.resource_id)
            .await?
            .unwrap_or_else(|| ResourceOccupancy::vacant(info, now)))
    }

    /// The booked chair when the appointment has one, otherwise any active
    /// chair of the clinic.
    async fn chair_free_for_check_in(&self, appointment: &Appointment) -> Result<bool, SchedulingError> {
        let candidates = match appointment.chair_id {
            Some(chair) if self.directory.is_active_chair(chair).await? => vec![chair],
            Some(_) => return Ok(false),
            None => self.directory.chairs(appointment.clinic_id).await?,
        };
        for chair in candidates {
            let free = self
                .store
                .occupancy(chair)
                .await?
                .is_none_or(|r| r.is_available());
            if free {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /* ---------- reads ---------- */

    fn view(&self, flow: PatientFlowState, now: DateTime<Utc>) -> FlowView {
        FlowView {
            wait_minutes: flow.wait_minutes(now),
            flow,
        }
    }

    /// Applies priority escalation and persists it when it changed. A lost
    /// version race reloads the flow and tries again.
    async fn refresh(&self, mut flow: PatientFlowState) -> Result<FlowView, SchedulingError> {
        let now = self.clock.now();
        for _ in 0..MAX_COMMIT_ATTEMPTS {
            if !flow.escalate(now, self.settings.wait_escalation) {
                return Ok(self.view(flow, now));
            }
            let expected = flow.version;
            flow.version = expected + 1;
            match self.store.save_flow(&flow, expected).await {
                Ok(()) => {
                    info!(appointment_id = %flow.appointment_id, flow_id = %flow.flow_id, "wait escalated to HIGH priority");
                    return Ok(self.view(flow, now));
                }
                Err(StoreError::StaleVersion) => {
                    debug!(appointment_id = %flow.appointment_id, "flow moved while escalating, reloading");
                    flow = self
                        .store
                        .flow_for_appointment(flow.appointment_id)
                        .await?
                        .ok_or(SchedulingError::NotFound {
                            entity: "flow",
                            id: flow.appointment_id,
                        })?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        // Still losing; report the escalation without storing it.
        warn!(appointment_id = %flow.appointment_id, "wait escalation not persisted after repeated version conflicts");
        flow.escalate(now, self.settings.wait_escalation);
        Ok(self.view(flow, now))
    }

    pub async fn get(&self, appointment_id: Uuid) -> Result<FlowView, SchedulingError> {
        let flow = self
            .store
            .flow_for_appointment(appointment_id)
            .await?
            .ok_or(SchedulingError::NotFound {
                entity: "flow",
                id: appointment_id,
            })?;
        self.refresh(flow).await
    }

    /// The patient board for one clinic day.
    pub async fn list_flows(&self, clinic_id: Uuid, service_date: NaiveDate) -> Result<Vec<FlowView>, SchedulingError> {
        let flows = self.store.flows_on(clinic_id, service_date).await?;
        let mut out = Vec::with_capacity(flows.len());
        for flow in flows {
            out.push(self.refresh(flow).await?);
        }
        Ok(out)
    }

    pub async fn history(&self, appointment_id: Uuid) -> Result<Vec<FlowStageHistory>, SchedulingError> {
        let flow = self
            .store
            .flow_for_appointment(appointment_id)
            .await?
            .ok_or(SchedulingError::NotFound {
                entity: "flow",
                id: appointment_id,
            })?;
        Ok(self.store.flow_history(flow.flow_id).await?)
    }
}
