use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::SchedulingError;
use super::appointment::{Appointment, ConflictDetail, ResourceDimension};
use super::flow::PatientFlowState;
use crate::clock::Clock;
use crate::directory::{ResourceDirectory, ResourceInfo};
use crate::locks::KeyedLocks;
use crate::store::ScheduleStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "smallint")]
#[repr(i16)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OccupancyStatus {
    Available = 0,
    Occupied = 1,
    Maintenance = 2,
    Blocked = 3,
}

/// The statuses staff may author by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HoldKind {
    Maintenance,
    Blocked,
}

impl From<HoldKind> for OccupancyStatus {
    fn from(kind: HoldKind) -> Self {
        match kind {
            HoldKind::Maintenance => OccupancyStatus::Maintenance,
            HoldKind::Blocked => OccupancyStatus::Blocked,
        }
    }
}

/// Stored projection row for one chair or room.
///
/// The occupant fields mirror the IN_CHAIR flow bound to the resource; the
/// hold fields are authored by staff and override the derived status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ResourceOccupancy {
    pub resource_id: Uuid,
    pub clinic_id: Uuid,
    pub dimension: ResourceDimension,
    pub flow_id: Option<Uuid>,
    pub appointment_id: Option<Uuid>,
    pub patient_id: Option<Uuid>,
    pub occupied_at: Option<DateTime<Utc>>,
    pub expected_free_at: Option<DateTime<Utc>>,
    pub hold_status: Option<OccupancyStatus>,
    pub hold_reason: Option<String>,
    pub held_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ResourceOccupancy {
    pub fn vacant(info: &ResourceInfo, now: DateTime<Utc>) -> Self {
        Self {
            resource_id: info.resource_id,
            clinic_id: info.clinic_id,
            dimension: info.dimension,
            flow_id: None,
            appointment_id: None,
            patient_id: None,
            occupied_at: None,
            expected_free_at: None,
            hold_status: None,
            hold_reason: None,
            held_at: None,
            updated_at: now,
        }
    }

    pub fn status(&self) -> OccupancyStatus {
        match (self.hold_status, self.flow_id) {
            (Some(hold), _) => hold,
            (None, Some(_)) => OccupancyStatus::Occupied,
            (None, None) => OccupancyStatus::Available,
        }
    }

    pub fn is_available(&self) -> bool {
        self.status() == OccupancyStatus::Available
    }

    pub fn is_occupied(&self) -> bool {
        self.flow_id.is_some()
    }

    pub fn occupy(&mut self, flow: &PatientFlowState, appointment: &Appointment, seated_at: DateTime<Utc>) {
        self.flow_id = Some(flow.flow_id);
        self.appointment_id = Some(flow.appointment_id);
        self.patient_id = flow.patient_id;
        self.occupied_at = Some(seated_at);
        self.expected_free_at = Some(appointment.expected_free_at(seated_at));
        self.updated_at = seated_at;
    }

    /// Clears the occupant if it is `flow_id`. Returns whether anything changed.
    pub fn release(&mut self, flow_id: Uuid, now: DateTime<Utc>) -> bool {
        if self.flow_id != Some(flow_id) {
            return false;
        }
        self.clear_occupant(now);
        true
    }

    fn clear_occupant(&mut self, now: DateTime<Utc>) {
        self.flow_id = None;
        self.appointment_id = None;
        self.patient_id = None;
        self.occupied_at = None;
        self.expected_free_at = None;
        self.updated_at = now;
    }

    /// Conflict to report when someone else wants this resource.
    pub fn busy_conflict(&self) -> ConflictDetail {
        ConflictDetail {
            dimension: self.dimension,
            resource_id: self.resource_id,
            existing_appointment_id: self.appointment_id,
        }
    }

    pub fn snapshot(&self) -> OccupancySnapshot {
        OccupancySnapshot {
            resource_id: self.resource_id,
            clinic_id: self.clinic_id,
            dimension: self.dimension,
            status: self.status(),
            appointment_id: self.appointment_id,
            patient_id: self.patient_id,
            occupied_at: self.occupied_at,
            expected_free_at: self.expected_free_at,
            hold_reason: self.hold_reason.clone(),
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OccupancySnapshot {
    pub resource_id: Uuid,
    pub clinic_id: Uuid,
    pub dimension: ResourceDimension,
    pub status: OccupancyStatus,
    pub appointment_id: Option<Uuid>,
    pub patient_id: Option<Uuid>,
    pub occupied_at: Option<DateTime<Utc>>,
    pub expected_free_at: Option<DateTime<Utc>>,
    pub hold_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/* ============================================================
   View
   ============================================================ */

pub struct OccupancyView {
    store: Arc<dyn ScheduleStore>,
    directory: Arc<dyn ResourceDirectory>,
    clock: Arc<dyn Clock>,
    resource_locks: Arc<KeyedLocks<Uuid>>,
}

impl OccupancyView {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        directory: Arc<dyn ResourceDirectory>,
        clock: Arc<dyn Clock>,
        resource_locks: Arc<KeyedLocks<Uuid>>,
    ) -> Self {
        Self {
            store,
            directory,
            clock,
            resource_locks,
        }
    }

    async fn locate(&self, resource_id: Uuid) -> Result<ResourceInfo, SchedulingError> {
        self.directory
            .locate(resource_id)
            .await?
            .ok_or(SchedulingError::NotFound {
                entity: "resource",
                id: resource_id,
            })
    }

    async fn record(&self, info: &ResourceInfo) -> Result<ResourceOccupancy, SchedulingError> {
        Ok(self
            .store
            .occupancy(info.resource_id)
            .await?
            .unwrap_or_else(|| ResourceOccupancy::vacant(info, self.clock.now())))
    }

    pub async fn get(&self, resource_id: Uuid) -> Result<OccupancySnapshot, SchedulingError> {
        let info = self.locate(resource_id).await?;
        Ok(self.record(&info).await?.snapshot())
    }

    /// Every active chair, then every active room, of the clinic.
    pub async fn list(&self, clinic_id: Uuid) -> Result<Vec<OccupancySnapshot>, SchedulingError> {
        let now = self.clock.now();
        let mut stored: HashMap<Uuid, ResourceOccupancy> = self
            .store
            .occupancy_for_clinic(clinic_id)
            .await?
            .into_iter()
            .map(|r| (r.resource_id, r))
            .collect();

        let mut out = Vec::new();
        for (dimension, ids) in [
            (ResourceDimension::Chair, self.directory.chairs(clinic_id).await?),
            (ResourceDimension::Room, self.directory.rooms(clinic_id).await?),
        ] {
            for resource_id in ids {
                let record = stored.remove(&resource_id).unwrap_or_else(|| {
                    ResourceOccupancy::vacant(
                        &ResourceInfo {
                            resource_id,
                            clinic_id,
                            dimension,
                            is_active: true,
                        },
                        now,
                    )
                });
                out.push(record.snapshot());
            }
        }
        Ok(out)
    }

    pub async fn place_hold(
        &self,
        resource_id: Uuid,
        kind: HoldKind,
        reason: Option<String>,
    ) -> Result<OccupancySnapshot, SchedulingError> {
        let info = self.locate(resource_id).await?;
        let _guard = self.resource_locks.lock(resource_id).await;

        let mut record = self.record(&info).await?;
        if record.is_occupied() {
            return Err(SchedulingError::Conflict(record.busy_conflict()));
        }
        let now = self.clock.now();
        record.hold_status = Some(kind.into());
        record.hold_reason = reason.map(|r| r.trim().to_string()).filter(|r| !r.is_empty());
        record.held_at = Some(now);
        record.updated_at = now;
        self.store.put_occupancy(&record).await?;

        info!(resource_id = %resource_id, dimension = %info.dimension, status = ?record.status(), "hold placed");
        Ok(record.snapshot())
    }

    pub async fn clear_hold(&self, resource_id: Uuid) -> Result<OccupancySnapshot, SchedulingError> {
        let info = self.locate(resource_id).await?;
        let _guard = self.resource_locks.lock(resource_id).await;

        let mut record = self.record(&info).await?;
        if record.hold_status.is_none() {
            return Ok(record.snapshot());
        }
        record.hold_status = None;
        record.hold_reason = None;
        record.held_at = None;
        record.updated_at = self.clock.now();
        self.store.put_occupancy(&record).await?;

        info!(resource_id = %resource_id, "hold cleared");
        Ok(record.snapshot())
    }

    /// Recomputes OCCUPIED / AVAILABLE for the clinic from the flows that are
    /// IN_CHAIR right now. Holds are left as they are.
    pub async fn reconcile(&self, clinic_id: Uuid) -> Result<Vec<OccupancySnapshot>, SchedulingError> {
        let mut resources: Vec<(ResourceDimension, Uuid)> = Vec::new();
        for chair in self.directory.chairs(clinic_id).await? {
            resources.push((ResourceDimension::Chair, chair));
        }
        for room in self.directory.rooms(clinic_id).await? {
            resources.push((ResourceDimension::Room, room));
        }
        let _guards = self
            .resource_locks
            .lock_all(resources.iter().map(|(_, id)| *id).collect())
            .await;

        // resource -> the seated flow that should occupy it
        let mut wanted: HashMap<Uuid, (PatientFlowState, Appointment)> = HashMap::new();
        for flow in self.store.seated_flows(clinic_id).await? {
            let Some(appointment) = self.store.appointment(flow.appointment_id).await? else {
                continue;
            };
            for resource in [flow.chair_id, appointment.room_id].into_iter().flatten() {
                wanted.insert(resource, (flow.clone(), appointment.clone()));
            }
        }

        let now = self.clock.now();
        let mut repaired = 0usize;
        for (dimension, resource_id) in &resources {
            let info = ResourceInfo {
                resource_id: *resource_id,
                clinic_id,
                dimension: *dimension,
                is_active: true,
            };
            let mut record = self.record(&info).await?;
            let changed = match wanted.get(resource_id) {
                Some((flow, appointment)) if record.flow_id != Some(flow.flow_id) => {
                    let seated_at = flow.seated_at.unwrap_or(now);
                    record.occupy(flow, appointment, seated_at);
                    record.updated_at = now;
                    true
                }
                None if record.is_occupied() => {
                    record.clear_occupant(now);
                    true
                }
                _ => false,
            };
            if changed {
                warn!(resource_id = %resource_id, status = ?record.status(), "occupancy drift repaired");
                self.store.put_occupancy(&record).await?;
                repaired += 1;
            }
        }

        info!(clinic_id = %clinic_id, resources = resources.len(), repaired, "occupancy reconciled");
        self.list(clinic_id).await
    }
}
