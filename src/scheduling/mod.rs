use std::sync::Arc;

use chrono::{Duration, FixedOffset, Offset, Utc};
use uuid::Uuid;

use crate::clock::Clock;
use crate::directory::{AppointmentTypeCatalog, HolidayCalendar, ResourceDirectory};
use crate::locks::KeyedLocks;
use crate::store::{ScheduleStore, StoreError};

pub mod allocation;
pub mod appointment;
pub mod expansion;
pub mod flow;
pub mod occupancy;
pub mod patient_flow;
pub mod recurrence;
pub mod template;

use allocation::AllocationEngine;
use appointment::{ConflictDetail, ResourceDimension};
use flow::{FlowEventKind, FlowStage};
use occupancy::OccupancyView;
use patient_flow::PatientFlowService;
use template::TemplateRegistry;

/// Everything the scheduling core reports to its callers.
#[derive(Debug, thiserror::Error)]
pub enum SchedulingError {
    #[error("{0}")]
    Conflict(ConflictDetail),

    #[error("cannot {attempted} a flow that is {current}")]
    InvalidTransition {
        current: FlowStage,
        attempted: FlowEventKind,
    },

    #[error("{dimension} {id} is inactive")]
    ResourceInactive { dimension: ResourceDimension, id: Uuid },

    #[error("{0}")]
    Validation(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<StoreError> for SchedulingError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Overlap(detail) => SchedulingError::Conflict(detail),
            StoreError::NotFound { entity, id } => SchedulingError::NotFound { entity, id },
            other => SchedulingError::Storage(other.to_string()),
        }
    }
}

impl From<ConflictDetail> for SchedulingError {
    fn from(detail: ConflictDetail) -> Self {
        SchedulingError::Conflict(detail)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulingSettings {
    /// WAITING longer than this escalates priority to HIGH.
    pub wait_escalation: Duration,
    /// How far ahead one run of a recurring application generates.
    pub recurring_horizon_days: i64,
    /// Offset of clinic-local wall time from UTC.
    pub utc_offset: FixedOffset,
}

impl Default for SchedulingSettings {
    fn default() -> Self {
        Self {
            wait_escalation: Duration::minutes(20),
            recurring_horizon_days: 90,
            utc_offset: Utc.fix(),
        }
    }
}

/// The four engines wired over one store and one set of collaborators.
pub struct SchedulingCore {
    pub allocation: AllocationEngine,
    pub templates: TemplateRegistry,
    pub flows: PatientFlowService,
    pub occupancy: OccupancyView,
}

impl SchedulingCore {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        directory: Arc<dyn ResourceDirectory>,
        calendar: Arc<dyn HolidayCalendar>,
        catalog: Arc<dyn AppointmentTypeCatalog>,
        clock: Arc<dyn Clock>,
        settings: SchedulingSettings,
    ) -> Self {
        // Flow transitions and holds both flip chair occupancy.
        let chair_locks = Arc::new(KeyedLocks::new());
        // Per appointment: flow transitions and appointment edits.
        let flow_locks = Arc::new(KeyedLocks::new());

        Self {
            allocation: AllocationEngine::new(
                store.clone(),
                directory.clone(),
                catalog,
                calendar,
                clock.clone(),
                flow_locks.clone(),
                settings,
            ),
            templates: TemplateRegistry::new(store.clone(), clock.clone()),
            flows: PatientFlowService::new(
                store.clone(),
                directory.clone(),
                clock.clone(),
                chair_locks.clone(),
                flow_locks,
                settings,
            ),
            occupancy: OccupancyView::new(store, directory, clock, chair_locks),
        }
    }
}
