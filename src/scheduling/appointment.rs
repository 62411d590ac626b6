use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::SchedulingError;

/* ============================================================
   Status enums (stored as smallint)
   ============================================================ */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "smallint")]
#[repr(i16)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppointmentStatus {
    Scheduled = 0,
    Confirmed = 1,
    Arrived = 2,
    InProgress = 3,
    Completed = 4,
    Cancelled = 5,
    NoShow = 6,
}

impl AppointmentStatus {
    /// Whether an appointment in this status still claims its interval.
    pub fn holds_time(self) -> bool {
        self != AppointmentStatus::Cancelled
    }

    pub fn is_reschedulable(self) -> bool {
        matches!(self, AppointmentStatus::Scheduled | AppointmentStatus::Confirmed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "smallint")]
#[repr(i16)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfirmationStatus {
    Unconfirmed = 0,
    Confirmed = 1,
    Declined = 2,
}

/// provider / chair / room. Conflicts are checked per dimension.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "smallint")]
#[repr(i16)]
#[serde(rename_all = "lowercase")]
pub enum ResourceDimension {
    Provider = 0,
    Chair = 1,
    Room = 2,
}

impl fmt::Display for ResourceDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResourceDimension::Provider => "provider",
            ResourceDimension::Chair => "chair",
            ResourceDimension::Room => "room",
        })
    }
}

/* ============================================================
   Appointment
   ============================================================ */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Appointment {
    pub appointment_id: Uuid,
    pub clinic_id: Uuid,
    /// None for open slots generated from a template.
    pub patient_id: Option<Uuid>,
    pub provider_id: Uuid,
    pub appointment_type_id: Uuid,
    pub chair_id: Option<Uuid>,
    pub room_id: Option<Uuid>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub duration_min: i32,
    pub status: AppointmentStatus,
    pub confirmation_status: ConfirmationStatus,
    pub capacity: i32,
    pub cleanup_buffer_min: i32,
    pub template_application_id: Option<Uuid>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Appointment {
    /// Live appointments take part in conflict checks and views.
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none() && self.status.holds_time()
    }

    pub fn resource(&self, dimension: ResourceDimension) -> Option<Uuid> {
        match dimension {
            ResourceDimension::Provider => Some(self.provider_id),
            ResourceDimension::Chair => self.chair_id,
            ResourceDimension::Room => self.room_id,
        }
    }

    pub fn claim(&self) -> BookingClaim {
        BookingClaim {
            clinic_id: self.clinic_id,
            provider_id: self.provider_id,
            chair_id: self.chair_id,
            room_id: self.room_id,
            start_at: self.start_at,
            end_at: self.end_at,
        }
    }

    /// When the chair is expected back after seating at `seated_at`.
    pub fn expected_free_at(&self, seated_at: DateTime<Utc>) -> DateTime<Utc> {
        seated_at + Duration::minutes(i64::from(self.duration_min + self.cleanup_buffer_min))
    }
}

/// A booking request, manual or produced from a template slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingCandidate {
    pub clinic_id: Uuid,
    pub patient_id: Option<Uuid>,
    pub provider_id: Uuid,
    pub appointment_type_id: Uuid,
    pub chair_id: Option<Uuid>,
    pub room_id: Option<Uuid>,
    pub start_at: DateTime<Utc>,
    /// Either `end_at` or `duration_min`; neither means the type's default.
    pub end_at: Option<DateTime<Utc>>,
    pub duration_min: Option<i32>,
    #[serde(default)]
    pub capacity: Option<i32>,
    #[serde(default)]
    pub cleanup_buffer_min: Option<i32>,
    #[serde(default)]
    pub template_application_id: Option<Uuid>,
    #[serde(default)]
    pub note: Option<String>,
}

/// Resolves the requested interval to a whole number of minutes.
///
/// `end_at` and `duration_min` must agree when both are given.
pub fn resolve_duration(
    start_at: DateTime<Utc>,
    end_at: Option<DateTime<Utc>>,
    duration_min: Option<i32>,
    default_min: i32,
) -> Result<i32, SchedulingError> {
    let from_end = match end_at {
        Some(end) => {
            let span = end - start_at;
            if span <= Duration::zero() {
                return Err(SchedulingError::Validation(
                    "end_at must be after start_at".into(),
                ));
            }
            if span.num_seconds() % 60 != 0 {
                return Err(SchedulingError::Validation(
                    "appointment length must be a whole number of minutes".into(),
                ));
            }
            let minutes = i32::try_from(span.num_minutes()).map_err(|_| {
                SchedulingError::Validation("appointment is too long".into())
            })?;
            Some(minutes)
        }
        None => None,
    };

    let minutes = match (from_end, duration_min) {
        (Some(a), Some(b)) if a != b => {
            return Err(SchedulingError::Validation(format!(
                "end_at implies {a} minutes but duration_min is {b}"
            )));
        }
        (Some(a), _) => a,
        (None, Some(b)) => b,
        (None, None) => default_min,
    };

    if minutes <= 0 {
        return Err(SchedulingError::Validation(
            "duration must be positive".into(),
        ));
    }
    Ok(minutes)
}

/* ============================================================
   Conflict detection
   ============================================================ */

/// Half-open `[start, end)` overlap.
pub fn intervals_overlap(
    a_start: DateTime<Utc>,
    a_end: DateTime<Utc>,
    b_start: DateTime<Utc>,
    b_end: DateTime<Utc>,
) -> bool {
    a_start < b_end && a_end > b_start
}

/// The resources and interval a booking wants to hold.
#[derive(Debug, Clone, PartialEq)]
pub struct BookingClaim {
    pub clinic_id: Uuid,
    pub provider_id: Uuid,
    pub chair_id: Option<Uuid>,
    pub room_id: Option<Uuid>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
}

impl BookingClaim {
    pub fn resources(&self) -> Vec<(ResourceDimension, Uuid)> {
        let mut out = vec![(ResourceDimension::Provider, self.provider_id)];
        if let Some(chair) = self.chair_id {
            out.push((ResourceDimension::Chair, chair));
        }
        if let Some(room) = self.room_id {
            out.push((ResourceDimension::Room, room));
        }
        out
    }

    pub fn resource_keys(&self) -> Vec<ResourceKey> {
        self.resources()
            .into_iter()
            .map(|(dimension, resource_id)| ResourceKey {
                clinic_id: self.clinic_id,
                dimension,
                resource_id,
            })
            .collect()
    }
}

/// Scope of the atomic check-then-write for one resource timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub clinic_id: Uuid,
    pub dimension: ResourceDimension,
    pub resource_id: Uuid,
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.clinic_id, self.dimension, self.resource_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictDetail {
    pub dimension: ResourceDimension,
    pub resource_id: Uuid,
    /// None when the resource is blocked by something other than an
    /// appointment (a maintenance hold) or the storage layer could not say.
    pub existing_appointment_id: Option<Uuid>,
}

impl fmt::Display for ConflictDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.existing_appointment_id {
            Some(existing) => write!(
                f,
                "{} {} is already booked by appointment {}",
                self.dimension, self.resource_id, existing
            ),
            None => write!(f, "{} {} is not available", self.dimension, self.resource_id),
        }
    }
}

/// First conflict for `claim` among `existing`, checking provider, then
/// chair, then room. Candidates are scanned in (start, id) order so the
/// same schedule always yields the same answer.
pub fn find_conflict(
    claim: &BookingClaim,
    existing: &[Appointment],
    exclude: Option<Uuid>,
) -> Option<ConflictDetail> {
    let mut live: Vec<&Appointment> = existing
        .iter()
        .filter(|a| a.is_live())
        .filter(|a| a.clinic_id == claim.clinic_id)
        .filter(|a| Some(a.appointment_id) != exclude)
        .filter(|a| intervals_overlap(a.start_at, a.end_at, claim.start_at, claim.end_at))
        .collect();
    live.sort_by_key(|a| (a.start_at, a.appointment_id));

    claim.resources().into_iter().find_map(|(dimension, resource_id)| {
        live.iter()
            .find(|a| a.resource(dimension) == Some(resource_id))
            .map(|a| ConflictDetail {
                dimension,
                resource_id,
                existing_appointment_id: Some(a.appointment_id),
            })
    })
}
