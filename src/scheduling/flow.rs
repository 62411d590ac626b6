use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::SchedulingError;
use super::appointment::{Appointment, AppointmentStatus, ConflictDetail, ResourceDimension};

/* ============================================================
   Stages, priority, events
   ============================================================ */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "smallint")]
#[repr(i16)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowStage {
    Scheduled = 0,
    CheckedIn = 1,
    Waiting = 2,
    Called = 3,
    InChair = 4,
    Completed = 5,
    CheckedOut = 6,
    Departed = 7,
    NoShow = 8,
    Cancelled = 9,
}

impl FlowStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, FlowStage::Departed | FlowStage::NoShow | FlowStage::Cancelled)
    }

    /// Lifecycle status the appointment takes when the flow enters this stage.
    pub fn appointment_status(self) -> Option<AppointmentStatus> {
        match self {
            FlowStage::Scheduled => None,
            FlowStage::CheckedIn | FlowStage::Waiting | FlowStage::Called => Some(AppointmentStatus::Arrived),
            FlowStage::InChair => Some(AppointmentStatus::InProgress),
            FlowStage::Completed | FlowStage::CheckedOut | FlowStage::Departed => {
                Some(AppointmentStatus::Completed)
            }
            FlowStage::NoShow => Some(AppointmentStatus::NoShow),
            FlowStage::Cancelled => Some(AppointmentStatus::Cancelled),
        }
    }
}

impl fmt::Display for FlowStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FlowStage::Scheduled => "SCHEDULED",
            FlowStage::CheckedIn => "CHECKED_IN",
            FlowStage::Waiting => "WAITING",
            FlowStage::Called => "CALLED",
            FlowStage::InChair => "IN_CHAIR",
            FlowStage::Completed => "COMPLETED",
            FlowStage::CheckedOut => "CHECKED_OUT",
            FlowStage::Departed => "DEPARTED",
            FlowStage::NoShow => "NO_SHOW",
            FlowStage::Cancelled => "CANCELLED",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "smallint")]
#[repr(i16)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowPriority {
    Normal = 0,
    High = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowEvent {
    CheckIn,
    /// Send a checked-in patient to the waiting room.
    Wait,
    Call { chair_id: Uuid },
    Seat,
    Complete,
    CheckOut,
    Depart,
    NoShow,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowEventKind {
    CheckIn,
    Wait,
    Call,
    Seat,
    Complete,
    CheckOut,
    Depart,
    NoShow,
    Cancel,
}

impl FlowEvent {
    pub fn kind(&self) -> FlowEventKind {
        match self {
            FlowEvent::CheckIn => FlowEventKind::CheckIn,
            FlowEvent::Wait => FlowEventKind::Wait,
            FlowEvent::Call { .. } => FlowEventKind::Call,
            FlowEvent::Seat => FlowEventKind::Seat,
            FlowEvent::Complete => FlowEventKind::Complete,
            FlowEvent::CheckOut => FlowEventKind::CheckOut,
            FlowEvent::Depart => FlowEventKind::Depart,
            FlowEvent::NoShow => FlowEventKind::NoShow,
            FlowEvent::Cancel => FlowEventKind::Cancel,
        }
    }
}

impl fmt::Display for FlowEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FlowEventKind::CheckIn => "CHECK_IN",
            FlowEventKind::Wait => "WAIT",
            FlowEventKind::Call => "CALL",
            FlowEventKind::Seat => "SEAT",
            FlowEventKind::Complete => "COMPLETE",
            FlowEventKind::CheckOut => "CHECK_OUT",
            FlowEventKind::Depart => "DEPART",
            FlowEventKind::NoShow => "NO_SHOW",
            FlowEventKind::Cancel => "CANCEL",
        })
    }
}

/// Source stages from which `event` is accepted.
pub fn accepts(stage: FlowStage, event: FlowEventKind) -> bool {
    use FlowEventKind as E;
    use FlowStage as S;
    match event {
        E::CheckIn => stage == S::Scheduled,
        E::Wait => stage == S::CheckedIn,
        E::Call => matches!(stage, S::CheckedIn | S::Waiting),
        E::Seat => stage == S::Called,
        E::Complete => stage == S::InChair,
        E::CheckOut => stage == S::Completed,
        E::Depart => stage == S::CheckedOut,
        E::NoShow | E::Cancel => matches!(stage, S::Scheduled | S::CheckedIn | S::Waiting),
    }
}

/* ============================================================
   Flow state
   ============================================================ */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PatientFlowState {
    pub flow_id: Uuid,
    pub appointment_id: Uuid,
    pub clinic_id: Uuid,
    pub patient_id: Option<Uuid>,
    pub provider_id: Uuid,
    pub chair_id: Option<Uuid>,
    pub service_date: NaiveDate,
    pub stage: FlowStage,
    pub priority: FlowPriority,
    pub scheduled_at: DateTime<Utc>,
    pub checked_in_at: Option<DateTime<Utc>>,
    pub called_at: Option<DateTime<Utc>>,
    pub seated_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub checked_out_at: Option<DateTime<Utc>>,
    pub departed_at: Option<DateTime<Utc>>,
    pub current_wait_started_at: Option<DateTime<Utc>>,
    pub version: i32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct FlowStageHistory {
    pub history_id: Uuid,
    pub flow_id: Uuid,
    pub appointment_id: Uuid,
    pub stage: FlowStage,
    pub entered_at: DateTime<Utc>,
    pub triggered_by: Option<Uuid>,
}

impl FlowStageHistory {
    pub fn entry(flow: &PatientFlowState, entered_at: DateTime<Utc>, triggered_by: Option<Uuid>) -> Self {
        Self {
            history_id: Uuid::new_v4(),
            flow_id: flow.flow_id,
            appointment_id: flow.appointment_id,
            stage: flow.stage,
            entered_at,
            triggered_by,
        }
    }
}

fn stamp(slot: &mut Option<DateTime<Utc>>, now: DateTime<Utc>) {
    if slot.is_none() {
        *slot = Some(now);
    }
}

impl PatientFlowState {
    /// The SCHEDULED flow for an appointment on its service date.
    pub fn open(appointment: &Appointment, service_date: NaiveDate, now: DateTime<Utc>) -> Self {
        Self {
            flow_id: Uuid::new_v4(),
            appointment_id: appointment.appointment_id,
            clinic_id: appointment.clinic_id,
            patient_id: appointment.patient_id,
            provider_id: appointment.provider_id,
            chair_id: appointment.chair_id,
            service_date,
            stage: FlowStage::Scheduled,
            priority: FlowPriority::Normal,
            scheduled_at: appointment.start_at,
            checked_in_at: None,
            called_at: None,
            seated_at: None,
            completed_at: None,
            checked_out_at: None,
            departed_at: None,
            current_wait_started_at: None,
            version: 0,
            updated_at: now,
        }
    }

    /// Applies `event`. `chair_free` answers "is a chair available right
    /// now": any suitable chair for CHECK_IN, the target chair for CALL.
    ///
    /// On rejection the state is left untouched.
    pub fn apply(
        &mut self,
        event: &FlowEvent,
        now: DateTime<Utc>,
        chair_free: bool,
    ) -> Result<FlowStage, SchedulingError> {
        if !accepts(self.stage, event.kind()) {
            return Err(SchedulingError::InvalidTransition {
                current: self.stage,
                attempted: event.kind(),
            });
        }

        match event {
            FlowEvent::CheckIn => {
                stamp(&mut self.checked_in_at, now);
                if chair_free {
                    self.stage = FlowStage::CheckedIn;
                } else {
                    self.stage = FlowStage::Waiting;
                    self.current_wait_started_at = Some(now);
                }
            }
            FlowEvent::Wait => {
                self.stage = FlowStage::Waiting;
                self.current_wait_started_at = Some(now);
            }
            FlowEvent::Call { chair_id } => {
                if !chair_free {
                    return Err(SchedulingError::Conflict(ConflictDetail {
                        dimension: ResourceDimension::Chair,
                        resource_id: *chair_id,
                        existing_appointment_id: None,
                    }));
                }
                stamp(&mut self.called_at, now);
                self.chair_id = Some(*chair_id);
                self.current_wait_started_at = None;
                self.stage = FlowStage::Called;
            }
            FlowEvent::Seat => {
                stamp(&mut self.seated_at, now);
                self.stage = FlowStage::InChair;
            }
            FlowEvent::Complete => {
                stamp(&mut self.completed_at, now);
                self.stage = FlowStage::Completed;
            }
            FlowEvent::CheckOut => {
                stamp(&mut self.checked_out_at, now);
                self.stage = FlowStage::CheckedOut;
            }
            FlowEvent::Depart => {
                stamp(&mut self.departed_at, now);
                self.stage = FlowStage::Departed;
            }
            FlowEvent::NoShow => {
                self.current_wait_started_at = None;
                self.stage = FlowStage::NoShow;
            }
            FlowEvent::Cancel => {
                self.current_wait_started_at = None;
                self.stage = FlowStage::Cancelled;
            }
        }

        self.updated_at = now;
        Ok(self.stage)
    }

    /// NORMAL → HIGH once a WAITING flow has waited longer than `threshold`.
    /// Returns true when the priority changed.
    pub fn escalate(&mut self, now: DateTime<Utc>, threshold: Duration) -> bool {
        if self.stage != FlowStage::Waiting || self.priority == FlowPriority::High {
            return false;
        }
        match self.current_wait_started_at {
            Some(started) if now - started > threshold => {
                self.priority = FlowPriority::High;
                self.updated_at = now;
                true
            }
            _ => false,
        }
    }

    pub fn wait_minutes(&self, now: DateTime<Utc>) -> Option<i64> {
        if self.stage != FlowStage::Waiting {
            return None;
        }
        self.current_wait_started_at.map(|s| (now - s).num_minutes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduling::appointment::ConfirmationStatus;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, 8, 50, 0).unwrap()
    }

    fn flow() -> PatientFlowState {
        let start = Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0).unwrap();
        let appt = Appointment {
            appointment_id: Uuid::new_v4(),
            clinic_id: Uuid::nil(),
            patient_id: Some(Uuid::new_v4()),
            provider_id: Uuid::new_v4(),
            appointment_type_id: Uuid::new_v4(),
            chair_id: None,
            room_id: None,
            start_at: start,
            end_at: start + Duration::minutes(30),
            duration_min: 30,
            status: AppointmentStatus::Scheduled,
            confirmation_status: ConfirmationStatus::Unconfirmed,
            capacity: 1,
            cleanup_buffer_min: 0,
            template_application_id: None,
            note: None,
            created_at: start,
            updated_at: start,
            deleted_at: None,
        };
        PatientFlowState::open(&appt, start.date_naive(), now())
    }

    const ALL_EVENTS: [FlowEventKind; 9] = [
        FlowEventKind::CheckIn,
        FlowEventKind::Wait,
        FlowEventKind::Call,
        FlowEventKind::Seat,
        FlowEventKind::Complete,
        FlowEventKind::CheckOut,
        FlowEventKind::Depart,
        FlowEventKind::NoShow,
        FlowEventKind::Cancel,
    ];

    fn event(kind: FlowEventKind) -> FlowEvent {
        match kind {
            FlowEventKind::CheckIn => FlowEvent::CheckIn,
            FlowEventKind::Wait => FlowEvent::Wait,
            FlowEventKind::Call => FlowEvent::Call { chair_id: Uuid::nil() },
            FlowEventKind::Seat => FlowEvent::Seat,
            FlowEventKind::Complete => FlowEvent::Complete,
            FlowEventKind::CheckOut => FlowEvent::CheckOut,
            FlowEventKind::Depart => FlowEvent::Depart,
            FlowEventKind::NoShow => FlowEvent::NoShow,
            FlowEventKind::Cancel => FlowEvent::Cancel,
        }
    }

    #[test]
    fn happy_path_stamps_each_timestamp_once() {
        let mut f = flow();
        let t = now();
        f.apply(&FlowEvent::CheckIn, t, true).unwrap();
        assert_eq!(f.stage, FlowStage::CheckedIn);
        assert!(f.current_wait_started_at.is_none());

        let chair = Uuid::new_v4();
        f.apply(&FlowEvent::Call { chair_id: chair }, t + Duration::minutes(1), true).unwrap();
        assert_eq!(f.chair_id, Some(chair));
        f.apply(&FlowEvent::Seat, t + Duration::minutes(2), true).unwrap();
        f.apply(&FlowEvent::Complete, t + Duration::minutes(40), true).unwrap();
        f.apply(&FlowEvent::CheckOut, t + Duration::minutes(45), true).unwrap();
        f.apply(&FlowEvent::Depart, t + Duration::minutes(50), true).unwrap();

        assert_eq!(f.stage, FlowStage::Departed);
        assert_eq!(f.checked_in_at, Some(t));
        assert_eq!(f.called_at, Some(t + Duration::minutes(1)));
        assert_eq!(f.seated_at, Some(t + Duration::minutes(2)));
        assert_eq!(f.completed_at, Some(t + Duration::minutes(40)));
        assert_eq!(f.checked_out_at, Some(t + Duration::minutes(45)));
        assert_eq!(f.departed_at, Some(t + Duration::minutes(50)));
    }

    #[test]
    fn check_in_without_free_chair_waits() {
        let mut f = flow();
        assert_eq!(f.apply(&FlowEvent::CheckIn, now(), false).unwrap(), FlowStage::Waiting);
        assert_eq!(f.current_wait_started_at, Some(now()));

        f.apply(&FlowEvent::Call { chair_id: Uuid::new_v4() }, now() + Duration::minutes(5), true)
            .unwrap();
        assert!(f.current_wait_started_at.is_none());
    }

    #[test]
    fn rejected_event_leaves_state_untouched() {
        let mut f = flow();
        let before = f.clone();
        let err = f.apply(&FlowEvent::Seat, now(), true).unwrap_err();
        assert!(matches!(
            err,
            SchedulingError::InvalidTransition {
                current: FlowStage::Scheduled,
                attempted: FlowEventKind::Seat
            }
        ));
        assert_eq!(f, before);
    }

    #[test]
    fn call_into_busy_chair_is_a_conflict() {
        let mut f = flow();
        f.apply(&FlowEvent::CheckIn, now(), false).unwrap();
        let before = f.clone();
        let err = f.apply(&FlowEvent::Call { chair_id: Uuid::new_v4() }, now(), false).unwrap_err();
        assert!(matches!(err, SchedulingError::Conflict(_)));
        assert_eq!(f, before);
    }

    #[test]
    fn terminal_stages_accept_nothing() {
        for terminal in [FlowStage::Departed, FlowStage::NoShow, FlowStage::Cancelled] {
            for kind in ALL_EVENTS {
                assert!(!accepts(terminal, kind), "{terminal} accepted {kind}");
            }
        }
    }

    #[test]
    fn stages_never_move_backwards() {
        fn rank(s: FlowStage) -> u8 {
            match s {
                FlowStage::Scheduled => 0,
                FlowStage::CheckedIn => 1,
                FlowStage::Waiting => 2,
                FlowStage::Called => 3,
                FlowStage::InChair => 4,
                FlowStage::Completed => 5,
                FlowStage::CheckedOut => 6,
                FlowStage::Departed | FlowStage::NoShow | FlowStage::Cancelled => 7,
            }
        }

        // Walk every reachable state through every event.
        let mut frontier = vec![flow()];
        let mut seen = 0;
        while let Some(state) = frontier.pop() {
            seen += 1;
            assert!(seen < 1000);
            for kind in ALL_EVENTS {
                for chair_free in [true, false] {
                    let mut next = state.clone();
                    if next.apply(&event(kind), now(), chair_free).is_ok() {
                        assert!(rank(next.stage) > rank(state.stage), "{} -> {}", state.stage, next.stage);
                        frontier.push(next);
                    }
                }
            }
        }
    }

    #[test]
    fn no_show_and_cancel_only_before_call() {
        for stage in [FlowStage::Scheduled, FlowStage::CheckedIn, FlowStage::Waiting] {
            assert!(accepts(stage, FlowEventKind::NoShow));
            assert!(accepts(stage, FlowEventKind::Cancel));
        }
        for stage in [FlowStage::Called, FlowStage::InChair, FlowStage::Completed, FlowStage::CheckedOut] {
            assert!(!accepts(stage, FlowEventKind::NoShow));
            assert!(!accepts(stage, FlowEventKind::Cancel));
        }
    }

    #[test]
    fn escalation_after_threshold() {
        let mut f = flow();
        f.apply(&FlowEvent::CheckIn, now(), false).unwrap();
        let threshold = Duration::minutes(20);

        assert!(!f.escalate(now() + Duration::minutes(20), threshold));
        assert_eq!(f.priority, FlowPriority::Normal);
        assert!(f.escalate(now() + Duration::minutes(25), threshold));
        assert_eq!(f.priority, FlowPriority::High);
        assert!(!f.escalate(now() + Duration::minutes(30), threshold));
        assert_eq!(f.wait_minutes(now() + Duration::minutes(25)), Some(25));
    }

    #[test]
    fn only_waiting_flows_escalate() {
        let mut f = flow();
        f.apply(&FlowEvent::CheckIn, now(), true).unwrap();
        assert!(!f.escalate(now() + Duration::hours(2), Duration::minutes(20)));
    }

    #[test]
    fn event_json_shape() {
        let e: FlowEvent = serde_json::from_value(serde_json::json!({
            "event": "CALL",
            "chair_id": "00000000-0000-0000-0000-000000000000"
        }))
        .unwrap();
        assert_eq!(e, FlowEvent::Call { chair_id: Uuid::nil() });
        let e: FlowEvent = serde_json::from_value(serde_json::json!({ "event": "CHECK_IN" })).unwrap();
        assert_eq!(e, FlowEvent::CheckIn);
    }
}
