use std::sync::Arc;

use chrono::{DateTime, NaiveTime, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::SchedulingError;
use super::appointment::ResourceDimension;
use super::recurrence::weekday_from_index;
use crate::clock::Clock;
use crate::locks::KeyedLocks;
use crate::store::{ScheduleStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "smallint")]
#[repr(i16)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TemplateKind {
    Day = 0,
    Week = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "smallint")]
#[repr(i16)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TemplateStatus {
    Draft = 0,
    Active = 1,
    Archived = 2,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TemplateSlot {
    pub slot_id: Uuid,
    pub position: i32,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    /// 0 = Sunday .. 6 = Saturday; week templates only.
    pub day_of_week: Option<i16>,
    pub appointment_type_id: Uuid,
    pub provider_id: Option<Uuid>,
    pub chair_id: Option<Uuid>,
    pub room_id: Option<Uuid>,
    pub capacity: i32,
    pub prep_buffer_min: i32,
    pub cleanup_buffer_min: i32,
    pub label: Option<String>,
}

impl TemplateSlot {
    pub fn weekday(&self) -> Option<Weekday> {
        self.day_of_week
            .and_then(|d| u8::try_from(d).ok())
            .and_then(weekday_from_index)
    }

    fn resource(&self, dimension: ResourceDimension) -> Option<Uuid> {
        match dimension {
            ResourceDimension::Provider => self.provider_id,
            ResourceDimension::Chair => self.chair_id,
            ResourceDimension::Room => self.room_id,
        }
    }

    /// Minutes since midnight the slot holds, buffers included.
    fn footprint(&self) -> (i64, i64) {
        let start = minutes_of_day(self.start_time) - i64::from(self.prep_buffer_min);
        let end = minutes_of_day(self.end_time) + i64::from(self.cleanup_buffer_min);
        (start, end)
    }
}

fn minutes_of_day(t: NaiveTime) -> i64 {
    i64::from(t.num_seconds_from_midnight() / 60)
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateSlotInput {
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub day_of_week: Option<i16>,
    pub appointment_type_id: Uuid,
    pub provider_id: Option<Uuid>,
    pub chair_id: Option<Uuid>,
    pub room_id: Option<Uuid>,
    pub capacity: Option<i32>,
    pub prep_buffer_min: Option<i32>,
    pub cleanup_buffer_min: Option<i32>,
    pub label: Option<String>,
}

impl TemplateSlotInput {
    fn into_slot(self, position: i32) -> TemplateSlot {
        TemplateSlot {
            slot_id: Uuid::new_v4(),
            position,
            start_time: self.start_time,
            end_time: self.end_time,
            day_of_week: self.day_of_week,
            appointment_type_id: self.appointment_type_id,
            provider_id: self.provider_id,
            chair_id: self.chair_id,
            room_id: self.room_id,
            capacity: self.capacity.unwrap_or(1),
            prep_buffer_min: self.prep_buffer_min.unwrap_or(0),
            cleanup_buffer_min: self.cleanup_buffer_min.unwrap_or(0),
            label: self.label,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleTemplate {
    pub template_id: Uuid,
    pub clinic_id: Uuid,
    pub name: String,
    pub kind: TemplateKind,
    pub status: TemplateStatus,
    pub version: i32,
    pub parent_template_id: Option<Uuid>,
    pub slots: Vec<TemplateSlot>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduleTemplate {
    pub fn draft(
        clinic_id: Uuid,
        name: &str,
        kind: TemplateKind,
        slots: Vec<TemplateSlotInput>,
        now: DateTime<Utc>,
    ) -> Result<Self, SchedulingError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SchedulingError::Validation("template name is required".into()));
        }
        let slots = build_slots(slots);
        validate_slots(kind, &slots)?;

        Ok(Self {
            template_id: Uuid::new_v4(),
            clinic_id,
            name: name.to_string(),
            kind,
            status: TemplateStatus::Draft,
            version: 1,
            parent_template_id: None,
            slots,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn activate(&mut self, now: DateTime<Utc>) -> Result<(), SchedulingError> {
        match self.status {
            TemplateStatus::Draft => {
                if self.slots.is_empty() {
                    return Err(SchedulingError::Validation(
                        "cannot activate a template without slots".into(),
                    ));
                }
                self.status = TemplateStatus::Active;
                self.updated_at = now;
                Ok(())
            }
            TemplateStatus::Active => Ok(()),
            TemplateStatus::Archived => Err(SchedulingError::Validation(
                "archived templates cannot be activated".into(),
            )),
        }
    }

    /// Replaces the slot set. Drafts change in place; an active template is
    /// archived and the returned template is its successor version, so
    /// applications generated from this version keep pointing at it.
    pub fn revise(
        &mut self,
        slots: Vec<TemplateSlotInput>,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduleTemplate>, SchedulingError> {
        let slots = build_slots(slots);
        validate_slots(self.kind, &slots)?;

        match self.status {
            TemplateStatus::Draft => {
                self.slots = slots;
                self.updated_at = now;
                Ok(None)
            }
            TemplateStatus::Active => {
                let next = ScheduleTemplate {
                    template_id: Uuid::new_v4(),
                    clinic_id: self.clinic_id,
                    name: self.name.clone(),
                    kind: self.kind,
                    status: TemplateStatus::Active,
                    version: self.version + 1,
                    parent_template_id: Some(self.template_id),
                    slots,
                    created_at: now,
                    updated_at: now,
                };
                self.status = TemplateStatus::Archived;
                self.updated_at = now;
                Ok(Some(next))
            }
            TemplateStatus::Archived => Err(SchedulingError::Validation(
                "archived templates cannot be revised".into(),
            )),
        }
    }

    /// Slots that apply on `weekday`, in start order.
    pub fn slots_for(&self, weekday: Weekday) -> Vec<&TemplateSlot> {
        let mut out: Vec<&TemplateSlot> = self
            .slots
            .iter()
            .filter(|s| match self.kind {
                TemplateKind::Day => true,
                TemplateKind::Week => s.weekday() == Some(weekday),
            })
            .collect();
        out.sort_by_key(|s| (s.start_time, s.position));
        out
    }
}

fn build_slots(inputs: Vec<TemplateSlotInput>) -> Vec<TemplateSlot> {
    inputs
        .into_iter()
        .enumerate()
        .map(|(i, input)| input.into_slot(i as i32))
        .collect()
}

pub fn validate_slots(kind: TemplateKind, slots: &[TemplateSlot]) -> Result<(), SchedulingError> {
    for slot in slots {
        if slot.end_time <= slot.start_time {
            return Err(SchedulingError::Validation(format!(
                "slot {}-{} must end after it starts",
                slot.start_time, slot.end_time
            )));
        }
        if slot.capacity < 1 {
            return Err(SchedulingError::Validation("slot capacity must be at least 1".into()));
        }
        if slot.prep_buffer_min < 0 || slot.cleanup_buffer_min < 0 {
            return Err(SchedulingError::Validation("buffers cannot be negative".into()));
        }
        match (kind, slot.day_of_week) {
            (TemplateKind::Week, None) => {
                return Err(SchedulingError::Validation(
                    "week template slots need day_of_week".into(),
                ));
            }
            (TemplateKind::Week, Some(_)) if slot.weekday().is_none() => {
                return Err(SchedulingError::Validation(
                    "day_of_week must be 0 (Sunday) .. 6 (Saturday)".into(),
                ));
            }
            (TemplateKind::Day, Some(_)) => {
                return Err(SchedulingError::Validation(
                    "day template slots cannot set day_of_week".into(),
                ));
            }
            _ => {}
        }
    }

    // Same pre-assigned resource on the same day must not overlap.
    for (i, a) in slots.iter().enumerate() {
        for b in &slots[i + 1..] {
            if a.day_of_week != b.day_of_week {
                continue;
            }
            let (a_start, a_end) = a.footprint();
            let (b_start, b_end) = b.footprint();
            if !(a_start < b_end && a_end > b_start) {
                continue;
            }
            for dimension in [
                ResourceDimension::Provider,
                ResourceDimension::Chair,
                ResourceDimension::Room,
            ] {
                if let (Some(x), Some(y)) = (a.resource(dimension), b.resource(dimension)) {
                    if x == y {
                        return Err(SchedulingError::Validation(format!(
                            "slots {}-{} and {}-{} overlap on {dimension} {x}",
                            a.start_time, a.end_time, b.start_time, b.end_time
                        )));
                    }
                }
            }
        }
    }
    Ok(())
}

/* ============================================================
   Registry
   ============================================================ */

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTemplateRequest {
    pub clinic_id: Uuid,
    pub name: String,
    pub kind: TemplateKind,
    #[serde(default)]
    pub slots: Vec<TemplateSlotInput>,
}

/// Authoring side of the template engine: create, activate, revise.
pub struct TemplateRegistry {
    store: Arc<dyn ScheduleStore>,
    clock: Arc<dyn Clock>,
    template_locks: KeyedLocks<Uuid>,
}

impl TemplateRegistry {
    pub fn new(store: Arc<dyn ScheduleStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            template_locks: KeyedLocks::new(),
        }
    }

    pub async fn create(&self, req: CreateTemplateRequest) -> Result<ScheduleTemplate, SchedulingError> {
        let template = ScheduleTemplate::draft(req.clinic_id, &req.name, req.kind, req.slots, self.clock.now())?;
        self.store.insert_template(&template).await?;
        info!(template_id = %template.template_id, slots = template.slots.len(), "template created");
        Ok(template)
    }

    pub async fn get(&self, template_id: Uuid) -> Result<ScheduleTemplate, SchedulingError> {
        self.store
            .template(template_id)
            .await?
            .ok_or(SchedulingError::NotFound {
                entity: "template",
                id: template_id,
            })
    }

    pub async fn activate(&self, template_id: Uuid) -> Result<ScheduleTemplate, SchedulingError> {
        let _guard = self.template_locks.lock(template_id).await;
        let mut template = self.get(template_id).await?;
        template.activate(self.clock.now())?;
        self.store.update_template(&template).await?;
        info!(template_id = %template_id, version = template.version, "template activated");
        Ok(template)
    }

    /// Returns the template that is current after the edit.
    pub async fn revise(
        &self,
        template_id: Uuid,
        slots: Vec<TemplateSlotInput>,
    ) -> Result<ScheduleTemplate, SchedulingError> {
        let _guard = self.template_locks.lock(template_id).await;
        let mut template = self.get(template_id).await?;
        match template.revise(slots, self.clock.now())? {
            None => {
                self.store.update_template(&template).await?;
                Ok(template)
            }
            Some(next) => {
                self.store
                    .replace_template(&template, &next)
                    .await
                    .map_err(|e| match e {
                        StoreError::StaleVersion => SchedulingError::Validation(format!(
                            "template {template_id} was revised concurrently"
                        )),
                        other => other.into(),
                    })?;
                info!(
                    previous = %template.template_id,
                    template_id = %next.template_id,
                    version = next.version,
                    "template revised into new version"
                );
                Ok(next)
            }
        }
    }
}
