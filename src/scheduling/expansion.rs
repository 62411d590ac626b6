use std::collections::VecDeque;
use std::iter::Peekable;

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::SchedulingError;
use super::recurrence::{Occurrences, RecurringPattern};
use super::template::{ScheduleTemplate, TemplateSlot};
use crate::directory::HolidayCalendar;

/// Longest inclusive DATE_RANGE accepted.
pub const MAX_RANGE_DAYS: i64 = 366;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "smallint")]
#[repr(i16)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationType {
    SingleDate = 0,
    DateRange = 1,
    Recurring = 2,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationScope {
    SingleDate { date: NaiveDate },
    DateRange { start_date: NaiveDate, end_date: NaiveDate },
    Recurring { pattern: RecurringPattern },
}

impl ApplicationScope {
    pub fn application_type(&self) -> ApplicationType {
        match self {
            ApplicationScope::SingleDate { .. } => ApplicationType::SingleDate,
            ApplicationScope::DateRange { .. } => ApplicationType::DateRange,
            ApplicationScope::Recurring { .. } => ApplicationType::Recurring,
        }
    }

    pub fn validate(&self) -> Result<(), SchedulingError> {
        match self {
            ApplicationScope::SingleDate { .. } => Ok(()),
            ApplicationScope::DateRange { start_date, end_date } => {
                if end_date < start_date {
                    return Err(SchedulingError::Validation(
                        "date range ends before it starts".into(),
                    ));
                }
                if (*end_date - *start_date).num_days() >= MAX_RANGE_DAYS {
                    return Err(SchedulingError::Validation(format!(
                        "date range is limited to {MAX_RANGE_DAYS} days"
                    )));
                }
                Ok(())
            }
            ApplicationScope::Recurring { pattern } => pattern.validate(),
        }
    }

    fn dates(&self) -> ScopeDates {
        match self {
            ApplicationScope::SingleDate { date } => ScopeDates::Span {
                next: *date,
                last: *date,
            },
            ApplicationScope::DateRange { start_date, end_date } => ScopeDates::Span {
                next: *start_date,
                last: *end_date,
            },
            ApplicationScope::Recurring { pattern } => ScopeDates::Recurring(pattern.occurrences()),
        }
    }
}

enum ScopeDates {
    Span { next: NaiveDate, last: NaiveDate },
    Recurring(Occurrences),
}

impl Iterator for ScopeDates {
    type Item = NaiveDate;

    fn next(&mut self) -> Option<NaiveDate> {
        match self {
            ScopeDates::Span { next, last } => {
                if *next > *last {
                    return None;
                }
                let date = *next;
                *next = date + Duration::days(1);
                Some(date)
            }
            ScopeDates::Recurring(occurrences) => occurrences.next(),
        }
    }
}

/// Which part of the scope one expansion run covers.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpansionWindow {
    /// Dates on or before this were produced by an earlier run.
    pub after: Option<NaiveDate>,
    /// Dates after this are left for a later run.
    pub through: Option<NaiveDate>,
}

/// A fully time-resolved, not yet committed appointment proposal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateSlot {
    pub template_slot_id: Uuid,
    pub date: NaiveDate,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub appointment_type_id: Uuid,
    pub provider_id: Option<Uuid>,
    pub chair_id: Option<Uuid>,
    pub room_id: Option<Uuid>,
    pub capacity: i32,
    pub prep_buffer_min: i32,
    pub cleanup_buffer_min: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExpansionItem {
    Candidate(CandidateSlot),
    HolidaySkipped { template_slot_id: Uuid, date: NaiveDate },
}

impl ExpansionItem {
    pub fn template_slot_id(&self) -> Uuid {
        match self {
            ExpansionItem::Candidate(c) => c.template_slot_id,
            ExpansionItem::HolidaySkipped { template_slot_id, .. } => *template_slot_id,
        }
    }
}

/// Everything one expansion run produced.
#[derive(Debug, Clone)]
pub struct ExpandedScope {
    pub items: Vec<ExpansionItem>,
    /// The scope has dates beyond `window.through`.
    pub has_more: bool,
}

/// Expands a template against a scope, one date at a time.
///
/// Consuming: once drained it cannot be restarted.
pub struct TemplateExpansion<'a> {
    template: &'a ScheduleTemplate,
    calendar: &'a dyn HolidayCalendar,
    offset: FixedOffset,
    window: ExpansionWindow,
    dates: Peekable<ScopeDates>,
    pending: VecDeque<ExpansionItem>,
    has_more: bool,
}

impl<'a> TemplateExpansion<'a> {
    pub fn new(
        template: &'a ScheduleTemplate,
        scope: &ApplicationScope,
        window: ExpansionWindow,
        calendar: &'a dyn HolidayCalendar,
        offset: FixedOffset,
    ) -> Result<Self, SchedulingError> {
        scope.validate()?;
        Ok(Self {
            template,
            calendar,
            offset,
            window,
            dates: scope.dates().peekable(),
            pending: VecDeque::new(),
            has_more: false,
        })
    }

    fn next_date(&mut self) -> Option<NaiveDate> {
        loop {
            let date = *self.dates.peek()?;
            if let Some(through) = self.window.through {
                if date > through {
                    self.has_more = true;
                    return None;
                }
            }
            self.dates.next();
            if self.window.after.is_some_and(|after| date <= after) {
                continue;
            }
            return Some(date);
        }
    }

    pub async fn next_item(&mut self) -> Result<Option<ExpansionItem>, SchedulingError> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Ok(Some(item));
            }
            let Some(date) = self.next_date() else {
                return Ok(None);
            };
            let slots = self.template.slots_for(date.weekday());
            if slots.is_empty() {
                continue;
            }

            if self.calendar.is_closed(self.template.clinic_id, date).await? {
                self.pending.extend(slots.iter().map(|s| ExpansionItem::HolidaySkipped {
                    template_slot_id: s.slot_id,
                    date,
                }));
                continue;
            }

            for slot in slots {
                self.pending
                    .push_back(ExpansionItem::Candidate(instantiate(slot, date, self.offset)?));
            }
        }
    }

    pub async fn collect_all(mut self) -> Result<ExpandedScope, SchedulingError> {
        let mut items = Vec::new();
        while let Some(item) = self.next_item().await? {
            items.push(item);
        }
        Ok(ExpandedScope {
            items,
            has_more: self.has_more,
        })
    }
}

fn instantiate(
    slot: &TemplateSlot,
    date: NaiveDate,
    offset: FixedOffset,
) -> Result<CandidateSlot, SchedulingError> {
    Ok(CandidateSlot {
        template_slot_id: slot.slot_id,
        date,
        start_at: local_to_utc(date, slot.start_time, offset)?,
        end_at: local_to_utc(date, slot.end_time, offset)?,
        appointment_type_id: slot.appointment_type_id,
        provider_id: slot.provider_id,
        chair_id: slot.chair_id,
        room_id: slot.room_id,
        capacity: slot.capacity,
        prep_buffer_min: slot.prep_buffer_min,
        cleanup_buffer_min: slot.cleanup_buffer_min,
    })
}

pub fn local_to_utc(
    date: NaiveDate,
    time: NaiveTime,
    offset: FixedOffset,
) -> Result<DateTime<Utc>, SchedulingError> {
    offset
        .from_local_datetime(&date.and_time(time))
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| SchedulingError::Validation(format!("{date} {time} is not a valid local time")))
}
