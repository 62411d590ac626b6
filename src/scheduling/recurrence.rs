use chrono::{Datelike, Duration, Months, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

use super::SchedulingError;

/// Hard ceiling on how far any series may run past its start date.
pub const MAX_SERIES_DAYS: i64 = 1096;

const MAX_INTERVAL: u32 = 366;

/// Recurrence rule. Day-of-week numbers are 0 = Sunday .. 6 = Saturday.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frequency {
    Daily,
    Weekly {
        #[serde(default)]
        days_of_week: Vec<u8>,
    },
    Biweekly {
        #[serde(default)]
        days_of_week: Vec<u8>,
    },
    Monthly {
        #[serde(default)]
        day_of_month: Option<u32>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringPattern {
    pub start_date: NaiveDate,
    pub frequency: Frequency,
    /// Every Nth day / week / month.
    #[serde(default = "default_interval")]
    pub interval: u32,
    pub end_date: Option<NaiveDate>,
    pub max_occurrences: Option<u32>,
}

fn default_interval() -> u32 {
    1
}

pub fn weekday_from_index(index: u8) -> Option<Weekday> {
    Some(match index {
        0 => Weekday::Sun,
        1 => Weekday::Mon,
        2 => Weekday::Tue,
        3 => Weekday::Wed,
        4 => Weekday::Thu,
        5 => Weekday::Fri,
        6 => Weekday::Sat,
        _ => return None,
    })
}

pub fn weekday_index(day: Weekday) -> u8 {
    day.num_days_from_sunday() as u8
}

impl RecurringPattern {
    pub fn validate(&self) -> Result<(), SchedulingError> {
        if self.interval == 0 || self.interval > MAX_INTERVAL {
            return Err(SchedulingError::Validation(format!(
                "recurrence interval must be between 1 and {MAX_INTERVAL}"
            )));
        }
        if self.end_date.is_none() && self.max_occurrences.is_none() {
            return Err(SchedulingError::Validation(
                "recurrence needs an end_date or max_occurrences".into(),
            ));
        }
        if let Some(end) = self.end_date {
            if end < self.start_date {
                return Err(SchedulingError::Validation(
                    "recurrence end_date is before start_date".into(),
                ));
            }
        }
        if self.max_occurrences == Some(0) {
            return Err(SchedulingError::Validation(
                "max_occurrences must be at least 1".into(),
            ));
        }
        match &self.frequency {
            Frequency::Daily => {}
            Frequency::Weekly { days_of_week } | Frequency::Biweekly { days_of_week } => {
                if let Some(bad) = days_of_week.iter().find(|d| **d > 6) {
                    return Err(SchedulingError::Validation(format!(
                        "day of week {bad} is out of range 0..=6"
                    )));
                }
            }
            Frequency::Monthly { day_of_month } => {
                if let Some(day) = day_of_month {
                    if !(1..=31).contains(day) {
                        return Err(SchedulingError::Validation(format!(
                            "day of month {day} is out of range 1..=31"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Occurrence dates in ascending order. Stops at `end_date` or after
    /// `max_occurrences`, whichever comes first.
    pub fn occurrences(&self) -> Occurrences {
        let horizon = self.start_date + Duration::days(MAX_SERIES_DAYS);
        let last_day = self.end_date.map_or(horizon, |end| end.min(horizon));

        let (weekdays, week_stride) = match &self.frequency {
            Frequency::Weekly { days_of_week } => (weekdays_or_start(days_of_week, self.start_date), 1),
            Frequency::Biweekly { days_of_week } => (weekdays_or_start(days_of_week, self.start_date), 2),
            Frequency::Daily | Frequency::Monthly { .. } => (Vec::new(), 1),
        };

        Occurrences {
            week_anchor: self.start_date
                - Duration::days(i64::from(self.start_date.weekday().num_days_from_monday())),
            week_stride: week_stride * i64::from(self.interval.max(1)),
            pattern: self.clone(),
            weekdays,
            last_day,
            step: 0,
            emitted: 0,
            finished: false,
        }
    }
}

fn weekdays_or_start(days: &[u8], start: NaiveDate) -> Vec<Weekday> {
    let mut out: Vec<Weekday> = days.iter().filter_map(|d| weekday_from_index(*d)).collect();
    if out.is_empty() {
        out.push(start.weekday());
    }
    out
}

enum Step {
    Date(NaiveDate),
    Skip,
    Beyond,
}

/// Lazy, finite iterator over the dates of a [`RecurringPattern`].
#[derive(Debug, Clone)]
pub struct Occurrences {
    pattern: RecurringPattern,
    weekdays: Vec<Weekday>,
    week_anchor: NaiveDate,
    week_stride: i64,
    last_day: NaiveDate,
    step: i64,
    emitted: u32,
    finished: bool,
}

impl Occurrences {
    fn at_step(&self, step: i64) -> Step {
        let start = self.pattern.start_date;
        let interval = i64::from(self.pattern.interval.max(1));

        match &self.pattern.frequency {
            Frequency::Daily => self.bounded(start + Duration::days(step * interval)),
            Frequency::Weekly { .. } | Frequency::Biweekly { .. } => {
                let date = start + Duration::days(step);
                if date > self.last_day {
                    return Step::Beyond;
                }
                let week = (date - self.week_anchor).num_days() / 7;
                if week % self.week_stride == 0 && self.weekdays.contains(&date.weekday()) {
                    Step::Date(date)
                } else {
                    Step::Skip
                }
            }
            Frequency::Monthly { day_of_month } => {
                let Ok(months) = u32::try_from(step * interval) else {
                    return Step::Beyond;
                };
                let Some(first) = NaiveDate::from_ymd_opt(start.year(), start.month(), 1)
                    .and_then(|d| d.checked_add_months(Months::new(months)))
                else {
                    return Step::Beyond;
                };
                if first > self.last_day {
                    return Step::Beyond;
                }
                let day = day_of_month.unwrap_or_else(|| start.day());
                match first.with_day(day) {
                    // Months without that day (the 31st in April) are skipped.
                    None => Step::Skip,
                    Some(date) if date < start => Step::Skip,
                    Some(date) => self.bounded(date),
                }
            }
        }
    }

    fn bounded(&self, date: NaiveDate) -> Step {
        if date > self.last_day {
            Step::Beyond
        } else {
            Step::Date(date)
        }
    }
}

impl Iterator for Occurrences {
    type Item = NaiveDate;

    fn next(&mut self) -> Option<NaiveDate> {
        if self.finished {
            return None;
        }
        if self
            .pattern
            .max_occurrences
            .is_some_and(|max| self.emitted >= max)
        {
            self.finished = true;
            return None;
        }
        loop {
            let next = self.at_step(self.step);
            self.step += 1;
            match next {
                Step::Date(date) => {
                    self.emitted += 1;
                    return Some(date);
                }
                Step::Skip => continue,
                Step::Beyond => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }
}
