use chrono::{DateTime, Datelike, Days, Duration, Months, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backup::BackupKind;
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl Frequency {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }
}

impl std::str::FromStr for Frequency {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            other => Err(format!("unknown frequency: {other}")),
        }
    }
}

/// Where a definition sits in its run cycle.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleState {
    Idle,
    Due,
    Running,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    pub id: Uuid,
    pub target_id: String,
    pub kind: BackupKind,
    pub frequency: Frequency,
    pub hour: u32,
    pub minute: u32,
    /// 0 = Monday.
    pub day_of_week: Option<u32>,
    pub day_of_month: Option<u32>,
    pub max_backups: u32,
    pub is_active: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Operator input for a new schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSchedule {
    pub target_id: String,
    pub kind: BackupKind,
    pub frequency: Frequency,
    #[serde(default)]
    pub hour: u32,
    #[serde(default)]
    pub minute: u32,
    #[serde(default)]
    pub day_of_week: Option<u32>,
    #[serde(default)]
    pub day_of_month: Option<u32>,
    #[serde(default = "default_max_backups")]
    pub max_backups: u32,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_max_backups() -> u32 {
    7
}

fn default_active() -> bool {
    true
}

impl NewSchedule {
    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |msg: String| Err(EngineError::InvalidSchedule(msg));
        if self.hour > 23 {
            return invalid(format!("hour must be 0-23, got {}", self.hour));
        }
        if self.minute > 59 {
            return invalid(format!("minute must be 0-59, got {}", self.minute));
        }
        if self.max_backups < 1 {
            return invalid("max_backups must be at least 1".to_owned());
        }
        match (self.frequency, self.day_of_week, self.day_of_month) {
            (Frequency::Weekly, None, _) => invalid("weekly schedules need day_of_week".to_owned()),
            (Frequency::Weekly, Some(d), _) if d > 6 => {
                invalid(format!("day_of_week must be 0-6, got {d}"))
            }
            (Frequency::Monthly, _, None) => {
                invalid("monthly schedules need day_of_month".to_owned())
            }
            (Frequency::Monthly, _, Some(d)) if !(1..=31).contains(&d) => {
                invalid(format!("day_of_month must be 1-31, got {d}"))
            }
            _ => Ok(()),
        }
    }

    /// Validates and materializes the definition; active definitions get their
    /// first `next_run` right away.
    pub fn into_definition(self, now: DateTime<Utc>) -> Result<ScheduleDefinition, EngineError> {
        self.validate()?;
        let mut def = ScheduleDefinition {
            id: Uuid::new_v4(),
            target_id: self.target_id,
            kind: self.kind,
            frequency: self.frequency,
            hour: self.hour,
            minute: self.minute,
            day_of_week: (self.frequency == Frequency::Weekly)
                .then_some(self.day_of_week)
                .flatten(),
            day_of_month: (self.frequency == Frequency::Monthly)
                .then_some(self.day_of_month)
                .flatten(),
            max_backups: self.max_backups,
            is_active: self.is_active,
            last_run: None,
            next_run: None,
            created_at: now,
        };
        if def.is_active {
            def.next_run = Some(def.next_run_after(now));
        }
        Ok(def)
    }
}

impl ScheduleDefinition {
    pub fn state(&self, now: DateTime<Utc>, running: bool) -> ScheduleState {
        if running {
            ScheduleState::Running
        } else if self.is_active && self.next_run.is_some_and(|next| now >= next) {
            ScheduleState::Due
        } else {
            ScheduleState::Idle
        }
    }

    /// The first run time strictly after `now`.
    pub fn next_run_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let time = NaiveTime::from_hms_opt(self.hour.min(23), self.minute.min(59), 0)
            .unwrap_or(NaiveTime::MIN);
        let today = now.date_naive();

        match self.frequency {
            Frequency::Hourly => {
                let this_hour = at(today, now.hour(), time.minute());
                if this_hour > now {
                    this_hour
                } else {
                    this_hour + Duration::hours(1)
                }
            }
            Frequency::Daily => {
                let candidate = at(today, time.hour(), time.minute());
                if candidate > now {
                    candidate
                } else {
                    candidate + Duration::days(1)
                }
            }
            Frequency::Weekly => {
                let target = self.day_of_week.unwrap_or(0).min(6);
                let current = now.weekday().num_days_from_monday();
                let ahead = (target + 7 - current) % 7;
                let candidate = at(today + Days::new(ahead.into()), time.hour(), time.minute());
                if candidate > now {
                    candidate
                } else {
                    candidate + Duration::weeks(1)
                }
            }
            Frequency::Monthly => {
                let day = self.day_of_month.unwrap_or(1).clamp(1, 31);
                let first = today.with_day(1).unwrap_or(today);
                let candidate = at(clamped_day(first, day), time.hour(), time.minute());
                if candidate > now {
                    candidate
                } else {
                    let next_month = first + Months::new(1);
                    at(clamped_day(next_month, day), time.hour(), time.minute())
                }
            }
        }
    }
}

fn at(date: NaiveDate, hour: u32, minute: u32) -> DateTime<Utc> {
    let time = NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN);
    Utc.from_utc_datetime(&date.and_time(time))
}

/// `day` within the month starting at `first`, clamped to the month's last day.
fn clamped_day(first: NaiveDate, day: u32) -> NaiveDate {
    let last = (first + Months::new(1))
        .pred_opt()
        .map(|d| d.day())
        .unwrap_or(28);
    first.with_day(day.min(last)).unwrap_or(first)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw)
            .expect("rfc3339")
            .with_timezone(&Utc)
    }

    fn schedule(frequency: Frequency, hour: u32, minute: u32) -> NewSchedule {
        NewSchedule {
            target_id: "main".into(),
            kind: BackupKind::Full,
            frequency,
            hour,
            minute,
            day_of_week: None,
            day_of_month: None,
            max_backups: 3,
            is_active: true,
        }
    }

    fn definition(new: NewSchedule) -> ScheduleDefinition {
        new.into_definition(utc("2026-01-01T00:00:00Z")).expect("valid")
    }

    #[test]
    fn monthly_day_31_clamps_to_last_day_of_30_day_month() {
        let mut new = schedule(Frequency::Monthly, 2, 15);
        new.day_of_month = Some(31);
        let def = definition(new);

        let next = def.next_run_after(utc("2026-04-10T08:00:00Z"));
        assert_eq!(next, utc("2026-04-30T02:15:00Z"));

        let after = def.next_run_after(utc("2026-04-30T03:00:00Z"));
        assert_eq!(after, utc("2026-05-31T02:15:00Z"));
    }

    #[test]
    fn monthly_clamps_february_in_leap_year() {
        let mut new = schedule(Frequency::Monthly, 0, 0);
        new.day_of_month = Some(30);
        let def = definition(new);
        assert_eq!(
            def.next_run_after(utc("2028-02-03T00:00:00Z")),
            utc("2028-02-29T00:00:00Z")
        );
    }

    #[test]
    fn next_run_is_strictly_after_now() {
        let mut weekly = schedule(Frequency::Weekly, 9, 30);
        weekly.day_of_week = Some(6);
        let mut monthly = schedule(Frequency::Monthly, 9, 30);
        monthly.day_of_month = Some(18);
        let defs = [
            definition(schedule(Frequency::Hourly, 0, 30)),
            definition(schedule(Frequency::Daily, 9, 30)),
            definition(weekly),
            definition(monthly),
        ];
        // 2026-10-18 is a Sunday; every definition is exactly due at this instant.
        let now = utc("2026-10-18T09:30:00Z");
        for def in &defs {
            let next = def.next_run_after(now);
            assert!(next > now, "{:?} returned {next}", def.frequency);
        }
    }

    #[test]
    fn weekly_rolls_to_requested_weekday() {
        let mut new = schedule(Frequency::Weekly, 9, 30);
        new.day_of_week = Some(0);
        let def = definition(new);
        assert_eq!(
            def.next_run_after(utc("2026-10-18T12:00:00Z")),
            utc("2026-10-19T09:30:00Z")
        );
    }

    #[test]
    fn hourly_uses_minute_within_current_hour() {
        let def = definition(schedule(Frequency::Hourly, 0, 45));
        assert_eq!(
            def.next_run_after(utc("2026-10-18T10:10:00Z")),
            utc("2026-10-18T10:45:00Z")
        );
        assert_eq!(
            def.next_run_after(utc("2026-10-18T10:50:00Z")),
            utc("2026-10-18T11:45:00Z")
        );
    }

    #[test]
    fn validation_rejects_missing_day_fields() {
        assert!(matches!(
            schedule(Frequency::Weekly, 1, 0).validate(),
            Err(EngineError::InvalidSchedule(_))
        ));
        let mut monthly = schedule(Frequency::Monthly, 1, 0);
        monthly.day_of_month = Some(32);
        assert!(monthly.validate().is_err());
        let mut zero = schedule(Frequency::Daily, 1, 0);
        zero.max_backups = 0;
        assert!(zero.validate().is_err());
        assert!(schedule(Frequency::Daily, 24, 0).validate().is_err());
    }

    #[test]
    fn state_reflects_due_and_running() {
        let def = definition(schedule(Frequency::Daily, 3, 0));
        let next = def.next_run.expect("active schedules get a next run");
        assert_eq!(def.state(next - Duration::seconds(1), false), ScheduleState::Idle);
        assert_eq!(def.state(next, false), ScheduleState::Due);
        assert_eq!(def.state(next, true), ScheduleState::Running);
    }
}
