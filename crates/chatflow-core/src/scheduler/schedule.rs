//! Schedule forms for time-based triggers

use chatflow_common::{Error, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// When a schedule trigger fires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Fire once at a fixed instant
    Once { fire_at: DateTime<Utc> },
    /// Fire repeatedly, `minutes` apart
    Every { minutes: i64 },
    /// Fire once a day at the given UTC time
    Daily { hour: u32, minute: u32 },
}

impl Schedule {
    /// Parse a schedule from stored trigger config
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        let schedule: Schedule = serde_json::from_value(value.clone())
            .map_err(|e| Error::Validation(format!("invalid schedule config: {}", e)))?;
        schedule.validate()?;
        Ok(schedule)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        match self {
            Schedule::Once { .. } => Ok(()),
            Schedule::Every { minutes } => {
                if *minutes < 1 {
                    return Err(Error::Validation(
                        "schedule interval must be at least one minute".to_string(),
                    ));
                }
                Ok(())
            }
            Schedule::Daily { hour, minute } => {
                if *hour > 23 || *minute > 59 {
                    return Err(Error::Validation(format!(
                        "invalid daily fire time {:02}:{:02}",
                        hour, minute
                    )));
                }
                Ok(())
            }
        }
    }

    /// Next fire time after `after`. None means the schedule is exhausted.
    ///
    /// An overdue `Once` still returns its instant so a restart fires it
    /// immediately instead of dropping it.
    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Once { fire_at } => Some(*fire_at),
            Schedule::Every { minutes } => Some(after + Duration::minutes(*minutes)),
            Schedule::Daily { hour, minute } => {
                let candidate = after
                    .date_naive()
                    .and_hms_opt(*hour, *minute, 0)
                    .map(|naive| Utc.from_utc_datetime(&naive))?;
                if candidate > after {
                    Some(candidate)
                } else {
                    Some(candidate + Duration::days(1))
                }
            }
        }
    }

    /// Whether the schedule fires at most once
    pub fn is_one_shot(&self) -> bool {
        matches!(self, Schedule::Once { .. })
    }
}
