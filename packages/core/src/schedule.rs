//! Cadences for periodic jobs.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};

use crate::config::duration_ms;
use crate::{ConfigError, QueueName};

/// When a periodic job fires.
///
/// `Every` slots are aligned to the Unix epoch, so two processes (or one
/// process restarted mid-slot) agree on which slot a firing belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Cadence {
    /// Fixed interval.
    Every {
        #[serde(with = "duration_ms")]
        interval: Duration,
    },
    /// Six-field cron expression (`sec min hour dom month dow`).
    Cron {
        expression: String,
        #[serde(skip)]
        schedule: Option<Box<CronSchedule>>,
    },
}

impl PartialEq for Cadence {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Cadence::Every { interval: a }, Cadence::Every { interval: b }) => a == b,
            (Cadence::Cron { expression: a, .. }, Cadence::Cron { expression: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl Cadence {
    pub fn every(interval: Duration) -> Self {
        Self::Every { interval }
    }

    pub fn cron(expression: &str) -> Result<Self, ConfigError> {
        let schedule = CronSchedule::from_str(expression).map_err(|e| ConfigError::Schedule {
            name: expression.to_string(),
            reason: format!("invalid cron expression: {e}"),
        })?;
        Ok(Self::Cron {
            expression: expression.to_string(),
            schedule: Some(Box::new(schedule)),
        })
    }

    /// First firing for a scheduler started at `now`.
    ///
    /// Interval cadences fire for the slot that is already open; the slot's
    /// idempotency key absorbs a firing that happened before a restart.
    pub fn first_fire(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Cadence::Every { .. } => self.slot_start(now),
            Cadence::Cron { .. } => self.next_after(now),
        }
    }

    /// The slot a firing that was due at `due` and runs at `now` belongs to.
    /// Missed interval slots collapse into the current one.
    pub fn slot_for(&self, due: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Cadence::Every { .. } => self.slot_start(now),
            Cadence::Cron { .. } => Some(due),
        }
    }

    /// Next firing strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Cadence::Every { interval } => {
                let step = chrono::Duration::from_std(*interval).ok()?;
                Some(self.slot_start(after)? + step)
            }
            Cadence::Cron {
                expression,
                schedule,
            } => match schedule {
                Some(schedule) => schedule.after(&after).next(),
                None => CronSchedule::from_str(expression).ok()?.after(&after).next(),
            },
        }
    }

    fn slot_start(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Cadence::Every { interval } => {
                let millis = i64::try_from(interval.as_millis()).ok()?.max(1);
                let start = at.timestamp_millis().div_euclid(millis) * millis;
                DateTime::from_timestamp_millis(start)
            }
            Cadence::Cron { .. } => Some(at),
        }
    }

    pub fn description(&self) -> String {
        match self {
            Cadence::Every { interval } => format!("every {}s", interval.as_secs()),
            Cadence::Cron { expression, .. } => format!("cron: {expression}"),
        }
    }
}

/// A periodic job definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Unique name; prefix of the firing's idempotency key.
    pub name: String,
    pub queue: QueueName,
    pub cadence: Cadence,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default = "default_schedule_attempts")]
    pub max_attempts: u32,
}

fn default_schedule_attempts() -> u32 {
    3
}

impl ScheduleConfig {
    pub fn new(name: impl Into<String>, queue: QueueName, cadence: Cadence) -> Self {
        Self {
            name: name.into(),
            queue,
            cadence,
            payload: serde_json::Value::Null,
            max_attempts: default_schedule_attempts(),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Idempotency key for the firing in `slot`.
    pub fn idempotency_key(&self, slot: DateTime<Utc>) -> String {
        format!("{}:{}", self.name, slot.timestamp())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::Schedule {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.name.is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.max_attempts == 0 {
            return Err(invalid("max_attempts must be at least 1"));
        }
        match &self.cadence {
            // Keys carry whole seconds, so slots must not share one.
            Cadence::Every { interval } if *interval < Duration::from_secs(1) => {
                Err(invalid("interval must be at least one second"))
            }
            Cadence::Every { .. } => Ok(()),
            Cadence::Cron { expression, .. } => CronSchedule::from_str(expression)
                .map(|_| ())
                .map_err(|e| invalid(&format!("invalid cron expression: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, h, m, s).unwrap()
    }

    #[test]
    fn interval_slots_align_to_the_epoch() {
        let cadence = Cadence::every(Duration::from_secs(300));
        assert_eq!(cadence.first_fire(at(10, 7, 42)), Some(at(10, 5, 0)));
        assert_eq!(cadence.next_after(at(10, 5, 0)), Some(at(10, 10, 0)));
        assert_eq!(cadence.next_after(at(10, 9, 59)), Some(at(10, 10, 0)));
    }

    #[test]
    fn missed_interval_slots_collapse_into_the_current_one() {
        let cadence = Cadence::every(Duration::from_secs(300));
        let slot = cadence.slot_for(at(10, 5, 0), at(10, 31, 0));
        assert_eq!(slot, Some(at(10, 30, 0)));
    }

    #[test]
    fn restart_inside_a_slot_produces_the_same_key() {
        let schedule = ScheduleConfig::new(
            "sla-metrics",
            QueueName::Metrics,
            Cadence::every(Duration::from_secs(300)),
        );
        let before = schedule.cadence.first_fire(at(10, 5, 1)).unwrap();
        let after_restart = schedule.cadence.first_fire(at(10, 9, 58)).unwrap();
        assert_eq!(
            schedule.idempotency_key(before),
            schedule.idempotency_key(after_restart)
        );
    }

    #[test]
    fn adjacent_one_second_slots_get_distinct_keys() {
        let schedule =
            ScheduleConfig::new("tick", QueueName::Metrics, Cadence::every(Duration::from_secs(1)));
        let first = schedule.cadence.first_fire(at(10, 0, 0)).unwrap();
        let second = schedule.cadence.next_after(first).unwrap();
        assert_ne!(schedule.idempotency_key(first), schedule.idempotency_key(second));
    }

    #[test]
    fn cron_cadence_uses_the_expression() {
        let cadence = Cadence::cron("0 0 * * * *").unwrap();
        assert_eq!(cadence.first_fire(at(10, 7, 42)), Some(at(11, 0, 0)));
        assert_eq!(cadence.slot_for(at(11, 0, 0), at(11, 0, 3)), Some(at(11, 0, 0)));
    }

    #[test]
    fn deserialized_cron_parses_lazily() {
        let cadence: Cadence =
            serde_json::from_str(r#"{"type":"cron","expression":"0 */15 * * * *"}"#).unwrap();
        assert_eq!(cadence.next_after(at(10, 7, 0)), Some(at(10, 15, 0)));
    }

    #[test]
    fn invalid_definitions_are_rejected() {
        assert!(Cadence::cron("not a cron").is_err());
        let zero = ScheduleConfig::new("zero", QueueName::Metrics, Cadence::every(Duration::ZERO));
        assert!(zero.validate().is_err());
        let sub_second =
            ScheduleConfig::new("fast", QueueName::Metrics, Cadence::every(Duration::from_millis(500)));
        assert!(sub_second.validate().is_err());
        let fine = ScheduleConfig::new("fine", QueueName::Metrics, Cadence::every(Duration::from_secs(1)));
        assert!(fine.validate().is_ok());
    }
}
