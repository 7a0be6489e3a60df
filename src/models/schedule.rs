//! Schedule and worker models

use anyhow::{bail, Result};
use chrono::{Datelike, Duration, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// When a schedule fires
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Recurrence {
    /// Top of every hour
    Hourly,
    /// Every day at hour:minute
    Daily { hour: u32, minute: u32 },
    /// Every week on `weekday` (0 = Monday) at hour:minute
    Weekly { weekday: u32, hour: u32, minute: u32 },
    /// Every N minutes after the previous computation
    Interval { minutes: u32 },
}

impl Recurrence {
    pub fn validate(&self) -> Result<()> {
        match *self {
            Recurrence::Hourly => {}
            Recurrence::Daily { hour, minute } => check_time(hour, minute)?,
            Recurrence::Weekly {
                weekday,
                hour,
                minute,
            } => {
                if weekday > 6 {
                    bail!("Invalid weekday {weekday}. Valid range: 0-6 (0 = Monday)");
                }
                check_time(hour, minute)?;
            }
            Recurrence::Interval { minutes } => {
                if minutes == 0 {
                    bail!("Interval must be at least one minute");
                }
            }
        }
        Ok(())
    }

    /// Next occurrence strictly after `now`
    pub fn next_after(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        match *self {
            Recurrence::Hourly => {
                let top = now.date().and_hms_opt(now.hour(), 0, 0)?;
                Some(top + Duration::hours(1))
            }
            Recurrence::Interval { minutes } => Some(now + Duration::minutes(minutes as i64)),
            Recurrence::Daily { hour, minute } => {
                let today = now.date().and_hms_opt(hour, minute, 0)?;
                if today <= now {
                    Some(today + Duration::days(1))
                } else {
                    Some(today)
                }
            }
            Recurrence::Weekly {
                weekday,
                hour,
                minute,
            } => {
                let current = now.weekday().num_days_from_monday() as i64;
                let mut days_ahead = weekday as i64 - current;
                if days_ahead <= 0 {
                    days_ahead += 7;
                }
                let at = now.date().and_hms_opt(hour, minute, 0)?;
                Some(at + Duration::days(days_ahead))
            }
        }
    }
}

fn check_time(hour: u32, minute: u32) -> Result<()> {
    if hour > 23 || minute > 59 {
        bail!("Invalid time {hour:02}:{minute:02}");
    }
    Ok(())
}

impl fmt::Display for Recurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const DAYS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];
        match *self {
            Recurrence::Hourly => write!(f, "hourly"),
            Recurrence::Daily { hour, minute } => write!(f, "daily at {hour:02}:{minute:02}"),
            Recurrence::Weekly {
                weekday,
                hour,
                minute,
            } => write!(
                f,
                "weekly on {} at {hour:02}:{minute:02}",
                DAYS.get(weekday as usize).unwrap_or(&"?")
            ),
            Recurrence::Interval { minutes } => write!(f, "every {minutes}m"),
        }
    }
}

/// A recurring trigger of one pipeline target
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub name: String,

    /// Pipeline or task list to run
    pub target: String,

    pub recurrence: Recurrence,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Static mapping worker id -> task ids
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_assignment: Option<BTreeMap<String, Vec<String>>>,

    #[serde(default)]
    pub last_run: Option<NaiveDateTime>,

    #[serde(default)]
    pub next_run: Option<NaiveDateTime>,
}

fn default_enabled() -> bool {
    true
}

impl ScheduleConfig {
    pub fn new(name: impl Into<String>, target: impl Into<String>, recurrence: Recurrence) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            recurrence,
            enabled: true,
            worker_assignment: None,
            last_run: None,
            next_run: None,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_assignment(mut self, assignment: BTreeMap<String, Vec<String>>) -> Self {
        self.worker_assignment = Some(assignment);
        self
    }

    /// A schedule without `next_run` is due immediately
    pub fn is_due(&self, now: NaiveDateTime) -> bool {
        if !self.enabled {
            return false;
        }
        match self.next_run {
            Some(next) => now >= next,
            None => true,
        }
    }
}

/// Remote worker able to run a share of the pipeline
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,

    /// host:port
    pub address: String,

    /// Targets this worker accepts; empty accepts all
    #[serde(default)]
    pub capabilities: Vec<String>,

    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

fn default_max_parallel() -> usize {
    3
}

impl WorkerInfo {
    pub fn new(id: impl Into<String>, address: impl Into<String>, capabilities: Vec<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            capabilities,
            max_parallel: default_max_parallel(),
        }
    }

    pub fn accepts(&self, target: &str) -> bool {
        self.capabilities.is_empty() || self.capabilities.iter().any(|c| c == target)
    }
}
