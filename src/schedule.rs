use std::collections::{BTreeMap, BTreeSet};
use std::fs;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::filesystem::IGNORE_DIRS;

/// When a backup recurs. Exactly one cadence per schedule instance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Cadence {
    /// Every `period` days.
    Daily { period: u32 },
    /// Bitmask of weekdays, bit i is day i with Sunday = 0.
    Weekly { days: u8 },
    /// Fixed day of month, clamped to month length when >= 29.
    Monthly { day: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: i64,
    pub time: NaiveTime,
    pub cadence: Cadence,
    pub files: BTreeSet<String>,
    /// host:port -> database names
    pub databases: BTreeMap<String, Vec<String>>,
    pub prev_backup: Option<DateTime<Utc>>,
    pub next_backup: Option<DateTime<Utc>>,
    pub exclude: bool,
}

impl Schedule {
    pub fn new(id: i64, time: NaiveTime, cadence: Cadence) -> Schedule {
        let mut s = Schedule {
            id,
            time,
            cadence,
            files: BTreeSet::new(),
            databases: BTreeMap::new(),
            prev_backup: None,
            next_backup: None,
            exclude: false,
        };
        s.next_backup = Some(s.get_next());
        s
    }

    /// Builds a schedule from a server payload. The cadence key decides the
    /// variant; when several are present daily wins, then weekly, then monthly.
    pub fn from_payload(payload: &Value) -> Option<Schedule> {
        let id = payload.get("id")?.as_i64()?;
        let time = parse_hhmm(payload.get("time")?.as_str()?)?;
        let cadence = if let Some(p) = payload.get("period").and_then(Value::as_u64) {
            Cadence::Daily { period: p as u32 }
        } else if let Some(d) = payload.get("days").and_then(Value::as_u64) {
            Cadence::Weekly { days: d as u8 }
        } else if let Some(d) = payload.get("day").and_then(Value::as_u64) {
            Cadence::Monthly { day: d as u32 }
        } else {
            return None;
        };
        let mut s = Schedule::new(id, time, cadence);
        if let Some(files) = payload.get("files").and_then(Value::as_array) {
            s.files = files
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
            s.clean_files();
        }
        if let Some(db) = payload.get("db").and_then(Value::as_object) {
            for (host, names) in db {
                let names = names
                    .as_array()
                    .map(|a| {
                        a.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                s.databases.insert(host.clone(), names);
            }
        }
        s.next_backup = Some(s.get_next());
        Some(s)
    }

    /// Carries completion history over from a previous incarnation of the
    /// same schedule, then recomputes the next occurrence.
    pub fn inherit(&mut self, old: &Schedule) {
        self.prev_backup = old.prev_backup;
        self.exclude = old.exclude;
        self.next_backup = Some(self.get_next());
    }

    pub fn get_next(&self) -> DateTime<Utc> {
        self.next_on(Utc::now().date().naive_utc())
    }

    pub fn next_on(&self, today: NaiveDate) -> DateTime<Utc> {
        let date = match self.cadence {
            Cadence::Daily { period } => match self.prev_backup {
                None => today,
                Some(prev) => prev.date().naive_utc() + Duration::days(i64::from(period)),
            },
            Cadence::Weekly { days } => {
                let today_index = today.weekday().num_days_from_sunday() as i64;
                let configured: Vec<i64> =
                    (0..7i64).filter(|&i| days & (1u8 << i) != 0).collect();
                let mut curr_week: Vec<i64> = configured
                    .iter()
                    .cloned()
                    .filter(|d| *d >= today_index)
                    .collect();
                let done_today = self
                    .prev_backup
                    .map(|p| p.date().naive_utc() == today)
                    .unwrap_or(false);
                if done_today && !curr_week.is_empty() {
                    curr_week.remove(0);
                }
                let next_day = curr_week
                    .first()
                    .cloned()
                    .unwrap_or_else(|| configured.first().cloned().unwrap_or(0) + 7);
                today + Duration::days(next_day - today_index)
            }
            Cadence::Monthly { day } => {
                let (year, month) = if day >= today.day() {
                    (today.year(), today.month())
                } else if today.month() == 12 {
                    (today.year() + 1, 1)
                } else {
                    (today.year(), today.month() + 1)
                };
                let day = if day >= 29 {
                    day.min(days_in_month(year, month))
                } else {
                    day
                };
                NaiveDate::from_ymd(year, month, day)
            }
        };
        Utc.from_utc_datetime(&date.and_time(self.time))
    }

    pub fn done(&mut self) {
        self.prev_backup = Some(Utc::now());
        self.next_backup = Some(self.get_next());
    }

    /// Replaces the literal root path with its top-level children, minus
    /// pseudo-filesystems and bootstrap directories.
    pub fn clean_files(&mut self) {
        if !self.files.remove("/") {
            return;
        }
        let entries = fs::read_dir("/")
            .map(|rd| {
                rd.filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        expand_root(&mut self.files, entries.into_iter());
    }
}

pub fn expand_root(files: &mut BTreeSet<String>, entries: impl Iterator<Item = String>) {
    for item in entries {
        if !IGNORE_DIRS.contains(&item.as_str()) {
            files.insert(format!("/{}", item));
        }
    }
}

/// The schedule the next backup belongs to: soonest `next_backup` among
/// those not short-circuited by the resource breaker.
pub fn current<'a>(schedules: &'a [Schedule]) -> Option<&'a Schedule> {
    schedules
        .iter()
        .filter(|s| !s.exclude && s.next_backup.is_some())
        .min_by_key(|s| s.next_backup)
}

pub fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    if s.len() != 4 {
        return None;
    }
    let hour: u32 = s[..2].parse().ok()?;
    let minute: u32 = s[2..].parse().ok()?;
    NaiveTime::from_hms_opt(hour, minute, 0)
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (ny, nm) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd(ny, nm, 1).pred().day()
}
