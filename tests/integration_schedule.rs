use std::collections::BTreeSet;

use chrono::{Datelike, NaiveDate, NaiveTime, TimeZone, Utc};
use pretty_assertions::assert_eq;
use serde_json::json;

use bitcalm::schedule::{current, expand_root, parse_hhmm, Cadence, Schedule};

mod common;

fn at(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms(hour, minute, 0)
}

#[test]
fn daily_without_history_runs_today() {
    let s = Schedule::new(1, at(10, 0), Cadence::Daily { period: 3 });
    let today = NaiveDate::from_ymd(2021, 6, 1);
    assert_eq!(
        s.next_on(today),
        Utc.ymd(2021, 6, 1).and_hms(10, 0, 0)
    );
}

#[test]
fn daily_counts_from_the_previous_run() {
    let mut s = Schedule::new(1, at(10, 0), Cadence::Daily { period: 3 });
    s.prev_backup = Some(Utc.ymd(2021, 6, 1).and_hms(10, 0, 0));
    assert_eq!(
        s.next_on(NaiveDate::from_ymd(2021, 6, 2)),
        Utc.ymd(2021, 6, 4).and_hms(10, 0, 0)
    );
}

#[test]
fn weekly_picks_the_next_configured_day() {
    // Monday and Thursday
    let s = Schedule::new(1, at(10, 0), Cadence::Weekly { days: 0b0010010 });
    let tuesday = NaiveDate::from_ymd(2021, 6, 1);
    assert_eq!(tuesday.weekday().num_days_from_sunday(), 2);
    assert_eq!(
        s.next_on(tuesday),
        Utc.ymd(2021, 6, 3).and_hms(10, 0, 0) // the coming Thursday
    );
}

#[test]
fn weekly_wraps_to_the_next_week() {
    // Monday only
    let s = Schedule::new(1, at(9, 30), Cadence::Weekly { days: 0b0000010 });
    let tuesday = NaiveDate::from_ymd(2021, 6, 1);
    assert_eq!(
        s.next_on(tuesday),
        Utc.ymd(2021, 6, 7).and_hms(9, 30, 0)
    );
}

#[test]
fn weekly_skips_today_when_already_done() {
    // Tuesday and Friday
    let mut s = Schedule::new(1, at(10, 0), Cadence::Weekly { days: 0b0100100 });
    let tuesday = NaiveDate::from_ymd(2021, 6, 1);
    assert_eq!(
        s.next_on(tuesday),
        Utc.ymd(2021, 6, 1).and_hms(10, 0, 0)
    );
    s.prev_backup = Some(Utc.ymd(2021, 6, 1).and_hms(4, 0, 0));
    assert_eq!(
        s.next_on(tuesday),
        Utc.ymd(2021, 6, 4).and_hms(10, 0, 0)
    );
}

#[test]
fn weekly_next_day_law() {
    let days: u8 = 0b0010010; // Monday and Thursday
    let s = Schedule::new(1, at(0, 0), Cadence::Weekly { days });
    let base = NaiveDate::from_ymd(2021, 5, 30); // a Sunday
    for offset in 0..7 {
        let today = base + chrono::Duration::days(offset);
        let next = s.next_on(today).date().naive_utc();
        let gap = (next - today).num_days();
        assert!((0..=7).contains(&gap), "gap {} from {}", gap, today);
        let bit = 1u8 << next.weekday().num_days_from_sunday();
        assert_ne!(days & bit, 0, "{} is not a configured day", next);
    }
}

#[test]
fn monthly_clamps_to_month_length() {
    let s = Schedule::new(1, at(10, 0), Cadence::Monthly { day: 31 });
    assert_eq!(
        s.next_on(NaiveDate::from_ymd(2021, 4, 15)),
        Utc.ymd(2021, 4, 30).and_hms(10, 0, 0)
    );
}

#[test]
fn monthly_rolls_into_the_next_month() {
    let s = Schedule::new(1, at(10, 0), Cadence::Monthly { day: 5 });
    assert_eq!(
        s.next_on(NaiveDate::from_ymd(2021, 4, 15)),
        Utc.ymd(2021, 5, 5).and_hms(10, 0, 0)
    );
}

#[test]
fn monthly_carries_the_year() {
    let s = Schedule::new(1, at(10, 0), Cadence::Monthly { day: 5 });
    assert_eq!(
        s.next_on(NaiveDate::from_ymd(2021, 12, 15)),
        Utc.ymd(2022, 1, 5).and_hms(10, 0, 0)
    );
}

#[test]
fn root_expansion_drops_ignored_directories() {
    let mut files: BTreeSet<String> = BTreeSet::new();
    files.insert("/".to_string());
    assert!(files.remove("/"));
    expand_root(
        &mut files,
        ["etc", "home", "proc", "tmp", "var"]
            .iter()
            .map(|s| s.to_string()),
    );
    let expected: BTreeSet<String> = ["/etc", "/home", "/var"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    assert_eq!(files, expected);
}

#[test]
fn hhmm_parsing() {
    assert_eq!(parse_hhmm("0230"), Some(at(2, 30)));
    assert_eq!(parse_hhmm("2359"), Some(at(23, 59)));
    assert_eq!(parse_hhmm("2460"), None);
    assert_eq!(parse_hhmm("abc"), None);
}

#[test]
fn schedule_from_server_payload() {
    let weekly = Schedule::from_payload(&json!({
        "id": 5,
        "time": "0230",
        "days": 18,
        "files": ["/etc", "/home"],
        "db": {"localhost:3306": ["shop", "crm"]}
    }))
    .unwrap();
    assert_eq!(weekly.id, 5);
    assert_eq!(weekly.time, at(2, 30));
    assert_eq!(weekly.cadence, Cadence::Weekly { days: 18 });
    assert!(weekly.files.contains("/etc"));
    assert_eq!(
        weekly.databases.get("localhost:3306").unwrap(),
        &vec!["shop".to_string(), "crm".to_string()]
    );

    let daily = Schedule::from_payload(&json!({
        "id": 6, "time": "1200", "period": 2
    }))
    .unwrap();
    assert_eq!(daily.cadence, Cadence::Daily { period: 2 });

    let monthly = Schedule::from_payload(&json!({
        "id": 7, "time": "1200", "day": 28
    }))
    .unwrap();
    assert_eq!(monthly.cadence, Cadence::Monthly { day: 28 });

    assert!(Schedule::from_payload(&json!({"id": 8, "time": "1200"})).is_none());
}

#[test]
fn current_skips_excluded_schedules() {
    common::log_init("integration_schedule");
    let mut soon = Schedule::new(1, at(1, 0), Cadence::Daily { period: 1 });
    soon.next_backup = Some(Utc.ymd(2021, 6, 1).and_hms(1, 0, 0));
    let mut later = Schedule::new(2, at(2, 0), Cadence::Daily { period: 1 });
    later.next_backup = Some(Utc.ymd(2021, 6, 2).and_hms(2, 0, 0));

    let schedules = vec![soon.clone(), later.clone()];
    assert_eq!(current(&schedules).unwrap().id, 1);

    soon.exclude = true;
    let schedules = vec![soon, later];
    assert_eq!(current(&schedules).unwrap().id, 2);
}

#[test]
fn done_advances_the_cycle() {
    let mut s = Schedule::new(1, at(10, 0), Cadence::Daily { period: 1 });
    assert!(s.prev_backup.is_none());
    s.done();
    assert!(s.prev_backup.is_some());
    let next = s.next_backup.unwrap();
    assert!(next >= Utc::now().date().and_hms(10, 0, 0) - chrono::Duration::days(1));
}
