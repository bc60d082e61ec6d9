//! Weekly schedule window evaluation.
//!
//! A policy's schedule is evaluated in the schedule's own time zone.
//! Windows may wrap past midnight (`22:00-02:00`), and may additionally be
//! limited to specific months or days of month.

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use glacis_store::models::Schedule;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("unknown time zone: {0}")]
    UnknownTimeZone(String),
}

fn zone_of(schedule: &Schedule) -> Result<Tz, ScheduleError> {
    schedule
        .timezone
        .parse::<Tz>()
        .map_err(|_| ScheduleError::UnknownTimeZone(schedule.timezone.clone()))
}

fn window_bounds(schedule: &Schedule) -> (NaiveTime, NaiveTime) {
    let start = schedule.time_start.unwrap_or(NaiveTime::MIN);
    let end = schedule
        .time_end
        .unwrap_or_else(|| NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN));
    (start, end)
}

/// Whether `now` lies inside the schedule window.
pub fn in_window(schedule: &Schedule, now: DateTime<Utc>) -> Result<bool, ScheduleError> {
    let tz = zone_of(schedule)?;
    let local = now.with_timezone(&tz);

    if !schedule.weekdays.is_empty() {
        let weekday = local.weekday().num_days_from_monday() as u8;
        if !schedule.weekdays.contains(&weekday) {
            return Ok(false);
        }
    }

    if !schedule.months.is_empty() && !schedule.months.contains(&local.month()) {
        return Ok(false);
    }

    if !schedule.days_of_month.is_empty() && !schedule.days_of_month.contains(&local.day()) {
        return Ok(false);
    }

    let (start, end) = window_bounds(schedule);
    let t = local.time();
    let inside = if start <= end {
        start <= t && t <= end
    } else {
        // Wraps past midnight: 22:00-02:00.
        t >= start || t <= end
    };
    Ok(inside)
}

/// When the window that contains `now` closes, in UTC. `None` if `now` is
/// outside the window.
pub fn window_end(schedule: &Schedule, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    if !in_window(schedule, now)? {
        return Ok(None);
    }

    let tz = zone_of(schedule)?;
    let local = now.with_timezone(&tz);
    let (start, end) = window_bounds(schedule);

    // For a wrapped window we are either in the late-evening half (window
    // closes tomorrow at `end`) or the early-morning half (closes today).
    let end_date = if start > end && local.time() >= start {
        local.date_naive() + Duration::days(1)
    } else {
        local.date_naive()
    };

    let naive_end = end_date.and_time(end);
    let local_end = match tz.from_local_datetime(&naive_end) {
        chrono::LocalResult::Single(dt) => dt,
        chrono::LocalResult::Ambiguous(dt, _) => dt,
        // The wall-clock end falls into a DST gap; nudge past it.
        chrono::LocalResult::None => {
            match tz.from_local_datetime(&(naive_end + Duration::hours(1))) {
                chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => dt,
                chrono::LocalResult::None => return Ok(None),
            }
        }
    };

    Ok(Some(local_end.with_timezone(&Utc)))
}

/// Millisecond-truncated helper used when formatting banner windows.
pub fn format_minutes_left(deadline: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (deadline - now).num_minutes().max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn business_hours() -> Schedule {
        Schedule {
            weekdays: vec![0, 1, 2, 3, 4],
            time_start: NaiveTime::from_hms_opt(8, 0, 0),
            time_end: NaiveTime::from_hms_opt(16, 0, 0),
            months: vec![],
            days_of_month: vec![],
            timezone: "Europe/Warsaw".to_string(),
        }
    }

    fn at(iso: &str) -> DateTime<Utc> {
        iso.parse().expect("test timestamp")
    }

    #[test]
    fn test_monday_morning_inside() {
        // 2026-01-05 is a Monday; 09:00 UTC is 10:00 Warsaw.
        assert!(in_window(&business_hours(), at("2026-01-05T09:00:00Z")).unwrap());
    }

    #[test]
    fn test_monday_evening_outside() {
        // 17:00 UTC is 18:00 Warsaw.
        assert!(!in_window(&business_hours(), at("2026-01-05T17:00:00Z")).unwrap());
    }

    #[test]
    fn test_saturday_outside() {
        assert!(!in_window(&business_hours(), at("2026-01-10T09:00:00Z")).unwrap());
    }

    #[test]
    fn test_window_end_same_day() {
        // Window ends 16:00 Warsaw = 15:00 UTC in January.
        let end = window_end(&business_hours(), at("2026-01-05T09:00:00Z"))
            .unwrap()
            .expect("inside window");
        assert_eq!(end, at("2026-01-05T15:00:00Z"));
    }

    #[test]
    fn test_window_end_outside_is_none() {
        assert!(window_end(&business_hours(), at("2026-01-10T09:00:00Z"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_overnight_window() {
        let schedule = Schedule {
            weekdays: vec![],
            time_start: NaiveTime::from_hms_opt(22, 0, 0),
            time_end: NaiveTime::from_hms_opt(2, 0, 0),
            months: vec![],
            days_of_month: vec![],
            timezone: "UTC".to_string(),
        };
        assert!(in_window(&schedule, at("2026-01-05T23:30:00Z")).unwrap());
        assert!(in_window(&schedule, at("2026-01-06T01:00:00Z")).unwrap());
        assert!(!in_window(&schedule, at("2026-01-06T12:00:00Z")).unwrap());

        // Late half closes tomorrow at 02:00.
        let end = window_end(&schedule, at("2026-01-05T23:30:00Z")).unwrap().unwrap();
        assert_eq!(end, at("2026-01-06T02:00:00Z"));
        // Early half closes the same day.
        let end = window_end(&schedule, at("2026-01-06T01:00:00Z")).unwrap().unwrap();
        assert_eq!(end, at("2026-01-06T02:00:00Z"));
    }

    #[test]
    fn test_month_filter() {
        let mut schedule = business_hours();
        schedule.months = vec![5];
        assert!(!in_window(&schedule, at("2026-01-05T09:00:00Z")).unwrap());
        // 2026-05-04 is a Monday; 09:00 UTC is 11:00 Warsaw (DST).
        assert!(in_window(&schedule, at("2026-05-04T09:00:00Z")).unwrap());
    }

    #[test]
    fn test_day_of_month_filter() {
        let mut schedule = business_hours();
        schedule.days_of_month = vec![5];
        assert!(in_window(&schedule, at("2026-01-05T09:00:00Z")).unwrap());
        assert!(!in_window(&schedule, at("2026-01-06T09:00:00Z")).unwrap());
    }

    #[test]
    fn test_unknown_timezone_is_error() {
        let mut schedule = business_hours();
        schedule.timezone = "Mars/Olympus".to_string();
        assert!(in_window(&schedule, Utc::now()).is_err());
    }

    #[test]
    fn test_no_time_bounds_all_day() {
        let schedule = Schedule {
            weekdays: vec![],
            time_start: None,
            time_end: None,
            months: vec![],
            days_of_month: vec![],
            timezone: "UTC".to_string(),
        };
        assert!(in_window(&schedule, at("2026-01-05T00:00:00Z")).unwrap());
        assert!(in_window(&schedule, at("2026-01-05T23:59:00Z")).unwrap());
    }

    #[test]
    fn test_format_minutes_left() {
        let now = at("2026-01-05T09:00:00Z");
        assert_eq!(format_minutes_left(at("2026-01-05T09:05:00Z"), now), 5);
        assert_eq!(format_minutes_left(at("2026-01-05T08:00:00Z"), now), 0);
    }
}
