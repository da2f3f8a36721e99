use chrono::{Datelike, Duration, NaiveDate};
use dx_value::Value;

/// Accepted date shapes: ISO dates, the common datetime prefixes, and the
/// slash form. Anything else is an invalid date and degrades to null at the
/// call sites.
const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%Y/%m/%d"];
const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"];

pub fn parse_date(value: &Value) -> Option<NaiveDate> {
    let Value::Utf8(text) = value else {
        return None;
    };
    let trimmed = text.trim();
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return Some(date);
        }
    }
    for format in DATETIME_FORMATS {
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(dt.date());
        }
    }
    None
}

/// `a - b` in whole days.
pub fn diff_days(a: NaiveDate, b: NaiveDate) -> i64 {
    (a - b).num_days()
}

/// `a - b` in complete months: the raw month delta, pulled one toward zero
/// when the day-of-month has not been reached yet.
pub fn diff_months(a: NaiveDate, b: NaiveDate) -> i64 {
    let raw = (i64::from(a.year()) * 12 + i64::from(a.month0()))
        - (i64::from(b.year()) * 12 + i64::from(b.month0()));
    if raw > 0 && a.day() < b.day() {
        raw - 1
    } else if raw < 0 && a.day() > b.day() {
        raw + 1
    } else {
        raw
    }
}

/// `a - b` in complete years (age semantics).
pub fn diff_years(a: NaiveDate, b: NaiveDate) -> i64 {
    let raw = i64::from(a.year()) - i64::from(b.year());
    let a_md = (a.month(), a.day());
    let b_md = (b.month(), b.day());
    if raw > 0 && a_md < b_md {
        raw - 1
    } else if raw < 0 && a_md > b_md {
        raw + 1
    } else {
        raw
    }
}

pub fn part(date: NaiveDate, name: &str) -> Option<f64> {
    let out = match name {
        "year" => f64::from(date.year()),
        "month" => f64::from(date.month()),
        "day" => f64::from(date.day()),
        // 0 = Sunday .. 6 = Saturday
        "weekday" => f64::from(date.weekday().num_days_from_sunday()),
        "quarter" => f64::from((date.month() - 1) / 3 + 1),
        _ => return None,
    };
    Some(out)
}

/// Floor to the start of the unit. "week" floors to the most recent Sunday,
/// crossing month/year boundaries as needed.
pub fn floor(date: NaiveDate, unit: &str) -> Option<NaiveDate> {
    match unit {
        "day" => Some(date),
        "week" => {
            let back = i64::from(date.weekday().num_days_from_sunday());
            Some(date - Duration::days(back))
        }
        "month" => date.with_day(1),
        "year" => NaiveDate::from_ymd_opt(date.year(), 1, 1),
        _ => None,
    }
}

pub fn render(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}
