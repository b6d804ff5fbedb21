//! Civil time in a fixed timezone
//!
//! All calendar logic runs against one IANA timezone (Asia/Jakarta by default)
//! regardless of the host's local timezone. Date arithmetic is calendar based,
//! never elapsed-time based.

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

pub const DEFAULT_TIMEZONE: Tz = chrono_tz::Asia::Jakarta;

/// A civil date, canonically rendered as `YYYY-MM-DD`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CalendarDate(NaiveDate);

impl CalendarDate {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn from_ymd(year: i32, month: u32, day: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, day).map(Self)
    }

    pub fn naive(&self) -> NaiveDate {
        self.0
    }

    pub fn year(&self) -> i32 {
        self.0.year()
    }

    pub fn month(&self) -> u32 {
        self.0.month()
    }

    pub fn day(&self) -> u32 {
        self.0.day()
    }

    /// Add (or subtract) whole calendar days.
    ///
    /// Saturates at the representable range instead of failing.
    pub fn add_days(self, n: i64) -> Self {
        let shifted = if n >= 0 {
            self.0.checked_add_days(Days::new(n.unsigned_abs()))
        } else {
            self.0.checked_sub_days(Days::new(n.unsigned_abs()))
        };
        match shifted {
            Some(date) => Self(date),
            None if n >= 0 => Self(NaiveDate::MAX),
            None => Self(NaiveDate::MIN),
        }
    }

    /// Whole days from `self` to `other` (negative if `other` is earlier)
    pub fn days_until(&self, other: &CalendarDate) -> i64 {
        other.0.signed_duration_since(self.0).num_days()
    }

    /// `DD/MM/YYYY`
    pub fn short_label(&self) -> String {
        self.0.format("%d/%m/%Y").to_string()
    }

    /// Start of this date combined with a time of day
    pub fn at(&self, time: NaiveTime) -> NaiveDateTime {
        self.0.and_time(time)
    }
}

impl fmt::Display for CalendarDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

impl FromStr for CalendarDate {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map(Self)
    }
}

impl Serialize for CalendarDate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CalendarDate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Current civil date and second-resolution time of day
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CivilNow {
    pub date: CalendarDate,
    pub time: NaiveTime,
}

impl CivilNow {
    pub fn datetime(&self) -> NaiveDateTime {
        self.date.at(self.time)
    }
}

/// Source of the current instant
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and simulations
#[derive(Debug, Clone)]
pub struct FixedClock {
    instant: Arc<Mutex<DateTime<Utc>>>,
}

impl FixedClock {
    pub fn new(instant: DateTime<Utc>) -> Self {
        Self {
            instant: Arc::new(Mutex::new(instant)),
        }
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        if let Ok(mut guard) = self.instant.lock() {
            *guard = instant;
        }
    }

    pub fn advance(&self, delta: TimeDelta) {
        if let Ok(mut guard) = self.instant.lock() {
            *guard += delta;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        match self.instant.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Clock plus the fixed civil timezone
#[derive(Clone)]
pub struct TimeService {
    clock: Arc<dyn Clock>,
    tz: Tz,
}

impl TimeService {
    pub fn new(clock: Arc<dyn Clock>, tz: Tz) -> Self {
        Self { clock, tz }
    }

    pub fn system(tz: Tz) -> Self {
        Self::new(Arc::new(SystemClock), tz)
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn civil_now(&self) -> CivilNow {
        civil_at(self.clock.now(), self.tz)
    }

    pub fn today(&self) -> CalendarDate {
        self.civil_now().date
    }

    /// Zone abbreviation at the current instant, e.g. "WIB"
    pub fn zone_abbreviation(&self) -> String {
        self.now().with_timezone(&self.tz).format("%Z").to_string()
    }
}

/// Decompose an instant into the civil date/time of `tz`
pub fn civil_at(instant: DateTime<Utc>, tz: Tz) -> CivilNow {
    let local = instant.with_timezone(&tz).naive_local();
    let time = local.time().with_nanosecond(0).unwrap_or(local.time());
    CivilNow {
        date: CalendarDate(local.date()),
        time,
    }
}

/// `count` consecutive dates beginning at `start`
pub fn build_dates(start: CalendarDate, count: usize) -> Vec<CalendarDate> {
    (0..count as i64).map(|i| start.add_days(i)).collect()
}

/// Display label for `[start, start + count - 1]`
pub fn format_range_label(start: CalendarDate, count: usize) -> String {
    let count = count.max(1);
    let end = start.add_days(count as i64 - 1);
    format!("{} s.d. {} ({} hari)", start.short_label(), end.short_label(), count)
}

/// 1-based day number of `today` within a range starting at `start`
pub fn day_number(start: CalendarDate, today: CalendarDate) -> Option<i64> {
    if today < start {
        return None;
    }
    Some(start.days_until(&today) + 1)
}

const WEEKDAYS_ID: [&str; 7] = ["Senin", "Selasa", "Rabu", "Kamis", "Jumat", "Sabtu", "Minggu"];
const MONTHS_ID: [&str; 12] = [
    "Januari", "Februari", "Maret", "April", "Mei", "Juni", "Juli", "Agustus", "September",
    "Oktober", "November", "Desember",
];

/// Indonesian long date, e.g. "Kamis, 19 Februari 2026"
pub fn format_long_date(date: CalendarDate) -> String {
    let weekday = WEEKDAYS_ID[date.naive().weekday().num_days_from_monday() as usize];
    let month = MONTHS_ID[date.naive().month0() as usize];
    format!("{}, {:02} {} {}", weekday, date.day(), month, date.year())
}

/// Countdown as `HH:MM:SS`; unknown or negative spans render as `--:--:--`
pub fn format_countdown(remaining: Option<TimeDelta>) -> String {
    match remaining {
        Some(d) if d >= TimeDelta::zero() => {
            let secs = d.num_seconds();
            format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
        }
        _ => "--:--:--".to_string(),
    }
}



/// Kani formal verification proofs
#[cfg(kani)]
mod kani_proofs {
    use super::*;

    #[kani::proof]
    fn add_days_never_panics() {
        let n: i64 = kani::any();
        let start = CalendarDate::from_ymd(2026, 2, 18).unwrap();
        let _ = start.add_days(n);
    }
}
