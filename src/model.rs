//! Schedule data model
//!
//! A `ScheduleRecord` is one day of prayer times for one location. The six
//! prayer keys are fixed and ordered; every record carries all six, each
//! possibly empty.

use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::time::CalendarDate;

/// A location resolved by the city search (or configuration)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub province: String,
}

impl Location {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            province: String::new(),
        }
    }

    /// Name with the province in parentheses when known
    pub fn display_name(&self) -> String {
        if self.province.is_empty() {
            self.name.clone()
        } else {
            format!("{} ({})", self.name, self.province)
        }
    }
}

/// The six daily times, in display and event order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PrayerKey {
    Imsak,
    Subuh,
    Dzuhur,
    Ashar,
    Maghrib,
    Isya,
}

impl PrayerKey {
    pub const ALL: [PrayerKey; 6] = [
        PrayerKey::Imsak,
        PrayerKey::Subuh,
        PrayerKey::Dzuhur,
        PrayerKey::Ashar,
        PrayerKey::Maghrib,
        PrayerKey::Isya,
    ];

    /// Upstream/storage key
    pub fn key(&self) -> &'static str {
        match self {
            PrayerKey::Imsak => "imsak",
            PrayerKey::Subuh => "subuh",
            PrayerKey::Dzuhur => "dzuhur",
            PrayerKey::Ashar => "ashar",
            PrayerKey::Maghrib => "maghrib",
            PrayerKey::Isya => "isya",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PrayerKey::Imsak => "Imsak",
            PrayerKey::Subuh => "Subuh",
            PrayerKey::Dzuhur => "Dzuhur",
            PrayerKey::Ashar => "Ashar",
            PrayerKey::Maghrib => "Maghrib",
            PrayerKey::Isya => "Isya",
        }
    }
}

impl fmt::Display for PrayerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Minute-resolution time of day, rendered as `HH:MM`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClockTime(NaiveTime);

impl ClockTime {
    pub fn from_hm(hour: u32, minute: u32) -> Option<Self> {
        NaiveTime::from_hms_opt(hour, minute, 0).map(Self)
    }

    pub fn naive(&self) -> NaiveTime {
        self.0
    }

    /// Shift backwards by whole minutes, wrapping past midnight
    pub fn minus_minutes(&self, minutes: u32) -> Self {
        let (shifted, _) = self
            .0
            .overflowing_sub_signed(chrono::TimeDelta::minutes(i64::from(minutes)));
        Self(shifted)
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%H:%M"))
    }
}

impl FromStr for ClockTime {
    type Err = chrono::ParseError;

    /// Accepts `HH:MM` and `HH:MM:SS` (seconds are dropped)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        NaiveTime::parse_from_str(s, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
            .map(|t| Self(t.with_second(0).unwrap_or(t)))
    }
}

impl Serialize for ClockTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ClockTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// All six times for one day; `None` means not (yet) published
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrayerTimes {
    pub imsak: Option<ClockTime>,
    pub subuh: Option<ClockTime>,
    pub dzuhur: Option<ClockTime>,
    pub ashar: Option<ClockTime>,
    pub maghrib: Option<ClockTime>,
    pub isya: Option<ClockTime>,
}

impl PrayerTimes {
    pub fn get(&self, key: PrayerKey) -> Option<ClockTime> {
        match key {
            PrayerKey::Imsak => self.imsak,
            PrayerKey::Subuh => self.subuh,
            PrayerKey::Dzuhur => self.dzuhur,
            PrayerKey::Ashar => self.ashar,
            PrayerKey::Maghrib => self.maghrib,
            PrayerKey::Isya => self.isya,
        }
    }

    pub fn set(&mut self, key: PrayerKey, value: Option<ClockTime>) {
        let slot = match key {
            PrayerKey::Imsak => &mut self.imsak,
            PrayerKey::Subuh => &mut self.subuh,
            PrayerKey::Dzuhur => &mut self.dzuhur,
            PrayerKey::Ashar => &mut self.ashar,
            PrayerKey::Maghrib => &mut self.maghrib,
            PrayerKey::Isya => &mut self.isya,
        };
        *slot = value;
    }

    /// (key, time) pairs in canonical order
    pub fn iter(&self) -> impl Iterator<Item = (PrayerKey, Option<ClockTime>)> + '_ {
        PrayerKey::ALL.iter().map(move |&k| (k, self.get(k)))
    }

    /// Pre-dawn cutoff: imsak, falling back to subuh
    pub fn cutoff(&self) -> Option<ClockTime> {
        self.imsak.or(self.subuh)
    }

    pub fn sunset(&self) -> Option<ClockTime> {
        self.maghrib
    }
}

/// One day's schedule for one location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub date: CalendarDate,
    /// Human readable date as published upstream
    pub label: String,
    pub region: String,
    pub province: String,
    pub times: PrayerTimes,
}
