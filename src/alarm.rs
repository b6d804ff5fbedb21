//! Alarm engine: once-per-day triggers on prayer times
//!
//! Every poll compares the current second against each trigger's target
//! time. A trigger fires only inside its window, and only if its
//! `alarm_{trigger}_{date}` flag was not already set in the store. Polls
//! that miss the window skip the trigger for that day.

use chrono::{DateTime, NaiveTime, TimeDelta, Timelike, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::model::{ClockTime, PrayerKey, ScheduleRecord};
use crate::notify::Sound;
use crate::store::KeyValueStore;
use crate::time::{CalendarDate, CivilNow};

pub const DEFAULT_REMINDER_MINUTES: u32 = 30;
pub const DEFAULT_MUTE_MINUTES: u32 = 5;

const FLAG_PREFIX: &str = "alarm";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    /// Start of the fast
    Imsak,
    /// Wake-up reminder ahead of imsak
    SahurReminder,
    /// Call to prayer for one of the five daily prayers
    Adzan(PrayerKey),
}

impl Trigger {
    pub const ALL: [Trigger; 7] = [
        Trigger::Imsak,
        Trigger::SahurReminder,
        Trigger::Adzan(PrayerKey::Subuh),
        Trigger::Adzan(PrayerKey::Dzuhur),
        Trigger::Adzan(PrayerKey::Ashar),
        Trigger::Adzan(PrayerKey::Maghrib),
        Trigger::Adzan(PrayerKey::Isya),
    ];

    /// Stable key used in the fired-flag namespace
    pub fn key(&self) -> String {
        match self {
            Trigger::Imsak => "imsak".to_string(),
            Trigger::SahurReminder => "sahur".to_string(),
            Trigger::Adzan(prayer) => format!("adzan_{}", prayer.key()),
        }
    }

    pub fn sound(&self) -> Sound {
        match self {
            Trigger::Imsak | Trigger::SahurReminder => Sound::Imsak,
            Trigger::Adzan(PrayerKey::Subuh) => Sound::Subuh,
            Trigger::Adzan(_) => Sound::Adzan,
        }
    }
}

pub fn flag_key(trigger: Trigger, date: CalendarDate) -> String {
    format!("{}_{}_{}", FLAG_PREFIX, trigger.key(), date)
}

/// A trigger that fired; the caller turns it into a notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alarm {
    pub trigger: Trigger,
    pub date: CalendarDate,
    pub at: ClockTime,
    pub title: String,
    pub message: String,
    pub sound: Sound,
}

/// Temporary sound suppression
#[derive(Debug, Default)]
pub struct MuteSwitch {
    until_ms: AtomicI64,
}

impl MuteSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mute_for(&self, now: DateTime<Utc>, duration: TimeDelta) -> DateTime<Utc> {
        let until = now + duration;
        self.until_ms.store(until.timestamp_millis(), Ordering::SeqCst);
        until
    }

    pub fn unmute(&self) {
        self.until_ms.store(0, Ordering::SeqCst);
    }

    pub fn is_muted(&self, now: DateTime<Utc>) -> bool {
        now.timestamp_millis() < self.until_ms.load(Ordering::SeqCst)
    }

    pub fn muted_until(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.is_muted(now) {
            return None;
        }
        DateTime::from_timestamp_millis(self.until_ms.load(Ordering::SeqCst))
    }
}

pub struct AlarmEngine {
    store: Arc<dyn KeyValueStore>,
    reminder_minutes: u32,
    window_secs: u32,
    zone_label: String,
}

impl AlarmEngine {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        reminder_minutes: u32,
        window_secs: u32,
        zone_label: impl Into<String>,
    ) -> Self {
        Self {
            store,
            reminder_minutes,
            window_secs: window_secs.max(1),
            zone_label: zone_label.into(),
        }
    }

    /// Target time of day for `trigger`, if the record has the source time
    pub fn target(&self, trigger: Trigger, record: &ScheduleRecord) -> Option<ClockTime> {
        match trigger {
            Trigger::Imsak => record.times.imsak,
            Trigger::SahurReminder => record
                .times
                .imsak
                .map(|imsak| imsak.minus_minutes(self.reminder_minutes)),
            Trigger::Adzan(prayer) => record.times.get(prayer),
        }
    }

    fn in_window(&self, now: NaiveTime, target: ClockTime) -> bool {
        let now = now.num_seconds_from_midnight();
        let target = target.naive().num_seconds_from_midnight();
        now >= target && now < target + self.window_secs
    }

    fn describe(&self, trigger: Trigger, record: &ScheduleRecord, at: ClockTime) -> (String, String) {
        let zone = &self.zone_label;
        match trigger {
            Trigger::Imsak => (
                "Waktu Imsak".to_string(),
                format!("Sudah masuk waktu imsak ({} {}).", at, zone),
            ),
            Trigger::SahurReminder => {
                let imsak = record.times.imsak.unwrap_or(at);
                (
                    "Pengingat Sahur".to_string(),
                    format!("{} menit menuju imsak ({} {}).", self.reminder_minutes, imsak, zone),
                )
            }
            Trigger::Adzan(prayer) => (
                format!("Waktu {}", prayer.label()),
                format!("Sudah masuk waktu {} ({} {}).", prayer.label(), at, zone),
            ),
        }
    }

    /// Check every trigger against `now` and claim the ones that are due.
    ///
    /// `record` must be the schedule for `now.date`. Each returned alarm has
    /// already had its fired flag set, so a repeated poll at the same second
    /// returns nothing.
    pub fn poll(&self, now: CivilNow, record: Option<&ScheduleRecord>) -> Vec<Alarm> {
        let Some(record) = record else {
            return Vec::new();
        };
        if record.date != now.date {
            debug!("Alarm poll skipped: record is for {}, today is {}", record.date, now.date);
            return Vec::new();
        }

        let mut fired = Vec::new();
        for trigger in Trigger::ALL {
            let Some(at) = self.target(trigger, record) else {
                continue;
            };
            if !self.in_window(now.time, at) {
                continue;
            }
            if !self.store.set_if_absent(&flag_key(trigger, now.date), "1") {
                continue;
            }

            let (title, message) = self.describe(trigger, record, at);
            info!("Alarm {} fired for {} at {}", trigger.key(), now.date, at);
            fired.push(Alarm {
                trigger,
                date: now.date,
                at,
                title,
                message,
                sound: trigger.sound(),
            });
        }
        fired
    }
}
