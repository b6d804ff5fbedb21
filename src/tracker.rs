//! Day-progress tracking
//!
//! Pure functions of the current civil time and today's (and tomorrow's)
//! schedule. Nothing is remembered between polls, so a reload or a missed
//! tick never leaves the tracker in a stale state.

use chrono::{NaiveDateTime, NaiveTime, TimeDelta};

use crate::model::{ClockTime, PrayerKey, ScheduleRecord};
use crate::time::{format_countdown, CalendarDate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoDataReason {
    /// No record for today at all
    Missing,
    /// Record present but cutoff or sunset is empty
    Incomplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    NoData(NoDataReason),
    BeforeCutoff,
    Fasting,
    /// After sunset. `tomorrow_known` is false until tomorrow's record loads.
    PostSunset { tomorrow_known: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayProgress {
    pub phase: Phase,
    /// 0..=100
    pub percent: u8,
    pub remaining: Option<TimeDelta>,
    pub cutoff: Option<ClockTime>,
    pub sunset: Option<ClockTime>,
}

impl DayProgress {
    fn empty(phase: Phase) -> Self {
        Self {
            phase,
            percent: 0,
            remaining: None,
            cutoff: None,
            sunset: None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self.phase {
            Phase::NoData(NoDataReason::Missing) => "Jadwal hari ini belum tersedia",
            Phase::NoData(NoDataReason::Incomplete) => "Data imsak/maghrib belum lengkap",
            Phase::BeforeCutoff => "Menuju imsak",
            Phase::Fasting => "Menuju berbuka",
            Phase::PostSunset { tomorrow_known: true } => "Menuju imsak (besok)",
            Phase::PostSunset {
                tomorrow_known: false,
            } => "Menunggu jadwal besok",
        }
    }

    /// e.g. `Menuju berbuka 50% (06:45:00)`
    pub fn summary(&self) -> String {
        format!(
            "{} {}% ({})",
            self.label(),
            self.percent,
            format_countdown(self.remaining)
        )
    }
}

fn clamp_percent(elapsed: TimeDelta, span: TimeDelta) -> u8 {
    if span <= TimeDelta::zero() {
        return 0;
    }
    let ratio = elapsed.num_seconds() as f64 / span.num_seconds() as f64;
    (ratio.clamp(0.0, 1.0) * 100.0).round() as u8
}

/// Compute the fasting-day phase at civil instant `now`.
///
/// `today` must be the record for `now`'s date; `tomorrow` is only consulted
/// after sunset.
pub fn day_progress(
    now: NaiveDateTime,
    today: Option<&ScheduleRecord>,
    tomorrow: Option<&ScheduleRecord>,
) -> DayProgress {
    let Some(record) = today else {
        return DayProgress::empty(Phase::NoData(NoDataReason::Missing));
    };
    let (Some(cutoff), Some(sunset)) = (record.times.cutoff(), record.times.sunset()) else {
        return DayProgress::empty(Phase::NoData(NoDataReason::Incomplete));
    };

    let date = now.date();
    let cutoff_at = date.and_time(cutoff.naive());
    let sunset_at = date.and_time(sunset.naive());

    let mut progress = DayProgress {
        phase: Phase::BeforeCutoff,
        percent: 0,
        remaining: None,
        cutoff: Some(cutoff),
        sunset: Some(sunset),
    };

    if now < cutoff_at {
        progress.remaining = Some(cutoff_at - now);
    } else if now < sunset_at {
        progress.phase = Phase::Fasting;
        progress.percent = clamp_percent(now - cutoff_at, sunset_at - cutoff_at);
        progress.remaining = Some(sunset_at - now);
    } else {
        match tomorrow.and_then(|r| r.times.cutoff()) {
            Some(next_cutoff) => {
                let next_cutoff_at = CalendarDate::new(date).add_days(1).at(next_cutoff.naive());
                progress.phase = Phase::PostSunset {
                    tomorrow_known: true,
                };
                progress.percent = clamp_percent(now - sunset_at, next_cutoff_at - sunset_at);
                progress.remaining = Some(next_cutoff_at - now);
            }
            None => {
                progress.phase = Phase::PostSunset {
                    tomorrow_known: false,
                };
            }
        }
    }

    progress
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextEvent {
    pub key: PrayerKey,
    pub at: ClockTime,
    pub remaining: TimeDelta,
}

/// Earliest of today's six times strictly after `now`
pub fn next_event(now: NaiveTime, record: Option<&ScheduleRecord>) -> Option<NextEvent> {
    let record = record?;
    record
        .times
        .iter()
        .filter_map(|(key, time)| time.map(|t| (key, t)))
        .filter(|(_, t)| t.naive() > now)
        .min_by_key(|(_, t)| *t)
        .map(|(key, at)| NextEvent {
            key,
            at,
            remaining: at.naive() - now,
        })
}
