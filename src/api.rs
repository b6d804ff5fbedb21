//! Upstream prayer schedule API: endpoint shapes and response normalization
//!
//! The service answers the same question through three addressing schemes
//! and is loose about response shapes. Everything here is pure so it can be
//! tested without a network.

use serde_json::{Map, Value};

use crate::error::AttemptError;
use crate::model::{ClockTime, Location, PrayerKey, PrayerTimes, ScheduleRecord};
use crate::time::CalendarDate;

pub const DEFAULT_API_BASE_URL: &str = "https://api.myquran.com/v3/sholat";

/// Request shapes, in the order they are tried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// `/jadwal/{id}/today`, only meaningful for the current civil date
    Today,
    /// `/jadwal/{id}/{YYYY-MM-DD}`
    ByIsoDate,
    /// `/jadwal/{id}/{YYYY}/{MM}/{DD}`
    ByYearMonthDay,
}

impl Endpoint {
    /// Candidates for `date`; the "today" shape leads only when `is_today`
    pub fn candidates(is_today: bool) -> &'static [Endpoint] {
        if is_today {
            &[Endpoint::Today, Endpoint::ByIsoDate, Endpoint::ByYearMonthDay]
        } else {
            &[Endpoint::ByIsoDate, Endpoint::ByYearMonthDay]
        }
    }

    pub fn url(&self, base_url: &str, location_id: &str, date: CalendarDate) -> String {
        let base = base_url.trim_end_matches('/');
        let id = urlencoding::encode(location_id);
        match self {
            Endpoint::Today => format!("{}/jadwal/{}/today", base, id),
            Endpoint::ByIsoDate => format!("{}/jadwal/{}/{}", base, id, date),
            Endpoint::ByYearMonthDay => format!(
                "{}/jadwal/{}/{:04}/{:02}/{:02}",
                base,
                id,
                date.year(),
                date.month(),
                date.day()
            ),
        }
    }
}

pub fn city_search_url(base_url: &str, query: &str) -> String {
    format!(
        "{}/kota/cari/{}",
        base_url.trim_end_matches('/'),
        urlencoding::encode(query)
    )
}

/// Application-level success flag. Booleans are taken as-is; numbers and
/// strings count as "ok" when non-zero / non-empty and not "false".
fn status_ok(envelope: &Value) -> bool {
    match envelope.get("status") {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
        Some(Value::String(s)) => !s.is_empty() && !s.eq_ignore_ascii_case("false"),
        _ => false,
    }
}

/// Case-insensitive field lookup: exact key, upper-case key, then any casing
fn field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    obj.get(key)
        .or_else(|| obj.get(&key.to_ascii_uppercase()))
        .or_else(|| {
            obj.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v)
        })
}

fn string_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match field(obj, key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn looks_like_day(obj: &Map<String, Value>) -> bool {
    PrayerKey::ALL.iter().any(|k| field(obj, k.key()).is_some())
}

/// Pick the per-day object for `date` out of the `jadwal` value.
///
/// Shapes, in order:
/// 1. object keyed by ISO date containing `date`
/// 2. a single day object (prayer keys directly inside)
/// 3. object holding exactly one day under a non-date key (a day keyed by a
///    different ISO date is rejected rather than relabelled)
/// 4. array of days: the one whose `date` field matches, else the only one
fn select_day<'a>(
    jadwal: &'a Value,
    date: CalendarDate,
) -> Result<&'a Map<String, Value>, AttemptError> {
    let iso = date.to_string();
    match jadwal {
        Value::Object(map) => {
            if let Some(Value::Object(day)) = map.get(&iso) {
                return Ok(day);
            }
            if looks_like_day(map) {
                return Ok(map);
            }
            let days: Vec<(&String, &Map<String, Value>)> = map
                .iter()
                .filter_map(|(k, v)| v.as_object().map(|d| (k, d)))
                .collect();
            match days.as_slice() {
                [] => Err(AttemptError::EmptySchedule),
                [(key, day)] => match key.parse::<CalendarDate>() {
                    Ok(other) if other != date => Err(AttemptError::DateMismatch(other)),
                    _ => Ok(*day),
                },
                many => Err(AttemptError::AmbiguousSchedule(many.len())),
            }
        }
        Value::Array(items) => {
            let days: Vec<&Map<String, Value>> =
                items.iter().filter_map(Value::as_object).collect();
            if let Some(day) = days
                .iter()
                .find(|d| string_field(d, &["date"]).as_deref() == Some(iso.as_str()))
            {
                return Ok(*day);
            }
            match days.len() {
                0 => Err(AttemptError::EmptySchedule),
                1 => Ok(days[0]),
                n => Err(AttemptError::AmbiguousSchedule(n)),
            }
        }
        _ => Err(AttemptError::EmptySchedule),
    }
}

/// Map an upstream day object onto the six canonical keys
pub fn normalize_times(day: &Map<String, Value>) -> PrayerTimes {
    let mut times = PrayerTimes::default();
    for key in PrayerKey::ALL {
        let value = field(day, key.key())
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<ClockTime>().ok());
        times.set(key, value);
    }
    times
}

/// Parse a schedule response body into the record for `date`
pub fn parse_schedule(body: &str, date: CalendarDate) -> Result<ScheduleRecord, AttemptError> {
    let envelope: Value = serde_json::from_str(body)?;
    if !status_ok(&envelope) {
        return Err(AttemptError::StatusFalse);
    }

    let data = envelope
        .get("data")
        .and_then(Value::as_object)
        .ok_or(AttemptError::EmptySchedule)?;
    let jadwal = field(data, "jadwal").ok_or(AttemptError::EmptySchedule)?;
    let day = select_day(jadwal, date)?;

    Ok(ScheduleRecord {
        date,
        label: string_field(day, &["tanggal"]).unwrap_or_else(|| date.to_string()),
        region: string_field(data, &["kabko", "lokasi"]).unwrap_or_default(),
        province: string_field(data, &["prov", "daerah"]).unwrap_or_default(),
        times: normalize_times(day),
    })
}

/// Parse a city search response into locations; entries without an id are skipped
pub fn parse_city_search(body: &str) -> Result<Vec<Location>, AttemptError> {
    let envelope: Value = serde_json::from_str(body)?;
    let Some(items) = envelope.get("data").and_then(Value::as_array) else {
        return Ok(Vec::new());
    };

    Ok(items
        .iter()
        .filter_map(Value::as_object)
        .filter_map(|item| {
            let id = string_field(item, &["id", "id_lokasi", "kode", "value"])?;
            let name = string_field(item, &["lokasi", "kabko", "nama", "label"])
                .unwrap_or_else(|| "Lokasi".to_string());
            let province = string_field(item, &["prov", "provinsi", "propinsi"]).unwrap_or_default();
            Some(Location { id, name, province })
        })
        .collect())
}
