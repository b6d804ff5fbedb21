//! Calendar load and poll-tick orchestration
//!
//! Ties the synchronizer, cache, tracker, alarm engine and alert sink
//! together. `CalendarLoader` runs on its own task; `DayWatcher::tick` runs
//! on the poll loop and only ever reads what the loader has committed.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::alarm::{Alarm, AlarmEngine, MuteSwitch};
use crate::cache::ScheduleCache;
use crate::cli::Args;
use crate::config::{Config, DEFAULT_CITY_NAME};
use crate::fetcher::ScheduleSource;
use crate::health::StatusMetrics;
use crate::model::{Location, PrayerKey, ScheduleRecord};
use crate::notify::AlertSink;
use crate::store::KeyValueStore;
use crate::sync::{sync_range, SyncOptions, SyncOutcome};
use crate::time::{
    build_dates, day_number, format_countdown, format_long_date, format_range_label, CalendarDate,
    CivilNow, TimeService,
};
use crate::tracker::{day_progress, next_event, DayProgress, NextEvent, Phase};

const LAST_CITY_ID: &str = "last_city_id";
const LAST_CITY_NAME: &str = "last_city_name";
const LAST_START: &str = "last_start";
const LAST_DAYS: &str = "last_days";

/// Location and date range of one calendar load
#[derive(Debug, Clone, PartialEq)]
pub struct CalendarRequest {
    pub location: Location,
    pub start: CalendarDate,
    pub days: usize,
}

impl CalendarRequest {
    pub fn dates(&self) -> Vec<CalendarDate> {
        build_dates(self.start, self.days)
    }

    pub fn range_label(&self) -> String {
        format_range_label(self.start, self.days)
    }
}

/// Fold command-line overrides into the loaded configuration
pub fn apply_cli_overrides(config: &mut Config, args: &Args) -> Result<()> {
    if let Some(city) = &args.city {
        if config.city_id.as_deref() != Some(city.as_str()) {
            // A name configured for another id would be wrong here
            config.city_name = None;
        }
        config.city_id = Some(city.clone());
    }
    if let Some(start) = &args.start {
        let start = start
            .parse::<CalendarDate>()
            .with_context(|| format!("--start '{}' must be a YYYY-MM-DD date", start))?;
        config.start_date = Some(start);
    }
    if let Some(days) = args.days {
        config.days_count = days;
    }
    Ok(())
}

/// Work out what to load.
///
/// A configured city wins, with the configured start (or today) and day
/// count. Without one, the last saved request is resumed as a whole.
pub fn resolve_request(
    config: &Config,
    store: &dyn KeyValueStore,
    today: CalendarDate,
) -> Result<CalendarRequest> {
    if let Some(id) = &config.city_id {
        let name = config
            .city_name
            .clone()
            .or_else(|| {
                // Reuse the saved name only when it belongs to this id
                (store.get(LAST_CITY_ID).as_deref() == Some(id.as_str()))
                    .then(|| store.get(LAST_CITY_NAME))
                    .flatten()
            })
            .unwrap_or_else(|| DEFAULT_CITY_NAME.to_string());

        return Ok(CalendarRequest {
            location: Location::new(id.clone(), name),
            start: config.start_date.unwrap_or(today),
            days: config.days_count,
        });
    }

    let Some(id) = store.get(LAST_CITY_ID).filter(|id| !id.is_empty()) else {
        bail!("No location configured: set CITY_ID or pass --city (find ids with --search)");
    };
    let name = store
        .get(LAST_CITY_NAME)
        .unwrap_or_else(|| DEFAULT_CITY_NAME.to_string());
    let start = config
        .start_date
        .or_else(|| store.get(LAST_START).and_then(|s| s.parse().ok()))
        .unwrap_or(today);
    let days = store
        .get(LAST_DAYS)
        .and_then(|s| s.parse().ok())
        .filter(|&d| d > 0)
        .unwrap_or(config.days_count);

    info!("Resuming last calendar for {}", name);
    Ok(CalendarRequest {
        location: Location::new(id, name),
        start,
        days,
    })
}

pub fn save_resume_state(store: &dyn KeyValueStore, request: &CalendarRequest) {
    store.set(LAST_CITY_ID, &request.location.id);
    store.set(LAST_CITY_NAME, &request.location.name);
    store.set(LAST_START, &request.start.to_string());
    store.set(LAST_DAYS, &request.days.to_string());
}

/// Runs calendar loads; starting a new one supersedes the one in flight
pub struct CalendarLoader<S: ScheduleSource> {
    source: Arc<S>,
    store: Arc<dyn KeyValueStore>,
    options: SyncOptions,
    metrics: Arc<StatusMetrics>,
    current: Mutex<Option<CancellationToken>>,
}

impl<S: ScheduleSource> CalendarLoader<S> {
    pub fn new(
        source: Arc<S>,
        store: Arc<dyn KeyValueStore>,
        options: SyncOptions,
        metrics: Arc<StatusMetrics>,
    ) -> Self {
        Self {
            source,
            store,
            options,
            metrics,
            current: Mutex::new(None),
        }
    }

    fn replace_current(&self, token: Option<CancellationToken>) -> Option<CancellationToken> {
        let mut guard = match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *guard, token)
    }

    /// Cancel the load in flight, if any
    pub fn cancel_current(&self) {
        if let Some(token) = self.replace_current(None) {
            token.cancel();
        }
    }

    /// Load `request`, returning whatever was fetched.
    ///
    /// A superseded run returns early with its partial results; fetches
    /// that already landed stay in the cache.
    pub async fn load(&self, request: &CalendarRequest) -> SyncOutcome {
        let token = CancellationToken::new();
        if let Some(previous) = self.replace_current(Some(token.clone())) {
            info!("Superseding previous calendar load");
            previous.cancel();
        }

        save_resume_state(self.store.as_ref(), request);
        info!(
            "Loading calendar for {}: {}",
            request.location.display_name(),
            request.range_label()
        );

        let metrics = self.metrics.clone();
        let outcome = sync_range(
            self.source.clone(),
            &request.location.id,
            &request.dates(),
            &self.options,
            token,
            |progress| {
                metrics.record_progress(&progress);
                debug!("{}", progress.status_line());
            },
        )
        .await;

        self.metrics.record_sync(&outcome);
        match outcome.check_timeout() {
            Ok(()) => info!("{}", outcome.status_line()),
            Err(e) => {
                warn!("{}", e);
                warn!("{}", outcome.status_line());
            }
        }
        outcome
    }
}

/// Result of one poll tick
#[derive(Debug)]
pub struct TickReport {
    pub now: CivilNow,
    pub progress: DayProgress,
    pub next: Option<NextEvent>,
    pub alarms: Vec<Alarm>,
}

/// Per-second view of today: tracker, alarms and alert delivery.
///
/// Deliveries run on their own tasks, so a slow sink never holds up a tick.
pub struct DayWatcher<A: AlertSink> {
    location_id: String,
    cache: ScheduleCache,
    engine: AlarmEngine,
    sink: Arc<A>,
    mute: Arc<MuteSwitch>,
    metrics: Arc<StatusMetrics>,
    time: TimeService,
    last_phase: Mutex<Option<Phase>>,
    deliveries: TaskTracker,
}

impl<A: AlertSink + 'static> DayWatcher<A> {
    pub fn new(
        location_id: impl Into<String>,
        cache: ScheduleCache,
        engine: AlarmEngine,
        sink: Arc<A>,
        mute: Arc<MuteSwitch>,
        metrics: Arc<StatusMetrics>,
        time: TimeService,
    ) -> Self {
        Self {
            location_id: location_id.into(),
            cache,
            engine,
            sink,
            mute,
            metrics,
            time,
            last_phase: Mutex::new(None),
            deliveries: TaskTracker::new(),
        }
    }

    fn note_phase(&self, progress: &DayProgress) {
        let mut guard = match self.last_phase.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *guard != Some(progress.phase) {
            info!("{}", progress.summary());
            *guard = Some(progress.phase);
        }
    }

    fn view(&self) -> (TickReport, Option<ScheduleRecord>) {
        let now = self.time.civil_now();
        let today = self.cache.get(&self.location_id, now.date);
        let tomorrow = self.cache.get(&self.location_id, now.date.add_days(1));

        let report = TickReport {
            now,
            progress: day_progress(now.datetime(), today.as_ref(), tomorrow.as_ref()),
            next: next_event(now.time, today.as_ref()),
            alarms: Vec::new(),
        };
        (report, today)
    }

    /// Tracker state right now, without touching alarms
    pub fn observe(&self) -> TickReport {
        self.view().0
    }

    /// One poll: recompute progress, fire due alarms and deliver them
    pub async fn tick(&self) -> TickReport {
        let (mut report, today) = self.view();
        self.metrics.set_today_loaded(today.is_some());
        self.note_phase(&report.progress);

        report.alarms = self.engine.poll(report.now, today.as_ref());
        if !report.alarms.is_empty() {
            self.metrics.record_alarms(report.alarms.len());
            let muted = self.mute.is_muted(self.time.now());
            for alarm in &report.alarms {
                self.deliver(alarm, muted);
            }
        }
        report
    }

    fn deliver(&self, alarm: &Alarm, muted: bool) {
        let sink = self.sink.clone();
        let title = alarm.title.clone();
        let message = alarm.message.clone();
        self.deliveries.spawn(async move {
            sink.alert(&title, &message).await;
        });

        if muted {
            debug!("Sound for {} muted", alarm.trigger.key());
        } else {
            let sink = self.sink.clone();
            let sound = alarm.sound;
            self.deliveries.spawn(async move {
                sink.play_sound(sound).await;
            });
        }
    }

    /// Wait for every delivery started so far
    pub async fn settle(&self) {
        self.deliveries.close();
        self.deliveries.wait().await;
        self.deliveries.reopen();
    }

    pub fn pending_deliveries(&self) -> usize {
        self.deliveries.len()
    }
}

/// Dates × six times; dates not loaded yet show a placeholder
pub fn render_table(dates: &[CalendarDate], records: &BTreeMap<CalendarDate, ScheduleRecord>) -> String {
    let mut out = format!("{:<12}", "Tanggal");
    for key in PrayerKey::ALL {
        let _ = write!(out, "{:>9}", key.label());
    }
    out.push('\n');

    for date in dates {
        let _ = write!(out, "{:<12}", date.to_string());
        match records.get(date) {
            Some(record) => {
                for (_, time) in record.times.iter() {
                    let cell = time.map(|t| t.to_string()).unwrap_or_else(|| "-".to_string());
                    let _ = write!(out, "{:>9}", cell);
                }
            }
            None => out.push_str("  Memuat…"),
        }
        out.push('\n');
    }
    out
}

/// Header block for `--once`: place, range, day number, progress, next event
pub fn render_summary(request: &CalendarRequest, report: &TickReport) -> String {
    let mut lines = vec![
        request.location.display_name(),
        request.range_label(),
    ];

    let today = report.now.date;
    let last = request.start.add_days(request.days.max(1) as i64 - 1);
    match day_number(request.start, today) {
        Some(n) if today <= last => lines.push(format!("Hari ke-{}", n)),
        _ => lines.push("Di luar rentang kalender".to_string()),
    }
    lines.push(format_long_date(today));
    lines.push(report.progress.summary());
    lines.push(match &report.next {
        Some(event) => format!(
            "Berikutnya: {} {} ({})",
            event.key.label(),
            event.at,
            format_countdown(Some(event.remaining))
        ),
        None => "Tidak ada jadwal tersisa hari ini".to_string(),
    });
    lines.join("\n")
}
