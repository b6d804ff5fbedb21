//! Bulk schedule synchronizer
//!
//! Fetches a range of dates in passes. Each pass runs a fixed number of
//! workers over the still-pending dates; failures stay pending for the next
//! pass after a fixed delay. The run ends when nothing is pending, when the
//! deadline passes, or when a newer load cancels it.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ScheduleError;
use crate::fetcher::ScheduleSource;
use crate::model::ScheduleRecord;
use crate::time::CalendarDate;

pub const DEFAULT_CONCURRENCY: usize = 4;

/// Fixed (not exponential) delay between passes
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(900);

/// Liveness guard against an unreachable upstream
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub concurrency: usize,
    pub retry_delay: Duration,
    pub deadline: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry_delay: DEFAULT_RETRY_DELAY,
            deadline: DEFAULT_DEADLINE,
        }
    }
}

/// Progress snapshot emitted before every pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncProgress {
    pub pass: u32,
    pub completed: usize,
    pub total: usize,
    pub remaining: usize,
}

impl SyncProgress {
    pub fn status_line(&self) -> String {
        format!(
            "Fetching schedule... {}/{} days ready, {} remaining",
            self.completed, self.total, self.remaining
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEnd {
    Complete,
    TimedOut,
    Superseded,
}

#[derive(Debug)]
pub struct SyncOutcome {
    pub records: BTreeMap<CalendarDate, ScheduleRecord>,
    pub pending: Vec<CalendarDate>,
    pub total: usize,
    pub passes: u32,
    pub end: SyncEnd,
}

impl SyncOutcome {
    pub fn is_complete(&self) -> bool {
        self.end == SyncEnd::Complete
    }

    /// `Err(SyncTimedOut)` when the deadline cut the run short
    pub fn check_timeout(&self) -> Result<(), ScheduleError> {
        if self.end == SyncEnd::TimedOut {
            return Err(ScheduleError::SyncTimedOut {
                completed: self.records.len(),
                total: self.total,
                pending: self.pending.len(),
            });
        }
        Ok(())
    }

    /// Aggregate line for the user; per-date failures are never shown
    pub fn status_line(&self) -> String {
        match self.end {
            SyncEnd::Complete => {
                format!("Schedule ready: {}/{} days", self.records.len(), self.total)
            }
            SyncEnd::TimedOut => format!(
                "Still loading ({}/{} days): the connection or API is unstable. Run the load again to retry.",
                self.records.len(),
                self.total
            ),
            SyncEnd::Superseded => format!(
                "Load replaced by a newer one ({}/{} days fetched)",
                self.records.len(),
                self.total
            ),
        }
    }
}

/// In-memory bookkeeping for one run
struct SyncState {
    pending: BTreeSet<CalendarDate>,
    results: BTreeMap<CalendarDate, ScheduleRecord>,
    started: Instant,
}

impl SyncState {
    fn new(dates: &[CalendarDate]) -> Self {
        Self {
            pending: dates.iter().copied().collect(),
            results: BTreeMap::new(),
            started: Instant::now(),
        }
    }

    fn commit(&mut self, date: CalendarDate, record: ScheduleRecord) {
        if self.pending.remove(&date) {
            self.results.insert(date, record);
        }
    }

    fn progress(&self, pass: u32, total: usize) -> SyncProgress {
        SyncProgress {
            pass,
            completed: self.results.len(),
            total,
            remaining: self.pending.len(),
        }
    }
}

/// Fetch every date in `dates`, retrying failures in later passes.
///
/// Returns whatever succeeded; the map may be a strict subset of `dates`
/// when the run times out or is cancelled.
pub async fn sync_range<S, P>(
    source: Arc<S>,
    location_id: &str,
    dates: &[CalendarDate],
    options: &SyncOptions,
    cancel: CancellationToken,
    mut on_progress: P,
) -> SyncOutcome
where
    S: ScheduleSource,
    P: FnMut(SyncProgress),
{
    let mut state = SyncState::new(dates);
    let total = state.pending.len();
    let deadline = state.started + options.deadline;
    let location_id: Arc<str> = Arc::from(location_id);
    let workers = options.concurrency.max(1);
    let mut passes = 0u32;
    let mut end = SyncEnd::Complete;

    while !state.pending.is_empty() {
        passes += 1;
        on_progress(state.progress(passes, total));

        let batch: Vec<CalendarDate> = state.pending.iter().copied().collect();
        let settled = run_pass(
            source.clone(),
            location_id.clone(),
            batch,
            workers,
            deadline,
            &cancel,
        )
        .await;

        let mut failed = 0usize;
        for (date, result) in settled {
            match result {
                Ok(record) => state.commit(date, record),
                Err(e) => {
                    failed += 1;
                    debug!("{}", e);
                }
            }
        }
        info!(
            "Pass {}: {}/{} days ready, {} failed this pass",
            passes,
            state.results.len(),
            total,
            failed
        );

        if state.pending.is_empty() {
            break;
        }
        if cancel.is_cancelled() {
            info!("Sync for {} superseded", location_id);
            end = SyncEnd::Superseded;
            break;
        }
        if Instant::now() >= deadline {
            warn!(
                "Sync deadline of {:?} reached with {} days pending",
                options.deadline,
                state.pending.len()
            );
            end = SyncEnd::TimedOut;
            break;
        }

        tokio::select! {
            _ = sleep(options.retry_delay) => {}
            _ = cancel.cancelled() => {
                end = SyncEnd::Superseded;
                break;
            }
        }
    }

    on_progress(state.progress(passes, total));

    SyncOutcome {
        records: state.results,
        pending: state.pending.into_iter().collect(),
        total,
        passes,
        end,
    }
}

type Settled = (CalendarDate, Result<ScheduleRecord, ScheduleError>);

/// One pass: `workers` tasks pull dates from a shared queue until it drains.
///
/// Returns every result that settled before the deadline or cancellation;
/// in-flight work is aborted at that point.
async fn run_pass<S: ScheduleSource>(
    source: Arc<S>,
    location_id: Arc<str>,
    batch: Vec<CalendarDate>,
    workers: usize,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Vec<Settled> {
    let queue = Arc::new(Mutex::new(VecDeque::from(batch)));
    let (tx, mut rx) = mpsc::unbounded_channel::<Settled>();
    let mut set = JoinSet::new();

    for _ in 0..workers {
        let queue = queue.clone();
        let source = source.clone();
        let location_id = location_id.clone();
        let tx = tx.clone();
        set.spawn(async move {
            loop {
                let next = match queue.lock() {
                    Ok(mut q) => q.pop_front(),
                    Err(_) => None,
                };
                let Some(date) = next else { break };
                let result = source.fetch_one(&location_id, date).await;
                if tx.send((date, result)).is_err() {
                    break;
                }
            }
        });
    }
    drop(tx);

    let mut settled = Vec::new();
    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(item) => settled.push(item),
                None => break,
            },
            _ = sleep_until(deadline) => {
                debug!("Deadline hit mid-pass, aborting in-flight fetches");
                set.abort_all();
                break;
            }
            _ = cancel.cancelled() => {
                set.abort_all();
                break;
            }
        }
    }

    // Anything that settled while we were aborting still counts
    while let Ok(item) = rx.try_recv() {
        settled.push(item);
    }
    while set.join_next().await.is_some() {}

    settled
}
