//! Poll loop driving the tracker and the alarm engine
//! Ticks on a fixed interval aligned to whole wall-clock seconds

use chrono::{DateTime, Timelike, Utc};
use std::future::Future;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Delay from `now` until the start of the next whole second
pub fn delay_to_next_second(now: DateTime<Utc>) -> Duration {
    delay_to_next_second_at(now.nanosecond())
}

/// Testable version: delay given the sub-second nanoseconds of now
pub fn delay_to_next_second_at(nanos: u32) -> Duration {
    // Leap-second representation can exceed 1e9
    let nanos = nanos % 1_000_000_000;
    if nanos == 0 {
        Duration::ZERO
    } else {
        Duration::from_nanos(u64::from(1_000_000_000 - nanos))
    }
}

/// Format duration for logging
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;

    if hours > 0 {
        format!("{}h {}m", hours, mins)
    } else {
        format!("{}m", mins)
    }
}

/// Run `tick` every `period` until `cancel` fires.
///
/// Late ticks are skipped rather than bursted, so a stalled process does
/// not replay a backlog of seconds. Cancellation also interrupts a tick in
/// progress. Returns the number of ticks completed.
pub async fn run_poll_loop<F, Fut>(
    period: Duration,
    first_delay: Duration,
    cancel: CancellationToken,
    mut tick: F,
) -> u64
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let period = period.max(Duration::from_millis(10));
    info!("Poll loop started (every {:?})", period);

    let mut ticker = interval_at(Instant::now() + first_delay, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut count = 0u64;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                tokio::select! {
                    _ = tick() => count += 1,
                    _ = cancel.cancelled() => {
                        debug!("Poll loop interrupted mid-tick after {} ticks", count);
                        break;
                    }
                }
            }
            _ = cancel.cancelled() => {
                debug!("Poll loop stopping after {} ticks", count);
                break;
            }
        }
    }
    count
}
