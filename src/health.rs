//! Status HTTP endpoint
//!
//! `/health` reports calendar sync progress as JSON, `/ready` turns 200 once
//! today's schedule is loaded, `/metrics` is Prometheus text and `/mute`
//! silences alarm sounds for a while (`/unmute` lifts it).

use chrono::TimeDelta;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alarm::MuteSwitch;
use crate::sync::{SyncEnd, SyncOutcome, SyncProgress};
use crate::time::TimeService;

/// Timeout for reading HTTP request (prevents slow-loris attacks)
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusSnapshot {
    pub days_total: u64,
    pub days_ready: u64,
    pub sync_passes: u64,
    pub syncs_complete: u64,
    pub syncs_timed_out: u64,
    pub syncs_superseded: u64,
    pub alarms_fired: u64,
    /// Unix epoch seconds of the last finished sync, 0 if none yet
    pub last_sync_time: u64,
    pub today_loaded: bool,
}

/// Shared metrics updated by the sync task and the poll loop
#[derive(Debug, Default)]
pub struct StatusMetrics {
    days_total: AtomicU64,
    days_ready: AtomicU64,
    sync_passes: AtomicU64,
    syncs_complete: AtomicU64,
    syncs_timed_out: AtomicU64,
    syncs_superseded: AtomicU64,
    alarms_fired: AtomicU64,
    last_sync_time: AtomicU64,
    today_loaded: AtomicBool,
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl StatusMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_progress(&self, progress: &SyncProgress) {
        self.days_total.store(progress.total as u64, Ordering::Relaxed);
        self.days_ready.store(progress.completed as u64, Ordering::Relaxed);
    }

    pub fn record_sync(&self, outcome: &SyncOutcome) {
        self.days_total.store(outcome.total as u64, Ordering::Relaxed);
        self.days_ready.store(outcome.records.len() as u64, Ordering::Relaxed);
        self.sync_passes.fetch_add(u64::from(outcome.passes), Ordering::Relaxed);
        let counter = match outcome.end {
            SyncEnd::Complete => &self.syncs_complete,
            SyncEnd::TimedOut => &self.syncs_timed_out,
            SyncEnd::Superseded => &self.syncs_superseded,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.last_sync_time.store(unix_now(), Ordering::Relaxed);
    }

    pub fn record_alarms(&self, count: usize) {
        self.alarms_fired.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn set_today_loaded(&self, loaded: bool) {
        self.today_loaded.store(loaded, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            days_total: self.days_total.load(Ordering::Relaxed),
            days_ready: self.days_ready.load(Ordering::Relaxed),
            sync_passes: self.sync_passes.load(Ordering::Relaxed),
            syncs_complete: self.syncs_complete.load(Ordering::Relaxed),
            syncs_timed_out: self.syncs_timed_out.load(Ordering::Relaxed),
            syncs_superseded: self.syncs_superseded.load(Ordering::Relaxed),
            alarms_fired: self.alarms_fired.load(Ordering::Relaxed),
            last_sync_time: self.last_sync_time.load(Ordering::Relaxed),
            today_loaded: self.today_loaded.load(Ordering::Relaxed),
        }
    }
}

/// Everything a request handler may touch
#[derive(Clone)]
pub struct StatusContext {
    pub metrics: Arc<StatusMetrics>,
    pub mute: Arc<MuteSwitch>,
    pub mute_duration: TimeDelta,
    pub time: TimeService,
}

/// Run the status HTTP server on `port`
pub async fn run_status_server(port: u16, ctx: StatusContext, cancel_token: CancellationToken) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind status server on port {}: {}", port, e);
            return;
        }
    };

    info!("Status server listening on http://0.0.0.0:{}/health", port);
    serve(listener, ctx, cancel_token).await;
}

/// Accept loop on an already bound listener
pub async fn serve(listener: TcpListener, ctx: StatusContext, cancel_token: CancellationToken) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((mut socket, peer_addr)) => {
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_request(&mut socket, &ctx).await {
                                debug!("Error handling request from {}: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                    }
                }
            }
            _ = cancel_token.cancelled() => {
                info!("Status server shutting down");
                break;
            }
        }
    }
}

async fn handle_request(
    socket: &mut tokio::net::TcpStream,
    ctx: &StatusContext,
) -> std::io::Result<()> {
    let mut buf = [0u8; 1024];

    let n = match timeout(REQUEST_TIMEOUT, socket.read(&mut buf)).await {
        Ok(result) => result?,
        Err(_) => {
            debug!("Request timeout after {:?}", REQUEST_TIMEOUT);
            return Ok(());
        }
    };

    if n == 0 {
        return Ok(());
    }

    let request = String::from_utf8_lossy(&buf[..n]);

    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");

    let response = route(path, ctx);

    socket.write_all(response.as_bytes()).await?;
    socket.flush().await?;

    Ok(())
}

fn route(path: &str, ctx: &StatusContext) -> String {
    match path.trim_end_matches('/') {
        "/health" | "/healthz" => build_health_response(&ctx.metrics.snapshot()),
        "/ready" | "/readyz" => build_ready_response(ctx.metrics.snapshot().today_loaded),
        "/metrics" => build_metrics_response(&ctx.metrics.snapshot()),
        "/mute" => {
            let until = ctx.mute.mute_for(ctx.time.now(), ctx.mute_duration);
            let local = until.with_timezone(&ctx.time.timezone());
            info!("Sounds muted until {}", local.format("%H:%M:%S"));
            build_json_response(
                200,
                "OK",
                &format!(r#"{{"muted_until":"{}"}}"#, local.to_rfc3339()),
            )
        }
        "/unmute" => {
            ctx.mute.unmute();
            info!("Sounds unmuted");
            build_json_response(200, "OK", r#"{"muted_until":null}"#)
        }
        _ => build_not_found_response(),
    }
}

fn build_json_response(code: u16, reason: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        code,
        reason,
        body.len(),
        body
    )
}

fn build_health_response(status: &StatusSnapshot) -> String {
    let state = if status.days_total > 0 && status.days_ready == status.days_total {
        "ready"
    } else if status.syncs_timed_out > 0 && status.days_ready < status.days_total {
        "partial"
    } else {
        "loading"
    };
    let body = format!(
        r#"{{"status":"{}","days_ready":{},"days_total":{},"today_loaded":{},"last_sync_time":{}}}"#,
        state, status.days_ready, status.days_total, status.today_loaded, status.last_sync_time
    );
    build_json_response(200, "OK", &body)
}

fn build_ready_response(ready: bool) -> String {
    if ready {
        build_json_response(200, "OK", r#"{"ready":true}"#)
    } else {
        build_json_response(503, "Service Unavailable", r#"{"ready":false}"#)
    }
}

fn build_metrics_response(status: &StatusSnapshot) -> String {
    // Prometheus-compatible metrics format
    let body = format!(
        "# HELP imsakiyah_days_total Days in the loaded calendar range\n\
         # TYPE imsakiyah_days_total gauge\n\
         imsakiyah_days_total {}\n\
         # HELP imsakiyah_days_ready Days with a fetched schedule\n\
         # TYPE imsakiyah_days_ready gauge\n\
         imsakiyah_days_ready {}\n\
         # HELP imsakiyah_sync_passes_total Synchronizer passes run\n\
         # TYPE imsakiyah_sync_passes_total counter\n\
         imsakiyah_sync_passes_total {}\n\
         # HELP imsakiyah_syncs_total Finished calendar loads by outcome\n\
         # TYPE imsakiyah_syncs_total counter\n\
         imsakiyah_syncs_total{{outcome=\"complete\"}} {}\n\
         imsakiyah_syncs_total{{outcome=\"timed_out\"}} {}\n\
         imsakiyah_syncs_total{{outcome=\"superseded\"}} {}\n\
         # HELP imsakiyah_alarms_fired_total Alarms fired\n\
         # TYPE imsakiyah_alarms_fired_total counter\n\
         imsakiyah_alarms_fired_total {}\n\
         # HELP imsakiyah_today_loaded Whether today's schedule is loaded (1) or not (0)\n\
         # TYPE imsakiyah_today_loaded gauge\n\
         imsakiyah_today_loaded {}\n",
        status.days_total,
        status.days_ready,
        status.sync_passes,
        status.syncs_complete,
        status.syncs_timed_out,
        status.syncs_superseded,
        status.alarms_fired,
        if status.today_loaded { 1 } else { 0 }
    );

    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    )
}

fn build_not_found_response() -> String {
    build_json_response(404, "Not Found", r#"{"error":"Not Found"}"#)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PrayerTimes, ScheduleRecord};
    use crate::time::{build_dates, CalendarDate, FixedClock, DEFAULT_TIMEZONE};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    fn outcome(end: SyncEnd, ready: usize, total: usize, passes: u32) -> SyncOutcome {
        let start = CalendarDate::from_ymd(2026, 2, 18).unwrap();
        let records = build_dates(start, ready)
            .into_iter()
            .map(|date| {
                let record = ScheduleRecord {
                    date,
                    label: String::new(),
                    region: String::new(),
                    province: String::new(),
                    times: PrayerTimes::default(),
                };
                (date, record)
            })
            .collect::<BTreeMap<_, _>>();
        SyncOutcome {
            records,
            pending: Vec::new(),
            total,
            passes,
            end,
        }
    }

    fn context() -> StatusContext {
        let instant = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        StatusContext {
            metrics: Arc::new(StatusMetrics::new()),
            mute: Arc::new(MuteSwitch::new()),
            mute_duration: TimeDelta::minutes(5),
            time: TimeService::new(Arc::new(FixedClock::new(instant)), DEFAULT_TIMEZONE),
        }
    }

    #[test]
    fn test_metrics_default() {
        let snapshot = StatusMetrics::new().snapshot();
        assert_eq!(snapshot, StatusSnapshot::default());
        assert!(!snapshot.today_loaded);
    }

    #[test]
    fn test_record_progress_and_sync() {
        let metrics = StatusMetrics::new();
        metrics.record_progress(&SyncProgress {
            pass: 1,
            completed: 10,
            total: 30,
            remaining: 20,
        });
        assert_eq!(metrics.snapshot().days_ready, 10);

        metrics.record_sync(&outcome(SyncEnd::TimedOut, 27, 30, 5));
        metrics.record_sync(&outcome(SyncEnd::Complete, 30, 30, 2));

        let s = metrics.snapshot();
        assert_eq!(s.days_ready, 30);
        assert_eq!(s.sync_passes, 7);
        assert_eq!(s.syncs_complete, 1);
        assert_eq!(s.syncs_timed_out, 1);
        assert!(s.last_sync_time > 0);
    }

    #[test]
    fn test_health_response_states() {
        let mut s = StatusSnapshot {
            days_total: 30,
            days_ready: 12,
            ..StatusSnapshot::default()
        };
        assert!(build_health_response(&s).contains(r#""status":"loading""#));

        s.syncs_timed_out = 1;
        assert!(build_health_response(&s).contains(r#""status":"partial""#));

        s.days_ready = 30;
        let response = build_health_response(&s);
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains(r#""status":"ready""#));
        assert!(response.contains(r#""days_ready":30"#));
    }

    #[test]
    fn test_ready_follows_today_loaded() {
        let ctx = context();
        assert!(route("/ready", &ctx).starts_with("HTTP/1.1 503"));
        ctx.metrics.set_today_loaded(true);
        assert!(route("/ready", &ctx).starts_with("HTTP/1.1 200"));
        assert!(route("/readyz/", &ctx).starts_with("HTTP/1.1 200"));
    }

    #[test]
    fn test_metrics_response_prometheus_format() {
        let s = StatusSnapshot {
            days_total: 30,
            days_ready: 29,
            alarms_fired: 4,
            today_loaded: true,
            ..StatusSnapshot::default()
        };
        let response = build_metrics_response(&s);
        assert!(response.contains("Content-Type: text/plain"));
        assert!(response.contains("imsakiyah_days_ready 29"));
        assert!(response.contains("imsakiyah_alarms_fired_total 4"));
        assert!(response.contains("imsakiyah_today_loaded 1"));
        assert!(response.contains("imsakiyah_syncs_total{outcome=\"complete\"} 0"));
    }

    #[test]
    fn test_mute_and_unmute_routes() {
        let ctx = context();
        let now = ctx.time.now();

        let response = route("/mute", &ctx);
        assert!(response.starts_with("HTTP/1.1 200"));
        // 2026-03-01 00:05 UTC is 07:05 in Jakarta
        assert!(response.contains("2026-03-01T07:05:00+07:00"), "{}", response);
        assert!(ctx.mute.is_muted(now));

        route("/unmute", &ctx);
        assert!(!ctx.mute.is_muted(now));
    }

    #[test]
    fn test_not_found() {
        let response = route("/nope", &context());
        assert!(response.starts_with("HTTP/1.1 404"));
        assert!(response.contains("Not Found"));
    }

    #[tokio::test]
    async fn test_serve_answers_over_tcp() {
        let ctx = context();
        ctx.metrics.set_today_loaded(true);
        let cancel_token = CancellationToken::new();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(serve(listener, ctx, cancel_token.clone()));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /ready HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"), "{}", response);
        assert!(response.ends_with(r#"{"ready":true}"#));

        cancel_token.cancel();
        tokio::time::timeout(Duration::from_millis(500), handle)
            .await
            .expect("Server should shutdown within timeout")
            .expect("Server should complete without panic");
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn alarm_counter_accumulates(counts in proptest::collection::vec(0usize..10, 0..20)) {
            let metrics = StatusMetrics::new();
            for c in &counts {
                metrics.record_alarms(*c);
            }
            prop_assert_eq!(metrics.snapshot().alarms_fired, counts.iter().sum::<usize>() as u64);
        }

        #[test]
        fn health_response_content_length_matches(ready in 0u64..100, total in 0u64..100) {
            let s = StatusSnapshot { days_ready: ready, days_total: total, ..StatusSnapshot::default() };
            let response = build_health_response(&s);
            let (head, body) = response.split_once("\r\n\r\n").unwrap();
            let expected = format!("Content-Length: {}", body.len());
            prop_assert!(head.contains(&expected));
        }
    }
}
