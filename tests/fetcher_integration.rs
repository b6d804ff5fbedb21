/// Integration tests for schedule fetching and range sync
/// Uses a mock schedule API on a local TCP port

use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use imsakiyah::cache::ScheduleCache;
use imsakiyah::error::{AttemptError, ScheduleError};
use imsakiyah::fetcher::{HttpScheduleFetcher, ScheduleSource};
use imsakiyah::store::{FileStore, KeyValueStore, MemoryStore};
use imsakiyah::sync::{sync_range, SyncEnd, SyncOptions};
use imsakiyah::time::{build_dates, CalendarDate, FixedClock, TimeService};
use tokio_util::sync::CancellationToken;

type Handler = Arc<dyn Fn(&str) -> (u16, String) + Send + Sync>;

/// Mock schedule API that answers GETs through `handler` and records paths
struct MockApi {
    addr: SocketAddr,
    hits: Arc<Mutex<Vec<String>>>,
}

impl MockApi {
    async fn start(handler: Handler) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(Mutex::new(Vec::new()));

        let recorded = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let handler = handler.clone();
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        match stream.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        }
                    }
                    let request = String::from_utf8_lossy(&buf);
                    let path = request
                        .lines()
                        .next()
                        .and_then(|line| line.split_whitespace().nth(1))
                        .unwrap_or("/")
                        .to_string();
                    recorded.lock().unwrap().push(path.clone());

                    let (status, body) = handler(&path);
                    let response = format!(
                        "HTTP/1.1 {} Mock\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        Self { addr, hits }
    }

    fn base_url(&self) -> String {
        format!("http://{}/v3/sholat", self.addr)
    }

    fn hits(&self) -> Vec<String> {
        self.hits.lock().unwrap().clone()
    }
}

fn date(s: &str) -> CalendarDate {
    s.parse().unwrap()
}

/// Keyed-by-date response for `iso`
fn day_body(iso: &str) -> String {
    format!(
        r#"{{"status":true,"data":{{"kabko":"KOTA JAKARTA","prov":"DKI JAKARTA","jadwal":{{"{iso}":{{"tanggal":"{iso}","imsak":"04:29","subuh":"04:39","dzuhur":"12:04","ashar":"15:10","maghrib":"18:12","isya":"19:21"}}}}}}}}"#
    )
}

/// ISO date at the end of a `/jadwal/{id}/{YYYY-MM-DD}` path
fn iso_from_path(path: &str) -> Option<String> {
    let last = path.rsplit('/').next()?;
    last.parse::<CalendarDate>().ok().map(|d| d.to_string())
}

/// Time service pinned to 2026-03-01 10:00 WIB
fn time_service() -> TimeService {
    let tz = chrono_tz::Asia::Jakarta;
    let instant = tz
        .with_ymd_and_hms(2026, 3, 1, 10, 0, 0)
        .unwrap()
        .with_timezone(&Utc);
    TimeService::new(Arc::new(FixedClock::new(instant)), tz)
}

fn fetcher(api: &MockApi, store: Arc<dyn KeyValueStore>) -> HttpScheduleFetcher {
    HttpScheduleFetcher::new(
        api.base_url(),
        Duration::from_secs(5),
        ScheduleCache::new(store),
        time_service(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_today_falls_back_to_iso_endpoint_and_caches() {
    let api = MockApi::start(Arc::new(|path: &str| {
        if path.ends_with("/today") {
            (200, "{\"status\": true, \"data\": ".to_string())
        } else {
            match iso_from_path(path) {
                Some(iso) => (200, day_body(&iso)),
                None => (404, "{}".to_string()),
            }
        }
    }))
    .await;

    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let fetcher = fetcher(&api, store);

    let record = fetcher.fetch_one("1301", date("2026-03-01")).await.unwrap();
    assert_eq!(record.date, date("2026-03-01"));
    assert_eq!(record.region, "KOTA JAKARTA");
    assert_eq!(record.times.maghrib.unwrap().to_string(), "18:12");

    assert_eq!(
        api.hits(),
        vec![
            "/v3/sholat/jadwal/1301/today".to_string(),
            "/v3/sholat/jadwal/1301/2026-03-01".to_string(),
        ]
    );
    assert_eq!(fetcher.cache().get("1301", date("2026-03-01")), Some(record));
}

#[tokio::test]
async fn test_cache_hit_makes_no_request() {
    let api = MockApi::start(Arc::new(|path: &str| match iso_from_path(path) {
        Some(iso) => (200, day_body(&iso)),
        None => (404, "{}".to_string()),
    }))
    .await;

    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let fetcher = fetcher(&api, store);

    let first = fetcher.fetch_one("1301", date("2026-03-05")).await.unwrap();
    let hits_after_first = api.hits().len();
    let second = fetcher.fetch_one("1301", date("2026-03-05")).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(api.hits().len(), hits_after_first);
}

#[tokio::test]
async fn test_other_dates_skip_today_endpoint() {
    let api = MockApi::start(Arc::new(|path: &str| match iso_from_path(path) {
        Some(iso) => (200, day_body(&iso)),
        None => (404, "{}".to_string()),
    }))
    .await;

    let fetcher = fetcher(&api, Arc::new(MemoryStore::new()));
    fetcher.fetch_one("1301", date("2026-03-02")).await.unwrap();

    assert_eq!(api.hits(), vec!["/v3/sholat/jadwal/1301/2026-03-02".to_string()]);
}

#[tokio::test]
async fn test_year_month_day_endpoint_is_last_resort() {
    let api = MockApi::start(Arc::new(|path: &str| {
        if path.ends_with("/2026/03/02") {
            (200, day_body("2026-03-02"))
        } else {
            (200, "{\"status\": false, \"message\": \"not found\"}".to_string())
        }
    }))
    .await;

    let fetcher = fetcher(&api, Arc::new(MemoryStore::new()));
    let record = fetcher.fetch_one("1301", date("2026-03-02")).await.unwrap();

    assert_eq!(record.times.imsak.unwrap().to_string(), "04:29");
    assert_eq!(
        api.hits(),
        vec![
            "/v3/sholat/jadwal/1301/2026-03-02".to_string(),
            "/v3/sholat/jadwal/1301/2026/03/02".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_all_candidates_failing_reports_last_error() {
    let api = MockApi::start(Arc::new(|_path: &str| (502, "bad gateway".to_string()))).await;

    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let fetcher = fetcher(&api, store.clone());
    let err = fetcher.fetch_one("1301", date("2026-03-01")).await.unwrap_err();

    match err {
        ScheduleError::FetchFailed { date: d, source } => {
            assert_eq!(d, date("2026-03-01"));
            assert!(matches!(source, AttemptError::HttpStatus(502)));
        }
        other => panic!("unexpected error: {}", other),
    }
    // today, ISO and Y/M/D were all tried
    assert_eq!(api.hits().len(), 3);
    assert!(fetcher.cache().get("1301", date("2026-03-01")).is_none());
}

#[tokio::test]
async fn test_city_search() {
    let api = MockApi::start(Arc::new(|path: &str| {
        assert!(path.starts_with("/v3/sholat/kota/cari/"), "{}", path);
        (
            200,
            r#"{"status":true,"data":[
                {"id":"1219","lokasi":"KOTA BANDUNG","prov":"JAWA BARAT"},
                {"kode":"1220","nama":"KAB. BANDUNG BARAT"}
            ]}"#
                .to_string(),
        )
    }))
    .await;

    let fetcher = fetcher(&api, Arc::new(MemoryStore::new()));
    let cities = fetcher.search_cities("kota bandung").await.unwrap();

    assert_eq!(api.hits(), vec!["/v3/sholat/kota/cari/kota%20bandung".to_string()]);
    assert_eq!(cities.len(), 2);
    assert_eq!(cities[0].id, "1219");
    assert_eq!(cities[0].display_name(), "KOTA BANDUNG (JAWA BARAT)");
    assert_eq!(cities[1].id, "1220");
    assert_eq!(cities[1].name, "KAB. BANDUNG BARAT");
}

#[tokio::test]
async fn test_sync_range_retries_flaky_upstream() {
    // Every path fails the first time it is requested
    let seen: Arc<Mutex<HashMap<String, usize>>> = Arc::new(Mutex::new(HashMap::new()));
    let api = MockApi::start(Arc::new(move |path: &str| {
        let count = {
            let mut seen = seen.lock().unwrap();
            let count = seen.entry(path.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        if count == 1 {
            return (503, "busy".to_string());
        }
        match iso_from_path(path) {
            Some(iso) => (200, day_body(&iso)),
            None => (503, "busy".to_string()),
        }
    }))
    .await;

    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("store.json");
    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(&store_path).unwrap());
    let source = Arc::new(fetcher(&api, store));

    let dates = build_dates(date("2026-03-02"), 3);
    let options = SyncOptions {
        concurrency: 2,
        retry_delay: Duration::from_millis(50),
        deadline: Duration::from_secs(30),
    };
    let mut progress = Vec::new();
    let outcome = sync_range(
        source,
        "1301",
        &dates,
        &options,
        CancellationToken::new(),
        |p| progress.push(p.remaining),
    )
    .await;

    assert_eq!(outcome.end, SyncEnd::Complete);
    assert_eq!(outcome.passes, 2);
    assert_eq!(outcome.records.len(), 3);
    assert_eq!(progress, vec![3, 3, 0]);

    // Records survive a reopen of the store file
    let reopened: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(&store_path).unwrap());
    let cache = ScheduleCache::new(reopened);
    for d in dates {
        assert!(cache.get("1301", d).is_some(), "{} not cached", d);
    }
}
