use anyhow::{Context, Result};
use serde::Deserialize;
use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::Config;

pub const MAX_RETRIES: u32 = 3;
pub const INITIAL_BACKOFF_MS: u64 = 1000;

/// Number of consecutive failures before opening the circuit
pub const CIRCUIT_FAILURE_THRESHOLD: u32 = 3;

/// How long to keep the circuit open before trying again
pub const CIRCUIT_OPEN_DURATION: Duration = Duration::from_secs(300);

/// Maximum backoff duration (60 seconds)
pub const MAX_BACKOFF_MS: u64 = 60_000;

/// Pushover message body limit
pub const MAX_MESSAGE_LENGTH: usize = 1024;

/// Pushover title limit
pub const MAX_TITLE_LENGTH: usize = 250;

/// Per-request limit for one push attempt
pub const PUSH_TIMEOUT: Duration = Duration::from_secs(10);

pub const PUSHOVER_API_URL: &str = "https://api.pushover.net/1/messages.json";

/// Sound clips played on alarms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sound {
    Imsak,
    Adzan,
    Subuh,
}

impl Sound {
    pub fn file_name(&self) -> &'static str {
        match self {
            Sound::Imsak => "imsak.mp3",
            Sound::Adzan => "adzan.mp3",
            Sound::Subuh => "subuh.mp3",
        }
    }
}

/// Where alerts go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotifyMode {
    #[default]
    Log,
    Push,
    Both,
    Off,
}

impl NotifyMode {
    pub fn logs(&self) -> bool {
        matches!(self, NotifyMode::Log | NotifyMode::Both)
    }

    pub fn pushes(&self) -> bool {
        matches!(self, NotifyMode::Push | NotifyMode::Both)
    }
}

impl FromStr for NotifyMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "log" => Ok(NotifyMode::Log),
            "push" => Ok(NotifyMode::Push),
            "both" => Ok(NotifyMode::Both),
            "off" | "none" => Ok(NotifyMode::Off),
            other => Err(format!(
                "unknown notify mode '{}' (expected log, push, both or off)",
                other
            )),
        }
    }
}

/// Output side of the alarm engine.
///
/// Implementations must not fail the caller: delivery problems are logged
/// and swallowed.
pub trait AlertSink: Send + Sync {
    fn alert(&self, title: &str, message: &str) -> impl Future<Output = ()> + Send;

    fn play_sound(&self, sound: Sound) -> impl Future<Output = ()> + Send;
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CircuitState {
    /// Normal operation - requests allowed
    Closed,
    /// Failing - requests blocked
    Open,
    /// Testing if service recovered - limited requests
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    opened_at: Option<Instant>,
}

/// Circuit breaker for the push API
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    consecutive_failures: AtomicU32,
    open_duration: Duration,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::with_open_duration(CIRCUIT_OPEN_DURATION)
    }

    pub fn with_open_duration(open_duration: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                opened_at: None,
            }),
            consecutive_failures: AtomicU32::new(0),
            open_duration,
        }
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut BreakerInner) -> T) -> T {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Check if requests are allowed
    pub fn is_allowed(&self) -> bool {
        let open_duration = self.open_duration;
        self.with_inner(|inner| match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let expired = inner
                    .opened_at
                    .map(|at| at.elapsed() >= open_duration)
                    .unwrap_or(true);
                if expired {
                    inner.state = CircuitState::HalfOpen;
                }
                expired
            }
        })
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.with_inner(|inner| {
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
        });
    }

    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures < CIRCUIT_FAILURE_THRESHOLD {
            return;
        }
        self.with_inner(|inner| {
            if inner.state != CircuitState::Open {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                error!(
                    "Circuit breaker opened after {} consecutive failures",
                    failures
                );
            }
        });
    }

    pub fn state(&self) -> CircuitState {
        self.with_inner(|inner| inner.state)
    }

    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

/// Pushover reply: `status` is 1 on success
#[derive(Debug, Deserialize, PartialEq)]
pub struct PushoverResponse {
    pub status: i64,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Form body for a Pushover message (credentials stay out of the URL)
pub fn build_push_params(
    token: &str,
    user: &str,
    title: &str,
    message: &str,
) -> [(&'static str, String); 4] {
    [
        ("token", token.to_string()),
        ("user", user.to_string()),
        ("title", truncate_text(title, MAX_TITLE_LENGTH)),
        ("message", truncate_message(message)),
    ]
}

/// Truncate to `limit` bytes on a char boundary, preferring a word break,
/// with a "..." suffix
pub fn truncate_text(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    if limit <= 3 {
        return ".".repeat(limit);
    }

    let mut cut = limit - 3;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    if cut == 0 {
        return "...".to_string();
    }

    let head = &text[..cut];
    let head = head
        .rfind(' ')
        .filter(|&pos| pos > cut / 2)
        .map(|pos| &head[..pos])
        .unwrap_or(head);

    format!("{}...", head)
}

pub fn truncate_message(message: &str) -> String {
    truncate_text(message, MAX_MESSAGE_LENGTH)
}

/// Calculate backoff duration for a given attempt (0-indexed)
/// Attempt 0: no backoff, Attempt 1: 1s, Attempt 2: 2s, etc.
#[inline]
pub fn calculate_backoff(attempt: u32) -> Duration {
    if attempt == 0 {
        Duration::ZERO
    } else {
        let shift = (attempt - 1).min(30);
        let backoff_ms = INITIAL_BACKOFF_MS.saturating_mul(1u64 << shift);
        Duration::from_millis(backoff_ms.min(MAX_BACKOFF_MS))
    }
}

/// Push error classes for retry decisions
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PushErrorKind {
    Transient,
    Permanent,
}

#[derive(Debug, Clone)]
struct PushCredentials {
    token: String,
    user: String,
}

pub struct Notifier {
    client: reqwest::Client,
    mode: NotifyMode,
    push: Option<PushCredentials>,
    push_url: String,
    push_timeout: Duration,
    sound_player: Option<String>,
    sound_dir: PathBuf,
    circuit: CircuitBreaker,
}

impl Notifier {
    pub fn new(config: &Config) -> Self {
        let push = match (&config.pushover_user_key, &config.pushover_api_token) {
            (Some(user), Some(token)) => Some(PushCredentials {
                token: token.clone(),
                user: user.clone(),
            }),
            _ => None,
        };

        Self {
            client: reqwest::Client::new(),
            mode: config.notify_mode,
            push,
            push_url: PUSHOVER_API_URL.to_string(),
            push_timeout: PUSH_TIMEOUT,
            sound_player: config.sound_player.clone(),
            sound_dir: config.sound_dir.clone(),
            circuit: CircuitBreaker::new(),
        }
    }

    /// Point push delivery at another endpoint
    pub fn with_push_url(mut self, url: impl Into<String>) -> Self {
        self.push_url = url.into();
        self
    }

    pub fn with_push_timeout(mut self, timeout: Duration) -> Self {
        self.push_timeout = timeout;
        self
    }

    pub fn mode(&self) -> NotifyMode {
        self.mode
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit.state()
    }

    pub fn sound_path(&self, sound: Sound) -> PathBuf {
        self.sound_dir.join(sound.file_name())
    }

    /// Deliver one push notification with retries
    pub async fn send_push(&self, title: &str, message: &str) -> Result<()> {
        let Some(creds) = &self.push else {
            anyhow::bail!("Push credentials not configured");
        };

        if !self.circuit.is_allowed() {
            self.log_alert_fallback(title, message);
            anyhow::bail!("Circuit breaker open");
        }

        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let backoff = calculate_backoff(attempt);
                warn!("Push attempt {} failed, retrying in {:?}...", attempt, backoff);
                sleep(backoff).await;
            }

            match self.try_send_push(creds, title, message).await {
                Ok(()) => {
                    debug!("Push delivered");
                    self.circuit.record_success();
                    return Ok(());
                }
                Err(e) => {
                    if Self::classify_error(&e) == PushErrorKind::Permanent {
                        error!("Permanent push error, not retrying: {:#}", e);
                        self.circuit.record_failure();
                        return Err(e);
                    }
                    last_error = Some(e);
                }
            }
        }

        self.circuit.record_failure();
        let err = last_error.unwrap_or_else(|| anyhow::anyhow!("Push failed"));
        error!("Failed to push after {} attempts: {:#}", MAX_RETRIES, err);

        if self.circuit.state() == CircuitState::Open {
            self.log_alert_fallback(title, message);
        }

        Err(err)
    }

    fn classify_error(err: &anyhow::Error) -> PushErrorKind {
        let msg = format!("{:#}", err).to_lowercase();

        if msg.contains("is invalid")
            || msg.contains("not a valid")
            || msg.contains("cannot be blank")
            || msg.contains("http 400")
            || msg.contains("http 401")
            || msg.contains("http 403")
        {
            return PushErrorKind::Permanent;
        }

        PushErrorKind::Transient
    }

    fn log_alert_fallback(&self, title: &str, message: &str) {
        error!("ALERT FALLBACK (push unavailable): {}: {}", title, message);
    }

    async fn try_send_push(&self, creds: &PushCredentials, title: &str, message: &str) -> Result<()> {
        let params = build_push_params(&creds.token, &creds.user, title, message);

        let response = self
            .client
            .post(&self.push_url)
            .timeout(self.push_timeout)
            .form(&params)
            .send()
            .await
            .context("Failed to send push request")?;

        let http = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read push response")?;

        match serde_json::from_str::<PushoverResponse>(&body) {
            Ok(result) if result.status == 1 => Ok(()),
            Ok(result) => {
                let detail = if result.errors.is_empty() {
                    "Unknown error".to_string()
                } else {
                    result.errors.join("; ")
                };
                anyhow::bail!("Push API error (HTTP {}): {}", http.as_u16(), detail)
            }
            Err(_) if !http.is_success() => anyhow::bail!("Push API HTTP {}", http.as_u16()),
            Err(e) => Err(e).context("Failed to parse push response"),
        }
    }
}

impl AlertSink for Notifier {
    async fn alert(&self, title: &str, message: &str) {
        if self.mode.logs() {
            info!("🔔 {}: {}", title, message);
        } else {
            debug!("Alert ({:?}): {}: {}", self.mode, title, message);
        }

        if self.mode.pushes() {
            if let Err(e) = self.send_push(title, message).await {
                warn!("Push delivery failed: {:#}", e);
            }
        }
    }

    async fn play_sound(&self, sound: Sound) {
        let Some(player) = &self.sound_player else {
            debug!("No SOUND_PLAYER configured, skipping {}", sound.file_name());
            return;
        };

        let path = self.sound_path(sound);
        let spawned = tokio::process::Command::new(player)
            .arg(&path)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn();

        match spawned {
            Ok(mut child) => {
                debug!("Playing {} via {}", path.display(), player);
                // Reap without holding up the caller
                tokio::spawn(async move {
                    if let Err(e) = child.wait().await {
                        warn!("Sound player exited abnormally: {}", e);
                    }
                });
            }
            Err(e) => warn!("Failed to start sound player '{}': {}", player, e),
        }
    }
}



#[cfg(kani)]
mod kani_proofs {
    use super::*;

    #[kani::proof]
    fn backoff_calculation_never_overflows() {
        let attempt: u32 = kani::any();
        kani::assume(attempt < 32);
        let _ = calculate_backoff(attempt);
    }
}
