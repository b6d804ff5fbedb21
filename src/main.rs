use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use imsakiyah::alarm::{AlarmEngine, MuteSwitch};
use imsakiyah::cache::ScheduleCache;
use imsakiyah::cli::{parse_args, print_help};
use imsakiyah::config::Config;
use imsakiyah::fetcher::HttpScheduleFetcher;
use imsakiyah::health::{self, StatusContext, StatusMetrics};
use imsakiyah::notify::Notifier;
use imsakiyah::orchestrator::{
    apply_cli_overrides, render_summary, render_table, resolve_request, CalendarLoader, DayWatcher,
};
use imsakiyah::redact;
use imsakiyah::scheduler::{delay_to_next_second, format_duration, run_poll_loop};
use imsakiyah::store::{FileStore, KeyValueStore};
use imsakiyah::time::TimeService;

const DELIVERY_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();

    if args.help {
        print_help();
        return Ok(());
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("imsakiyah=info".parse()?),
        )
        .init();

    info!("Imsakiyah v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = Config::from_env()?;
    apply_cli_overrides(&mut config, &args)?;
    info!("Configuration loaded");
    info!("  API: {}", redact::url(&config.api_base_url));
    info!("  Timezone: {}", config.timezone);
    info!("  Store: {}", config.store_path.display());
    info!("  Notify mode: {:?}", config.notify_mode);
    if let Some(user) = &config.pushover_user_key {
        info!("  Pushover user: {}", redact::secret(user));
    }

    // Handle --validate mode
    if args.validate {
        info!("Validating configuration...");
        match config.validate() {
            Ok(()) => {
                info!("Configuration is valid");
                return Ok(());
            }
            Err(e) => {
                error!("{}", e);
                std::process::exit(1);
            }
        }
    }
    config.validate()?;

    let time = TimeService::system(config.timezone);
    let store: Arc<dyn KeyValueStore> = Arc::new(
        FileStore::open(&config.store_path)
            .with_context(|| format!("Failed to open store {}", config.store_path.display()))?,
    );
    let cache = ScheduleCache::new(store.clone());
    let fetcher = Arc::new(HttpScheduleFetcher::new(
        config.api_base_url.clone(),
        config.request_timeout(),
        cache.clone(),
        time.clone(),
    )?);

    // Handle --search mode
    if let Some(query) = &args.search {
        let cities = fetcher.search_cities(query).await?;
        if cities.is_empty() {
            println!("No locations match '{}'", query);
        }
        for city in &cities {
            println!("{}\t{}", city.id, city.display_name());
        }
        return Ok(());
    }

    let request = resolve_request(&config, store.as_ref(), time.today())?;
    info!("  Location: {} ({})", request.location.display_name(), request.location.id);
    info!("  Range: {}", request.range_label());

    let metrics = Arc::new(StatusMetrics::new());
    let loader = Arc::new(CalendarLoader::new(
        fetcher,
        store.clone(),
        config.sync_options(),
        metrics.clone(),
    ));

    let mute = Arc::new(MuteSwitch::new());
    let watcher = DayWatcher::new(
        request.location.id.clone(),
        cache,
        AlarmEngine::new(
            store,
            config.reminder_minutes,
            config.alarm_window_secs,
            time.zone_abbreviation(),
        ),
        Arc::new(Notifier::new(&config)),
        mute.clone(),
        metrics.clone(),
        time.clone(),
    );

    // Load once, print and exit (for testing)
    if args.once {
        info!("Loading calendar (--once mode)");
        let outcome = loader.load(&request).await;
        let report = watcher.observe();
        println!("{}\n", render_summary(&request, &report));
        println!("{}\n", outcome.status_line());
        print!("{}", render_table(&request.dates(), &outcome.records));
        return Ok(());
    }

    let shutdown = CancellationToken::new();

    // Start status server if configured
    if let Some(port) = config.status_port {
        let ctx = StatusContext {
            metrics: metrics.clone(),
            mute,
            mute_duration: chrono::TimeDelta::minutes(i64::from(config.mute_minutes)),
            time: time.clone(),
        };
        let cancel = shutdown.child_token();
        tokio::spawn(async move {
            health::run_status_server(port, ctx, cancel).await;
        });
    }

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                return;
            }
            info!("Shutdown signal received");
            shutdown.cancel();
        });
    }

    // Sync on its own task so the poll tick never waits on it
    let sync_task = {
        let loader = loader.clone();
        let request = request.clone();
        tokio::spawn(async move { loader.load(&request).await })
    };

    let started = std::time::Instant::now();
    let watcher = &watcher;
    let ticks = run_poll_loop(
        config.poll_interval(),
        delay_to_next_second(time.now()),
        shutdown.clone(),
        move || async move {
            watcher.tick().await;
        },
    )
    .await;

    loader.cancel_current();
    if let Err(e) = sync_task.await {
        error!("Sync task failed: {}", e);
    }

    // Give in-flight alerts a moment to go out
    let pending = watcher.pending_deliveries();
    if pending > 0 {
        info!("Waiting for {} alert deliveries", pending);
        if tokio::time::timeout(DELIVERY_GRACE, watcher.settle()).await.is_err() {
            warn!("Dropped {} alert deliveries at shutdown", watcher.pending_deliveries());
        }
    }

    info!(
        "Stopped after {} ticks ({})",
        ticks,
        format_duration(started.elapsed())
    );
    Ok(())
}
