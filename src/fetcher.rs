//! Single-date schedule fetch with endpoint fallback and write-through cache

use anyhow::{Context, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, trace};

use crate::api::{self, Endpoint};
use crate::cache::ScheduleCache;
use crate::error::{AttemptError, ScheduleError};
use crate::model::{Location, ScheduleRecord};
use crate::time::{CalendarDate, TimeService};

/// Anything that can resolve one (location, date) pair to a schedule.
///
/// The synchronizer only depends on this, so tests can stand in a scripted
/// source for the HTTP fetcher.
pub trait ScheduleSource: Send + Sync + 'static {
    fn fetch_one(
        &self,
        location_id: &str,
        date: CalendarDate,
    ) -> impl Future<Output = Result<ScheduleRecord, ScheduleError>> + Send;
}

pub struct HttpScheduleFetcher {
    client: reqwest::Client,
    base_url: String,
    cache: ScheduleCache,
    time: TimeService,
}

impl HttpScheduleFetcher {
    pub fn new(
        base_url: impl Into<String>,
        request_timeout: Duration,
        cache: ScheduleCache,
        time: TimeService,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            cache,
            time,
        })
    }

    pub fn cache(&self) -> &ScheduleCache {
        &self.cache
    }

    async fn get_body(&self, url: &str) -> Result<String, AttemptError> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::CACHE_CONTROL, "no-store")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AttemptError::HttpStatus(status.as_u16()));
        }

        Ok(response.text().await?)
    }

    async fn try_endpoint(
        &self,
        endpoint: Endpoint,
        location_id: &str,
        date: CalendarDate,
    ) -> Result<ScheduleRecord, AttemptError> {
        let url = endpoint.url(&self.base_url, location_id, date);
        trace!("GET {}", url);
        let body = self.get_body(&url).await?;
        api::parse_schedule(&body, date)
    }

    /// Free-text city search
    pub async fn search_cities(&self, query: &str) -> Result<Vec<Location>> {
        let url = api::city_search_url(&self.base_url, query);
        let body = self
            .get_body(&url)
            .await
            .with_context(|| format!("City search for '{}' failed", query))?;
        api::parse_city_search(&body).context("Failed to parse city search response")
    }
}

impl ScheduleSource for HttpScheduleFetcher {
    async fn fetch_one(
        &self,
        location_id: &str,
        date: CalendarDate,
    ) -> Result<ScheduleRecord, ScheduleError> {
        if let Some(record) = self.cache.get(location_id, date) {
            trace!("Cache hit for {} on {}", location_id, date);
            return Ok(record);
        }

        let is_today = date == self.time.today();
        let mut last_error = AttemptError::EmptySchedule;

        for &endpoint in Endpoint::candidates(is_today) {
            match self.try_endpoint(endpoint, location_id, date).await {
                Ok(record) => {
                    self.cache.put(location_id, date, &record);
                    debug!("Fetched {} via {:?}", date, endpoint);
                    return Ok(record);
                }
                Err(e) => {
                    debug!("{:?} failed for {}: {}", endpoint, date, e);
                    last_error = e;
                }
            }
        }

        Err(ScheduleError::FetchFailed {
            date,
            source: last_error,
        })
    }
}
