//! Error taxonomy for schedule acquisition
//!
//! Nothing here is fatal: fetch failures are retried by the synchronizer,
//! a timeout becomes a "try again" prompt, and corrupt cache entries are
//! treated as misses.

use thiserror::Error;

use crate::time::CalendarDate;

/// Why a single endpoint attempt did not yield a record
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP {0}")]
    HttpStatus(u16),

    #[error("malformed response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("upstream reported status=false")]
    StatusFalse,

    #[error("response has no schedule for the requested date")]
    EmptySchedule,

    #[error("response holds the schedule for {0} instead")]
    DateMismatch(CalendarDate),

    #[error("response holds {0} days, none matching the requested date")]
    AmbiguousSchedule(usize),
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    /// Every endpoint candidate was exhausted for one date
    #[error("could not fetch schedule for {date}: {source}")]
    FetchFailed {
        date: CalendarDate,
        #[source]
        source: AttemptError,
    },

    /// The sync deadline passed with dates still pending
    #[error("sync timed out: {completed}/{total} days ready, {pending} still pending")]
    SyncTimedOut {
        completed: usize,
        total: usize,
        pending: usize,
    },

    /// A stored cache entry could not be parsed
    #[error("corrupt cache entry '{key}': {source}")]
    CacheCorrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_failed_message_includes_date_and_cause() {
        let err = ScheduleError::FetchFailed {
            date: "2026-03-01".parse().unwrap(),
            source: AttemptError::HttpStatus(502),
        };
        let msg = err.to_string();
        assert!(msg.contains("2026-03-01"), "{}", msg);
        assert!(msg.contains("HTTP 502"), "{}", msg);
    }

    #[test]
    fn test_sync_timed_out_message() {
        let err = ScheduleError::SyncTimedOut {
            completed: 27,
            total: 30,
            pending: 3,
        };
        assert_eq!(
            err.to_string(),
            "sync timed out: 27/30 days ready, 3 still pending"
        );
    }

    #[test]
    fn test_fetch_failed_exposes_source() {
        use std::error::Error as _;
        let err = ScheduleError::FetchFailed {
            date: "2026-03-01".parse().unwrap(),
            source: AttemptError::StatusFalse,
        };
        let source = err.source().expect("should have a source");
        assert_eq!(source.to_string(), "upstream reported status=false");
    }
}
