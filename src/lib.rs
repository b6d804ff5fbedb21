//! Imsakiyah library - Ramadan prayer-time calendar and alarms
//!
//! This module exports internal components for integration testing.

pub mod alarm;
pub mod api;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod health;
pub mod model;
pub mod notify;
pub mod orchestrator;
pub mod redact;
pub mod scheduler;
pub mod store;
pub mod sync;
pub mod time;
pub mod tracker;
