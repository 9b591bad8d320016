//! Pulp Manager - fleet orchestrator for Pulp 3 content-repository servers.
//!
//! Schedules and drives repository syncs with bounded concurrency and
//! wall-clock deadlines, reconciles a git-hosted declarative repo catalog
//! against live Pulp state, and produces dated snapshot publications.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod fleet;
pub mod models;
pub mod pulp;
pub mod services;

pub use config::Config;
pub use error::{AppError, Result};
