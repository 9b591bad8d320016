//! Request handlers.

pub mod health;
pub mod jobs;
pub mod pulp_servers;
