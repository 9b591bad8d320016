//! Pulp 3 HTTP client bindings.
//!
//! Everything the engine needs from Pulp's API surface: a session
//! authenticated client, the task pointer pattern (every mutating call
//! returns a task href that must be polled to a terminal state), cursor
//! pagination, and the resource types the reconciler and snapshotter
//! manipulate.

pub mod client;
pub mod resources;

pub use client::PulpClient;
pub use resources::{
    Distribution, Page, Publication, PulpTask, Remote, Repository, TaskState,
};
