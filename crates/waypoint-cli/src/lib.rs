//! Client library for the Waypoint control plane HTTP API.

pub mod client;
pub mod error;

pub use client::{HttpClient, TaskPage, TaskProgress};
pub use error::ClientError;
