//! Docker driver — thin abstraction over the container engine.
//!
//! `client.rs` holds the core struct, constructor, and error
//! classification; domain methods live in sibling modules (`challenge`,
//! `logs`, `stats`) which add `impl DockerClient` blocks.

pub mod challenge;
pub mod client;
pub mod logs;
pub mod network;
pub mod stats;

pub use challenge::{ChallengeSpec, ContainerSnapshot};
pub use client::{DockerClient, DriverError};
pub use stats::ContainerUsage;
