//! `relay-core`: configuration, error codes and identifiers shared by every
//! relay crate.

pub mod config;
pub mod error;
pub mod types;

pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use types::{now_millis, InfraId, ProcessMode, SchedulingPolicy, TaskId};
