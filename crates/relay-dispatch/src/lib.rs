//! `relay-dispatch`: turns setup/execute requests into capability-tagged
//! task records and hands them to the routing layer.
//!
//! # Status mapping
//!
//! | Failure                              | Code                  |
//! |--------------------------------------|-----------------------|
//! | missing / malformed request          | `INVALID_ARGUMENT`    |
//! | no eligible agent, unknown infra     | `FAILED_PRECONDITION` |
//! | token I/O, store, anything unexpected | `INTERNAL`           |
//! | task status lookup                   | `UNIMPLEMENTED`       |

pub mod db;
pub mod dispatcher;
pub mod error;
pub mod infra;
pub mod routing;
pub mod token;
pub mod types;

pub use dispatcher::TaskDispatcher;
pub use error::{DispatchError, Result};
pub use infra::{InfraRegistry, SqliteInfraRegistry};
pub use routing::{AgentDirectory, OutboundTask, OutboxRouter, TaskRouter};
pub use token::{FileTokenSource, StaticTokenSource, TokenSource};
pub use types::{Capability, SetupOutcome, TaskRecord, TaskType};
