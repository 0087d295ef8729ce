//! `relay-iterator`: distributed recurring-work claiming over a shared SQLite file.
//!
//! # Overview
//!
//! Every iterable row carries an iteration field holding its next due time.
//! A [`WorkClaimStore`] claims the earliest-due row with a compare-and-set
//! update that also writes the rescheduled value, so any number of processes
//! can poll the same table and each due occurrence is handed out once. A
//! [`PersistenceIterator`] drives the store on a timer and feeds claimed rows
//! to a [`Handler`] under a concurrency cap.
//!
//! # Scheduling policies
//!
//! | Policy                | Field type          | After a claim                         |
//! |-----------------------|---------------------|---------------------------------------|
//! | `Regular`             | INTEGER epoch ms    | `base + target_interval`              |
//! | `Irregular`           | TEXT JSON `[i64]`   | earliest tick removed                 |
//! | `IrregularSkipMissed` | TEXT JSON `[i64]`   | every tick `<= now + throttle` removed |
//!
//! # Process modes
//!
//! | Mode   | Behaviour                                                   |
//! |--------|-------------------------------------------------------------|
//! | `Pump` | each wake-up drains everything due, waiting for free slots  |
//! | `Loop` | each tick claims at most one entity, skipped when saturated |

pub mod db;
pub mod engine;
pub mod error;
pub mod handler;
pub mod policy;
pub mod registry;
pub mod store;
pub mod types;

pub use engine::PersistenceIterator;
pub use error::{IteratorError, Result};
pub use handler::{handler_fn, ChannelHandler, Handler, StagePipeline};
pub use registry::IteratorRegistry;
pub use store::WorkClaimStore;
pub use types::{
    BulkWriteResult, ClaimResult, Entity, EntityFilter, EntityId, IterationTarget,
    IterationValue, IteratorSpec, RecoveryReport,
};
