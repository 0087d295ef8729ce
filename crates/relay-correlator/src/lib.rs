//! `relay-correlator`: hands remote task results back to whoever waits for them.
//!
//! # Overview
//!
//! Agents report results into one of three SQLite tables. Pollers in every
//! gateway process pick them up and deliver them:
//!
//! | Table                     | Reader                  | Delivery                          |
//! |---------------------------|-------------------------|-----------------------------------|
//! | `sync_task_responses`     | [`SyncCorrelator`]      | wakes a blocked `wait_for_task`   |
//! | `async_task_responses`    | [`AsyncCorrelator`]     | `WaitNotifyEngine::done_with`     |
//! | `task_progress_responses` | [`ProgressCorrelator`]  | `WaitNotifyEngine::progress_on`   |
//!
//! `process_after` is both the earliest delivery time and the claim lock of
//! the async/progress pollers. [`ResponseStore::setup_timeout_for_task`]
//! pre-inserts a synthetic expired answer so every task ends with a terminal
//! record even when its agent never reports.
//!
//! A task result is written to both the sync and async tables, and the first
//! path to deliver it removes both copies.

pub mod async_delivery;
pub mod db;
pub mod drain;
pub mod error;
pub mod notify;
pub mod progress;
pub mod store;
pub mod sync_wait;
pub mod types;

pub use async_delivery::AsyncCorrelator;
pub use drain::{DrainReport, DrainSettings};
pub use error::{CorrelatorError, Result};
pub use notify::{Notification, NotificationKind, NotifyHub, WaitNotifyEngine};
pub use progress::ProgressCorrelator;
pub use store::ResponseStore;
pub use sync_wait::SyncCorrelator;
pub use types::{ErrorNotifyResponse, ResponseKind, ResponseRecord, TaskResponse};
