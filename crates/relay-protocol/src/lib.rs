//! `relay-protocol`: JSON RPC frames and task messages exchanged with callers.

pub mod frames;
pub mod messages;
pub mod methods;

pub use frames::{ErrorShape, InboundFrame, ReqFrame, ResFrame};
