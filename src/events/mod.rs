//! Hash-tag access events: bounded ingress, time-window aggregation and
//! micro-batched HTTP reporting.

mod event;
mod service;

pub use event::{AccessMode, EventError, HashTagEvent};
pub use service::EventService;
