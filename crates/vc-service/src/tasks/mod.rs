//! Background tasks for the Voice Controller.
//!
//! # Tasks
//!
//! - `liveness` - Periodic heartbeat sweep that stages silent connections
//!   and reaps idle channels

pub mod liveness;

pub use liveness::run_liveness_monitor;
