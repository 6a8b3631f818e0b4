//! Voice Controller library.
//!
//! Session and presence coordinator for audio-only voice channels backed by
//! an out-of-process SFU. Clients speak a JSON protocol over `/socket`; the
//! coordinator validates them against the backend, tracks who is in each
//! channel, keeps a short grace window for reconnects, and drives the media
//! engine to wire producers to consumers.
//!
//! # Modules
//!
//! - [`actors`] - controller, per-channel and per-connection actors
//! - [`backend`] - channel validation and interop presence relay
//! - [`config`] - environment configuration
//! - [`errors`] - error type and client error codes
//! - [`media`] - media engine boundary and network family handling
//! - [`observability`] - metrics and health endpoints
//! - [`registry`] - per-channel participant and media bookkeeping
//! - [`routes`] - HTTP router
//! - [`signaling`] - WebSocket sessions and wire protocol
//! - [`tasks`] - background tasks

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod actors;
pub mod backend;
pub mod config;
pub mod errors;
pub mod media;
pub mod observability;
pub mod registry;
pub mod routes;
pub mod signaling;
pub mod tasks;
