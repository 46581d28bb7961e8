//! Session-routed prompt delivery for remote coding-assistant workers.
//!
//! This crate is the orchestration core behind a mobile chat client that talks to an
//! AI coding assistant CLI running on another machine. Prompts arrive from any of a
//! user's devices, are routed to one long-lived worker process per (user, working
//! directory), run strictly one at a time per session, and the replies are pushed back
//! to every device the user has registered.
//!
//! # Architecture Overview
//!
//! - **Device registry**: devices per user, heartbeats, liveness and retention
//! - **Duplicate detection**: content fingerprints within a short window
//! - **Message queue**: one ordered, pausable, priority-aware lane per session
//! - **Process runner**: spawns and supervises the worker, classifies its output
//! - **Session manager**: session lifecycle, routing and worker ownership
//! - **Delivery**: push fan-out with retry and a payload size budget
//! - **Continuation agent**: optionally keeps the worker going without a human
//!
//! `Relay` ties these together and is what a request handler calls; `Sweeper` runs the
//! periodic cleanup tasks.

pub mod config;
pub mod continuation;
pub mod core_types;
pub mod dedup;
pub mod delivery;
pub mod devices;
pub mod errors;
pub mod queue;
pub mod relay;
pub mod runner;
pub mod session;
pub mod sweeper;

pub use config::*;
pub use continuation::ContinuationAgent;
pub use delivery::DeliveryService;
pub use devices::DeviceRegistry;
pub use errors::{RelayError, TransportError};
pub use relay::{Relay, RelayBuilder};
pub use session::SessionManager;
pub use sweeper::Sweeper;

#[cfg(test)]
pub mod test_utils;
