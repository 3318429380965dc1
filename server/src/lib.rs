//! signond is a user-session credentials and authentication daemon.
//!
//! # Features
//!
//! - Two-tier persistent credentials store (metadata + secrets), with an
//!   in-memory write-through cache while the secrets tier is locked
//! - Per-identity IPC objects with owner/ACL-token access control
//! - Authentication sessions that run pluggable methods (OAuth, SASL,
//!   password, ...) in per-method worker processes
//! - UI prompts brokered through a separate UI service
//! - Idle-based reaping of identity and session objects

pub mod access_control;
pub mod app;
pub mod config;
pub mod daemon;
pub mod disposable;
pub mod identity;
pub mod ipc;
pub mod prelude;
pub mod session;
pub mod storage;
pub mod ui;

pub use crate::app::{App, AppBuilder};
pub use crate::config::Config;

// vim: ts=4
