//! Shared types, adapter traits, and wire schemas for the signon daemon.
//!
//! This crate contains everything that is shared between the daemon, the
//! client library and the storage adapter implementations: the canonical
//! error taxonomy, the identity data model, the adapter traits for the two
//! storage tiers, access control and UI brokering, and the typed wire
//! schemas of the IPC bus and the plugin worker channel.

pub mod access_control;
pub mod error;
pub mod meta_adapter;
pub mod plugin;
pub mod prelude;
pub mod secrets_adapter;
pub mod types;
pub mod ui;
pub mod wire;

// vim: ts=4
