//! IPC bus: per-user Unix socket transport, framed JSON envelope,
//! object-path dispatch and signal push.

pub mod server;

pub use server::{bind_socket, serve};

// vim: ts=4
