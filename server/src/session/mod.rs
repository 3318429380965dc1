//! Authentication session engine: the per-(identity, method) FIFO core
//! and the proxy that owns the per-method plugin worker process.

pub mod core;
pub mod plugin_proxy;

pub use self::core::{AuthSession, SessionCommand};
pub use self::plugin_proxy::{ExecPluginFactory, PluginFactory, PluginProxy, ProxyEvent};

// vim: ts=4
