//! Client library for the signon daemon.
//!
//! Entry point is [`AuthService`]: it owns the bus connection and hands
//! out [`Identity`] and [`AuthSession`] handles. Every operation is
//! asynchronous; unsolicited notifications (`info_updated`, sign-out,
//! session state changes) surface as event streams on the handles.
//!
//! Handles are cheap clones around shared state, but they are affine to
//! the async runtime they were created on: futures and event streams must
//! be driven by that runtime's executor.

pub mod auth_service;
pub mod auth_session;
pub mod connection;
pub mod identity;
pub mod remote_proxy;

pub use auth_service::AuthService;
pub use auth_session::AuthSession;
pub use identity::{Identity, IdentityEvent, IdentityState};
pub use signon_types::error::{Error, SsoResult};
pub use signon_types::types::{IdentityId, IdentityInfo, SessionData};

// vim: ts=4
