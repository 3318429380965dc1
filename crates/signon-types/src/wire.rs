//! Wire envelope of the daemon IPC bus.
//!
//! The bus is a per-user Unix socket carrying length-delimited JSON
//! frames. Clients send [`ClientFrame`]s addressed to an object path; the
//! daemon answers with correlated replies or errors and pushes unsolicited
//! [`ServerFrame::Signal`]s. Method dispatch is fully typed: every callable
//! operation is a [`Call`] variant rather than a method name string.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::{IdentityInfo, SessionData};

/// Object path of the daemon root object.
pub const DAEMON_PATH: &str = "/";

// Signal names.
pub const SIG_INFO_UPDATED: &str = "info_updated";
pub const SIG_UNREGISTERED: &str = "unregistered";
pub const SIG_STATE_CHANGED: &str = "state_changed";

/// Error message marking a call that raced the destruction of its target
/// object. The client proxy re-queues such calls instead of failing them.
pub const NO_OBJECT: &str = "no-object";

/// One request from a client to an object on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
	/// Correlation id, unique per connection.
	pub id: u64,
	/// Target object path (`/` for the daemon root).
	pub path: Box<str>,
	pub call: Call,
}

/// Every operation callable on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Call {
	// Daemon root
	RegisterNewIdentity,
	GetIdentity { id: u32 },
	GetAuthSession { id: u32, #[serde(rename = "auth_method")] method: Box<str> },
	QueryMethods,
	QueryMechanisms { #[serde(rename = "auth_method")] method: Box<str> },
	QueryIdentities { filter: HashMap<String, serde_json::Value> },
	Clear,

	// Identity objects
	RequestCredentialsUpdate { message: Box<str> },
	GetInfo,
	AddReference { reference: Box<str> },
	RemoveReference { reference: Box<str> },
	VerifyUser { params: SessionData },
	VerifySecret { secret: Box<str> },
	Remove,
	SignOut,
	Store { info: IdentityInfo },

	// Session objects
	QueryAvailableMechanisms { wanted: Vec<Box<str>> },
	Process { params: SessionData, mechanism: Box<str> },
	Cancel,
	SetId { id: u32 },
	ObjectUnref,
}

/// One frame from the daemon to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
	Reply { id: u64, result: serde_json::Value },
	Error { id: u64, code: u32, message: String },
	Signal { path: Box<str>, name: Box<str>, args: serde_json::Value },
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn frames_round_trip() {
		let frame = ClientFrame {
			id: 42,
			path: "/Identity/7".into(),
			call: Call::VerifySecret { secret: "pw".into() },
		};
		let bytes = serde_json::to_vec(&frame).expect("encode");
		let back: ClientFrame = serde_json::from_slice(&bytes).expect("decode");
		assert_eq!(back.id, 42);
		assert_eq!(&*back.path, "/Identity/7");
		match back.call {
			Call::VerifySecret { secret } => assert_eq!(&*secret, "pw"),
			other => panic!("unexpected call {:?}", other),
		}
	}

	#[test]
	fn error_frame_shape() {
		let frame = ServerFrame::Error { id: 9, code: 202, message: "IdentityNotFound".into() };
		let json = serde_json::to_string(&frame).expect("encode");
		assert!(json.contains("\"error\""));
		assert!(json.contains("202"));
	}
}

// vim: ts=4
