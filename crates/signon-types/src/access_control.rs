//! Adapter trait for the access-control policy plugin.
//!
//! The daemon itself has no notion of what an application is; it only
//! handles opaque tokens. The policy adapter turns a connected peer into a
//! stable application id, answers per-token checks, names the privileged
//! keychain UI, and can run an interactive access prompt when a peer asks
//! for an identity it has no token for.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

use crate::types::IdentityId;

/// Connection-derived identity of a client process, as reported by the
/// transport (SO_PEERCRED on the bus socket).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
	pub pid: u32,
	pub uid: u32,
}

/// An interactive request for access a peer does not currently have.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRequest {
	pub peer: Peer,
	pub identity: IdentityId,
	/// The method the peer asked a session for, when applicable.
	pub method: Option<Box<str>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessReply {
	Granted,
	Denied,
}

/// Every access-control policy implementation is required to implement
/// this trait.
#[async_trait]
pub trait AccessControlAdapter: Debug + Send + Sync {
	/// Opaque, stable application identifier of a peer.
	async fn app_id_of_peer(&self, peer: &Peer) -> Box<str>;

	/// Whether the peer may use the given access-control token.
	async fn is_peer_allowed_to_access(&self, peer: &Peer, token: &str) -> bool;

	/// Application id of the trusted keychain UI, which is exempt from
	/// per-identity ownership checks.
	fn keychain_widget_app_id(&self) -> Box<str>;

	/// Asks the policy (typically through a user prompt) to grant access
	/// the peer does not currently have. The reply may take arbitrarily
	/// long; callers suspend the original request until it arrives.
	async fn handle_request(&self, request: AccessRequest) -> AccessReply;
}

/// Default policy: every peer is identified by its uid and every token
/// check passes. Suitable for single-user installations without a
/// platform security framework.
#[derive(Debug, Default)]
pub struct PermissiveAccessControl;

#[async_trait]
impl AccessControlAdapter for PermissiveAccessControl {
	async fn app_id_of_peer(&self, peer: &Peer) -> Box<str> {
		format!("uid:{}", peer.uid).into()
	}

	async fn is_peer_allowed_to_access(&self, _peer: &Peer, _token: &str) -> bool {
		true
	}

	fn keychain_widget_app_id(&self) -> Box<str> {
		"signon-keychain".into()
	}

	async fn handle_request(&self, _request: AccessRequest) -> AccessReply {
		AccessReply::Granted
	}
}

// vim: ts=4
