//! Access-control gate.
//!
//! Thin layer over the injected policy adapter. Every IPC entry point
//! except the low-privilege method/mechanism queries runs one of these
//! checks. Identities without recorded owner tokens are treated as
//! un-owned: any peer passes owner-only checks on them (legacy behavior,
//! kept on purpose).

use std::sync::Arc;

use signon_types::access_control::{AccessControlAdapter, AccessReply, AccessRequest, Peer};
use signon_types::types::ACL_WILDCARD;

use crate::prelude::*;
use crate::storage::CredentialsDb;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerCheck {
	Owner,
	NotOwner,
	/// The identity has no owner tokens recorded.
	NoOwner,
}

pub struct AccessControl {
	adapter: Arc<dyn AccessControlAdapter>,
	db: Arc<CredentialsDb>,
}

impl std::fmt::Debug for AccessControl {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("AccessControl").finish()
	}
}

impl AccessControl {
	pub fn new(adapter: Arc<dyn AccessControlAdapter>, db: Arc<CredentialsDb>) -> Self {
		AccessControl { adapter, db }
	}

	pub async fn app_id_of_peer(&self, peer: &Peer) -> Box<str> {
		self.adapter.app_id_of_peer(peer).await
	}

	pub async fn is_peer_keychain_widget(&self, peer: &Peer) -> bool {
		let app_id = self.adapter.app_id_of_peer(peer).await;
		app_id == self.adapter.keychain_widget_app_id()
	}

	pub async fn is_peer_owner_of_identity(
		&self,
		peer: &Peer,
		id: IdentityId,
	) -> SsoResult<OwnerCheck> {
		let tokens = self.db.owner_tokens(id).await.map_err(|err| {
			warn!("owner token lookup failed for {}: {}", id, err);
			Error::InternalServer
		})?;
		if tokens.is_empty() {
			return Ok(OwnerCheck::NoOwner);
		}
		for token in &tokens {
			if self.adapter.is_peer_allowed_to_access(peer, token).await {
				return Ok(OwnerCheck::Owner);
			}
		}
		Ok(OwnerCheck::NotOwner)
	}

	/// Owner-only operations: owners pass, and so does everyone on an
	/// un-owned identity. The keychain widget is always exempt.
	pub async fn may_administer_identity(&self, peer: &Peer, id: IdentityId) -> SsoResult<bool> {
		if self.is_peer_keychain_widget(peer).await {
			return Ok(true);
		}
		Ok(self.is_peer_owner_of_identity(peer, id).await? != OwnerCheck::NotOwner)
	}

	pub async fn is_peer_allowed_to_use_identity(
		&self,
		peer: &Peer,
		id: IdentityId,
	) -> SsoResult<bool> {
		if self.is_peer_owner_of_identity(peer, id).await? == OwnerCheck::Owner {
			return Ok(true);
		}
		let acl = self.db.acl_tokens(id).await.map_err(|err| {
			warn!("acl lookup failed for {}: {}", id, err);
			Error::InternalServer
		})?;
		if acl.iter().any(|t| &**t == ACL_WILDCARD) {
			return Ok(true);
		}
		for token in &acl {
			if self.adapter.is_peer_allowed_to_access(peer, token).await {
				return Ok(true);
			}
		}
		Ok(false)
	}

	pub async fn is_peer_allowed_to_use_auth_session(
		&self,
		peer: &Peer,
		id: IdentityId,
	) -> SsoResult<bool> {
		self.is_peer_allowed_to_use_identity(peer, id).await
	}

	/// The subset of an identity's ACL the peer actually holds; handed to
	/// plugins as `AccessControlTokens`.
	pub async fn tokens_of_peer(&self, peer: &Peer, acl: &[Box<str>]) -> Vec<Box<str>> {
		let mut tokens = Vec::new();
		for token in acl {
			if &**token == ACL_WILDCARD {
				continue;
			}
			if self.adapter.is_peer_allowed_to_access(peer, token).await {
				tokens.push(token.clone());
			}
		}
		tokens
	}

	/// Interactive access request for a peer that failed the per-identity
	/// check; the caller suspends its reply until this resolves.
	pub async fn request_access(&self, request: AccessRequest) -> bool {
		debug!(
			"access request for identity {} from pid {}",
			request.identity, request.peer.pid
		);
		self.adapter.handle_request(request).await == AccessReply::Granted
	}
}

// vim: ts=4
