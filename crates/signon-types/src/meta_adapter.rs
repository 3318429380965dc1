//! Adapter trait for the metadata tier of the credentials store.
//!
//! The metadata tier holds everything about an identity except its secret
//! material: caption, flags, type, the method/mechanism catalog, realms,
//! ACL and owner token sets, and cross-application references. Deleting an
//! identity row must cascade to every child table; the SQLite adapter
//! enforces this with triggers so that out-of-band writes stay consistent.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;

use crate::error::StoreResult;
use crate::types::{IdentityId, IdentityInfo};

/// One cross-application reference on an identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
	/// Access-control token of the application that took the reference.
	pub token: Box<str>,
	pub reference: Box<str>,
}

/// Every metadata tier implementation is required to implement this trait.
#[async_trait]
pub trait MetaAdapter: Debug + Send + Sync {
	/// Inserts a new identity row and all child rows. The returned id is
	/// freshly assigned and monotonic.
	async fn insert_identity(&self, info: &IdentityInfo) -> StoreResult<IdentityId>;

	/// Replaces the identity row and its child rows. The id in `info` must
	/// already be persisted.
	async fn update_identity(&self, info: &IdentityInfo) -> StoreResult<()>;

	/// Removes the identity row. Child rows (methods, realms, ACL, owner,
	/// refs) go with it. Returns false when no such row existed.
	async fn remove_identity(&self, id: IdentityId) -> StoreResult<bool>;

	/// Reads one identity. Secret fields of the result are always `None`;
	/// they live in the secrets tier.
	async fn read_identity(&self, id: IdentityId) -> StoreResult<Option<IdentityInfo>>;

	/// Reads all identities. The filter hook is accepted but currently
	/// unused; implementations may ignore it.
	async fn list_identities(
		&self,
		filter: &HashMap<String, serde_json::Value>,
	) -> StoreResult<Vec<IdentityInfo>>;

	/// Looks up the catalog id of a method name.
	async fn method_id(&self, method: &str) -> StoreResult<Option<u32>>;

	/// Inserts a method into the catalog, returning its id. Looking up an
	/// existing name returns the existing id.
	async fn insert_method(&self, method: &str) -> StoreResult<u32>;

	/// Distinct ACL tokens recorded for the identity.
	async fn acl_tokens(&self, id: IdentityId) -> StoreResult<Vec<Box<str>>>;

	/// Owner tokens recorded for the identity. Empty means un-owned.
	async fn owner_tokens(&self, id: IdentityId) -> StoreResult<Vec<Box<str>>>;

	async fn add_reference(
		&self,
		id: IdentityId,
		token: &str,
		reference: &str,
	) -> StoreResult<()>;

	/// Removes a reference; with `reference == None` every reference held
	/// under the token is dropped. Returns false when nothing matched.
	async fn remove_reference(
		&self,
		id: IdentityId,
		token: &str,
		reference: Option<&str>,
	) -> StoreResult<bool>;

	/// References on the identity, optionally restricted to one token.
	async fn references(
		&self,
		id: IdentityId,
		token: Option<&str>,
	) -> StoreResult<Vec<Reference>>;

	/// Drops every identity and child row.
	async fn clear(&self) -> StoreResult<()>;
}

// vim: ts=4
