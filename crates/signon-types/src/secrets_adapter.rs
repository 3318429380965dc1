//! Adapter trait for the secrets tier of the credentials store.
//!
//! The secrets tier holds passwords, secret usernames and the per-method
//! key→value blobs (refresh tokens and the like). It may live on encrypted
//! media that is mounted and unmounted while the daemon runs, which is why
//! the daemon treats the whole tier as something that can be absent: when
//! it is, writes are buffered in the in-process secrets cache.

use async_trait::async_trait;
use std::fmt::Debug;

use crate::error::StoreResult;
use crate::types::{IdentityId, SessionData};

/// Total serialized budget of one (identity, method) blob, in bytes.
pub const MAX_DATA_STORAGE: usize = 4 * 1024;

/// Secret credentials of one identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretsRecord {
	pub username: Option<Box<str>>,
	pub password: Option<Box<str>>,
}

/// Every secrets tier implementation is required to implement this trait.
#[async_trait]
pub trait SecretsAdapter: Debug + Send + Sync {
	/// Writes (or replaces) the secret credentials of an identity.
	async fn update_credentials(
		&self,
		id: IdentityId,
		record: &SecretsRecord,
	) -> StoreResult<()>;

	async fn read_credentials(&self, id: IdentityId) -> StoreResult<Option<SecretsRecord>>;

	/// Removes the credentials row; the per-method blobs cascade with it.
	async fn remove_credentials(&self, id: IdentityId) -> StoreResult<()>;

	/// Validates a secret against the stored row. With `username` present
	/// both fields must match; otherwise only the password is compared.
	async fn check_password(
		&self,
		id: IdentityId,
		username: Option<&str>,
		password: &str,
	) -> StoreResult<bool>;

	/// Loads the (identity, method) blob. Missing blobs come back empty.
	async fn load_data(&self, id: IdentityId, method_id: u32) -> StoreResult<SessionData>;

	/// Replaces the (identity, method) blob. The serialized size of the
	/// whole map is checked against [`MAX_DATA_STORAGE`] before any row is
	/// touched; an oversized blob fails without mutating.
	async fn store_data(
		&self,
		id: IdentityId,
		method_id: u32,
		data: &SessionData,
	) -> StoreResult<()>;

	/// Drops the (identity, method) blob, or every blob of the identity
	/// when `method_id` is `None`.
	async fn remove_data(&self, id: IdentityId, method_id: Option<u32>) -> StoreResult<()>;

	/// Drops every credentials row and blob.
	async fn clear(&self) -> StoreResult<()>;
}

// vim: ts=4
