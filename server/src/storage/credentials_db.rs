//! The credentials DB façade.
//!
//! Composes the metadata tier, the (possibly absent) secrets tier and the
//! in-memory secrets cache into one query/update surface. Every public
//! call clears the "last error" slot on entry and records the first
//! failure it hits; the slot is readable exactly once. Destructive
//! operations require the secrets tier to be open and fail fast with
//! `NotOpen` otherwise.

use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

use signon_types::meta_adapter::{MetaAdapter, Reference};
use signon_types::secrets_adapter::{SecretsAdapter, SecretsRecord, MAX_DATA_STORAGE};

use crate::prelude::*;
use crate::storage::SecretsCache;

pub struct CredentialsDb {
	meta: Arc<dyn MetaAdapter>,
	secrets: RwLock<Option<Arc<dyn SecretsAdapter>>>,
	cache: tokio::sync::Mutex<SecretsCache>,
	last_error: Mutex<StoreError>,
}

impl std::fmt::Debug for CredentialsDb {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CredentialsDb").finish()
	}
}

impl CredentialsDb {
	pub fn new(meta: Arc<dyn MetaAdapter>) -> Self {
		CredentialsDb {
			meta,
			secrets: RwLock::new(None),
			cache: tokio::sync::Mutex::new(SecretsCache::new()),
			last_error: Mutex::new(StoreError::NoError),
		}
	}

	/// Attaches a freshly opened secrets tier and drains the cache into
	/// it. Exactly one flush happens per Closed→Open transition; secrets
	/// written with `store_secret = false` are dropped, per-method blobs
	/// are persisted unconditionally.
	pub async fn open_secrets(&self, adapter: Arc<dyn SecretsAdapter>) {
		let mut slot = self.secrets.write().await;
		if slot.is_some() {
			warn!("secrets tier opened twice, ignoring");
			return;
		}

		let drained = self.cache.lock().await.drain();
		for (id, entry) in drained {
			if entry.storable && (entry.username.is_some() || entry.password.is_some()) {
				let record =
					SecretsRecord { username: entry.username, password: entry.password };
				if let Err(err) = adapter.update_credentials(id, &record).await {
					warn!("cache flush: credentials of {} lost: {}", id, err);
				}
			}
			for (method_id, blob) in entry.data {
				if let Err(err) = adapter.store_data(id, method_id, &blob).await {
					warn!("cache flush: blob of {}/{} lost: {}", id, method_id, err);
				}
			}
		}

		*slot = Some(adapter);
		info!("secrets tier open");
	}

	/// Detaches the secrets tier (secure storage went away). The cache is
	/// empty at this point; subsequent secret writes start filling it.
	pub async fn close_secrets(&self) {
		*self.secrets.write().await = None;
		info!("secrets tier closed");
	}

	pub async fn is_secrets_open(&self) -> bool {
		self.secrets.read().await.is_some()
	}

	/// Reads and clears the last recorded storage error.
	pub fn last_error(&self) -> StoreError {
		match self.last_error.lock() {
			Ok(mut slot) => std::mem::take(&mut *slot),
			Err(_) => StoreError::Unknown,
		}
	}

	fn begin_op(&self) {
		if let Ok(mut slot) = self.last_error.lock() {
			*slot = StoreError::NoError;
		}
	}

	fn record<T>(&self, result: StoreResult<T>) -> StoreResult<T> {
		if let Err(err) = &result {
			if let Ok(mut slot) = self.last_error.lock() {
				*slot = *err;
			}
		}
		result
	}

	fn not_open<T>(&self) -> StoreResult<T> {
		self.record(Err(StoreError::NotOpen))
	}

	async fn secrets_tier(&self) -> Option<Arc<dyn SecretsAdapter>> {
		self.secrets.read().await.clone()
	}

	fn secret_record(info: &IdentityInfo) -> SecretsRecord {
		SecretsRecord {
			username: if info.username_is_secret { info.username.clone() } else { None },
			password: info.secret.clone(),
		}
	}

	async fn route_secret_write(&self, id: IdentityId, info: &IdentityInfo) -> StoreResult<()> {
		let record = Self::secret_record(info);
		if record.username.is_none() && record.password.is_none() {
			return Ok(());
		}
		match self.secrets_tier().await {
			Some(tier) if info.store_secret => self.record(tier.update_credentials(id, &record).await),
			Some(_) => {
				// Not to be persisted; keep it for the process lifetime.
				self.cache.lock().await.update_credentials(id, &record, false);
				Ok(())
			}
			None => {
				self.cache.lock().await.update_credentials(id, &record, info.store_secret);
				Ok(())
			}
		}
	}

	pub async fn insert_credentials(&self, info: &IdentityInfo) -> StoreResult<IdentityId> {
		self.begin_op();
		let id = {
			let result = self.meta.insert_identity(info).await;
			self.record(result)?
		};
		self.route_secret_write(id, info).await?;
		Ok(id)
	}

	pub async fn update_credentials(&self, info: &IdentityInfo) -> StoreResult<IdentityId> {
		self.begin_op();
		{
			let result = self.meta.update_identity(info).await;
			self.record(result)?;
		}

		if info.store_secret {
			self.route_secret_write(info.id, info).await?;
		} else if let Some(tier) = self.secrets_tier().await {
			// The identity no longer wants its secret persisted.
			let result = tier.remove_credentials(info.id).await;
			self.record(result)?;
			self.route_secret_write(info.id, info).await?;
		} else {
			self.route_secret_write(info.id, info).await?;
		}
		Ok(info.id)
	}

	pub async fn remove_credentials(&self, id: IdentityId) -> StoreResult<bool> {
		self.begin_op();
		let Some(tier) = self.secrets_tier().await else {
			return self.not_open();
		};

		let found = {
			let result = self.meta.remove_identity(id).await;
			self.record(result)?
		};
		let result = tier.remove_credentials(id).await;
		self.record(result)?;
		self.cache.lock().await.remove(id);
		Ok(found)
	}

	pub async fn credentials(
		&self,
		id: IdentityId,
		with_secrets: bool,
	) -> StoreResult<Option<IdentityInfo>> {
		self.begin_op();
		let info = {
			let result = self.meta.read_identity(id).await;
			self.record(result)?
		};
		let Some(mut info) = info else { return Ok(None) };

		if with_secrets {
			let tier_record = match self.secrets_tier().await {
				Some(tier) => {
					let result = tier.read_credentials(id).await;
					self.record(result)?.unwrap_or_default()
				}
				None => SecretsRecord::default(),
			};
			let cached = self.cache.lock().await.credentials(id).unwrap_or_default();

			// Tier wins per field; the cache fills the gaps.
			let secret = tier_record.password.or(cached.password);
			let username = tier_record.username.or(cached.username);
			info.secret = secret;
			if info.username_is_secret {
				info.username = username;
			}
		}
		Ok(Some(info))
	}

	pub async fn list_credentials(
		&self,
		filter: &std::collections::HashMap<String, serde_json::Value>,
	) -> StoreResult<Vec<IdentityInfo>> {
		self.begin_op();
		let result = self.meta.list_identities(filter).await;
		self.record(result)
	}

	pub async fn check_password(
		&self,
		id: IdentityId,
		username: &str,
		password: &str,
	) -> StoreResult<bool> {
		self.begin_op();
		let Some(tier) = self.secrets_tier().await else {
			return self.not_open();
		};
		let info = {
			let result = self.meta.read_identity(id).await;
			self.record(result)?
		};
		let Some(info) = info else { return Ok(false) };

		if info.username_is_secret {
			let result = tier.check_password(id, Some(username), password).await;
			return self.record(result);
		}
		if info.username.as_deref() != Some(username) {
			return Ok(false);
		}
		let result = tier.check_password(id, None, password).await;
		self.record(result)
	}

	pub async fn load_data(&self, id: IdentityId, method: &str) -> StoreResult<SessionData> {
		self.begin_op();
		let method_id = {
			let result = self.meta.method_id(method).await;
			self.record(result)?
		};
		let Some(method_id) = method_id else { return Ok(SessionData::new()) };

		if let Some(tier) = self.secrets_tier().await {
			let data = {
				let result = tier.load_data(id, method_id).await;
				self.record(result)?
			};
			if !data.is_empty() {
				return Ok(data);
			}
		}
		Ok(self.cache.lock().await.load_data(id, method_id).unwrap_or_default())
	}

	pub async fn store_data(
		&self,
		id: IdentityId,
		method: &str,
		data: &SessionData,
	) -> StoreResult<()> {
		self.begin_op();
		let size: usize =
			data.iter().map(|(key, value)| key.len() + value.to_string().len()).sum();
		if size > MAX_DATA_STORAGE {
			warn!("data storage limit exceeded for identity {}: {} bytes", id, size);
			return self.record(Err(StoreError::Statement));
		}

		// Method rows are created lazily on the first store.
		let method_id = {
			let result = self.meta.method_id(method).await;
			self.record(result)?
		};
		let method_id = match method_id {
			Some(method_id) => method_id,
			None => {
				let result = self.meta.insert_method(method).await;
				self.record(result)?
			}
		};

		match self.secrets_tier().await {
			Some(tier) => {
				let result = tier.store_data(id, method_id, data).await;
				self.record(result)
			}
			None => {
				self.cache.lock().await.store_data(id, method_id, data.clone());
				Ok(())
			}
		}
	}

	pub async fn remove_data(&self, id: IdentityId, method: Option<&str>) -> StoreResult<()> {
		self.begin_op();
		let Some(tier) = self.secrets_tier().await else {
			return self.not_open();
		};

		let method_id = match method {
			Some(method) => {
				let result = self.meta.method_id(method).await;
				match self.record(result)? {
					Some(method_id) => Some(method_id),
					None => return Ok(()),
				}
			}
			None => None,
		};
		let result = tier.remove_data(id, method_id).await;
		self.record(result)
	}

	pub async fn add_reference(
		&self,
		id: IdentityId,
		token: &str,
		reference: &str,
	) -> StoreResult<()> {
		self.begin_op();
		let result = self.meta.add_reference(id, token, reference).await;
		self.record(result)
	}

	pub async fn remove_reference(
		&self,
		id: IdentityId,
		token: &str,
		reference: Option<&str>,
	) -> StoreResult<bool> {
		self.begin_op();
		let result = self.meta.remove_reference(id, token, reference).await;
		self.record(result)
	}

	pub async fn references(
		&self,
		id: IdentityId,
		token: Option<&str>,
	) -> StoreResult<Vec<Reference>> {
		self.begin_op();
		let result = self.meta.references(id, token).await;
		self.record(result)
	}

	pub async fn acl_tokens(&self, id: IdentityId) -> StoreResult<Vec<Box<str>>> {
		self.begin_op();
		let result = self.meta.acl_tokens(id).await;
		self.record(result)
	}

	pub async fn owner_tokens(&self, id: IdentityId) -> StoreResult<Vec<Box<str>>> {
		self.begin_op();
		let result = self.meta.owner_tokens(id).await;
		self.record(result)
	}

	pub async fn clear(&self) -> StoreResult<()> {
		self.begin_op();
		let Some(tier) = self.secrets_tier().await else {
			return self.not_open();
		};
		{
			let result = self.meta.clear().await;
			self.record(result)?;
		}
		let result = tier.clear().await;
		self.record(result)?;
		self.cache.lock().await.clear();
		Ok(())
	}
}

// vim: ts=4
