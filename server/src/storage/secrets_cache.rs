//! Write-through cache for the secrets tier.
//!
//! While the secrets tier is locked, secret writes land here so clients
//! keep working. Entries live until the tier opens (the cache is drained
//! into it exactly once and cleared) or the process exits. Secrets of
//! identities with `store_secret = false` are cached too; they are simply
//! skipped at flush time, which gives them process-lifetime semantics.

use std::collections::HashMap;

use signon_types::secrets_adapter::SecretsRecord;

use crate::prelude::*;

#[derive(Debug, Default, Clone)]
pub struct CacheEntry {
	pub username: Option<Box<str>>,
	pub password: Option<Box<str>>,
	/// `store_secret` at write time; controls whether the entry is
	/// persisted when the tier opens.
	pub storable: bool,
	/// Per-method blobs, keyed by the metadata tier's method id.
	pub data: HashMap<u32, SessionData>,
}

#[derive(Debug, Default)]
pub struct SecretsCache {
	entries: HashMap<IdentityId, CacheEntry>,
}

impl SecretsCache {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn update_credentials(&mut self, id: IdentityId, record: &SecretsRecord, storable: bool) {
		let entry = self.entries.entry(id).or_default();
		if record.username.is_some() {
			entry.username.clone_from(&record.username);
		}
		if record.password.is_some() {
			entry.password.clone_from(&record.password);
		}
		entry.storable = storable;
	}

	pub fn credentials(&self, id: IdentityId) -> Option<SecretsRecord> {
		let entry = self.entries.get(&id)?;
		if entry.username.is_none() && entry.password.is_none() {
			return None;
		}
		Some(SecretsRecord { username: entry.username.clone(), password: entry.password.clone() })
	}

	pub fn store_data(&mut self, id: IdentityId, method_id: u32, data: SessionData) {
		self.entries.entry(id).or_default().data.insert(method_id, data);
	}

	pub fn load_data(&self, id: IdentityId, method_id: u32) -> Option<SessionData> {
		self.entries.get(&id).and_then(|entry| entry.data.get(&method_id)).cloned()
	}

	pub fn remove(&mut self, id: IdentityId) {
		self.entries.remove(&id);
	}

	pub fn clear(&mut self) {
		self.entries.clear();
	}

	/// Empties the cache, handing every entry to the caller for the
	/// flush into the freshly opened tier.
	pub fn drain(&mut self) -> Vec<(IdentityId, CacheEntry)> {
		self.entries.drain().collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn record(username: Option<&str>, password: Option<&str>) -> SecretsRecord {
		SecretsRecord {
			username: username.map(Into::into),
			password: password.map(Into::into),
		}
	}

	#[test]
	fn partial_updates_merge() {
		let mut cache = SecretsCache::new();
		let id = IdentityId(1);
		cache.update_credentials(id, &record(Some("alice"), None), true);
		cache.update_credentials(id, &record(None, Some("pw")), true);

		let stored = cache.credentials(id).expect("entry");
		assert_eq!(stored.username.as_deref(), Some("alice"));
		assert_eq!(stored.password.as_deref(), Some("pw"));
	}

	#[test]
	fn non_storable_entries_are_kept_but_marked() {
		let mut cache = SecretsCache::new();
		let id = IdentityId(2);
		cache.update_credentials(id, &record(None, Some("transient")), false);

		assert!(cache.credentials(id).is_some());
		let drained = cache.drain();
		assert_eq!(drained.len(), 1);
		assert!(!drained[0].1.storable);
		assert!(cache.is_empty());
	}

	#[test]
	fn data_blobs_key_by_method() {
		let mut cache = SecretsCache::new();
		let id = IdentityId(3);
		let mut blob = SessionData::new();
		blob.insert("token".into(), "t".into());
		cache.store_data(id, 7, blob.clone());

		assert_eq!(cache.load_data(id, 7), Some(blob));
		assert_eq!(cache.load_data(id, 8), None);

		cache.remove(id);
		assert_eq!(cache.load_data(id, 7), None);
	}
}

// vim: ts=4
