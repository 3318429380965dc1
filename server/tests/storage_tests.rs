//! Credentials DB façade tests: two-tier routing, the write-through
//! cache under a closed secrets tier, and the last-error surface.

mod common;

use std::collections::HashMap;

use signon_types::error::StoreError;
use signon_types::types::{IdentityId, IdentityInfo, SessionData};

fn info(username: &str, secret: &str, store_secret: bool) -> IdentityInfo {
	let mut info = IdentityInfo::new();
	info.caption = "test account".into();
	info.username = Some(username.into());
	info.secret = Some(secret.into());
	info.store_secret = store_secret;
	info.methods.insert("m".into(), vec![]);
	info
}

#[tokio::test]
async fn insert_and_read_back_with_secret() {
	let storage = common::open_storage().await;
	let id = storage.db.insert_credentials(&info("u", "p", true)).await.expect("insert");
	assert!(id.0 > 0);

	let without = storage.db.credentials(id, false).await.expect("read").expect("present");
	assert_eq!(without.secret, None);

	let with = storage.db.credentials(id, true).await.expect("read").expect("present");
	assert_eq!(with.secret.as_deref(), Some("p"));
	assert_eq!(with.username.as_deref(), Some("u"));
}

#[tokio::test]
async fn check_password_validates_username_and_secret() {
	let storage = common::open_storage().await;
	let id = storage.db.insert_credentials(&info("u", "p", true)).await.expect("insert");

	assert!(storage.db.check_password(id, "u", "p").await.expect("check"));
	assert!(!storage.db.check_password(id, "u", "wrong").await.expect("check"));
	assert!(!storage.db.check_password(id, "stranger", "p").await.expect("check"));
	assert!(!storage.db.check_password(IdentityId(9999), "u", "p").await.expect("check"));
}

#[tokio::test]
async fn store_secret_false_never_reaches_the_tier() {
	let storage = common::open_storage().await;
	let id = storage.db.insert_credentials(&info("u", "p", false)).await.expect("insert");

	// The secret is process-local: visible through the façade cache...
	let with = storage.db.credentials(id, true).await.expect("read").expect("present");
	assert_eq!(with.secret.as_deref(), Some("p"));
	// ...but the tier has no row, so validation fails.
	assert!(!storage.db.check_password(id, "u", "p").await.expect("check"));
}

#[tokio::test]
async fn password_caching_under_closed_tier() {
	let (storage, secrets) = common::closed_storage().await;

	let a = storage.db.insert_credentials(&info("u", "P1", true)).await.expect("insert a");
	let b = storage.db.insert_credentials(&info("u", "P2", false)).await.expect("insert b");

	// While closed, both secrets are served from the cache.
	let read_a = storage.db.credentials(a, true).await.expect("read").expect("present");
	assert_eq!(read_a.secret.as_deref(), Some("P1"));
	let read_b = storage.db.credentials(b, true).await.expect("read").expect("present");
	assert_eq!(read_b.secret.as_deref(), Some("P2"));

	// Destructive ops and password checks refuse while closed.
	assert_eq!(storage.db.remove_credentials(a).await, Err(StoreError::NotOpen));
	assert_eq!(storage.db.last_error(), StoreError::NotOpen);
	assert_eq!(storage.db.check_password(a, "u", "P1").await, Err(StoreError::NotOpen));

	// Opening the tier flushes the storable secret and drops the rest.
	storage.db.open_secrets(secrets).await;
	assert!(storage.db.check_password(a, "u", "P1").await.expect("check"));
	assert!(!storage.db.check_password(b, "u", "P2").await.expect("check"));

	let read_a = storage.db.credentials(a, true).await.expect("read").expect("present");
	assert_eq!(read_a.secret.as_deref(), Some("P1"));
	let read_b = storage.db.credentials(b, true).await.expect("read").expect("present");
	assert_eq!(read_b.secret, None);
}

#[tokio::test]
async fn blobs_follow_the_tier_state() {
	let (storage, secrets) = common::closed_storage().await;
	let id = storage.db.insert_credentials(&info("u", "p", true)).await.expect("insert");

	let mut blob = SessionData::new();
	blob.insert("RefreshToken".into(), "r1".into());
	storage.db.store_data(id, "oauth2", &blob).await.expect("store under closed tier");
	assert_eq!(storage.db.load_data(id, "oauth2").await.expect("load"), blob);

	storage.db.open_secrets(secrets).await;
	// Flushed into the tier and still readable.
	assert_eq!(storage.db.load_data(id, "oauth2").await.expect("load"), blob);

	// Lazy method row creation happened exactly once.
	let mut blob2 = SessionData::new();
	blob2.insert("RefreshToken".into(), "r2".into());
	storage.db.store_data(id, "oauth2", &blob2).await.expect("store");
	assert_eq!(storage.db.load_data(id, "oauth2").await.expect("load"), blob2);

	storage.db.remove_data(id, Some("oauth2")).await.expect("remove");
	assert!(storage.db.load_data(id, "oauth2").await.expect("load").is_empty());
}

#[tokio::test]
async fn flush_happens_exactly_once() {
	let (storage, secrets) = common::closed_storage().await;
	let id = storage.db.insert_credentials(&info("u", "p", true)).await.expect("insert");

	storage.db.open_secrets(secrets).await;
	assert!(storage.db.check_password(id, "u", "p").await.expect("check"));

	// The tier now owns the secret; closing and reopening must not lose
	// it (the cache is empty, there is nothing to flush again).
	storage.db.close_secrets().await;
	// Reuse the same physical file through a second adapter handle.
	let path = storage._tmp.path().join("signon-secrets.db");
	let fresh_secrets = signon_secrets_adapter_sqlite::SecretsAdapterSqlite::new(path)
		.await
		.expect("reopen secrets");
	storage.db.open_secrets(std::sync::Arc::new(fresh_secrets)).await;
	assert!(storage.db.check_password(id, "u", "p").await.expect("check"));
}

#[tokio::test]
async fn oversized_blob_is_rejected_by_the_facade() {
	let storage = common::open_storage().await;
	let id = storage.db.insert_credentials(&info("u", "p", true)).await.expect("insert");

	let mut huge = SessionData::new();
	huge.insert("blob".into(), "x".repeat(5000).into());
	assert!(storage.db.store_data(id, "m", &huge).await.is_err());
	assert!(storage.db.last_error().is_error());
	// Reading the error cleared it.
	assert_eq!(storage.db.last_error(), StoreError::NoError);
}

#[tokio::test]
async fn references_round_trip() {
	let storage = common::open_storage().await;
	let id = storage.db.insert_credentials(&info("u", "p", true)).await.expect("insert");

	storage.db.add_reference(id, "app:1", "bookmark").await.expect("add");
	let refs = storage.db.references(id, None).await.expect("list");
	assert_eq!(refs.len(), 1);
	assert_eq!(&*refs[0].reference, "bookmark");

	assert!(storage.db.remove_reference(id, "app:1", Some("bookmark")).await.expect("remove"));
	assert!(!storage.db.remove_reference(id, "app:1", Some("bookmark")).await.expect("again"));
}

#[tokio::test]
async fn clear_requires_open_tier_and_empties_everything() {
	let (storage, secrets) = common::closed_storage().await;
	storage.db.insert_credentials(&info("u", "p", true)).await.expect("insert");

	assert_eq!(storage.db.clear().await, Err(StoreError::NotOpen));

	storage.db.open_secrets(secrets).await;
	storage.db.clear().await.expect("clear");
	let all = storage.db.list_credentials(&HashMap::new()).await.expect("list");
	assert!(all.is_empty());
}

#[tokio::test]
async fn update_routes_secret_by_store_flag() {
	let storage = common::open_storage().await;
	let id = storage.db.insert_credentials(&info("u", "p", true)).await.expect("insert");

	// Flip to non-persistent: the tier row is removed, the cache keeps
	// the secret for the process lifetime.
	let mut updated = info("u", "q", false);
	updated.id = id;
	storage.db.update_credentials(&updated).await.expect("update");

	assert!(!storage.db.check_password(id, "u", "q").await.expect("check"));
	let read = storage.db.credentials(id, true).await.expect("read").expect("present");
	assert_eq!(read.secret.as_deref(), Some("q"));
}
