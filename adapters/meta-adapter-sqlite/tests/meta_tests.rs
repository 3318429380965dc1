//! Metadata tier CRUD and catalog tests.

use std::collections::HashMap;

use signon_meta_adapter_sqlite::MetaAdapterSqlite;
use signon_types::meta_adapter::MetaAdapter;
use signon_types::types::{CredentialsType, IdentityId, IdentityInfo};
use tempfile::TempDir;

fn boxed(items: &[&str]) -> Vec<Box<str>> {
	items.iter().map(|s| Box::from(*s)).collect()
}

async fn create_test_adapter() -> (MetaAdapterSqlite, TempDir) {
	let temp_dir = TempDir::new().expect("Failed to create temp directory");
	let adapter = MetaAdapterSqlite::new(temp_dir.path().join("signon.db"))
		.await
		.expect("Failed to create adapter");
	(adapter, temp_dir)
}

fn sample_info() -> IdentityInfo {
	let mut info = IdentityInfo::new();
	info.caption = "mail account".into();
	info.username = Some("alice".into());
	info.store_secret = true;
	info.typ = CredentialsType::Web;
	info.methods.insert("oauth2".into(), vec!["web_server".into(), "user_agent".into()]);
	info.methods.insert("password".into(), vec![]);
	info.realms = vec!["example.org".into()];
	info.access_control_list = vec!["tok-a".into(), "tok-b".into()];
	info.owner_list = vec!["tok-owner".into()];
	info
}

#[tokio::test]
async fn insert_assigns_monotonic_ids() {
	let (adapter, _temp) = create_test_adapter().await;

	let first = adapter.insert_identity(&sample_info()).await.expect("insert");
	let second = adapter.insert_identity(&sample_info()).await.expect("insert");

	assert!(first.0 > 0);
	assert!(second.0 > first.0);
}

#[tokio::test]
async fn read_returns_stored_fields() {
	let (adapter, _temp) = create_test_adapter().await;
	let info = sample_info();
	let id = adapter.insert_identity(&info).await.expect("insert");

	let stored = adapter.read_identity(id).await.expect("read").expect("present");
	assert_eq!(stored.id, id);
	assert_eq!(&*stored.caption, "mail account");
	assert_eq!(stored.username.as_deref(), Some("alice"));
	assert!(stored.store_secret);
	assert_eq!(stored.typ, CredentialsType::Web);
	assert_eq!(stored.realms, info.realms);

	let mut acl = stored.access_control_list.clone();
	acl.sort();
	assert_eq!(acl, boxed(&["tok-a", "tok-b"]));
	assert_eq!(stored.owner_list, boxed(&["tok-owner"]));

	let oauth = stored.methods.get("oauth2").expect("oauth2 method");
	let mut oauth = oauth.clone();
	oauth.sort();
	assert_eq!(oauth, boxed(&["user_agent", "web_server"]));
	assert!(stored.methods.get("password").expect("password method").is_empty());
}

#[tokio::test]
async fn secret_username_stays_out_of_metadata() {
	let (adapter, _temp) = create_test_adapter().await;
	let mut info = sample_info();
	info.username_is_secret = true;

	let id = adapter.insert_identity(&info).await.expect("insert");
	let stored = adapter.read_identity(id).await.expect("read").expect("present");

	assert!(stored.username_is_secret);
	assert_eq!(stored.username, None);
}

#[tokio::test]
async fn update_replaces_child_rows() {
	let (adapter, _temp) = create_test_adapter().await;
	let mut info = sample_info();
	let id = adapter.insert_identity(&info).await.expect("insert");

	info.id = id;
	info.caption = "renamed".into();
	info.realms = vec!["other.org".into()];
	info.access_control_list = vec!["*".into()];
	adapter.update_identity(&info).await.expect("update");

	let stored = adapter.read_identity(id).await.expect("read").expect("present");
	assert_eq!(&*stored.caption, "renamed");
	assert_eq!(stored.realms, boxed(&["other.org"]));
	assert_eq!(stored.access_control_list, boxed(&["*"]));
}

#[tokio::test]
async fn remove_cascades_to_children() {
	let (adapter, _temp) = create_test_adapter().await;
	let id = adapter.insert_identity(&sample_info()).await.expect("insert");
	adapter.add_reference(id, "tok-a", "keep-me").await.expect("add ref");

	assert!(adapter.remove_identity(id).await.expect("remove"));
	assert_eq!(adapter.read_identity(id).await.expect("read"), None);
	assert!(adapter.acl_tokens(id).await.expect("acl").is_empty());
	assert!(adapter.owner_tokens(id).await.expect("owner").is_empty());
	assert!(adapter.references(id, None).await.expect("refs").is_empty());

	// A second remove finds nothing.
	assert!(!adapter.remove_identity(id).await.expect("remove again"));
}

#[tokio::test]
async fn method_catalog_is_lazy_and_stable() {
	let (adapter, _temp) = create_test_adapter().await;

	assert_eq!(adapter.method_id("sasl").await.expect("lookup"), None);
	let id = adapter.insert_method("sasl").await.expect("insert");
	assert_eq!(adapter.method_id("sasl").await.expect("lookup"), Some(id));
	// Inserting the same name again returns the existing id.
	assert_eq!(adapter.insert_method("sasl").await.expect("insert again"), id);
}

#[tokio::test]
async fn references_count_and_filter() {
	let (adapter, _temp) = create_test_adapter().await;
	let id = adapter.insert_identity(&sample_info()).await.expect("insert");

	adapter.add_reference(id, "tok-a", "ref-1").await.expect("add");
	adapter.add_reference(id, "tok-a", "ref-2").await.expect("add");
	adapter.add_reference(id, "tok-b", "ref-3").await.expect("add");

	let stored = adapter.read_identity(id).await.expect("read").expect("present");
	assert_eq!(stored.ref_count, 3);

	let for_a = adapter.references(id, Some("tok-a")).await.expect("refs");
	assert_eq!(for_a.len(), 2);

	assert!(adapter.remove_reference(id, "tok-a", Some("ref-1")).await.expect("remove"));
	assert!(!adapter.remove_reference(id, "tok-a", Some("ref-1")).await.expect("remove again"));
	assert!(adapter.remove_reference(id, "tok-a", None).await.expect("remove all"));
	assert_eq!(adapter.references(id, Some("tok-a")).await.expect("refs").len(), 0);
}

#[tokio::test]
async fn list_returns_all_identities() {
	let (adapter, _temp) = create_test_adapter().await;
	adapter.insert_identity(&sample_info()).await.expect("insert");
	adapter.insert_identity(&sample_info()).await.expect("insert");

	let all = adapter.list_identities(&HashMap::new()).await.expect("list");
	assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn clear_empties_every_table() {
	let (adapter, _temp) = create_test_adapter().await;
	let id = adapter.insert_identity(&sample_info()).await.expect("insert");
	adapter.add_reference(id, "tok-a", "r").await.expect("add");

	adapter.clear().await.expect("clear");
	assert!(adapter.list_identities(&HashMap::new()).await.expect("list").is_empty());
	assert_eq!(adapter.method_id("oauth2").await.expect("lookup"), None);
}

#[tokio::test]
async fn reopen_preserves_rows() {
	let temp_dir = TempDir::new().expect("tempdir");
	let path = temp_dir.path().join("signon.db");

	let adapter = MetaAdapterSqlite::new(&path).await.expect("create");
	let id = adapter.insert_identity(&sample_info()).await.expect("insert");
	drop(adapter);

	let adapter = MetaAdapterSqlite::new(&path).await.expect("reopen");
	let stored = adapter.read_identity(id).await.expect("read").expect("present");
	assert_eq!(&*stored.caption, "mail account");
	assert_ne!(stored.id, IdentityId::NEW);
}
