//! Session core tests: FIFO ordering, cancellation, parameter merging,
//! result commits, UI round trips and plugin error mapping.

mod common;

use std::sync::Arc;
use std::time::Duration;

use signon_types::error::Error;
use signon_types::types::{
	IdentityId, IdentityInfo, SessionData, KEY_ACCESS_CONTROL_TOKENS, KEY_SECRET, KEY_UI_POLICY,
	KEY_USERNAME,
};
use signond::session::AuthSession;

fn boxed(items: &[&str]) -> Vec<Box<str>> {
	items.iter().map(|s| Box::from(*s)).collect()
}

fn params(action: &str) -> SessionData {
	let mut params = SessionData::new();
	if !action.is_empty() {
		params.insert("TestAction".into(), action.into());
	}
	params
}

fn stored_info(validated: bool) -> IdentityInfo {
	let mut info = IdentityInfo::new();
	info.caption = "acct".into();
	info.username = Some("alice".into());
	info.secret = Some("stored-pw".into());
	info.store_secret = true;
	info.validated = validated;
	info.methods.insert("test".into(), vec!["PLAIN".into(), "LOGIN".into()]);
	info.access_control_list = vec!["*".into()];
	info
}

async fn session_for(env: &common::TestEnv, id: IdentityId) -> Arc<AuthSession> {
	AuthSession::new("/AuthSession/1", id, "test", env.deps(), Duration::from_secs(300))
}

#[tokio::test]
async fn echo_process_round_trip() {
	let env = common::open_env().await;
	let session = session_for(&env, IdentityId::NEW).await;

	let result = session
		.process(common::peer(), params(""), "PLAIN", "key-1")
		.await
		.expect("process");
	assert!(result.contains_key("TestAction") || result.is_empty());
}

#[tokio::test]
async fn stored_identity_parameters_are_merged() {
	let env = common::open_env().await;
	let id = env.storage.db.insert_credentials(&stored_info(true)).await.expect("insert");

	// A stored per-method blob; the caller's keys must win over it.
	let mut blob = SessionData::new();
	blob.insert("RefreshToken".into(), "from-store".into());
	blob.insert("CallerWins".into(), "from-store".into());
	env.storage.db.store_data(id, "test", &blob).await.expect("store blob");

	let session = session_for(&env, id).await;
	let mut caller = params("");
	caller.insert("CallerWins".into(), "from-caller".into());
	let result =
		session.process(common::peer(), caller, "PLAIN", "key-1").await.expect("process");

	// The fake plugin echoes its parameters back.
	assert_eq!(result.get(KEY_USERNAME).and_then(|v| v.as_str()), Some("alice"));
	assert_eq!(result.get("RefreshToken").and_then(|v| v.as_str()), Some("from-store"));
	assert_eq!(result.get("CallerWins").and_then(|v| v.as_str()), Some("from-caller"));
	assert!(result.get(KEY_ACCESS_CONTROL_TOKENS).is_some());
	// Secret stripped from replies of non-password methods.
	assert!(!result.contains_key(KEY_SECRET));
}

#[tokio::test]
async fn request_password_policy_strips_secret() {
	let env = common::open_env().await;
	let id = env.storage.db.insert_credentials(&stored_info(true)).await.expect("insert");
	let session = session_for(&env, id).await;

	let mut caller = params("");
	caller.insert(KEY_UI_POLICY.into(), 1.into());
	let result =
		session.process(common::peer(), caller, "PLAIN", "key-1").await.expect("process");
	// The plugin echoed what it got: no secret was in there.
	assert!(!result.contains_key(KEY_SECRET));
}

#[tokio::test]
async fn fifo_order_and_queued_cancel() {
	let env = common::open_env().await;
	let session = session_for(&env, IdentityId::NEW).await;

	let s1 = Arc::clone(&session);
	let q1 = tokio::spawn(async move {
		s1.process(common::peer(), params("wait"), "PLAIN", "key-1").await
	});
	// Give Q1 time to reach the plugin.
	tokio::time::sleep(Duration::from_millis(50)).await;

	let s2 = Arc::clone(&session);
	let q2 = tokio::spawn(async move {
		s2.process(common::peer(), params(""), "PLAIN", "key-2").await
	});
	tokio::time::sleep(Duration::from_millis(50)).await;

	// Cancel the queued (not active) request: it leaves immediately.
	session.cancel("key-2").await.expect("cancel");
	let q2_result = tokio::time::timeout(Duration::from_secs(1), q2)
		.await
		.expect("q2 resolved")
		.expect("q2 task");
	assert_eq!(q2_result, Err(Error::SessionCanceled));

	// Q1 is unaffected and completes once the plugin is released.
	env.plugins.release();
	let q1_result = tokio::time::timeout(Duration::from_secs(1), q1)
		.await
		.expect("q1 resolved")
		.expect("q1 task");
	assert!(q1_result.is_ok());
}

#[tokio::test]
async fn active_cancel_reaches_the_plugin() {
	let env = common::open_env().await;
	let session = session_for(&env, IdentityId::NEW).await;

	let s1 = Arc::clone(&session);
	let q1 = tokio::spawn(async move {
		s1.process(common::peer(), params("wait"), "PLAIN", "key-1").await
	});
	tokio::time::sleep(Duration::from_millis(50)).await;

	session.cancel("key-1").await.expect("cancel");
	let q1_result = tokio::time::timeout(Duration::from_secs(1), q1)
		.await
		.expect("q1 resolved")
		.expect("q1 task");
	assert_eq!(q1_result, Err(Error::SessionCanceled));

	// The queue advances normally afterwards.
	let result = session
		.process(common::peer(), params(""), "PLAIN", "key-3")
		.await
		.expect("process after cancel");
	assert!(result.is_empty() || result.contains_key("TestAction"));
}

#[tokio::test]
async fn duplicate_cancel_key_is_wrong_state() {
	let env = common::open_env().await;
	let session = session_for(&env, IdentityId::NEW).await;

	let s1 = Arc::clone(&session);
	let q1 = tokio::spawn(async move {
		s1.process(common::peer(), params("wait"), "PLAIN", "key-1").await
	});
	tokio::time::sleep(Duration::from_millis(50)).await;

	let overlapping =
		session.process(common::peer(), params(""), "PLAIN", "key-1").await;
	assert_eq!(overlapping, Err(Error::WrongState));

	env.plugins.release();
	let _ = q1.await;
}

#[tokio::test]
async fn plugin_error_maps_to_canonical_kind() {
	let env = common::open_env().await;
	let session = session_for(&env, IdentityId::NEW).await;

	let result = session
		.process(common::peer(), params("error:311"), "PLAIN", "key-1")
		.await;
	assert_eq!(result, Err(Error::SessionCanceled));

	// State is back to idle; the next process starts normally.
	let result = session
		.process(common::peer(), params(""), "PLAIN", "key-2")
		.await;
	assert!(result.is_ok());
}

#[tokio::test]
async fn user_range_error_keeps_code_and_message() {
	let env = common::open_env().await;
	let session = session_for(&env, IdentityId::NEW).await;

	let result = session
		.process(common::peer(), params("error:450"), "PLAIN", "key-1")
		.await;
	assert_eq!(result, Err(Error::User(450, "scripted".into())));
}

#[tokio::test]
async fn successful_result_commits_and_validates() {
	let env = common::open_env().await;
	let id = env.storage.db.insert_credentials(&stored_info(false)).await.expect("insert");
	let session = session_for(&env, id).await;

	let mut caller = params("");
	caller.insert(KEY_USERNAME.into(), "fresh-user".into());
	caller.insert(KEY_SECRET.into(), "fresh-pw".into());
	session.process(common::peer(), caller, "PLAIN", "key-1").await.expect("process");

	// Commit may land just after the reply; poll briefly.
	let mut committed = None;
	for _ in 0..20 {
		let info = env
			.storage
			.db
			.credentials(id, true)
			.await
			.expect("read")
			.expect("present");
		if info.validated {
			committed = Some(info);
			break;
		}
		tokio::time::sleep(Duration::from_millis(25)).await;
	}
	let info = committed.expect("identity validated after result");
	// Not validated before, so the fresh username was committed.
	assert_eq!(info.username.as_deref(), Some("fresh-user"));
	assert_eq!(info.secret.as_deref(), Some("fresh-pw"));
}

#[tokio::test]
async fn validated_identity_keeps_its_username() {
	let env = common::open_env().await;
	let id = env.storage.db.insert_credentials(&stored_info(true)).await.expect("insert");
	let session = session_for(&env, id).await;

	let mut caller = params("");
	caller.insert(KEY_USERNAME.into(), "imposter".into());
	session.process(common::peer(), caller, "PLAIN", "key-1").await.expect("process");

	tokio::time::sleep(Duration::from_millis(100)).await;
	let info = env.storage.db.credentials(id, true).await.expect("read").expect("present");
	// The dispatch overrode the username with the stored one, and the
	// commit never rewrites a validated identity's username.
	assert_eq!(info.username.as_deref(), Some("alice"));
}

#[tokio::test]
async fn store_frames_are_filtered_and_persisted() {
	let env = common::open_env().await;
	let id = env.storage.db.insert_credentials(&stored_info(true)).await.expect("insert");
	let session = session_for(&env, id).await;

	session.process(common::peer(), params("store"), "PLAIN", "key-1").await.expect("process");

	let mut blob = SessionData::new();
	for _ in 0..20 {
		blob = env.storage.db.load_data(id, "test").await.expect("load");
		if !blob.is_empty() {
			break;
		}
		tokio::time::sleep(Duration::from_millis(25)).await;
	}
	assert_eq!(blob.get("RefreshToken").and_then(|v| v.as_str()), Some("tok-123"));
	// Secret material never lands in the blob store.
	assert!(!blob.contains_key("Secret"));
	assert!(!blob.contains_key("UserName"));
}

#[tokio::test]
async fn ui_round_trip_feeds_reply_into_plugin() {
	let env = common::open_env().await;
	let id = env.storage.db.insert_credentials(&stored_info(true)).await.expect("insert");

	let mut ui_reply = SessionData::new();
	ui_reply.insert("Secret".into(), "typed-pw".into());
	env.ui.push_reply(ui_reply);

	let session = session_for(&env, id).await;
	let result = session
		.process(common::peer(), params("ui"), "PLAIN", "key-1")
		.await
		.expect("process");

	// The fake plugin answers process_ui with the dialog reply; the
	// session strips the secret for non-password methods.
	assert!(!result.contains_key("Secret"));

	let queries = env.ui.queries.lock().expect("queries");
	assert_eq!(queries.len(), 1);
	let query = &queries[0];
	assert_eq!(query.get("Method").and_then(|v| v.as_str()), Some("test"));
	assert_eq!(query.get("Mechanism").and_then(|v| v.as_str()), Some("PLAIN"));
	assert_eq!(query.get("StoredIdentity").and_then(serde_json::Value::as_bool), Some(true));
	assert!(query.get("RequestId").is_some());
	assert!(query.get("ClientData").is_some());
}

#[tokio::test]
async fn canceled_ui_dialog_cancels_the_request() {
	let env = common::open_env().await;
	let id = env.storage.db.insert_credentials(&stored_info(true)).await.expect("insert");

	let mut ui_reply = SessionData::new();
	ui_reply.insert("QueryErrorCode".into(), 4.into());
	env.ui.push_reply(ui_reply);

	let session = session_for(&env, id).await;
	let result = session.process(common::peer(), params("ui"), "PLAIN", "key-1").await;
	assert_eq!(result, Err(Error::SessionCanceled));
}

#[tokio::test]
async fn mechanism_outside_catalog_is_rejected() {
	let env = common::open_env().await;
	let id = env.storage.db.insert_credentials(&stored_info(true)).await.expect("insert");
	let session = session_for(&env, id).await;

	let result = session
		.process(common::peer(), params(""), "GSSAPI", "key-1")
		.await;
	assert_eq!(result, Err(Error::MethodOrMechanismNotAllowed));
}

#[tokio::test]
async fn query_mechanisms_intersects_with_wanted() {
	let env = common::open_env().await;
	let session = session_for(&env, IdentityId::NEW).await;

	let all = session.query_available_mechanisms(vec![]).await.expect("query");
	assert_eq!(all, boxed(&["PLAIN", "LOGIN"]));

	let filtered = session
		.query_available_mechanisms(vec!["LOGIN".into(), "GSSAPI".into()])
		.await
		.expect("query");
	assert_eq!(filtered, boxed(&["LOGIN"]));
}

#[tokio::test]
async fn state_events_are_relayed() {
	let env = common::open_env().await;
	let session = session_for(&env, IdentityId::NEW).await;
	let mut events = session.subscribe();

	session.process(common::peer(), params(""), "PLAIN", "key-1").await.expect("process");

	// The fake plugin emits state 4 (waiting for reply) before the
	// result; the engine adds its own lifecycle states around it.
	let mut seen = Vec::new();
	while let Ok(Ok(event)) =
		tokio::time::timeout(Duration::from_millis(200), events.recv()).await
	{
		seen.push(event.state);
	}
	assert!(seen.contains(&4), "plugin state missing from {:?}", seen);
	assert!(seen.contains(&8), "session-started state missing from {:?}", seen);
}
