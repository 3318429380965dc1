//! Shared test fixtures: sqlite-backed storage in a temp dir, a scripted
//! plugin factory speaking the real framed protocol over in-memory pipes,
//! a scripted UI service and a deterministic access-control policy.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use signon_meta_adapter_sqlite::MetaAdapterSqlite;
use signon_secrets_adapter_sqlite::SecretsAdapterSqlite;
use signon_types::access_control::{
	AccessControlAdapter, AccessReply, AccessRequest, Peer, PermissiveAccessControl,
};
use signon_types::error::{Error, SsoResult};
use signon_types::plugin::{PluginRequest, PluginResponse};
use signon_types::types::SessionData;
use signon_types::ui::{UiAdapter, QUERY_ERROR_NO_SIGNONUI, UI_KEY_ERROR, UI_KEY_REQUEST_ID};

use signond::access_control::AccessControl;
use signond::session::core::SessionDeps;
use signond::session::{PluginFactory, PluginProxy};
use signond::storage::CredentialsDb;

pub fn peer() -> Peer {
	Peer { pid: 100, uid: 1000 }
}

/// Storage stack over real sqlite files in a temp dir, secrets tier open.
pub struct TestStorage {
	pub db: Arc<CredentialsDb>,
	pub _tmp: TempDir,
}

pub async fn open_storage() -> TestStorage {
	let tmp = TempDir::new().expect("tempdir");
	let meta = MetaAdapterSqlite::new(tmp.path().join("signon.db")).await.expect("meta db");
	let secrets = SecretsAdapterSqlite::new(tmp.path().join("signon-secrets.db"))
		.await
		.expect("secrets db");
	let db = Arc::new(CredentialsDb::new(Arc::new(meta)));
	db.open_secrets(Arc::new(secrets)).await;
	TestStorage { db, _tmp: tmp }
}

/// Storage stack with the secrets tier still closed; the adapter is
/// returned for a later `open_secrets`.
pub async fn closed_storage() -> (TestStorage, Arc<SecretsAdapterSqlite>) {
	let tmp = TempDir::new().expect("tempdir");
	let meta = MetaAdapterSqlite::new(tmp.path().join("signon.db")).await.expect("meta db");
	let secrets = SecretsAdapterSqlite::new(tmp.path().join("signon-secrets.db"))
		.await
		.expect("secrets db");
	let db = Arc::new(CredentialsDb::new(Arc::new(meta)));
	(TestStorage { db, _tmp: tmp }, Arc::new(secrets))
}

/// Scripted UI service: replies are popped in order, queries and cancels
/// are recorded for assertions.
#[derive(Debug, Default)]
pub struct FakeUi {
	pub replies: Mutex<VecDeque<SessionData>>,
	pub queries: Mutex<Vec<SessionData>>,
	pub cancels: Mutex<Vec<String>>,
}

impl FakeUi {
	pub fn push_reply(&self, reply: SessionData) {
		self.replies.lock().expect("replies").push_back(reply);
	}
}

#[async_trait]
impl UiAdapter for FakeUi {
	async fn query_dialog(&self, params: SessionData) -> SsoResult<SessionData> {
		let request_id = params
			.get(UI_KEY_REQUEST_ID)
			.and_then(|v| v.as_str())
			.unwrap_or_default()
			.to_owned();
		self.queries.lock().expect("queries").push(params);
		match self.replies.lock().expect("replies").pop_front() {
			Some(mut reply) => {
				reply.entry(UI_KEY_REQUEST_ID.to_owned()).or_insert(request_id.into());
				Ok(reply)
			}
			None => {
				let mut reply = SessionData::new();
				reply.insert(UI_KEY_ERROR.into(), QUERY_ERROR_NO_SIGNONUI.into());
				Ok(reply)
			}
		}
	}

	async fn refresh_dialog(&self, params: SessionData) -> SsoResult<SessionData> {
		self.query_dialog(params).await
	}

	async fn cancel_ui_request(&self, request_id: &str) -> SsoResult<()> {
		self.cancels.lock().expect("cancels").push(request_id.to_owned());
		Ok(())
	}
}

/// Plugin factory whose workers are in-process tasks speaking the real
/// length-delimited protocol. Behavior is driven by the `TestAction` key
/// of the process parameters:
///
/// - `"wait"`: hold the result until [`FakePluginFactory::release`]
/// - `"ui"`: raise a ui_request, then echo the dialog reply as result
/// - `"store"`: emit a store frame, then a result
/// - `"error:<code>"`: fail with the given error code
/// - anything else: echo the parameters as the result
#[derive(Debug)]
pub struct FakePluginFactory {
	pub mechanisms: Vec<Box<str>>,
	pub gate: Arc<Notify>,
}

impl FakePluginFactory {
	pub fn new(mechanisms: Vec<Box<str>>) -> Self {
		FakePluginFactory { mechanisms, gate: Arc::new(Notify::new()) }
	}

	/// Releases one worker blocked in a `"wait"` process.
	pub fn release(&self) {
		self.gate.notify_one();
	}
}

#[async_trait]
impl PluginFactory for FakePluginFactory {
	async fn launch(
		&self,
		method: &str,
		generation: u64,
		events: signond::session::plugin_proxy::ProxyEventSender,
	) -> SsoResult<PluginProxy> {
		if method == "missing" {
			return Err(Error::MethodNotKnown);
		}
		let (daemon_side, plugin_side) = tokio::io::duplex(64 * 1024);
		let (read_half, write_half) = tokio::io::split(daemon_side);
		let proxy = PluginProxy::from_streams(read_half, write_half, generation, events);
		tokio::spawn(fake_plugin(plugin_side, self.mechanisms.clone(), Arc::clone(&self.gate)));
		Ok(proxy)
	}

	async fn methods(&self) -> SsoResult<Vec<Box<str>>> {
		Ok(vec!["test".into(), "password".into()])
	}

	async fn mechanisms(&self, method: &str) -> SsoResult<Vec<Box<str>>> {
		if method == "missing" {
			return Err(Error::MethodNotKnown);
		}
		Ok(self.mechanisms.clone())
	}
}

async fn send_frame(
	sink: &mut FramedWrite<tokio::io::WriteHalf<tokio::io::DuplexStream>, LengthDelimitedCodec>,
	response: &PluginResponse,
) -> bool {
	let Ok(encoded) = serde_json::to_vec(response) else { return false };
	sink.send(Bytes::from(encoded)).await.is_ok()
}

async fn fake_plugin(
	stream: tokio::io::DuplexStream,
	mechanisms: Vec<Box<str>>,
	gate: Arc<Notify>,
) {
	let (read_half, write_half) = tokio::io::split(stream);
	let mut source = FramedRead::new(read_half, LengthDelimitedCodec::new());
	let mut sink = FramedWrite::new(write_half, LengthDelimitedCodec::new());

	while let Some(Ok(frame)) = source.next().await {
		let Ok(request) = serde_json::from_slice::<PluginRequest>(&frame) else { return };
		match request {
			PluginRequest::Type => {
				if !send_frame(&mut sink, &PluginResponse::TypeReply { method: "test".into() })
					.await
				{
					return;
				}
			}
			PluginRequest::Mechanisms => {
				let reply = PluginResponse::MechanismsReply { mechanisms: mechanisms.clone() };
				if !send_frame(&mut sink, &reply).await {
					return;
				}
			}
			PluginRequest::Cancel => {
				let reply = PluginResponse::Error {
					code: Error::SessionCanceled.code(),
					message: "canceled".into(),
				};
				if !send_frame(&mut sink, &reply).await {
					return;
				}
			}
			PluginRequest::ProcessUi { data } | PluginRequest::ProcessRefresh { data } => {
				if !send_frame(&mut sink, &PluginResponse::Result { data }).await {
					return;
				}
			}
			PluginRequest::Process { params, .. } => {
				let action = params
					.get("TestAction")
					.and_then(|v| v.as_str())
					.unwrap_or_default()
					.to_owned();
				if action == "wait" {
					// Hold the result; a cancel may overtake it.
					let canceled = tokio::select! {
						() = gate.notified() => false,
						next = source.next() => match next {
							Some(Ok(frame)) => matches!(
								serde_json::from_slice::<PluginRequest>(&frame),
								Ok(PluginRequest::Cancel)
							),
							_ => return,
						},
					};
					let reply = if canceled {
						PluginResponse::Error {
							code: Error::SessionCanceled.code(),
							message: "canceled".into(),
						}
					} else {
						PluginResponse::Result { data: params }
					};
					if !send_frame(&mut sink, &reply).await {
						return;
					}
				} else if action == "ui" {
					let mut request = SessionData::new();
					request.insert("QueryPassword".into(), true.into());
					if !send_frame(&mut sink, &PluginResponse::UiRequest { data: request }).await
					{
						return;
					}
				} else if action == "store" {
					let mut blob = SessionData::new();
					blob.insert("RefreshToken".into(), "tok-123".into());
					blob.insert("Secret".into(), "must-not-persist".into());
					blob.insert("UserName".into(), "must-not-persist".into());
					if !send_frame(&mut sink, &PluginResponse::Store { data: blob }).await {
						return;
					}
					if !send_frame(&mut sink, &PluginResponse::Result { data: params }).await {
						return;
					}
				} else if let Some(code) = action.strip_prefix("error:") {
					let code = code.parse().unwrap_or(1);
					let reply = PluginResponse::Error { code, message: "scripted".into() };
					if !send_frame(&mut sink, &reply).await {
						return;
					}
				} else {
					let state = PluginResponse::StateChanged {
						state: 4,
						message: "waiting for reply".into(),
					};
					if !send_frame(&mut sink, &state).await {
						return;
					}
					if !send_frame(&mut sink, &PluginResponse::Result { data: params }).await {
						return;
					}
				}
			}
		}
	}
}

/// Policy where a peer's app id is `app:<uid>` and a token is held only
/// when it equals that app id. The keychain widget is uid 7777.
#[derive(Debug, Default)]
pub struct MappedAccessControl;

#[async_trait]
impl AccessControlAdapter for MappedAccessControl {
	async fn app_id_of_peer(&self, peer: &Peer) -> Box<str> {
		if peer.uid == 7777 {
			"signon-keychain".into()
		} else {
			format!("app:{}", peer.uid).into()
		}
	}

	async fn is_peer_allowed_to_access(&self, peer: &Peer, token: &str) -> bool {
		token == format!("app:{}", peer.uid) || (peer.uid == 7777 && token == "signon-keychain")
	}

	fn keychain_widget_app_id(&self) -> Box<str> {
		"signon-keychain".into()
	}

	async fn handle_request(&self, _request: AccessRequest) -> AccessReply {
		AccessReply::Denied
	}
}

pub struct TestEnv {
	pub storage: TestStorage,
	pub gate: Arc<AccessControl>,
	pub ui: Arc<FakeUi>,
	pub plugins: Arc<FakePluginFactory>,
}

impl TestEnv {
	pub fn deps(&self) -> SessionDeps {
		SessionDeps {
			db: Arc::clone(&self.storage.db),
			gate: Arc::clone(&self.gate),
			ui: Arc::clone(&self.ui) as Arc<dyn UiAdapter>,
			plugins: Arc::clone(&self.plugins) as Arc<dyn PluginFactory>,
		}
	}
}

pub async fn open_env() -> TestEnv {
	let storage = open_storage().await;
	let gate = Arc::new(AccessControl::new(
		Arc::new(PermissiveAccessControl),
		Arc::clone(&storage.db),
	));
	TestEnv {
		storage,
		gate,
		ui: Arc::new(FakeUi::default()),
		plugins: Arc::new(FakePluginFactory::new(vec!["PLAIN".into(), "LOGIN".into()])),
	}
}

// vim: ts=4
