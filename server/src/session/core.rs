//! Per-(identity, method) authentication session core.
//!
//! Each session runs as one actor task owning a FIFO of `process`
//! requests. Exactly one request is active at a time; the active entry
//! stays at the head of the queue until the plugin acknowledges it (also
//! after a cancel, so late plugin frames stay attributable). UI dialogs
//! and plugin frames arrive as events on the same loop, which makes the
//! whole conversation totally ordered without locks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};

use signon_types::access_control::Peer;
use signon_types::plugin::{PluginRequest, PluginResponse};
use signon_types::types::{ui_policy, SessionState, KEY_ACCESS_CONTROL_TOKENS, KEY_SECRET, KEY_UI_POLICY, KEY_USERNAME};
use signon_types::ui::{
	self, query_error, UiAdapter, QUERY_ERROR_CANCELED, QUERY_ERROR_FORGOT_PASSWORD,
	QUERY_ERROR_NONE, QUERY_ERROR_NO_SIGNONUI,
};

use crate::access_control::AccessControl;
use crate::disposable::Disposable;
use crate::prelude::*;
use crate::session::plugin_proxy::{PluginFactory, PluginProxy, ProxyEvent, ProxyEventSender};
use crate::storage::CredentialsDb;

/// The one method whose plugins may see their secret echoed back in the
/// result map; every other method gets the secret stripped from replies.
const PASSWORD_METHOD: &str = "password";

/// Everything a session needs from the daemon.
#[derive(Clone)]
pub struct SessionDeps {
	pub db: Arc<CredentialsDb>,
	pub gate: Arc<AccessControl>,
	pub ui: Arc<dyn UiAdapter>,
	pub plugins: Arc<dyn PluginFactory>,
}

impl std::fmt::Debug for SessionDeps {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SessionDeps").finish()
	}
}

#[derive(Debug)]
pub enum SessionCommand {
	Process {
		peer: Peer,
		params: SessionData,
		mechanism: Box<str>,
		cancel_key: Box<str>,
		reply: oneshot::Sender<SsoResult<SessionData>>,
	},
	Cancel {
		cancel_key: Box<str>,
	},
	QueryMechanisms {
		wanted: Vec<Box<str>>,
		reply: oneshot::Sender<SsoResult<Vec<Box<str>>>>,
	},
	SetId {
		id: IdentityId,
	},
	Unref,
	Shutdown,
}

/// `state_changed` payload relayed to every client handle of the session.
#[derive(Debug, Clone)]
pub struct SessionSignal {
	pub state: i32,
	pub message: String,
}

/// Server-side auth session object: the handle the IPC layer talks to.
/// The actual engine runs in the actor task behind the command channel.
pub struct AuthSession {
	path: Box<str>,
	method: Box<str>,
	commands: mpsc::Sender<SessionCommand>,
	signals: broadcast::Sender<SessionSignal>,
	last_used: Arc<Mutex<Instant>>,
	busy: Arc<AtomicBool>,
	max_inactivity: Duration,
	on_dispose: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl std::fmt::Debug for AuthSession {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("AuthSession").field("path", &self.path).finish()
	}
}

impl AuthSession {
	pub fn new(
		path: impl Into<Box<str>>,
		id: IdentityId,
		method: impl Into<Box<str>>,
		deps: SessionDeps,
		max_inactivity: Duration,
	) -> Arc<Self> {
		let method = method.into();
		let (commands, cmd_rx) = mpsc::channel(32);
		let (signals, _) = broadcast::channel(32);
		let (proxy_tx, proxy_rx) = mpsc::channel(32);
		let (ui_tx, ui_rx) = mpsc::channel(8);
		let last_used = Arc::new(Mutex::new(Instant::now()));
		let busy = Arc::new(AtomicBool::new(false));

		let actor = SessionActor {
			id,
			method: method.clone(),
			deps,
			queue: VecDeque::new(),
			request_is_active: false,
			canceled: false,
			query_with_ui: false,
			tmp_username: None,
			tmp_password: None,
			client_data: SessionData::new(),
			plugin: None,
			generation: 0,
			proxy_tx,
			ui_tx,
			ui_request_id: None,
			ui_seq: 0,
			pending_mechanisms: Vec::new(),
			signals: signals.clone(),
			last_used: Arc::clone(&last_used),
			busy: Arc::clone(&busy),
		};
		tokio::spawn(actor.run(cmd_rx, proxy_rx, ui_rx));

		Arc::new(AuthSession {
			path: path.into(),
			method,
			commands,
			signals,
			last_used,
			busy,
			max_inactivity,
			on_dispose: Mutex::new(None),
		})
	}

	pub fn path(&self) -> &str {
		&self.path
	}

	pub fn method(&self) -> &str {
		&self.method
	}

	/// Hook run when the idle sweeper takes the session down; the daemon
	/// uses it to drop its strong references.
	pub fn set_on_dispose(&self, hook: impl FnOnce() + Send + 'static) {
		if let Ok(mut slot) = self.on_dispose.lock() {
			*slot = Some(Box::new(hook));
		}
	}

	pub fn subscribe(&self) -> broadcast::Receiver<SessionSignal> {
		self.signals.subscribe()
	}

	fn touch(&self) {
		if let Ok(mut slot) = self.last_used.lock() {
			*slot = Instant::now();
		}
	}

	pub async fn process(
		&self,
		peer: Peer,
		params: SessionData,
		mechanism: impl Into<Box<str>>,
		cancel_key: impl Into<Box<str>>,
	) -> SsoResult<SessionData> {
		self.touch();
		let (reply, rx) = oneshot::channel();
		self.commands
			.send(SessionCommand::Process {
				peer,
				params,
				mechanism: mechanism.into(),
				cancel_key: cancel_key.into(),
				reply,
			})
			.await
			.map_err(|_| Error::InternalServer)?;
		rx.await.map_err(|_| Error::InternalServer)?
	}

	pub async fn cancel(&self, cancel_key: &str) -> SsoResult<()> {
		self.touch();
		self.commands
			.send(SessionCommand::Cancel { cancel_key: cancel_key.into() })
			.await
			.map_err(|_| Error::InternalServer)
	}

	pub async fn query_available_mechanisms(
		&self,
		wanted: Vec<Box<str>>,
	) -> SsoResult<Vec<Box<str>>> {
		self.touch();
		let (reply, rx) = oneshot::channel();
		self.commands
			.send(SessionCommand::QueryMechanisms { wanted, reply })
			.await
			.map_err(|_| Error::InternalServer)?;
		rx.await.map_err(|_| Error::InternalServer)?
	}

	pub async fn set_id(&self, id: IdentityId) -> SsoResult<()> {
		self.touch();
		self.commands
			.send(SessionCommand::SetId { id })
			.await
			.map_err(|_| Error::InternalServer)
	}

	pub async fn object_unref(&self) {
		let _ = self.commands.send(SessionCommand::Unref).await;
	}
}

impl Disposable for AuthSession {
	fn last_used(&self) -> Instant {
		self.last_used.lock().map(|slot| *slot).unwrap_or_else(|_| Instant::now())
	}

	fn max_inactivity(&self) -> Duration {
		self.max_inactivity
	}

	fn auto_destruct(&self) -> bool {
		!self.busy.load(Ordering::Relaxed)
	}

	fn dispose(&self) {
		let _ = self.commands.try_send(SessionCommand::Shutdown);
		let hook = self.on_dispose.lock().ok().and_then(|mut slot| slot.take());
		if let Some(hook) = hook {
			hook();
		}
	}
}

struct PendingProcess {
	peer: Peer,
	params: SessionData,
	mechanism: Box<str>,
	cancel_key: Box<str>,
	reply: Option<oneshot::Sender<SsoResult<SessionData>>>,
}

struct UiOutcome {
	seq: u64,
	refresh: bool,
	reply: SsoResult<SessionData>,
}

struct SessionActor {
	id: IdentityId,
	method: Box<str>,
	deps: SessionDeps,
	queue: VecDeque<PendingProcess>,
	request_is_active: bool,
	/// Active request was canceled; its reply is already consumed and the
	/// entry waits at the head for the plugin's acknowledgement.
	canceled: bool,
	/// A UI prompt was shown for the active request.
	query_with_ui: bool,
	tmp_username: Option<String>,
	tmp_password: Option<String>,
	client_data: SessionData,
	plugin: Option<PluginProxy>,
	generation: u64,
	proxy_tx: ProxyEventSender,
	ui_tx: mpsc::Sender<UiOutcome>,
	ui_request_id: Option<String>,
	ui_seq: u64,
	pending_mechanisms: Vec<(Vec<Box<str>>, oneshot::Sender<SsoResult<Vec<Box<str>>>>)>,
	signals: broadcast::Sender<SessionSignal>,
	last_used: Arc<Mutex<Instant>>,
	busy: Arc<AtomicBool>,
}

impl SessionActor {
	async fn run(
		mut self,
		mut cmd_rx: mpsc::Receiver<SessionCommand>,
		mut proxy_rx: mpsc::Receiver<(u64, ProxyEvent)>,
		mut ui_rx: mpsc::Receiver<UiOutcome>,
	) {
		loop {
			tokio::select! {
				cmd = cmd_rx.recv() => match cmd {
					None | Some(SessionCommand::Shutdown) => break,
					Some(cmd) => self.handle_command(cmd).await,
				},
				Some((generation, event)) = proxy_rx.recv() => {
					self.handle_plugin_event(generation, event).await;
				}
				Some(outcome) = ui_rx.recv() => self.handle_ui_outcome(outcome).await,
			}
		}

		// Going down: fail whatever is still queued and close any dialog.
		self.cancel_outstanding_ui();
		while let Some(mut entry) = self.queue.pop_front() {
			if let Some(reply) = entry.reply.take() {
				let _ = reply.send(Err(Error::SessionCanceled));
			}
		}
		debug!("session {} for identity {} closed", self.method, self.id);
	}

	fn touch(&self) {
		if let Ok(mut slot) = self.last_used.lock() {
			*slot = Instant::now();
		}
	}

	fn update_busy(&self) {
		self.busy.store(!self.queue.is_empty(), Ordering::Relaxed);
	}

	fn emit_state(&self, state: SessionState, message: &str) {
		let _ = self
			.signals
			.send(SessionSignal { state: state.into(), message: message.to_owned() });
	}

	fn reply_head(&mut self, result: SsoResult<SessionData>) {
		if let Some(reply) = self.queue.front_mut().and_then(|entry| entry.reply.take()) {
			let _ = reply.send(result);
		}
	}

	async fn handle_command(&mut self, cmd: SessionCommand) {
		self.touch();
		match cmd {
			SessionCommand::Process { peer, params, mechanism, cancel_key, reply } => {
				// One in-flight process per client handle.
				if self.queue.iter().any(|entry| entry.cancel_key == cancel_key) {
					let _ = reply.send(Err(Error::WrongState));
					return;
				}
				self.queue.push_back(PendingProcess {
					peer,
					params,
					mechanism,
					cancel_key,
					reply: Some(reply),
				});
				self.update_busy();
				self.emit_state(SessionState::ProcessPending, "process queued");
				if !self.request_is_active {
					self.start_next().await;
				}
			}
			SessionCommand::Cancel { cancel_key } => self.handle_cancel(&cancel_key).await,
			SessionCommand::QueryMechanisms { wanted, reply } => {
				if let Err(err) = self.ensure_plugin().await {
					let _ = reply.send(Err(err));
					return;
				}
				if let Some(plugin) = &self.plugin {
					if plugin.send(PluginRequest::Mechanisms).await.is_err() {
						let _ = reply.send(Err(Error::Runtime));
						return;
					}
				}
				self.pending_mechanisms.push((wanted, reply));
			}
			SessionCommand::SetId { id } => {
				self.id = id;
			}
			SessionCommand::Unref | SessionCommand::Shutdown => {}
		}
	}

	async fn handle_cancel(&mut self, cancel_key: &str) {
		let is_active_head = self.request_is_active
			&& self.queue.front().map(|entry| &*entry.cancel_key == cancel_key).unwrap_or(false);

		if is_active_head {
			if self.canceled {
				return;
			}
			self.canceled = true;
			self.reply_head(Err(Error::SessionCanceled));
			self.cancel_outstanding_ui();
			if let Some(plugin) = &self.plugin {
				let _ = plugin.send(PluginRequest::Cancel).await;
			}
			self.emit_state(SessionState::ProcessCanceling, "canceling");
			// The entry stays at the head until the plugin acknowledges.
			return;
		}

		let queued = self
			.queue
			.iter()
			.enumerate()
			.skip(usize::from(self.request_is_active))
			.find(|(_, entry)| &*entry.cancel_key == cancel_key)
			.map(|(index, _)| index);
		if let Some(index) = queued {
			if let Some(mut entry) = self.queue.remove(index) {
				if let Some(reply) = entry.reply.take() {
					let _ = reply.send(Err(Error::SessionCanceled));
				}
			}
			self.update_busy();
		}
	}

	async fn ensure_plugin(&mut self) -> SsoResult<()> {
		if self.plugin.is_none() {
			self.generation += 1;
			let proxy = self
				.deps
				.plugins
				.launch(&self.method, self.generation, self.proxy_tx.clone())
				.await?;
			self.plugin = Some(proxy);
		}
		Ok(())
	}

	/// Starts queue entries until one is successfully dispatched to the
	/// plugin (or the queue drains).
	async fn start_next(&mut self) {
		loop {
			if self.queue.is_empty() {
				self.request_is_active = false;
				self.update_busy();
				return;
			}
			self.request_is_active = true;
			self.canceled = false;
			self.query_with_ui = false;

			match self.dispatch_head().await {
				Ok(()) => return,
				Err(err) => {
					self.reply_head(Err(err));
					self.queue.pop_front();
					self.request_is_active = false;
					self.update_busy();
				}
			}
		}
	}

	async fn dispatch_head(&mut self) -> SsoResult<()> {
		let (peer, mechanism, mut params) = {
			let Some(head) = self.queue.front() else { return Err(Error::InternalServer) };
			(head.peer.clone(), head.mechanism.clone(), head.params.clone())
		};
		self.client_data = params.clone();

		if !self.id.is_new() {
			let info = self
				.deps
				.db
				.credentials(self.id, true)
				.await
				.map_err(|_| Error::CredentialsNotAvailable)?
				.ok_or(Error::IdentityNotFound)?;

			self.validate_mechanism(&info, &mechanism)?;

			if !params.contains_key(KEY_SECRET) {
				if let Some(secret) = &info.secret {
					params.insert(KEY_SECRET.into(), secret.as_ref().into());
				}
			}
			if info.validated {
				if let Some(username) = &info.username {
					params.insert(KEY_USERNAME.into(), username.as_ref().into());
				}
			}
			let tokens =
				self.deps.gate.tokens_of_peer(&peer, &info.access_control_list).await;
			params.insert(
				KEY_ACCESS_CONTROL_TOKENS.into(),
				serde_json::Value::Array(
					tokens.iter().map(|t| t.as_ref().into()).collect(),
				),
			);

			// Stored blob fills in whatever the caller did not supply.
			if let Ok(blob) = self.deps.db.load_data(self.id, &self.method).await {
				for (key, value) in blob {
					params.entry(key).or_insert(value);
				}
			}
		}

		let policy =
			params.get(KEY_UI_POLICY).and_then(serde_json::Value::as_i64).unwrap_or(ui_policy::DEFAULT);
		if policy == ui_policy::REQUEST_PASSWORD {
			params.remove(KEY_SECRET);
		}

		self.tmp_username =
			params.get(KEY_USERNAME).and_then(|v| v.as_str()).map(ToOwned::to_owned);
		self.tmp_password =
			params.get(KEY_SECRET).and_then(|v| v.as_str()).map(ToOwned::to_owned);

		self.ensure_plugin().await?;
		let Some(plugin) = &self.plugin else { return Err(Error::Runtime) };
		plugin.send(PluginRequest::Process { params, mechanism }).await?;
		self.emit_state(SessionState::SessionStarted, "process started");
		Ok(())
	}

	fn validate_mechanism(&self, info: &IdentityInfo, mechanism: &str) -> SsoResult<()> {
		if info.methods.is_empty() {
			return Ok(());
		}
		let Some(mechanisms) = info.methods.get(&*self.method) else {
			return Err(Error::MethodNotAvailable);
		};
		if !mechanisms.is_empty() && !mechanisms.iter().any(|m| &**m == mechanism) {
			return Err(Error::MethodOrMechanismNotAllowed);
		}
		Ok(())
	}

	async fn handle_plugin_event(&mut self, generation: u64, event: ProxyEvent) {
		if generation != self.generation {
			debug!("dropping event of stale plugin generation {}", generation);
			return;
		}
		self.touch();
		match event {
			ProxyEvent::Frame(PluginResponse::Result { data }) => self.on_result(data).await,
			ProxyEvent::Frame(PluginResponse::Store { data }) => self.on_store(data).await,
			ProxyEvent::Frame(PluginResponse::UiRequest { data }) => {
				self.open_dialog(data, false).await;
			}
			ProxyEvent::Frame(PluginResponse::RefreshRequest { data }) => {
				self.open_dialog(data, true).await;
			}
			ProxyEvent::Frame(PluginResponse::Error { code, message }) => {
				self.on_plugin_error(code, &message).await;
			}
			ProxyEvent::Frame(PluginResponse::StateChanged { state, message }) => {
				let _ = self.signals.send(SessionSignal { state, message });
			}
			ProxyEvent::Frame(PluginResponse::MechanismsReply { mechanisms }) => {
				for (wanted, reply) in self.pending_mechanisms.drain(..) {
					let filtered = if wanted.is_empty() {
						mechanisms.clone()
					} else {
						mechanisms
							.iter()
							.filter(|m| wanted.contains(m))
							.cloned()
							.collect()
					};
					let _ = reply.send(Ok(filtered));
				}
			}
			ProxyEvent::Frame(PluginResponse::TypeReply { method }) => {
				debug!("plugin reports type {}", method);
			}
			ProxyEvent::Exited => self.on_plugin_exit().await,
		}
	}

	async fn on_result(&mut self, data: SessionData) {
		if !self.request_is_active {
			warn!("result frame without active request");
			return;
		}
		let was_canceled = self.canceled;

		if !was_canceled {
			if !self.id.is_new() {
				self.commit_credentials().await;
			}
			let mut filtered = data;
			if &*self.method != PASSWORD_METHOD {
				filtered.remove(KEY_SECRET);
			}
			self.reply_head(Ok(filtered));
		}

		self.finish_active().await;
	}

	/// On a successful result the snapshot taken at dispatch time is
	/// committed: the username only if the identity had not been
	/// validated before, the password if non-empty, and the identity is
	/// marked validated.
	async fn commit_credentials(&mut self) {
		let info = match self.deps.db.credentials(self.id, false).await {
			Ok(Some(info)) => info,
			Ok(None) => return,
			Err(err) => {
				warn!("cannot reload identity {} for result commit: {}", self.id, err);
				return;
			}
		};
		let mut info = info;
		if !info.validated {
			if let Some(username) = &self.tmp_username {
				info.username = Some(username.clone().into_boxed_str());
			}
		}
		if let Some(password) = &self.tmp_password {
			if !password.is_empty() {
				info.secret = Some(password.clone().into_boxed_str());
			}
		}
		info.validated = true;
		if let Err(err) = self.deps.db.update_credentials(&info).await {
			warn!("result commit for identity {} failed: {}", self.id, err);
		}
	}

	async fn on_store(&mut self, mut data: SessionData) {
		if self.id.is_new() {
			// Nothing to attach the blob to; dropped on purpose.
			return;
		}
		data.remove(KEY_SECRET);
		data.remove(KEY_USERNAME);
		data.remove(KEY_ACCESS_CONTROL_TOKENS);
		if let Err(err) = self.deps.db.store_data(self.id, &self.method, &data).await {
			if self.query_with_ui {
				debug!("store from plugin deferred past UI prompt failed: {}", err);
			} else {
				warn!("store from plugin failed: {}", err);
			}
		}
	}

	async fn open_dialog(&mut self, data: SessionData, refresh: bool) {
		if !self.request_is_active {
			warn!("ui request without active request");
			return;
		}
		let mechanism = self
			.queue
			.front()
			.map(|entry| entry.mechanism.clone())
			.unwrap_or_default();

		let request_id = uuid::Uuid::new_v4().to_string();
		let mut params = data;
		params.insert(ui::UI_KEY_REQUEST_ID.into(), request_id.clone().into());
		params.insert(ui::UI_KEY_IDENTITY.into(), self.id.0.into());
		params.insert(ui::UI_KEY_METHOD.into(), self.method.as_ref().into());
		params.insert(ui::UI_KEY_MECHANISM.into(), mechanism.as_ref().into());
		params.insert(ui::UI_KEY_STORED_IDENTITY.into(), (!self.id.is_new()).into());
		params.insert(
			ui::UI_KEY_CLIENT_DATA.into(),
			serde_json::Value::Object(self.client_data.clone()),
		);
		if !self.deps.db.is_secrets_open().await {
			params.insert(ui::UI_KEY_STORAGE_KEYS_UNAVAILABLE.into(), true.into());
		}

		self.query_with_ui = true;
		self.ui_request_id = Some(request_id);
		self.ui_seq += 1;
		let seq = self.ui_seq;
		let ui_service = Arc::clone(&self.deps.ui);
		let outcome_tx = self.ui_tx.clone();
		tokio::spawn(async move {
			let reply = if refresh {
				ui_service.refresh_dialog(params).await
			} else {
				ui_service.query_dialog(params).await
			};
			let _ = outcome_tx.send(UiOutcome { seq, refresh, reply }).await;
		});

		self.emit_state(
			if refresh { SessionState::UiRefreshing } else { SessionState::UserPending },
			"waiting for user",
		);
	}

	async fn handle_ui_outcome(&mut self, outcome: UiOutcome) {
		if outcome.seq != self.ui_seq {
			// A canceled dialog; its late reply is meaningless.
			return;
		}
		self.ui_request_id = None;
		if !self.request_is_active {
			return;
		}
		self.touch();

		let reply = match outcome.reply {
			Ok(reply) => reply,
			Err(err) => {
				warn!("ui service failed: {}", err);
				let mut reply = SessionData::new();
				reply.insert(ui::UI_KEY_ERROR.into(), QUERY_ERROR_NO_SIGNONUI.into());
				reply
			}
		};

		match query_error(&reply) {
			QUERY_ERROR_CANCELED => {
				if !self.canceled {
					self.canceled = true;
					self.reply_head(Err(Error::SessionCanceled));
				}
				if let Some(plugin) = &self.plugin {
					let _ = plugin.send(PluginRequest::Cancel).await;
				}
			}
			QUERY_ERROR_FORGOT_PASSWORD => {
				if !self.canceled {
					self.canceled = true;
					self.reply_head(Err(Error::ForgotPassword));
				}
				if let Some(plugin) = &self.plugin {
					let _ = plugin.send(PluginRequest::Cancel).await;
				}
			}
			code => {
				if code == QUERY_ERROR_NONE {
					// The user may have typed fresh credentials.
					if let Some(username) = reply.get(ui::UI_KEY_USERNAME).and_then(|v| v.as_str())
					{
						self.tmp_username = Some(username.to_owned());
					}
					let password = reply
						.get(ui::UI_KEY_SECRET)
						.or_else(|| reply.get(ui::UI_KEY_PASSWORD))
						.and_then(|v| v.as_str());
					if let Some(password) = password {
						self.tmp_password = Some(password.to_owned());
					}
				}
				// Non-fatal errors ride along; the plugin decides.
				let request = if outcome.refresh {
					PluginRequest::ProcessRefresh { data: reply }
				} else {
					PluginRequest::ProcessUi { data: reply }
				};
				if let Some(plugin) = &self.plugin {
					if plugin.send(request).await.is_err() {
						self.fail_active(Error::Runtime).await;
					}
				}
			}
		}
	}

	async fn on_plugin_error(&mut self, code: u32, message: &str) {
		if !self.request_is_active {
			warn!("error frame without active request: {}:{}", code, message);
			return;
		}
		if !self.canceled {
			self.reply_head(Err(Error::from_plugin_error(code, message)));
		}
		self.finish_active().await;
	}

	async fn on_plugin_exit(&mut self) {
		warn!("plugin {} exited unexpectedly", self.method);
		self.plugin = None;
		for (_, reply) in self.pending_mechanisms.drain(..) {
			let _ = reply.send(Err(Error::Runtime));
		}
		if self.request_is_active {
			if !self.canceled {
				self.reply_head(Err(Error::Runtime));
			}
			self.finish_active().await;
		}
	}

	async fn fail_active(&mut self, err: Error) {
		if !self.canceled {
			self.reply_head(Err(err));
		}
		self.finish_active().await;
	}

	/// Retires the head entry and starts the next one.
	async fn finish_active(&mut self) {
		self.cancel_outstanding_ui();
		self.queue.pop_front();
		self.request_is_active = false;
		self.canceled = false;
		self.query_with_ui = false;
		self.tmp_username = None;
		self.tmp_password = None;
		self.client_data = SessionData::new();
		self.update_busy();
		self.emit_state(SessionState::ProcessDone, "");
		self.start_next().await;
	}

	fn cancel_outstanding_ui(&mut self) {
		if let Some(request_id) = self.ui_request_id.take() {
			self.ui_seq += 1;
			let ui_service = Arc::clone(&self.deps.ui);
			tokio::spawn(async move {
				let _ = ui_service.cancel_ui_request(&request_id).await;
			});
		}
	}
}

// vim: ts=4
