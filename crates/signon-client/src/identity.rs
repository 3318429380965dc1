//! Client-side identity handle and its registration state machine.
//!
//! A handle starts in `NeedsRegistration` and registers itself with the
//! daemon on first use (or eagerly, right after construction). Operations
//! go through the async IPC proxy, so they queue until the remote object
//! path is known and survive remote re-registration transparently.

use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast;

use signon_types::prelude::*;
use signon_types::types::{IdentityChange, KEY_UI_POLICY, ui_policy};
use signon_types::ui::UI_KEY_MESSAGE;
use signon_types::wire::{Call, DAEMON_PATH, SIG_INFO_UPDATED, SIG_UNREGISTERED};

use crate::auth_service::AuthService;
use crate::auth_session::{AuthSession, SessionInner};
use crate::remote_proxy::{ProxyState, RemoteObjectProxy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityState {
	NeedsRegistration,
	PendingRegistration,
	NeedsUpdate,
	PendingUpdate,
	Removed,
	Ready,
}

/// Unsolicited notifications surfaced on an identity handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityEvent {
	/// The identity data changed on another handle.
	DataUpdated,
	/// The identity was removed; the handle is dead.
	Removed,
	/// Another peer signed the identity out. Local sessions have been
	/// cancelled by the time this is observed.
	SignedOut,
}

pub(crate) struct IdentityInner {
	service: AuthService,
	proxy: RemoteObjectProxy,
	state: Mutex<IdentityState>,
	id: Mutex<IdentityId>,
	info: Mutex<Option<IdentityInfo>>,
	sessions: Mutex<Vec<Weak<SessionInner>>>,
	events: broadcast::Sender<IdentityEvent>,
	register_lock: tokio::sync::Mutex<()>,
}

impl Drop for IdentityInner {
	fn drop(&mut self) {
		// Unparks the attention watcher so it notices the handle died.
		self.proxy.poke();
	}
}

/// Handle to one identity. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Identity {
	inner: Arc<IdentityInner>,
}

impl std::fmt::Debug for Identity {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Identity").field("id", &self.id()).field("state", &self.state()).finish()
	}
}

impl Identity {
	pub(crate) fn new(service: AuthService, id: IdentityId) -> Self {
		let (events, _) = broadcast::channel(16);
		let inner = Arc::new(IdentityInner {
			service,
			proxy: RemoteObjectProxy::new(),
			state: Mutex::new(IdentityState::NeedsRegistration),
			id: Mutex::new(id),
			info: Mutex::new(None),
			sessions: Mutex::new(Vec::new()),
			events,
			register_lock: tokio::sync::Mutex::new(()),
		});
		let identity = Identity { inner };
		identity.spawn_watchers();

		// Register eagerly; failures are retried on the first operation.
		let eager = identity.clone();
		tokio::spawn(async move {
			let _ = eager.ensure_registered().await;
		});
		identity
	}

	fn spawn_watchers(&self) {
		let mut info_updated = self.inner.proxy.connect_signal(SIG_INFO_UPDATED);
		let weak = Arc::downgrade(&self.inner);
		tokio::spawn(async move {
			while let Some(args) = info_updated.recv().await {
				let Some(inner) = weak.upgrade() else { return };
				let identity = Identity { inner };
				let kind = args
					.get(0)
					.and_then(serde_json::Value::as_i64)
					.and_then(|k| IdentityChange::try_from(k as i32).ok());
				match kind {
					Some(IdentityChange::DataUpdated) => {
						identity.set_state_if(IdentityState::Ready, IdentityState::NeedsUpdate);
						let _ = identity.inner.events.send(IdentityEvent::DataUpdated);
					}
					Some(IdentityChange::Removed) => {
						identity.set_state(IdentityState::Removed);
						identity.inner.proxy.fail_queue(Error::IdentityNotFound);
						let _ = identity.inner.events.send(IdentityEvent::Removed);
					}
					Some(IdentityChange::SignedOut) => {
						identity.cancel_local_sessions();
						let _ = identity.inner.events.send(IdentityEvent::SignedOut);
					}
					None => warn!("malformed info_updated signal: {}", args),
				}
			}
		});

		let mut unregistered = self.inner.proxy.connect_signal(SIG_UNREGISTERED);
		let weak = Arc::downgrade(&self.inner);
		tokio::spawn(async move {
			while unregistered.recv().await.is_some() {
				let Some(inner) = weak.upgrade() else { return };
				let identity = Identity { inner };
				if identity.state() != IdentityState::Removed {
					identity.inner.proxy.clear_object_path();
					identity.set_state(IdentityState::NeedsRegistration);
				}
			}
		});

		// Re-register whenever the proxy re-queued a call or lost its
		// connection. Only a weak ref is held across the wait so dropped
		// handles can actually die.
		let proxy = self.inner.proxy.clone();
		let weak = Arc::downgrade(&self.inner);
		tokio::spawn(async move {
			loop {
				proxy.attention().await;
				let Some(inner) = weak.upgrade() else { return };
				let identity = Identity { inner };
				let _ = identity.ensure_registered().await;
			}
		});
	}

	fn set_state(&self, state: IdentityState) {
		if let Ok(mut slot) = self.inner.state.lock() {
			*slot = state;
		}
	}

	fn set_state_if(&self, expected: IdentityState, state: IdentityState) {
		if let Ok(mut slot) = self.inner.state.lock() {
			if *slot == expected {
				*slot = state;
			}
		}
	}

	pub fn state(&self) -> IdentityState {
		self.inner.state.lock().map(|s| *s).unwrap_or(IdentityState::NeedsRegistration)
	}

	pub fn id(&self) -> IdentityId {
		self.inner.id.lock().map(|id| *id).unwrap_or(IdentityId::NEW)
	}

	/// Stream of unsolicited notifications.
	pub fn events(&self) -> broadcast::Receiver<IdentityEvent> {
		self.inner.events.subscribe()
	}

	fn cancel_local_sessions(&self) {
		let sessions: Vec<Arc<SessionInner>> = match self.inner.sessions.lock() {
			Ok(mut slot) => {
				slot.retain(|weak| weak.strong_count() > 0);
				slot.iter().filter_map(Weak::upgrade).collect()
			}
			Err(_) => Vec::new(),
		};
		for session in sessions {
			let session = AuthSession::from_inner(session);
			tokio::spawn(async move {
				let _ = session.cancel().await;
			});
		}
	}

	/// Drives the registration state machine until the remote object
	/// path is known.
	async fn ensure_registered(&self) -> SsoResult<()> {
		if self.state() == IdentityState::Removed {
			return Err(Error::IdentityNotFound);
		}
		if self.inner.proxy.state() == ProxyState::Ready {
			return Ok(());
		}

		let _guard = self.inner.register_lock.lock().await;
		if self.inner.proxy.state() == ProxyState::Ready {
			return Ok(());
		}
		if self.state() == IdentityState::Removed {
			return Err(Error::IdentityNotFound);
		}
		self.set_state(IdentityState::PendingRegistration);

		let connection = match self.inner.service.connection().await {
			Ok(connection) => connection,
			Err(err) => {
				self.set_state(IdentityState::NeedsRegistration);
				self.inner.proxy.fail_queue(Error::InternalCommunication);
				return Err(err);
			}
		};
		self.inner.proxy.set_connection(connection.clone());

		let id = self.id();
		let call = if id.is_new() {
			Call::RegisterNewIdentity
		} else {
			Call::GetIdentity { id: id.0 }
		};
		match connection.call(DAEMON_PATH, call).await {
			Ok(value) => {
				let Some(path) = value.get("path").and_then(|v| v.as_str()) else {
					self.set_state(IdentityState::NeedsRegistration);
					self.inner.proxy.fail_queue(Error::InternalCommunication);
					return Err(Error::InternalCommunication);
				};
				if let Some(info) = value.get("info") {
					if let Ok(info) = serde_json::from_value::<IdentityInfo>(info.clone()) {
						if let Ok(mut slot) = self.inner.info.lock() {
							*slot = Some(info);
						}
					}
				}
				self.inner.proxy.set_object_path(path);
				self.set_state(IdentityState::Ready);
				Ok(())
			}
			Err(err) => {
				let err = err.into_error();
				if err == Error::IdentityNotFound {
					self.set_state(IdentityState::Removed);
				} else {
					self.set_state(IdentityState::NeedsRegistration);
				}
				self.inner.proxy.fail_queue(Error::InternalCommunication);
				Err(err)
			}
		}
	}

	async fn call(&self, call: Call) -> SsoResult<serde_json::Value> {
		self.ensure_registered().await?;
		self.inner.proxy.queue_call(call).result().await
	}

	/// Fetches (or re-fetches) the identity info. A cached copy is served
	/// while the handle is `Ready` and nothing changed remotely.
	pub async fn query_info(&self) -> SsoResult<IdentityInfo> {
		if self.state() == IdentityState::Ready {
			if let Some(info) = self.inner.info.lock().ok().and_then(|slot| slot.clone()) {
				return Ok(info);
			}
		}
		self.set_state_if(IdentityState::NeedsUpdate, IdentityState::PendingUpdate);

		let value = self.call(Call::GetInfo).await?;
		let info: IdentityInfo = serde_json::from_value(value)?;
		if let Ok(mut slot) = self.inner.info.lock() {
			*slot = Some(info.clone());
		}
		self.set_state_if(IdentityState::PendingUpdate, IdentityState::Ready);
		Ok(info)
	}

	/// Method names this identity may authenticate with.
	pub async fn query_available_methods(&self) -> SsoResult<Vec<Box<str>>> {
		let info = self.query_info().await?;
		let mut methods: Vec<Box<str>> = info.methods.into_keys().collect();
		methods.sort();
		Ok(methods)
	}

	/// Persists the credentials; `None` re-stores the cached info. On
	/// first store the daemon assigns the id.
	pub async fn store_credentials(&self, info: Option<IdentityInfo>) -> SsoResult<IdentityId> {
		let info = match info {
			Some(info) => info,
			None => self
				.inner
				.info
				.lock()
				.ok()
				.and_then(|slot| slot.clone())
				.ok_or(Error::MissingData)?,
		};
		let value = self.call(Call::Store { info: info.clone() }).await?;
		let id: IdentityId = serde_json::from_value(value)?;
		if let Ok(mut slot) = self.inner.id.lock() {
			*slot = id;
		}
		if let Ok(mut slot) = self.inner.info.lock() {
			let mut stored = info;
			stored.id = id;
			stored.secret = None;
			*slot = Some(stored);
		}
		self.set_state(IdentityState::Ready);
		Ok(id)
	}

	pub async fn remove(&self) -> SsoResult<()> {
		self.call(Call::Remove).await?;
		self.set_state(IdentityState::Removed);
		Ok(())
	}

	pub async fn verify_user(&self, params: SessionData) -> SsoResult<bool> {
		let value = self.call(Call::VerifyUser { params }).await?;
		Ok(value.as_bool().unwrap_or(false))
	}

	/// Convenience form: shows the dialog with just a message.
	pub async fn verify_user_message(&self, message: &str) -> SsoResult<bool> {
		let mut params = SessionData::new();
		params.insert(UI_KEY_MESSAGE.into(), message.into());
		params.insert(KEY_UI_POLICY.into(), ui_policy::DEFAULT.into());
		self.verify_user(params).await
	}

	pub async fn verify_secret(&self, secret: &str) -> SsoResult<bool> {
		let value = self.call(Call::VerifySecret { secret: secret.into() }).await?;
		Ok(value.as_bool().unwrap_or(false))
	}

	/// Signs the identity out everywhere. Other handles observe
	/// `signed_out`; this one only gets the reply.
	pub async fn sign_out(&self) -> SsoResult<bool> {
		let value = self.call(Call::SignOut).await?;
		Ok(value.as_bool().unwrap_or(false))
	}

	pub async fn add_reference(&self, reference: &str) -> SsoResult<()> {
		self.call(Call::AddReference { reference: reference.into() }).await?;
		Ok(())
	}

	pub async fn remove_reference(&self, reference: &str) -> SsoResult<()> {
		self.call(Call::RemoveReference { reference: reference.into() }).await?;
		Ok(())
	}

	/// Asks the user (through the daemon's UI service) for a new secret.
	pub async fn request_credentials_update(&self, message: &str) -> SsoResult<IdentityId> {
		let value =
			self.call(Call::RequestCredentialsUpdate { message: message.into() }).await?;
		Ok(serde_json::from_value(value)?)
	}

	/// Derives an authentication session for one of this identity's
	/// methods. Sessions created here are cancelled when the identity is
	/// signed out elsewhere.
	pub fn create_session(&self, method: &str) -> AuthSession {
		let session = self.inner.service.auth_session(self.id(), method);
		if let Ok(mut slot) = self.inner.sessions.lock() {
			slot.push(Arc::downgrade(session.inner()));
		}
		session
	}
}

// vim: ts=4
