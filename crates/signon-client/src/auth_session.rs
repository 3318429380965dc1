//! Client-side authentication session handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use signon_types::prelude::*;
use signon_types::types::SessionState;
use signon_types::wire::{Call, DAEMON_PATH, SIG_STATE_CHANGED, SIG_UNREGISTERED};

use crate::auth_service::AuthService;
use crate::remote_proxy::{ProxyState, RemoteObjectProxy};

/// `state_changed` notification as surfaced to the application.
#[derive(Debug, Clone)]
pub struct SessionStateEvent {
	pub state: i32,
	pub message: String,
}

impl SessionStateEvent {
	pub fn session_state(&self) -> Option<SessionState> {
		SessionState::try_from(self.state).ok()
	}
}

pub(crate) struct SessionInner {
	service: AuthService,
	proxy: RemoteObjectProxy,
	method: Box<str>,
	id: Mutex<IdentityId>,
	in_flight: AtomicBool,
	events: broadcast::Sender<SessionStateEvent>,
	register_lock: tokio::sync::Mutex<()>,
}

impl Drop for SessionInner {
	fn drop(&mut self) {
		self.proxy.poke();
	}
}

/// Handle to one authentication session. Cheap to clone; clones share
/// the remote session and its single-process-at-a-time constraint.
#[derive(Clone)]
pub struct AuthSession {
	inner: Arc<SessionInner>,
}

impl std::fmt::Debug for AuthSession {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("AuthSession").field("method", &self.inner.method).finish()
	}
}

impl AuthSession {
	pub(crate) fn new(service: AuthService, id: IdentityId, method: &str) -> Self {
		let (events, _) = broadcast::channel(32);
		let inner = Arc::new(SessionInner {
			service,
			proxy: RemoteObjectProxy::new(),
			method: method.into(),
			id: Mutex::new(id),
			in_flight: AtomicBool::new(false),
			events,
			register_lock: tokio::sync::Mutex::new(()),
		});
		let session = AuthSession { inner };
		session.spawn_watchers();
		session
	}

	pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
		AuthSession { inner }
	}

	pub(crate) fn inner(&self) -> &Arc<SessionInner> {
		&self.inner
	}

	fn spawn_watchers(&self) {
		let mut state_changed = self.inner.proxy.connect_signal(SIG_STATE_CHANGED);
		let events = self.inner.events.clone();
		tokio::spawn(async move {
			while let Some(args) = state_changed.recv().await {
				let state = args.get(0).and_then(serde_json::Value::as_i64).unwrap_or(0) as i32;
				let message = args
					.get(1)
					.and_then(serde_json::Value::as_str)
					.unwrap_or_default()
					.to_owned();
				let _ = events.send(SessionStateEvent { state, message });
			}
		});

		let mut unregistered = self.inner.proxy.connect_signal(SIG_UNREGISTERED);
		let weak = Arc::downgrade(&self.inner);
		tokio::spawn(async move {
			while unregistered.recv().await.is_some() {
				let Some(inner) = weak.upgrade() else { return };
				inner.proxy.clear_object_path();
			}
		});

		let proxy = self.inner.proxy.clone();
		let weak = Arc::downgrade(&self.inner);
		tokio::spawn(async move {
			loop {
				proxy.attention().await;
				let Some(inner) = weak.upgrade() else { return };
				let session = AuthSession { inner };
				let _ = session.ensure_registered().await;
			}
		});
	}

	pub fn method(&self) -> &str {
		&self.inner.method
	}

	pub fn id(&self) -> IdentityId {
		self.inner.id.lock().map(|id| *id).unwrap_or(IdentityId::NEW)
	}

	/// Stream of `state_changed` notifications.
	pub fn state_events(&self) -> broadcast::Receiver<SessionStateEvent> {
		self.inner.events.subscribe()
	}

	async fn ensure_registered(&self) -> SsoResult<()> {
		if self.inner.proxy.state() == ProxyState::Ready {
			return Ok(());
		}
		let _guard = self.inner.register_lock.lock().await;
		if self.inner.proxy.state() == ProxyState::Ready {
			return Ok(());
		}

		let connection = match self.inner.service.connection().await {
			Ok(connection) => connection,
			Err(err) => {
				self.inner.proxy.fail_queue(Error::InternalCommunication);
				return Err(err);
			}
		};
		self.inner.proxy.set_connection(connection.clone());

		let id = self.id();
		let call = Call::GetAuthSession { id: id.0, method: self.inner.method.clone() };
		match connection.call(DAEMON_PATH, call).await {
			Ok(value) => {
				let Some(path) = value.get("path").and_then(|v| v.as_str()) else {
					self.inner.proxy.fail_queue(Error::InternalCommunication);
					return Err(Error::InternalCommunication);
				};
				self.inner.proxy.set_object_path(path);
				Ok(())
			}
			Err(err) => {
				self.inner.proxy.fail_queue(Error::InternalCommunication);
				Err(err.into_error())
			}
		}
	}

	async fn call(&self, call: Call) -> SsoResult<serde_json::Value> {
		self.ensure_registered().await?;
		self.inner.proxy.queue_call(call).result().await
	}

	/// Runs one authentication round trip. A handle supports one
	/// in-flight `process` at a time; overlapping calls fail with
	/// `WrongState`.
	pub async fn process(
		&self,
		params: SessionData,
		mechanism: &str,
	) -> SsoResult<SessionData> {
		if self.inner.in_flight.swap(true, Ordering::AcqRel) {
			return Err(Error::WrongState);
		}
		let result = self
			.call(Call::Process { params, mechanism: mechanism.into() })
			.await
			.and_then(|value| match value {
				serde_json::Value::Object(map) => Ok(map),
				_ => Err(Error::InternalCommunication),
			});
		self.inner.in_flight.store(false, Ordering::Release);
		result
	}

	/// Cancels the in-flight (or queued) `process` of this handle.
	pub async fn cancel(&self) -> SsoResult<()> {
		// Not queued through the proxy: a cancel is pointless once the
		// transport or object is gone.
		if self.inner.proxy.state() != ProxyState::Ready {
			return Ok(());
		}
		self.call(Call::Cancel).await?;
		Ok(())
	}

	/// Intersection of the wanted mechanisms with what the plugin
	/// implements.
	pub async fn query_available_mechanisms(
		&self,
		wanted: Vec<Box<str>>,
	) -> SsoResult<Vec<Box<str>>> {
		let value = self.call(Call::QueryAvailableMechanisms { wanted }).await?;
		Ok(serde_json::from_value(value)?)
	}

	/// Binds a free-standing session to a persisted identity.
	pub async fn set_id(&self, id: IdentityId) -> SsoResult<()> {
		self.call(Call::SetId { id: id.0 }).await?;
		if let Ok(mut slot) = self.inner.id.lock() {
			*slot = id;
		}
		Ok(())
	}

	/// Tells the daemon this handle is done with the session object.
	pub async fn object_unref(&self) -> SsoResult<()> {
		if self.inner.proxy.state() != ProxyState::Ready {
			return Ok(());
		}
		self.call(Call::ObjectUnref).await?;
		Ok(())
	}
}

// vim: ts=4
