//! Daemon root object and call dispatch.
//!
//! The root object hands out identity and session objects, keeps the
//! path registries, and routes every inbound [`Call`] to its target. For
//! persisted identities there is at most one identity object per id and
//! one session per (id, method); unpersisted identities get fresh objects
//! every time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use signon_types::access_control::{AccessRequest, Peer};
use signon_types::wire::{Call, NO_OBJECT};

use crate::access_control::AccessControl;
use crate::config::Config;
use crate::disposable::{Disposable, DisposableRegistry};
use crate::identity::IdentityObject;
use crate::prelude::*;
use crate::session::core::SessionDeps;
use crate::session::{AuthSession, PluginFactory};
use crate::storage::CredentialsDb;
use signon_types::ui::UiAdapter;

#[derive(Default)]
struct Objects {
	identities: HashMap<Box<str>, Arc<IdentityObject>>,
	identity_paths: HashMap<IdentityId, Box<str>>,
	sessions: HashMap<Box<str>, Arc<AuthSession>>,
	session_paths: HashMap<(IdentityId, Box<str>), Box<str>>,
	session_ids: HashMap<Box<str>, IdentityId>,
}

pub struct Daemon {
	config: Config,
	db: Arc<CredentialsDb>,
	gate: Arc<AccessControl>,
	ui: Arc<dyn UiAdapter>,
	plugins: Arc<dyn PluginFactory>,
	registry: Arc<DisposableRegistry>,
	objects: Mutex<Objects>,
	next_object: AtomicU64,
}

impl std::fmt::Debug for Daemon {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Daemon").finish()
	}
}

impl Daemon {
	pub fn new(
		config: Config,
		db: Arc<CredentialsDb>,
		gate: Arc<AccessControl>,
		ui: Arc<dyn UiAdapter>,
		plugins: Arc<dyn PluginFactory>,
		registry: Arc<DisposableRegistry>,
	) -> Arc<Self> {
		Arc::new(Daemon {
			config,
			db,
			gate,
			ui,
			plugins,
			registry,
			objects: Mutex::new(Objects::default()),
			next_object: AtomicU64::new(1),
		})
	}

	pub fn db(&self) -> &Arc<CredentialsDb> {
		&self.db
	}

	pub fn registry(&self) -> &Arc<DisposableRegistry> {
		&self.registry
	}

	pub fn identity_at(&self, path: &str) -> Option<Arc<IdentityObject>> {
		self.objects.lock().ok()?.identities.get(path).cloned()
	}

	pub fn session_at(&self, path: &str) -> Option<Arc<AuthSession>> {
		self.objects.lock().ok()?.sessions.get(path).cloned()
	}

	fn next_path(&self, kind: &str) -> Box<str> {
		let n = self.next_object.fetch_add(1, Ordering::Relaxed);
		format!("/{}/{}", kind, n).into()
	}

	fn session_deps(&self) -> SessionDeps {
		SessionDeps {
			db: Arc::clone(&self.db),
			gate: Arc::clone(&self.gate),
			ui: Arc::clone(&self.ui),
			plugins: Arc::clone(&self.plugins),
		}
	}

	fn register_identity_object(self: &Arc<Self>, object: &Arc<IdentityObject>) {
		let path: Box<str> = object.path().into();
		if let Ok(mut objects) = self.objects.lock() {
			objects.identities.insert(path.clone(), Arc::clone(object));
			let id = object.id();
			if !id.is_new() {
				objects.identity_paths.insert(id, path.clone());
			}
		}
		let daemon = Arc::downgrade(self);
		let hook_path = path.clone();
		object.set_on_dispose(move || {
			if let Some(daemon) = daemon.upgrade() {
				daemon.drop_identity_object(&hook_path);
			}
		});
		self.registry.register(Arc::downgrade(object) as Weak<dyn Disposable>);
	}

	fn drop_identity_object(&self, path: &str) {
		if let Ok(mut objects) = self.objects.lock() {
			if let Some(object) = objects.identities.remove(path) {
				objects.identity_paths.retain(|_, p| &**p != path);
				drop(object);
			}
		}
	}

	fn register_session_object(self: &Arc<Self>, object: &Arc<AuthSession>, id: IdentityId) {
		let path: Box<str> = object.path().into();
		if let Ok(mut objects) = self.objects.lock() {
			objects.sessions.insert(path.clone(), Arc::clone(object));
			objects.session_ids.insert(path.clone(), id);
			if !id.is_new() {
				objects
					.session_paths
					.insert((id, object.method().into()), path.clone());
			}
		}
		let daemon = Arc::downgrade(self);
		let hook_path = path.clone();
		object.set_on_dispose(move || {
			if let Some(daemon) = daemon.upgrade() {
				daemon.drop_session_object(&hook_path);
			}
		});
		self.registry.register(Arc::downgrade(object) as Weak<dyn Disposable>);
	}

	fn drop_session_object(&self, path: &str) {
		if let Ok(mut objects) = self.objects.lock() {
			objects.sessions.remove(path);
			objects.session_ids.remove(path);
			objects.session_paths.retain(|_, p| &**p != path);
		}
	}

	/// Tears down every session bound to the identity; used by sign-out
	/// and removal.
	pub fn destroy_sessions_of(&self, id: IdentityId) {
		let victims: Vec<Arc<AuthSession>> = match self.objects.lock() {
			Ok(mut objects) => {
				let paths: Vec<Box<str>> = objects
					.session_ids
					.iter()
					.filter(|(_, sid)| **sid == id)
					.map(|(path, _)| path.clone())
					.collect();
				paths
					.iter()
					.filter_map(|path| {
						objects.session_ids.remove(path);
						objects.session_paths.retain(|_, p| p != path);
						objects.sessions.remove(path)
					})
					.collect()
			}
			Err(_) => Vec::new(),
		};
		for session in victims {
			session.dispose();
		}
	}

	/// Called after a successful `store` bound a fresh object to its id.
	fn bind_identity(&self, path: &str, id: IdentityId) {
		if let Ok(mut objects) = self.objects.lock() {
			objects.identity_paths.insert(id, path.into());
		}
	}

	async fn allowed_or_prompted(&self, peer: &Peer, id: IdentityId, method: Option<&str>) -> SsoResult<bool> {
		if self.gate.is_peer_allowed_to_use_identity(peer, id).await? {
			return Ok(true);
		}
		// The peer lacks per-identity privilege only; let the policy ask.
		let request = AccessRequest {
			peer: peer.clone(),
			identity: id,
			method: method.map(Into::into),
		};
		Ok(self.gate.request_access(request).await)
	}

	pub async fn register_new_identity(self: &Arc<Self>, _peer: &Peer) -> SsoResult<Box<str>> {
		let path = self.next_path("Identity");
		let object = IdentityObject::new(
			path.clone(),
			IdentityId::NEW,
			Arc::clone(&self.db),
			Arc::clone(&self.gate),
			Arc::clone(&self.ui),
			self.config.identity_timeout(),
		);
		self.register_identity_object(&object);
		Ok(path)
	}

	pub async fn get_identity(
		self: &Arc<Self>,
		peer: &Peer,
		id: IdentityId,
	) -> SsoResult<(Box<str>, IdentityInfo)> {
		let info = self
			.db
			.credentials(id, false)
			.await
			.map_err(|_| Error::CredentialsNotAvailable)?
			.ok_or(Error::IdentityNotFound)?;

		if !self.allowed_or_prompted(peer, id, None).await? {
			return Err(Error::PermissionDenied);
		}

		let existing = self
			.objects
			.lock()
			.ok()
			.and_then(|objects| {
				objects
					.identity_paths
					.get(&id)
					.and_then(|path| objects.identities.get(path))
					.cloned()
			});
		let object = match existing {
			Some(object) => object,
			None => {
				let object = IdentityObject::new(
					self.next_path("Identity"),
					id,
					Arc::clone(&self.db),
					Arc::clone(&self.gate),
					Arc::clone(&self.ui),
					self.config.identity_timeout(),
				);
				self.register_identity_object(&object);
				object
			}
		};
		Ok((object.path().into(), info.strip_secrets()))
	}

	pub async fn get_auth_session(
		self: &Arc<Self>,
		peer: &Peer,
		id: IdentityId,
		method: &str,
	) -> SsoResult<Box<str>> {
		if !id.is_new() {
			let info = self
				.db
				.credentials(id, false)
				.await
				.map_err(|_| Error::CredentialsNotAvailable)?
				.ok_or(Error::IdentityNotFound)?;
			if !info.methods.is_empty() && !info.methods.contains_key(method) {
				return Err(Error::MethodNotAvailable);
			}
			if !self.allowed_or_prompted(peer, id, Some(method)).await? {
				return Err(Error::PermissionDenied);
			}

			let existing = self.objects.lock().ok().and_then(|objects| {
				objects.session_paths.get(&(id, method.into())).cloned()
			});
			if let Some(path) = existing {
				return Ok(path);
			}
		}

		let session = AuthSession::new(
			self.next_path("AuthSession"),
			id,
			method,
			self.session_deps(),
			self.config.auth_session_timeout(),
		);
		self.register_session_object(&session, id);
		Ok(session.path().into())
	}

	pub async fn query_methods(&self) -> SsoResult<Vec<Box<str>>> {
		self.plugins.methods().await
	}

	pub async fn query_mechanisms(&self, method: &str) -> SsoResult<Vec<Box<str>>> {
		self.plugins.mechanisms(method).await
	}

	pub async fn query_identities(
		&self,
		peer: &Peer,
		filter: &HashMap<String, serde_json::Value>,
	) -> SsoResult<Vec<IdentityInfo>> {
		if !self.gate.is_peer_keychain_widget(peer).await {
			return Err(Error::PermissionDenied);
		}
		let identities = self
			.db
			.list_credentials(filter)
			.await
			.map_err(|_| Error::CredentialsNotAvailable)?;
		Ok(identities.into_iter().map(IdentityInfo::strip_secrets).collect())
	}

	pub async fn clear(&self, peer: &Peer) -> SsoResult<bool> {
		if !self.gate.is_peer_keychain_widget(peer).await {
			return Err(Error::PermissionDenied);
		}
		self.db.clear().await.map_err(|err| match err {
			StoreError::NotOpen => Error::InternalServer,
			_ => Error::RemoveFailed,
		})?;

		// Every live object refers to a row that no longer exists.
		let (identities, sessions) = match self.objects.lock() {
			Ok(mut objects) => {
				let identities: Vec<_> = objects.identities.drain().map(|(_, o)| o).collect();
				let sessions: Vec<_> = objects.sessions.drain().map(|(_, o)| o).collect();
				objects.identity_paths.clear();
				objects.session_paths.clear();
				objects.session_ids.clear();
				(identities, sessions)
			}
			Err(_) => (Vec::new(), Vec::new()),
		};
		for object in identities {
			object.dispose();
		}
		for object in sessions {
			object.dispose();
		}
		Ok(true)
	}

	/// Routes one inbound call. `conn` identifies the calling connection
	/// for signal exclusion, `peer` its process credentials.
	pub async fn dispatch(
		self: &Arc<Self>,
		conn: u64,
		peer: &Peer,
		path: &str,
		call: Call,
	) -> SsoResult<serde_json::Value> {
		if path == signon_types::wire::DAEMON_PATH {
			return self.dispatch_daemon(peer, call).await;
		}
		if let Some(identity) = self.identity_at(path) {
			return self.dispatch_identity(conn, peer, &identity, call).await;
		}
		if let Some(session) = self.session_at(path) {
			return self.dispatch_session(conn, peer, &session, call).await;
		}
		Err(Error::User(Error::InternalCommunication.code(), NO_OBJECT.into()))
	}

	async fn dispatch_daemon(
		self: &Arc<Self>,
		peer: &Peer,
		call: Call,
	) -> SsoResult<serde_json::Value> {
		match call {
			Call::RegisterNewIdentity => {
				let path = self.register_new_identity(peer).await?;
				Ok(serde_json::json!({ "path": path }))
			}
			Call::GetIdentity { id } => {
				let (path, info) = self.get_identity(peer, IdentityId(id)).await?;
				Ok(serde_json::json!({ "path": path, "info": info }))
			}
			Call::GetAuthSession { id, method } => {
				let path = self.get_auth_session(peer, IdentityId(id), &method).await?;
				Ok(serde_json::json!({ "path": path }))
			}
			Call::QueryMethods => Ok(serde_json::to_value(self.query_methods().await?)?),
			Call::QueryMechanisms { method } => {
				Ok(serde_json::to_value(self.query_mechanisms(&method).await?)?)
			}
			Call::QueryIdentities { filter } => {
				Ok(serde_json::to_value(self.query_identities(peer, &filter).await?)?)
			}
			Call::Clear => Ok(serde_json::to_value(self.clear(peer).await?)?),
			_ => Err(Error::InvalidQuery),
		}
	}

	async fn dispatch_identity(
		self: &Arc<Self>,
		conn: u64,
		peer: &Peer,
		identity: &Arc<IdentityObject>,
		call: Call,
	) -> SsoResult<serde_json::Value> {
		match call {
			Call::GetInfo => Ok(serde_json::to_value(identity.get_info(peer).await?)?),
			Call::Store { info } => {
				let was_new = identity.id().is_new();
				let id = identity.store(info, peer, conn).await?;
				if was_new {
					self.bind_identity(identity.path(), id);
				}
				Ok(serde_json::to_value(id)?)
			}
			Call::Remove => {
				let id = identity.id();
				identity.remove(peer).await?;
				self.destroy_sessions_of(id);
				identity.dispose();
				Ok(serde_json::Value::Bool(true))
			}
			Call::VerifyUser { params } => {
				Ok(serde_json::to_value(identity.verify_user(peer, params).await?)?)
			}
			Call::VerifySecret { secret } => {
				Ok(serde_json::to_value(identity.verify_secret(peer, &secret).await?)?)
			}
			Call::SignOut => {
				let result = identity.sign_out(peer, conn).await?;
				self.destroy_sessions_of(identity.id());
				Ok(serde_json::Value::Bool(result))
			}
			Call::AddReference { reference } => {
				identity.add_reference(peer, &reference).await?;
				Ok(serde_json::Value::Bool(true))
			}
			Call::RemoveReference { reference } => {
				identity.remove_reference(peer, &reference).await?;
				Ok(serde_json::Value::Bool(true))
			}
			Call::RequestCredentialsUpdate { message } => {
				let id = identity.request_credentials_update(peer, &message, conn).await?;
				Ok(serde_json::to_value(id)?)
			}
			_ => Err(Error::InvalidQuery),
		}
	}

	async fn dispatch_session(
		self: &Arc<Self>,
		conn: u64,
		peer: &Peer,
		session: &Arc<AuthSession>,
		call: Call,
	) -> SsoResult<serde_json::Value> {
		match call {
			Call::Process { params, mechanism } => {
				let cancel_key = format!("{}:{}", conn, session.path());
				let data = session.process(peer.clone(), params, mechanism, cancel_key).await?;
				Ok(serde_json::Value::Object(data))
			}
			Call::Cancel => {
				let cancel_key = format!("{}:{}", conn, session.path());
				session.cancel(&cancel_key).await?;
				Ok(serde_json::Value::Bool(true))
			}
			Call::QueryAvailableMechanisms { wanted } => {
				Ok(serde_json::to_value(session.query_available_mechanisms(wanted).await?)?)
			}
			Call::SetId { id } => {
				let id = IdentityId(id);
				if !self.gate.is_peer_allowed_to_use_auth_session(peer, id).await? {
					return Err(Error::PermissionDenied);
				}
				session.set_id(id).await?;
				if let Ok(mut objects) = self.objects.lock() {
					objects.session_ids.insert(session.path().into(), id);
				}
				Ok(serde_json::Value::Bool(true))
			}
			Call::ObjectUnref => {
				session.object_unref().await;
				Ok(serde_json::Value::Bool(true))
			}
			_ => Err(Error::InvalidQuery),
		}
	}
}

// vim: ts=4
