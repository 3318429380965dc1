//! Server-side identity object.
//!
//! One object per identity handed out on the bus. It owns no state of its
//! own beyond the id binding: every operation goes through the
//! credentials DB, every mutation fans `info_updated` out to the client
//! handles observing the same id. Objects are idle-reaped through the
//! disposable registry; in-flight operations (a verify dialog can sit
//! open for minutes) hold off the sweeper.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use signon_types::access_control::Peer;
use signon_types::types::IdentityChange;
use signon_types::ui::{
	self, query_error, UiAdapter, QUERY_ERROR_CANCELED, QUERY_ERROR_FORGOT_PASSWORD,
	QUERY_ERROR_NONE,
};

use crate::access_control::AccessControl;
use crate::disposable::Disposable;
use crate::prelude::*;
use crate::storage::CredentialsDb;

/// Signals an identity object fans out to its client handles.
#[derive(Debug, Clone)]
pub enum IdentitySignal {
	InfoUpdated {
		change: IdentityChange,
		/// Connection that caused the change; it gets its answer through
		/// the reply and is skipped in the fan-out when set.
		exclude_conn: Option<u64>,
	},
	Unregistered,
}

pub struct IdentityObject {
	path: Box<str>,
	id: Mutex<IdentityId>,
	db: Arc<CredentialsDb>,
	gate: Arc<AccessControl>,
	ui: Arc<dyn UiAdapter>,
	signals: broadcast::Sender<IdentitySignal>,
	last_used: Mutex<Instant>,
	max_inactivity: Duration,
	in_flight: AtomicUsize,
	on_dispose: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl std::fmt::Debug for IdentityObject {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("IdentityObject").field("path", &self.path).finish()
	}
}

/// Keeps the object busy (and un-reapable) for the duration of one call.
struct OpGuard<'a>(&'a IdentityObject);

impl Drop for OpGuard<'_> {
	fn drop(&mut self) {
		self.0.in_flight.fetch_sub(1, Ordering::Relaxed);
		self.0.touch();
	}
}

impl IdentityObject {
	pub fn new(
		path: impl Into<Box<str>>,
		id: IdentityId,
		db: Arc<CredentialsDb>,
		gate: Arc<AccessControl>,
		ui: Arc<dyn UiAdapter>,
		max_inactivity: Duration,
	) -> Arc<Self> {
		let (signals, _) = broadcast::channel(32);
		Arc::new(IdentityObject {
			path: path.into(),
			id: Mutex::new(id),
			db,
			gate,
			ui,
			signals,
			last_used: Mutex::new(Instant::now()),
			max_inactivity,
			in_flight: AtomicUsize::new(0),
			on_dispose: Mutex::new(None),
		})
	}

	pub fn path(&self) -> &str {
		&self.path
	}

	pub fn id(&self) -> IdentityId {
		self.id.lock().map(|id| *id).unwrap_or(IdentityId::NEW)
	}

	pub fn set_on_dispose(&self, hook: impl FnOnce() + Send + 'static) {
		if let Ok(mut slot) = self.on_dispose.lock() {
			*slot = Some(Box::new(hook));
		}
	}

	pub fn subscribe(&self) -> broadcast::Receiver<IdentitySignal> {
		self.signals.subscribe()
	}

	fn touch(&self) {
		if let Ok(mut slot) = self.last_used.lock() {
			*slot = Instant::now();
		}
	}

	fn begin_op(&self) -> OpGuard<'_> {
		self.touch();
		self.in_flight.fetch_add(1, Ordering::Relaxed);
		OpGuard(self)
	}

	fn emit(&self, change: IdentityChange, exclude_conn: Option<u64>) {
		let _ = self.signals.send(IdentitySignal::InfoUpdated { change, exclude_conn });
	}

	fn store_error(err: StoreError, fallback: Error) -> Error {
		// Destructive work on a closed secrets tier is a server problem,
		// not a bad request.
		match err {
			StoreError::NotOpen => Error::InternalServer,
			_ => fallback,
		}
	}

	async fn require_use_access(&self, peer: &Peer) -> SsoResult<()> {
		let id = self.id();
		if id.is_new() {
			return Ok(());
		}
		if self.gate.is_peer_allowed_to_use_identity(peer, id).await? {
			Ok(())
		} else {
			Err(Error::PermissionDenied)
		}
	}

	async fn require_admin_access(&self, peer: &Peer) -> SsoResult<()> {
		let id = self.id();
		if id.is_new() {
			return Ok(());
		}
		if self.gate.may_administer_identity(peer, id).await? {
			Ok(())
		} else {
			Err(Error::PermissionDenied)
		}
	}

	pub async fn get_info(&self, peer: &Peer) -> SsoResult<IdentityInfo> {
		let _guard = self.begin_op();
		let id = self.id();
		if id.is_new() {
			return Ok(IdentityInfo::new());
		}
		self.require_use_access(peer).await?;
		let info = self
			.db
			.credentials(id, false)
			.await
			.map_err(|err| Self::store_error(err, Error::CredentialsNotAvailable))?
			.ok_or(Error::IdentityNotFound)?;
		Ok(info.strip_secrets())
	}

	/// Persists the given info, assigning an id on first store. The
	/// storing peer becomes the owner of a fresh identity unless the info
	/// names owners explicitly.
	pub async fn store(
		&self,
		mut info: IdentityInfo,
		peer: &Peer,
		origin_conn: u64,
	) -> SsoResult<IdentityId> {
		let _guard = self.begin_op();
		let id = self.id();

		if id.is_new() {
			if info.owner_list.is_empty() {
				info.owner_list = vec![self.gate.app_id_of_peer(peer).await];
			}
			info.id = IdentityId::NEW;
			let new_id = self
				.db
				.insert_credentials(&info)
				.await
				.map_err(|err| Self::store_error(err, Error::StoreFailed))?;
			if let Ok(mut slot) = self.id.lock() {
				*slot = new_id;
			}
			info!("identity {} created", new_id);
			Ok(new_id)
		} else {
			self.require_admin_access(peer).await?;
			// Ownership is assigned at creation and never rewritten here.
			let current = self
				.db
				.credentials(id, false)
				.await
				.map_err(|err| Self::store_error(err, Error::StoreFailed))?
				.ok_or(Error::IdentityNotFound)?;
			info.id = id;
			info.owner_list = current.owner_list;
			self.db
				.update_credentials(&info)
				.await
				.map_err(|err| Self::store_error(err, Error::StoreFailed))?;
			self.emit(IdentityChange::DataUpdated, Some(origin_conn));
			Ok(id)
		}
	}

	pub async fn remove(&self, peer: &Peer) -> SsoResult<()> {
		let _guard = self.begin_op();
		let id = self.id();
		if id.is_new() {
			return Err(Error::IdentityNotFound);
		}
		self.require_admin_access(peer).await?;
		let found = self
			.db
			.remove_credentials(id)
			.await
			.map_err(|err| Self::store_error(err, Error::RemoveFailed))?;
		if !found {
			return Err(Error::IdentityNotFound);
		}
		info!("identity {} removed", id);
		self.emit(IdentityChange::Removed, None);
		Ok(())
	}

	pub async fn verify_secret(&self, peer: &Peer, secret: &str) -> SsoResult<bool> {
		let _guard = self.begin_op();
		let id = self.id();
		if id.is_new() {
			return Err(Error::IdentityNotFound);
		}
		self.require_use_access(peer).await?;
		let info = self
			.db
			.credentials(id, true)
			.await
			.map_err(|err| Self::store_error(err, Error::CredentialsNotAvailable))?
			.ok_or(Error::IdentityNotFound)?;
		let username = info.username.as_deref().unwrap_or_default();
		self.db
			.check_password(id, username, secret)
			.await
			.map_err(|err| Self::store_error(err, Error::CredentialsNotAvailable))
	}

	/// Interactive verification: asks the UI service for the password and
	/// runs it against the secrets tier.
	pub async fn verify_user(&self, peer: &Peer, params: SessionData) -> SsoResult<bool> {
		let _guard = self.begin_op();
		let id = self.id();
		if id.is_new() {
			return Err(Error::IdentityNotFound);
		}
		self.require_use_access(peer).await?;
		let info = self
			.db
			.credentials(id, false)
			.await
			.map_err(|err| Self::store_error(err, Error::CredentialsNotAvailable))?
			.ok_or(Error::IdentityNotFound)?;
		let Some(username) = info.username.clone().filter(|u| !u.is_empty()) else {
			return Err(Error::MissingData);
		};

		let reply = self.run_query_dialog(&info, Some(&username), params).await?;
		let password = reply
			.get(ui::UI_KEY_SECRET)
			.or_else(|| reply.get(ui::UI_KEY_PASSWORD))
			.and_then(|v| v.as_str())
			.ok_or(Error::MissingData)?;

		self.db
			.check_password(id, &username, password)
			.await
			.map_err(|err| Self::store_error(err, Error::CredentialsNotAvailable))
	}

	/// Asks the user for a new secret and stores it.
	pub async fn request_credentials_update(
		&self,
		peer: &Peer,
		message: &str,
		origin_conn: u64,
	) -> SsoResult<IdentityId> {
		let _guard = self.begin_op();
		let id = self.id();
		if id.is_new() {
			return Err(Error::IdentityNotFound);
		}
		self.require_admin_access(peer).await?;
		let mut info = self
			.db
			.credentials(id, false)
			.await
			.map_err(|err| Self::store_error(err, Error::CredentialsNotAvailable))?
			.ok_or(Error::IdentityNotFound)?;

		let mut params = SessionData::new();
		if !message.is_empty() {
			params.insert(ui::UI_KEY_MESSAGE.into(), message.into());
		}
		let username = info.username.clone();
		let reply = self.run_query_dialog(&info, username.as_deref(), params).await?;
		let secret = reply
			.get(ui::UI_KEY_SECRET)
			.or_else(|| reply.get(ui::UI_KEY_PASSWORD))
			.and_then(|v| v.as_str())
			.ok_or(Error::MissingData)?;

		info.secret = Some(secret.into());
		info.store_secret = true;
		self.db
			.update_credentials(&info)
			.await
			.map_err(|err| Self::store_error(err, Error::StoreFailed))?;
		self.emit(IdentityChange::DataUpdated, Some(origin_conn));
		Ok(id)
	}

	async fn run_query_dialog(
		&self,
		info: &IdentityInfo,
		username: Option<&str>,
		mut params: SessionData,
	) -> SsoResult<SessionData> {
		params.insert(ui::UI_KEY_REQUEST_ID.into(), uuid::Uuid::new_v4().to_string().into());
		params.insert(ui::UI_KEY_QUERY_PASSWORD.into(), true.into());
		params.insert(ui::UI_KEY_IDENTITY.into(), self.id().0.into());
		params.insert(ui::UI_KEY_CAPTION.into(), info.caption.as_ref().into());
		if let Some(username) = username {
			params.insert(ui::UI_KEY_USERNAME.into(), username.into());
		}

		let reply = self.ui.query_dialog(params).await?;
		match query_error(&reply) {
			QUERY_ERROR_NONE => Ok(reply),
			QUERY_ERROR_CANCELED => Err(Error::IdentityOperationCanceled),
			QUERY_ERROR_FORGOT_PASSWORD => Err(Error::ForgotPassword),
			_ => Err(Error::UserInteraction),
		}
	}

	/// Cancels sessions of this identity on every peer. The originating
	/// connection learns the outcome from the reply; only the other
	/// handles get the `SignedOut` notification.
	pub async fn sign_out(&self, peer: &Peer, origin_conn: u64) -> SsoResult<bool> {
		let _guard = self.begin_op();
		let id = self.id();
		if id.is_new() {
			return Err(Error::IdentityNotFound);
		}
		self.require_use_access(peer).await?;
		self.emit(IdentityChange::SignedOut, Some(origin_conn));
		Ok(true)
	}

	pub async fn add_reference(&self, peer: &Peer, reference: &str) -> SsoResult<()> {
		let _guard = self.begin_op();
		let id = self.id();
		if id.is_new() {
			return Err(Error::IdentityNotFound);
		}
		self.require_use_access(peer).await?;
		let token = self.gate.app_id_of_peer(peer).await;
		self.db
			.add_reference(id, &token, reference)
			.await
			.map_err(|err| Self::store_error(err, Error::StoreFailed))
	}

	pub async fn remove_reference(&self, peer: &Peer, reference: &str) -> SsoResult<()> {
		let _guard = self.begin_op();
		let id = self.id();
		if id.is_new() {
			return Err(Error::IdentityNotFound);
		}
		self.require_use_access(peer).await?;
		let token = self.gate.app_id_of_peer(peer).await;
		let found = self
			.db
			.remove_reference(id, &token, Some(reference))
			.await
			.map_err(|err| Self::store_error(err, Error::RemoveFailed))?;
		if !found {
			return Err(Error::ReferenceNotFound);
		}
		Ok(())
	}
}

impl Disposable for IdentityObject {
	fn last_used(&self) -> Instant {
		self.last_used.lock().map(|slot| *slot).unwrap_or_else(|_| Instant::now())
	}

	fn max_inactivity(&self) -> Duration {
		self.max_inactivity
	}

	fn auto_destruct(&self) -> bool {
		self.in_flight.load(Ordering::Relaxed) == 0
	}

	fn dispose(&self) {
		let _ = self.signals.send(IdentitySignal::Unregistered);
		let hook = self.on_dispose.lock().ok().and_then(|mut slot| slot.take());
		if let Some(hook) = hook {
			hook();
		}
	}
}

// vim: ts=4
