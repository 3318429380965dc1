//! Daemon handle: entry point of the client library.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

use signon_types::prelude::*;
use signon_types::wire::{Call, DAEMON_PATH};

use crate::auth_session::AuthSession;
use crate::connection::Connection;
use crate::identity::Identity;

const BUS_SOCKET: &str = "signond/socket";

struct ServiceInner {
	bus_path: PathBuf,
	connection: Mutex<Option<Connection>>,
}

/// Handle to the signon daemon. Cheap to clone; all clones share one bus
/// connection, re-established on demand.
#[derive(Clone)]
pub struct AuthService {
	inner: Arc<ServiceInner>,
}

impl std::fmt::Debug for AuthService {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("AuthService").field("bus_path", &self.inner.bus_path).finish()
	}
}

impl AuthService {
	pub fn new(bus_path: impl Into<PathBuf>) -> Self {
		AuthService {
			inner: Arc::new(ServiceInner {
				bus_path: bus_path.into(),
				connection: Mutex::new(None),
			}),
		}
	}

	/// Uses the conventional per-user socket, honoring `SSO_BUS_PATH`.
	pub fn from_env() -> Self {
		let bus_path = std::env::var_os("SSO_BUS_PATH")
			.filter(|v| !v.is_empty())
			.map(PathBuf::from)
			.unwrap_or_else(|| {
				let runtime_dir = std::env::var_os("XDG_RUNTIME_DIR")
					.map(PathBuf::from)
					.unwrap_or_else(std::env::temp_dir);
				runtime_dir.join(BUS_SOCKET)
			});
		Self::new(bus_path)
	}

	/// The shared connection, created or re-created as needed.
	pub(crate) async fn connection(&self) -> SsoResult<Connection> {
		let mut slot = self.inner.connection.lock().await;
		if let Some(connection) = slot.as_ref() {
			if connection.is_alive() {
				return Ok(connection.clone());
			}
		}
		let connection = Connection::connect(&self.inner.bus_path).await?;
		*slot = Some(connection.clone());
		Ok(connection)
	}

	async fn daemon_call(&self, call: Call) -> SsoResult<serde_json::Value> {
		let connection = self.connection().await?;
		connection.call(DAEMON_PATH, call).await.map_err(|err| err.into_error())
	}

	/// Plugin names the daemon found in its plugins directory.
	pub async fn query_methods(&self) -> SsoResult<Vec<Box<str>>> {
		let value = self.daemon_call(Call::QueryMethods).await?;
		Ok(serde_json::from_value(value)?)
	}

	pub async fn query_mechanisms(&self, method: &str) -> SsoResult<Vec<Box<str>>> {
		let value = self.daemon_call(Call::QueryMechanisms { method: method.into() }).await?;
		Ok(serde_json::from_value(value)?)
	}

	/// Keychain-widget only.
	pub async fn query_identities(
		&self,
		filter: HashMap<String, serde_json::Value>,
	) -> SsoResult<Vec<IdentityInfo>> {
		let value = self.daemon_call(Call::QueryIdentities { filter }).await?;
		Ok(serde_json::from_value(value)?)
	}

	/// Keychain-widget only.
	pub async fn clear(&self) -> SsoResult<bool> {
		let value = self.daemon_call(Call::Clear).await?;
		Ok(value.as_bool().unwrap_or(false))
	}

	/// A handle for a brand-new identity; nothing touches storage until
	/// `store_credentials` is called on it.
	pub fn new_identity(&self) -> Identity {
		Identity::new(self.clone(), IdentityId::NEW)
	}

	/// A handle for the persisted identity with the given id.
	pub fn identity(&self, id: IdentityId) -> Identity {
		Identity::new(self.clone(), id)
	}

	/// A free-standing or identity-bound authentication session.
	pub fn auth_session(&self, id: IdentityId, method: &str) -> AuthSession {
		AuthSession::new(self.clone(), id, method)
	}
}

// vim: ts=4
