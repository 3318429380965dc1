//! App builder - constructs and runs the signon daemon.

use std::sync::Arc;

use signon_types::access_control::{AccessControlAdapter, PermissiveAccessControl};
use signon_types::meta_adapter::MetaAdapter;
use signon_types::secrets_adapter::SecretsAdapter;
use signon_types::ui::{NoUi, UiAdapter};

use crate::access_control::AccessControl;
use crate::config::Config;
use crate::daemon::Daemon;
use crate::disposable::DisposableRegistry;
use crate::ipc;
use crate::prelude::*;
use crate::session::{ExecPluginFactory, PluginFactory};
use crate::storage::CredentialsDb;

pub struct AppBuilder {
	config: Config,
	meta: Option<Arc<dyn MetaAdapter>>,
	secrets: Option<Arc<dyn SecretsAdapter>>,
	access_control: Option<Arc<dyn AccessControlAdapter>>,
	ui: Option<Arc<dyn UiAdapter>>,
	plugins: Option<Arc<dyn PluginFactory>>,
}

impl AppBuilder {
	pub fn new(config: Config) -> Self {
		AppBuilder {
			config,
			meta: None,
			secrets: None,
			access_control: None,
			ui: None,
			plugins: None,
		}
	}

	pub fn meta_adapter(mut self, meta: Arc<dyn MetaAdapter>) -> Self {
		self.meta = Some(meta);
		self
	}

	/// Attaches an already-available secrets tier. Without one the daemon
	/// starts with the tier closed and the cache absorbing secrets until
	/// `CredentialsDb::open_secrets` is called.
	pub fn secrets_adapter(mut self, secrets: Arc<dyn SecretsAdapter>) -> Self {
		self.secrets = Some(secrets);
		self
	}

	pub fn access_control(mut self, adapter: Arc<dyn AccessControlAdapter>) -> Self {
		self.access_control = Some(adapter);
		self
	}

	pub fn ui(mut self, ui: Arc<dyn UiAdapter>) -> Self {
		self.ui = Some(ui);
		self
	}

	pub fn plugins(mut self, plugins: Arc<dyn PluginFactory>) -> Self {
		self.plugins = Some(plugins);
		self
	}

	pub async fn build(self) -> SsoResult<App> {
		let meta = self.meta.ok_or_else(|| {
			error!("no metadata adapter configured");
			Error::InternalServer
		})?;
		let db = Arc::new(CredentialsDb::new(meta));
		if let Some(secrets) = self.secrets {
			db.open_secrets(secrets).await;
		}

		let access_control = self
			.access_control
			.unwrap_or_else(|| Arc::new(PermissiveAccessControl));
		let gate = Arc::new(AccessControl::new(access_control, Arc::clone(&db)));
		let ui = self.ui.unwrap_or_else(|| Arc::new(NoUi));
		let plugins = self
			.plugins
			.unwrap_or_else(|| Arc::new(ExecPluginFactory::new(self.config.plugins_dir.clone())));

		let registry = Arc::new(DisposableRegistry::new());
		let _sweeper = registry.start();

		let daemon = Daemon::new(
			self.config.clone(),
			db,
			gate,
			ui,
			plugins,
			Arc::clone(&registry),
		);

		Ok(App { config: self.config, daemon, registry })
	}
}

pub struct App {
	config: Config,
	daemon: Arc<Daemon>,
	registry: Arc<DisposableRegistry>,
}

impl App {
	pub fn daemon(&self) -> &Arc<Daemon> {
		&self.daemon
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	/// Serves the bus until SIGTERM/SIGINT, or until the daemon has been
	/// globally idle for the configured daemon timeout.
	pub async fn run(self) -> SsoResult<()> {
		let listener = ipc::bind_socket(&self.config.bus_path)?;
		let server = tokio::spawn(ipc::serve(Arc::clone(&self.daemon), listener));

		let mut sigterm =
			tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
		tokio::select! {
			_ = tokio::signal::ctrl_c() => info!("interrupted, shutting down"),
			_ = sigterm.recv() => info!("terminated, shutting down"),
			() = Self::idle_exit(Arc::clone(&self.registry), self.config.daemon_timeout()) => {
				info!("idle for {:?}, shutting down", self.config.daemon_timeout());
			}
		}

		server.abort();
		let _ = std::fs::remove_file(&self.config.bus_path);
		Ok(())
	}

	/// Resolves once the object registry has been empty for the whole
	/// timeout window. Never resolves when no timeout is configured.
	async fn idle_exit(registry: Arc<DisposableRegistry>, timeout: Option<std::time::Duration>) {
		let Some(timeout) = timeout else {
			std::future::pending::<()>().await;
			return;
		};
		loop {
			registry.wait_all_idle().await;
			tokio::time::sleep(timeout).await;
			if registry.is_empty() {
				return;
			}
		}
	}
}

// vim: ts=4
