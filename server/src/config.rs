//! Daemon configuration.
//!
//! Settings come from `${config_dir}/signond/signond.toml` and every field
//! can be overridden with an `SSO_*` environment variable, so a session
//! manager can retarget a single daemon instance without editing files.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::prelude::*;

const CONFIG_FILE: &str = "signond.toml";
const BUS_SOCKET: &str = "signond/socket";

pub const DEFAULT_IDENTITY_TIMEOUT: u64 = 300;
pub const DEFAULT_SESSION_TIMEOUT: u64 = 300;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
	/// Directory holding `signon.db` and `signon-secrets.db`.
	pub storage_path: PathBuf,
	/// Directory scanned for authentication method workers.
	pub plugins_dir: PathBuf,
	/// Directory scanned for daemon extensions.
	pub extensions_dir: PathBuf,
	/// Seconds of global idleness after which the daemon exits. 0 = never.
	pub daemon_timeout: u64,
	/// Seconds an identity object survives without being touched.
	pub identity_timeout: u64,
	/// Seconds an auth session survives without being touched.
	pub auth_session_timeout: u64,
	/// Log filter, e.g. "info" or "signond=debug".
	pub logging_level: Option<String>,
	/// Log destination file. Stderr when unset.
	pub logging_output: Option<PathBuf>,
	/// Bus socket path. Derived from the runtime dir when unset.
	pub bus_path: PathBuf,
}

impl Default for Config {
	fn default() -> Self {
		let config_dir =
			dirs::config_dir().unwrap_or_else(|| PathBuf::from(".")).join("signond");
		let runtime_dir = std::env::var_os("XDG_RUNTIME_DIR")
			.map(PathBuf::from)
			.unwrap_or_else(std::env::temp_dir);
		Config {
			storage_path: config_dir,
			plugins_dir: PathBuf::from("/usr/lib/signon"),
			extensions_dir: PathBuf::from("/usr/lib/signon/extensions"),
			daemon_timeout: 0,
			identity_timeout: DEFAULT_IDENTITY_TIMEOUT,
			auth_session_timeout: DEFAULT_SESSION_TIMEOUT,
			logging_level: None,
			logging_output: None,
			bus_path: runtime_dir.join(BUS_SOCKET),
		}
	}
}

impl Config {
	/// Loads the config file (if present) and applies env overrides.
	pub fn load() -> Self {
		let path = dirs::config_dir()
			.unwrap_or_else(|| PathBuf::from("."))
			.join("signond")
			.join(CONFIG_FILE);
		let mut config = Self::load_file(&path).unwrap_or_default();
		config.apply_env();
		config
	}

	fn load_file(path: &Path) -> Option<Config> {
		let raw = std::fs::read_to_string(path).ok()?;
		match toml::from_str(&raw) {
			Ok(config) => Some(config),
			Err(err) => {
				warn!("ignoring malformed config {}: {}", path.display(), err);
				None
			}
		}
	}

	fn apply_env(&mut self) {
		if let Some(path) = env_path("SSO_STORAGE_PATH") {
			self.storage_path = path;
		}
		if let Some(path) = env_path("SSO_PLUGINS_DIR") {
			self.plugins_dir = path;
		}
		if let Some(path) = env_path("SSO_EXTENSIONS_DIR") {
			self.extensions_dir = path;
		}
		if let Some(secs) = env_u64("SSO_DAEMON_TIMEOUT") {
			self.daemon_timeout = secs;
		}
		if let Some(secs) = env_u64("SSO_IDENTITY_TIMEOUT") {
			self.identity_timeout = secs;
		}
		if let Some(secs) = env_u64("SSO_AUTHSESSION_TIMEOUT") {
			self.auth_session_timeout = secs;
		}
		if let Ok(level) = std::env::var("SSO_LOGGING_LEVEL") {
			self.logging_level = Some(level);
		}
		if let Some(path) = env_path("SSO_LOGGING_OUTPUT") {
			self.logging_output = Some(path);
		}
		if let Some(path) = env_path("SSO_BUS_PATH") {
			self.bus_path = path;
		}
	}

	pub fn metadata_db_path(&self) -> PathBuf {
		self.storage_path.join("signon.db")
	}

	pub fn secrets_db_path(&self) -> PathBuf {
		self.storage_path.join("signon-secrets.db")
	}

	pub fn identity_timeout(&self) -> Duration {
		Duration::from_secs(self.identity_timeout)
	}

	pub fn auth_session_timeout(&self) -> Duration {
		Duration::from_secs(self.auth_session_timeout)
	}

	pub fn daemon_timeout(&self) -> Option<Duration> {
		(self.daemon_timeout > 0).then(|| Duration::from_secs(self.daemon_timeout))
	}
}

fn env_path(name: &str) -> Option<PathBuf> {
	std::env::var_os(name).filter(|v| !v.is_empty()).map(PathBuf::from)
}

fn env_u64(name: &str) -> Option<u64> {
	let raw = std::env::var(name).ok()?;
	match raw.parse() {
		Ok(value) => Some(value),
		Err(_) => {
			warn!("ignoring non-numeric {}={}", name, raw);
			None
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_are_sane() {
		let config = Config::default();
		assert_eq!(config.identity_timeout, DEFAULT_IDENTITY_TIMEOUT);
		assert_eq!(config.auth_session_timeout, DEFAULT_SESSION_TIMEOUT);
		assert_eq!(config.daemon_timeout(), None);
		assert!(config.metadata_db_path().ends_with("signon.db"));
		assert!(config.secrets_db_path().ends_with("signon-secrets.db"));
	}

	#[test]
	fn file_fields_parse() {
		let parsed: Config = toml::from_str(
			"storage-path = \"/tmp/sso\"\nidentity-timeout = 12\ndaemon-timeout = 60\n",
		)
		.expect("parse");
		assert_eq!(parsed.storage_path, PathBuf::from("/tmp/sso"));
		assert_eq!(parsed.identity_timeout, 12);
		assert_eq!(parsed.daemon_timeout(), Some(Duration::from_secs(60)));
	}
}

// vim: ts=4
