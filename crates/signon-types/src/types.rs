//! Core data model: identity ids, identity info, session data maps and the
//! numeric enums shared by the daemon and its clients.

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::collections::HashMap;

/// Numeric identity identifier. `0` means "not yet persisted": the id is
/// assigned by the metadata tier on the first successful store and is
/// monotonic from then on.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct IdentityId(pub u32);

impl IdentityId {
	pub const NEW: IdentityId = IdentityId(0);

	pub fn is_new(self) -> bool {
		self.0 == 0
	}
}

impl std::fmt::Display for IdentityId {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

// Identity flags as persisted in the metadata tier.
pub const FLAG_VALIDATED: u32 = 0x1;
pub const FLAG_REMEMBER_PASSWORD: u32 = 0x2;
pub const FLAG_USERNAME_IS_SECRET: u32 = 0x4;

/// Broad classification of an identity, stored as-is in the type column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum CredentialsType {
	#[default]
	Other,
	Application,
	Web,
	Network,
}

impl From<CredentialsType> for u32 {
	fn from(typ: CredentialsType) -> u32 {
		match typ {
			CredentialsType::Other => 0,
			CredentialsType::Application => 1 << 0,
			CredentialsType::Web => 1 << 1,
			CredentialsType::Network => 1 << 2,
		}
	}
}

impl TryFrom<u32> for CredentialsType {
	type Error = String;

	fn try_from(value: u32) -> Result<Self, String> {
		match value {
			0 => Ok(CredentialsType::Other),
			1 => Ok(CredentialsType::Application),
			2 => Ok(CredentialsType::Web),
			4 => Ok(CredentialsType::Network),
			other => Err(format!("unknown credentials type {}", other)),
		}
	}
}

/// Method name → supported mechanism names.
pub type MethodMap = HashMap<Box<str>, Vec<Box<str>>>;

/// Identity record as it crosses the IPC bus. A plain value type: the
/// store takes and returns it by value, handles clone it freely.
///
/// The secret (and the username when `username_is_secret`) lives in the
/// secrets tier; both are `None` whenever they have been stripped for a
/// caller that must not see them.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IdentityInfo {
	pub id: IdentityId,
	pub caption: Box<str>,
	pub username: Option<Box<str>>,
	pub username_is_secret: bool,
	pub secret: Option<Box<str>>,
	pub store_secret: bool,
	pub validated: bool,
	#[serde(rename = "type")]
	pub typ: CredentialsType,
	pub ref_count: i32,
	pub methods: MethodMap,
	pub realms: Vec<Box<str>>,
	pub access_control_list: Vec<Box<str>>,
	pub owner_list: Vec<Box<str>>,
}

impl IdentityInfo {
	pub fn new() -> Self {
		Self::default()
	}

	/// Flags word for the metadata tier.
	pub fn flags(&self) -> u32 {
		let mut flags = 0;
		if self.validated {
			flags |= FLAG_VALIDATED;
		}
		if self.store_secret {
			flags |= FLAG_REMEMBER_PASSWORD;
		}
		if self.username_is_secret {
			flags |= FLAG_USERNAME_IS_SECRET;
		}
		flags
	}

	pub fn apply_flags(&mut self, flags: u32) {
		self.validated = flags & FLAG_VALIDATED != 0;
		self.store_secret = flags & FLAG_REMEMBER_PASSWORD != 0;
		self.username_is_secret = flags & FLAG_USERNAME_IS_SECRET != 0;
	}

	/// Removes secret material before the record is handed to a caller.
	pub fn strip_secrets(mut self) -> Self {
		self.secret = None;
		if self.username_is_secret {
			self.username = None;
		}
		self
	}

	/// True when the ACL contains the wildcard token permitting every peer.
	pub fn acl_has_wildcard(&self) -> bool {
		self.access_control_list.iter().any(|t| &**t == ACL_WILDCARD)
	}
}

/// Wildcard ACL token: permits every peer.
pub const ACL_WILDCARD: &str = "*";

/// Open key→value map exchanged with plugins, the UI service and stored as
/// the per-(identity, method) blob. Unknown keys are preserved end to end
/// so that plugin and service versions can drift.
pub type SessionData = serde_json::Map<String, serde_json::Value>;

// Well-known session data keys.
pub const KEY_USERNAME: &str = "UserName";
pub const KEY_SECRET: &str = "Secret";
pub const KEY_CAPTION: &str = "Caption";
pub const KEY_REALM: &str = "Realm";
pub const KEY_UI_POLICY: &str = "UiPolicy";
pub const KEY_ACCESS_CONTROL_TOKENS: &str = "AccessControlTokens";

/// UI interaction policies a client may request for a `process` call.
pub mod ui_policy {
	pub const DEFAULT: i64 = 0;
	/// Ask the user for the password only; any supplied secret is stripped
	/// before the parameters reach the plugin.
	pub const REQUEST_PASSWORD: i64 = 1;
	pub const NO_USER_INTERACTION: i64 = 2;
	pub const VALIDATION_ONLY: i64 = 3;
}

/// Authentication session progress states, relayed numerically to clients
/// through the `state_changed` signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum SessionState {
	NotStarted,
	HostResolving,
	ServerConnecting,
	DataSending,
	ReplyWaiting,
	UserPending,
	UiRefreshing,
	ProcessPending,
	SessionStarted,
	ProcessCanceling,
	ProcessDone,
	CustomState,
}

impl From<SessionState> for i32 {
	fn from(state: SessionState) -> i32 {
		state as i32
	}
}

impl TryFrom<i32> for SessionState {
	type Error = String;

	fn try_from(value: i32) -> Result<Self, String> {
		Ok(match value {
			0 => SessionState::NotStarted,
			1 => SessionState::HostResolving,
			2 => SessionState::ServerConnecting,
			3 => SessionState::DataSending,
			4 => SessionState::ReplyWaiting,
			5 => SessionState::UserPending,
			6 => SessionState::UiRefreshing,
			7 => SessionState::ProcessPending,
			8 => SessionState::SessionStarted,
			9 => SessionState::ProcessCanceling,
			10 => SessionState::ProcessDone,
			11 => SessionState::CustomState,
			other => return Err(format!("unknown session state {}", other)),
		})
	}
}

/// Kinds of the `info_updated` signal an identity object emits to every
/// client handle observing the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum IdentityChange {
	Removed,
	SignedOut,
	DataUpdated,
}

impl From<IdentityChange> for i32 {
	fn from(change: IdentityChange) -> i32 {
		change as i32
	}
}

impl TryFrom<i32> for IdentityChange {
	type Error = String;

	fn try_from(value: i32) -> Result<Self, String> {
		Ok(match value {
			0 => IdentityChange::Removed,
			1 => IdentityChange::SignedOut,
			2 => IdentityChange::DataUpdated,
			other => return Err(format!("unknown identity change {}", other)),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn flags_round_trip() {
		let mut info = IdentityInfo::new();
		info.validated = true;
		info.username_is_secret = true;
		assert_eq!(info.flags(), FLAG_VALIDATED | FLAG_USERNAME_IS_SECRET);

		let mut other = IdentityInfo::new();
		other.apply_flags(info.flags());
		assert!(other.validated);
		assert!(other.username_is_secret);
		assert!(!other.store_secret);
	}

	#[test]
	fn info_map_round_trip_is_lossless() {
		let mut info = IdentityInfo::new();
		info.id = IdentityId(7);
		info.caption = "mail".into();
		info.username = Some("alice".into());
		info.store_secret = true;
		info.typ = CredentialsType::Web;
		info.methods.insert("oauth2".into(), vec!["web_server".into()]);
		info.realms = vec!["example.org".into()];
		info.access_control_list = vec!["*".into()];
		info.owner_list = vec!["tok-owner".into()];

		let encoded = serde_json::to_value(&info).expect("encode");
		let decoded: IdentityInfo = serde_json::from_value(encoded).expect("decode");
		assert_eq!(decoded, info);
	}

	#[test]
	fn strip_secrets_hides_secret_username() {
		let mut info = IdentityInfo::new();
		info.username = Some("covert".into());
		info.username_is_secret = true;
		info.secret = Some("pw".into());
		let stripped = info.strip_secrets();
		assert_eq!(stripped.secret, None);
		assert_eq!(stripped.username, None);
	}

	#[test]
	fn wildcard_acl_detected() {
		let mut info = IdentityInfo::new();
		info.access_control_list = vec!["token-a".into(), "*".into()];
		assert!(info.acl_has_wildcard());
	}
}

// vim: ts=4
