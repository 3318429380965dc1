//! Wire protocol of the plugin worker channel.
//!
//! A plugin is an executable spawned once per session. Its stdin/stdout
//! carry length-delimited JSON frames; each frame is one of the tagged
//! variants below. The daemon side never blocks on the channel: frames are
//! pumped by the plugin proxy's reader task and surface as events on the
//! owning session.

use serde::{Deserialize, Serialize};

use crate::types::SessionData;

/// Frames sent from the daemon to the plugin worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PluginRequest {
	/// Starts processing one authentication request.
	Process { params: SessionData, mechanism: Box<str> },
	/// Feeds a UI dialog reply back into the running process.
	ProcessUi { data: SessionData },
	/// Feeds a refresh-dialog reply back into the running process.
	ProcessRefresh { data: SessionData },
	/// Asks the plugin to abort the running process.
	Cancel,
	/// Asks for the method name the plugin implements.
	Type,
	/// Asks for the mechanisms the plugin implements.
	Mechanisms,
}

/// Frames sent from the plugin worker to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "ev", rename_all = "snake_case")]
pub enum PluginResponse {
	/// Processing finished; `data` is the authenticated response.
	Result { data: SessionData },
	/// The plugin asks the daemon to persist a per-method blob.
	Store { data: SessionData },
	/// The plugin needs user interaction.
	UiRequest { data: SessionData },
	/// The plugin needs an already open dialog refreshed.
	RefreshRequest { data: SessionData },
	/// Processing failed. `code` is either a canonical error code or a
	/// plugin-defined one in the user range.
	Error { code: u32, message: String },
	/// Progress notification, relayed verbatim to clients.
	StateChanged { state: i32, message: String },
	TypeReply { method: Box<str> },
	MechanismsReply { mechanisms: Vec<Box<str>> },
}


// vim: ts=4
