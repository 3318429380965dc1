//! Adapter trait and wire vocabulary for the UI prompt service.
//!
//! The daemon never draws dialogs itself. When a plugin needs user
//! interaction it emits a `ui_request`; the session engine augments the
//! request map with correlation data and forwards it here. The reply map
//! travels back into the plugin untouched except for the keys the engine
//! consumes. Key names and error codes are wire contract.

use async_trait::async_trait;
use std::fmt::Debug;

use crate::error::SsoResult;
use crate::types::SessionData;

// Dialog request keys.
pub const UI_KEY_REQUEST_ID: &str = "RequestId";
pub const UI_KEY_QUERY_PASSWORD: &str = "QueryPassword";
pub const UI_KEY_QUERY_USERNAME: &str = "QueryUserName";
pub const UI_KEY_USERNAME: &str = "UserName";
pub const UI_KEY_SECRET: &str = "Secret";
pub const UI_KEY_PASSWORD: &str = "Password";
pub const UI_KEY_CAPTION: &str = "Caption";
pub const UI_KEY_MESSAGE: &str = "Message";
pub const UI_KEY_METHOD: &str = "Method";
pub const UI_KEY_MECHANISM: &str = "Mechanism";
pub const UI_KEY_IDENTITY: &str = "Identity";
pub const UI_KEY_STORED_IDENTITY: &str = "StoredIdentity";
pub const UI_KEY_CLIENT_DATA: &str = "ClientData";
pub const UI_KEY_STORAGE_KEYS_UNAVAILABLE: &str = "StorageKeysUnavailable";
pub const UI_KEY_REFRESH: &str = "Refresh";
pub const UI_KEY_FORGOT_PASSWORD: &str = "ForgotPassword";
pub const UI_KEY_FORGOT_PASSWORD_URL: &str = "ForgotPasswordUrl";
pub const UI_KEY_CONFIRM: &str = "Confirm";
pub const UI_KEY_CONFIRM_COUNT: &str = "ConfirmCount";
pub const UI_KEY_URL_RESPONSE: &str = "UrlResponse";
pub const UI_KEY_CAPTCHA_RESPONSE: &str = "CaptchaResponse";

// Dialog reply error key and codes.
pub const UI_KEY_ERROR: &str = "QueryErrorCode";

pub const QUERY_ERROR_NONE: i64 = 0;
pub const QUERY_ERROR_GENERAL: i64 = 1;
pub const QUERY_ERROR_NO_SIGNONUI: i64 = 2;
pub const QUERY_ERROR_BAD_PARAMETERS: i64 = 3;
pub const QUERY_ERROR_CANCELED: i64 = 4;
pub const QUERY_ERROR_NOT_AVAILABLE: i64 = 5;
pub const QUERY_ERROR_BAD_URL: i64 = 6;
pub const QUERY_ERROR_BAD_CAPTCHA: i64 = 7;
pub const QUERY_ERROR_BAD_CAPTCHA_URL: i64 = 8;
pub const QUERY_ERROR_REFRESH_FAILED: i64 = 9;
pub const QUERY_ERROR_FORBIDDEN: i64 = 10;
pub const QUERY_ERROR_FORGOT_PASSWORD: i64 = 11;

/// Reads the reply error code; a missing key counts as success.
pub fn query_error(reply: &SessionData) -> i64 {
	reply.get(UI_KEY_ERROR).and_then(serde_json::Value::as_i64).unwrap_or(QUERY_ERROR_NONE)
}

/// Every UI service binding is required to implement this trait.
#[async_trait]
pub trait UiAdapter: Debug + Send + Sync {
	/// Shows (or updates) a dialog and waits for the user's reply. The
	/// call has no timeout of its own; cancellation arrives out of band
	/// through [`UiAdapter::cancel_ui_request`].
	async fn query_dialog(&self, params: SessionData) -> SsoResult<SessionData>;

	/// Refreshes an already open dialog (e.g. a new captcha image).
	async fn refresh_dialog(&self, params: SessionData) -> SsoResult<SessionData>;

	/// Cancels the dialog identified by the request id it was opened with.
	async fn cancel_ui_request(&self, request_id: &str) -> SsoResult<()>;
}

/// Fallback binding used when no UI service is configured: every query is
/// answered with `QUERY_ERROR_NO_SIGNONUI`.
#[derive(Debug, Default)]
pub struct NoUi;

#[async_trait]
impl UiAdapter for NoUi {
	async fn query_dialog(&self, _params: SessionData) -> SsoResult<SessionData> {
		let mut reply = SessionData::new();
		reply.insert(UI_KEY_ERROR.into(), QUERY_ERROR_NO_SIGNONUI.into());
		Ok(reply)
	}

	async fn refresh_dialog(&self, params: SessionData) -> SsoResult<SessionData> {
		self.query_dialog(params).await
	}

	async fn cancel_ui_request(&self, _request_id: &str) -> SsoResult<()> {
		Ok(())
	}
}

// vim: ts=4
