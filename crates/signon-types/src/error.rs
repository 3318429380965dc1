//! Error handling subsystem. Implements the canonical error taxonomy.
//!
//! The numeric codes are part of the IPC contract: clients and plugins of
//! earlier generations of the daemon identify errors by these numbers, so
//! they must never be renumbered. Codes at or above [`USER_ERROR_BASE`] are
//! plugin-defined and transported verbatim as `code:message`.

use serde::{Deserialize, Serialize};

pub type SsoResult<T> = std::result::Result<T, Error>;

/// First code of the plugin-defined error range.
pub const USER_ERROR_BASE: u32 = 400;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
	// Generic
	Unknown,
	InternalServer,
	InternalCommunication,
	PermissionDenied,
	EncryptionFailure,

	// Service
	MethodNotKnown,
	ServiceNotAvailable,
	InvalidQuery,

	// Identity
	MethodNotAvailable,
	IdentityNotFound,
	StoreFailed,
	RemoveFailed,
	SignOutFailed,
	IdentityOperationCanceled,
	CredentialsNotAvailable,
	ReferenceNotFound,

	// Session
	MechanismNotAvailable,
	MissingData,
	InvalidCredentials,
	NotAuthorized,
	WrongState,
	OperationNotSupported,
	NoConnection,
	Network,
	Ssl,
	Runtime,
	SessionCanceled,
	TimedOut,
	UserInteraction,
	OperationFailed,
	TosNotAccepted,
	ForgotPassword,
	MethodOrMechanismNotAllowed,
	IncorrectDate,

	/// Plugin-defined error, transported as `code:message`.
	User(u32, Box<str>),
}

impl Error {
	/// Stable numeric wire code.
	pub fn code(&self) -> u32 {
		match self {
			Error::Unknown => 1,
			Error::InternalServer => 2,
			Error::InternalCommunication => 3,
			Error::PermissionDenied => 4,
			Error::EncryptionFailure => 5,

			Error::MethodNotKnown => 101,
			Error::ServiceNotAvailable => 102,
			Error::InvalidQuery => 103,

			Error::MethodNotAvailable => 201,
			Error::IdentityNotFound => 202,
			Error::StoreFailed => 203,
			Error::RemoveFailed => 204,
			Error::SignOutFailed => 205,
			Error::IdentityOperationCanceled => 206,
			Error::CredentialsNotAvailable => 207,
			Error::ReferenceNotFound => 208,

			Error::MechanismNotAvailable => 301,
			Error::MissingData => 302,
			Error::InvalidCredentials => 303,
			Error::NotAuthorized => 304,
			Error::WrongState => 305,
			Error::OperationNotSupported => 306,
			Error::NoConnection => 307,
			Error::Network => 308,
			Error::Ssl => 309,
			Error::Runtime => 310,
			Error::SessionCanceled => 311,
			Error::TimedOut => 312,
			Error::UserInteraction => 313,
			Error::OperationFailed => 314,
			Error::TosNotAccepted => 316,
			Error::ForgotPassword => 317,
			Error::MethodOrMechanismNotAllowed => 318,
			Error::IncorrectDate => 319,

			Error::User(code, _) => *code,
		}
	}

	/// Reconstructs an error from its wire code. Unrecognized codes below
	/// the user range collapse to [`Error::Unknown`]; codes in the user
	/// range keep their number and message.
	pub fn from_code(code: u32, message: &str) -> Self {
		match code {
			1 => Error::Unknown,
			2 => Error::InternalServer,
			3 => Error::InternalCommunication,
			4 => Error::PermissionDenied,
			5 => Error::EncryptionFailure,

			101 => Error::MethodNotKnown,
			102 => Error::ServiceNotAvailable,
			103 => Error::InvalidQuery,

			201 => Error::MethodNotAvailable,
			202 => Error::IdentityNotFound,
			203 => Error::StoreFailed,
			204 => Error::RemoveFailed,
			205 => Error::SignOutFailed,
			206 => Error::IdentityOperationCanceled,
			207 => Error::CredentialsNotAvailable,
			208 => Error::ReferenceNotFound,

			301 => Error::MechanismNotAvailable,
			302 => Error::MissingData,
			303 => Error::InvalidCredentials,
			304 => Error::NotAuthorized,
			305 => Error::WrongState,
			306 => Error::OperationNotSupported,
			307 => Error::NoConnection,
			308 => Error::Network,
			309 => Error::Ssl,
			310 => Error::Runtime,
			311 => Error::SessionCanceled,
			312 => Error::TimedOut,
			313 => Error::UserInteraction,
			314 => Error::OperationFailed,
			316 => Error::TosNotAccepted,
			317 => Error::ForgotPassword,
			318 => Error::MethodOrMechanismNotAllowed,
			319 => Error::IncorrectDate,

			c if c >= USER_ERROR_BASE => Error::User(c, message.into()),
			_ => Error::Unknown,
		}
	}

	/// Maps a plugin error name (the symbolic form used on the plugin
	/// channel) to the canonical kind. Unknown names with a parseable
	/// numeric prefix land in the user range.
	pub fn from_plugin_error(code: u32, message: &str) -> Self {
		Self::from_code(code, message)
	}
}

impl std::fmt::Display for Error {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self {
			Error::User(code, message) => write!(f, "{}:{}", code, message),
			other => write!(f, "{:?}", other),
		}
	}
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
	fn from(err: std::io::Error) -> Self {
		tracing::warn!("io error: {}", err);
		Error::InternalCommunication
	}
}

impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		tracing::warn!("json error: {}", err);
		Error::InternalCommunication
	}
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Storage-tier error surface. The credentials DB façade records the last
/// one of these per public call; the IPC layer translates it into a
/// canonical [`Error`] at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StoreError {
	#[default]
	NoError,
	/// The secrets tier is not open.
	NotOpen,
	/// The backing database could not be reached or created.
	Connection,
	/// A statement failed to prepare or execute.
	Statement,
	Unknown,
}

impl StoreError {
	pub fn is_error(self) -> bool {
		self != StoreError::NoError
	}
}

impl std::fmt::Display for StoreError {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "{:?}", self)
	}
}

impl std::error::Error for StoreError {}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn codes_round_trip() {
		let all = [
			Error::Unknown,
			Error::InternalServer,
			Error::InternalCommunication,
			Error::PermissionDenied,
			Error::EncryptionFailure,
			Error::MethodNotKnown,
			Error::ServiceNotAvailable,
			Error::InvalidQuery,
			Error::MethodNotAvailable,
			Error::IdentityNotFound,
			Error::StoreFailed,
			Error::RemoveFailed,
			Error::SignOutFailed,
			Error::IdentityOperationCanceled,
			Error::CredentialsNotAvailable,
			Error::ReferenceNotFound,
			Error::MechanismNotAvailable,
			Error::MissingData,
			Error::InvalidCredentials,
			Error::NotAuthorized,
			Error::WrongState,
			Error::OperationNotSupported,
			Error::NoConnection,
			Error::Network,
			Error::Ssl,
			Error::Runtime,
			Error::SessionCanceled,
			Error::TimedOut,
			Error::UserInteraction,
			Error::OperationFailed,
			Error::TosNotAccepted,
			Error::ForgotPassword,
			Error::MethodOrMechanismNotAllowed,
			Error::IncorrectDate,
		];
		for err in all {
			assert_eq!(Error::from_code(err.code(), ""), err);
		}
	}

	#[test]
	fn user_range_keeps_code_and_message() {
		let err = Error::from_code(442, "flux capacitor");
		assert_eq!(err, Error::User(442, "flux capacitor".into()));
		assert_eq!(err.code(), 442);
		assert_eq!(err.to_string(), "442:flux capacitor");
	}

	#[test]
	fn unknown_reserved_code_collapses() {
		assert_eq!(Error::from_code(77, "whatever"), Error::Unknown);
	}
}

// vim: ts=4
