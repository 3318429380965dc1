pub use crate::error::{Error, SsoResult, StoreError, StoreResult};
pub use crate::types::{IdentityId, IdentityInfo, SessionData};

pub use tracing::{debug, debug_span, error, error_span, info, info_span, warn, warn_span};

// vim: ts=4
