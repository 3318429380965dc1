pub use signon_types::error::{Error, SsoResult, StoreError, StoreResult};
pub use signon_types::types::{IdentityId, IdentityInfo, SessionData};

pub use tracing::{debug, debug_span, error, error_span, info, info_span, warn, warn_span};

// vim: ts=4
