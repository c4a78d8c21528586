pub mod auth;
pub mod correlation;
pub mod rate_limit;

pub use auth::{authenticate, require_admin, require_user, AuthOutcome};
pub use correlation::{correlation_layer, CorrelationId};
pub use rate_limit::rate_limit_layer;
