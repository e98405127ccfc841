pub mod auth;
pub mod metrics;
pub mod rate_limit;
pub mod recovery;
pub mod request_id;
pub mod security_headers;

pub use auth::{AuthMiddleware, Identity};
pub use metrics::RequestMetrics;
pub use rate_limit::{RateLimitLayer, RateRule};
pub use recovery::Recovery;
pub use request_id::RequestIdMiddleware;
pub use security_headers::SecurityHeaders;
