pub mod error;
pub mod response;
pub mod validation;

pub use error::{AppError, HttpError, Result};
pub use response::{ApiResponse, Meta, RequestId, RequestMeta};
