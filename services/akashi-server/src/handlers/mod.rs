pub mod agents;
pub mod auth;
pub mod conflicts;
pub mod decisions;
pub mod export;
pub mod grants;
pub mod health;
pub mod runs;
pub mod subscribe;

use actix_web::{error::JsonPayloadError, web, HttpMessage, HttpRequest, HttpResponse};
use akashi_common::{AppError, HttpError, RequestId, RequestMeta};

/// Default service so unmatched routes still answer with the envelope.
pub async fn not_found(meta: RequestMeta) -> Result<HttpResponse, HttpError> {
    Err(meta.fail(AppError::NotFound("route not found".to_string())))
}

/// Decode failures (bad JSON, unknown fields, oversized bodies) become 400
/// envelopes carrying the request id.
pub fn json_error_handler(err: JsonPayloadError, req: &HttpRequest) -> actix_web::Error {
    let request_id = req.extensions().get::<RequestId>().map(|r| r.0.clone());
    HttpError {
        error: AppError::Validation(err.to_string()),
        request_id,
    }
    .into()
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    auth::configure(cfg);
    runs::configure(cfg);
    decisions::configure(cfg);
    conflicts::configure(cfg);
    agents::configure(cfg);
    grants::configure(cfg);
    export::configure(cfg);
    subscribe::configure(cfg);
    health::configure(cfg);
}
