use std::future::{ready, Ready};

use actix_web::{dev::Payload, http::StatusCode, FromRequest, HttpMessage, HttpRequest, HttpResponse};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{AppError, HttpError};

/// Response metadata attached to every envelope.
#[derive(Debug, Clone, Serialize)]
pub struct Meta {
    pub request_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Meta {
    pub fn new(request_id: Option<String>) -> Self {
        Self {
            request_id,
            timestamp: Utc::now(),
        }
    }
}

/// Success envelope: `{ "data": ..., "meta": { "request_id", "timestamp" } }`.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub data: T,
    pub meta: Meta,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn new(data: T, request_id: impl Into<String>) -> Self {
        Self {
            data,
            meta: Meta::new(Some(request_id.into())),
        }
    }
}

/// Request-scoped id stored in request extensions by the request-id middleware.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Extractor giving handlers the request id plus envelope helpers. Falls back
/// to a fresh UUID if the middleware did not run (tests wiring bare routes).
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub request_id: String,
}

impl RequestMeta {
    pub fn from_request_parts(req: &HttpRequest) -> Self {
        let request_id = req
            .extensions()
            .get::<RequestId>()
            .map(|r| r.0.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Self { request_id }
    }

    /// Wrap `data` in the success envelope under the given status.
    pub fn respond<T: Serialize>(&self, status: StatusCode, data: T) -> HttpResponse {
        HttpResponse::build(status).json(ApiResponse::new(data, self.request_id.clone()))
    }

    pub fn ok<T: Serialize>(&self, data: T) -> HttpResponse {
        self.respond(StatusCode::OK, data)
    }

    pub fn created<T: Serialize>(&self, data: T) -> HttpResponse {
        self.respond(StatusCode::CREATED, data)
    }

    /// Bind an error to this request so the envelope carries the request id.
    pub fn fail<E: Into<AppError>>(&self, err: E) -> HttpError {
        HttpError::new(err.into(), self.request_id.clone())
    }
}

impl FromRequest for RequestMeta {
    type Error = std::convert::Infallible;
    type Future = Ready<std::result::Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(Ok(RequestMeta::from_request_parts(req)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_shape() {
        let body = ApiResponse::new(serde_json::json!({"x": 1}), "req-1");
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["data"]["x"], 1);
        assert_eq!(value["meta"]["request_id"], "req-1");
        assert!(value["meta"]["timestamp"].is_string());
    }
}
