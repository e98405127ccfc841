use std::future::{ready, Ready};
use std::panic::AssertUnwindSafe;

use actix_web::{
    body::EitherBody,
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error, HttpMessage,
};
use akashi_common::{AppError, HttpError, RequestId};
use actix_web::ResponseError;
use futures::future::LocalBoxFuture;
use futures::FutureExt;
use tracing::error;

/// Converts handler panics into generic 500 envelopes so a poisoned request
/// can never take the process down.
pub struct Recovery;

impl<S, B> Transform<S, ServiceRequest> for Recovery
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = RecoveryService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RecoveryService { service }))
    }
}

pub struct RecoveryService<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for RecoveryService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let http_req = req.request().clone();
        let request_id = req.extensions().get::<RequestId>().map(|r| r.0.clone());
        let method = req.method().to_string();
        let path = req.path().to_string();

        let fut = self.service.call(req);
        Box::pin(async move {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(result) => result.map(ServiceResponse::map_into_left_body),
                Err(panic) => {
                    let detail = panic_message(panic.as_ref());
                    error!(method, path, panic = %detail, "recovered panic in request handler");
                    let err = HttpError {
                        error: AppError::Internal("panic in request handler".to_string()),
                        request_id,
                    };
                    let response = err.error_response();
                    Ok(ServiceResponse::new(http_req, response).map_into_right_body())
                }
            }
        })
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
