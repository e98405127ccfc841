use std::future::{ready, Ready};
use std::num::NonZeroU32;
use std::sync::Arc;

use actix_web::{
    body::EitherBody,
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error, HttpMessage, ResponseError,
};
use akashi_common::{AppError, HttpError, RequestId};
use futures::future::LocalBoxFuture;
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota};

use crate::services::api_keys::parse_api_key_header;
use crate::services::jwt::JwtManager;

/// A token-bucket rule attached to a route prefix.
pub struct RateRule {
    pub prefix: String,
    pub per_second: u32,
    pub burst: u32,
}

struct CompiledRule {
    prefix: String,
    limiter: DefaultKeyedRateLimiter<String>,
}

enum RateKey {
    Exempt,
    Key(String),
}

struct Shared {
    rules: Vec<CompiledRule>,
    jwt: Arc<JwtManager>,
    clock: DefaultClock,
}

/// Keyed token buckets per route prefix. Authenticated callers are keyed by
/// agent id (admins exempt); everything else falls back to the peer IP.
/// Clones share the same buckets, so one instance serves all workers.
#[derive(Clone)]
pub struct RateLimitLayer {
    shared: Arc<Shared>,
}

impl RateLimitLayer {
    pub fn new(rules: Vec<RateRule>, jwt: Arc<JwtManager>) -> Self {
        let compiled = rules
            .into_iter()
            .map(|rule| {
                let per_second = NonZeroU32::new(rule.per_second.max(1)).unwrap_or(NonZeroU32::MIN);
                let burst = NonZeroU32::new(rule.burst.max(1)).unwrap_or(NonZeroU32::MIN);
                CompiledRule {
                    prefix: rule.prefix,
                    limiter: DefaultKeyedRateLimiter::keyed(
                        Quota::per_second(per_second).allow_burst(burst),
                    ),
                }
            })
            .collect();
        Self {
            shared: Arc::new(Shared {
                rules: compiled,
                jwt,
                clock: DefaultClock::default(),
            }),
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for RateLimitLayer
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = RateLimitService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RateLimitService {
            service,
            shared: self.shared.clone(),
        }))
    }
}

pub struct RateLimitService<S> {
    service: S,
    shared: Arc<Shared>,
}

impl<S, B> Service<ServiceRequest> for RateLimitService<S>
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
        let rule = self
            .shared
            .rules
            .iter()
            .find(|rule| req.path().starts_with(&rule.prefix));

        let Some(rule) = rule else {
            let fut = self.service.call(req);
            return Box::pin(async move { fut.await.map(ServiceResponse::map_into_left_body) });
        };

        let key = match extract_key(&req, &self.shared.jwt) {
            RateKey::Exempt => {
                let fut = self.service.call(req);
                return Box::pin(
                    async move { fut.await.map(ServiceResponse::map_into_left_body) },
                );
            }
            RateKey::Key(key) => key,
        };

        match rule.limiter.check_key(&key) {
            Ok(()) => {
                let fut = self.service.call(req);
                Box::pin(async move { fut.await.map(ServiceResponse::map_into_left_body) })
            }
            Err(not_until) => {
                let wait = not_until.wait_time_from(self.shared.clock.now());
                let retry_after_secs = wait.as_secs().max(1);
                let request_id = req.extensions().get::<RequestId>().map(|r| r.0.clone());
                let err = HttpError {
                    error: AppError::RateLimited { retry_after_secs },
                    request_id,
                };
                let response = err.error_response();
                let (http_req, _payload) = req.into_parts();
                Box::pin(async move {
                    Ok(ServiceResponse::new(http_req, response).map_into_right_body())
                })
            }
        }
    }
}

/// Key choice: verified admin tokens are exempt; other credentials bucket by
/// agent id; anonymous (or unverifiable) requests bucket by peer host. A bad
/// credential is not rejected here; auth does that a layer further in.
fn extract_key(req: &ServiceRequest, jwt: &JwtManager) -> RateKey {
    if let Some(header) = req
        .headers()
        .get("Authorization")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(token) = header.strip_prefix("Bearer ") {
            if let Ok(claims) = jwt.verify(token) {
                if claims.role.is_admin() {
                    return RateKey::Exempt;
                }
                return RateKey::Key(format!("agent:{}", claims.agent_id));
            }
        } else if let Some((agent_id, _secret)) = parse_api_key_header(header) {
            return RateKey::Key(format!("agent:{}", agent_id));
        }
    }

    let host = req
        .connection_info()
        .realip_remote_addr()
        .map(host_of)
        .unwrap_or_else(|| "unknown".to_string());
    RateKey::Key(format!("ip:{}", host))
}

/// Strip a trailing `:port` while leaving bare IPv6 addresses intact.
fn host_of(addr: &str) -> String {
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return rest[..end].to_string();
        }
    }
    match addr.rfind(':') {
        Some(idx) if addr[..idx].contains(':') => addr.to_string(), // bare IPv6
        Some(idx) => addr[..idx].to_string(),
        None => addr.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_extraction_handles_port_forms() {
        assert_eq!(host_of("10.0.0.1:4433"), "10.0.0.1");
        assert_eq!(host_of("10.0.0.1"), "10.0.0.1");
        assert_eq!(host_of("[::1]:4433"), "::1");
        assert_eq!(host_of("::1"), "::1");
        assert_eq!(host_of("2001:db8::2:1"), "2001:db8::2:1");
    }
}
