//! Per-client rate limiting.
//!
//! Token buckets from the `governor` crate, keyed by the caller's bearer
//! credential so each operator identity gets its own budget; anonymous
//! requests share buckets by peer address.

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    error::ErrorTooManyRequests,
    Error,
};
use futures_util::future::{ready, LocalBoxFuture, Ready};
use governor::{
    clock::DefaultClock, state::keyed::DefaultKeyedStateStore, Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::warn;

use super::auth::bearer_token;

type KeyedLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub req_per_second: u32,
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            req_per_second: 50,
            burst_size: 20,
        }
    }
}

#[derive(Clone)]
pub struct RateLimitMiddleware {
    limiter: Arc<KeyedLimiter>,
}

impl RateLimitMiddleware {
    pub fn new(config: RateLimitConfig) -> Self {
        let per_second =
            NonZeroU32::new(config.req_per_second.max(1)).expect("nonzero after max(1)");
        let burst = NonZeroU32::new(config.burst_size.max(1)).expect("nonzero after max(1)");
        let quota = Quota::per_second(per_second).allow_burst(burst);

        Self {
            limiter: Arc::new(RateLimiter::keyed(quota)),
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for RateLimitMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = RateLimitMiddlewareService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RateLimitMiddlewareService {
            service,
            limiter: self.limiter.clone(),
        }))
    }
}

pub struct RateLimitMiddlewareService<S> {
    service: S,
    limiter: Arc<KeyedLimiter>,
}

impl<S, B> Service<ServiceRequest> for RateLimitMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let key = client_key(&req);

        if self.limiter.check_key(&key).is_err() {
            warn!(client = %key, "rate limit exceeded");
            return Box::pin(async move { Err(ErrorTooManyRequests("rate limit exceeded")) });
        }

        let fut = self.service.call(req);
        Box::pin(fut)
    }
}

/// Bucket key: the bearer credential when present, else the peer address.
fn client_key(req: &ServiceRequest) -> String {
    if let Some(token) = bearer_token(req) {
        return format!("token:{}", token);
    }
    req.peer_addr()
        .map(|addr| format!("addr:{}", addr.ip()))
        .unwrap_or_else(|| "addr:unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_allows_then_throttles() {
        let mw = RateLimitMiddleware::new(RateLimitConfig {
            req_per_second: 1,
            burst_size: 3,
        });
        let key = "token:test".to_string();

        assert!(mw.limiter.check_key(&key).is_ok());
        assert!(mw.limiter.check_key(&key).is_ok());
        assert!(mw.limiter.check_key(&key).is_ok());
        assert!(mw.limiter.check_key(&key).is_err());
    }

    #[test]
    fn buckets_are_per_key() {
        let mw = RateLimitMiddleware::new(RateLimitConfig {
            req_per_second: 1,
            burst_size: 1,
        });

        assert!(mw.limiter.check_key(&"token:a".to_string()).is_ok());
        assert!(mw.limiter.check_key(&"token:a".to_string()).is_err());
        assert!(mw.limiter.check_key(&"token:b".to_string()).is_ok());
    }
}
