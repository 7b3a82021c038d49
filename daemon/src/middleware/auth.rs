//! Bearer-credential authentication.
//!
//! Tokens are configured, not issued: the daemon compares SHA-256 digests of
//! the presented credential against the configured set, so raw tokens are
//! neither stored in memory longer than needed nor leaked through timing on
//! the string compare. Unauthenticated routes (health, status, metrics) are
//! registered outside the scope this middleware wraps.

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error,
};
use futures_util::future::{ready, LocalBoxFuture, Ready};
use sha2::{Digest, Sha256};
use std::rc::Rc;
use std::sync::Arc;

use crate::error::AppError;

#[derive(Clone)]
pub struct AuthMiddleware {
    token_digests: Arc<Vec<[u8; 32]>>,
}

impl AuthMiddleware {
    pub fn new(tokens: &[String]) -> Self {
        let token_digests = tokens.iter().map(|t| digest(t)).collect();
        Self {
            token_digests: Arc::new(token_digests),
        }
    }

    fn authorized(&self, token: &str) -> bool {
        let presented = digest(token);
        self.token_digests.iter().any(|d| *d == presented)
    }
}

fn digest(token: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().into()
}

impl<S, B> Transform<S, ServiceRequest> for AuthMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = AuthMiddlewareService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AuthMiddlewareService {
            service: Rc::new(service),
            middleware: self.clone(),
        }))
    }
}

pub struct AuthMiddlewareService<S> {
    service: Rc<S>,
    middleware: AuthMiddleware,
}

impl<S, B> Service<ServiceRequest> for AuthMiddlewareService<S>
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
        let authorized = bearer_token(&req)
            .map(|token| self.middleware.authorized(token))
            .unwrap_or(false);

        if !authorized {
            return Box::pin(async move { Err(AppError::Unauthenticated.into()) });
        }

        let fut = self.service.call(req);
        Box::pin(fut)
    }
}

/// Extract the token from `Authorization: Bearer <token>`.
pub fn bearer_token(req: &ServiceRequest) -> Option<&str> {
    req.headers()
        .get("Authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}
