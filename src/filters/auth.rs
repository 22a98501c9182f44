//! Bearer token authentication and per-route consumer whitelists.
//!
//! # Decision Table
//!
//! | Route requires auth | Credential            | Outcome                      |
//! |---------------------|-----------------------|------------------------------|
//! | no                  | none / not Bearer     | continue as "anonymous"      |
//! | yes                 | none / malformed      | 401 + `WWW-Authenticate`     |
//! | any                 | Bearer, fails verify  | 401 + `WWW-Authenticate`     |
//! | any                 | Bearer, not listed    | 403                          |
//! | any                 | Bearer, valid         | continue as token's consumer |
//!
//! A token sent to a public route is still verified, so a client never
//! receives a 2xx for a credential that would be rejected elsewhere.
//!
//! The outcome is stored as an [`AuthState`] attribute on the context.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, Request, Response};
use tracing::{debug, info};

use crate::error::{GatewayError, GatewayResult};
use crate::jwt::JwtVerifier;
use crate::pipeline::{ANONYMOUS, AuthState, GatewayFilter, Next, RequestContext, order};

/// Credential found in the `Authorization` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credential<'a> {
    Missing,
    /// Present but not a usable `Bearer <token>`.
    Malformed,
    Bearer(&'a str),
}

/// Extract a bearer token from the request headers.
pub fn bearer_token(headers: &HeaderMap) -> Credential<'_> {
    let Some(value) = headers.get(AUTHORIZATION) else {
        return Credential::Missing;
    };
    let Ok(value) = value.to_str() else {
        return Credential::Malformed;
    };
    match value.trim().split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => {
            let token = token.trim();
            if token.is_empty() || token.contains(' ') {
                Credential::Malformed
            } else {
                Credential::Bearer(token)
            }
        }
        _ => Credential::Malformed,
    }
}

/// Verifies bearer tokens and enforces the route's consumer whitelist.
pub struct JwtAuthFilter {
    verifier: Arc<JwtVerifier>,
}

impl JwtAuthFilter {
    pub fn new(verifier: Arc<JwtVerifier>) -> Self {
        Self { verifier }
    }
}

#[async_trait]
impl GatewayFilter for JwtAuthFilter {
    fn name(&self) -> &'static str {
        "auth"
    }

    fn order(&self) -> i32 {
        order::AUTH
    }

    async fn filter(
        &self,
        ctx: &mut RequestContext,
        req: Request<Body>,
        next: Next<'_>,
    ) -> GatewayResult<Response<Body>> {
        let required = ctx.route().is_some_and(|route| route.auth_required);

        let token = match (bearer_token(req.headers()), required) {
            (Credential::Bearer(token), _) => token.to_string(),
            (_, false) => {
                ctx.attributes.insert(AuthState::NoAuthRequired);
                ctx.set_consumer_id(ANONYMOUS);
                return next.run(ctx, req).await;
            }
            (Credential::Missing, true) => {
                ctx.attributes.insert(AuthState::TokenMissing);
                debug!("Bearer token missing");
                return Err(GatewayError::AuthenticationMissing(
                    "Bearer token required".to_string(),
                ));
            }
            (Credential::Malformed, true) => {
                ctx.attributes.insert(AuthState::TokenMissing);
                debug!("Authorization header malformed");
                return Err(GatewayError::AuthenticationMissing(
                    "Authorization header must be 'Bearer <token>'".to_string(),
                ));
            }
        };

        let claims = match self.verifier.verify(&token).await {
            Ok(claims) => claims,
            Err(err) => {
                ctx.attributes.insert(AuthState::TokenInvalid);
                info!(reason = %err, "Bearer token rejected");
                return Err(err.into());
            }
        };

        let consumer_id = claims.consumer_id().to_string();
        if let Some(route) = ctx.route()
            && !route.admits(&consumer_id)
        {
            let route_id = route.id.clone();
            ctx.attributes.insert(AuthState::ConsumerNotWhitelisted);
            info!(consumer_id = %consumer_id, route_id = %route_id, "Consumer not whitelisted");
            return Err(GatewayError::AuthorizationDenied {
                consumer_id,
                route_id,
            });
        }

        ctx.set_consumer_id(consumer_id.clone());
        ctx.attributes.insert(AuthState::Authenticated { consumer_id });
        next.run(ctx, req).await
    }
}
