//! Bearer token verification.

pub mod keys;

use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, Validation, decode, decode_header};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use keys::{JwksKeySource, KeySource, NoKeySource, StaticKeySource};

use crate::config::Config;
use crate::error::{GatewayError, GatewayResult};
use crate::pipeline::UNKNOWN;

/// Why a token was not accepted.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Token has expired")]
    Expired,

    #[error("Token is not valid yet")]
    NotYetValid,

    #[error("Token signature is invalid")]
    InvalidSignature,

    #[error("Token is malformed: {0}")]
    Malformed(String),

    #[error("Token was rejected: {0}")]
    Rejected(String),

    #[error("No verification key matches kid {0:?}")]
    UnknownKey(Option<String>),

    #[error("Verification keys are unavailable: {0}")]
    KeySetUnavailable(String),
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            ErrorKind::ImmatureSignature => AuthError::NotYetValid,
            ErrorKind::InvalidSignature => AuthError::InvalidSignature,
            ErrorKind::InvalidToken
            | ErrorKind::Base64(_)
            | ErrorKind::Json(_)
            | ErrorKind::Utf8(_) => AuthError::Malformed(err.to_string()),
            _ => AuthError::Rejected(err.to_string()),
        }
    }
}

impl From<AuthError> for GatewayError {
    fn from(err: AuthError) -> Self {
        GatewayError::AuthenticationInvalid(err.to_string())
    }
}

/// Claims the gateway reads from a verified token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Authorized party.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    pub exp: u64,
}

impl Claims {
    /// Consumer id: `azp`, then `client_id`, then "unknown".
    pub fn consumer_id(&self) -> &str {
        [self.azp.as_deref(), self.client_id.as_deref()]
            .into_iter()
            .flatten()
            .find(|id| !id.trim().is_empty())
            .unwrap_or(UNKNOWN)
    }
}

/// Validation settings for [`JwtVerifier`].
#[derive(Debug, Clone)]
pub struct VerifierSettings {
    pub algorithms: Vec<Algorithm>,
    pub issuer: Option<String>,
    pub audience: Option<String>,
    pub leeway: Duration,
}

impl Default for VerifierSettings {
    fn default() -> Self {
        Self {
            algorithms: vec![Algorithm::HS256],
            issuer: None,
            audience: None,
            leeway: Duration::from_secs(30),
        }
    }
}

/// Verifies signature, expiry and optional issuer/audience of bearer tokens.
pub struct JwtVerifier {
    keys: Arc<dyn KeySource>,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(keys: Arc<dyn KeySource>, settings: VerifierSettings) -> Self {
        let first = settings.algorithms.first().copied().unwrap_or(Algorithm::HS256);
        let mut validation = Validation::new(first);
        validation.algorithms = settings.algorithms;
        validation.leeway = settings.leeway.as_secs();
        validation.validate_nbf = true;
        match &settings.issuer {
            Some(issuer) => validation.set_issuer(&[issuer]),
            None => validation.iss = None,
        }
        match &settings.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }
        Self { keys, validation }
    }

    /// Build the verifier described by `JWT_SECRET` / `JWKS_URL`.
    pub fn from_config(config: &Config) -> GatewayResult<Self> {
        let keys: Arc<dyn KeySource> = match (&config.jwt_secret, &config.jwks_url) {
            (Some(secret), None) => Arc::new(StaticKeySource::from_secret(secret.as_bytes())),
            (None, Some(url)) => Arc::new(
                JwksKeySource::new(url.clone(), config.jwks_cache_ttl, config.jwks_fetch_timeout)
                    .map_err(|e| GatewayError::ConfigError(e.to_string()))?,
            ),
            (None, None) => Arc::new(NoKeySource),
            (Some(_), Some(_)) => {
                return Err(GatewayError::ConfigError(
                    "JWT_SECRET and JWKS_URL are mutually exclusive".to_string(),
                ));
            }
        };

        Ok(Self::new(
            keys,
            VerifierSettings {
                algorithms: config.jwt_algorithms.clone(),
                issuer: config.jwt_issuer.clone(),
                audience: config.jwt_audience.clone(),
                leeway: config.jwt_leeway,
            },
        ))
    }

    /// Verify `token` and return its claims.
    ///
    /// Any failure (including an unreachable key set) is final for this
    /// request; nothing is retried.
    pub async fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let header = decode_header(token)?;
        if !self.validation.algorithms.contains(&header.alg) {
            return Err(AuthError::Rejected(format!(
                "algorithm {:?} is not accepted",
                header.alg
            )));
        }

        let key = self.keys.key_for(&header).await?;
        let data = decode::<Claims>(token, &key, &self.validation)?;
        Ok(data.claims)
    }
}
