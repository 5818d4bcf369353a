//! Claims cookie verification.
//!
//! Viewers present an HS256-signed JWT in a cookie (default `ev_token`),
//! issued by the login service. A verified token becomes an [`Identity`].

use axum::extract::FromRequestParts;
use axum::http::header::COOKIE;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use evcam_core::config::AuthConfig;
use evcam_core::types::{Identity, Role};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;
use crate::http::AppState;

/// Claims bundle carried in the cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub username: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub assigned_cameras: Vec<String>,
    /// Expiry, seconds since the epoch
    pub exp: i64,
}

impl Claims {
    pub fn into_identity(self) -> Identity {
        Identity {
            username: self.username,
            role: self.role,
            assigned_cameras: self.assigned_cameras,
            expiry: DateTime::<Utc>::from_timestamp(self.exp, 0).unwrap_or(DateTime::<Utc>::MIN_UTC),
        }
    }
}

pub struct ClaimsVerifier {
    key: DecodingKey,
    validation: Validation,
    cookie_name: String,
}

impl std::fmt::Debug for ClaimsVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimsVerifier")
            .field("cookie_name", &self.cookie_name)
            .finish_non_exhaustive()
    }
}

impl ClaimsVerifier {
    pub fn new(secret: &[u8], cookie_name: impl Into<String>, leeway_secs: u64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = leeway_secs;
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
            cookie_name: cookie_name.into(),
        }
    }

    /// Build from the `[auth]` config section. Fails when no secret is set.
    pub fn from_config(auth: &AuthConfig) -> anyhow::Result<Self> {
        let secret = auth
            .secret_key
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("auth.secret_key is not set (export EV_SECRET_KEY)"))?;
        Ok(Self::new(
            secret.expose_secret().as_bytes(),
            auth.cookie_name.clone(),
            auth.leeway_secs,
        ))
    }

    pub fn verify_token(&self, token: &str) -> Result<Claims, ServiceError> {
        decode::<Claims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => ServiceError::Unauthenticated("Token expired"),
                _ => ServiceError::Unauthenticated("Invalid token"),
            })
    }

    /// Verify the claims cookie in `headers`.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, ServiceError> {
        let token = cookie_value(headers, &self.cookie_name)
            .ok_or(ServiceError::Unauthenticated("Authentication required"))?;
        Ok(self.verify_token(token)?.into_identity())
    }

    /// Claims for `GET /me`; any failure reads as "not signed in".
    pub fn current_claims(&self, headers: &HeaderMap) -> Option<Claims> {
        let token = cookie_value(headers, &self.cookie_name)?;
        self.verify_token(token).ok()
    }
}

/// Find `name` among the request's `Cookie` headers.
pub fn cookie_value<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.trim_matches('"'))
        .filter(|v| !v.is_empty())
}

/// Extractor for handlers that require a signed-in caller.
#[derive(Debug, Clone)]
pub struct Viewer(pub Identity);

impl FromRequestParts<AppState> for Viewer {
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let identity = state.verifier.authenticate(&parts.headers)?;
        tracing::debug!(user = %identity.username, role = %identity.role, "request authenticated");
        Ok(Viewer(identity))
    }
}
