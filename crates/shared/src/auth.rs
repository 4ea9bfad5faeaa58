//! Application auth tokens.
//!
//! Production deployments get these from the external identity provider; the
//! development relay and the `tools` binary use HS256 tokens with the same claim
//! shape so the whole flow can run locally.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::UserId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppClaims {
    pub sub: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub iat: i64,
    pub exp: i64,
}

impl AppClaims {
    pub fn user_id(&self) -> UserId {
        UserId::new(self.sub.clone())
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("auth token is empty")]
    Empty,
    #[error("auth token expired")]
    Expired,
    #[error("auth token rejected: {0}")]
    Invalid(String),
}

pub fn mint_app_token(
    secret: &str,
    user_id: &UserId,
    name: &str,
    image_url: Option<&str>,
    ttl_seconds: i64,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let claims = AppClaims {
        sub: user_id.as_str().to_string(),
        name: name.to_string(),
        image_url: image_url.map(str::to_string),
        iat: now.timestamp(),
        exp: (now + Duration::seconds(ttl_seconds)).timestamp(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

pub fn verify_app_token(secret: &str, token: &str) -> Result<AppClaims, AuthError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::Empty);
    }
    let validation = Validation::new(Algorithm::HS256);
    decode::<AppClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|err| match err.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
        _ => AuthError::Invalid(err.to_string()),
    })
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
