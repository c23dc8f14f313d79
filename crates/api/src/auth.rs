//! Bearer-token verification for the HTTP surface.
//!
//! Token issuance lives in the external auth service; this extractor only
//! checks the HMAC signature with the shared `SECRET_KEY`. `BACKEND_LOCAL`
//! short-circuits the check for local development.

use actix_web::{FromRequest, HttpRequest, dev::Payload, web};
use futures_util::future::{Ready, ready};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use std::str::FromStr;

use crate::errors::ApiError;
use lineguard_core::config::AuthConfig;

#[derive(Debug, Deserialize)]
struct Claims {
    sub: Option<String>,
    #[allow(dead_code)]
    exp: usize,
}

/// The verified subject of the request's bearer token
#[derive(Debug, Clone)]
pub(crate) struct AuthenticatedUser(pub(crate) String);

impl std::ops::Deref for AuthenticatedUser {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AuthenticatedUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn verify(req: &HttpRequest) -> Result<AuthenticatedUser, ApiError> {
    let config = req
        .app_data::<web::Data<AuthConfig>>()
        .ok_or_else(|| ApiError::Internal("auth configuration missing".to_string()))?;

    if config.backend_local {
        return Ok(AuthenticatedUser("local".to_string()));
    }

    let secret = config
        .secret_key
        .as_deref()
        .ok_or_else(|| ApiError::Internal("SECRET_KEY is not configured".to_string()))?;

    let token = req
        .headers()
        .get("Authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::Unauthorized("missing bearer token".to_string()))?;

    let algorithm = Algorithm::from_str(&config.algorithm)
        .map_err(|_| ApiError::Internal(format!("unsupported ALGORITHM '{}'", config.algorithm)))?;

    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(algorithm),
    )
    .map_err(|e| ApiError::Unauthorized(format!("invalid token: {e}")))?;

    Ok(AuthenticatedUser(
        data.claims.sub.unwrap_or_else(|| "user".to_string()),
    ))
}

impl FromRequest for AuthenticatedUser {
    type Error = ApiError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(verify(req))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::json;

    fn local_config() -> AuthConfig {
        AuthConfig {
            secret_key: None,
            algorithm: "HS256".to_string(),
            backend_local: true,
        }
    }

    fn hs256_config(secret: &str) -> AuthConfig {
        AuthConfig {
            secret_key: Some(secret.to_string()),
            algorithm: "HS256".to_string(),
            backend_local: false,
        }
    }

    fn token(secret: &str, sub: &str) -> String {
        let exp = chrono::Utc::now().timestamp() as usize + 3600;
        encode(
            &Header::default(),
            &json!({ "sub": sub, "exp": exp }),
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[actix_web::test]
    async fn test_backend_local_bypasses_verification() {
        let req = TestRequest::default()
            .app_data(web::Data::new(local_config()))
            .to_http_request();
        let user = verify(&req).unwrap();
        assert_eq!(&*user, "local");
    }

    #[actix_web::test]
    async fn test_valid_token_yields_subject() {
        let req = TestRequest::default()
            .app_data(web::Data::new(hs256_config("s3cr3t")))
            .insert_header(("Authorization", format!("Bearer {}", token("s3cr3t", "inspector"))))
            .to_http_request();
        let user = verify(&req).unwrap();
        assert_eq!(&*user, "inspector");
    }

    #[actix_web::test]
    async fn test_bad_signature_is_unauthorized() {
        let req = TestRequest::default()
            .app_data(web::Data::new(hs256_config("right")))
            .insert_header(("Authorization", format!("Bearer {}", token("wrong", "x"))))
            .to_http_request();
        assert!(matches!(verify(&req), Err(ApiError::Unauthorized(_))));
    }

    #[actix_web::test]
    async fn test_missing_header_is_unauthorized() {
        let req = TestRequest::default()
            .app_data(web::Data::new(hs256_config("s")))
            .to_http_request();
        assert!(matches!(verify(&req), Err(ApiError::Unauthorized(_))));
    }
}
