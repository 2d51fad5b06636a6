//! Device credential verification

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;

use crate::error::AuthError;

/// Identity established by a verified credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedCredential {
    pub subject: String,
    pub expires_at: DateTime<Utc>,
    /// Device bound to the credential, if the issuer included one
    pub device_id: Option<String>,
}

impl VerifiedCredential {
    /// Whether the credential is still valid at `now`
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Checks bearer tokens presented in the handshake
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    /// Verify `token`, returning its subject and expiry
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidCredential`] or [`AuthError::Expired`]
    async fn verify(&self, token: &str) -> Result<VerifiedCredential, AuthError>;
}

/// Extract the token from an `Authorization` header value
#[must_use]
pub fn extract_bearer(value: &str) -> Option<&str> {
    let value = value.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Claims carried by device tokens
#[derive(Debug, Deserialize)]
struct DeviceClaims {
    exp: u64,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    user_id: Option<Value>,
    #[serde(default)]
    device_id: Option<String>,
}

impl DeviceClaims {
    fn subject(&self) -> Option<String> {
        self.sub
            .clone()
            .or_else(|| {
                self.user_id.as_ref().and_then(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
            })
            .or_else(|| self.device_id.clone())
            .filter(|s| !s.is_empty())
    }
}

/// HS256 JWT verifier using a shared secret
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    #[must_use]
    pub fn new(secret: &SecretString) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();
        validation.required_spec_claims.insert("exp".to_string());

        Self {
            key: DecodingKey::from_secret(secret.expose_secret().as_bytes()),
            validation,
        }
    }
}

#[async_trait]
impl CredentialVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedCredential, AuthError> {
        let data = decode::<DeviceClaims>(token, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => {
                    tracing::debug!(error = %e, "JWT rejected");
                    AuthError::InvalidCredential(e.to_string())
                }
            }
        })?;

        let claims = data.claims;
        let subject = claims.subject().ok_or_else(|| {
            AuthError::InvalidCredential("token has no subject".to_string())
        })?;
        let expires_at = i64::try_from(claims.exp)
            .ok()
            .and_then(|exp| DateTime::from_timestamp(exp, 0))
            .ok_or_else(|| AuthError::InvalidCredential("exp out of range".to_string()))?;

        let credential = VerifiedCredential {
            subject,
            expires_at,
            device_id: claims.device_id,
        };
        if !credential.is_valid_at(Utc::now()) {
            return Err(AuthError::Expired);
        }
        Ok(credential)
    }
}

#[cfg(test)]
mod tests {
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::json;

    use super::*;

    fn mint(claims: &Value, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn verifier() -> JwtVerifier {
        JwtVerifier::new(&SecretString::from("test-secret".to_string()))
    }

    fn future_exp() -> i64 {
        Utc::now().timestamp() + 3600
    }

    #[test]
    fn test_extract_bearer() {
        assert_eq!(extract_bearer("Bearer abc"), Some("abc"));
        assert_eq!(extract_bearer("bearer  abc "), Some("abc"));
        assert_eq!(extract_bearer("Basic abc"), None);
        assert_eq!(extract_bearer("Bearer "), None);
        assert_eq!(extract_bearer("abc"), None);
    }

    #[tokio::test]
    async fn test_valid_token() {
        let token = mint(&json!({"sub": "user-1", "exp": future_exp()}), "test-secret");
        let credential = verifier().verify(&token).await.unwrap();
        assert_eq!(credential.subject, "user-1");
        assert!(credential.is_valid_at(Utc::now()));
    }

    #[tokio::test]
    async fn test_subject_fallbacks() {
        let token = mint(
            &json!({"user_id": 42, "device_id": "esp-1", "exp": future_exp()}),
            "test-secret",
        );
        let credential = verifier().verify(&token).await.unwrap();
        assert_eq!(credential.subject, "42");
        assert_eq!(credential.device_id.as_deref(), Some("esp-1"));

        let token = mint(&json!({"device_id": "esp-2", "exp": future_exp()}), "test-secret");
        assert_eq!(verifier().verify(&token).await.unwrap().subject, "esp-2");
    }

    #[tokio::test]
    async fn test_expired_token() {
        let token = mint(
            &json!({"sub": "user-1", "exp": Utc::now().timestamp() - 10}),
            "test-secret",
        );
        assert_eq!(verifier().verify(&token).await, Err(AuthError::Expired));
    }

    #[tokio::test]
    async fn test_wrong_secret() {
        let token = mint(&json!({"sub": "user-1", "exp": future_exp()}), "other");
        assert!(matches!(
            verifier().verify(&token).await,
            Err(AuthError::InvalidCredential(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_subject() {
        let token = mint(&json!({"exp": future_exp()}), "test-secret");
        assert!(matches!(
            verifier().verify(&token).await,
            Err(AuthError::InvalidCredential(_))
        ));
    }
}
