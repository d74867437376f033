use crate::config::MIN_JWT_SECRET_LEN;
use crate::{Config, Error, UserId};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

/// Resolves a bearer credential to the user it was issued to.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Fails with [`Error::Authentication`] for missing, malformed, expired or
    /// forged credentials.
    async fn authenticate(&self, bearer: &str) -> Result<UserId, Error>;
}

const JWT_ALGORITHM: Algorithm = Algorithm::HS256;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
    iat: i64,
}

/// HS256 JSON Web Tokens whose `sub` claim is the user id.
pub struct JwtAuthenticator {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(JWT_ALGORITHM);
        validation.leeway = 0;

        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Uses `config.jwt_secret`, rejecting secrets too short for HS256.
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        if config.jwt_secret.len() < MIN_JWT_SECRET_LEN {
            return Err(Error::Validation(format!(
                "JWT secret must be at least {MIN_JWT_SECRET_LEN} bytes"
            )));
        }
        Ok(Self::new(config.jwt_secret.as_bytes()))
    }

    /// Signs a token for `user` that expires after `ttl`.
    pub fn issue(&self, user: &UserId, ttl: Duration) -> Result<String, Error> {
        let now = Utc::now();
        let exp = now
            .checked_add_signed(ttl)
            .ok_or_else(|| Error::Validation("token lifetime out of range".to_string()))?;
        let claims = Claims {
            sub: user.to_string(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
        };

        encode(&Header::new(JWT_ALGORITHM), &claims, &self.encoding_key)
            .map_err(|err| Error::Authentication(format!("failed to sign token: {err}")))
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(&self, bearer: &str) -> Result<UserId, Error> {
        let token = bearer.strip_prefix("Bearer ").unwrap_or(bearer).trim();
        if token.is_empty() {
            return Err(Error::Authentication("missing bearer token".to_string()));
        }

        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|err| Error::Authentication(err.to_string()))?;

        if data.claims.sub.is_empty() {
            return Err(Error::Authentication("token has an empty subject".to_string()));
        }
        Ok(UserId::from(data.claims.sub))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"an-hs256-secret-of-at-least-32-bytes!";

    #[tokio::test]
    async fn test_issued_token_authenticates() {
        let auth = JwtAuthenticator::new(SECRET);
        let alice = UserId::from("alice");
        let token = auth.issue(&alice, Duration::minutes(5)).unwrap();

        assert_eq!(auth.authenticate(&token).await.unwrap(), alice);
        assert_eq!(
            auth.authenticate(&format!("Bearer {token}")).await.unwrap(),
            alice
        );
    }

    #[tokio::test]
    async fn test_expired_token_is_rejected() {
        let auth = JwtAuthenticator::new(SECRET);
        let token = auth
            .issue(&UserId::from("alice"), Duration::minutes(-5))
            .unwrap();

        let err = auth.authenticate(&token).await.unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
    }

    #[tokio::test]
    async fn test_foreign_signature_is_rejected() {
        let issuer = JwtAuthenticator::new(b"some-other-secret-that-is-long-enough");
        let token = issuer.issue(&UserId::from("alice"), Duration::minutes(5)).unwrap();

        let err = JwtAuthenticator::new(SECRET)
            .authenticate(&token)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "AUTHENTICATION_ERROR");
    }

    #[tokio::test]
    async fn test_garbage_is_rejected() {
        let auth = JwtAuthenticator::new(SECRET);
        assert!(auth.authenticate("").await.is_err());
        assert!(auth.authenticate("Bearer not.a.jwt").await.is_err());
    }

    #[tokio::test]
    async fn test_from_config_uses_the_configured_secret() {
        let config = Config {
            jwt_secret: String::from_utf8(SECRET.to_vec()).unwrap(),
            ..Config::default()
        };
        let auth = JwtAuthenticator::from_config(&config).unwrap();
        let token = JwtAuthenticator::new(SECRET)
            .issue(&UserId::from("alice"), Duration::minutes(5))
            .unwrap();

        assert_eq!(auth.authenticate(&token).await.unwrap(), UserId::from("alice"));

        let empty = JwtAuthenticator::from_config(&Config::default());
        assert!(matches!(empty, Err(Error::Validation(_))));
    }
}
