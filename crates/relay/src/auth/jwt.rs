// Access token validation. Tokens are issued by the account service; the
// relay shares its HS256 secret and only needs the subject.

use anyhow::{bail, Context};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const ACCESS_TOKEN_TTL_SECONDS: i64 = 15 * 60;
const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccessTokenClaims {
    sub: String,
    iat: i64,
    exp: i64,
}

#[derive(Clone)]
pub struct JwtAccessTokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtAccessTokenService {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.len() < MIN_SECRET_LEN {
            bail!("jwt secret must be at least {MIN_SECRET_LEN} characters long");
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    /// Mint a token for `user_id`. Used by tests and local tooling.
    pub fn issue_access_token(&self, user_id: Uuid) -> anyhow::Result<String> {
        self.issue_access_token_at(user_id, Utc::now().timestamp())
    }

    fn issue_access_token_at(&self, user_id: Uuid, issued_at: i64) -> anyhow::Result<String> {
        let claims = AccessTokenClaims {
            sub: user_id.to_string(),
            iat: issued_at,
            exp: issued_at + ACCESS_TOKEN_TTL_SECONDS,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("failed to encode access token")
    }

    /// Validate signature and expiry, returning the subject user id.
    pub fn validate_access_token(&self, token: &str) -> anyhow::Result<Uuid> {
        let claims = decode::<AccessTokenClaims>(token, &self.decoding_key, &self.validation)
            .context("failed to decode access token")?
            .claims;

        Uuid::parse_str(&claims.sub)
            .with_context(|| format!("access token subject '{}' is not a UUID", claims.sub))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_SECRET: &str = "onezone_test_secret_that_is_definitely_long_enough";

    #[test]
    fn short_secrets_are_rejected() {
        assert!(JwtAccessTokenService::new("too-short").is_err());
    }

    #[test]
    fn issued_token_validates_to_its_subject() {
        let service = JwtAccessTokenService::new(TEST_SECRET).expect("service should initialize");
        let user_id = Uuid::new_v4();

        let token = service.issue_access_token(user_id).expect("token should be issued");
        assert_eq!(service.validate_access_token(&token).expect("token should validate"), user_id);
    }

    #[test]
    fn rejects_tampered_tokens() {
        let service = JwtAccessTokenService::new(TEST_SECRET).expect("service should initialize");
        let token = service.issue_access_token(Uuid::new_v4()).expect("token should be issued");

        assert!(service.validate_access_token(&format!("{token}x")).is_err());
    }

    #[test]
    fn rejects_tokens_signed_with_another_secret() {
        let ours = JwtAccessTokenService::new(TEST_SECRET).expect("service should initialize");
        let theirs = JwtAccessTokenService::new("a_completely_different_secret_of_enough_length")
            .expect("service should initialize");
        let token = theirs.issue_access_token(Uuid::new_v4()).expect("token should be issued");

        assert!(ours.validate_access_token(&token).is_err());
    }

    #[test]
    fn rejects_expired_tokens() {
        let service = JwtAccessTokenService::new(TEST_SECRET).expect("service should initialize");
        let issued_at = Utc::now().timestamp() - ACCESS_TOKEN_TTL_SECONDS - 1;
        let token = service
            .issue_access_token_at(Uuid::new_v4(), issued_at)
            .expect("token should be issued");

        assert!(service.validate_access_token(&token).is_err());
    }

    #[test]
    fn rejects_tokens_with_non_uuid_subject() {
        let now = Utc::now().timestamp();
        let claims =
            AccessTokenClaims { sub: "not-a-uuid".into(), iat: now, exp: now + 60 };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
        )
        .expect("token should encode");

        let service = JwtAccessTokenService::new(TEST_SECRET).expect("service should initialize");
        assert!(service.validate_access_token(&token).is_err());
    }
}
