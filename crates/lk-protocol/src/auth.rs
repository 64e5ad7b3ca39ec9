/// Access tokens for joining rooms.
///
/// A token is an HS256 JWT signed with the project's API secret. The issuer is
/// the API key, the subject is the participant identity and the `video` claim
/// carries the room grants.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default token lifetime
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("api key and secret are required")]
    MissingCredentials,
    #[error("token has no identity")]
    MissingIdentity,
    #[error("failed to encode token: {0}")]
    Encode(String),
    #[error("token expired")]
    Expired,
    #[error("token issuer does not match api key")]
    IssuerMismatch,
    #[error("invalid token: {0}")]
    Invalid(String),
}

/// Room permissions carried in the `video` claim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoGrants {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub room_join: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub room: String,
    #[serde(default)]
    pub can_publish: bool,
    #[serde(default)]
    pub can_subscribe: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub hidden: bool,
}

impl VideoGrants {
    /// Grants for joining `room` with publish and subscribe rights.
    pub fn join(room: impl Into<String>) -> Self {
        Self {
            room_join: true,
            room: room.into(),
            can_publish: true,
            can_subscribe: true,
            hidden: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub sub: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub nbf: u64,
    pub exp: u64,
    pub video: VideoGrants,
}

/// Builder for a signed access token.
#[derive(Debug, Clone)]
pub struct AccessToken {
    api_key: String,
    api_secret: String,
    identity: String,
    name: String,
    grants: VideoGrants,
}

impl AccessToken {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            identity: String::new(),
            name: String::new(),
            grants: VideoGrants::default(),
        }
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_grants(mut self, grants: VideoGrants) -> Self {
        self.grants = grants;
        self
    }

    pub fn to_jwt(&self) -> Result<String, AuthError> {
        if self.api_key.is_empty() || self.api_secret.is_empty() {
            return Err(AuthError::MissingCredentials);
        }
        if self.identity.is_empty() {
            return Err(AuthError::MissingIdentity);
        }

        let now = unix_now();
        let claims = Claims {
            iss: self.api_key.clone(),
            sub: self.identity.clone(),
            name: self.name.clone(),
            nbf: now,
            exp: now + DEFAULT_TOKEN_TTL.as_secs(),
            video: self.grants.clone(),
        };

        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.api_secret.as_bytes()),
        )
        .map_err(|e| AuthError::Encode(e.to_string()))
    }
}

/// Server-side validation of tokens minted by [`AccessToken`].
#[derive(Debug, Clone)]
pub struct TokenVerifier {
    api_key: String,
    api_secret: String,
}

impl TokenVerifier {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[self.api_key.as_str()]);
        validation.validate_nbf = true;

        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.api_secret.as_bytes()),
            &validation,
        )
        .map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            ErrorKind::InvalidIssuer => AuthError::IssuerMismatch,
            _ => AuthError::Invalid(e.to_string()),
        })?;

        if data.claims.sub.is_empty() {
            return Err(AuthError::MissingIdentity);
        }
        Ok(data.claims)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "APIkey123";
    const SECRET: &str = "secret-at-least-32-bytes-long-for-hs256";

    #[test]
    fn mint_and_verify() {
        let token = AccessToken::new(KEY, SECRET)
            .with_identity("lt_0_pub")
            .with_name("Pub 0")
            .with_grants(VideoGrants::join("testroom1"))
            .to_jwt()
            .unwrap();

        let claims = TokenVerifier::new(KEY, SECRET).verify(&token).unwrap();
        assert_eq!(claims.iss, KEY);
        assert_eq!(claims.sub, "lt_0_pub");
        assert_eq!(claims.name, "Pub 0");
        assert!(claims.video.room_join);
        assert_eq!(claims.video.room, "testroom1");
        assert!(claims.exp > claims.nbf);
    }

    #[test]
    fn wrong_secret_rejected() {
        let token = AccessToken::new(KEY, SECRET)
            .with_identity("someone")
            .to_jwt()
            .unwrap();
        let result = TokenVerifier::new(KEY, "a-completely-different-secret-value").verify(&token);
        assert!(matches!(result, Err(AuthError::Invalid(_))));
    }

    #[test]
    fn wrong_issuer_rejected() {
        let token = AccessToken::new("other-key", SECRET)
            .with_identity("someone")
            .to_jwt()
            .unwrap();
        let result = TokenVerifier::new(KEY, SECRET).verify(&token);
        assert_eq!(result, Err(AuthError::IssuerMismatch));
    }

    #[test]
    fn identity_and_credentials_required() {
        assert_eq!(
            AccessToken::new(KEY, SECRET).to_jwt(),
            Err(AuthError::MissingIdentity)
        );
        assert_eq!(
            AccessToken::new("", SECRET).with_identity("x").to_jwt(),
            Err(AuthError::MissingCredentials)
        );
    }

    #[test]
    fn grants_serialize_camel_case() {
        let json = serde_json::to_string(&VideoGrants::join("r")).unwrap();
        assert!(json.contains("\"roomJoin\":true"));
        assert!(json.contains("\"canPublish\":true"));
        assert!(!json.contains("hidden"));
    }
}
