//! LiveKit access tokens
//!
//! Tokens are HS256 JWTs signed with the API secret. The API key is the
//! issuer, the participant identity is the subject, and room permissions
//! travel in the `video` grant.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};

use crate::error::{AssistError, Result};

/// Lifetime of a minted token.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(6 * 60 * 60);

/// Room permissions carried in the `video` claim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoGrant {
    pub room: String,
    pub room_join: bool,
    pub can_publish: bool,
    pub can_subscribe: bool,
}

impl VideoGrant {
    /// Join `room` with publish and subscribe rights.
    pub fn join(room: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            room_join: true,
            can_publish: true,
            can_subscribe: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub sub: String,
    pub name: String,
    pub jti: String,
    pub nbf: u64,
    pub exp: u64,
    pub video: VideoGrant,
}

/// Mints tokens for one LiveKit project.
#[derive(Clone)]
pub struct AccessTokenSigner {
    api_key: String,
    key: EncodingKey,
    ttl: Duration,
}

impl std::fmt::Debug for AccessTokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessTokenSigner")
            .field("api_key", &self.api_key)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl AccessTokenSigner {
    pub fn new(api_key: impl Into<String>, api_secret: &str) -> Self {
        Self {
            api_key: api_key.into(),
            key: EncodingKey::from_secret(api_secret.as_bytes()),
            ttl: DEFAULT_TOKEN_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn claims(&self, identity: &str, grant: VideoGrant) -> Claims {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Claims {
            iss: self.api_key.clone(),
            sub: identity.to_string(),
            name: identity.to_string(),
            jti: identity.to_string(),
            nbf: now,
            exp: now + self.ttl.as_secs(),
            video: grant,
        }
    }

    /// Sign a token for `identity` with `grant`.
    pub fn mint(&self, identity: &str, grant: VideoGrant) -> Result<String> {
        let claims = self.claims(identity, grant);
        encode(&Header::new(Algorithm::HS256), &claims, &self.key).map_err(|e| {
            AssistError::Other(format!("failed to sign access token: {e}"))
        })
    }
}
