//! Installation authentication.
//!
//! The app signs a short-lived RS256 JWT with its private key and exchanges
//! it for an installation access token. Every pipeline run asks for a fresh
//! token; nothing is cached between runs.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest_middleware::ClientWithMiddleware;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use depwatch_core::CORRELATION_ID_HEADER;

/// Backdating of `iat`, to tolerate clock drift between us and GitHub.
const CLOCK_SKEW_SECS: i64 = 60;
/// GitHub rejects app JWTs that live longer than ten minutes.
const JWT_LIFETIME_SECS: i64 = 600;

/// A short-lived, installation-scoped API token.
#[derive(Clone)]
pub struct InstallationToken {
    value: String,
    expires_at: DateTime<Utc>,
}

impl InstallationToken {
    pub fn new(value: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            expires_at,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.value)
    }
}

impl fmt::Debug for InstallationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallationToken")
            .field("value", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("failed to sign app JWT")]
    Signing(#[source] jsonwebtoken::errors::Error),
    #[error("token request for installation {installation_id} could not be sent")]
    Transport {
        installation_id: u64,
        #[source]
        source: reqwest_middleware::Error,
    },
    #[error("token request for installation {installation_id} was rejected: {status} - {body}")]
    Rejected {
        installation_id: u64,
        status: u16,
        body: String,
    },
    #[error("token response for installation {installation_id} could not be parsed")]
    MalformedResponse {
        installation_id: u64,
        #[source]
        source: reqwest::Error,
    },
}

/// Source of installation tokens.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn installation_token(
        &self,
        correlation_id: Option<&str>,
        installation_id: u64,
    ) -> Result<InstallationToken, AuthError>;
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct GitHubAppClaims {
    pub iss: u64,
    pub iat: i64,
    pub exp: i64,
}

impl GitHubAppClaims {
    pub fn issued_at(app_id: u64, now: i64) -> Self {
        Self {
            iss: app_id,
            iat: now - CLOCK_SKEW_SECS,
            exp: now + JWT_LIFETIME_SECS,
        }
    }
}

#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Exchanges app credentials for installation tokens over the REST API.
pub struct InstallationAuthenticator {
    client: ClientWithMiddleware,
    api_url: String,
    app_id: u64,
    private_key: String,
}

impl InstallationAuthenticator {
    pub fn new(
        client: ClientWithMiddleware,
        api_url: impl Into<String>,
        app_id: u64,
        private_key: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_url: api_url.into(),
            app_id,
            private_key: private_key.into(),
        }
    }

    pub fn generate_jwt(&self) -> Result<String, AuthError> {
        let claims = GitHubAppClaims::issued_at(self.app_id, Utc::now().timestamp());

        let header = Header::new(Algorithm::RS256);
        let encoding_key =
            EncodingKey::from_rsa_pem(self.private_key.as_bytes()).map_err(AuthError::Signing)?;

        encode(&header, &claims, &encoding_key).map_err(AuthError::Signing)
    }
}

#[async_trait]
impl TokenSource for InstallationAuthenticator {
    async fn installation_token(
        &self,
        correlation_id: Option<&str>,
        installation_id: u64,
    ) -> Result<InstallationToken, AuthError> {
        let jwt = self.generate_jwt()?;
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_url, installation_id
        );

        info!("Requesting installation access token for installation {}", installation_id);

        let mut request_builder = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", jwt))
            .header("Accept", "application/vnd.github+json");

        if let Some(cid) = correlation_id {
            request_builder = request_builder.header(CORRELATION_ID_HEADER, cid);
        }

        let response = request_builder
            .send()
            .await
            .map_err(|source| AuthError::Transport {
                installation_id,
                source,
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            warn!(
                "GitHub App token request failed: {} - {}",
                status, body
            );
            return Err(AuthError::Rejected {
                installation_id,
                status,
                body,
            });
        }

        let token_response: InstallationTokenResponse =
            response
                .json()
                .await
                .map_err(|source| AuthError::MalformedResponse {
                    installation_id,
                    source,
                })?;

        info!(
            "Obtained installation access token (expires at {})",
            token_response.expires_at
        );
        Ok(InstallationToken::new(
            token_response.token,
            token_response.expires_at,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn authenticator(private_key: &str) -> InstallationAuthenticator {
        InstallationAuthenticator::new(
            reqwest_middleware::ClientBuilder::new(reqwest::Client::new()).build(),
            "http://127.0.0.1:9",
            42,
            private_key,
        )
    }

    #[test]
    fn test_claims_tolerate_clock_skew() {
        let claims = GitHubAppClaims::issued_at(42, 1_700_000_000);
        assert_eq!(
            claims,
            GitHubAppClaims {
                iss: 42,
                iat: 1_699_999_940,
                exp: 1_700_000_600,
            }
        );
    }

    #[test]
    fn test_invalid_private_key_is_a_signing_error() {
        let err = authenticator("not a pem").generate_jwt().unwrap_err();
        assert!(matches!(err, AuthError::Signing(_)));
    }

    #[tokio::test]
    async fn test_invalid_key_fails_before_any_request() {
        let err = authenticator("not a pem")
            .installation_token(None, 7)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Signing(_)));
    }

    #[test]
    fn test_token_debug_is_redacted() {
        let token = InstallationToken::new(
            "ghs_supersecret",
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        );
        let debug = format!("{:?}", token);
        assert!(!debug.contains("ghs_supersecret"));
        assert!(debug.contains("[REDACTED]"));
        assert_eq!(token.bearer(), "Bearer ghs_supersecret");
    }

    #[test]
    fn test_token_response_parses_github_timestamp() {
        let response: InstallationTokenResponse = serde_json::from_str(
            r#"{"token":"ghs_abc","expires_at":"2016-07-11T22:14:10Z","permissions":{"issues":"write"}}"#,
        )
        .unwrap();
        assert_eq!(response.token, "ghs_abc");
        assert_eq!(
            response.expires_at,
            Utc.with_ymd_and_hms(2016, 7, 11, 22, 14, 10).unwrap()
        );
    }
}
