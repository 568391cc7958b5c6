//! Authentication against the configured provider.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use axum::http::{HeaderMap, Uri};
use log::{debug, info, warn};
use serde_json::Value;

use crate::auth::{BearerTokenReader, JwtVerifier, TokenStore};
use crate::config::GlobalAuth;
use crate::http::HttpClient;

/// Marker error for failed credential checks, so callers can map it to a
/// 403 instead of a 500.
#[derive(Debug)]
pub struct InvalidCredentialsError;

impl std::fmt::Display for InvalidCredentialsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid credentials given")
    }
}

impl std::error::Error for InvalidCredentialsError {}

/// A JWT issued by the authentication provider.
#[derive(Debug, Clone)]
pub struct JwtResponse {
    pub jwt: String,
}

/// A verified token attached to an incoming request.
#[derive(Debug, Clone)]
pub struct AuthenticatedToken {
    pub jwt: String,
    pub allowed_applications: Option<Vec<String>>,
}

#[derive(Clone)]
struct ExpCacheEntry {
    /// 0 = never expires
    expires_at: i64,
    allowed_applications: Option<Vec<String>>,
}

/// Authenticates users against the provider and requests against their
/// stored tokens.
pub struct AuthenticationHandler {
    config: GlobalAuth,
    http_client: HttpClient,
    verifier: Arc<JwtVerifier>,
    token_reader: BearerTokenReader,
    exp_cache: Mutex<HashMap<String, ExpCacheEntry>>,
}

impl AuthenticationHandler {
    pub fn new(
        config: GlobalAuth,
        http_client: HttpClient,
        verifier: Arc<JwtVerifier>,
        token_store: Arc<dyn TokenStore>,
    ) -> Self {
        AuthenticationHandler {
            config,
            http_client,
            verifier,
            token_reader: BearerTokenReader::new(token_store),
            exp_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Authenticates a user against the provider. The request body is the
    /// provider's configured parameter object, merged with any extra
    /// fields from the client request, plus the credentials.
    #[tracing::instrument(skip(self, password, extra))]
    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
        extra: Option<&serde_json::Map<String, Value>>,
    ) -> Result<JwtResponse> {
        let mut auth_request = self.config.provider_config.parameters.clone();
        if let Some(extra) = extra {
            for (key, value) in extra {
                auth_request
                    .entry(key.clone())
                    .or_insert_with(|| value.clone());
            }
        }
        auth_request.insert("username".to_string(), Value::String(username.to_string()));
        auth_request.insert("password".to_string(), Value::String(password.to_string()));

        let request_url = format!("{}/authenticate", self.config.provider_config.url);

        let mut redacted = auth_request.clone();
        if redacted.contains_key("password") {
            redacted.insert(
                "password".to_string(),
                Value::String("*REDACTED*".to_string()),
            );
        }

        info!("authenticating user {}", username);
        debug!(
            "authentication request: {}",
            serde_json::to_string(&redacted).unwrap_or_default()
        );

        let response = self
            .http_client
            .inner()
            .post(&request_url)
            .header("Accept", "application/jwt")
            .json(&auth_request)
            .send()
            .await
            .with_context(|| format!("could not reach authentication provider at {}", request_url))?;

        let status = response.status();
        if status.as_u16() >= 400 {
            let body = response.text().await.unwrap_or_default();

            if status == reqwest::StatusCode::FORBIDDEN {
                warn!("invalid credentials for user {}: {}", username, body);
                return Err(anyhow::Error::new(InvalidCredentialsError));
            }

            bail!(
                "unexpected status code {} for user {}: {}",
                status,
                username,
                body
            );
        }

        let jwt = response
            .text()
            .await
            .context("could not read provider response")?;

        Ok(JwtResponse { jwt })
    }

    /// Checks whether a request carries a valid token. Verification
    /// results are cached per JWT until the JWT expires.
    pub async fn is_authenticated(
        &self,
        headers: &HeaderMap,
        uri: &Uri,
    ) -> Result<Option<AuthenticatedToken>> {
        let jwt = match self.token_reader.jwt_from_request(headers, uri).await {
            Ok(Some(jwt)) => jwt,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!("error while reading token from request: {}", e);
                return Err(e);
            }
        };

        let now = chrono::Utc::now().timestamp();

        let cached = self.exp_cache.lock().unwrap().get(&jwt).cloned();
        match cached {
            Some(entry) if entry.expires_at == 0 || entry.expires_at > now => {
                return Ok(Some(AuthenticatedToken {
                    jwt,
                    allowed_applications: entry.allowed_applications,
                }));
            }
            Some(_) => {
                self.exp_cache.lock().unwrap().remove(&jwt);
            }
            None => {}
        }

        let Some(claims) = self.verifier.verify(&jwt).await? else {
            return Ok(None);
        };

        let expires_at = claims.exp.unwrap_or(0);
        debug!("JWT verified, expires at {}", expires_at);

        let entry = ExpCacheEntry {
            expires_at,
            allowed_applications: claims.allowed_applications.clone(),
        };

        let mut cache = self.exp_cache.lock().unwrap();
        if cache.len() > 10_000 {
            cache.retain(|_, e| e.expires_at == 0 || e.expires_at > now);
        }
        cache.insert(jwt.clone(), entry);

        Ok(Some(AuthenticatedToken {
            jwt,
            allowed_applications: claims.allowed_applications,
        }))
    }

    pub fn config(&self) -> &GlobalAuth {
        &self.config
    }
}
