//! JWT verification with cached key material.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, errors::ErrorKind};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::{GlobalAuth, parse_duration};
use crate::http::HttpClient;

const DEFAULT_KEY_CACHE_TTL: Duration = Duration::from_secs(300);

/// Claims the gateway cares about. Everything else is carried along in
/// `extra` untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(
        default,
        rename = "allowedApplications",
        skip_serializing_if = "Option::is_none"
    )]
    pub allowed_applications: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

struct CachedKey {
    key: String,
    expires_at: Instant,
}

/// Verifies JWTs against a configured or remotely fetched key.
///
/// PEM-shaped keys verify as RS256; anything else is used as an HS256
/// shared secret.
pub struct JwtVerifier {
    verification_key: String,
    verification_key_url: String,
    cache_ttl: Duration,
    http_client: HttpClient,
    cached_key: Mutex<Option<CachedKey>>,
}

impl JwtVerifier {
    pub fn new(cfg: &GlobalAuth, http_client: HttpClient) -> Result<Self> {
        let cache_ttl = if cfg.key_cache_ttl.is_empty() {
            DEFAULT_KEY_CACHE_TTL
        } else {
            parse_duration(&cfg.key_cache_ttl)
                .with_context(|| format!("invalid key_cache_ttl '{}'", cfg.key_cache_ttl))?
        };

        Ok(JwtVerifier {
            verification_key: cfg.verification_key.clone(),
            verification_key_url: cfg.verification_key_url.clone(),
            cache_ttl,
            http_client,
            cached_key: Mutex::new(None),
        })
    }

    /// Returns the verification key, fetching and caching it when only a
    /// key URL is configured.
    pub async fn verification_key(&self) -> Result<String> {
        if !self.verification_key.is_empty() {
            return Ok(self.verification_key.clone());
        }

        if self.verification_key_url.is_empty() {
            bail!("neither verification_key nor verification_key_url is configured");
        }

        {
            let cached = self.cached_key.lock().unwrap();
            if let Some(entry) = cached.as_ref() {
                if entry.expires_at > Instant::now() {
                    return Ok(entry.key.clone());
                }
            }
        }

        debug!(
            "fetching verification key from {}",
            self.verification_key_url
        );
        let key = self
            .http_client
            .get_text(&self.verification_key_url)
            .await
            .with_context(|| {
                format!(
                    "could not retrieve key from '{}'",
                    self.verification_key_url
                )
            })?;

        let mut cached = self.cached_key.lock().unwrap();
        *cached = Some(CachedKey {
            key: key.clone(),
            expires_at: Instant::now() + self.cache_ttl,
        });

        Ok(key)
    }

    /// Verifies a token. `Ok(None)` means the token is malformed, has a
    /// bad signature or is expired; hard failures (unusable key material)
    /// are errors.
    pub async fn verify(&self, token: &str) -> Result<Option<Claims>> {
        let key = self.verification_key().await?;

        let (decoding_key, algorithm) = if key.contains("-----BEGIN") {
            (
                DecodingKey::from_rsa_pem(key.as_bytes())
                    .context("verification key is not a usable RSA public key")?,
                Algorithm::RS256,
            )
        } else {
            (DecodingKey::from_secret(key.as_bytes()), Algorithm::HS256)
        };

        let mut validation = Validation::new(algorithm);
        // Tokens without an exp claim never expire
        validation.required_spec_claims = Default::default();
        validation.validate_aud = false;

        match decode::<Claims>(token, &decoding_key, &validation) {
            Ok(data) => Ok(Some(data.claims)),
            Err(e) => match e.kind() {
                ErrorKind::ExpiredSignature
                | ErrorKind::InvalidSignature
                | ErrorKind::InvalidToken
                | ErrorKind::InvalidAlgorithm
                | ErrorKind::ImmatureSignature
                | ErrorKind::Base64(_)
                | ErrorKind::Json(_)
                | ErrorKind::Utf8(_) => {
                    debug!("token failed verification: {}", e);
                    Ok(None)
                }
                _ => Err(anyhow::Error::new(e).context("token verification failed")),
            },
        }
    }
}
