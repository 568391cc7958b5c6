//! Opaque token storage.
//!
//! Clients never see raw JWTs; they hold opaque tokens that the gateway
//! maps back to JWTs on every request. Tokens expire together with the
//! JWT's `exp` claim.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use async_trait::async_trait;
use base64::prelude::{BASE64_URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;

use crate::auth::JwtVerifier;
use crate::cache::LruMap;

/// A token together with the JWT it maps to.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedToken {
    pub jwt: String,
    pub token: String,
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Stores a JWT under a fresh random token. Returns the token and the
    /// expiration timestamp (0 when the JWT never expires).
    async fn add_token(&self, jwt: &str) -> Result<(String, i64)>;

    /// Stores a JWT under a caller-chosen token.
    async fn set_token(&self, token: &str, jwt: &str) -> Result<i64>;

    /// Resolves a token back to its JWT. Unknown or expired tokens yield
    /// `None`.
    async fn get_token(&self, token: &str) -> Result<Option<String>>;

    async fn all_tokens(&self) -> Result<Vec<MappedToken>>;
}

struct Entry {
    jwt: String,
    /// Unix timestamp; 0 means no expiration.
    expires_at: i64,
}

/// Process-local token store, validated against the JWT verifier.
pub struct InMemoryTokenStore {
    verifier: Arc<JwtVerifier>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryTokenStore {
    pub fn new(verifier: Arc<JwtVerifier>) -> Self {
        InMemoryTokenStore {
            verifier,
            entries: Mutex::new(HashMap::new()),
        }
    }

    async fn expiration_of(&self, jwt: &str) -> Result<i64> {
        match self.verifier.verify(jwt).await? {
            Some(claims) => Ok(claims.exp.unwrap_or(0)),
            None => bail!("JWT is invalid"),
        }
    }

    fn random_token() -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        BASE64_URL_SAFE_NO_PAD.encode(bytes)
    }
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn add_token(&self, jwt: &str) -> Result<(String, i64)> {
        let expires_at = self.expiration_of(jwt).await?;
        let token = Self::random_token();

        self.entries.lock().unwrap().insert(
            token.clone(),
            Entry {
                jwt: jwt.to_string(),
                expires_at,
            },
        );

        Ok((token, expires_at))
    }

    async fn set_token(&self, token: &str, jwt: &str) -> Result<i64> {
        let expires_at = self.expiration_of(jwt).await?;

        self.entries.lock().unwrap().insert(
            token.to_string(),
            Entry {
                jwt: jwt.to_string(),
                expires_at,
            },
        );

        Ok(expires_at)
    }

    async fn get_token(&self, token: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(token) {
            Some(entry) if entry.expires_at > 0 && entry.expires_at <= now_ts() => {
                entries.remove(token);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.jwt.clone())),
            None => Ok(None),
        }
    }

    async fn all_tokens(&self) -> Result<Vec<MappedToken>> {
        let now = now_ts();
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .iter()
            .filter(|(_, entry)| entry.expires_at == 0 || entry.expires_at > now)
            .map(|(token, entry)| MappedToken {
                jwt: entry.jwt.clone(),
                token: token.clone(),
            })
            .collect())
    }
}

const LOCAL_CACHE_SIZE: usize = 128;

/// Fronts another token store with a small local LRU cache for the hot
/// token -> JWT lookup.
pub struct CachedTokenStore {
    wrapped: Arc<dyn TokenStore>,
    cache: Mutex<LruMap<String, String>>,
}

impl CachedTokenStore {
    pub fn new(wrapped: Arc<dyn TokenStore>) -> Self {
        CachedTokenStore {
            wrapped,
            cache: Mutex::new(LruMap::new(LOCAL_CACHE_SIZE)),
        }
    }
}

#[async_trait]
impl TokenStore for CachedTokenStore {
    async fn add_token(&self, jwt: &str) -> Result<(String, i64)> {
        let (token, expires_at) = self.wrapped.add_token(jwt).await?;
        self.cache
            .lock()
            .unwrap()
            .insert(token.clone(), jwt.to_string());
        Ok((token, expires_at))
    }

    async fn set_token(&self, token: &str, jwt: &str) -> Result<i64> {
        let expires_at = self.wrapped.set_token(token, jwt).await?;
        self.cache
            .lock()
            .unwrap()
            .insert(token.to_string(), jwt.to_string());
        Ok(expires_at)
    }

    async fn get_token(&self, token: &str) -> Result<Option<String>> {
        if let Some(jwt) = self.cache.lock().unwrap().get(&token.to_string()) {
            return Ok(Some(jwt.clone()));
        }
        self.wrapped.get_token(token).await
    }

    async fn all_tokens(&self) -> Result<Vec<MappedToken>> {
        self.wrapped.all_tokens().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GlobalAuth;
    use crate::http::HttpClient;
    use crate::test_utils::sign_jwt;
    use serde_json::json;

    fn store() -> InMemoryTokenStore {
        let verifier = JwtVerifier::new(
            &GlobalAuth {
                verification_key: "s3cret".to_string(),
                ..GlobalAuth::default()
            },
            HttpClient::new(reqwest::Client::new()),
        )
        .unwrap();
        InMemoryTokenStore::new(Arc::new(verifier))
    }

    #[tokio::test]
    async fn test_add_and_resolve_token() {
        let store = store();
        let jwt = sign_jwt("s3cret", &json!({"sub": "alice"}));

        let (token, expires_at) = store.add_token(&jwt).await.unwrap();
        assert_eq!(expires_at, 0);
        assert_eq!(store.get_token(&token).await.unwrap(), Some(jwt));
    }

    #[tokio::test]
    async fn test_invalid_jwt_is_rejected() {
        let store = store();
        let jwt = sign_jwt("wrong-secret", &json!({"sub": "alice"}));
        assert!(store.add_token(&jwt).await.is_err());
    }

    #[tokio::test]
    async fn test_expiration_follows_exp_claim() {
        let store = store();
        let exp = chrono::Utc::now().timestamp() + 3600;
        let jwt = sign_jwt("s3cret", &json!({"sub": "alice", "exp": exp}));

        let (_, expires_at) = store.add_token(&jwt).await.unwrap();
        assert_eq!(expires_at, exp);
    }

    #[tokio::test]
    async fn test_set_token_uses_given_token() {
        let store = store();
        let jwt = sign_jwt("s3cret", &json!({"sub": "alice"}));

        store.set_token("my-token", &jwt).await.unwrap();
        assert_eq!(store.get_token("my-token").await.unwrap(), Some(jwt));
    }

    #[tokio::test]
    async fn test_unknown_token_is_none() {
        let store = store();
        assert_eq!(store.get_token("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_all_tokens() {
        let store = store();
        let jwt = sign_jwt("s3cret", &json!({"sub": "alice"}));
        let (token, _) = store.add_token(&jwt).await.unwrap();

        let all = store.all_tokens().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].token, token);
    }

    #[tokio::test]
    async fn test_cached_store_serves_from_cache() {
        let inner = Arc::new(store());
        let cached = CachedTokenStore::new(inner.clone());

        let jwt = sign_jwt("s3cret", &json!({"sub": "alice"}));
        let (token, _) = cached.add_token(&jwt).await.unwrap();

        assert_eq!(cached.get_token(&token).await.unwrap(), Some(jwt));
    }
}
