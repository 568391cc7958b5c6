//! In-memory response caching for safe requests.
//!
//! Cached entries are keyed by method, request URI and the `Accept`
//! header, and served with an `X-Cache` header describing the outcome:
//! `HIT`, `MISS`, `PASS` (uncacheable) or `PURGED` (evicted by an unsafe
//! request).

mod lru;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::Response;
use log::debug;

use crate::dispatcher::{Behaviour, Flow, RequestContext};

pub use lru::LruMap;

const CACHE_HEADER: &str = "x-cache";

/// A buffered response held in the cache.
#[derive(Clone)]
struct CachedResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    stored_at: Instant,
}

impl CachedResponse {
    fn to_response(&self) -> Response {
        let mut response = Response::new(Body::from(self.body.clone()));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers.clone();
        response
            .headers_mut()
            .insert(CACHE_HEADER, HeaderValue::from_static("HIT"));
        response
    }
}

/// Bounded LRU store for buffered responses.
pub struct ResponseCache {
    entries: Mutex<LruMap<String, CachedResponse>>,
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Self {
        ResponseCache {
            entries: Mutex::new(LruMap::new(capacity)),
        }
    }

    fn get(&self, key: &str, ttl: Duration) -> Option<CachedResponse> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get(&key.to_string())?.clone();
        if ttl > Duration::ZERO && entry.stored_at.elapsed() > ttl {
            entries.remove(&key.to_string());
            return None;
        }
        Some(entry)
    }

    fn store(&self, key: String, response: CachedResponse) {
        self.entries.lock().unwrap().insert(key, response);
    }

    fn purge(&self, key: &str) {
        self.entries.lock().unwrap().remove(&key.to_string());
    }
}

/// Marker stored in the request context between `pre` and `post` when the
/// response should be written to the cache.
struct PendingCache {
    key: String,
}

/// Caching behaviour for the dispatcher chain.
pub struct CachingBehaviour {
    cache: Arc<ResponseCache>,
}

impl CachingBehaviour {
    pub fn new(cache: Arc<ResponseCache>) -> Self {
        CachingBehaviour { cache }
    }

    fn accept_of(ctx: &RequestContext) -> &str {
        ctx.headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }

    /// Entries are keyed per method so a HEAD never serves a cached GET
    /// body.
    fn identifier(method: &axum::http::Method, ctx: &RequestContext) -> String {
        format!("{}_{}_{}", method, ctx.uri, Self::accept_of(ctx))
    }
}

#[async_trait]
impl Behaviour for CachingBehaviour {
    async fn pre(&self, ctx: &mut RequestContext) -> Result<Flow> {
        if !ctx.app.caching.enabled {
            return Ok(Flow::Continue);
        }

        if !ctx.is_safe() {
            if ctx.app.caching.auto_flush {
                use axum::http::Method;
                for method in [Method::GET, Method::HEAD, Method::OPTIONS] {
                    let key = Self::identifier(&method, ctx);
                    debug!("purging cache entry for '{}'", key);
                    self.cache.purge(&key);
                }
                ctx.response_headers
                    .insert(CACHE_HEADER, HeaderValue::from_static("PURGED"));
            }
            return Ok(Flow::Continue);
        }

        let key = Self::identifier(&ctx.method, ctx);

        let no_cache = ctx
            .headers
            .get(header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            == Some("no-cache");
        if no_cache {
            ctx.response_headers
                .insert(CACHE_HEADER, HeaderValue::from_static("PASS"));
            return Ok(Flow::Continue);
        }

        let ttl = Duration::from_secs(ctx.app.caching.ttl);
        if let Some(entry) = self.cache.get(&key, ttl) {
            return Ok(Flow::Respond(entry.to_response()));
        }

        ctx.ext.insert(Arc::new(PendingCache { key }));
        Ok(Flow::Continue)
    }

    async fn post(&self, ctx: &mut RequestContext, response: &mut Response) -> Result<()> {
        let Some(pending) = ctx.ext.get::<Arc<PendingCache>>() else {
            return Ok(());
        };

        // Error responses are passed through uncached
        if response.status().as_u16() >= 400 {
            response
                .headers_mut()
                .insert(CACHE_HEADER, HeaderValue::from_static("PASS"));
            return Ok(());
        }

        let body = std::mem::replace(response.body_mut(), Body::empty());
        let bytes = axum::body::to_bytes(body, usize::MAX).await?;

        self.cache.store(
            pending.key.clone(),
            CachedResponse {
                status: response.status(),
                headers: response.headers().clone(),
                body: bytes.clone(),
                stored_at: Instant::now(),
            },
        );

        response
            .headers_mut()
            .insert(CACHE_HEADER, HeaderValue::from_static("MISS"));
        *response.body_mut() = Body::from(bytes);

        Ok(())
    }
}
