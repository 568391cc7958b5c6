//! Token-bucket rate limiting.
//!
//! Clients are identified by their `Authorization` header when present,
//! falling back to the peer IP address. Each client gets `burst` tokens
//! per window; buckets reset once the window has elapsed since their
//! creation. Every response carries `X-RateLimit` and
//! `X-RateLimit-Remaining`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::Response;
use log::info;
use tokio::time::Instant;

use crate::config::{RateLimiting, parse_duration};
use crate::dispatcher::{Behaviour, Flow, RequestContext};

struct Bucket {
    remaining: i64,
    reset_at: Instant,
}

pub struct RateLimiter {
    burst: i64,
    window: Duration,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(cfg: &RateLimiting) -> Result<Self> {
        let window = parse_duration(&cfg.window)
            .with_context(|| format!("invalid rate limiting window '{}'", cfg.window))?;

        info!("initializing rate limiter (burst size {})", cfg.burst);

        Ok(RateLimiter {
            burst: cfg.burst,
            window,
            buckets: Mutex::new(HashMap::new()),
        })
    }

    /// Takes one token for the given client. Returns the remaining token
    /// count (may be negative) and the bucket limit.
    pub fn take_token(&self, client: &str) -> (i64, i64) {
        let mut buckets = self.buckets.lock().unwrap();
        let now = Instant::now();

        let bucket = buckets.entry(client.to_string()).or_insert_with(|| Bucket {
            remaining: self.burst,
            reset_at: now + self.window,
        });

        if now >= bucket.reset_at {
            bucket.remaining = self.burst;
            bucket.reset_at = now + self.window;
        }

        bucket.remaining -= 1;
        (bucket.remaining, self.burst)
    }

    /// Drops buckets whose window has elapsed. Runs forever; spawn it.
    pub async fn sweep(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.window.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let now = Instant::now();
            self.buckets
                .lock()
                .unwrap()
                .retain(|_, bucket| now < bucket.reset_at);
        }
    }
}

/// Rate limiting behaviour for the dispatcher chain.
pub struct RatelimitBehaviour {
    limiter: Arc<RateLimiter>,
}

impl RatelimitBehaviour {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        RatelimitBehaviour { limiter }
    }

    fn identify_client(ctx: &RequestContext) -> String {
        if let Some(auth) = ctx
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
        {
            return auth.replace(' ', "");
        }

        ctx.client_addr
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

#[async_trait]
impl Behaviour for RatelimitBehaviour {
    async fn pre(&self, ctx: &mut RequestContext) -> Result<Flow> {
        if !ctx.app.rate_limiting {
            return Ok(Flow::Continue);
        }

        let client = Self::identify_client(ctx);
        let (remaining, limit) = self.limiter.take_token(&client);

        ctx.response_headers
            .insert("x-ratelimit", HeaderValue::from_str(&limit.to_string())?);
        ctx.response_headers.insert(
            "x-ratelimit-remaining",
            HeaderValue::from_str(&remaining.max(0).to_string())?,
        );

        if remaining <= 0 {
            let response = Response::builder()
                .status(StatusCode::TOO_MANY_REQUESTS)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"msg":"rate limit exceeded"}"#))?;
            return Ok(Flow::Respond(response));
        }

        Ok(Flow::Continue)
    }
}
