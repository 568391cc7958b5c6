//! Behaviour chain applied around proxied requests.
//!
//! Behaviours wrap every dispatched application, subject to that
//! application's configuration: rate limiting, authentication and
//! response caching. `pre` runs before the request is forwarded and may
//! short-circuit with a response; `post` runs on the way out, innermost
//! first.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{Extensions, HeaderMap, Method, Uri};
use axum::response::Response;

use crate::config::Application;

/// Per-request state threaded through the behaviour chain and the proxy.
pub struct RequestContext {
    pub app_name: String,
    pub app: Arc<Application>,
    pub method: Method,
    pub uri: Uri,
    /// Value of the Host header (or URI authority) of the incoming request.
    pub host: String,
    /// Request headers; behaviours may add headers for the upstream here.
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_addr: Option<SocketAddr>,
    /// Fully resolved upstream URL for this request.
    pub target_url: String,
    /// Headers added to whatever response is eventually returned.
    pub response_headers: HeaderMap,
    /// Scratch space for state shared between `pre` and `post`.
    pub ext: Extensions,
}

impl RequestContext {
    /// GET, HEAD and OPTIONS requests are "safe": they are cacheable and
    /// must not mutate upstream state.
    pub fn is_safe(&self) -> bool {
        matches!(self.method, Method::GET | Method::HEAD | Method::OPTIONS)
    }

    /// Public scheme of the request, honoring X-Forwarded-Proto.
    pub fn public_scheme(&self) -> &str {
        match self.headers.get("x-forwarded-proto").and_then(|v| v.to_str().ok()) {
            Some("https") => "https",
            Some("http") => "http",
            _ => "http",
        }
    }
}

/// Outcome of a behaviour's request-side hook.
pub enum Flow {
    Continue,
    Respond(Response),
}

#[async_trait]
pub trait Behaviour: Send + Sync {
    /// Runs before the request is proxied. Returning [`Flow::Respond`]
    /// short-circuits the chain and the proxy.
    async fn pre(&self, ctx: &mut RequestContext) -> Result<Flow>;

    /// Runs on the response, in reverse chain order.
    async fn post(&self, _ctx: &mut RequestContext, _response: &mut Response) -> Result<()> {
        Ok(())
    }
}
