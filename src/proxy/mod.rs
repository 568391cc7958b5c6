//! Forwarding requests to backend services.

pub mod rewriter;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, StatusCode, header};
use axum::response::Response;
use log::{debug, error};

use crate::config::ProxyConfiguration;
use crate::dispatcher::RequestContext;
use crate::monitoring::Metrics;

pub use rewriter::JsonHostRewriter;

const UNAVAILABLE_BODY: &str = r#"{"msg": "service unavailable", "reason": "no can do; sorry."}"#;

/// Forwards requests to upstream services, applying the configured
/// header policy on the way back.
pub struct ProxyHandler {
    client: reqwest::Client,
    strip_res_headers: HashSet<String>,
    set_res_headers: HashMap<String, String>,
    set_req_headers: HashMap<String, String>,
    metrics: Arc<Metrics>,
}

impl ProxyHandler {
    pub fn new(options: &ProxyConfiguration, metrics: Arc<Metrics>) -> Result<Self> {
        // Upstream redirects are passed through to the client, never followed
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("could not build proxy client")?;

        Ok(ProxyHandler {
            client,
            strip_res_headers: options
                .strip_res_headers
                .iter()
                .filter(|(_, enabled)| **enabled)
                .map(|(name, _)| name.to_ascii_lowercase())
                .collect(),
            set_res_headers: options
                .set_res_headers
                .iter()
                .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
                .collect(),
            set_req_headers: options
                .set_req_headers
                .iter()
                .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
                .collect(),
            metrics,
        })
    }

    /// Builds a 503 response for an unreachable upstream.
    pub fn unavailable_error() -> Response {
        let mut response = Response::new(Body::from(UNAVAILABLE_BODY));
        *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response
    }

    /// Proxies the request described by the context to its target URL.
    #[tracing::instrument(skip(self, ctx), fields(app = %ctx.app_name, target = %ctx.target_url))]
    pub async fn forward(&self, ctx: &RequestContext) -> Response {
        debug!("proxying {} {} to {}", ctx.method, ctx.uri, ctx.target_url);

        let mut headers = ctx.headers.clone();
        // The client sets its own framing headers
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);
        headers.remove(header::TRANSFER_ENCODING);
        headers.remove(header::CONNECTION);

        if !ctx.host.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&ctx.host) {
                headers.insert(header::HOST, value);
            }
        }
        if let Some(addr) = ctx.client_addr {
            if let Ok(value) = HeaderValue::from_str(&addr.ip().to_string()) {
                headers.insert("x-forwarded-for", value);
            }
        }
        for (name, value) in &self.set_req_headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }

        let mut request = self
            .client
            .request(ctx.method.clone(), &ctx.target_url)
            .headers(headers)
            .body(ctx.body.clone());

        if !ctx.app.backend.username.is_empty() {
            request = request.basic_auth(
                &ctx.app.backend.username,
                Some(&ctx.app.backend.password),
            );
        }

        let upstream_start = Instant::now();
        let upstream = match request.send().await {
            Ok(upstream) => upstream,
            Err(e) => {
                error!("could not proxy request to {}: {}", ctx.target_url, e);
                self.metrics.inc_error(&ctx.app_name, "unavailable");
                return Self::unavailable_error();
            }
        };
        self.metrics
            .observe_upstream(&ctx.app_name, upstream_start.elapsed().as_secs_f64());

        self.build_response(ctx, upstream)
    }

    fn build_response(&self, ctx: &RequestContext, upstream: reqwest::Response) -> Response {
        let status = upstream.status();
        let mut response_headers = axum::http::HeaderMap::new();

        for (name, value) in upstream.headers() {
            let lower = name.as_str();
            if self.strip_res_headers.contains(lower) {
                continue;
            }
            if self.set_res_headers.contains_key(lower) {
                continue;
            }

            if *name == header::LOCATION {
                if let Ok(location) = value.to_str() {
                    let rewritten = self.replace_backend_uri(location, ctx);
                    if let Ok(value) = HeaderValue::from_str(&rewritten) {
                        response_headers.append(name, value);
                        continue;
                    }
                }
            }

            response_headers.append(name, value.clone());
        }

        for (name, value) in &self.set_res_headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::from_str(value),
            ) {
                response_headers.insert(name, value);
            }
        }

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        response
    }

    /// Maps a backend-space URL into the public URL space of the gateway.
    fn replace_backend_uri(&self, value: &str, ctx: &RequestContext) -> String {
        let backend_url = &ctx.app.backend.url;
        if backend_url.is_empty() {
            return value.to_string();
        }

        let mut public_url = format!("{}://{}", ctx.public_scheme(), ctx.host);
        if ctx.app.routing.kind == "path" {
            public_url.push_str(&ctx.app.routing.path);
        }

        value.replace(backend_url.as_str(), &public_url)
    }
}
