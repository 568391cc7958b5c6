//! Rewriting hyperlinks in JSON responses.
//!
//! Backends render links in their own URL space. For `application/json`
//! responses the gateway walks the body and maps every `href` (and the
//! `Location` header) back into the public URL space. Links that cannot
//! be mapped are removed; inside `links`/`_links` collections the whole
//! enclosing element is dropped.

use std::collections::HashMap;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::http::{HeaderValue, header};
use axum::response::Response;
use log::{debug, error};
use regex::Regex;
use serde_json::Value;

/// Public base URL of the current request.
#[derive(Debug, Clone)]
pub struct PublicUrl {
    pub scheme: String,
    pub host: String,
}

struct Mapping {
    regex: Regex,
    target_pattern: String,
    /// Named capture groups of `regex`, substituted as `:name` in the
    /// target pattern.
    parameters: Vec<String>,
}

impl Mapping {
    fn replace(&self, captures: &regex::Captures<'_>) -> String {
        let mut path = self.target_pattern.clone();
        for name in &self.parameters {
            if let Some(value) = captures.name(name) {
                path = path.replace(&format!(":{}", name), value.as_str());
            }
        }
        path
    }
}

pub struct JsonHostRewriter {
    mappings: Vec<Mapping>,
}

impl JsonHostRewriter {
    /// Builds a rewriter from backend-path-regex -> public-path-template
    /// pairs. Source patterns use named capture groups; targets use
    /// `:name` placeholders.
    pub fn new(url_patterns: &HashMap<String, String>) -> Result<Self> {
        let mut mappings = Vec::with_capacity(url_patterns.len());

        for (source_pattern, target_pattern) in url_patterns {
            let regex = Regex::new(source_pattern)
                .with_context(|| format!("invalid URL pattern '{}'", source_pattern))?;
            let parameters = regex
                .capture_names()
                .flatten()
                .map(str::to_string)
                .collect();

            mappings.push(Mapping {
                regex,
                target_pattern: target_pattern.clone(),
                parameters,
            });
        }

        Ok(JsonHostRewriter { mappings })
    }

    /// Maps a single URL into public space. `None` means the URL matches
    /// no mapping.
    pub fn rewrite_url(&self, url_str: &str, public: &PublicUrl) -> Option<String> {
        let parsed = reqwest::Url::parse(url_str).ok()?;

        for mapping in &self.mappings {
            if let Some(captures) = mapping.regex.captures(parsed.path()) {
                return Some(format!(
                    "{}://{}{}",
                    public.scheme,
                    public.host,
                    mapping.replace(&captures)
                ));
            }
        }

        None
    }

    /// Rewrites all links in a JSON document.
    pub fn rewrite_body(&self, body: &[u8], public: &PublicUrl) -> Result<Vec<u8>> {
        let json: Value = serde_json::from_slice(body).context("response body is not JSON")?;
        let rewritten = self.walk_json(json, public, false).unwrap_or(Value::Null);
        Ok(serde_json::to_vec(&rewritten)?)
    }

    /// Walks the JSON tree. Returning `None` removes the current element.
    fn walk_json(&self, value: Value, public: &PublicUrl, in_links: bool) -> Option<Value> {
        match value {
            Value::Object(object) => {
                let mut result = serde_json::Map::with_capacity(object.len());

                for (key, child) in object {
                    if key == "href" {
                        if let Value::String(url) = &child {
                            match self.rewrite_url(url, public) {
                                Some(rewritten) => {
                                    result.insert(key, Value::String(rewritten));
                                }
                                None => {
                                    debug!("removing unmappable href '{}'", url);
                                    if in_links {
                                        return None;
                                    }
                                }
                            }
                        } else {
                            result.insert(key, child);
                        }
                        continue;
                    }

                    let child_in_links = in_links || key == "links" || key == "_links";
                    if let Some(rewritten) = self.walk_json(child, public, child_in_links) {
                        result.insert(key, rewritten);
                    }
                }

                Some(Value::Object(result))
            }
            Value::Array(array) => {
                let rewritten: Vec<Value> = array
                    .into_iter()
                    .filter_map(|element| self.walk_json(element, public, in_links))
                    .collect();

                if rewritten.is_empty() {
                    return None;
                }
                Some(Value::Array(rewritten))
            }
            other => Some(other),
        }
    }

    /// Applies the rewriter to a proxied response: JSON bodies are walked
    /// and the `Location` header is mapped; everything else passes
    /// through untouched.
    pub async fn process(
        &self,
        public: &PublicUrl,
        rewrite_body: bool,
        response: &mut Response,
    ) -> Result<()> {
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if let Some(location) = location {
            match self.rewrite_url(&location, public) {
                Some(rewritten) => {
                    if let Ok(value) = HeaderValue::from_str(&rewritten) {
                        response.headers_mut().insert(header::LOCATION, value);
                    }
                }
                None => {
                    error!("could not map URL from location header {}", location);
                }
            }
        }

        let is_json = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("application/json"))
            .unwrap_or(false);

        if !is_json || !rewrite_body {
            return Ok(());
        }

        let body = std::mem::replace(response.body_mut(), Body::empty());
        let bytes = axum::body::to_bytes(body, usize::MAX).await?;

        let rewritten = self.rewrite_body(&bytes, public)?;
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from(rewritten.len()));
        *response.body_mut() = Body::from(rewritten);

        Ok(())
    }
}
