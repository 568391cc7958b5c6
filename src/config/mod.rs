//! Gateway configuration model.
//!
//! The gateway is driven by a single JSON document (usually
//! `/etc/servicegateway.json`) describing the applications to dispatch,
//! the authentication provider, rate limiting, Consul connectivity and
//! proxy header policy. Parts of it (rate limiting, applications) can be
//! overridden from the Consul KV store at startup.

mod duration;

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub use duration::parse_duration;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub applications: HashMap<String, Application>,
    pub rate_limiting: RateLimiting,
    pub authentication: GlobalAuth,
    pub consul: ConsulConfiguration,
    pub proxy: ProxyConfiguration,
    pub logging: Vec<LoggingConfiguration>,
}

impl Configuration {
    /// Reads and parses a configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("could not read configuration file {}", path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("invalid configuration in {}", path.display()))
    }
}

/// One dispatchable application behind the gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Application {
    pub routing: Routing,
    pub backend: Backend,
    pub auth: ApplicationAuth,
    pub caching: Caching,
    pub rate_limiting: bool,
}

/// How requests are matched to an application.
///
/// `type` is one of `path` (prefix routing), `pattern` (`:param`
/// placeholder routes) or `host` (exact Host header match).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Routing {
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
    pub patterns: HashMap<String, String>,
    pub hostname: String,
}

/// Where matched requests are forwarded to.
///
/// Either a direct `url`, or a Consul service reference that renders as
/// `http://[tag.]service.service.consul`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Backend {
    pub url: String,
    pub service: String,
    pub tag: String,
    pub username: String,
    pub password: String,
}

impl Backend {
    /// Resolves the effective backend base URL.
    pub fn base_url(&self) -> String {
        if !self.url.is_empty() {
            return self.url.trim_end_matches('/').to_string();
        }
        if !self.service.is_empty() {
            if !self.tag.is_empty() {
                return format!("http://{}.{}.service.consul", self.tag, self.service);
            }
            return format!("http://{}.service.consul", self.service);
        }
        String::new()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationAuth {
    pub disable: bool,
    pub writer: AuthWriterConfig,
}

/// How the JWT is handed to the upstream service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthWriterConfig {
    /// `header` or `authorization`; empty means the `X-JWT` header.
    pub mode: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Caching {
    pub enabled: bool,
    /// Entry lifetime in seconds; 0 keeps entries until evicted.
    pub ttl: u64,
    /// Purge the cached entry when an unsafe request hits the same URI.
    pub auto_flush: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiting {
    pub burst: i64,
    /// Duration string, e.g. "1s" or "2m30s".
    pub window: String,
}

impl Default for RateLimiting {
    fn default() -> Self {
        RateLimiting {
            burst: 100,
            window: "1m".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalAuth {
    /// Authentication mode; `rest` is the only supported mode.
    pub mode: String,
    #[serde(rename = "provider")]
    pub provider_config: ProviderAuthConfig,
    /// Verification key material: an RSA public key in PEM form, or a
    /// shared HS256 secret.
    pub verification_key: String,
    pub verification_key_url: String,
    /// How long a fetched verification key stays cached, e.g. "5m".
    pub key_cache_ttl: String,
    pub enable_cors: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderAuthConfig {
    pub url: String,
    /// Name of the application that acts as the authentication provider.
    pub service: String,
    /// Static parameters merged into every authentication request body.
    pub parameters: serde_json::Map<String, serde_json::Value>,
    pub allow_authentication: bool,
    pub authentication_uri: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsulConfiguration {
    pub host: String,
    pub port: u16,
    pub datacenter: String,
}

impl ConsulConfiguration {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Consul integration is optional; an empty host disables it.
    pub fn enabled(&self) -> bool {
        !self.host.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfiguration {
    pub strip_res_headers: HashMap<String, bool>,
    pub set_res_headers: HashMap<String, String>,
    pub set_req_headers: HashMap<String, String>,
    pub options: OptionsConfiguration,
}

/// Gateway-side OPTIONS handling. When disabled, OPTIONS requests are
/// proxied like any other safe request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OptionsConfiguration {
    pub enabled: bool,
    pub cors: bool,
}

/// One access-log sink, selected by `type`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfiguration {
    #[serde(rename = "type")]
    pub kind: String,
    pub filename: String,
}

/// Options resolved from the command line at startup.
#[derive(Debug, Clone)]
pub struct Startup {
    pub config_file: std::path::PathBuf,
    pub dispatching_mode: DispatchingMode,
    pub consul_base_key: String,
    pub port: u16,
    pub admin_address: String,
    pub admin_port: u16,
    pub monitor_address: String,
    pub monitor_port: u16,
    pub debug: bool,
}

impl Default for Startup {
    fn default() -> Self {
        Startup {
            config_file: "/etc/servicegateway.json".into(),
            dispatching_mode: DispatchingMode::Path,
            consul_base_key: "gateway/ui".to_string(),
            port: 8080,
            admin_address: "127.0.0.1".to_string(),
            admin_port: 8081,
            monitor_address: "0.0.0.0".to_string(),
            monitor_port: 8082,
            debug: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum DispatchingMode {
    Path,
    Host,
}
