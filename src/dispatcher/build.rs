//! Gateway assembly.
//!
//! Mirrors the startup flow: merge configuration overrides from the
//! Consul KV store, wire up authentication, rate limiting and caching
//! behaviours, register all applications and produce the public and
//! admin routers.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header;
use axum::middleware::{self, Next};
use axum::response::Response;
use log::{debug, info};

use crate::auth::{
    AuthenticationHandler, CachedTokenStore, InMemoryTokenStore, JwtVerifier, TokenStore,
};
use crate::cache::{CachingBehaviour, ResponseCache};
use crate::config::{Application, Configuration, DispatchingMode, Startup};
use crate::consul::ConsulClient;
use crate::dispatcher::{
    Behaviour, Dispatcher, Gateway, HostBasedDispatcher, PathBasedDispatcher,
};
use crate::http::HttpClient;
use crate::httplogging::{AccessLogEntry, HttpLogger, loggers_from_config};
use crate::monitoring::Metrics;
use crate::proxy::ProxyHandler;
use crate::ratelimit::{RateLimiter, RatelimitBehaviour};

const RESPONSE_CACHE_SIZE: usize = 4096;

/// Everything the listeners need.
pub struct GatewayBuild {
    pub app_router: Router,
    pub admin_router: Router,
    pub token_store: Arc<dyn TokenStore>,
}

/// Creates the dispatcher for the selected mode.
pub fn new_dispatcher(mode: DispatchingMode) -> Box<dyn Dispatcher> {
    match mode {
        DispatchingMode::Path => Box::new(PathBasedDispatcher::new()),
        DispatchingMode::Host => Box::new(HostBasedDispatcher::new()),
    }
}

/// Loads configuration overrides from the Consul KV store: the
/// `<base>/rate_limiting` key and all `<base>/applications/<name>` keys.
pub async fn load_consul_config(
    consul: &ConsulClient,
    base_key: &str,
    cfg: &mut Configuration,
) -> Result<Vec<(String, Application)>> {
    let application_base = format!("{}/applications", base_key);
    let mut applications = Vec::new();

    info!("loading gateway config from KV {}", base_key);
    let pairs = consul.kv_list(base_key).await?;

    for pair in pairs {
        debug!("found KV pair with key '{}'", pair.key);

        if pair.key == format!("{}/rate_limiting", base_key) {
            cfg.rate_limiting = serde_json::from_slice(&pair.value)
                .with_context(|| format!("JSON error on consul KV pair '{}'", pair.key))?;
            continue;
        }

        if let Some(name) = pair
            .key
            .strip_prefix(&format!("{}/", application_base))
            .filter(|name| !name.is_empty())
        {
            let app: Application = serde_json::from_slice(&pair.value)
                .with_context(|| format!("JSON error on consul KV pair '{}'", pair.key))?;
            applications.push((name.to_string(), app));
        }
    }

    Ok(applications)
}

/// Assembles the gateway from its configuration.
pub async fn build_gateway(
    startup: &Startup,
    cfg: &Configuration,
    consul: Option<&ConsulClient>,
    metrics: Arc<Metrics>,
) -> Result<GatewayBuild> {
    let mut local_cfg = cfg.clone();

    let consul_applications = match consul {
        Some(consul) => {
            load_consul_config(consul, &startup.consul_base_key, &mut local_cfg).await?
        }
        None => Vec::new(),
    };

    let http_client = HttpClient::new(reqwest::Client::new());

    let verifier = Arc::new(
        JwtVerifier::new(&local_cfg.authentication, http_client.clone())
            .context("could not configure JWT verification")?,
    );
    let token_store: Arc<dyn TokenStore> = Arc::new(CachedTokenStore::new(Arc::new(
        InMemoryTokenStore::new(verifier.clone()),
    )));
    let auth_handler = Arc::new(AuthenticationHandler::new(
        local_cfg.authentication.clone(),
        http_client.clone(),
        verifier.clone(),
        token_store.clone(),
    ));

    let rate_limiter = Arc::new(
        RateLimiter::new(&local_cfg.rate_limiting)
            .context("error while configuring rate limiting")?,
    );
    tokio::spawn(rate_limiter.clone().sweep());

    let response_cache = Arc::new(ResponseCache::new(RESPONSE_CACHE_SIZE));

    // Chain order matters: rate limiting first, then authentication,
    // then caching on the request path; reversed on the response path.
    let behaviours: Vec<Arc<dyn Behaviour>> = vec![
        Arc::new(RatelimitBehaviour::new(rate_limiter)),
        crate::auth::new_auth_behaviour(
            &local_cfg.authentication,
            auth_handler.clone(),
            token_store.clone(),
        )?,
        Arc::new(CachingBehaviour::new(response_cache)),
    ];

    let mut dispatcher = new_dispatcher(startup.dispatching_mode);

    for (name, app) in &consul_applications {
        info!("registering application '{}' from Consul", name);
        dispatcher.register_application(name, app.clone())?;
    }
    for (name, app) in &local_cfg.applications {
        info!("registering application '{}' from local config", name);
        dispatcher.register_application(name, app.clone())?;
    }

    let proxy = ProxyHandler::new(&local_cfg.proxy, metrics.clone())?;

    let gateway = Arc::new(Gateway::new(
        dispatcher,
        behaviours,
        proxy,
        metrics,
        local_cfg.proxy.options.clone(),
        startup.debug,
    ));

    let mut app_router = crate::auth::routes(auth_handler, token_store.clone())
        .merge(gateway.into_router());

    let loggers = loggers_from_config(&local_cfg.logging)?;
    if !loggers.is_empty() {
        app_router = app_router.layer(middleware::from_fn_with_state(
            Arc::new(loggers) as Arc<Vec<Arc<dyn HttpLogger>>>,
            access_log_middleware,
        ));
    }

    let admin_router = crate::admin::admin_router(token_store.clone(), verifier);

    Ok(GatewayBuild {
        app_router,
        admin_router,
        token_store,
    })
}

async fn access_log_middleware(
    State(loggers): State<Arc<Vec<Arc<dyn HttpLogger>>>>,
    req: Request,
    next: Next,
) -> Response {
    let remote_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip());
    let method = req.method().to_string();
    let uri = req.uri().to_string();
    let referer = header_value(req.headers(), header::REFERER);
    let user_agent = header_value(req.headers(), header::USER_AGENT);

    let response = next.run(req).await;

    let entry = AccessLogEntry {
        remote_addr,
        method,
        uri,
        status: response.status().as_u16(),
        response_bytes: header_value(response.headers(), header::CONTENT_LENGTH)
            .and_then(|v| v.parse().ok()),
        referer,
        user_agent,
        timestamp: chrono::Local::now(),
    };

    for logger in loggers.iter() {
        logger.log(&entry);
    }

    response
}

fn header_value(headers: &axum::http::HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
