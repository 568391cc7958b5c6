//! Request dispatching.
//!
//! A dispatcher owns the route table mapping incoming requests to
//! registered applications, either by path (prefix and `:param` pattern
//! routes) or by hostname. The [`Gateway`] drives the full request flow:
//! resolve the route, run the behaviour chain, proxy, rewrite, respond.

pub mod behaviour;
mod build;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Result, bail};
use axum::Router;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use log::{debug, error, warn};

use crate::config::{Application, OptionsConfiguration};
use crate::monitoring::Metrics;
use crate::proxy::rewriter::PublicUrl;
use crate::proxy::{JsonHostRewriter, ProxyHandler};

pub use behaviour::{Behaviour, Flow, RequestContext};
pub use build::{GatewayBuild, build_gateway, new_dispatcher};

/// A registered application with its resolved backend and rewriter.
pub struct Route {
    pub app_name: String,
    pub app: Arc<Application>,
    pub backend_url: String,
    pub rewriter: Option<Arc<JsonHostRewriter>>,
}

/// A resolved route together with the fully computed upstream URL.
pub struct RouteMatch {
    pub route: Arc<Route>,
    pub target_url: String,
}

pub trait Dispatcher: Send + Sync {
    /// Adds an application to the route table.
    fn register_application(&mut self, name: &str, app: Application) -> Result<()>;

    /// Resolves a request to a route and target URL.
    fn resolve(&self, host: &str, path: &str, query: Option<&str>) -> Option<RouteMatch>;
}

fn append_query(mut url: String, query: Option<&str>) -> String {
    if let Some(query) = query {
        url.push('?');
        url.push_str(query);
    }
    url
}

/// A `:param` route pattern, matched segment by segment.
#[derive(Debug, Clone)]
struct PathPattern {
    segments: Vec<Segment>,
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Param(String),
}

impl PathPattern {
    fn parse(pattern: &str) -> Self {
        let segments = pattern
            .trim_matches('/')
            .split('/')
            .map(|segment| match segment.strip_prefix(':') {
                Some(name) => Segment::Param(name.to_string()),
                None => Segment::Literal(segment.to_string()),
            })
            .collect();
        PathPattern { segments }
    }

    fn match_path(&self, path: &str) -> Option<Vec<(String, String)>> {
        let parts: Vec<&str> = path.trim_matches('/').split('/').collect();
        if parts.len() != self.segments.len() {
            return None;
        }

        let mut params = Vec::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(expected) if expected == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    if part.is_empty() {
                        return None;
                    }
                    params.push((name.clone(), part.to_string()));
                }
            }
        }

        Some(params)
    }
}

enum PathRouteKind {
    Prefix(String),
    Pattern { pattern: PathPattern, target: String },
}

struct PathRoute {
    kind: PathRouteKind,
    route: Arc<Route>,
}

/// Routes requests by path prefix or `:param` patterns.
pub struct PathBasedDispatcher {
    routes: Vec<PathRoute>,
}

impl PathBasedDispatcher {
    pub fn new() -> Self {
        PathBasedDispatcher { routes: Vec::new() }
    }
}

impl Default for PathBasedDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher for PathBasedDispatcher {
    fn register_application(&mut self, name: &str, app: Application) -> Result<()> {
        let backend_url = app.backend.base_url();
        if backend_url.is_empty() {
            bail!("application '{}' has neither a backend URL nor a service", name);
        }

        match app.routing.kind.as_str() {
            "path" => {
                let path = app.routing.path.trim_end_matches('/').to_string();
                if path.is_empty() {
                    bail!("application '{}' has no routing path", name);
                }

                let mapping = std::collections::HashMap::from([(
                    "/(?P<path>.*)".to_string(),
                    format!("{}/:path", path),
                )]);
                let rewriter = Arc::new(JsonHostRewriter::new(&mapping)?);

                let route = Arc::new(Route {
                    app_name: name.to_string(),
                    app: Arc::new(app),
                    backend_url,
                    rewriter: Some(rewriter),
                });

                self.routes.push(PathRoute {
                    kind: PathRouteKind::Prefix(path),
                    route,
                });

                // Longest prefixes win
                self.routes.sort_by_key(|r| match &r.kind {
                    PathRouteKind::Prefix(p) => std::cmp::Reverse(p.len()),
                    PathRouteKind::Pattern { .. } => std::cmp::Reverse(usize::MAX),
                });
            }
            "pattern" => {
                let param_re = regex::Regex::new(":([a-zA-Z0-9]+)")?;
                let mut mapping = std::collections::HashMap::new();

                for (pattern, target) in &app.routing.patterns {
                    let target_pattern = format!(
                        "^{}$",
                        param_re.replace_all(target, "(?P<$1>[^/]+?)")
                    );
                    mapping.insert(target_pattern, pattern.clone());
                }

                let rewriter = Arc::new(JsonHostRewriter::new(&mapping)?);
                let route = Arc::new(Route {
                    app_name: name.to_string(),
                    app: Arc::new(app.clone()),
                    backend_url,
                    rewriter: Some(rewriter),
                });

                for (pattern, target) in &app.routing.patterns {
                    self.routes.push(PathRoute {
                        kind: PathRouteKind::Pattern {
                            pattern: PathPattern::parse(pattern),
                            target: target.clone(),
                        },
                        route: route.clone(),
                    });
                }
            }
            other => bail!(
                "unsupported routing type '{}' for application '{}'",
                other,
                name
            ),
        }

        Ok(())
    }

    fn resolve(&self, _host: &str, path: &str, query: Option<&str>) -> Option<RouteMatch> {
        for path_route in &self.routes {
            match &path_route.kind {
                PathRouteKind::Pattern { pattern, target } => {
                    if let Some(params) = pattern.match_path(path) {
                        let mut target_url =
                            format!("{}{}", path_route.route.backend_url, target);
                        for (name, value) in params {
                            target_url = target_url.replace(&format!(":{}", name), &value);
                        }
                        return Some(RouteMatch {
                            route: path_route.route.clone(),
                            target_url: append_query(target_url, query),
                        });
                    }
                }
                PathRouteKind::Prefix(prefix) => {
                    let remainder = if path == prefix {
                        ""
                    } else if let Some(rest) = path.strip_prefix(&format!("{}/", prefix)) {
                        rest
                    } else {
                        continue;
                    };

                    let target_url = if remainder.is_empty() {
                        path_route.route.backend_url.clone()
                    } else {
                        format!("{}/{}", path_route.route.backend_url, remainder)
                    };
                    return Some(RouteMatch {
                        route: path_route.route.clone(),
                        target_url: append_query(target_url, query),
                    });
                }
            }
        }

        None
    }
}

/// Routes requests by exact Host header match.
pub struct HostBasedDispatcher {
    routes: std::collections::HashMap<String, Arc<Route>>,
}

impl HostBasedDispatcher {
    pub fn new() -> Self {
        HostBasedDispatcher {
            routes: std::collections::HashMap::new(),
        }
    }
}

impl Default for HostBasedDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher for HostBasedDispatcher {
    fn register_application(&mut self, name: &str, app: Application) -> Result<()> {
        if app.routing.kind != "host" {
            bail!(
                "unsupported routing type '{}' for application '{}'",
                app.routing.kind,
                name
            );
        }

        let hostname = app.routing.hostname.clone();
        if hostname.is_empty() {
            bail!("application '{}' has no routing hostname", name);
        }
        if self.routes.contains_key(&hostname) {
            bail!("another application is already registered for host '{}'", hostname);
        }

        let backend_url = app.backend.base_url();
        if backend_url.is_empty() {
            bail!("application '{}' has neither a backend URL nor a service", name);
        }

        self.routes.insert(
            hostname,
            Arc::new(Route {
                app_name: name.to_string(),
                app: Arc::new(app),
                backend_url,
                rewriter: None,
            }),
        );

        Ok(())
    }

    fn resolve(&self, host: &str, path: &str, query: Option<&str>) -> Option<RouteMatch> {
        let hostname = host.split(':').next().unwrap_or(host);
        let route = match self.routes.get(hostname) {
            Some(route) => route.clone(),
            None => {
                warn!("unknown hostname: '{}'", hostname);
                return None;
            }
        };

        let target_url = format!("{}{}", route.backend_url, path);
        Some(RouteMatch {
            route,
            target_url: append_query(target_url, query),
        })
    }
}

fn json_error(status: StatusCode, body: &'static str) -> Response {
    (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
}

/// The assembled gateway: dispatcher, behaviour chain and proxy.
pub struct Gateway {
    dispatcher: Box<dyn Dispatcher>,
    behaviours: Vec<Arc<dyn Behaviour>>,
    proxy: ProxyHandler,
    metrics: Arc<Metrics>,
    options: OptionsConfiguration,
    debug: bool,
}

impl Gateway {
    pub fn new(
        dispatcher: Box<dyn Dispatcher>,
        behaviours: Vec<Arc<dyn Behaviour>>,
        proxy: ProxyHandler,
        metrics: Arc<Metrics>,
        options: OptionsConfiguration,
        debug: bool,
    ) -> Self {
        Gateway {
            dispatcher,
            behaviours,
            proxy,
            metrics,
            options,
            debug,
        }
    }

    /// Wraps the gateway into an axum router dispatching every request.
    pub fn into_router(self: Arc<Self>) -> Router {
        Router::new().fallback(dispatch_handler).with_state(self)
    }

    pub async fn handle(&self, req: Request) -> Response {
        let start = Instant::now();

        let client_addr = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0);

        let (parts, body) = req.into_parts();

        let host = parts
            .headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| parts.uri.authority().map(|a| a.to_string()))
            .unwrap_or_default();

        let Some(route_match) = self
            .dispatcher
            .resolve(&host, parts.uri.path(), parts.uri.query())
        else {
            return json_error(StatusCode::NOT_FOUND, r#"{"msg": "not found"}"#);
        };

        let route = route_match.route;
        debug!(
            "dispatching {} {} to application '{}'",
            parts.method, parts.uri, route.app_name
        );

        if parts.method == Method::OPTIONS && self.options.enabled {
            return self.options_response();
        }

        let body = match axum::body::to_bytes(body, usize::MAX).await {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("error while reading request body: {}", e);
                return json_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    r#"{"msg":"internal server error"}"#,
                );
            }
        };

        let mut ctx = RequestContext {
            app_name: route.app_name.clone(),
            app: route.app.clone(),
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            host,
            headers: parts.headers,
            body,
            client_addr,
            target_url: route_match.target_url,
            response_headers: axum::http::HeaderMap::new(),
            ext: Default::default(),
        };

        let skip_rewrite = ctx.headers.contains_key("x-no-rewrite");
        if route.rewriter.is_some() && !skip_rewrite {
            // The rewriter needs plaintext bodies
            ctx.headers.remove(header::ACCEPT_ENCODING);
        }

        let mut response = match self.run_chain(&mut ctx, &route, skip_rewrite).await {
            Ok(response) => response,
            Err(e) => {
                error!("error while dispatching request: {}", e);
                json_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    r#"{"msg":"internal server error"}"#,
                )
            }
        };

        for (name, value) in &ctx.response_headers {
            response.headers_mut().append(name, value.clone());
        }

        if self.debug {
            if let Ok(value) = HeaderValue::from_str(&route.app_name) {
                response
                    .headers_mut()
                    .insert("x-gateway-targetapplication", value);
            }
        }

        self.metrics
            .observe_total(&route.app_name, start.elapsed().as_secs_f64());

        response
    }

    async fn run_chain(
        &self,
        ctx: &mut RequestContext,
        route: &Route,
        skip_rewrite: bool,
    ) -> Result<Response> {
        for behaviour in &self.behaviours {
            if let Flow::Respond(response) = behaviour.pre(ctx).await? {
                return Ok(response);
            }
        }

        let mut response = self.proxy.forward(ctx).await;

        if let Some(rewriter) = &route.rewriter {
            if skip_rewrite {
                debug!("skipping json rewriting due to client request");
            } else {
                let public = PublicUrl {
                    scheme: rewriter_scheme(ctx).to_string(),
                    host: ctx.host.clone(),
                };
                rewriter
                    .process(&public, ctx.method != Method::HEAD, &mut response)
                    .await?;
            }
        }

        for behaviour in self.behaviours.iter().rev() {
            behaviour.post(ctx, &mut response).await?;
        }

        Ok(response)
    }

    fn options_response(&self) -> Response {
        let mut response = StatusCode::OK.into_response();
        let headers = response.headers_mut();
        headers.insert(
            header::ALLOW,
            HeaderValue::from_static("GET, HEAD, POST, PUT, PATCH, DELETE, OPTIONS"),
        );
        if self.options.cors {
            headers.insert(
                "access-control-allow-origin",
                HeaderValue::from_static("*"),
            );
            headers.insert(
                "access-control-allow-methods",
                HeaderValue::from_static("GET, HEAD, POST, PUT, PATCH, DELETE, OPTIONS"),
            );
            headers.insert(
                "access-control-allow-headers",
                HeaderValue::from_static("X-Requested-With, Authorization, Content-Type"),
            );
        }
        response
    }
}

/// Public scheme for link rewriting; unlike proxying this defaults to
/// https when no forwarding information is present.
fn rewriter_scheme(ctx: &RequestContext) -> &str {
    match ctx
        .headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
    {
        Some("http") => "http",
        Some("https") => "https",
        _ => "https",
    }
}

async fn dispatch_handler(State(gateway): State<Arc<Gateway>>, req: Request) -> Response {
    gateway.handle(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Routing;
    use crate::test_utils::path_app;

    fn pattern_app(patterns: &[(&str, &str)], backend_url: &str) -> Application {
        let mut app = path_app("", backend_url);
        app.routing = Routing {
            kind: "pattern".to_string(),
            patterns: patterns
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Routing::default()
        };
        app
    }

    #[test]
    fn test_prefix_routing_strips_prefix() {
        let mut dispatcher = PathBasedDispatcher::new();
        dispatcher
            .register_application("identity", path_app("/identity", "http://backend:8000"))
            .unwrap();

        let m = dispatcher.resolve("", "/identity/users/7", None).unwrap();
        assert_eq!(m.target_url, "http://backend:8000/users/7");
        assert_eq!(m.route.app_name, "identity");

        let m = dispatcher.resolve("", "/identity", None).unwrap();
        assert_eq!(m.target_url, "http://backend:8000");
    }

    #[test]
    fn test_prefix_routing_preserves_query() {
        let mut dispatcher = PathBasedDispatcher::new();
        dispatcher
            .register_application("identity", path_app("/identity", "http://backend:8000"))
            .unwrap();

        let m = dispatcher
            .resolve("", "/identity/users", Some("page=2"))
            .unwrap();
        assert_eq!(m.target_url, "http://backend:8000/users?page=2");
    }

    #[test]
    fn test_prefix_routing_requires_segment_boundary() {
        let mut dispatcher = PathBasedDispatcher::new();
        dispatcher
            .register_application("identity", path_app("/id", "http://backend:8000"))
            .unwrap();

        assert!(dispatcher.resolve("", "/identity/users", None).is_none());
    }

    #[test]
    fn test_longest_prefix_wins() {
        let mut dispatcher = PathBasedDispatcher::new();
        dispatcher
            .register_application("api", path_app("/api", "http://api:8000"))
            .unwrap();
        dispatcher
            .register_application("api-v2", path_app("/api/v2", "http://api-v2:8000"))
            .unwrap();

        let m = dispatcher.resolve("", "/api/v2/things", None).unwrap();
        assert_eq!(m.route.app_name, "api-v2");
        assert_eq!(m.target_url, "http://api-v2:8000/things");
    }

    #[test]
    fn test_pattern_routing_substitutes_parameters() {
        let mut dispatcher = PathBasedDispatcher::new();
        dispatcher
            .register_application(
                "catalog",
                pattern_app(
                    &[("/products/:id", "/internal/products/:id")],
                    "http://catalog:8000",
                ),
            )
            .unwrap();

        let m = dispatcher.resolve("", "/products/42", None).unwrap();
        assert_eq!(m.target_url, "http://catalog:8000/internal/products/42");

        assert!(dispatcher.resolve("", "/products", None).is_none());
        assert!(dispatcher.resolve("", "/products/42/reviews", None).is_none());
    }

    #[test]
    fn test_unknown_path_is_unrouted() {
        let mut dispatcher = PathBasedDispatcher::new();
        dispatcher
            .register_application("identity", path_app("/identity", "http://backend:8000"))
            .unwrap();

        assert!(dispatcher.resolve("", "/billing/x", None).is_none());
    }

    #[test]
    fn test_path_dispatcher_rejects_host_routing() {
        let mut dispatcher = PathBasedDispatcher::new();
        let mut app = path_app("", "http://backend:8000");
        app.routing.kind = "host".to_string();

        assert!(dispatcher.register_application("x", app).is_err());
    }

    #[test]
    fn test_host_routing() {
        let mut dispatcher = HostBasedDispatcher::new();
        let mut app = path_app("", "http://backend:8000");
        app.routing = Routing {
            kind: "host".to_string(),
            hostname: "api.example.com".to_string(),
            ..Routing::default()
        };
        dispatcher.register_application("api", app).unwrap();

        let m = dispatcher
            .resolve("api.example.com:8080", "/users", Some("page=1"))
            .unwrap();
        assert_eq!(m.target_url, "http://backend:8000/users?page=1");

        assert!(dispatcher.resolve("other.example.com", "/users", None).is_none());
    }

    #[test]
    fn test_host_routing_rejects_duplicate_hostnames() {
        let mut dispatcher = HostBasedDispatcher::new();
        let mut app = path_app("", "http://backend:8000");
        app.routing = Routing {
            kind: "host".to_string(),
            hostname: "api.example.com".to_string(),
            ..Routing::default()
        };
        dispatcher.register_application("a", app.clone()).unwrap();
        assert!(dispatcher.register_application("b", app).is_err());
    }
}
