//! REST authentication: the dispatcher behaviour guarding applications
//! and the gateway's own `/authenticate` endpoint.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{options, post};
use log::{error, warn};
use serde::Deserialize;
use serde_json::Value;

use crate::auth::{AuthenticationHandler, InvalidCredentialsError, TokenStore, writer_for};
use crate::config::ProviderAuthConfig;
use crate::dispatcher::{Behaviour, Flow, RequestContext};

/// Marker: the current request targets the authentication provider, so
/// JWTs in its response must be swapped for opaque tokens.
#[derive(Clone)]
struct ProviderApplication;

fn json_response(status: StatusCode, body: &'static str) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

/// Authentication behaviour for the dispatcher chain.
pub struct RestAuthBehaviour {
    handler: Arc<AuthenticationHandler>,
    store: Arc<dyn TokenStore>,
    provider: ProviderAuthConfig,
}

impl RestAuthBehaviour {
    pub fn new(handler: Arc<AuthenticationHandler>, store: Arc<dyn TokenStore>) -> Self {
        let provider = handler.config().provider_config.clone();
        RestAuthBehaviour {
            handler,
            store,
            provider,
        }
    }

    fn is_provider_app(&self, ctx: &RequestContext) -> bool {
        if !self.provider.service.is_empty() && self.provider.service == ctx.app_name {
            return true;
        }
        !ctx.app.backend.url.is_empty()
            && !self.provider.url.is_empty()
            && ctx.app.backend.url == self.provider.url
    }
}

#[async_trait]
impl Behaviour for RestAuthBehaviour {
    async fn pre(&self, ctx: &mut RequestContext) -> Result<Flow> {
        if ctx.app.auth.disable {
            return Ok(Flow::Continue);
        }

        if ctx.method == Method::OPTIONS {
            return Ok(Flow::Continue);
        }

        let is_provider = self.is_provider_app(ctx);

        let token = match self.handler.is_authenticated(&ctx.headers, &ctx.uri).await {
            Ok(token) => token,
            Err(e) => {
                error!("error while handling authentication request: {}", e);
                return Ok(Flow::Respond(json_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    r#"{"msg":"internal server error"}"#,
                )));
            }
        };

        if !is_provider {
            let Some(token) = &token else {
                return Ok(Flow::Respond(json_response(
                    StatusCode::FORBIDDEN,
                    r#"{"msg": "not authenticated"}"#,
                )));
            };

            if let Some(allowed) = &token.allowed_applications {
                if !allowed.is_empty() && !allowed.iter().any(|a| a == &ctx.app_name) {
                    warn!(
                        "token is not whitelisted for app {}. whitelisted apps: {:?}",
                        ctx.app_name, allowed
                    );
                    return Ok(Flow::Respond(json_response(
                        StatusCode::FORBIDDEN,
                        r#"{"msg": "not authenticated"}"#,
                    )));
                }
            }
        }

        if let Some(token) = &token {
            let writer = writer_for(&ctx.app.auth.writer);
            writer.write_token(&token.jwt, &mut ctx.headers)?;
        }

        if is_provider {
            ctx.ext.insert(ProviderApplication);
        }

        Ok(Flow::Continue)
    }

    async fn post(&self, ctx: &mut RequestContext, response: &mut Response) -> Result<()> {
        if ctx.ext.get::<ProviderApplication>().is_none() {
            return Ok(());
        }

        if let Err(e) = self.rewrite_access_tokens(response).await {
            error!("error while handling authentication request: {}", e);
            *response = json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                r#"{"msg":"internal server error"}"#,
            );
        }

        Ok(())
    }
}

impl RestAuthBehaviour {
    /// Swaps JWTs in the provider's response for opaque gateway tokens:
    /// `application/jwt` bodies, JSON body fields named by the
    /// `X-Gateway-BodyToken` header and headers named by
    /// `X-Gateway-HeaderToken`.
    async fn rewrite_access_tokens(&self, response: &mut Response) -> Result<()> {
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with("application/jwt") {
            let bytes = take_body(response).await?;
            let jwt = String::from_utf8_lossy(&bytes).to_string();
            let (token, _) = self.store.add_token(&jwt).await?;

            let headers = response.headers_mut();
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(token.len()));
            *response.body_mut() = Body::from(token);
            return Ok(());
        }

        if let Some(field) = header_string(response.headers(), "x-gateway-bodytoken") {
            let bytes = take_body(response).await?;
            let mut body: serde_json::Map<String, Value> = serde_json::from_slice(&bytes)?;

            if let Some(Value::String(jwt)) = body.get(&field).cloned() {
                let (token, _) = self.store.add_token(&jwt).await?;
                body.insert(field, Value::String(token));
            }

            let serialized = serde_json::to_vec(&body)?;
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(serialized.len()));
            *response.body_mut() = Body::from(serialized);
        }

        if let Some(name) = header_string(response.headers(), "x-gateway-headertoken") {
            let jwt = header_string(response.headers(), &name);
            if let Some(jwt) = jwt {
                let (token, _) = self.store.add_token(&jwt).await?;
                response.headers_mut().insert(
                    axum::http::HeaderName::try_from(name.as_str())?,
                    HeaderValue::from_str(&token)?,
                );
            }
        }

        Ok(())
    }
}

async fn take_body(response: &mut Response) -> Result<Bytes> {
    let body = std::mem::replace(response.body_mut(), Body::empty());
    Ok(axum::body::to_bytes(body, usize::MAX).await?)
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[derive(Debug, Deserialize)]
struct ExternalAuthenticationRequest {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

#[derive(Clone)]
struct AuthRouteState {
    handler: Arc<AuthenticationHandler>,
    store: Arc<dyn TokenStore>,
}

fn set_cors_headers(headers: &mut HeaderMap) {
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static("POST, OPTIONS"),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static("X-Requested-With, Authorization, Content-Type"),
    );
    headers.insert("access-control-allow-origin", HeaderValue::from_static("*"));
    headers.insert(
        "access-control-allow-credentials",
        HeaderValue::from_static("true"),
    );
}

/// Builds the gateway-owned authentication routes. Empty when
/// authentication through the gateway is disabled.
pub fn routes(handler: Arc<AuthenticationHandler>, store: Arc<dyn TokenStore>) -> Router {
    let config = handler.config().clone();
    if !config.provider_config.allow_authentication {
        return Router::new();
    }

    let uri = if config.provider_config.authentication_uri.is_empty() {
        "/authenticate".to_string()
    } else {
        config.provider_config.authentication_uri.clone()
    };

    let state = AuthRouteState { handler, store };

    let mut router = Router::new().route(&uri, post(authenticate_handler));
    if config.enable_cors {
        router = router.route(&uri, options(cors_preflight_handler));
    }

    router.with_state(state)
}

async fn cors_preflight_handler() -> Response {
    let mut response = StatusCode::OK.into_response();
    set_cors_headers(response.headers_mut());
    response
}

async fn authenticate_handler(State(state): State<AuthRouteState>, body: Bytes) -> Response {
    let enable_cors = state.handler.config().enable_cors;

    let mut response = authenticate_inner(&state, &body).await;
    if enable_cors {
        set_cors_headers(response.headers_mut());
    }
    response
}

async fn authenticate_inner(state: &AuthRouteState, body: &[u8]) -> Response {
    let internal_error = || {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "application/json;charset=utf8")],
            r#"{"msg":"internal server error"}"#,
        )
            .into_response()
    };

    let auth_request: ExternalAuthenticationRequest = match serde_json::from_slice(body) {
        Ok(req) => req,
        Err(e) => {
            error!("error while handling authentication request: {}", e);
            return internal_error();
        }
    };
    let generic_body: serde_json::Map<String, Value> =
        serde_json::from_slice(body).unwrap_or_default();

    let auth_response = match state
        .handler
        .authenticate(
            &auth_request.username,
            &auth_request.password,
            Some(&generic_body),
        )
        .await
    {
        Ok(response) => response,
        Err(e) if e.downcast_ref::<InvalidCredentialsError>().is_some() => {
            return (
                StatusCode::FORBIDDEN,
                [(header::CONTENT_TYPE, "application/json;charset=utf8")],
                r#"{"msg":"invalid credentials"}"#,
            )
                .into_response();
        }
        Err(e) => {
            error!("error while handling authentication request: {}", e);
            return internal_error();
        }
    };

    let (token, expires_at) = match state.store.add_token(&auth_response.jwt).await {
        Ok(result) => result,
        Err(e) => {
            error!("error while handling authentication request: {}", e);
            return internal_error();
        }
    };

    let mut payload = serde_json::Map::new();
    payload.insert("token".to_string(), Value::String(token));
    if expires_at != 0 {
        if let Some(expires) = chrono::DateTime::from_timestamp(expires_at, 0) {
            payload.insert("expires".to_string(), Value::String(expires.to_rfc3339()));
        }
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json;charset=utf8")],
        serde_json::to_string(&payload).unwrap_or_default(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{InMemoryTokenStore, JwtVerifier};
    use crate::config::{GlobalAuth, ProviderAuthConfig};
    use crate::http::HttpClient;
    use crate::test_utils::{path_app, sign_jwt};
    use serde_json::json;
    use tower::ServiceExt;

    fn setup(provider_url: &str) -> (Arc<AuthenticationHandler>, Arc<dyn TokenStore>) {
        let cfg = GlobalAuth {
            mode: "rest".to_string(),
            verification_key: "s3cret".to_string(),
            provider_config: ProviderAuthConfig {
                url: provider_url.to_string(),
                allow_authentication: true,
                ..ProviderAuthConfig::default()
            },
            ..GlobalAuth::default()
        };

        let http = HttpClient::new(reqwest::Client::new());
        let verifier = Arc::new(JwtVerifier::new(&cfg, http.clone()).unwrap());
        let store: Arc<dyn TokenStore> = Arc::new(InMemoryTokenStore::new(verifier.clone()));
        let handler = Arc::new(AuthenticationHandler::new(
            cfg,
            http,
            verifier,
            store.clone(),
        ));
        (handler, store)
    }

    fn ctx_for(app_name: &str, token: Option<&str>) -> RequestContext {
        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            headers.insert(
                header::AUTHORIZATION,
                format!("Bearer {}", token).parse().unwrap(),
            );
        }

        RequestContext {
            app_name: app_name.to_string(),
            app: Arc::new(path_app("/svc", "http://backend")),
            method: Method::GET,
            uri: "/svc/x".parse().unwrap(),
            host: "gateway".to_string(),
            headers,
            body: Bytes::new(),
            client_addr: None,
            target_url: String::new(),
            response_headers: HeaderMap::new(),
            ext: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_unauthenticated_request_is_rejected() {
        let (handler, store) = setup("http://unused");
        let behaviour = RestAuthBehaviour::new(handler, store);

        let mut ctx = ctx_for("svc", None);
        match behaviour.pre(&mut ctx).await.unwrap() {
            Flow::Respond(res) => assert_eq!(res.status(), StatusCode::FORBIDDEN),
            Flow::Continue => panic!("expected 403"),
        }
    }

    #[tokio::test]
    async fn test_authenticated_request_gets_jwt_header() {
        let (handler, store) = setup("http://unused");
        let jwt = sign_jwt("s3cret", &json!({"sub": "alice"}));
        let (token, _) = store.add_token(&jwt).await.unwrap();

        let behaviour = RestAuthBehaviour::new(handler, store);
        let mut ctx = ctx_for("svc", Some(&token));

        assert!(matches!(behaviour.pre(&mut ctx).await.unwrap(), Flow::Continue));
        assert_eq!(ctx.headers["x-jwt"], jwt);
    }

    #[tokio::test]
    async fn test_application_whitelist_is_enforced() {
        let (handler, store) = setup("http://unused");
        let jwt = sign_jwt(
            "s3cret",
            &json!({"sub": "alice", "allowedApplications": ["other"]}),
        );
        let (token, _) = store.add_token(&jwt).await.unwrap();

        let behaviour = RestAuthBehaviour::new(handler, store);
        let mut ctx = ctx_for("svc", Some(&token));

        match behaviour.pre(&mut ctx).await.unwrap() {
            Flow::Respond(res) => assert_eq!(res.status(), StatusCode::FORBIDDEN),
            Flow::Continue => panic!("expected 403"),
        }
    }

    #[tokio::test]
    async fn test_disabled_auth_passes_through() {
        let (handler, store) = setup("http://unused");
        let behaviour = RestAuthBehaviour::new(handler, store);

        let mut ctx = ctx_for("svc", None);
        let mut app = path_app("/svc", "http://backend");
        app.auth.disable = true;
        ctx.app = Arc::new(app);

        assert!(matches!(behaviour.pre(&mut ctx).await.unwrap(), Flow::Continue));
    }

    #[tokio::test]
    async fn test_provider_app_bypasses_authentication() {
        let (handler, store) = setup("http://backend");
        let behaviour = RestAuthBehaviour::new(handler, store);

        // ctx app backend url matches the provider url
        let mut ctx = ctx_for("svc", None);
        assert!(matches!(behaviour.pre(&mut ctx).await.unwrap(), Flow::Continue));
        assert!(ctx.ext.get::<ProviderApplication>().is_some());
    }

    #[tokio::test]
    async fn test_provider_jwt_response_is_swapped_for_token() {
        let (handler, store) = setup("http://backend");
        let behaviour = RestAuthBehaviour::new(handler, store.clone());

        let mut ctx = ctx_for("svc", None);
        ctx.ext.insert(ProviderApplication);

        let jwt = sign_jwt("s3cret", &json!({"sub": "alice"}));
        let mut response = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/jwt")
            .body(Body::from(jwt))
            .unwrap();

        behaviour.post(&mut ctx, &mut response).await.unwrap();

        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
        let token_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let token = String::from_utf8(token_bytes.to_vec()).unwrap();

        // The body is now an opaque token that resolves back to the JWT
        assert!(store.get_token(&token).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_authenticate_route() {
        let mut provider = mockito::Server::new_async().await;
        let jwt = sign_jwt("s3cret", &json!({"sub": "alice"}));
        let _mock = provider
            .mock("POST", "/authenticate")
            .with_status(200)
            .with_header("content-type", "application/jwt")
            .with_body(jwt)
            .create_async()
            .await;

        let (handler, store) = setup(&provider.url());
        let router = routes(handler, store.clone());

        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/authenticate")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"username": "alice", "password": "pw"}"#))
            .unwrap();

        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let token = parsed["token"].as_str().unwrap();
        assert!(store.get_token(token).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_authenticate_route_invalid_credentials() {
        let mut provider = mockito::Server::new_async().await;
        let _mock = provider
            .mock("POST", "/authenticate")
            .with_status(403)
            .create_async()
            .await;

        let (handler, store) = setup(&provider.url());
        let router = routes(handler, store);

        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/authenticate")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"username": "alice", "password": "bad"}"#))
            .unwrap();

        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
