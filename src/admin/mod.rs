//! Administration API.
//!
//! Served on the private admin listener: inspecting and managing the
//! opaque-token store. JWT payloads must be posted as `application/jwt`.

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use log::error;
use serde::Serialize;

use crate::auth::{JwtVerifier, TokenStore};

#[derive(Clone)]
struct AdminState {
    store: Arc<dyn TokenStore>,
    verifier: Arc<JwtVerifier>,
}

#[derive(Serialize)]
struct TokenJson {
    jwt: String,
    token: String,
    href: String,
}

#[derive(Serialize)]
struct StoredTokenResponse {
    token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires: Option<String>,
}

/// Builds the admin API router.
pub fn admin_router(store: Arc<dyn TokenStore>, verifier: Arc<JwtVerifier>) -> Router {
    Router::new()
        .route("/tokens", get(list_tokens).post(create_token))
        .route("/tokens/{token}", put(set_token))
        .with_state(AdminState { store, verifier })
}

fn error_response(status: StatusCode, body: String) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

fn internal_error(msg: &str) -> Response {
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        format!(r#"{{"msg":"{}"}}"#, msg),
    )
}

async fn list_tokens(State(state): State<AdminState>, headers: HeaderMap) -> Response {
    let tokens = match state.store.all_tokens().await {
        Ok(tokens) => tokens,
        Err(e) => {
            error!("could not load tokens: {}", e);
            return internal_error("could not load tokens");
        }
    };

    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");

    let body: Vec<TokenJson> = tokens
        .into_iter()
        .map(|t| TokenJson {
            href: format!("http://{}/tokens/{}", host, t.token),
            jwt: t.jwt,
            token: t.token,
        })
        .collect();

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        serde_json::to_string(&body).unwrap_or_else(|_| "[]".to_string()),
    )
        .into_response()
}

/// Validates the request envelope shared by the token-writing endpoints
/// and returns the verified JWT.
async fn verified_jwt_from_request(
    state: &AdminState,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<String, Response> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.starts_with("application/jwt") {
        return Err(error_response(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            r#"{"msg":"only 'application/jwt' is allowed as content-type"}"#.to_string(),
        ));
    }

    let jwt = String::from_utf8_lossy(body).to_string();

    match state.verifier.verify(&jwt).await {
        Ok(Some(_)) => Ok(jwt),
        Ok(None) => Err(error_response(
            StatusCode::BAD_REQUEST,
            r#"{"msg":"invalid token","reason":"verification failed"}"#.to_string(),
        )),
        Err(e) => {
            error!("error while verifying token: {}", e);
            Err(internal_error("could not verify token"))
        }
    }
}

fn stored_response(token: String, expires_at: i64) -> Response {
    let expires = (expires_at != 0)
        .then(|| chrono::DateTime::from_timestamp(expires_at, 0).map(|dt| dt.to_rfc3339()))
        .flatten();

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        serde_json::to_string(&StoredTokenResponse { token, expires })
            .unwrap_or_default(),
    )
        .into_response()
}

async fn create_token(
    State(state): State<AdminState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let jwt = match verified_jwt_from_request(&state, &headers, &body).await {
        Ok(jwt) => jwt,
        Err(response) => return response,
    };

    match state.store.add_token(&jwt).await {
        Ok((token, expires_at)) => stored_response(token, expires_at),
        Err(e) => {
            error!("error while storing token: {}", e);
            internal_error("could not store token")
        }
    }
}

async fn set_token(
    State(state): State<AdminState>,
    Path(token): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let jwt = match verified_jwt_from_request(&state, &headers, &body).await {
        Ok(jwt) => jwt,
        Err(response) => return response,
    };

    match state.store.set_token(&token, &jwt).await {
        Ok(expires_at) => stored_response(token, expires_at),
        Err(e) => {
            error!("error while storing token: {}", e);
            internal_error("could not store token")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::InMemoryTokenStore;
    use crate::config::GlobalAuth;
    use crate::http::HttpClient;
    use crate::test_utils::sign_jwt;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    fn router() -> (Router, Arc<dyn TokenStore>) {
        let verifier = Arc::new(
            JwtVerifier::new(
                &GlobalAuth {
                    verification_key: "s3cret".to_string(),
                    ..GlobalAuth::default()
                },
                HttpClient::new(reqwest::Client::new()),
            )
            .unwrap(),
        );
        let store: Arc<dyn TokenStore> = Arc::new(InMemoryTokenStore::new(verifier.clone()));
        (admin_router(store.clone(), verifier), store)
    }

    #[tokio::test]
    async fn test_create_token_roundtrip() {
        let (router, store) = router();
        let jwt = sign_jwt("s3cret", &json!({"sub": "alice"}));

        let response = router
            .oneshot(
                Request::post("/tokens")
                    .header(header::CONTENT_TYPE, "application/jwt")
                    .body(Body::from(jwt.clone()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let token = parsed["token"].as_str().unwrap();
        assert!(parsed.get("expires").is_none());

        assert_eq!(store.get_token(token).await.unwrap(), Some(jwt));
    }

    #[tokio::test]
    async fn test_create_token_includes_expiry() {
        let (router, _) = router();
        let exp = chrono::Utc::now().timestamp() + 3600;
        let jwt = sign_jwt("s3cret", &json!({"sub": "alice", "exp": exp}));

        let response = router
            .oneshot(
                Request::post("/tokens")
                    .header(header::CONTENT_TYPE, "application/jwt")
                    .body(Body::from(jwt))
                    .unwrap(),
            )
            .await
            .unwrap();

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(parsed["expires"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_wrong_content_type_is_415() {
        let (router, _) = router();

        let response = router
            .oneshot(
                Request::post("/tokens")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn test_invalid_jwt_is_400() {
        let (router, _) = router();
        let jwt = sign_jwt("wrong-secret", &json!({"sub": "alice"}));

        let response = router
            .oneshot(
                Request::post("/tokens")
                    .header(header::CONTENT_TYPE, "application/jwt")
                    .body(Body::from(jwt))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_set_token_stores_under_given_name() {
        let (router, store) = router();
        let jwt = sign_jwt("s3cret", &json!({"sub": "alice"}));

        let response = router
            .oneshot(
                Request::put("/tokens/fixed-token")
                    .header(header::CONTENT_TYPE, "application/jwt")
                    .body(Body::from(jwt.clone()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        assert_eq!(store.get_token("fixed-token").await.unwrap(), Some(jwt));
    }

    #[tokio::test]
    async fn test_list_tokens() {
        let (router, store) = router();
        let jwt = sign_jwt("s3cret", &json!({"sub": "alice"}));
        let (token, _) = store.add_token(&jwt).await.unwrap();

        let response = router
            .oneshot(
                Request::get("/tokens")
                    .header(header::HOST, "admin.local:8081")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let list = parsed.as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["token"].as_str().unwrap(), token);
        assert_eq!(
            list[0]["href"].as_str().unwrap(),
            format!("http://admin.local:8081/tokens/{}", token)
        );
    }
}
