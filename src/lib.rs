pub mod admin;
pub mod auth;
pub mod cache;
pub mod config;
pub mod consul;
pub mod dispatcher;
pub mod http;
pub mod httplogging;
pub mod monitoring;
pub mod proxy;
pub mod ratelimit;

/// Test helpers shared between unit tests.
#[cfg(test)]
pub mod test_utils {
    use crate::config::{Application, Backend, Routing};

    /// A minimal path-routed application pointing at the given backend URL.
    pub fn path_app(path: &str, backend_url: &str) -> Application {
        Application {
            routing: Routing {
                kind: "path".to_string(),
                path: path.to_string(),
                ..Routing::default()
            },
            backend: Backend {
                url: backend_url.to_string(),
                ..Backend::default()
            },
            ..Application::default()
        }
    }

    /// Signs an HS256 JWT with the given secret and claims JSON.
    pub fn sign_jwt(secret: &str, claims: &serde_json::Value) -> String {
        jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
            claims,
            &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }
}
