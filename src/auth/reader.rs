//! Extracting authentication tokens from incoming requests.

use std::sync::Arc;

use anyhow::{Result, bail};
use axum::http::{HeaderMap, Uri, header};

use crate::auth::TokenStore;

/// Reads the opaque token carried by a request and resolves it to a JWT
/// through the token store.
///
/// Token sources, in order: `Authorization: Bearer`, the `ACCESSTOKEN`
/// cookie, the `X-JWT` header, the `access_token` query parameter.
pub struct BearerTokenReader {
    store: Arc<dyn TokenStore>,
}

impl BearerTokenReader {
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        BearerTokenReader { store }
    }

    /// Resolves the request's token to a JWT. `None` means no token was
    /// present or the token is unknown to the store.
    pub async fn jwt_from_request(&self, headers: &HeaderMap, uri: &Uri) -> Result<Option<String>> {
        let Some(token) = Self::token_string_from_request(headers, uri)? else {
            return Ok(None);
        };

        self.store.get_token(&token).await
    }

    fn token_string_from_request(headers: &HeaderMap, uri: &Uri) -> Result<Option<String>> {
        if let Some(auth) = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
        {
            let mut elements = auth.splitn(2, ' ');
            let scheme = elements.next().unwrap_or("");
            if scheme != "Bearer" {
                bail!("'{}' authorization is not supported", scheme);
            }
            match elements.next() {
                Some(token) if !token.is_empty() => return Ok(Some(token.to_string())),
                _ => bail!("empty bearer token"),
            }
        }

        if let Some(token) = cookie_value(headers, "ACCESSTOKEN") {
            return Ok(Some(token));
        }

        if let Some(token) = headers.get("x-jwt").and_then(|v| v.to_str().ok()) {
            if !token.is_empty() {
                return Ok(Some(token.to_string()));
            }
        }

        if let Some(token) = query_param(uri, "access_token") {
            return Ok(Some(token));
        }

        Ok(None)
    }
}

/// Returns the value of a cookie from the request's `Cookie` header.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    for pair in cookies.split(';') {
        let mut parts = pair.trim().splitn(2, '=');
        if parts.next() == Some(name) {
            return parts.next().map(str::to_string);
        }
    }
    None
}

fn query_param(uri: &Uri, name: &str) -> Option<String> {
    let query = uri.query()?;
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        if parts.next() == Some(name) {
            let value = parts.next().unwrap_or("");
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MappedToken;
    use async_trait::async_trait;

    /// A store that knows exactly one token.
    struct SingleTokenStore;

    #[async_trait]
    impl TokenStore for SingleTokenStore {
        async fn add_token(&self, _jwt: &str) -> Result<(String, i64)> {
            unimplemented!()
        }
        async fn set_token(&self, _token: &str, _jwt: &str) -> Result<i64> {
            unimplemented!()
        }
        async fn get_token(&self, token: &str) -> Result<Option<String>> {
            Ok((token == "tok123").then(|| "jwt-value".to_string()))
        }
        async fn all_tokens(&self) -> Result<Vec<MappedToken>> {
            Ok(vec![])
        }
    }

    fn reader() -> BearerTokenReader {
        BearerTokenReader::new(Arc::new(SingleTokenStore))
    }

    #[tokio::test]
    async fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer tok123".parse().unwrap());

        let jwt = reader()
            .jwt_from_request(&headers, &"/x".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(jwt.as_deref(), Some("jwt-value"));
    }

    #[tokio::test]
    async fn test_unsupported_scheme_is_an_error() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Basic dXNlcg==".parse().unwrap());

        assert!(
            reader()
                .jwt_from_request(&headers, &"/x".parse().unwrap())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_cookie_token() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            "foo=bar; ACCESSTOKEN=tok123".parse().unwrap(),
        );

        let jwt = reader()
            .jwt_from_request(&headers, &"/x".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(jwt.as_deref(), Some("jwt-value"));
    }

    #[tokio::test]
    async fn test_query_parameter_token() {
        let headers = HeaderMap::new();
        let uri: Uri = "/x?access_token=tok123".parse().unwrap();

        let jwt = reader().jwt_from_request(&headers, &uri).await.unwrap();
        assert_eq!(jwt.as_deref(), Some("jwt-value"));
    }

    #[tokio::test]
    async fn test_unknown_token_resolves_to_none() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer other".parse().unwrap());

        let jwt = reader()
            .jwt_from_request(&headers, &"/x".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(jwt, None);
    }

    #[tokio::test]
    async fn test_no_token_at_all() {
        let jwt = reader()
            .jwt_from_request(&HeaderMap::new(), &"/x".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(jwt, None);
    }
}
