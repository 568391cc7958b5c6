//! Handing verified JWTs to upstream services.

use anyhow::Result;
use axum::http::{HeaderMap, HeaderName, HeaderValue, header};
use log::error;

use crate::config::AuthWriterConfig;

pub trait TokenWriter: Send + Sync {
    fn write_token(&self, jwt: &str, headers: &mut HeaderMap) -> Result<()>;
}

/// Writes the JWT into a named request header.
pub struct HeaderTokenWriter {
    pub header_name: String,
}

impl TokenWriter for HeaderTokenWriter {
    fn write_token(&self, jwt: &str, headers: &mut HeaderMap) -> Result<()> {
        headers.insert(
            HeaderName::try_from(self.header_name.as_str())?,
            HeaderValue::from_str(jwt)?,
        );
        Ok(())
    }
}

/// Writes the JWT as an `Authorization: Bearer` header.
pub struct AuthorizationTokenWriter;

impl TokenWriter for AuthorizationTokenWriter {
    fn write_token(&self, jwt: &str, headers: &mut HeaderMap) -> Result<()> {
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", jwt))?,
        );
        Ok(())
    }
}

/// Selects the writer for an application's auth configuration. Unknown
/// modes fall back to the `X-JWT` header.
pub fn writer_for(cfg: &AuthWriterConfig) -> Box<dyn TokenWriter> {
    match cfg.mode.as_str() {
        "header" => Box::new(HeaderTokenWriter {
            header_name: cfg.name.clone(),
        }),
        "authorization" => Box::new(AuthorizationTokenWriter),
        "" => Box::new(HeaderTokenWriter {
            header_name: "X-JWT".to_string(),
        }),
        other => {
            error!("bad token writer: {}", other);
            Box::new(HeaderTokenWriter {
                header_name: "X-JWT".to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_writer() {
        let writer = HeaderTokenWriter {
            header_name: "X-Custom-JWT".to_string(),
        };
        let mut headers = HeaderMap::new();
        writer.write_token("abc", &mut headers).unwrap();
        assert_eq!(headers["x-custom-jwt"], "abc");
    }

    #[test]
    fn test_authorization_writer() {
        let mut headers = HeaderMap::new();
        AuthorizationTokenWriter
            .write_token("abc", &mut headers)
            .unwrap();
        assert_eq!(headers[header::AUTHORIZATION], "Bearer abc");
    }

    #[test]
    fn test_writer_selection_defaults_to_x_jwt() {
        let mut headers = HeaderMap::new();
        writer_for(&AuthWriterConfig::default())
            .write_token("abc", &mut headers)
            .unwrap();
        assert_eq!(headers["x-jwt"], "abc");

        let mut headers = HeaderMap::new();
        writer_for(&AuthWriterConfig {
            mode: "bogus".to_string(),
            name: String::new(),
        })
        .write_token("abc", &mut headers)
        .unwrap();
        assert_eq!(headers["x-jwt"], "abc");
    }
}
