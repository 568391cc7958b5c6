//! Consul HTTP API client.
//!
//! Covers the slice of the agent API the gateway needs: recursive KV
//! reads for configuration overrides, and service registration with an
//! HTTP health check for the gateway's own lifecycle.

use anyhow::{Context, Result};
use base64::prelude::{BASE64_STANDARD, Engine as _};
use log::debug;
use reqwest::StatusCode;

use crate::config::ConsulConfiguration;
use crate::http::HttpClient;

/// Consul API response types (internal).
mod api {
    use serde::{Deserialize, Serialize};

    #[derive(Deserialize, Debug)]
    pub struct KvEntry {
        #[serde(rename = "Key")]
        pub key: String,
        /// base64-encoded; absent for directory placeholders.
        #[serde(rename = "Value", default)]
        pub value: Option<String>,
    }

    #[derive(Serialize, Debug)]
    pub struct ServiceRegistration {
        #[serde(rename = "ID")]
        pub id: String,
        #[serde(rename = "Name")]
        pub name: String,
        #[serde(rename = "Port")]
        pub port: u16,
        #[serde(rename = "Check")]
        pub check: ServiceCheck,
    }

    #[derive(Serialize, Debug)]
    pub struct ServiceCheck {
        #[serde(rename = "HTTP")]
        pub http: String,
        #[serde(rename = "Interval")]
        pub interval: String,
    }
}

/// A decoded key/value pair from the Consul KV store.
#[derive(Debug, Clone, PartialEq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
}

/// A service registration handed to the local Consul agent.
#[derive(Debug, Clone)]
pub struct ServiceRegistration {
    pub id: String,
    pub name: String,
    pub port: u16,
    pub check_url: String,
    pub check_interval: String,
}

pub struct ConsulClient {
    http_client: HttpClient,
    base_url: String,
    datacenter: String,
}

impl ConsulClient {
    pub fn new(http_client: HttpClient, cfg: &ConsulConfiguration) -> Self {
        Self {
            http_client,
            base_url: format!("http://{}", cfg.address()),
            datacenter: cfg.datacenter.clone(),
        }
    }

    /// Creates a client talking to an explicit address, e.g. for tests.
    pub fn with_base_url(http_client: HttpClient, base_url: &str) -> Self {
        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            datacenter: String::new(),
        }
    }

    fn dc_query(&self) -> Vec<(&str, &str)> {
        if self.datacenter.is_empty() {
            vec![]
        } else {
            vec![("dc", self.datacenter.as_str())]
        }
    }

    /// Lists all KV entries below the given prefix, decoded.
    /// A missing prefix is not an error; it yields an empty list.
    #[tracing::instrument(skip(self))]
    pub async fn kv_list(&self, prefix: &str) -> Result<Vec<KvPair>> {
        let url = format!("{}/v1/kv/{}", self.base_url, prefix.trim_matches('/'));
        debug!("listing Consul KV entries below '{}'", prefix);

        let mut query = self.dc_query();
        query.push(("recurse", "true"));

        let entries: Vec<api::KvEntry> = match self
            .http_client
            .get_json_with_query(&url, &query)
            .await
        {
            Ok(entries) => entries,
            Err(e) => {
                if is_not_found(&e) {
                    return Ok(vec![]);
                }
                return Err(e.context(format!("could not list Consul KV prefix '{}'", prefix)));
            }
        };

        let mut pairs = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(encoded) = entry.value else {
                continue;
            };
            let value = BASE64_STANDARD
                .decode(encoded.as_bytes())
                .with_context(|| format!("bad base64 value for Consul key '{}'", entry.key))?;
            pairs.push(KvPair {
                key: entry.key,
                value,
            });
        }

        Ok(pairs)
    }

    /// Registers a service with the local agent.
    #[tracing::instrument(skip(self, registration), fields(id = %registration.id))]
    pub async fn register_service(&self, registration: &ServiceRegistration) -> Result<()> {
        let url = format!("{}/v1/agent/service/register", self.base_url);
        let body = api::ServiceRegistration {
            id: registration.id.clone(),
            name: registration.name.clone(),
            port: registration.port,
            check: api::ServiceCheck {
                http: registration.check_url.clone(),
                interval: registration.check_interval.clone(),
            },
        };

        self.http_client
            .put_json(&url, &body)
            .await
            .with_context(|| format!("could not register service '{}'", registration.id))
    }

    /// Removes a service registration from the local agent.
    #[tracing::instrument(skip(self))]
    pub async fn deregister_service(&self, service_id: &str) -> Result<()> {
        let url = format!(
            "{}/v1/agent/service/deregister/{}",
            self.base_url, service_id
        );

        self.http_client
            .put_empty(&url)
            .await
            .with_context(|| format!("could not deregister service '{}'", service_id))
    }
}

fn is_not_found(e: &anyhow::Error) -> bool {
    use crate::http::NonRetryableError;
    matches!(
        e.downcast_ref::<NonRetryableError>(),
        Some(NonRetryableError::NotFound(_))
    ) || e
        .downcast_ref::<reqwest::Error>()
        .and_then(reqwest::Error::status)
        == Some(StatusCode::NOT_FOUND)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Client;

    fn client(url: &str) -> ConsulClient {
        ConsulClient::with_base_url(HttpClient::new(Client::new()), url)
    }

    #[tokio::test]
    async fn test_kv_list_decodes_values() {
        let mut server = mockito::Server::new_async().await;

        let _mock = server
            .mock("GET", "/v1/kv/gateway/ui")
            .match_query(mockito::Matcher::UrlEncoded(
                "recurse".into(),
                "true".into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(format!(
                r#"[
                    {{"Key": "gateway/ui/", "Value": null}},
                    {{"Key": "gateway/ui/rate_limiting", "Value": "{}"}}
                ]"#,
                BASE64_STANDARD.encode(r#"{"burst": 5, "window": "10s"}"#)
            ))
            .create_async()
            .await;

        let pairs = client(&server.url()).kv_list("gateway/ui").await.unwrap();

        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].key, "gateway/ui/rate_limiting");
        assert_eq!(
            std::str::from_utf8(&pairs[0].value).unwrap(),
            r#"{"burst": 5, "window": "10s"}"#
        );
    }

    #[tokio::test]
    async fn test_kv_list_missing_prefix_is_empty() {
        let mut server = mockito::Server::new_async().await;

        let _mock = server
            .mock("GET", "/v1/kv/gateway/ui")
            .match_query(mockito::Matcher::Any)
            .with_status(404)
            .create_async()
            .await;

        let pairs = client(&server.url()).kv_list("gateway/ui").await.unwrap();
        assert!(pairs.is_empty());
    }

    #[tokio::test]
    async fn test_register_and_deregister() {
        let mut server = mockito::Server::new_async().await;

        let register = server
            .mock("PUT", "/v1/agent/service/register")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"ID": "servicegateway-node1", "Name": "servicegateway", "Port": 8082}"#
                    .to_string(),
            ))
            .with_status(200)
            .create_async()
            .await;

        let deregister = server
            .mock("PUT", "/v1/agent/service/deregister/servicegateway-node1")
            .with_status(200)
            .create_async()
            .await;

        let consul = client(&server.url());
        consul
            .register_service(&ServiceRegistration {
                id: "servicegateway-node1".to_string(),
                name: "servicegateway".to_string(),
                port: 8082,
                check_url: "http://localhost:8082/status".to_string(),
                check_interval: "30s".to_string(),
            })
            .await
            .unwrap();
        consul
            .deregister_service("servicegateway-node1")
            .await
            .unwrap();

        register.assert_async().await;
        deregister.assert_async().await;
    }
}
