//! Routing API client for leased TCP routes.
//!
//! Provides methods for talking to the remote routing registry:
//! - Resolving router groups by name
//! - Upserting and deleting TCP route mappings

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::RegistryError;

/// A named partition of the registry's TCP port space.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterGroup {
    #[serde(default)]
    pub guid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub group_type: String,
    #[serde(default)]
    pub reservable_ports: String,
}

/// One leased TCP route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpRouteMapping {
    pub router_group_guid: String,
    /// External port on the router group.
    pub port: u16,
    pub backend_ip: String,
    pub backend_port: u16,
    /// Lease lifetime in seconds.
    pub ttl: u64,
}

/// Remote routing registry.
#[async_trait]
pub trait RoutingApi: Send + Sync {
    /// Look up a router group. A group with an empty `guid` means "not found".
    async fn router_group_with_name(&self, name: &str) -> Result<RouterGroup, RegistryError>;

    /// Set the bearer token used by subsequent calls.
    fn set_token(&self, token: &str);

    /// Create or refresh mappings.
    async fn upsert_tcp_route_mappings(
        &self,
        mappings: &[TcpRouteMapping],
    ) -> Result<(), RegistryError>;

    /// Delete mappings.
    async fn delete_tcp_route_mappings(
        &self,
        mappings: &[TcpRouteMapping],
    ) -> Result<(), RegistryError>;
}

/// HTTP routing API client.
pub struct HttpRoutingApiClient {
    client: reqwest::Client,
    base_url: String,
    token: RwLock<Option<String>>,
}

impl HttpRoutingApiClient {
    /// Create a new routing API client.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder()
            .user_agent("rtreg-route-registrar/0.1.0")
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: RwLock::new(None),
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let token = self
            .token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn post_mappings(
        &self,
        operation: &'static str,
        path: &str,
        mappings: &[TcpRouteMapping],
    ) -> Result<(), RegistryError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, count = mappings.len(), operation, "Posting tcp route mappings");

        let response = self
            .authorize(self.client.post(&url))
            .json(mappings)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            error!(status, body = %body, operation, "Routing api rejected request");
            return Err(RegistryError::Status {
                operation,
                status,
                body,
            });
        }

        Ok(())
    }
}

#[async_trait]
impl RoutingApi for HttpRoutingApiClient {
    async fn router_group_with_name(&self, name: &str) -> Result<RouterGroup, RegistryError> {
        let url = format!("{}/routing/v1/router_groups", self.base_url);
        debug!(url = %url, name, "Looking up router group");

        let response = self
            .authorize(self.client.get(&url))
            .query(&[("name", name)])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(RegistryError::Status {
                operation: "router group lookup",
                status,
                body,
            });
        }

        let groups: Vec<RouterGroup> = response.json().await?;
        Ok(groups
            .into_iter()
            .find(|g| g.name == name)
            .unwrap_or_default())
    }

    fn set_token(&self, token: &str) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = Some(token.to_string());
    }

    async fn upsert_tcp_route_mappings(
        &self,
        mappings: &[TcpRouteMapping],
    ) -> Result<(), RegistryError> {
        self.post_mappings("upsert", "/routing/v1/tcp_routes/create", mappings)
            .await
    }

    async fn delete_tcp_route_mappings(
        &self,
        mappings: &[TcpRouteMapping],
    ) -> Result<(), RegistryError> {
        self.post_mappings("delete", "/routing/v1/tcp_routes/delete", mappings)
            .await
    }
}

// =============================================================================
// Mock registry
// =============================================================================

/// In-memory routing API for tests and dry runs.
#[derive(Debug, Default)]
pub struct MockRoutingApi {
    groups: Mutex<HashMap<String, String>>,
    lookups: AtomicUsize,
    tokens: Mutex<Vec<String>>,
    upserts: Mutex<Vec<TcpRouteMapping>>,
    deletes: Mutex<Vec<TcpRouteMapping>>,
    fail_writes: AtomicBool,
}

impl MockRoutingApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a router group name → guid.
    pub fn add_group(&self, name: &str, guid: &str) {
        self.groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), guid.to_string());
    }

    /// Make upserts and deletes fail.
    pub fn set_failing_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn tokens(&self) -> Vec<String> {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn upserts(&self) -> Vec<TcpRouteMapping> {
        self.upserts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn deletes(&self) -> Vec<TcpRouteMapping> {
        self.deletes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn write(
        &self,
        log: &Mutex<Vec<TcpRouteMapping>>,
        operation: &'static str,
        mappings: &[TcpRouteMapping],
    ) -> Result<(), RegistryError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RegistryError::Status {
                operation,
                status: 503,
                body: "[MOCK] unavailable".to_string(),
            });
        }
        log.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(mappings);
        Ok(())
    }
}

#[async_trait]
impl RoutingApi for MockRoutingApi {
    async fn router_group_with_name(&self, name: &str) -> Result<RouterGroup, RegistryError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let guid = self
            .groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .unwrap_or_default();
        Ok(RouterGroup {
            guid,
            name: name.to_string(),
            group_type: "tcp".to_string(),
            reservable_ports: String::new(),
        })
    }

    fn set_token(&self, token: &str) {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(token.to_string());
    }

    async fn upsert_tcp_route_mappings(
        &self,
        mappings: &[TcpRouteMapping],
    ) -> Result<(), RegistryError> {
        self.write(&self.upserts, "upsert", mappings)
    }

    async fn delete_tcp_route_mappings(
        &self,
        mappings: &[TcpRouteMapping],
    ) -> Result<(), RegistryError> {
        self.write(&self.deletes, "delete", mappings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn mapping() -> TcpRouteMapping {
        TcpRouteMapping {
            router_group_guid: "rg-123".to_string(),
            port: 61000,
            backend_ip: "10.0.0.1".to_string(),
            backend_port: 5000,
            ttl: 12,
        }
    }

    #[tokio::test]
    async fn test_router_group_lookup_with_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/routing/v1/router_groups"))
            .and(query_param("name", "default-tcp"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"guid": "rg-123", "name": "default-tcp", "type": "tcp", "reservable_ports": "1024-1033"}
            ])))
            .mount(&server)
            .await;

        let client = HttpRoutingApiClient::new(&server.uri(), Duration::from_secs(5)).unwrap();
        client.set_token("tok");

        let group = client.router_group_with_name("default-tcp").await.unwrap();
        assert_eq!(group.guid, "rg-123");
        assert_eq!(group.group_type, "tcp");
    }

    #[tokio::test]
    async fn test_router_group_lookup_not_found_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/routing/v1/router_groups"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let client = HttpRoutingApiClient::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let group = client.router_group_with_name("missing").await.unwrap();
        assert!(group.guid.is_empty());
    }

    #[tokio::test]
    async fn test_upsert_and_delete_post_mappings() {
        let server = MockServer::start().await;
        let expected = serde_json::json!([{
            "router_group_guid": "rg-123",
            "port": 61000,
            "backend_ip": "10.0.0.1",
            "backend_port": 5000,
            "ttl": 12
        }]);
        Mock::given(method("POST"))
            .and(path("/routing/v1/tcp_routes/create"))
            .and(body_json(&expected))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/routing/v1/tcp_routes/delete"))
            .and(body_json(&expected))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpRoutingApiClient::new(&server.uri(), Duration::from_secs(5)).unwrap();
        client.upsert_tcp_route_mappings(&[mapping()]).await.unwrap();
        client.delete_tcp_route_mappings(&[mapping()]).await.unwrap();
    }

    #[tokio::test]
    async fn test_upsert_surfaces_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/routing/v1/tcp_routes/create"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = HttpRoutingApiClient::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let err = client
            .upsert_tcp_route_mappings(&[mapping()])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Status {
                operation: "upsert",
                status: 500,
                ..
            }
        ));
    }
}
