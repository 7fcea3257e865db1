//! Lease registrar for routes that reserve a port on a remote router group.
//!
//! Every register/unregister:
//! 1. refreshes the routing API token (always forced, never cached here)
//! 2. resolves the router group name to its guid through a process-lifetime cache
//! 3. computes the lease TTL
//! 4. upserts or deletes exactly one TCP route mapping
//!
//! Token and group failures abort before any mapping is touched. Nothing is
//! retried; the next periodic registration is the retry. The guid cache is
//! never invalidated, so fixing a misconfigured router group name takes a
//! restart.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::LeaseError;
use crate::registry::{RoutingApi, TcpRouteMapping};
use crate::route::Route;
use crate::token::TokenSource;

/// Margin added to the registration interval so a lease outlives the next renewal.
pub const LEASE_TTL_BUFFER: Duration = Duration::from_secs(2);

/// Default ceiling for lease TTLs.
pub const DEFAULT_MAX_TTL: Duration = Duration::from_secs(120);

/// Sequential remote calls in one register/unregister: token, group lookup, mapping.
const REMOTE_CALLS: u32 = 3;

/// Lease TTL for a registration interval: `min(interval + buffer, max_ttl)`.
pub fn lease_ttl(registration_interval: Duration, max_ttl: Duration) -> Duration {
    registration_interval
        .saturating_add(LEASE_TTL_BUFFER)
        .min(max_ttl)
}

/// Whole seconds for the wire, rounded up and still bounded by `max_ttl`.
pub fn ttl_seconds(ttl: Duration, max_ttl: Duration) -> u64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.min(max_ttl.as_secs())
}

/// Registers leased routes against the routing API.
pub struct LeaseRegistrar {
    tokens: Arc<dyn TokenSource>,
    api: Arc<dyn RoutingApi>,
    max_ttl: Duration,
    call_timeout: Duration,
    group_guids: RwLock<HashMap<String, String>>,
}

impl LeaseRegistrar {
    /// Create a new lease registrar.
    pub fn new(
        tokens: Arc<dyn TokenSource>,
        api: Arc<dyn RoutingApi>,
        max_ttl: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            tokens,
            api,
            max_ttl,
            call_timeout,
            group_guids: RwLock::new(HashMap::new()),
        }
    }

    /// Reserve (or renew) the route's external port.
    pub async fn register(&self, route: &Route) -> Result<(), LeaseError> {
        let mapping = self.prepare(route).await?;

        self.bounded("tcp route upsert", self.api.upsert_tcp_route_mappings(&[mapping.clone()]))
            .await?
            .map_err(LeaseError::Upsert)?;

        debug!(
            route = %route.name,
            router_group_guid = %mapping.router_group_guid,
            port = mapping.port,
            ttl = mapping.ttl,
            "Leased tcp route"
        );
        Ok(())
    }

    /// Release the route's external port.
    pub async fn unregister(&self, route: &Route) -> Result<(), LeaseError> {
        let mapping = self.prepare(route).await?;

        self.bounded("tcp route delete", self.api.delete_tcp_route_mappings(&[mapping.clone()]))
            .await?
            .map_err(LeaseError::Delete)?;

        debug!(
            route = %route.name,
            router_group_guid = %mapping.router_group_guid,
            port = mapping.port,
            "Released tcp route"
        );
        Ok(())
    }

    /// Longest a single register/unregister can take, with every remote
    /// call running up to its own timeout.
    pub fn call_budget(&self) -> Duration {
        self.call_timeout.saturating_mul(REMOTE_CALLS)
    }

    /// Number of cached router groups.
    pub async fn cached_groups(&self) -> usize {
        self.group_guids.read().await.len()
    }

    /// Steps shared by register and unregister: token, group guid, TTL.
    async fn prepare(&self, route: &Route) -> Result<TcpRouteMapping, LeaseError> {
        let target = route.lease_target().ok_or_else(|| LeaseError::NotLeased {
            route: route.name.clone(),
        })?;

        let token = self
            .bounded("token refresh", self.tokens.fetch_token(true))
            .await??;
        self.api.set_token(&token);

        let guid = self.router_group_guid(target.router_group).await?;

        let ttl = lease_ttl(route.registration_interval, self.max_ttl);

        Ok(TcpRouteMapping {
            router_group_guid: guid,
            port: target.external_port,
            backend_ip: route.host.clone(),
            backend_port: target.backend_port,
            ttl: ttl_seconds(ttl, self.max_ttl),
        })
    }

    async fn router_group_guid(&self, name: &str) -> Result<String, LeaseError> {
        if let Some(guid) = self.group_guids.read().await.get(name) {
            return Ok(guid.clone());
        }

        let group = self
            .bounded("router group lookup", self.api.router_group_with_name(name))
            .await?
            .map_err(|source| LeaseError::GroupLookup {
                group: name.to_string(),
                source,
            })?;

        if group.guid.is_empty() {
            return Err(LeaseError::RouterGroupNotFound {
                group: name.to_string(),
            });
        }

        info!(router_group = %name, guid = %group.guid, "Resolved router group");
        self.group_guids
            .write()
            .await
            .insert(name.to_string(), group.guid.clone());
        Ok(group.guid)
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = T>,
    ) -> Result<T, LeaseError> {
        tokio::time::timeout(self.call_timeout, call)
            .await
            .map_err(|_| LeaseError::Timeout {
                operation,
                after: self.call_timeout,
            })
    }
}
