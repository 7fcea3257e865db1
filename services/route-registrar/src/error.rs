//! Error types for the route registrar.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// A route definition that cannot be turned into a valid route.
///
/// These are configuration errors: the route is skipped and never retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    /// Route has no name.
    #[error("route definition is missing a name")]
    MissingName,

    /// Neither the route nor the global config provides a host.
    #[error("route {route}: no host configured and no default host set")]
    MissingHost { route: String },

    /// A duration field could not be parsed.
    #[error("route {route}: {field} is not a valid duration (got `{value}`)")]
    InvalidDuration {
        route: String,
        field: &'static str,
        value: String,
    },

    /// Registration interval is zero.
    #[error("route {route}: registration_interval must be greater than zero")]
    NonPositiveInterval { route: String },

    /// Only one of `external_port` / `router_group` is set.
    #[error("route {route}: external_port and router_group must be set together")]
    IncompleteLease { route: String },

    /// Route has no backend port.
    #[error("route {route}: a backend port is required")]
    MissingPort { route: String },

    /// Pub-sub route advertises no hostnames.
    #[error("route {route}: at least one uri is required")]
    MissingUris { route: String },

    /// Health-check timeout is zero or not shorter than the interval.
    #[error("route {route}: health_check.timeout must be positive and shorter than registration_interval")]
    InvalidHealthCheckTimeout { route: String },
}

/// Failures that stop the route set reconciler.
#[derive(Debug, Error)]
pub enum ReconcilerError {
    /// A configured glob pattern is malformed.
    #[error("invalid route pattern `{pattern}`: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    /// A directory could not be traversed while matching a pattern.
    #[error("failed to traverse route pattern `{pattern}`: {source}")]
    Traverse {
        pattern: String,
        #[source]
        source: glob::GlobError,
    },

    /// The blocking file enumeration task panicked or was cancelled.
    #[error("route source enumeration failed: {0}")]
    Enumerate(#[from] tokio::task::JoinError),

    /// The lifecycle controller stopped receiving events.
    #[error("route event receiver closed")]
    EventsClosed,
}

/// Health-check execution errors (distinct from an unhealthy result).
#[derive(Debug, Error)]
pub enum HealthCheckError {
    /// The script could not be started.
    #[error("failed to start health check {script}: {source}")]
    Spawn {
        script: String,
        #[source]
        source: io::Error,
    },

    /// Waiting on the script failed.
    #[error("failed to wait for health check {script}: {source}")]
    Wait {
        script: String,
        #[source]
        source: io::Error,
    },

    /// The script did not finish in time.
    #[error("health check {script} timed out after {after:?}")]
    Timeout { script: String, after: Duration },
}

/// Message bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    /// No servers configured.
    #[error("no message bus servers configured")]
    NoServers,

    /// Every configured server refused the connection.
    #[error("could not connect to any message bus server (last error: {last})")]
    Unreachable { last: String },

    /// Publishing before a connection exists.
    #[error("message bus is not connected")]
    NotConnected,

    /// Socket error while talking to the server.
    #[error("message bus io error: {0}")]
    Io(#[from] io::Error),

    /// Payload serialization failed.
    #[error("failed to encode registry message: {0}")]
    Encode(#[from] serde_json::Error),

    /// The server sent something unexpected.
    #[error("message bus protocol error: {0}")]
    Protocol(String),
}

/// Access-token acquisition errors.
#[derive(Debug, Error)]
pub enum TokenError {
    /// The token endpoint could not be reached.
    #[error("token request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The token endpoint rejected the request.
    #[error("token request rejected (status={status}): {body}")]
    Status { status: u16, body: String },
}

/// Remote routing registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The registry could not be reached.
    #[error("routing api request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The registry rejected the request.
    #[error("routing api {operation} failed (status={status}): {body}")]
    Status {
        operation: &'static str,
        status: u16,
        body: String,
    },
}

/// Lease registrar errors.
#[derive(Debug, Error)]
pub enum LeaseError {
    /// Route has no router group / external port.
    #[error("route {route} does not require a lease")]
    NotLeased { route: String },

    /// Credential refresh failed.
    #[error("failed to refresh routing api token: {0}")]
    Token(#[from] TokenError),

    /// Router-group lookup failed.
    #[error("failed to look up router group {group}: {source}")]
    GroupLookup {
        group: String,
        #[source]
        source: RegistryError,
    },

    /// The name resolved to no identifier.
    #[error("router group {group} not found")]
    RouterGroupNotFound { group: String },

    /// Upsert rejected.
    #[error("failed to upsert tcp route mapping: {0}")]
    Upsert(#[source] RegistryError),

    /// Delete rejected.
    #[error("failed to delete tcp route mapping: {0}")]
    Delete(#[source] RegistryError),

    /// A remote call exceeded the registrar's call timeout.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

/// Failure to deliver a register/unregister decision.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Message bus publish failed.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// Lease registrar call failed.
    #[error(transparent)]
    Lease(#[from] LeaseError),

    /// A leased route arrived but no lease registrar is configured.
    #[error("route {route} requires a lease but no routing api is configured")]
    LeaseUnavailable { route: String },

    /// The collaborator did not answer in time.
    #[error("dispatch timed out after {after:?}")]
    Timeout { after: Duration },
}
