//! Configuration for the route registrar.

use std::fmt;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rtreg_reconcile::DEFAULT_RECONCILE_INTERVAL;

use crate::bus::MessageBusServer;
use crate::lease::DEFAULT_MAX_TTL;

/// Port used when a message bus URL does not name one.
pub const DEFAULT_MESSAGE_BUS_PORT: u16 = 4222;

/// Default bound on remote calls.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Route registrar configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Glob patterns selecting route definition files.
    pub route_globs: Vec<String>,

    /// Host used for routes that do not name one.
    pub default_host: Option<String>,

    /// Interval between route set reconciliation passes.
    pub reconcile_interval: Duration,

    /// Message bus servers, tried in order.
    pub message_bus_servers: Vec<MessageBusServer>,

    /// Identifies this registrar instance to the routing fabric.
    pub instance_id: String,

    /// Routing API settings; required for leased routes.
    pub routing_api: Option<RoutingApiConfig>,

    /// Ceiling for lease TTLs.
    pub max_ttl: Duration,

    /// Bound on every remote call.
    pub request_timeout: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Routing API and OAuth settings.
#[derive(Clone)]
pub struct RoutingApiConfig {
    pub api_url: String,
    pub oauth_url: String,
    pub client_id: String,
    pub client_secret: String,
}

impl fmt::Debug for RoutingApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingApiConfig")
            .field("api_url", &self.api_url)
            .field("oauth_url", &self.oauth_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let route_globs = split_list(&var("RTREG_ROUTE_GLOBS").unwrap_or_default());
        if route_globs.is_empty() {
            bail!("RTREG_ROUTE_GLOBS must name at least one pattern");
        }

        let default_host = var("RTREG_DEFAULT_HOST");

        let reconcile_interval = duration_var(
            var("RTREG_RECONCILE_INTERVAL"),
            "RTREG_RECONCILE_INTERVAL",
            DEFAULT_RECONCILE_INTERVAL,
        )?;

        let message_bus_servers = split_list(&var("RTREG_MESSAGE_BUS_SERVERS").unwrap_or_default())
            .iter()
            .map(|raw| parse_message_bus_server(raw))
            .collect::<Result<Vec<_>>>()?;

        let instance_id =
            var("RTREG_INSTANCE_ID").unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let routing_api = match (
            var("RTREG_ROUTING_API_URL"),
            var("RTREG_OAUTH_URL"),
            var("RTREG_CLIENT_ID"),
            var("RTREG_CLIENT_SECRET"),
        ) {
            (Some(api_url), Some(oauth_url), Some(client_id), Some(client_secret)) => {
                Some(RoutingApiConfig {
                    api_url,
                    oauth_url,
                    client_id,
                    client_secret,
                })
            }
            (None, None, None, None) => None,
            _ => bail!(
                "RTREG_ROUTING_API_URL, RTREG_OAUTH_URL, RTREG_CLIENT_ID and RTREG_CLIENT_SECRET must be set together"
            ),
        };

        let max_ttl = duration_var(var("RTREG_MAX_TTL"), "RTREG_MAX_TTL", DEFAULT_MAX_TTL)?;
        if max_ttl < Duration::from_secs(1) {
            bail!("RTREG_MAX_TTL must be at least one second");
        }

        let request_timeout = duration_var(
            var("RTREG_REQUEST_TIMEOUT"),
            "RTREG_REQUEST_TIMEOUT",
            DEFAULT_REQUEST_TIMEOUT,
        )?;

        let log_level = var("RTREG_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            route_globs,
            default_host,
            reconcile_interval,
            message_bus_servers,
            instance_id,
            routing_api,
            max_ttl,
            request_timeout,
            log_level,
        })
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn duration_var(value: Option<String>, key: &str, default: Duration) -> Result<Duration> {
    let Some(raw) = value else {
        return Ok(default);
    };
    let parsed = humantime::parse_duration(&raw)
        .with_context(|| format!("invalid duration in {key}: {raw}"))?;
    if parsed.is_zero() {
        bail!("{key} must be positive");
    }
    Ok(parsed)
}

/// Parse `nats://[user[:password]@]host[:port]`.
fn parse_message_bus_server(raw: &str) -> Result<MessageBusServer> {
    let url = reqwest::Url::parse(raw)
        .with_context(|| format!("invalid message bus server url: {raw}"))?;
    if url.scheme() != "nats" {
        bail!("message bus server url must use the nats scheme: {raw}");
    }
    let host = url
        .host_str()
        .with_context(|| format!("message bus server url has no host: {raw}"))?;
    let port = url.port().unwrap_or(DEFAULT_MESSAGE_BUS_PORT);

    let user = Some(url.username())
        .filter(|u| !u.is_empty())
        .map(str::to_string);
    let password = url.password().map(str::to_string);

    Ok(MessageBusServer {
        address: format!("{host}:{port}"),
        user,
        password,
    })
}
