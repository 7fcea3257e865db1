//! Route descriptors and their on-disk definitions.
//!
//! A [`Route`] has no surrogate key: two routes are the same route exactly when
//! every field is equal. Tags live in a `BTreeMap` so equality and hashing
//! compare content, never insertion order.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use rtreg_reconcile::Fingerprint;
use serde::{Deserialize, Serialize};

use crate::error::RouteError;

/// One desired route, validated and with its host resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Route {
    pub name: String,
    pub host: String,
    pub port: Option<u16>,
    pub tls_port: Option<u16>,
    pub external_port: Option<u16>,
    pub router_group: Option<String>,
    pub uris: Vec<String>,
    pub tags: BTreeMap<String, String>,
    pub route_service_url: Option<String>,
    pub registration_interval: Duration,
    pub health_check: Option<HealthCheck>,
    pub options: Option<RouteOptions>,
    pub server_cert_domain_san: Option<String>,
}

/// The remote reservation a leased route needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseTarget<'a> {
    pub router_group: &'a str,
    pub external_port: u16,
    pub backend_port: u16,
}

impl Route {
    /// Returns true if the route is registered through the remote registry
    /// rather than announced on the message bus.
    pub fn is_leased(&self) -> bool {
        self.router_group.is_some() && self.external_port.is_some()
    }

    /// The lease coordinates, if this is a leased route.
    pub fn lease_target(&self) -> Option<LeaseTarget<'_>> {
        match (&self.router_group, self.external_port, self.port) {
            (Some(group), Some(external_port), Some(backend_port)) => Some(LeaseTarget {
                router_group: group,
                external_port,
                backend_port,
            }),
            _ => None,
        }
    }

    /// Content fingerprint for logs and worker names.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self)
    }
}

/// Script-based health check attached to a route.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct HealthCheck {
    pub name: String,
    pub script_path: PathBuf,
    pub timeout: Duration,
}

/// Hints forwarded to the routing fabric.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteOptions {
    #[serde(
        rename = "loadbalancing",
        alias = "load_balancing_algorithm",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub load_balancing_algorithm: Option<String>,
}

// =============================================================================
// Definitions
// =============================================================================

/// A route definition file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouteFile {
    #[serde(default)]
    pub routes: Vec<RouteDefinition>,
}

/// A route as written in a definition file, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouteDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub tls_port: Option<u16>,
    #[serde(default)]
    pub external_port: Option<u16>,
    #[serde(default)]
    pub router_group: Option<String>,
    #[serde(default)]
    pub uris: Vec<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub route_service_url: Option<String>,
    #[serde(default)]
    pub registration_interval: Option<String>,
    #[serde(default)]
    pub health_check: Option<HealthCheckDefinition>,
    #[serde(default)]
    pub options: Option<RouteOptions>,
    #[serde(default)]
    pub server_cert_domain_san: Option<String>,
}

/// Health check as written in a definition file.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthCheckDefinition {
    #[serde(default)]
    pub name: Option<String>,
    pub script_path: PathBuf,
    #[serde(default)]
    pub timeout: Option<String>,
}

/// Parse the contents of a definition file.
pub fn parse_route_file(contents: &str) -> Result<RouteFile, serde_yaml::Error> {
    if contents.trim().is_empty() {
        return Ok(RouteFile::default());
    }
    serde_yaml::from_str(contents)
}

impl RouteDefinition {
    /// Validate the definition and resolve its host.
    ///
    /// `default_host` is used when the definition does not name one.
    pub fn resolve(self, default_host: Option<&str>) -> Result<Route, RouteError> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(RouteError::MissingName);
        }

        let host = self
            .host
            .filter(|h| !h.trim().is_empty())
            .or_else(|| default_host.filter(|h| !h.is_empty()).map(str::to_string))
            .ok_or_else(|| RouteError::MissingHost {
                route: name.clone(),
            })?;

        let registration_interval = match self.registration_interval.as_deref() {
            Some(raw) => parse_duration(&name, "registration_interval", raw)?,
            None => Duration::ZERO,
        };
        if registration_interval.is_zero() {
            return Err(RouteError::NonPositiveInterval { route: name });
        }

        match (&self.router_group, self.external_port) {
            (Some(_), Some(_)) => {
                if self.port.is_none() {
                    return Err(RouteError::MissingPort { route: name });
                }
            }
            (None, None) => {
                if self.port.is_none() && self.tls_port.is_none() {
                    return Err(RouteError::MissingPort { route: name });
                }
                if self.uris.is_empty() {
                    return Err(RouteError::MissingUris { route: name });
                }
            }
            _ => return Err(RouteError::IncompleteLease { route: name }),
        }

        let health_check = match self.health_check {
            Some(def) => Some(def.resolve(&name, registration_interval)?),
            None => None,
        };

        Ok(Route {
            name,
            host,
            port: self.port,
            tls_port: self.tls_port,
            external_port: self.external_port,
            router_group: self.router_group,
            uris: self.uris,
            tags: self.tags,
            route_service_url: self.route_service_url,
            registration_interval,
            health_check,
            options: self.options,
            server_cert_domain_san: self.server_cert_domain_san,
        })
    }
}

impl HealthCheckDefinition {
    fn resolve(self, route: &str, interval: Duration) -> Result<HealthCheck, RouteError> {
        let timeout = match self.timeout.as_deref() {
            Some(raw) => parse_duration(route, "health_check.timeout", raw)?,
            None => interval / 2,
        };

        if timeout.is_zero() || timeout >= interval {
            return Err(RouteError::InvalidHealthCheckTimeout {
                route: route.to_string(),
            });
        }

        let name = self
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("{route}-health-check"));

        Ok(HealthCheck {
            name,
            script_path: self.script_path,
            timeout,
        })
    }
}

fn parse_duration(route: &str, field: &'static str, raw: &str) -> Result<Duration, RouteError> {
    humantime::parse_duration(raw.trim()).map_err(|_| RouteError::InvalidDuration {
        route: route.to_string(),
        field,
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_definition(name: &str) -> RouteDefinition {
        RouteDefinition {
            name: name.to_string(),
            port: Some(8080),
            uris: vec![format!("{name}.example.com")],
            registration_interval: Some("10s".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_falls_back_to_default_host() {
        let route = http_definition("api").resolve(Some("10.0.0.5")).unwrap();
        assert_eq!(route.host, "10.0.0.5");
        assert_eq!(route.registration_interval, Duration::from_secs(10));
        assert!(!route.is_leased());
    }

    #[test]
    fn test_resolve_prefers_route_host() {
        let mut def = http_definition("api");
        def.host = Some("10.0.0.9".to_string());
        let route = def.resolve(Some("10.0.0.5")).unwrap();
        assert_eq!(route.host, "10.0.0.9");
    }

    #[test]
    fn test_resolve_rejects_missing_host() {
        let err = http_definition("api").resolve(None).unwrap_err();
        assert_eq!(
            err,
            RouteError::MissingHost {
                route: "api".to_string()
            }
        );
    }

    #[test]
    fn test_resolve_rejects_zero_or_missing_interval() {
        let mut def = http_definition("api");
        def.registration_interval = Some("0s".to_string());
        assert!(matches!(
            def.resolve(Some("h")),
            Err(RouteError::NonPositiveInterval { .. })
        ));

        let mut def = http_definition("api");
        def.registration_interval = None;
        assert!(matches!(
            def.resolve(Some("h")),
            Err(RouteError::NonPositiveInterval { .. })
        ));
    }

    #[test]
    fn test_resolve_rejects_unparseable_interval() {
        let mut def = http_definition("api");
        def.registration_interval = Some("soon".to_string());
        assert!(matches!(
            def.resolve(Some("h")),
            Err(RouteError::InvalidDuration {
                field: "registration_interval",
                ..
            })
        ));
    }

    #[test]
    fn test_health_check_timeout_defaults_to_half_interval() {
        let mut def = http_definition("api");
        def.health_check = Some(HealthCheckDefinition {
            name: None,
            script_path: PathBuf::from("/bin/true"),
            timeout: None,
        });

        let route = def.resolve(Some("h")).unwrap();
        let check = route.health_check.unwrap();
        assert_eq!(check.timeout, Duration::from_secs(5));
        assert_eq!(check.name, "api-health-check");
    }

    #[test]
    fn test_health_check_timeout_must_be_shorter_than_interval() {
        let mut def = http_definition("api");
        def.health_check = Some(HealthCheckDefinition {
            name: Some("check".to_string()),
            script_path: PathBuf::from("/bin/true"),
            timeout: Some("10s".to_string()),
        });

        assert!(matches!(
            def.resolve(Some("h")),
            Err(RouteError::InvalidHealthCheckTimeout { .. })
        ));
    }

    #[test]
    fn test_leased_route_requires_both_fields() {
        let def = RouteDefinition {
            name: "tcp".to_string(),
            port: Some(5000),
            external_port: Some(61000),
            registration_interval: Some("5s".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            def.resolve(Some("h")),
            Err(RouteError::IncompleteLease { .. })
        ));
    }

    #[test]
    fn test_leased_route_resolves_without_uris() {
        let def = RouteDefinition {
            name: "tcp".to_string(),
            port: Some(5000),
            external_port: Some(61000),
            router_group: Some("default-tcp".to_string()),
            registration_interval: Some("5s".to_string()),
            ..Default::default()
        };

        let route = def.resolve(Some("10.1.1.1")).unwrap();
        assert!(route.is_leased());
        let target = route.lease_target().unwrap();
        assert_eq!(target.router_group, "default-tcp");
        assert_eq!(target.external_port, 61000);
        assert_eq!(target.backend_port, 5000);
    }

    #[test]
    fn test_pub_sub_route_requires_uris() {
        let mut def = http_definition("api");
        def.uris.clear();
        assert!(matches!(
            def.resolve(Some("h")),
            Err(RouteError::MissingUris { .. })
        ));
    }

    #[test]
    fn test_parse_route_file_tag_order_does_not_matter() {
        let a = parse_route_file(
            r#"
routes:
  - name: api
    port: 8080
    uris: [api.example.com]
    registration_interval: 10s
    tags:
      component: api
      env: prod
"#,
        )
        .unwrap();
        let b = parse_route_file(
            r#"
routes:
  - name: api
    port: 8080
    uris: [api.example.com]
    registration_interval: 10s
    tags:
      env: prod
      component: api
"#,
        )
        .unwrap();

        let ra = a.routes.into_iter().next().unwrap().resolve(Some("h")).unwrap();
        let rb = b.routes.into_iter().next().unwrap().resolve(Some("h")).unwrap();
        assert_eq!(ra, rb);
        assert_eq!(ra.fingerprint(), rb.fingerprint());
    }

    #[test]
    fn test_parse_route_file_options_and_empty_file() {
        let file = parse_route_file(
            r#"
routes:
  - name: api
    port: 8080
    uris: [api.example.com]
    registration_interval: 1s
    options:
      loadbalancing: least-connection
"#,
        )
        .unwrap();
        let route = file.routes[0].clone().resolve(Some("h")).unwrap();
        assert_eq!(
            route.options.unwrap().load_balancing_algorithm.as_deref(),
            Some("least-connection")
        );

        assert!(parse_route_file("   \n").unwrap().routes.is_empty());
    }
}
