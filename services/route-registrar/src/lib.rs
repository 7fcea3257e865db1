//! rtreg Route Registrar Library
//!
//! The route registrar keeps a dynamic, file-defined set of routes registered
//! with a routing fabric for as long as each route is both declared and
//! healthy, and withdraws it otherwise.
//!
//! ## Architecture
//!
//! ```text
//! route files ──▶ RouteSetReconciler ──RouteEvent──▶ LifecycleController
//!                                                     ├── RouteWorker(route)  (periodic health)
//!                                                     ├── MessageBus          (router.register / router.unregister)
//!                                                     └── LeaseRegistrar      (TCP port leases)
//!                                                          ├── TokenSource
//!                                                          └── RoutingApi
//! ```
//!
//! Every component runs as its own task. Queues are bounded and ordered;
//! shutdown and cancellation travel over `tokio::sync::watch` channels.
//!
//! ## Modules
//!
//! - `route`: route descriptors, definition files and validation
//! - `reconciler`: file discovery and route set diffing
//! - `controller`: worker supervision and dispatch
//! - `worker`: per-route periodic health evaluation
//! - `health`: health-check execution
//! - `bus`: NATS message bus publisher
//! - `lease`, `registry`, `token`: leased TCP routes via the routing API

pub mod bus;
pub mod config;
pub mod controller;
pub mod error;
pub mod health;
pub mod lease;
pub mod reconciler;
pub mod registry;
pub mod route;
pub mod token;
pub mod worker;

// Re-export commonly used types
pub use bus::{MessageBus, MockMessageBus, NatsMessageBus};
pub use config::Config;
pub use controller::{ControllerConfig, LifecycleController, ShutdownSummary};
pub use health::{HealthChecker, HealthOutcome, MockHealthChecker, ScriptHealthChecker};
pub use lease::LeaseRegistrar;
pub use reconciler::{RouteEvent, RouteSetReconciler};
pub use registry::{HttpRoutingApiClient, MockRoutingApi, RoutingApi};
pub use route::Route;
pub use token::{MockTokenSource, OAuthTokenSource, TokenSource};
