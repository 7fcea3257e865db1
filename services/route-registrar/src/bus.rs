//! Message bus used to announce pub-sub routes to the routing fabric.
//!
//! The fabric listens on `router.register` / `router.unregister`; each message
//! carries a JSON [`RegistryMessage`] describing one route. Delivery is
//! best-effort: a lost message is repaired by the next periodic register.
//!
//! [`NatsMessageBus`] speaks the plain NATS text protocol over TCP:
//!
//! ```text
//! S: INFO {...}
//! C: CONNECT {"verbose":false,...}
//! C: PING
//! S: PONG
//! C: PUB router.register 123
//! C: {"host":...}
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::BusError;
use crate::route::{Route, RouteOptions};

/// Subject for route announcements.
pub const REGISTER_SUBJECT: &str = "router.register";

/// Subject for route withdrawals.
pub const UNREGISTER_SUBJECT: &str = "router.unregister";

/// One message bus server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBusServer {
    /// `host:port`.
    pub address: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

/// Pub-sub transport to the routing fabric.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Connect to the first reachable server.
    async fn connect(&self, servers: &[MessageBusServer]) -> Result<(), BusError>;

    /// Publish one route on `subject`.
    async fn send_message(
        &self,
        subject: &str,
        route: &Route,
        origin_host: &str,
        instance_id: &str,
    ) -> Result<(), BusError>;

    /// Close the connection.
    async fn close(&self);
}

/// Wire payload for `router.register` / `router.unregister`.
#[derive(Debug, Serialize)]
pub struct RegistryMessage<'a> {
    pub host: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_port: Option<u16>,
    pub uris: &'a [String],
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: &'a BTreeMap<String, String>,
    pub private_instance_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_service_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_cert_domain_san: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<&'a RouteOptions>,
}

impl<'a> RegistryMessage<'a> {
    pub fn new(route: &'a Route, origin_host: &'a str, instance_id: &'a str) -> Self {
        Self {
            host: origin_host,
            port: route.port,
            tls_port: route.tls_port,
            uris: &route.uris,
            tags: &route.tags,
            private_instance_id: instance_id,
            route_service_url: route.route_service_url.as_deref(),
            server_cert_domain_san: route.server_cert_domain_san.as_deref(),
            options: route.options.as_ref(),
        }
    }
}

// =============================================================================
// NATS
// =============================================================================

#[derive(Serialize)]
struct ConnectOptions<'a> {
    verbose: bool,
    pedantic: bool,
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pass: Option<&'a str>,
}

struct NatsConnection {
    server: String,
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

/// NATS publisher.
///
/// A broken connection is dropped on the failing publish and re-established
/// on the next one. Re-dial and publish together stay within one I/O timeout.
pub struct NatsMessageBus {
    client_name: String,
    io_timeout: Duration,
    servers: Mutex<Vec<MessageBusServer>>,
    connection: tokio::sync::Mutex<Option<NatsConnection>>,
}

impl NatsMessageBus {
    /// Create a disconnected publisher.
    pub fn new(client_name: impl Into<String>, io_timeout: Duration) -> Self {
        Self {
            client_name: client_name.into(),
            io_timeout,
            servers: Mutex::new(Vec::new()),
            connection: tokio::sync::Mutex::new(None),
        }
    }

    /// Try each server in order before `deadline`. The time left is split
    /// evenly across the servers not yet tried, so a silent server cannot
    /// starve the rest.
    async fn dial(
        &self,
        servers: &[MessageBusServer],
        deadline: Instant,
    ) -> Result<NatsConnection, BusError> {
        if servers.is_empty() {
            return Err(BusError::NoServers);
        }

        let mut last = String::new();
        for (i, server) in servers.iter().enumerate() {
            let slot = dial_slot(deadline, servers.len() - i);
            let attempt = tokio::time::timeout(slot, self.handshake(server)).await;
            match attempt {
                Ok(Ok(conn)) => {
                    info!(server = %server.address, "Connected to message bus");
                    return Ok(conn);
                }
                Ok(Err(e)) => {
                    warn!(server = %server.address, error = %e, "Message bus connection failed");
                    last = e.to_string();
                }
                Err(_) => {
                    warn!(server = %server.address, "Message bus connection timed out");
                    last = format!("{} timed out", server.address);
                }
            }
        }

        Err(BusError::Unreachable { last })
    }

    async fn handshake(&self, server: &MessageBusServer) -> Result<NatsConnection, BusError> {
        let stream = TcpStream::connect(&server.address).await?;
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);

        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 || !line.starts_with("INFO") {
            return Err(BusError::Protocol(format!(
                "expected INFO from {}, got `{}`",
                server.address,
                line.trim_end()
            )));
        }

        let connect = ConnectOptions {
            verbose: false,
            pedantic: false,
            name: &self.client_name,
            user: server.user.as_deref(),
            pass: server.password.as_deref(),
        };
        let frame = format!("CONNECT {}\r\nPING\r\n", serde_json::to_string(&connect)?);
        write.write_all(frame.as_bytes()).await?;

        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Err(BusError::Protocol(
                    "connection closed during handshake".to_string(),
                ));
            }
            match line.trim_end() {
                "PONG" => break,
                "PING" => write.write_all(b"PONG\r\n").await?,
                err if err.starts_with("-ERR") => {
                    return Err(BusError::Protocol(err.to_string()));
                }
                _ => {}
            }
        }

        let writer = Arc::new(tokio::sync::Mutex::new(write));
        let alive = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_loop(
            reader,
            Arc::clone(&writer),
            Arc::clone(&alive),
            server.address.clone(),
        ));

        Ok(NatsConnection {
            server: server.address.clone(),
            writer,
            alive,
            reader,
        })
    }

    fn configured_servers(&self) -> Vec<MessageBusServer> {
        self.servers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Handshake budget for the next server when `remaining` servers are left to try.
fn dial_slot(deadline: Instant, remaining: usize) -> Duration {
    let remaining = u32::try_from(remaining.max(1)).unwrap_or(u32::MAX);
    deadline.saturating_duration_since(Instant::now()) / remaining
}

/// Answer server PINGs until the connection drops.
async fn read_loop(
    mut reader: BufReader<OwnedReadHalf>,
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    alive: Arc<AtomicBool>,
    server: String,
) {
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                warn!(server = %server, "Message bus closed the connection");
                break;
            }
            Ok(_) => match line.trim_end() {
                "PING" => {
                    let mut w = writer.lock().await;
                    if let Err(e) = w.write_all(b"PONG\r\n").await {
                        warn!(server = %server, error = %e, "Failed to answer message bus PING");
                        break;
                    }
                }
                err if err.starts_with("-ERR") => {
                    warn!(server = %server, error = %err, "Message bus reported an error");
                }
                _ => {}
            },
            Err(e) => {
                warn!(server = %server, error = %e, "Message bus read failed");
                break;
            }
        }
    }
    alive.store(false, Ordering::SeqCst);
}

#[async_trait]
impl MessageBus for NatsMessageBus {
    async fn connect(&self, servers: &[MessageBusServer]) -> Result<(), BusError> {
        *self.servers.lock().unwrap_or_else(PoisonError::into_inner) = servers.to_vec();

        let conn = self.dial(servers, Instant::now() + self.io_timeout).await?;
        if let Some(old) = self.connection.lock().await.replace(conn) {
            old.reader.abort();
        }
        Ok(())
    }

    async fn send_message(
        &self,
        subject: &str,
        route: &Route,
        origin_host: &str,
        instance_id: &str,
    ) -> Result<(), BusError> {
        let payload = serde_json::to_vec(&RegistryMessage::new(route, origin_host, instance_id))?;
        let deadline = Instant::now() + self.io_timeout;

        let mut guard = self.connection.lock().await;
        let needs_dial = match guard.as_ref() {
            Some(conn) => !conn.alive.load(Ordering::SeqCst),
            None => true,
        };
        if needs_dial {
            let servers = self.configured_servers();
            if servers.is_empty() {
                return Err(BusError::NotConnected);
            }
            if let Some(old) = guard.take() {
                old.reader.abort();
            }
            *guard = Some(self.dial(&servers, deadline).await?);
        }

        let Some(conn) = guard.as_ref() else {
            return Err(BusError::NotConnected);
        };

        let mut frame = format!("PUB {} {}\r\n", subject, payload.len()).into_bytes();
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(b"\r\n");

        let write = async {
            let mut w = conn.writer.lock().await;
            w.write_all(&frame).await?;
            w.flush().await
        };

        let result = match tokio::time::timeout_at(deadline, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(BusError::Io(e)),
            Err(_) => Err(BusError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "publish timed out",
            ))),
        };

        match result {
            Ok(()) => {
                debug!(
                    subject,
                    route = %route.name,
                    server = %conn.server,
                    bytes = payload.len(),
                    "Published route"
                );
                Ok(())
            }
            Err(e) => {
                if let Some(broken) = guard.take() {
                    broken.reader.abort();
                }
                Err(e)
            }
        }
    }

    async fn close(&self) {
        if let Some(conn) = self.connection.lock().await.take() {
            conn.reader.abort();
            let mut w = conn.writer.lock().await;
            let _ = w.shutdown().await;
            info!(server = %conn.server, "Message bus connection closed");
        }
    }
}

// =============================================================================
// Mock bus
// =============================================================================

/// A call observed by [`MockMessageBus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusCall {
    pub subject: String,
    pub route: Route,
}

/// Recording message bus for tests and dry runs.
#[derive(Debug, Default)]
pub struct MockMessageBus {
    calls: Mutex<Vec<BusCall>>,
    failing_routes: Mutex<Vec<String>>,
}

impl MockMessageBus {
    /// Create a new recording bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every publish for the named route fail (the call is still recorded).
    pub fn fail_route(&self, name: &str) {
        self.failing_routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(name.to_string());
    }

    /// All calls so far.
    pub fn calls(&self) -> Vec<BusCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Calls for one route on one subject.
    pub fn count(&self, subject: &str, route_name: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.subject == subject && c.route.name == route_name)
            .count()
    }
}

#[async_trait]
impl MessageBus for MockMessageBus {
    async fn connect(&self, servers: &[MessageBusServer]) -> Result<(), BusError> {
        if servers.is_empty() {
            return Err(BusError::NoServers);
        }
        Ok(())
    }

    async fn send_message(
        &self,
        subject: &str,
        route: &Route,
        _origin_host: &str,
        _instance_id: &str,
    ) -> Result<(), BusError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(BusCall {
                subject: subject.to_string(),
                route: route.clone(),
            });

        let failing = self
            .failing_routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|r| r == &route.name);
        if failing {
            return Err(BusError::Protocol(format!("[MOCK] publish of {} rejected", route.name)));
        }
        Ok(())
    }

    async fn close(&self) {}
}
