//! The terminal facade.
//!
//! A [`Terminal`] owns one host connection, optional peer tunnels, a serving
//! side and a calling side, and keeps its own directory entry published. It
//! is the only type most users touch: register services, issue requests,
//! everything else runs in background tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::{CallStream, TerminalClient};
use crate::config::TerminalConfig;
use crate::error::{ProtocolError, Result};
use crate::frame;
use crate::metrics;
use crate::model::{now_ms, ResponsePayload, ServiceInfo, TerminalInfo, TerminalMessage};
use crate::security::{self, Keyring};
use crate::server::{respond_with, ServiceHandler, ServiceOptions, TerminalServer};
use crate::topology::TopologySync;
use crate::transport::tunnel::signal::{signal_method, SignalRequest};
use crate::transport::tunnel::PeerTunnel;
use crate::transport::{ConnectionAdapter, Dialer, WsDialer};

struct TerminalInner {
    config: TerminalConfig,
    info: Arc<Mutex<TerminalInfo>>,
    adapter: ConnectionAdapter,
    tunnel: Option<PeerTunnel>,
    server: TerminalServer,
    client: TerminalClient,
    topology: TopologySync,
    keyring: Arc<Keyring>,
    disposed: AtomicBool,
}

/// One protocol participant. Clones share state.
#[derive(Clone)]
pub struct Terminal {
    inner: Arc<TerminalInner>,
}

impl Terminal {
    /// Connect to the host named in the config over websocket. The terminal
    /// id becomes the final path segment of the dialed endpoint.
    pub async fn connect(config: TerminalConfig) -> Result<Self> {
        let mut endpoint = url::Url::parse(&config.host_url)
            .map_err(|_| ProtocolError::InvalidHostUrl(config.host_url.clone()))?;
        endpoint
            .path_segments_mut()
            .map_err(|_| ProtocolError::InvalidHostUrl(config.host_url.clone()))?
            .pop_if_empty()
            .push(&config.terminal_id);
        let dialer = Arc::new(WsDialer::new(endpoint.to_string()));
        Self::with_dialer(config, dialer).await
    }

    /// Connect through an explicit dialer. Tests and embedded hosts use this
    /// with the in-memory transport.
    pub async fn with_dialer(config: TerminalConfig, dialer: Arc<dyn Dialer>) -> Result<Self> {
        let terminal_id = config.terminal_id.clone();
        info!(terminal_id = %terminal_id, "terminal starting");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<TerminalMessage>();
        let (adapter, inbound_raw) = ConnectionAdapter::start(dialer, config.connection.clone());

        let (tunnel, tunnel_inbound) = if config.enable_tunnel {
            let (tunnel, rx) = PeerTunnel::new(terminal_id.clone(), config.tunnel.clone());
            (Some(tunnel), Some(rx))
        } else {
            (None, None)
        };

        let server = TerminalServer::new(terminal_id.clone(), outbound_tx.clone());
        server.spawn_background();
        let client = TerminalClient::new(terminal_id.clone(), outbound_tx.clone());

        let info = Arc::new(Mutex::new(TerminalInfo {
            terminal_id: terminal_id.clone(),
            name: config.name.clone(),
            created_at: now_ms(),
            updated_at: now_ms(),
            tags: config.tags.clone(),
            ..Default::default()
        }));
        let topology = TopologySync::new(client.clone(), Arc::clone(&info));
        topology.spawn(adapter.connected());

        // callers should not ride out the idle window when the host link
        // drops; fail their traces as soon as the connection flag flips
        let guard_client = client.clone();
        let mut connected = adapter.connected();
        tokio::spawn(async move {
            while connected.changed().await.is_ok() {
                if !*connected.borrow() {
                    guard_client.abort_open_traces();
                }
            }
        });

        let keyring = Arc::new(Keyring::new());
        let terminal = Self {
            inner: Arc::new(TerminalInner {
                config,
                info,
                adapter,
                tunnel,
                server,
                client,
                topology,
                keyring,
                disposed: AtomicBool::new(false),
            }),
        };

        terminal.spawn_egress(outbound_rx);
        terminal.spawn_dispatch(inbound_raw, tunnel_inbound);
        terminal.register_builtin_services()?;
        terminal.inner.topology.schedule_push();
        Ok(terminal)
    }

    pub fn terminal_id(&self) -> &str {
        &self.inner.config.terminal_id
    }

    pub fn client(&self) -> &TerminalClient {
        &self.inner.client
    }

    pub fn keyring(&self) -> &Arc<Keyring> {
        &self.inner.keyring
    }

    /// The current directory snapshot, sorted by terminal id.
    pub fn terminal_infos(&self) -> Arc<Vec<TerminalInfo>> {
        self.inner.topology.snapshot()
    }

    /// Register a service and advertise it in the directory.
    pub fn provide(
        &self,
        service_id: impl Into<String>,
        method: impl Into<String>,
        schema: Value,
        options: ServiceOptions,
        handler: ServiceHandler,
    ) -> Result<()> {
        self.ensure_live()?;
        let service = ServiceInfo {
            service_id: service_id.into(),
            method: method.into(),
            schema,
        };
        self.inner
            .server
            .provide(service.clone(), options, handler)?;
        {
            let mut info = self.inner.info.lock();
            info.service_info
                .insert(service.service_id.clone(), service);
            info.updated_at = now_ms();
        }
        self.inner.topology.schedule_push();
        Ok(())
    }

    /// Remove a service and stop advertising it.
    pub fn dispose_service(&self, service_id: &str) {
        self.inner.server.dispose(service_id);
        {
            let mut info = self.inner.info.lock();
            info.service_info.remove(service_id);
            info.updated_at = now_ms();
        }
        self.inner.topology.schedule_push();
    }

    /// Issue a request toward a random capable target.
    pub fn request(&self, method: &str, req: Value) -> Result<CallStream> {
        self.ensure_live()?;
        self.inner.client.request(method, req)
    }

    /// Issue a request toward an explicit terminal.
    pub fn request_to(&self, target: &str, method: &str, req: Value) -> Result<CallStream> {
        self.ensure_live()?;
        Ok(self.inner.client.request_to(target, method, req))
    }

    /// Issue a request and wait for the final response payload.
    pub async fn request_for_response(&self, method: &str, req: Value) -> Result<ResponsePayload> {
        self.ensure_live()?;
        self.inner.client.request_for_response(method, req).await
    }

    /// Terminal ids currently able to serve `method` with this body.
    pub fn resolve_targets(&self, method: &str, req: &Value) -> Vec<String> {
        self.inner.client.resolve_targets(method, req)
    }

    /// Establish a shared key with a peer.
    pub async fn handshake(&self, peer_id: &str) -> Result<()> {
        self.ensure_live()?;
        security::initiate(&self.inner.client, &self.inner.keyring, peer_id).await
    }

    /// Stop the terminal. Idempotent; requests after this fail with
    /// [`ProtocolError::Disposed`]. Registered services abort their queued
    /// and in-flight work, and this terminal's open calls end promptly.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(terminal_id = %self.inner.config.terminal_id, "terminal disposed");
        if let Some(tunnel) = &self.inner.tunnel {
            tunnel.dispose();
        }
        self.inner.server.dispose_all();
        self.inner.client.dispose();
    }

    fn ensure_live(&self) -> Result<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(ProtocolError::Disposed);
        }
        Ok(())
    }

    /// Outbound pump: prefer an open tunnel toward the target, fall back to
    /// the host connection on any tunnel miss or failure.
    fn spawn_egress(&self, mut outbound_rx: mpsc::UnboundedReceiver<TerminalMessage>) {
        let terminal = self.clone();
        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let target = msg.target_terminal_id.clone();
                if let Some(tunnel) = &terminal.inner.tunnel {
                    if terminal.peer_supports_tunnel(&target) {
                        tunnel.ensure(terminal.inner.client.clone(), target.clone());
                    }
                    if tunnel.is_open(&target) {
                        match serde_json::to_string(&msg) {
                            Ok(body) => {
                                if tunnel.try_send(&target, &body).await {
                                    continue;
                                }
                            }
                            Err(err) => {
                                warn!(error = %err, "unserializable outbound message dropped");
                                continue;
                            }
                        }
                    }
                }
                match frame::encode(&msg) {
                    Ok(raw) => terminal.inner.adapter.send(raw),
                    Err(err) => warn!(error = %err, "unencodable outbound message dropped"),
                }
            }
        });
    }

    fn peer_supports_tunnel(&self, peer_id: &str) -> bool {
        let method = signal_method();
        self.inner
            .topology
            .snapshot()
            .iter()
            .find(|t| t.terminal_id == peer_id)
            .map_or(false, |t| {
                t.service_info.values().any(|s| s.method == method)
            })
    }

    /// Inbound pump: decode raw frames from both paths and hand them to the
    /// serving or calling side.
    fn spawn_dispatch(
        &self,
        mut host_rx: mpsc::UnboundedReceiver<String>,
        tunnel_rx: Option<mpsc::UnboundedReceiver<String>>,
    ) {
        let terminal = self.clone();
        tokio::spawn(async move {
            let mut tunnel_rx = tunnel_rx;
            loop {
                let raw = tokio::select! {
                    raw = host_rx.recv() => match raw {
                        Some(raw) => raw,
                        None => return,
                    },
                    raw = recv_opt(&mut tunnel_rx) => match raw {
                        Some(raw) => raw,
                        None => {
                            tunnel_rx = None;
                            continue;
                        }
                    },
                };
                match frame::decode(&raw) {
                    Ok(msg) => terminal.dispatch(msg),
                    Err(err) => debug!(error = %err, "undecodable inbound frame dropped"),
                }
            }
        });
    }

    fn dispatch(&self, msg: TerminalMessage) {
        if msg.target_terminal_id != self.inner.config.terminal_id {
            debug!(
                target = %msg.target_terminal_id,
                "mirrored frame for another terminal dropped"
            );
            return;
        }
        if msg.is_request() {
            self.inner.server.handle_request(msg);
            return;
        }
        if msg.done == Some(true) && self.inner.server.is_active(&msg.trace_id) {
            self.inner.server.handle_abort(&msg.trace_id);
            return;
        }
        self.inner.client.deliver(msg);
    }

    fn register_builtin_services(&self) -> Result<()> {
        self.provide(
            "Ping",
            "Ping",
            json!({}),
            ServiceOptions::default(),
            respond_with(|_msg| async { Ok(ResponsePayload::ok("Pong")) }),
        )?;

        self.provide(
            "Metrics",
            "Metrics",
            json!({}),
            ServiceOptions::default(),
            respond_with(|_msg| async {
                Ok(ResponsePayload::ok_with_data(
                    "OK",
                    json!({ "metrics": metrics::render() }),
                ))
            }),
        )?;

        if self.inner.config.allow_terminate {
            self.provide(
                "Terminate",
                "Terminate",
                json!({}),
                ServiceOptions::default(),
                respond_with(|msg| async move {
                    warn!(requested_by = %msg.source_terminal_id, "terminating on request");
                    // leave a second for the response to reach the caller
                    tokio::spawn(async {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        std::process::exit(0);
                    });
                    Ok(ResponsePayload::ok("OK"))
                }),
            )?;
        }

        if self.inner.config.private_key.is_some() {
            let keyring = Arc::clone(&self.inner.keyring);
            let method = security::handshake_method(&self.inner.config.terminal_id);
            self.provide(
                method.clone(),
                method,
                json!({"type": "object", "required": ["msg"]}),
                ServiceOptions::default(),
                respond_with(move |msg| {
                    let keyring = Arc::clone(&keyring);
                    async move {
                        let request = serde_json::from_value(msg.req.unwrap_or_default())?;
                        let response =
                            security::respond(&keyring, &msg.source_terminal_id, &request)?;
                        Ok(ResponsePayload::ok_with_data(
                            "OK",
                            serde_json::to_value(response)?,
                        ))
                    }
                }),
            )?;
        }

        if let Some(tunnel) = self.inner.tunnel.clone() {
            let method = signal_method();
            self.provide(
                method.clone(),
                method,
                json!({"type": "object", "required": ["offer_sdp"]}),
                ServiceOptions::default(),
                respond_with(move |msg| {
                    let tunnel = tunnel.clone();
                    async move {
                        let request: SignalRequest =
                            serde_json::from_value(msg.req.unwrap_or_default())?;
                        let response = tunnel.accept(&msg.source_terminal_id, request).await?;
                        Ok(ResponsePayload::ok_with_data(
                            "OK",
                            serde_json::to_value(response)?,
                        ))
                    }
                }),
            )?;
        }

        Ok(())
    }
}

async fn recv_opt(rx: &mut Option<mpsc::UnboundedReceiver<String>>) -> Option<String> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
