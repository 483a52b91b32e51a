//! Service hosting: admission control, the request lifecycle and handler
//! supervision.
//!
//! Each registered service owns a pending queue, a processing set and a pair
//! of token buckets. A request passes through the stages
//! initialized, routed, pending, processing, processed, finalizing; every
//! rejection and every completion emits exactly one terminal event back to
//! the caller.

pub mod flow;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::BoxStream;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::codes;
use crate::metrics;
use crate::model::{HostEvent, ResponsePayload, ServiceInfo, TerminalMessage};
use crate::schema::Predicate;
use flow::TokenBucket;

/// Raised toward a running handler when its request is cancelled, either by
/// the caller or by the processing deadline.
pub type AbortSignal = watch::Receiver<bool>;

/// Items a handler may emit before its stream ends.
#[derive(Debug, Clone)]
pub enum ServiceOutput {
    /// An intermediate stream frame.
    Frame(Value),
    /// The final response. Emitting this ends the trace; later items are
    /// discarded.
    Response(ResponsePayload),
    /// A topology event, delivered inside the trace. Only the host relay
    /// emits these.
    Event(HostEvent),
}

pub type HandlerStream = BoxStream<'static, anyhow::Result<ServiceOutput>>;

/// A service implementation. Invoked once per admitted request; the returned
/// stream is driven until it ends, responds, or is aborted.
pub type ServiceHandler =
    Arc<dyn Fn(TerminalMessage, AbortSignal) -> HandlerStream + Send + Sync>;

/// Per-service scheduling limits. `None` means unlimited.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Requests allowed in the processing set at once.
    pub concurrent: Option<usize>,
    /// Capacity of the pending queue; overflow is refused with 503.
    pub max_pending: Option<usize>,
    /// Admissions granted per refill interval; overflow is refused with 429.
    pub ingress_capacity: Option<u64>,
    /// Promotions from pending to processing granted per refill interval.
    pub egress_capacity: Option<u64>,
    pub refill_interval: Duration,
    /// Hard ceiling on handler runtime, answered with 504. `None` leaves the
    /// handler unbounded, which long-lived channel streams need.
    pub timeout: Option<Duration>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            concurrent: None,
            max_pending: None,
            ingress_capacity: None,
            egress_capacity: None,
            refill_interval: Duration::from_millis(1000),
            timeout: Some(Duration::from_secs(60)),
        }
    }
}

/// Wrap a plain request-to-response future as a [`ServiceHandler`].
pub fn respond_with<F, Fut>(f: F) -> ServiceHandler
where
    F: Fn(TerminalMessage) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<ResponsePayload>> + Send + 'static,
{
    Arc::new(move |msg, _abort| {
        let fut = f(msg);
        futures::stream::once(async move { fut.await.map(ServiceOutput::Response) }).boxed()
    })
}

struct ServiceEntry {
    info: ServiceInfo,
    predicate: Predicate,
    options: ServiceOptions,
    handler: ServiceHandler,
    pending: VecDeque<TerminalMessage>,
    processing: usize,
    ingress: TokenBucket,
    egress: TokenBucket,
}

struct ActiveTrace {
    service_id: String,
    source_terminal_id: String,
    seq: Arc<AtomicU64>,
    abort: watch::Sender<bool>,
    /// Set once the terminal event for this trace has gone out. Guards the
    /// one-terminal-event invariant across supervisor and drive task.
    terminal_sent: Arc<AtomicBool>,
    started_at: Instant,
}

struct ServerState {
    services: HashMap<String, ServiceEntry>,
    traces: HashMap<String, ActiveTrace>,
}

/// The serving half of a terminal.
#[derive(Clone)]
pub struct TerminalServer {
    terminal_id: String,
    outbound: mpsc::UnboundedSender<TerminalMessage>,
    state: Arc<Mutex<ServerState>>,
}

impl TerminalServer {
    pub fn new(terminal_id: String, outbound: mpsc::UnboundedSender<TerminalMessage>) -> Self {
        Self {
            terminal_id,
            outbound,
            state: Arc::new(Mutex::new(ServerState {
                services: HashMap::new(),
                traces: HashMap::new(),
            })),
        }
    }

    /// Spawn the background tasks that keep the scheduler moving: the pump
    /// tick that re-checks egress buckets, and the 5s keepalive for traces
    /// still in flight.
    pub fn spawn_background(&self) {
        let server = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(100));
            loop {
                tick.tick().await;
                server.pump_all();
            }
        });
        let server = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(5));
            loop {
                tick.tick().await;
                server.send_keepalives();
            }
        });
    }

    /// Register a service. Replaces any previous registration under the same
    /// `service_id`.
    pub fn provide(
        &self,
        info: ServiceInfo,
        options: ServiceOptions,
        handler: ServiceHandler,
    ) -> Result<(), crate::error::ProtocolError> {
        let predicate = Predicate::compile(&info.schema)?;
        let refill = options.refill_interval;
        let entry = ServiceEntry {
            predicate,
            ingress: TokenBucket::new(options.ingress_capacity, refill),
            egress: TokenBucket::new(options.egress_capacity, refill),
            pending: VecDeque::new(),
            processing: 0,
            options,
            handler,
            info: info.clone(),
        };
        self.state.lock().services.insert(info.service_id, entry);
        Ok(())
    }

    /// Remove a service. Queued requests are refused, in-flight ones get their
    /// abort raised; every caller still receives one terminal event.
    pub fn dispose(&self, service_id: &str) {
        let (pending, farewells) = {
            let mut state = self.state.lock();
            let Some(entry) = state.services.remove(service_id) else {
                return;
            };
            for msg in &entry.pending {
                metrics::REQUESTS_IN_STAGE
                    .with_label_values(&[service_id, "pending"])
                    .dec();
                state.traces.remove(&msg.trace_id);
            }
            let mut farewells = Vec::new();
            for (trace_id, trace) in state.traces.iter() {
                if trace.service_id != service_id {
                    continue;
                }
                let _ = trace.abort.send(true);
                if !trace.terminal_sent.swap(true, Ordering::SeqCst) {
                    farewells.push(TerminalMessage {
                        trace_id: trace_id.clone(),
                        source_terminal_id: self.terminal_id.clone(),
                        target_terminal_id: trace.source_terminal_id.clone(),
                        seq_id: trace.seq.fetch_add(1, Ordering::SeqCst),
                        res: Some(ResponsePayload::error(
                            codes::SERVICE_UNAVAILABLE,
                            "Service Unavailable",
                        )),
                        done: Some(true),
                        ..Default::default()
                    });
                }
            }
            (entry.pending, farewells)
        };
        for msg in pending {
            self.reject(&msg, codes::SERVICE_UNAVAILABLE, "Service Unavailable");
        }
        for farewell in farewells {
            let _ = self.outbound.send(farewell);
        }
    }

    /// Remove every service, for terminal disposal.
    pub fn dispose_all(&self) {
        let service_ids: Vec<String> = self.state.lock().services.keys().cloned().collect();
        for service_id in service_ids {
            self.dispose(&service_id);
        }
    }

    /// Services currently registered, for the advertised `TerminalInfo`.
    pub fn service_infos(&self) -> Vec<ServiceInfo> {
        self.state
            .lock()
            .services
            .values()
            .map(|e| e.info.clone())
            .collect()
    }

    /// Admit one inbound request: route by method and schema, then apply
    /// queue capacity and the ingress bucket.
    pub fn handle_request(&self, msg: TerminalMessage) {
        let method = match msg.method.as_deref() {
            Some(m) => m,
            None => return,
        };
        let req = msg.req.clone().unwrap_or(Value::Null);

        let service_id = {
            let mut state = self.state.lock();
            let mut candidates = state
                .services
                .iter()
                .filter(|(_, e)| e.info.method == method)
                .peekable();
            if candidates.peek().is_none() {
                drop(candidates);
                drop(state);
                metrics::REQUESTS_REJECTED
                    .with_label_values(&[method, "400"])
                    .inc();
                self.reject(&msg, codes::BAD_REQUEST, "Bad Request: Method Not Found");
                return;
            }
            let matched: Vec<String> = candidates
                .filter(|(_, e)| e.predicate.matches(&req))
                .map(|(id, _)| id.clone())
                .collect();
            let service_id = match matched.as_slice() {
                [] => {
                    drop(state);
                    metrics::REQUESTS_REJECTED
                        .with_label_values(&[method, "400"])
                        .inc();
                    self.reject(&msg, codes::BAD_REQUEST, "Bad Request: No Matching Service");
                    return;
                }
                [one] => one.clone(),
                _ => {
                    drop(state);
                    metrics::REQUESTS_REJECTED
                        .with_label_values(&[method, "400"])
                        .inc();
                    self.reject(&msg, codes::BAD_REQUEST, "Bad Request: Ambiguous Service");
                    return;
                }
            };

            let entry = state
                .services
                .get_mut(&service_id)
                .expect("matched service exists");
            if let Some(max) = entry.options.max_pending {
                if entry.pending.len() >= max {
                    drop(state);
                    metrics::REQUESTS_REJECTED
                        .with_label_values(&[method, "503"])
                        .inc();
                    self.reject(&msg, codes::SERVICE_UNAVAILABLE, "Service Unavailable");
                    return;
                }
            }
            if !entry.ingress.try_take() {
                drop(state);
                metrics::REQUESTS_REJECTED
                    .with_label_values(&[method, "429"])
                    .inc();
                self.reject(&msg, codes::TOO_MANY_REQUESTS, "Too Many Requests");
                return;
            }

            debug!(trace_id = %msg.trace_id, method, service_id = %service_id, "request admitted");
            let (abort_tx, _) = watch::channel(false);
            state.traces.insert(
                msg.trace_id.clone(),
                ActiveTrace {
                    service_id: service_id.clone(),
                    source_terminal_id: msg.source_terminal_id.clone(),
                    seq: Arc::new(AtomicU64::new(0)),
                    abort: abort_tx,
                    terminal_sent: Arc::new(AtomicBool::new(false)),
                    started_at: Instant::now(),
                },
            );
            // re-fetch: the lock never dropped, so the entry is still there
            state
                .services
                .get_mut(&service_id)
                .expect("matched service exists")
                .pending
                .push_back(msg);
            metrics::REQUESTS_IN_STAGE
                .with_label_values(&[&service_id, "pending"])
                .inc();
            service_id
        };
        self.pump(&service_id);
    }

    /// Cancel an in-flight trace on behalf of its caller. Pending requests
    /// are dropped from the queue; processing ones get the abort raised. No
    /// terminal event is sent back since the caller already ended the trace.
    pub fn handle_abort(&self, trace_id: &str) {
        let mut state = self.state.lock();
        let Some(trace) = state.traces.get(trace_id) else {
            return;
        };
        trace.terminal_sent.store(true, Ordering::SeqCst);
        let _ = trace.abort.send(true);
        let service_id = trace.service_id.clone();
        if let Some(entry) = state.services.get_mut(&service_id) {
            let before = entry.pending.len();
            entry.pending.retain(|m| m.trace_id != trace_id);
            if entry.pending.len() < before {
                // never reached processing; forget the trace entirely
                state.traces.remove(trace_id);
                metrics::REQUESTS_IN_STAGE
                    .with_label_values(&[&service_id, "pending"])
                    .dec();
            }
        }
    }

    /// Whether a trace is currently known to this server.
    pub fn is_active(&self, trace_id: &str) -> bool {
        self.state.lock().traces.contains_key(trace_id)
    }

    fn pump_all(&self) {
        let ids: Vec<String> = self.state.lock().services.keys().cloned().collect();
        for id in ids {
            self.pump(&id);
        }
    }

    /// Promote pending requests while the concurrency slot and an egress
    /// token are both available.
    fn pump(&self, service_id: &str) {
        loop {
            let job = {
                let mut state = self.state.lock();
                let Some(entry) = state.services.get_mut(service_id) else {
                    return;
                };
                if entry.pending.is_empty() {
                    return;
                }
                if let Some(limit) = entry.options.concurrent {
                    if entry.processing >= limit {
                        return;
                    }
                }
                if !entry.egress.try_take() {
                    return;
                }
                let msg = entry.pending.pop_front().expect("non-empty queue");
                entry.processing += 1;
                metrics::REQUESTS_IN_STAGE
                    .with_label_values(&[service_id, "pending"])
                    .dec();
                metrics::REQUESTS_IN_STAGE
                    .with_label_values(&[service_id, "processing"])
                    .inc();
                let handler = Arc::clone(&entry.handler);
                let timeout = entry.options.timeout;
                let Some(trace) = state.traces.get(&msg.trace_id) else {
                    // aborted while queued
                    if let Some(entry) = state.services.get_mut(service_id) {
                        entry.processing -= 1;
                    }
                    metrics::REQUESTS_IN_STAGE
                        .with_label_values(&[service_id, "processing"])
                        .dec();
                    continue;
                };
                let abort_rx = trace.abort.subscribe();
                (msg, handler, timeout, abort_rx)
            };
            let (msg, handler, timeout, abort_rx) = job;
            let server = self.clone();
            let service_id = service_id.to_string();
            tokio::spawn(async move {
                server.run_request(service_id, msg, handler, timeout, abort_rx).await;
            });
        }
    }

    async fn run_request(
        &self,
        service_id: String,
        msg: TerminalMessage,
        handler: ServiceHandler,
        timeout: Option<Duration>,
        mut abort_rx: AbortSignal,
    ) {
        let trace_id = msg.trace_id.clone();
        let method = msg.method.clone().unwrap_or_default();
        let (seq, terminal_sent, started_at) = {
            let state = self.state.lock();
            match state.traces.get(&trace_id) {
                Some(t) => (
                    Arc::clone(&t.seq),
                    Arc::clone(&t.terminal_sent),
                    t.started_at,
                ),
                None => return,
            }
        };

        let stream = (handler)(msg.clone(), abort_rx.clone());
        let mut drive = tokio::spawn(drive_stream(
            stream,
            self.clone(),
            msg.clone(),
            Arc::clone(&seq),
            Arc::clone(&terminal_sent),
        ));

        let code = tokio::select! {
            joined = &mut drive => match joined {
                Ok(code) => code,
                Err(err) if err.is_panic() => {
                    warn!(trace_id = %trace_id, method = %method, "handler panicked");
                    self.send_terminal(&msg, &seq, &terminal_sent,
                        ResponsePayload::error(codes::INTERNAL_ERROR, "Internal Error"));
                    codes::INTERNAL_ERROR
                }
                Err(_) => codes::INTERNAL_ERROR,
            },
            _ = deadline(timeout) => {
                warn!(trace_id = %trace_id, method = %method, "handler deadline exceeded");
                self.send_terminal(&msg, &seq, &terminal_sent,
                    ResponsePayload::error(codes::GATEWAY_TIMEOUT, "Gateway Timeout"));
                if let Some(trace) = self.state.lock().traces.get(&trace_id) {
                    let _ = trace.abort.send(true);
                }
                drive.abort();
                codes::GATEWAY_TIMEOUT
            }
            _ = abort_changed(&mut abort_rx) => {
                drive.abort();
                codes::OK
            }
        };

        metrics::REQUEST_DURATION_MS
            .with_label_values(&[&method, &code.to_string()])
            .observe(started_at.elapsed().as_millis() as f64);

        // finalizing: release the slot, forget the trace, promote the next
        {
            let mut state = self.state.lock();
            state.traces.remove(&trace_id);
            if let Some(entry) = state.services.get_mut(&service_id) {
                entry.processing = entry.processing.saturating_sub(1);
            }
        }
        metrics::REQUESTS_IN_STAGE
            .with_label_values(&[&service_id, "processing"])
            .dec();
        self.pump(&service_id);
    }

    fn reject(&self, msg: &TerminalMessage, code: i64, message: &str) {
        let reply = TerminalMessage {
            trace_id: msg.trace_id.clone(),
            source_terminal_id: self.terminal_id.clone(),
            target_terminal_id: msg.source_terminal_id.clone(),
            res: Some(ResponsePayload::error(code, message)),
            done: Some(true),
            ..Default::default()
        };
        let _ = self.outbound.send(reply);
    }

    fn send_terminal(
        &self,
        origin: &TerminalMessage,
        seq: &AtomicU64,
        terminal_sent: &AtomicBool,
        res: ResponsePayload,
    ) {
        if terminal_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        let reply = TerminalMessage {
            trace_id: origin.trace_id.clone(),
            source_terminal_id: self.terminal_id.clone(),
            target_terminal_id: origin.source_terminal_id.clone(),
            seq_id: seq.fetch_add(1, Ordering::SeqCst),
            res: Some(res),
            done: Some(true),
            ..Default::default()
        };
        let _ = self.outbound.send(reply);
    }

    /// Callers time out a trace that goes quiet; any message on the trace
    /// counts as activity, so flight traces get an empty marker every 5s.
    fn send_keepalives(&self) {
        let beats: Vec<TerminalMessage> = {
            let state = self.state.lock();
            state
                .traces
                .iter()
                .filter(|(_, t)| !t.terminal_sent.load(Ordering::SeqCst))
                .map(|(trace_id, t)| TerminalMessage {
                    trace_id: trace_id.clone(),
                    source_terminal_id: self.terminal_id.clone(),
                    target_terminal_id: t.source_terminal_id.clone(),
                    seq_id: t.seq.fetch_add(1, Ordering::SeqCst),
                    ..Default::default()
                })
                .collect()
        };
        for beat in beats {
            let _ = self.outbound.send(beat);
        }
    }
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(t) => tokio::time::sleep(t).await,
        None => std::future::pending().await,
    }
}

async fn abort_changed(abort_rx: &mut AbortSignal) {
    loop {
        if *abort_rx.borrow() {
            return;
        }
        if abort_rx.changed().await.is_err() {
            // abort sender lives as long as the trace entry
            std::future::pending::<()>().await;
        }
    }
}

/// Drive a handler stream to completion, forwarding its items into the trace.
/// Returns the response code of the terminal event this task produced.
async fn drive_stream(
    mut stream: HandlerStream,
    server: TerminalServer,
    origin: TerminalMessage,
    seq: Arc<AtomicU64>,
    terminal_sent: Arc<AtomicBool>,
) -> i64 {
    while let Some(item) = stream.next().await {
        if terminal_sent.load(Ordering::SeqCst) {
            return codes::OK;
        }
        match item {
            Ok(ServiceOutput::Frame(frame)) => {
                let msg = TerminalMessage {
                    trace_id: origin.trace_id.clone(),
                    source_terminal_id: server.terminal_id.clone(),
                    target_terminal_id: origin.source_terminal_id.clone(),
                    seq_id: seq.fetch_add(1, Ordering::SeqCst),
                    frame: Some(frame),
                    ..Default::default()
                };
                let _ = server.outbound.send(msg);
            }
            Ok(ServiceOutput::Event(event)) => {
                let msg = TerminalMessage {
                    trace_id: origin.trace_id.clone(),
                    source_terminal_id: server.terminal_id.clone(),
                    target_terminal_id: origin.source_terminal_id.clone(),
                    seq_id: seq.fetch_add(1, Ordering::SeqCst),
                    event: Some(event),
                    ..Default::default()
                };
                let _ = server.outbound.send(msg);
            }
            Ok(ServiceOutput::Response(res)) => {
                let code = res.code;
                server.send_terminal(&origin, &seq, &terminal_sent, res);
                return code;
            }
            Err(err) => {
                warn!(trace_id = %origin.trace_id, error = %err, "handler failed");
                server.send_terminal(
                    &origin,
                    &seq,
                    &terminal_sent,
                    ResponsePayload::error(codes::INTERNAL_ERROR, err.to_string()),
                );
                return codes::INTERNAL_ERROR;
            }
        }
    }
    // stream ended without an explicit response
    server.send_terminal(&origin, &seq, &terminal_sent, ResponsePayload::ok("OK"));
    codes::OK
}
