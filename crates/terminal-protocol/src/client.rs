//! The calling half of a terminal: service resolution against the topology
//! snapshot, per-trace inbound streams, and the sliding inactivity timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{ProtocolError, Result};
use crate::model::{ResponsePayload, TerminalInfo, TerminalMessage};
use crate::schema::Predicate;

/// Inactivity window after which a caller gives up on a trace. Any message on
/// the trace, keepalives included, restarts the window.
const CALL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

struct Candidate {
    terminal_id: String,
    service_id: String,
    predicate: Predicate,
}

/// Method-keyed index over every advertised service, rebuilt wholesale on
/// each topology change. Compiled predicates are reused across rebuilds when
/// the schema is unchanged.
#[derive(Default)]
struct CandidateIndex {
    by_method: HashMap<String, Vec<Candidate>>,
    compiled: HashMap<(String, String), (Value, Predicate)>,
}

impl CandidateIndex {
    fn rebuild(&mut self, terminals: &[TerminalInfo]) {
        let mut by_method: HashMap<String, Vec<Candidate>> = HashMap::new();
        let mut compiled: HashMap<(String, String), (Value, Predicate)> = HashMap::new();
        for terminal in terminals {
            for service in terminal.service_info.values() {
                let key = (terminal.terminal_id.clone(), service.service_id.clone());
                let predicate = match self.compiled.get(&key) {
                    Some((schema, predicate)) if *schema == service.schema => predicate.clone(),
                    _ => match Predicate::compile(&service.schema) {
                        Ok(p) => p,
                        // an unusable schema just makes the service unreachable
                        Err(_) => continue,
                    },
                };
                compiled.insert(key, (service.schema.clone(), predicate.clone()));
                by_method
                    .entry(service.method.clone())
                    .or_default()
                    .push(Candidate {
                        terminal_id: terminal.terminal_id.clone(),
                        service_id: service.service_id.clone(),
                        predicate,
                    });
            }
        }
        self.by_method = by_method;
        self.compiled = compiled;
    }

    fn matching(&self, method: &str, req: &Value) -> Vec<&Candidate> {
        self.by_method
            .get(method)
            .map(|list| list.iter().filter(|c| c.predicate.matches(req)).collect())
            .unwrap_or_default()
    }
}

struct ClientState {
    index: CandidateIndex,
    traces: HashMap<String, mpsc::UnboundedSender<TerminalMessage>>,
}

/// Issues requests and owns the inbound side of every trace this terminal
/// started.
#[derive(Clone)]
pub struct TerminalClient {
    terminal_id: String,
    outbound: mpsc::UnboundedSender<TerminalMessage>,
    state: Arc<Mutex<ClientState>>,
    disposed: Arc<AtomicBool>,
}

impl TerminalClient {
    pub fn new(terminal_id: String, outbound: mpsc::UnboundedSender<TerminalMessage>) -> Self {
        Self {
            terminal_id,
            outbound,
            state: Arc::new(Mutex::new(ClientState {
                index: CandidateIndex::default(),
                traces: HashMap::new(),
            })),
            disposed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Fail every open trace. Their streams end with [`ProtocolError::ConnectionLost`]
    /// (or `Disposed` after [`Self::dispose`]) instead of idling out.
    pub fn abort_open_traces(&self) {
        let dropped = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.traces)
        };
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "open traces aborted");
        }
    }

    /// Permanently stop issuing requests; open traces fail with `Disposed`.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.abort_open_traces();
    }

    /// Swap in a new topology snapshot.
    pub fn update_topology(&self, terminals: &[TerminalInfo]) {
        self.state.lock().index.rebuild(terminals);
    }

    /// Terminal ids able to serve `method` with this request body.
    pub fn resolve_targets(&self, method: &str, req: &Value) -> Vec<String> {
        let state = self.state.lock();
        let mut ids: Vec<String> = state
            .index
            .matching(method, req)
            .into_iter()
            .map(|c| c.terminal_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Start a request toward a uniformly random capable target.
    pub fn request(&self, method: &str, req: Value) -> Result<CallStream> {
        let target = {
            let state = self.state.lock();
            let candidates = state.index.matching(method, &req);
            candidates
                .choose(&mut rand::thread_rng())
                .map(|c| {
                    debug!(method, target = %c.terminal_id, service_id = %c.service_id, "resolved");
                    c.terminal_id.clone()
                })
                .ok_or_else(|| ProtocolError::NoServiceAvailable(method.to_string()))?
        };
        Ok(self.request_to(&target, method, req))
    }

    /// Start a request toward an explicit target terminal, bypassing
    /// resolution.
    pub fn request_to(&self, target: &str, method: &str, req: Value) -> CallStream {
        let trace_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        // on a disposed client the sender drops here and the stream fails
        // on its first poll
        if !self.disposed.load(Ordering::SeqCst) {
            self.state.lock().traces.insert(trace_id.clone(), tx);
        }
        let msg = TerminalMessage {
            trace_id: trace_id.clone(),
            method: Some(method.to_string()),
            source_terminal_id: self.terminal_id.clone(),
            target_terminal_id: target.to_string(),
            req: Some(req),
            ..Default::default()
        };
        let _ = self.outbound.send(msg);
        CallStream {
            client: self.clone(),
            trace_id,
            target: target.to_string(),
            rx,
            last_seq: 0,
            finished: false,
        }
    }

    /// Issue a request and wait for its final response payload.
    pub async fn request_for_response(&self, method: &str, req: Value) -> Result<ResponsePayload> {
        self.request(method, req)?.response().await
    }

    /// Hand an inbound non-request message to the trace that owns it.
    pub fn deliver(&self, msg: TerminalMessage) {
        let sender = self.state.lock().traces.get(&msg.trace_id).cloned();
        if let Some(sender) = sender {
            let _ = sender.send(msg);
        }
    }

    fn finish(&self, trace_id: &str) {
        self.state.lock().traces.remove(trace_id);
    }
}

/// The inbound side of one trace. Yields frames and ends with the terminal
/// event; dropping it early cancels the request at the server.
pub struct CallStream {
    client: TerminalClient,
    trace_id: String,
    target: String,
    rx: mpsc::UnboundedReceiver<TerminalMessage>,
    last_seq: u64,
    finished: bool,
}

impl CallStream {
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Next substantive message on the trace. Keepalive markers restart the
    /// idle timer without being surfaced. Returns `None` after the terminal
    /// event, `RequestTimeout` after 60s of silence.
    pub async fn next(&mut self) -> Option<Result<TerminalMessage>> {
        if self.finished {
            return None;
        }
        loop {
            let received = tokio::select! {
                received = self.rx.recv() => received,
                _ = tokio::time::sleep(CALL_IDLE_TIMEOUT) => {
                    self.cancel();
                    return Some(Err(ProtocolError::RequestTimeout(self.trace_id.clone())));
                }
            };
            let Some(msg) = received else {
                self.finished = true;
                self.client.finish(&self.trace_id);
                let err = if self.client.disposed.load(Ordering::SeqCst) {
                    ProtocolError::Disposed
                } else {
                    ProtocolError::ConnectionLost
                };
                return Some(Err(err));
            };
            self.last_seq = msg.seq_id;
            if msg.is_terminal() {
                self.finished = true;
                self.client.finish(&self.trace_id);
                return Some(Ok(msg));
            }
            if msg.frame.is_some() || msg.event.is_some() {
                return Some(Ok(msg));
            }
            // keepalive: restart the timer and keep waiting
        }
    }

    /// Drain the stream and return the final response payload. Frames are
    /// discarded; a trace that ends without `res` is an error.
    pub async fn response(mut self) -> Result<ResponsePayload> {
        while let Some(item) = self.next().await {
            let msg = item?;
            if let Some(res) = msg.res {
                return Ok(res);
            }
            if msg.is_terminal() {
                break;
            }
        }
        Err(ProtocolError::MissingResponse)
    }

    fn cancel(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.client.finish(&self.trace_id);
        // seq_id acknowledges the last message we actually observed, so the
        // server can tell a cancel from a caller that simply fell behind.
        let bye = TerminalMessage {
            trace_id: self.trace_id.clone(),
            source_terminal_id: self.client.terminal_id.clone(),
            target_terminal_id: self.target.clone(),
            seq_id: self.last_seq,
            done: Some(true),
            ..Default::default()
        };
        let _ = self.client.outbound.send(bye);
    }
}

impl Drop for CallStream {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ServiceInfo;
    use serde_json::json;

    fn terminal_with(terminal_id: &str, method: &str, schema: Value) -> TerminalInfo {
        let mut info = TerminalInfo {
            terminal_id: terminal_id.into(),
            ..Default::default()
        };
        info.service_info.insert(
            method.to_string(),
            ServiceInfo {
                service_id: method.to_string(),
                method: method.to_string(),
                schema,
            },
        );
        info
    }

    #[tokio::test]
    async fn resolution_filters_by_method_and_schema() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = TerminalClient::new("me".into(), tx);
        client.update_topology(&[
            terminal_with(
                "okx",
                "SubmitOrder",
                json!({"properties": {"exchange": {"const": "OKX"}}, "required": ["exchange"]}),
            ),
            terminal_with(
                "binance",
                "SubmitOrder",
                json!({"properties": {"exchange": {"const": "Binance"}}, "required": ["exchange"]}),
            ),
            terminal_with("pricer", "QueryPrice", json!({})),
        ]);

        assert_eq!(
            client.resolve_targets("SubmitOrder", &json!({"exchange": "OKX"})),
            vec!["okx".to_string()]
        );
        assert!(client
            .resolve_targets("SubmitOrder", &json!({"side": "buy"}))
            .is_empty());
        assert!(client.resolve_targets("Missing", &json!({})).is_empty());
    }

    #[tokio::test]
    async fn request_without_candidates_fails_fast() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = TerminalClient::new("me".into(), tx);
        assert!(matches!(
            client.request("Nowhere", json!({})),
            Err(ProtocolError::NoServiceAvailable(_))
        ));
    }

    #[tokio::test]
    async fn dropping_a_stream_sends_done() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = TerminalClient::new("me".into(), tx);
        let stream = client.request_to("peer", "Stream", json!({}));
        let trace_id = stream.trace_id().to_string();
        drop(stream);

        let first = rx.recv().await.unwrap();
        assert!(first.is_request());
        let second = rx.recv().await.unwrap();
        assert_eq!(second.trace_id, trace_id);
        assert_eq!(second.done, Some(true));
        assert!(!client.state.lock().traces.contains_key(&trace_id));
    }
}
