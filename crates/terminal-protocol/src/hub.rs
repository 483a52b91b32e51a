//! The host relay hub.
//!
//! The hub owns every attached link, the terminal directory, and the
//! monotonic event sequence. It forwards frames by their routing header
//! alone. The host's own service surface (`GetTerminalInfos`,
//! `UpdateTerminalInfo`, the event channel) is served by a regular terminal
//! attached under the `@host` id, so every terminal including the host's own
//! goes through the same code paths.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::frame;
use crate::model::{
    now_ms, HostEvent, HostEventKind, TerminalChange, TerminalInfo, HOST_TERMINAL_ID,
};
use crate::transport::WireDuplex;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);
const SWEEP_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const SWEEP_MAX_FAILURES: u32 = 3;

struct Link {
    to_terminal: mpsc::UnboundedSender<String>,
    /// Distinguishes a link from its replacement after a supersede.
    epoch: u64,
}

struct HubState {
    links: BTreeMap<String, Link>,
    directory: BTreeMap<String, TerminalInfo>,
}

struct HubInner {
    state: Mutex<HubState>,
    seq: AtomicU64,
    epoch: AtomicU64,
    events: broadcast::Sender<HostEvent>,
}

/// One host instance. Clones share state.
#[derive(Clone)]
pub struct HostHub {
    inner: Arc<HubInner>,
}

impl Default for HostHub {
    fn default() -> Self {
        Self::new()
    }
}

impl HostHub {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(HubInner {
                state: Mutex::new(HubState {
                    links: BTreeMap::new(),
                    directory: BTreeMap::new(),
                }),
                seq: AtomicU64::new(0),
                epoch: AtomicU64::new(0),
                events,
            }),
        }
    }

    /// Attach a terminal. A second attach under the same id supersedes the
    /// first; the old link goes dead and its owner reconnects into a fresh
    /// one.
    pub fn attach(&self, terminal_id: &str) -> Result<WireDuplex> {
        let (to_terminal_tx, to_terminal_rx) = mpsc::unbounded_channel();
        let (from_terminal_tx, from_terminal_rx) = mpsc::unbounded_channel();
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst);

        let joined = {
            let mut state = self.inner.state.lock();
            if state
                .links
                .insert(
                    terminal_id.to_string(),
                    Link {
                        to_terminal: to_terminal_tx,
                        epoch,
                    },
                )
                .is_some()
            {
                info!(terminal_id, "link superseded by a new attach");
            }
            if state.directory.contains_key(terminal_id) {
                None
            } else {
                let info = TerminalInfo {
                    terminal_id: terminal_id.to_string(),
                    created_at: now_ms(),
                    updated_at: now_ms(),
                    ..Default::default()
                };
                state.directory.insert(terminal_id.to_string(), info.clone());
                Some(info)
            }
        };
        if let Some(info) = joined {
            self.emit(TerminalChange {
                old: None,
                new: Some(info),
            });
        }

        let hub = self.clone();
        let terminal_id = terminal_id.to_string();
        tokio::spawn(async move {
            hub.route_loop(&terminal_id, epoch, from_terminal_rx).await;
        });

        Ok(WireDuplex {
            tx: from_terminal_tx,
            rx: to_terminal_rx,
        })
    }

    async fn route_loop(
        &self,
        terminal_id: &str,
        epoch: u64,
        mut from_terminal: mpsc::UnboundedReceiver<String>,
    ) {
        while let Some(raw) = from_terminal.recv().await {
            match frame::peek_target(&raw) {
                Ok(target) => self.forward(&target, raw),
                Err(err) => debug!(terminal_id, error = %err, "unroutable frame dropped"),
            }
        }
        self.detach(terminal_id, epoch);
    }

    fn forward(&self, target: &str, raw: String) {
        let state = self.inner.state.lock();
        match state.links.get(target) {
            Some(link) => {
                let _ = link.to_terminal.send(raw);
            }
            None => debug!(target, "frame for unknown terminal dropped"),
        }
    }

    /// Remove a link, but only if it still is the one that asked. A
    /// superseded link must not tear down its replacement.
    fn detach(&self, terminal_id: &str, epoch: u64) {
        let left = {
            let mut state = self.inner.state.lock();
            match state.links.get(terminal_id) {
                Some(link) if link.epoch == epoch => {
                    state.links.remove(terminal_id);
                    state.directory.remove(terminal_id)
                }
                _ => return,
            }
        };
        info!(terminal_id, "terminal detached");
        if let Some(old) = left {
            self.emit(TerminalChange {
                old: Some(old),
                new: None,
            });
        }
    }

    /// Force-disconnect a terminal that stopped answering probes.
    pub fn kick(&self, terminal_id: &str) {
        let epoch = {
            let state = self.inner.state.lock();
            match state.links.get(terminal_id) {
                Some(link) => link.epoch,
                None => return,
            }
        };
        warn!(terminal_id, "kicking unresponsive terminal");
        self.detach(terminal_id, epoch);
    }

    /// Replace a directory entry with the info its terminal pushed.
    pub fn update_info(&self, mut info: TerminalInfo) {
        info.updated_at = now_ms();
        let old = {
            let mut state = self.inner.state.lock();
            // only attached terminals may appear in the directory
            if !state.links.contains_key(&info.terminal_id) {
                return;
            }
            state
                .directory
                .insert(info.terminal_id.clone(), info.clone())
        };
        self.emit(TerminalChange {
            old,
            new: Some(info),
        });
    }

    pub fn directory(&self) -> Vec<TerminalInfo> {
        self.inner.state.lock().directory.values().cloned().collect()
    }

    pub fn terminal_ids(&self) -> Vec<String> {
        self.inner.state.lock().directory.keys().cloned().collect()
    }

    pub fn current_seq(&self) -> u64 {
        self.inner.seq.load(Ordering::SeqCst)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<HostEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, change: TerminalChange) {
        let seq_id = self.inner.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.inner.events.send(HostEvent {
            seq_id,
            kind: HostEventKind::TerminalChange,
            payload: Some(change),
        });
    }
}

/// Build the handler stream for the host event channel: one baseline marker
/// carrying the current sequence, then every change as it happens. Consumers
/// detect lag as a sequence gap and pull a fresh snapshot.
pub fn host_event_stream(hub: &HostHub) -> crate::server::HandlerStream {
    let rx = hub.subscribe_events();
    let baseline = hub.current_seq();
    futures::stream::unfold((rx, Some(baseline)), |(mut rx, baseline)| async move {
        if let Some(seq_id) = baseline {
            let init = HostEvent {
                seq_id,
                kind: HostEventKind::Init,
                payload: None,
            };
            return Some((Ok(crate::server::ServiceOutput::Event(init)), (rx, None)));
        }
        loop {
            match rx.recv().await {
                Ok(event) => {
                    return Some((Ok(crate::server::ServiceOutput::Event(event)), (rx, None)))
                }
                // dropped events surface as a gap on the consumer side
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

/// Attach the host's own terminal under `@host` and register the directory
/// services on it. Every host instance calls this once; terminals treat the
/// `@host` entry appearing in `GetTerminalInfos` as proof the relay is ready.
pub async fn serve_host(hub: &HostHub) -> Result<crate::terminal::Terminal> {
    use crate::config::TerminalConfig;
    use crate::model::ResponsePayload;
    use crate::server::{respond_with, ServiceOptions};
    use crate::topology::{
        host_event_channel, DirectorySnapshot, METHOD_GET_TERMINAL_INFOS,
        METHOD_UPDATE_TERMINAL_INFO,
    };
    use crate::transport::MemoryDialer;

    let mut config = TerminalConfig::new("memory://host");
    config.terminal_id = HOST_TERMINAL_ID.to_string();
    config.name = "host".to_string();
    let dialer = Arc::new(MemoryDialer::new(hub.clone(), HOST_TERMINAL_ID));
    let terminal = crate::terminal::Terminal::with_dialer(config, dialer).await?;

    {
        let hub = hub.clone();
        terminal.provide(
            METHOD_GET_TERMINAL_INFOS,
            METHOD_GET_TERMINAL_INFOS,
            serde_json::json!({}),
            ServiceOptions::default(),
            respond_with(move |_msg| {
                let hub = hub.clone();
                async move {
                    // seq first: a change landing between the two reads then
                    // shows up both in the snapshot and as a later event,
                    // which re-applies harmlessly. The other order loses it.
                    let seq_id = hub.current_seq();
                    let snapshot = DirectorySnapshot {
                        terminals: hub.directory(),
                        seq_id,
                    };
                    Ok(ResponsePayload::ok_with_data(
                        "OK",
                        serde_json::to_value(snapshot)?,
                    ))
                }
            }),
        )?;
    }

    {
        let hub = hub.clone();
        terminal.provide(
            METHOD_UPDATE_TERMINAL_INFO,
            METHOD_UPDATE_TERMINAL_INFO,
            serde_json::json!({"type": "object", "required": ["terminal_id"]}),
            ServiceOptions::default(),
            respond_with(move |msg| {
                let hub = hub.clone();
                async move {
                    let info: TerminalInfo =
                        serde_json::from_value(msg.req.unwrap_or_default())?;
                    // a terminal may only describe itself
                    if info.terminal_id != msg.source_terminal_id {
                        return Ok(ResponsePayload::error(
                            crate::error::codes::BAD_REQUEST,
                            "Bad Request: terminal_id mismatch",
                        ));
                    }
                    hub.update_info(info);
                    Ok(ResponsePayload::ok("OK"))
                }
            }),
        )?;
    }

    {
        let hub = hub.clone();
        terminal.provide(
            host_event_channel(),
            host_event_channel(),
            serde_json::json!({}),
            ServiceOptions {
                // subscriptions live until the subscriber hangs up
                timeout: None,
                ..ServiceOptions::default()
            },
            Arc::new(move |_msg, _abort| host_event_stream(&hub)),
        )?;
    }

    tokio::spawn(sweep_loop(hub.clone(), terminal.client().clone()));
    Ok(terminal)
}

/// Liveness sweep: probe every directory entry with `Ping`; three missed
/// probes in a row eliminate the phantom.
pub async fn sweep_loop(hub: HostHub, client: crate::client::TerminalClient) {
    let mut failures: BTreeMap<String, u32> = BTreeMap::new();
    let mut tick = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tick.tick().await;
        let targets: Vec<String> = hub
            .terminal_ids()
            .into_iter()
            .filter(|id| id != HOST_TERMINAL_ID)
            .collect();
        failures.retain(|id, _| targets.contains(id));
        for target in targets {
            let probe = client.request_to(&target, "Ping", serde_json::json!({}));
            let alive = matches!(
                tokio::time::timeout(SWEEP_PROBE_TIMEOUT, probe.response()).await,
                Ok(Ok(res)) if res.code == crate::error::codes::OK
            );
            if alive {
                failures.remove(&target);
                continue;
            }
            let count = failures.entry(target.clone()).or_insert(0);
            *count += 1;
            debug!(terminal_id = %target, failures = *count, "liveness probe missed");
            if *count >= SWEEP_MAX_FAILURES {
                failures.remove(&target);
                hub.kick(&target);
            }
        }
    }
}
