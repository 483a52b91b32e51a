//! Topology synchronization against the host directory.
//!
//! Two flows run forever: the inbound one keeps a local snapshot of every
//! connected terminal fresh, and the outbound one pushes this terminal's own
//! `TerminalInfo` whenever it changes.
//!
//! The inbound flow pulls the full directory with `GetTerminalInfos`, then
//! applies incremental `HostEvent`s from a subscription stream. Events carry
//! a per-host sequence number; anything other than exactly-the-next number
//! forces a fresh pull instead of an application.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::client::TerminalClient;
use crate::error::codes;
use crate::model::{
    encode_path, HostEvent, HostEventKind, TerminalInfo, HOST_TERMINAL_ID,
};

pub const METHOD_GET_TERMINAL_INFOS: &str = "GetTerminalInfos";
pub const METHOD_UPDATE_TERMINAL_INFO: &str = "UpdateTerminalInfo";

/// Method under which the host serves its event stream.
pub fn host_event_channel() -> String {
    encode_path(&["SubscribeChannel", "HostEvent"])
}

/// Payload of a successful `GetTerminalInfos` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    pub terminals: Vec<TerminalInfo>,
    pub seq_id: u64,
}

const RETRY_DELAY: Duration = Duration::from_secs(1);
const PUSH_DEBOUNCE: Duration = Duration::from_millis(25);
/// Wait out a burst of out-of-order events before pulling the full
/// directory again; a gap rarely arrives alone.
const RESYNC_DEBOUNCE: Duration = Duration::from_millis(500);

struct SyncState {
    terminals: BTreeMap<String, TerminalInfo>,
    last_seq: Option<u64>,
}

/// Keeps the directory snapshot current and the local info published.
#[derive(Clone)]
pub struct TopologySync {
    client: TerminalClient,
    local: Arc<Mutex<TerminalInfo>>,
    state: Arc<Mutex<SyncState>>,
    snapshot_tx: Arc<watch::Sender<Arc<Vec<TerminalInfo>>>>,
    push_tx: tokio::sync::mpsc::UnboundedSender<()>,
    push_rx: Arc<Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<()>>>>,
}

impl TopologySync {
    pub fn new(client: TerminalClient, local: Arc<Mutex<TerminalInfo>>) -> Self {
        let (snapshot_tx, _) = watch::channel(Arc::new(Vec::new()));
        let (push_tx, push_rx) = tokio::sync::mpsc::unbounded_channel();
        Self {
            client,
            local,
            state: Arc::new(Mutex::new(SyncState {
                terminals: BTreeMap::new(),
                last_seq: None,
            })),
            snapshot_tx: Arc::new(snapshot_tx),
            push_tx,
            push_rx: Arc::new(Mutex::new(Some(push_rx))),
        }
    }

    /// Subscribe to snapshot updates. The snapshot is sorted by terminal id.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<TerminalInfo>>> {
        self.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> Arc<Vec<TerminalInfo>> {
        self.snapshot_tx.borrow().clone()
    }

    /// Request a (debounced) push of the local `TerminalInfo` to the host.
    pub fn schedule_push(&self) {
        let _ = self.push_tx.send(());
    }

    /// Spawn the sync and push loops. `connected` is the host connection
    /// state; a reconnect re-publishes the local info.
    pub fn spawn(&self, connected: watch::Receiver<bool>) {
        let sync = self.clone();
        tokio::spawn(async move { sync.sync_loop().await });

        let push = self.clone();
        let rx = self
            .push_rx
            .lock()
            .take()
            .unwrap_or_else(|| tokio::sync::mpsc::unbounded_channel().1);
        tokio::spawn(async move { push.push_loop(rx).await });

        let repush = self.clone();
        let mut connected = connected;
        tokio::spawn(async move {
            while connected.changed().await.is_ok() {
                if *connected.borrow() {
                    repush.schedule_push();
                }
            }
        });
    }

    async fn sync_loop(&self) {
        while let Err(err) = self.pull().await {
            debug!(error = %err, "directory pull failed, retrying");
            tokio::time::sleep(RETRY_DELAY).await;
        }
        loop {
            self.follow_events().await;
            // stream ended (disconnect or server-side chop); resubscribe.
            // Missed events surface as a sequence gap and force a pull.
            tokio::time::sleep(RETRY_DELAY).await;
        }
    }

    /// One full directory pull. Fails when the host entry itself is absent,
    /// which happens while the relay is still starting up.
    async fn pull(&self) -> anyhow::Result<()> {
        let res = self
            .client
            .request_to(HOST_TERMINAL_ID, METHOD_GET_TERMINAL_INFOS, json!({}))
            .response()
            .await?;
        if res.code != codes::OK {
            anyhow::bail!("GetTerminalInfos failed: {} {}", res.code, res.message);
        }
        let snapshot: DirectorySnapshot =
            serde_json::from_value(res.data.unwrap_or_default())?;
        if !snapshot
            .terminals
            .iter()
            .any(|t| t.terminal_id == HOST_TERMINAL_ID)
        {
            anyhow::bail!("host terminal not present in directory yet");
        }
        {
            let mut state = self.state.lock();
            state.terminals = snapshot
                .terminals
                .into_iter()
                .map(|t| (t.terminal_id.clone(), t))
                .collect();
            state.last_seq = Some(snapshot.seq_id);
        }
        self.publish();
        Ok(())
    }

    /// Consume one subscription stream until it ends. A sequence gap triggers
    /// a debounced full pull; events replayed from before the pull are simply
    /// skipped.
    async fn follow_events(&self) {
        let mut stream =
            self.client
                .request_to(HOST_TERMINAL_ID, &host_event_channel(), json!({}));
        while let Some(item) = stream.next().await {
            let msg = match item {
                Ok(msg) => msg,
                Err(err) => {
                    debug!(error = %err, "host event stream failed");
                    return;
                }
            };
            if msg.is_terminal() {
                return;
            }
            let Some(event) = msg.event else { continue };
            if !self.apply(event) {
                tokio::time::sleep(RESYNC_DEBOUNCE).await;
                if let Err(err) = self.pull().await {
                    warn!(error = %err, "resync pull failed");
                    return;
                }
            }
        }
    }

    /// Apply one event to the snapshot. Returns false when the event cannot
    /// be applied and a full resync is required.
    fn apply(&self, event: HostEvent) -> bool {
        let mut state = self.state.lock();
        match event.kind {
            HostEventKind::Init => {
                // baseline marker: trust it only when we already hold a
                // snapshot at exactly this point
                state.last_seq == Some(event.seq_id)
            }
            HostEventKind::TerminalChange => {
                match state.last_seq {
                    // a replay from before the last pull carries nothing new
                    Some(last) if event.seq_id <= last => return true,
                    Some(last) if event.seq_id == last + 1 => {}
                    _ => {
                        debug!(
                            seq_id = event.seq_id,
                            last = ?state.last_seq,
                            "sequence gap in host events"
                        );
                        return false;
                    }
                }
                state.last_seq = Some(event.seq_id);
                if let Some(change) = event.payload {
                    match (change.old, change.new) {
                        (_, Some(new)) => {
                            state.terminals.insert(new.terminal_id.clone(), new);
                        }
                        (Some(old), None) => {
                            state.terminals.remove(&old.terminal_id);
                        }
                        (None, None) => {}
                    }
                }
                drop(state);
                self.publish();
                true
            }
        }
    }

    fn publish(&self) {
        let snapshot: Arc<Vec<TerminalInfo>> =
            Arc::new(self.state.lock().terminals.values().cloned().collect());
        self.client.update_topology(&snapshot);
        // send_replace: the value must land even with no receiver around
        self.snapshot_tx.send_replace(snapshot);
    }

    #[cfg(test)]
    fn seed(&self, terminals: Vec<TerminalInfo>, seq: u64) {
        let mut state = self.state.lock();
        state.terminals = terminals
            .into_iter()
            .map(|t| (t.terminal_id.clone(), t))
            .collect();
        state.last_seq = Some(seq);
    }

    /// Debounced, acknowledged push of the local info. Retries every second
    /// until the host confirms.
    async fn push_loop(&self, mut rx: tokio::sync::mpsc::UnboundedReceiver<()>) {
        while rx.recv().await.is_some() {
            tokio::time::sleep(PUSH_DEBOUNCE).await;
            // collapse every request that arrived during the debounce window
            while rx.try_recv().is_ok() {}
            loop {
                let info = self.local.lock().clone();
                let body = match serde_json::to_value(&info) {
                    Ok(v) => v,
                    Err(_) => break,
                };
                match self
                    .client
                    .request_to(HOST_TERMINAL_ID, METHOD_UPDATE_TERMINAL_INFO, body)
                    .response()
                    .await
                {
                    Ok(res) if res.code == codes::OK => {
                        debug!(terminal_id = %info.terminal_id, "terminal info published");
                        break;
                    }
                    Ok(res) => {
                        debug!(code = res.code, message = %res.message, "info push refused")
                    }
                    Err(err) => debug!(error = %err, "info push failed"),
                }
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TerminalChange;

    fn sync() -> TopologySync {
        let (outbound, _rx) = tokio::sync::mpsc::unbounded_channel();
        let client = TerminalClient::new("term-test".to_string(), outbound);
        TopologySync::new(client, Arc::new(Mutex::new(TerminalInfo::default())))
    }

    fn info(id: &str) -> TerminalInfo {
        TerminalInfo {
            terminal_id: id.to_string(),
            ..Default::default()
        }
    }

    fn change(seq_id: u64, old: Option<TerminalInfo>, new: Option<TerminalInfo>) -> HostEvent {
        HostEvent {
            seq_id,
            kind: HostEventKind::TerminalChange,
            payload: Some(TerminalChange { old, new }),
        }
    }

    #[test]
    fn contiguous_changes_apply() {
        let sync = sync();
        sync.seed(vec![info("a")], 5);
        assert!(sync.apply(change(6, None, Some(info("b")))));
        assert!(sync.apply(change(7, Some(info("a")), None)));
        let ids: Vec<_> = sync
            .state
            .lock()
            .terminals
            .keys()
            .cloned()
            .collect();
        assert_eq!(ids, vec!["b".to_string()]);
    }

    #[test]
    fn a_sequence_gap_forces_a_resync() {
        let sync = sync();
        sync.seed(vec![info("a")], 5);
        assert!(!sync.apply(change(8, None, Some(info("b")))));
        // state untouched on refusal
        assert!(sync.state.lock().terminals.contains_key("a"));
        assert_eq!(sync.state.lock().last_seq, Some(5));
    }

    #[test]
    fn snapshots_land_without_any_subscriber() {
        let sync = sync();
        sync.seed(vec![info("a")], 1);
        sync.publish();
        let snapshot = sync.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].terminal_id, "a");
    }

    #[test]
    fn stale_replays_are_skipped_without_touching_state() {
        let sync = sync();
        sync.seed(vec![info("a")], 5);
        assert!(sync.apply(change(4, Some(info("a")), None)));
        assert!(sync.state.lock().terminals.contains_key("a"));
        assert_eq!(sync.state.lock().last_seq, Some(5));
    }

    #[test]
    fn events_before_any_pull_force_a_resync() {
        let sync = sync();
        assert!(!sync.apply(change(1, None, Some(info("a")))));
    }

    #[test]
    fn init_is_trusted_only_at_the_current_baseline() {
        let sync = sync();
        sync.seed(Vec::new(), 3);
        let init = |seq_id| HostEvent {
            seq_id,
            kind: HostEventKind::Init,
            payload: None,
        };
        assert!(sync.apply(init(3)));
        assert!(!sync.apply(init(9)));
    }
}
