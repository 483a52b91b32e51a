//! Direct peer-to-peer tunnels.
//!
//! A tunnel is one WebRTC data channel per remote terminal, used as a bulk
//! bypass around the host relay. Tunnels are strictly an optimization: any
//! failure to establish or to send silently falls back to the relay path, so
//! correctness never depends on one existing.

pub mod chunk;
pub mod signal;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::client::TerminalClient;
use crate::config::TunnelConfig;
use crate::error::{codes, ProtocolError, Result};
use crate::metrics;
use chunk::{ChunkLimits, Reassembler};
use signal::{is_offerer, signal_method, SignalRequest, SignalResponse};

/// Upper bound on a logical payload travelling through the chunker.
const MAX_TUNNEL_PAYLOAD: usize = 16 * 1024 * 1024;
/// Wait between failed dial attempts toward the same peer.
const DIAL_COOLDOWN: Duration = Duration::from_secs(5);
const GATHER_TIMEOUT: Duration = Duration::from_secs(10);
const GC_INTERVAL: Duration = Duration::from_secs(5);

struct TunnelSession {
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
    channel: Arc<RTCDataChannel>,
    /// min of both sides' declared limits
    negotiated_max: usize,
    open: Arc<AtomicBool>,
    reassembler: Arc<Mutex<Reassembler>>,
}

impl TunnelSession {
    fn send_limits(&self, config: &TunnelConfig) -> ChunkLimits {
        ChunkLimits {
            max_frame_bytes: self
                .negotiated_max
                .saturating_sub(config.size_reserve)
                .max(1),
            max_payload_bytes: MAX_TUNNEL_PAYLOAD,
            stall_timeout: config.reassembly_timeout,
        }
    }
}

struct TunnelState {
    sessions: HashMap<String, Arc<TunnelSession>>,
    dialing: HashMap<String, Instant>,
}

struct TunnelInner {
    terminal_id: String,
    config: TunnelConfig,
    state: Mutex<TunnelState>,
    inbound_tx: mpsc::UnboundedSender<String>,
}

/// Manages every tunnel of one terminal. Clones share state.
#[derive(Clone)]
pub struct PeerTunnel {
    inner: Arc<TunnelInner>,
}

impl PeerTunnel {
    pub fn new(
        terminal_id: String,
        config: TunnelConfig,
    ) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        (
            Self {
                inner: Arc::new(TunnelInner {
                    terminal_id,
                    config,
                    state: Mutex::new(TunnelState {
                        sessions: HashMap::new(),
                        dialing: HashMap::new(),
                    }),
                    inbound_tx,
                }),
            },
            inbound_rx,
        )
    }

    /// Whether an open tunnel toward this peer currently exists.
    pub fn is_open(&self, peer_id: &str) -> bool {
        self.inner
            .state
            .lock()
            .sessions
            .get(peer_id)
            .map_or(false, |s| s.open.load(Ordering::SeqCst))
    }

    /// Try to push one serialized message through the tunnel. `false` means
    /// the relay path must carry it instead; the session itself stays up, a
    /// channel that actually died tears down through its `on_close`.
    pub async fn try_send(&self, peer_id: &str, payload: &str) -> bool {
        let session = {
            let state = self.inner.state.lock();
            match state.sessions.get(peer_id) {
                Some(s) if s.open.load(Ordering::SeqCst) => Arc::clone(s),
                _ => return false,
            }
        };
        let limits = session.send_limits(&self.inner.config);
        let frames = match chunk::encode_payload(payload.as_bytes(), rand::random(), &limits) {
            Ok(frames) => frames,
            Err(err) => {
                debug!(peer_id, error = %err, "payload not tunnelable");
                metrics::TUNNEL_FALLBACKS
                    .with_label_values(&["oversize"])
                    .inc();
                return false;
            }
        };
        if frames.len() > 1 {
            metrics::TUNNEL_CHUNKED_MESSAGES
                .with_label_values(&["out"])
                .inc();
        }
        for frame in frames {
            if let Err(err) = session.channel.send(&frame).await {
                debug!(peer_id, error = %err, "tunnel send failed");
                metrics::TUNNEL_FALLBACKS.with_label_values(&["send"]).inc();
                return false;
            }
        }
        metrics::MESSAGES_SENT.with_label_values(&["tunnel"]).inc();
        true
    }

    /// Dial a tunnel toward `peer_id` in the background unless one exists or
    /// an attempt recently failed.
    pub fn ensure(&self, client: TerminalClient, peer_id: String) {
        {
            let mut state = self.inner.state.lock();
            if state.sessions.contains_key(&peer_id) {
                return;
            }
            match state.dialing.get(&peer_id) {
                Some(since) if since.elapsed() < DIAL_COOLDOWN => return,
                _ => {}
            }
            state.dialing.insert(peer_id.clone(), Instant::now());
        }
        let tunnel = self.clone();
        tokio::spawn(async move {
            if let Err(err) = tunnel.dial(&client, &peer_id).await {
                debug!(peer_id = %peer_id, error = %err, "tunnel dial failed");
            }
            tunnel.inner.state.lock().dialing.remove(&peer_id);
        });
    }

    /// Offerer side of establishment: gather a complete offer, exchange it
    /// through one request against the peer's signal service, apply the
    /// answer.
    async fn dial(&self, client: &TerminalClient, peer_id: &str) -> Result<()> {
        let api = APIBuilder::new().build();
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .map_err(|e| ProtocolError::Tunnel(e.to_string()))?,
        );
        let channel = pc
            .create_data_channel("terminal-tunnel", None)
            .await
            .map_err(|e| ProtocolError::Tunnel(e.to_string()))?;

        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| ProtocolError::Tunnel(e.to_string()))?;
        pc.set_local_description(offer)
            .await
            .map_err(|e| ProtocolError::Tunnel(e.to_string()))?;
        wait_ice_complete(&pc, GATHER_TIMEOUT).await?;
        let offer_sdp = pc
            .local_description()
            .await
            .ok_or_else(|| ProtocolError::Tunnel("no local description".into()))?
            .sdp;

        let res = client
            .request_to(
                peer_id,
                &signal_method(),
                serde_json::to_value(SignalRequest {
                    offer_sdp,
                    max_message_size: self.inner.config.max_message_size,
                })
                .unwrap_or(json!({})),
            )
            .response()
            .await?;
        if res.code != codes::OK {
            return Err(ProtocolError::Tunnel(format!(
                "signal refused: {} {}",
                res.code, res.message
            )));
        }
        let answer: SignalResponse = serde_json::from_value(res.data.unwrap_or_default())
            .map_err(|_| ProtocolError::Tunnel("malformed signal response".into()))?;

        let desc = RTCSessionDescription::answer(answer.answer_sdp)
            .map_err(|e| ProtocolError::Tunnel(e.to_string()))?;
        pc.set_remote_description(desc)
            .await
            .map_err(|e| ProtocolError::Tunnel(e.to_string()))?;

        self.install_session(peer_id, pc, channel, answer.max_message_size);
        Ok(())
    }

    /// Answerer side of establishment, invoked by the signal service handler.
    pub async fn accept(&self, peer_id: &str, request: SignalRequest) -> Result<SignalResponse> {
        {
            let state = self.inner.state.lock();
            // glare: both sides dialed at once; the offerer role wins
            if state.dialing.contains_key(peer_id)
                && is_offerer(&self.inner.terminal_id, peer_id)
            {
                return Err(ProtocolError::Tunnel(
                    "concurrent dial, local side holds the offer".into(),
                ));
            }
        }
        let api = APIBuilder::new().build();
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .map_err(|e| ProtocolError::Tunnel(e.to_string()))?,
        );

        // the dialer opens the channel; capture it when it arrives
        let (channel_tx, mut channel_rx) = mpsc::unbounded_channel::<Arc<RTCDataChannel>>();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let channel_tx = channel_tx.clone();
            Box::pin(async move {
                let _ = channel_tx.send(dc);
            })
        }));

        let desc = RTCSessionDescription::offer(request.offer_sdp)
            .map_err(|e| ProtocolError::Tunnel(e.to_string()))?;
        pc.set_remote_description(desc)
            .await
            .map_err(|e| ProtocolError::Tunnel(e.to_string()))?;
        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| ProtocolError::Tunnel(e.to_string()))?;
        pc.set_local_description(answer)
            .await
            .map_err(|e| ProtocolError::Tunnel(e.to_string()))?;
        wait_ice_complete(&pc, GATHER_TIMEOUT).await?;
        let answer_sdp = pc
            .local_description()
            .await
            .ok_or_else(|| ProtocolError::Tunnel("no local description".into()))?
            .sdp;

        let tunnel = self.clone();
        let peer = peer_id.to_string();
        let remote_max = request.max_message_size;
        let pc_for_session = Arc::clone(&pc);
        tokio::spawn(async move {
            match tokio::time::timeout(GATHER_TIMEOUT, channel_rx.recv()).await {
                Ok(Some(channel)) => {
                    tunnel.install_session(&peer, pc_for_session, channel, remote_max)
                }
                _ => debug!(peer_id = %peer, "dialer never opened a data channel"),
            }
        });

        Ok(SignalResponse {
            answer_sdp,
            max_message_size: self.inner.config.max_message_size,
        })
    }

    fn install_session(
        &self,
        peer_id: &str,
        pc: Arc<RTCPeerConnection>,
        channel: Arc<RTCDataChannel>,
        remote_max: usize,
    ) {
        let negotiated_max = self.inner.config.max_message_size.min(remote_max);
        let open = Arc::new(AtomicBool::new(false));
        let session = Arc::new(TunnelSession {
            peer_id: peer_id.to_string(),
            pc,
            channel: Arc::clone(&channel),
            negotiated_max,
            open: Arc::clone(&open),
            reassembler: Arc::new(Mutex::new(Reassembler::new(ChunkLimits {
                max_frame_bytes: negotiated_max.max(1),
                max_payload_bytes: MAX_TUNNEL_PAYLOAD,
                stall_timeout: self.inner.config.reassembly_timeout,
            }))),
        });

        {
            let peer = peer_id.to_string();
            let open = Arc::clone(&open);
            channel.on_open(Box::new(move || {
                info!(peer_id = %peer, "tunnel open");
                open.store(true, Ordering::SeqCst);
                Box::pin(async {})
            }));
        }
        {
            let tunnel = self.clone();
            let peer = peer_id.to_string();
            channel.on_close(Box::new(move || {
                debug!(peer_id = %peer, "tunnel closed");
                tunnel.drop_session(&peer);
                Box::pin(async {})
            }));
        }
        {
            let inbound_tx = self.inner.inbound_tx.clone();
            let reassembler = Arc::clone(&session.reassembler);
            let peer = peer_id.to_string();
            channel.on_message(Box::new(move |msg: DataChannelMessage| {
                let outcome = reassembler.lock().ingest(&msg.data, Instant::now());
                match outcome {
                    Ok(Some(payload)) => {
                        metrics::MESSAGES_RECEIVED
                            .with_label_values(&["tunnel"])
                            .inc();
                        match String::from_utf8(payload.to_vec()) {
                            Ok(text) => {
                                let _ = inbound_tx.send(text);
                            }
                            Err(_) => warn!(peer_id = %peer, "non-utf8 tunnel payload"),
                        }
                    }
                    Ok(None) => {}
                    Err(err) => debug!(peer_id = %peer, error = %err, "tunnel frame rejected"),
                }
                Box::pin(async {})
            }));
        }

        // periodic collection of stalled partial messages
        {
            let reassembler = Arc::downgrade(&session.reassembler);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(GC_INTERVAL);
                loop {
                    tick.tick().await;
                    let Some(reassembler) = reassembler.upgrade() else {
                        return;
                    };
                    let dropped = reassembler.lock().gc(Instant::now());
                    if dropped > 0 {
                        metrics::TUNNEL_REASSEMBLY_DROPS
                            .with_label_values(&["stall"])
                            .inc_by(dropped as u64);
                    }
                }
            });
        }

        let replaced = self
            .inner
            .state
            .lock()
            .sessions
            .insert(peer_id.to_string(), session);
        if let Some(old) = replaced {
            close_connection(Arc::clone(&old.pc));
        }
    }

    fn drop_session(&self, peer_id: &str) {
        if let Some(session) = self.inner.state.lock().sessions.remove(peer_id) {
            debug!(peer_id = %session.peer_id, "tunnel session dropped");
            close_connection(Arc::clone(&session.pc));
        }
    }

    /// Close every session, for terminal disposal.
    pub fn dispose(&self) {
        let sessions: Vec<_> = self.inner.state.lock().sessions.drain().collect();
        for (_, session) in sessions {
            close_connection(Arc::clone(&session.pc));
        }
    }
}

fn close_connection(pc: Arc<RTCPeerConnection>) {
    tokio::spawn(async move {
        let _ = pc.close().await;
    });
}

async fn wait_ice_complete(pc: &RTCPeerConnection, timeout: Duration) -> Result<()> {
    if pc.ice_gathering_state() == RTCIceGatheringState::Complete {
        return Ok(());
    }
    let mut gather = pc.gathering_complete_promise().await;
    let _ = tokio::time::timeout(timeout, gather.recv())
        .await
        .map_err(|_| ProtocolError::Tunnel("ice gathering timed out".into()))?;
    Ok(())
}
