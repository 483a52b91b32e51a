//! The reconnecting host connection.
//!
//! [`ConnectionAdapter`] presents an always-available duplex of raw wire
//! frames over a link that is allowed to drop at any time. Frames written
//! while disconnected land in a time-windowed buffer; when the link comes
//! back, the trailing windows are replayed in order. Older windows are
//! silently discarded, callers recover through their own retry loops.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

use crate::config::ConnectionConfig;
use crate::error::{ProtocolError, Result};
use crate::metrics;

/// One live link: raw frames in, raw frames out. Either side closing its
/// channel ends the link.
pub struct WireDuplex {
    pub tx: mpsc::UnboundedSender<String>,
    pub rx: mpsc::UnboundedReceiver<String>,
}

/// Establishes one link attempt. Implementations exist for real websockets
/// and for in-process hubs in tests.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> Result<WireDuplex>;
}

/// Websocket dialer against a host relay.
pub struct WsDialer {
    url: String,
}

impl WsDialer {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self) -> Result<WireDuplex> {
        let (ws, _) = connect_async(&self.url).await.map_err(|err| {
            debug!(url = %self.url, error = %err, "websocket dial failed");
            ProtocolError::TransportClosed
        })?;
        let (mut sink, mut stream) = ws.split();
        let (tx, mut to_wire) = mpsc::unbounded_channel::<String>();
        let (from_wire, rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(frame) = to_wire.recv().await {
                if sink.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });
        tokio::spawn(async move {
            while let Some(next) = stream.next().await {
                match next {
                    Ok(Message::Text(text)) => {
                        if from_wire.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });
        Ok(WireDuplex { tx, rx })
    }
}

/// Time-windowed outbound buffer. Frames are grouped into fixed-width
/// windows by arrival time; only the trailing `kept` windows survive.
pub(crate) struct SendWindowBuffer {
    windows: VecDeque<Vec<String>>,
    window: std::time::Duration,
    kept: usize,
    opened_at: Instant,
}

impl SendWindowBuffer {
    pub(crate) fn new(config: &ConnectionConfig) -> Self {
        Self {
            windows: VecDeque::new(),
            window: config.buffer_window,
            kept: config.buffer_windows_kept.max(1),
            opened_at: Instant::now(),
        }
    }

    pub(crate) fn push(&mut self, frame: String) {
        self.rotate(Instant::now());
        if self.windows.is_empty() {
            self.windows.push_back(Vec::new());
        }
        self.windows
            .back_mut()
            .expect("window present")
            .push(frame);
    }

    pub(crate) fn drain(&mut self) -> Vec<String> {
        self.rotate(Instant::now());
        let mut out = Vec::new();
        for mut window in self.windows.drain(..) {
            out.append(&mut window);
        }
        out
    }

    fn rotate(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.opened_at);
        let advance = (elapsed.as_millis() / self.window.as_millis().max(1)) as usize;
        if advance == 0 {
            return;
        }
        // anything further back than `kept` windows is gone anyway
        let advance = advance.min(self.kept);
        for _ in 0..advance {
            self.windows.push_back(Vec::new());
        }
        self.opened_at = now;
        while self.windows.len() > self.kept {
            self.windows.pop_front();
        }
        // drop trailing empties so push reopens at the current instant
        while self.windows.back().map_or(false, Vec::is_empty) {
            self.windows.pop_back();
        }
    }
}

/// The always-on connection facade handed to the terminal.
#[derive(Clone)]
pub struct ConnectionAdapter {
    outbound: mpsc::UnboundedSender<String>,
    connected: watch::Receiver<bool>,
}

impl ConnectionAdapter {
    /// Start the reconnect loop. Returns the adapter and the stream of
    /// inbound raw frames.
    pub fn start(
        dialer: Arc<dyn Dialer>,
        config: ConnectionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = watch::channel(false);
        tokio::spawn(run(dialer, config, outbound_rx, inbound_tx, connected_tx));
        (
            Self {
                outbound: outbound_tx,
                connected: connected_rx,
            },
            inbound_rx,
        )
    }

    /// Queue a raw frame. Never fails; frames queued while disconnected ride
    /// the window buffer.
    pub fn send(&self, frame: String) {
        let _ = self.outbound.send(frame);
    }

    pub fn connected(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }
}

async fn run(
    dialer: Arc<dyn Dialer>,
    config: ConnectionConfig,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    inbound_tx: mpsc::UnboundedSender<String>,
    connected_tx: watch::Sender<bool>,
) {
    let mut buffer = SendWindowBuffer::new(&config);
    let mut first = true;
    loop {
        let wire = loop {
            let dial = dialer.dial();
            tokio::pin!(dial);
            let attempt = loop {
                tokio::select! {
                    result = &mut dial => break result,
                    frame = outbound_rx.recv() => match frame {
                        Some(frame) => buffer.push(frame),
                        None => return,
                    },
                }
            };
            match attempt {
                Ok(wire) => break wire,
                Err(_) => {
                    let delay = tokio::time::sleep(config.reconnect_delay);
                    tokio::pin!(delay);
                    loop {
                        tokio::select! {
                            _ = &mut delay => break,
                            frame = outbound_rx.recv() => match frame {
                                Some(frame) => buffer.push(frame),
                                None => return,
                            },
                        }
                    }
                }
            }
        };
        let mut wire = wire;

        info!("host connection established");
        metrics::CONNECTED.set(1);
        if !first {
            metrics::RECONNECTS.with_label_values(&["drop"]).inc();
        }
        first = false;
        for frame in buffer.drain() {
            if wire.tx.send(frame).is_err() {
                break;
            }
        }
        let _ = connected_tx.send(true);

        loop {
            tokio::select! {
                frame = outbound_rx.recv() => match frame {
                    Some(frame) => {
                        if let Err(unsent) = wire.tx.send(frame) {
                            buffer.push(unsent.0);
                            break;
                        }
                        metrics::MESSAGES_SENT.with_label_values(&["host"]).inc();
                    }
                    None => return,
                },
                inbound = wire.rx.recv() => match inbound {
                    Some(raw) => {
                        metrics::MESSAGES_RECEIVED.with_label_values(&["host"]).inc();
                        if inbound_tx.send(raw).is_err() {
                            return;
                        }
                    }
                    None => break,
                },
            }
        }

        debug!("host connection lost");
        metrics::CONNECTED.set(0);
        let _ = connected_tx.send(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(window_ms: u64, kept: usize) -> ConnectionConfig {
        ConnectionConfig {
            reconnect_delay: Duration::from_millis(10),
            buffer_window: Duration::from_millis(window_ms),
            buffer_windows_kept: kept,
        }
    }

    #[test]
    fn buffer_preserves_order_within_the_retention_horizon() {
        let mut buffer = SendWindowBuffer::new(&config(1000, 10));
        buffer.push("a".into());
        buffer.push("b".into());
        assert_eq!(buffer.drain(), vec!["a".to_string(), "b".to_string()]);
        assert!(buffer.drain().is_empty());
    }

    #[test]
    fn buffer_discards_windows_beyond_the_horizon() {
        let mut buffer = SendWindowBuffer::new(&config(1000, 2));
        buffer.push("old".into());
        // simulate five windows passing
        buffer.opened_at = Instant::now() - Duration::from_millis(5500);
        buffer.push("recent".into());
        assert_eq!(buffer.drain(), vec!["recent".to_string()]);
    }

    #[test]
    fn buffer_survives_a_very_long_outage() {
        let mut buffer = SendWindowBuffer::new(&config(1, 3));
        buffer.push("stale".into());
        // weeks of elapsed windows must not translate into weeks of work
        buffer.opened_at = Instant::now() - Duration::from_secs(14 * 24 * 3600);
        buffer.push("fresh".into());
        assert_eq!(buffer.drain(), vec!["fresh".to_string()]);
    }

    struct RefusingDialer;

    #[async_trait]
    impl Dialer for RefusingDialer {
        async fn dial(&self) -> Result<WireDuplex> {
            Err(ProtocolError::TransportClosed)
        }
    }

    #[tokio::test]
    async fn frames_sent_while_disconnected_are_not_lost_immediately() {
        let (adapter, _inbound) =
            ConnectionAdapter::start(Arc::new(RefusingDialer), config(1000, 10));
        adapter.send("hello".into());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!adapter.is_connected());
    }
}
