use std::time::Duration;

/// Construction-time settings for a terminal.
#[derive(Debug, Clone)]
pub struct TerminalConfig {
    /// Websocket endpoint of the host, e.g. `ws://localhost:8888/ws`. The
    /// terminal id is appended as the final path segment when dialing.
    pub host_url: String,
    /// Stable identity of this terminal. Generated when absent.
    pub terminal_id: String,
    /// Human-readable name shown in the directory.
    pub name: String,
    /// Free-form labels attached to the advertised `TerminalInfo`.
    pub tags: Vec<String>,
    /// Base64 x25519 private key enabling the key-exchange service.
    pub private_key: Option<String>,
    /// Whether to dial WebRTC tunnels toward peers that also enable them.
    pub enable_tunnel: bool,
    /// Whether the built-in `Terminate` service is served.
    pub allow_terminate: bool,
    pub connection: ConnectionConfig,
    pub tunnel: TunnelConfig,
}

impl TerminalConfig {
    pub fn new(host_url: impl Into<String>) -> Self {
        Self {
            host_url: host_url.into(),
            terminal_id: format!("terminal-{}", uuid::Uuid::new_v4()),
            name: String::new(),
            tags: Vec::new(),
            private_key: None,
            enable_tunnel: false,
            allow_terminate: false,
            connection: ConnectionConfig::default(),
            tunnel: TunnelConfig::default(),
        }
    }

    /// Read the standard environment variables. `TERMINAL_HOST_URL` is
    /// required, everything else falls back to defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let host_url = std::env::var("TERMINAL_HOST_URL")
            .map_err(|_| anyhow::anyhow!("TERMINAL_HOST_URL is not set"))?;
        let mut config = Self::new(host_url);
        if let Ok(id) = std::env::var("TERMINAL_ID") {
            config.terminal_id = id;
        }
        if let Ok(name) = std::env::var("TERMINAL_NAME") {
            config.name = name;
        }
        if let Ok(key) = std::env::var("TERMINAL_PRIVATE_KEY") {
            config.private_key = Some(key);
        }
        config.enable_tunnel = env_flag("TERMINAL_ENABLE_WEBRTC");
        config.allow_terminate = env_flag("TERMINAL_ALLOW_TERMINATE");
        Ok(config)
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE")
    )
}

/// Tuning for the reconnecting host connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Delay before redialing after a drop.
    pub reconnect_delay: Duration,
    /// Width of one outbound buffering window.
    pub buffer_window: Duration,
    /// Number of trailing windows replayed after a reconnect.
    pub buffer_windows_kept: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(1),
            buffer_window: Duration::from_secs(1),
            buffer_windows_kept: 10,
        }
    }
}

/// Tuning for direct peer tunnels.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Largest frame this terminal is willing to receive over a tunnel,
    /// advertised during signaling.
    pub max_message_size: usize,
    /// Headroom subtracted from the negotiated limit before a payload is
    /// considered tunnel-sized.
    pub size_reserve: usize,
    /// How long a partially reassembled message may go without progress.
    pub reassembly_timeout: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            max_message_size: 256 * 1024,
            size_reserve: 32 * 1024,
            reassembly_timeout: Duration::from_secs(15),
        }
    }
}
