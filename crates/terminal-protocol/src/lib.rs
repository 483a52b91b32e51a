//! Messaging substrate for a distributed trading platform.
//!
//! Terminals connect to a host relay over a reconnecting websocket, advertise
//! typed services, and exchange request/response-stream traffic addressed by
//! terminal id. Bulk traffic may bypass the relay through direct WebRTC
//! tunnels. See [`terminal::Terminal`] for the entry point.

pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod hub;
pub mod metrics;
pub mod model;
pub mod schema;
pub mod security;
pub mod server;
pub mod terminal;
pub mod topology;
pub mod transport;

pub use client::{CallStream, TerminalClient};
pub use config::{ConnectionConfig, TerminalConfig, TunnelConfig};
pub use error::{ProtocolError, Result};
pub use hub::{serve_host, HostHub};
pub use model::{
    HostEvent, HostEventKind, ResponsePayload, ServiceInfo, TerminalInfo, TerminalMessage,
    HOST_TERMINAL_ID,
};
pub use server::{
    respond_with, AbortSignal, HandlerStream, ServiceHandler, ServiceOptions, ServiceOutput,
};
pub use terminal::Terminal;
