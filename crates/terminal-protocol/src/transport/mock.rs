//! In-process transport for tests and embedded hosts.

use async_trait::async_trait;

use crate::error::Result;
use crate::hub::HostHub;

use super::connection::{Dialer, WireDuplex};

/// Dials straight into an in-process [`HostHub`], no sockets involved. This
/// is the transport the integration tests run the whole protocol over.
pub struct MemoryDialer {
    hub: HostHub,
    terminal_id: String,
}

impl MemoryDialer {
    pub fn new(hub: HostHub, terminal_id: impl Into<String>) -> Self {
        Self {
            hub,
            terminal_id: terminal_id.into(),
        }
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self) -> Result<WireDuplex> {
        self.hub.attach(&self.terminal_id)
    }
}
