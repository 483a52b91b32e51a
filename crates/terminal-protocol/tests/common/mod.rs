#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use terminal_protocol::transport::{Dialer, MemoryDialer, WireDuplex};
use terminal_protocol::{serve_host, HostHub, ProtocolError, Terminal, TerminalConfig};

/// Fresh hub with its host terminal attached and serving the directory.
pub async fn start_host() -> (HostHub, Terminal) {
    let hub = HostHub::new();
    let host = serve_host(&hub).await.expect("host terminal");
    (hub, host)
}

pub async fn attach_terminal(hub: &HostHub, terminal_id: &str) -> Terminal {
    attach_with(hub, terminal_id, |_| {}).await
}

pub async fn attach_with(
    hub: &HostHub,
    terminal_id: &str,
    tweak: impl FnOnce(&mut TerminalConfig),
) -> Terminal {
    let mut config = TerminalConfig::new("memory://hub");
    config.terminal_id = terminal_id.to_string();
    config.name = terminal_id.to_string();
    tweak(&mut config);
    let dialer = Arc::new(MemoryDialer::new(hub.clone(), terminal_id));
    Terminal::with_dialer(config, dialer)
        .await
        .expect("terminal")
}

/// Poll until `f` holds, with a hard deadline.
pub async fn wait_until(what: &str, f: impl Fn() -> bool) {
    for _ in 0..400 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Dials into the hub a limited number of times, then refuses forever.
/// Lets tests simulate a terminal that disconnects for good.
pub struct BudgetDialer {
    inner: MemoryDialer,
    budget: AtomicUsize,
}

impl BudgetDialer {
    pub fn new(hub: HostHub, terminal_id: &str, budget: usize) -> Self {
        Self {
            inner: MemoryDialer::new(hub, terminal_id),
            budget: AtomicUsize::new(budget),
        }
    }
}

#[async_trait]
impl Dialer for BudgetDialer {
    async fn dial(&self) -> Result<WireDuplex, ProtocolError> {
        loop {
            let left = self.budget.load(Ordering::SeqCst);
            if left == 0 {
                return Err(ProtocolError::TransportClosed);
            }
            if self
                .budget
                .compare_exchange(left, left - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return self.inner.dial().await;
            }
        }
    }
}

/// Refuses the first `failures` dials, connects afterwards. Simulates a host
/// that is slow to come up.
pub struct FlakyDialer {
    inner: MemoryDialer,
    failures: AtomicUsize,
}

impl FlakyDialer {
    pub fn new(hub: HostHub, terminal_id: &str, failures: usize) -> Self {
        Self {
            inner: MemoryDialer::new(hub, terminal_id),
            failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl Dialer for FlakyDialer {
    async fn dial(&self) -> Result<WireDuplex, ProtocolError> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ProtocolError::TransportClosed);
        }
        self.inner.dial().await
    }
}
