use once_cell::sync::Lazy;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static REQUEST_DURATION_MS: Lazy<HistogramVec> = Lazy::new(|| {
    let h = HistogramVec::new(
        HistogramOpts::new(
            "terminal_request_duration_milliseconds",
            "End-to-end duration of served requests",
        )
        .buckets(vec![1.0, 10.0, 100.0, 1000.0, 10000.0]),
        &["method", "code"],
    )
    .unwrap();
    REGISTRY.register(Box::new(h.clone())).ok();
    h
});

pub static REQUESTS_REJECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "terminal_requests_rejected_total",
            "Requests refused at admission",
        ),
        &["method", "code"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static REQUESTS_IN_STAGE: Lazy<IntGaugeVec> = Lazy::new(|| {
    let g = IntGaugeVec::new(
        Opts::new(
            "terminal_requests_in_stage",
            "Requests currently held in each lifecycle stage",
        ),
        &["service_id", "stage"],
    )
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static MESSAGES_SENT: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "terminal_messages_sent_total",
            "Outbound messages by delivery path",
        ),
        &["path"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static MESSAGES_RECEIVED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "terminal_messages_received_total",
            "Inbound messages by delivery path",
        ),
        &["path"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static TUNNEL_CHUNKED_MESSAGES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "terminal_tunnel_chunked_messages_total",
            "Logical messages processed by the tunnel chunker",
        ),
        &["direction"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static TUNNEL_REASSEMBLY_DROPS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "terminal_tunnel_reassembly_drops_total",
            "Partial tunnel messages discarded before completion",
        ),
        &["reason"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static TUNNEL_FALLBACKS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "terminal_tunnel_fallbacks_total",
            "Tunnel sends that fell back to the host connection",
        ),
        &["reason"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static CONNECTED: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new(
        "terminal_connected",
        "Whether the host connection is currently established",
    )
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static RECONNECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "terminal_reconnects_total",
            "Host connection re-establishments",
        ),
        &["reason"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

/// Render the full registry in the Prometheus text exposition format. Served
/// by the built-in `Metrics` service.
pub fn render() -> String {
    TextEncoder::new()
        .encode_to_string(&REGISTRY.gather())
        .unwrap_or_default()
}
