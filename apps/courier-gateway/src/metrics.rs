use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static UPLOADS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("courier_uploads_total", "Uploads handled, by outcome code"),
        &["outcome"],
    )
    .expect("valid metric definition");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static UPLOADED_BYTES: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "courier_uploaded_bytes_total",
        "Bytes accepted by the remote document service",
    )
    .expect("valid metric definition");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static RELAY_FRAMES: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "courier_relay_frames_total",
        "Frames forwarded to downstream event streams",
    )
    .expect("valid metric definition");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static RELAY_CLOSED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("courier_relay_closed_total", "Relayed streams closed, by reason"),
        &["reason"],
    )
    .expect("valid metric definition");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static POLL_DEADLINES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "courier_poll_deadlines_total",
            "Status polls that ran out of budget before a terminal status",
        ),
        &["resource"],
    )
    .expect("valid metric definition");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub fn export_prometheus() -> String {
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    TextEncoder::new().encode(&metric_families, &mut buf).ok();
    String::from_utf8(buf).unwrap_or_default()
}
