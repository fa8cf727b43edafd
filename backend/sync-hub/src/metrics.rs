use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};

static UDP_SUBSCRIBERS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "sync_hub_udp_subscribers",
        "Currently registered UDP notification subscribers",
    )
    .expect("failed to create sync_hub_udp_subscribers");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register sync_hub_udp_subscribers");
    gauge
});

static TCP_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "sync_hub_tcp_connections",
        "Currently registered progress sync connections",
    )
    .expect("failed to create sync_hub_tcp_connections");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register sync_hub_tcp_connections");
    gauge
});

static NOTIFICATIONS_BROADCAST: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "sync_hub_notifications_broadcast_total",
        "Notifications handed to the UDP broadcaster",
    )
    .expect("failed to create sync_hub_notifications_broadcast_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register sync_hub_notifications_broadcast_total");
    counter
});

static SEND_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "sync_hub_send_failures_total",
            "Per-peer send failures, by transport and reason",
        ),
        &["transport", "reason"],
    )
    .expect("failed to create sync_hub_send_failures_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register sync_hub_send_failures_total");
    counter
});

static PROGRESS_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "sync_hub_progress_events_total",
            "Progress events seen by the sync server, by outcome",
        ),
        &["outcome"],
    )
    .expect("failed to create sync_hub_progress_events_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register sync_hub_progress_events_total");
    counter
});

static REAPED_CONNECTIONS: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "sync_hub_reaped_connections_total",
        "Connections closed for missing heartbeats",
    )
    .expect("failed to create sync_hub_reaped_connections_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register sync_hub_reaped_connections_total");
    counter
});

static DELIVERY_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "sync_hub_delivery_failures_total",
        "Progress updates the storage API did not accept",
    )
    .expect("failed to create sync_hub_delivery_failures_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register sync_hub_delivery_failures_total");
    counter
});

/// Membership gauges are refreshed at scrape time from the served registries
pub fn set_udp_subscribers(count: usize) {
    UDP_SUBSCRIBERS.set(count as i64);
}

pub fn set_tcp_connections(count: usize) {
    TCP_CONNECTIONS.set(count as i64);
}

pub fn record_notification_broadcast() {
    NOTIFICATIONS_BROADCAST.inc();
}

pub fn record_send_failure(transport: &str, reason: &str) {
    SEND_FAILURES.with_label_values(&[transport, reason]).inc();
}

pub fn record_progress_event(outcome: &str) {
    PROGRESS_EVENTS.with_label_values(&[outcome]).inc();
}

pub fn record_reaped_connection() {
    REAPED_CONNECTIONS.inc();
}

pub fn record_delivery_failure() {
    DELIVERY_FAILURES.inc();
}

pub async fn serve_metrics() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}
