/// HTTP control surface
///
/// Lets the catalog write path trigger notifications without linking this
/// crate, and exposes health and fan-out statistics.
use std::sync::Arc;

use actix_web::{web, HttpResponse, Result as ActixResult};
use serde_json::json;
use sync_events::Notification;
use tracing::{error, info};

use crate::metrics;
use crate::tcp::ConnectionRegistry;
use crate::udp::NotificationServer;

/// Broadcast a catalog notification to all UDP subscribers
///
/// Endpoint: POST /broadcast
pub async fn broadcast_notification(
    server: web::Data<Arc<NotificationServer>>,
    body: web::Json<Notification>,
) -> ActixResult<HttpResponse> {
    let notification = body.into_inner().with_default_timestamp();

    match server.broadcast(notification).await {
        Ok(report) => {
            info!(
                id = %report.id,
                delivered = report.delivered,
                failed = report.failed,
                "notification broadcast"
            );
            Ok(HttpResponse::Ok().json(json!({
                "status": "ok",
                "id": report.id,
                "subscribers": report.subscribers,
                "delivered": report.delivered,
                "failed": report.failed
            })))
        }
        Err(e) => {
            error!(error = %e, "broadcast failed");
            Ok(HttpResponse::InternalServerError().json(json!({
                "status": "error",
                "error": e.to_string()
            })))
        }
    }
}

/// Fan-out statistics
///
/// Endpoint: GET /stats
pub async fn stats(
    server: web::Data<Arc<NotificationServer>>,
    connections: web::Data<Arc<ConnectionRegistry>>,
) -> ActixResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(json!({
        "udp_subscribers": server.registry().len(),
        "tcp_connections": connections.len(),
        "backlog_len": connections.backlog_len(),
        "backlog_capacity": connections.backlog_capacity()
    })))
}

/// Prometheus scrape endpoint
///
/// Endpoint: GET /metrics
///
/// Membership gauges are read from the registries this app serves, so other
/// registry instances in the process never leak into the exported values.
pub async fn metrics_endpoint(
    server: web::Data<Arc<NotificationServer>>,
    connections: web::Data<Arc<ConnectionRegistry>>,
) -> HttpResponse {
    metrics::set_udp_subscribers(server.registry().len());
    metrics::set_tcp_connections(connections.len());
    metrics::serve_metrics().await
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/broadcast", web::post().to(broadcast_notification))
        .route("/stats", web::get().to(stats))
        .route("/health", web::get().to(|| async { "OK" }))
        .route("/metrics", web::get().to(metrics_endpoint));
}
