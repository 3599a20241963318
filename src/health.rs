use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();
    let active_sessions = state.store.count_active_sessions().await.unwrap_or(0);

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": "babelcast-backend",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "active_sessions": active_sessions,
            "active_connections": state.broadcaster.connection_count(),
            "connections_admitted": metrics.connections_admitted,
            "admission_refusals": metrics.admission_refusals
        },
        "lifecycle": {
            "heartbeat_interval_secs": config.lifecycle.heartbeat_interval_secs,
            "connection_ttl_secs": config.lifecycle.connection_ttl_secs,
            "refresh_threshold_secs": config.lifecycle.refresh_threshold().as_secs(),
            "refreshes_started": metrics.refreshes_started,
            "refreshes_completed": metrics.refreshes_completed,
            "heartbeat_timeouts": metrics.heartbeat_timeouts
        }
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in metrics.endpoint_metrics.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "error_rate": metric.error_rate(),
            "average_duration_ms": metric.average_duration_ms(),
            "total_duration_ms": metric.total_duration_ms
        }));
    }

    let mut transitions = Vec::new();
    for (edge, count) in metrics.lifecycle_transitions.iter() {
        transitions.push(json!({ "transition": edge, "count": count }));
    }

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "broadcast": {
            "connections_admitted": metrics.connections_admitted,
            "admission_refusals": metrics.admission_refusals,
            "chunks_delivered": metrics.chunks_delivered,
            "refreshes_started": metrics.refreshes_started,
            "refreshes_completed": metrics.refreshes_completed,
            "heartbeat_timeouts": metrics.heartbeat_timeouts
        },
        "lifecycle_transitions": transitions,
        "endpoints": endpoint_stats
    }))
}
