//! Admin HTTP API.
//!
//! Loopback-only endpoints used by the `hostgate` CLI:
//! - `GET /healthz`: liveness
//! - `GET /status`: listeners, discovery and certificate state
//! - `GET /routes`: the current route table
//! - `POST /shutdown`: graceful stop of the whole process

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{watch, Notify};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::control::{Proxy, ProxyStatus};
use crate::proxy::{EntryPoint, Route};

#[derive(Clone)]
pub struct AdminState {
    pub proxy: Arc<Proxy>,
    /// Notified on `POST /shutdown`.
    pub shutdown: Arc<Notify>,
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// "ok" while the proxy runs, "stopping" while it drains, "stopped" otherwise.
    pub status: String,
    pub service: String,
    pub version: String,
    /// Current timestamp (RFC 3339).
    pub timestamp: String,
}

/// One row of `GET /routes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteView {
    pub service_id: String,
    pub router: String,
    pub host: String,
    pub entry_point: EntryPoint,
    pub target: String,
    pub tls: bool,
}

impl From<Route> for RouteView {
    fn from(route: Route) -> Self {
        Self {
            service_id: route.service_id,
            router: route.router,
            host: route.host.to_string(),
            entry_point: route.entry_point,
            target: route.target.to_string(),
            tls: route.tls_enabled,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownResponse {
    pub accepted: bool,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .route("/routes", get(routes))
        .route("/shutdown", post(shutdown))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve `app` until `stop` flips to true.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    mut stop: watch::Receiver<bool>,
) -> std::io::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            loop {
                if *stop.borrow() {
                    break;
                }
                if stop.changed().await.is_err() {
                    break;
                }
            }
            info!("Admin API shutting down");
        })
        .await
}

async fn healthz(State(state): State<AdminState>) -> impl IntoResponse {
    let status = if state.proxy.is_stopping() {
        "stopping"
    } else if state.proxy.is_running().await {
        "ok"
    } else {
        "stopped"
    };
    Json(HealthResponse {
        status: status.to_string(),
        service: "hostgate".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

async fn status(State(state): State<AdminState>) -> Json<ProxyStatus> {
    Json(state.proxy.status().await)
}

async fn routes(State(state): State<AdminState>) -> Json<Vec<RouteView>> {
    let mut routes: Vec<RouteView> = state.proxy.routes().into_iter().map(RouteView::from).collect();
    routes.sort_by(|a, b| (&a.host, a.entry_point).cmp(&(&b.host, b.entry_point)));
    Json(routes)
}

async fn shutdown(State(state): State<AdminState>) -> impl IntoResponse {
    info!("Shutdown requested");
    state.shutdown.notify_one();
    (StatusCode::ACCEPTED, Json(ShutdownResponse { accepted: true }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::AppContext;
    use crate::proxy::HostPattern;

    fn state() -> AdminState {
        let config = Config {
            websecure_enabled: false,
            web_addr: "127.0.0.1:0".parse().unwrap(),
            admin_addr: None,
            ..Config::default()
        };
        AdminState {
            proxy: Arc::new(Proxy::new(AppContext::new(config))),
            shutdown: Arc::new(Notify::new()),
        }
    }

    async fn health_of(state: AdminState) -> HealthResponse {
        let response = healthz(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_healthz_reports_stopped() {
        let health = health_of(state()).await;
        assert_eq!(health.status, "stopped");
        assert_eq!(health.service, "hostgate");
    }

    #[tokio::test]
    async fn test_healthz_reports_running() {
        let state = state();
        state.proxy.start().await.unwrap();
        let health = health_of(state.clone()).await;
        assert_eq!(health.status, "ok");
        state.proxy.stop().await;
    }

    #[tokio::test]
    async fn test_routes_are_sorted() {
        let state = state();
        let table = &state.proxy.context().routes;
        for (id, host) in [("b", "zeta.localhost"), ("a", "alpha.localhost")] {
            table.register(Route {
                service_id: id.to_string(),
                router: "app".to_string(),
                host: HostPattern::exact(host),
                target: "127.0.0.1:3000".parse().unwrap(),
                entry_point: EntryPoint::Web,
                tls_enabled: false,
            });
        }

        let Json(rows) = routes(State(state)).await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].host, "alpha.localhost");
        assert_eq!(rows[1].service_id, "b");
    }

    #[tokio::test]
    async fn test_shutdown_notifies() {
        let state = state();
        let notify = Arc::clone(&state.shutdown);
        let response = shutdown(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        tokio::time::timeout(std::time::Duration::from_secs(1), notify.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_serve_stops_on_signal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(serve(listener, router(state()), rx));
        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
