use crate::error::Result;
use crate::models::metrics::{HealthResponse, MonitorResponse, ServerStatus};
use crate::models::server::{NewServer, ServerPatch, ServerSummary, ServerView};
use crate::services::executor::Executor;
use crate::services::poller::{DashboardStatus, Poller};
use crate::services::store::CredentialStore;
use askama::Template;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info};

// Templates
#[derive(Template)]
#[template(path = "dashboard.html")]
struct DashboardTemplate {
    status: DashboardStatus,
    last_refresh: String,
    servers: Vec<ServerRow>,
}

struct ServerRow {
    name: String,
    address: String,
    status: String,
    status_class: &'static str,
    os: String,
    cpu: f64,
    ram: f64,
    disk: f64,
    uptime: String,
    tags: String,
    error: String,
}

impl From<&ServerView> for ServerRow {
    fn from(view: &ServerView) -> Self {
        let state = &view.state;
        Self {
            name: view.server.name.clone(),
            address: format!("{}@{}:{}", view.server.username, view.server.hostname, view.server.port),
            status: state.status.to_string(),
            status_class: match state.status {
                ServerStatus::Online => "ok",
                ServerStatus::Warning => "warn",
                ServerStatus::Offline => "down",
                ServerStatus::Unknown => "idle",
            },
            os: state.os.clone(),
            cpu: state.metrics.cpu,
            ram: state.metrics.ram.percentage,
            disk: state.metrics.disk.percentage,
            uptime: state.metrics.uptime.clone(),
            tags: view.server.tags.join(", "),
            error: state.connection_error.clone().unwrap_or_default(),
        }
    }
}

// State
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn CredentialStore>,
    pub poller: Arc<Poller>,
    pub executor: Arc<Executor>,
}

pub fn create_app(
    store: Arc<dyn CredentialStore>,
    poller: Arc<Poller>,
    executor: Arc<Executor>,
) -> Router {
    let state = AppState {
        store,
        poller,
        executor,
    };

    Router::new()
        .route("/", get(dashboard_page))
        .route("/api/servers", get(list_servers).post(create_server))
        .route(
            "/api/servers/:id",
            get(get_server).put(update_server).delete(delete_server),
        )
        .route("/api/servers/:id/refresh", post(refresh_server))
        .route("/api/servers/:id/health", get(server_health))
        .route("/api/status", get(api_status))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Polls a record once in the background, outside the regular timer.
fn spawn_initial_poll(poller: Arc<Poller>, id: String) {
    tokio::spawn(async move {
        if let Err(e) = poller.poll_one(&id).await {
            debug!("Initial poll of {} skipped: {}", id, e);
        }
    });
}

// Routes
async fn dashboard_page(State(state): State<AppState>) -> Result<Html<String>> {
    let views = state.poller.snapshot().await?;
    let status = state.poller.status().await?;

    let template = DashboardTemplate {
        last_refresh: status
            .last_refresh
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "never".to_string()),
        status,
        servers: views.iter().map(ServerRow::from).collect(),
    };

    Ok(Html(template.render().unwrap_or_else(|e| {
        error!("Dashboard template failed: {}", e);
        "Template error".to_string()
    })))
}

async fn list_servers(State(state): State<AppState>) -> Result<Json<Vec<ServerView>>> {
    Ok(Json(state.poller.snapshot().await?))
}

async fn create_server(
    State(state): State<AppState>,
    Json(req): Json<NewServer>,
) -> Result<(StatusCode, Json<ServerSummary>)> {
    let summary = state.store.create(req).await?;
    info!("Added server {} ({})", summary.name, summary.hostname);

    spawn_initial_poll(Arc::clone(&state.poller), summary.id.clone());
    Ok((StatusCode::CREATED, Json(summary)))
}

async fn get_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ServerView>> {
    Ok(Json(state.poller.view(&id).await?))
}

async fn update_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<ServerPatch>,
) -> Result<Json<ServerSummary>> {
    let summary = state.store.update(&id, patch).await?;
    info!("Updated server {} ({})", summary.name, summary.hostname);

    spawn_initial_poll(Arc::clone(&state.poller), summary.id.clone());
    Ok(Json(summary))
}

async fn delete_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    state.store.delete(&id).await?;
    state.poller.forget(&id);
    info!("Deleted server {}", id);

    Ok(Json(json!({ "message": "Server deleted successfully" })))
}

async fn refresh_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MonitorResponse>> {
    Ok(Json(state.poller.refresh(&id).await?))
}

async fn server_health(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<HealthResponse>> {
    let target = state.store.resolve(&id).await?;
    let health = state.executor.probe_health(&target).await?;

    if let HealthResponse::Online { ip: Some(ip), .. } = &health {
        state.store.set_ip_address(&id, ip).await?;
    }
    Ok(Json(health))
}

async fn api_status(State(state): State<AppState>) -> Result<Json<DashboardStatus>> {
    Ok(Json(state.poller.status().await?))
}
