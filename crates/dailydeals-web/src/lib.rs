//! Axum + Askama surface for DailyDeals: webhook endpoints, gallery page and image bytes.

use std::sync::Arc;

use anyhow::Context;
use askama::Template;
use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::Utc;
use dailydeals_core::{GalleryItem, GalleryQuery, DEFAULT_MIME_TYPE};
use dailydeals_ingest::{DealsConfig, IngestPipeline};
use dailydeals_storage::{DealStore, MediaSource};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DealStore>,
    pub pipeline: IngestPipeline,
    pub verify_token: Option<String>,
    pub app_title: String,
    pub days_to_show: i64,
    pub max_items: i64,
}

impl AppState {
    pub fn new(config: &DealsConfig, store: Arc<dyn DealStore>, media: Arc<dyn MediaSource>) -> Self {
        Self {
            pipeline: IngestPipeline::new(store.clone(), media),
            store,
            verify_token: config.verify_token.clone(),
            app_title: config.app_title.clone(),
            days_to_show: config.days_to_show,
            max_items: config.max_items,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct VerifyQuery {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

#[derive(Template)]
#[template(path = "gallery.html")]
struct GalleryTemplate {
    title: String,
    days: i64,
    items: Vec<GalleryItem>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(gallery_handler))
        .route("/health", get(health_handler))
        .route("/webhook", get(verify_handler).post(receive_handler))
        .route("/img/{id}", get(image_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, host: &str, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind((host, port))
        .await
        .with_context(|| format!("binding {host}:{port}"))?;
    info!(addr = %listener.local_addr()?, "dailydeals listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving http")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn verify_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<VerifyQuery>, QueryRejection>,
) -> Response {
    let Ok(Query(query)) = query else {
        warn!("webhook verification query is malformed");
        return (StatusCode::FORBIDDEN, "forbidden").into_response();
    };
    let token_matches = match (&state.verify_token, &query.verify_token) {
        (Some(expected), Some(given)) => expected == given,
        _ => false,
    };
    if query.mode.as_deref() == Some("subscribe") && token_matches {
        return (StatusCode::OK, query.challenge.unwrap_or_default()).into_response();
    }
    warn!(mode = ?query.mode, "webhook verification rejected");
    (StatusCode::FORBIDDEN, "forbidden").into_response()
}

/// Acknowledges every JSON body once processed; per-message failures stay in the logs
/// so the platform does not redeliver.
async fn receive_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let value: JsonValue = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            warn!(error = %err, byte_size = body.len(), "webhook body is not json");
            return (StatusCode::BAD_REQUEST, "invalid json").into_response();
        }
    };
    state.pipeline.ingest_json(value).await;
    (StatusCode::OK, "ok").into_response()
}

async fn gallery_handler(State(state): State<Arc<AppState>>) -> Response {
    let query = GalleryQuery::last_days(Utc::now(), state.days_to_show, state.max_items);
    match state.store.list_gallery(query).await {
        Ok(rows) => render_html(GalleryTemplate {
            title: state.app_title.clone(),
            days: state.days_to_show,
            items: rows.into_iter().map(GalleryItem::from).collect(),
        }),
        Err(err) => {
            error!(error = %err, "failed to load gallery");
            server_error()
        }
    }
}

async fn image_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let Ok(id) = id.parse::<i64>() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match state.store.image_by_id(id).await {
        Ok(Some(media)) => {
            let content_type = HeaderValue::from_str(&media.mime_type)
                .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_MIME_TYPE));
            ([(header::CONTENT_TYPE, content_type)], media.bytes).into_response()
        }
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            error!(deal_id = id, error = %err, "failed to load image");
            server_error()
        }
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => {
            error!(error = %err, "template render failed");
            server_error()
        }
    }
}

fn server_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html("Erro interno".to_string()),
    )
        .into_response()
}
