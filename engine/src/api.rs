// --- HTTP command surface ---------------------------------------------------
//
// Thin axum layer over the store and the coordinator. Handlers never hold a
// store lock on the async runtime; everything goes through `Store::run`.

use std::collections::HashMap;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::info;

use crate::catalog::exists_on_disk;
use crate::db::Store;
use crate::error::PlayoutError;
use crate::hub::WsHub;
use crate::library::{scan_directory, ScanMode};
use crate::player::Coordinator;
use crate::probe::probe_file;

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 1000;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub coordinator: Arc<Coordinator>,
    pub hub: WsHub,
    pub ffprobe: String,
}

/// `PlayoutError` rendered as `{"ok": false, "reason", "error"}`.
#[derive(Debug)]
pub struct ApiError(pub PlayoutError);

impl From<PlayoutError> for ApiError {
    fn from(e: PlayoutError) -> Self {
        Self(e)
    }
}

pub(crate) fn status_for(err: &PlayoutError) -> StatusCode {
    match err {
        PlayoutError::NotCataloged(_) | PlayoutError::NotFound(_) | PlayoutError::FileMissing(_) => {
            StatusCode::NOT_FOUND
        }
        PlayoutError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        PlayoutError::AlreadyRunning
        | PlayoutError::NotRunning
        | PlayoutError::NothingPlaying
        | PlayoutError::NoPlayableContent(_) => StatusCode::CONFLICT,
        PlayoutError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        PlayoutError::SubprocessFailure(_) => StatusCode::BAD_GATEWAY,
        PlayoutError::Io(_) | PlayoutError::Database(_) | PlayoutError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!(reason = self.0.reason(), "request failed: {}", self.0);
        }
        let body = Json(json!({
            "ok": false,
            "reason": self.0.reason(),
            "error": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

type ApiResult = Result<Json<serde_json::Value>, ApiError>;

pub fn build_router(state: AppState, output_dir: &FsPath) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_upgrade))
        .route("/stream/start", post(stream_start))
        .route("/stream/stop", post(stream_stop))
        .route("/stream/next", post(stream_next))
        .route("/stream/add", post(stream_add))
        .route("/stream/inject-ad", post(stream_inject_ad))
        .route("/stream/queue", get(stream_queue))
        .route("/stream/status", get(stream_status))
        .route("/stream/history", get(stream_history))
        .route("/stream/scan", post(stream_scan))
        .route("/stream/clear-played", post(stream_clear_played))
        .route("/schedule", get(schedule_list))
        .route("/schedule/add", post(schedule_add))
        .route("/schedule/remove", delete(schedule_remove))
        .route("/schedule/item/:id", delete(schedule_remove_item))
        .route("/schedule/reorder", post(schedule_reorder))
        .route("/schedule/clear", post(schedule_clear))
        .route("/schedule/reset", post(schedule_reset))
        .route("/files", get(files_list))
        .route("/files/:id", get(files_get).delete(files_delete))
        .route("/files/:id/description", post(files_set_description))
        .route("/files/:id/active", post(files_set_active))
        .route("/files/:id/probe", post(files_reprobe));

    Router::new()
        .nest("/api", api)
        .nest_service("/stream", ServeDir::new(output_dir))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"ok": true, "status": "healthy"}))
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| hub.serve_socket(socket))
}

// --- Stream / queue ---------------------------------------------------------

/// Either a filesystem path (`file`) or a catalog id (`file_id`).
#[derive(Debug, Default, Deserialize)]
struct FileRef {
    file: Option<String>,
    file_id: Option<String>,
}

enum FileTarget {
    Id(String),
    Path(PathBuf),
}

impl FileRef {
    fn target(self) -> Result<FileTarget, PlayoutError> {
        match (self.file_id, self.file) {
            (Some(id), _) if !id.trim().is_empty() => Ok(FileTarget::Id(id)),
            (_, Some(path)) if !path.trim().is_empty() => Ok(FileTarget::Path(PathBuf::from(path))),
            _ => Err(PlayoutError::InvalidInput(
                "either `file` or `file_id` is required".into(),
            )),
        }
    }
}

async fn stream_start(State(state): State<AppState>) -> ApiResult {
    state.coordinator.start().await?;
    Ok(Json(json!({"ok": true})))
}

async fn stream_stop(State(state): State<AppState>) -> ApiResult {
    state.coordinator.stop().await?;
    Ok(Json(json!({"ok": true})))
}

async fn stream_next(State(state): State<AppState>) -> ApiResult {
    let skipped = state.coordinator.skip().await?;
    Ok(Json(json!({"ok": true, "skipped": skipped})))
}

async fn enqueue(state: &AppState, file: FileRef, is_ad: bool) -> ApiResult {
    let item = state
        .store
        .run(move |s| match file.target()? {
            FileTarget::Id(id) => s.queue().enqueue(&id, is_ad),
            FileTarget::Path(path) => s.queue().enqueue_path(&path, is_ad),
        })
        .await?;
    Ok(Json(json!({"ok": true, "item": item})))
}

async fn stream_add(State(state): State<AppState>, Query(file): Query<FileRef>) -> ApiResult {
    enqueue(&state, file, false).await
}

async fn stream_inject_ad(State(state): State<AppState>, Query(file): Query<FileRef>) -> ApiResult {
    enqueue(&state, file, true).await
}

async fn stream_queue(State(state): State<AppState>) -> ApiResult {
    let (items, pending) = state
        .store
        .run(|s| Ok((s.queue().list()?, s.queue().pending_count()?)))
        .await?;
    Ok(Json(json!({"ok": true, "pending": pending, "items": items})))
}

async fn stream_status(State(state): State<AppState>) -> ApiResult {
    let status = state.coordinator.status().await;
    let pending = state.store.run(|s| s.queue().pending_count()).await?;
    Ok(Json(json!({
        "ok": true,
        "status": status,
        "pending": pending,
        "ws_clients": state.hub.client_count(),
    })))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

pub(crate) fn clamp_history_limit(limit: Option<usize>) -> usize {
    limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT)
}

async fn stream_history(State(state): State<AppState>, Query(q): Query<HistoryQuery>) -> ApiResult {
    let limit = clamp_history_limit(q.limit);
    let records = state.store.run(move |s| s.history().recent(limit)).await?;
    Ok(Json(json!({"ok": true, "history": records})))
}

#[derive(Debug, Deserialize)]
struct ScanQuery {
    directory: Option<String>,
    /// Comma separated, e.g. `mp4,ts`.
    extensions: Option<String>,
}

pub(crate) fn split_extensions(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

async fn stream_scan(State(state): State<AppState>, Query(q): Query<ScanQuery>) -> ApiResult {
    let directory = q
        .directory
        .filter(|d| !d.trim().is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| PlayoutError::InvalidInput("`directory` is required".into()))?;
    let extensions = split_extensions(q.extensions.as_deref());
    let ffprobe = state.ffprobe.clone();

    let report = state
        .store
        .run(move |s| {
            scan_directory(s, &directory, &extensions, ScanMode::CatalogAndQueue, |p| {
                probe_file(&ffprobe, p)
            })
        })
        .await?;
    Ok(Json(json!({"ok": true, "added": report.queued, "report": report})))
}

async fn stream_clear_played(State(state): State<AppState>) -> ApiResult {
    let removed = state.store.run(|s| s.queue().clear_played()).await?;
    Ok(Json(json!({"ok": true, "removed": removed})))
}

// --- Schedule ---------------------------------------------------------------

async fn schedule_list(State(state): State<AppState>) -> ApiResult {
    let items = state.store.run(|s| s.schedule().list()).await?;
    Ok(Json(json!({"ok": true, "items": items})))
}

async fn schedule_add(State(state): State<AppState>, Query(file): Query<FileRef>) -> ApiResult {
    let item = state
        .store
        .run(move |s| {
            let id = match file.target()? {
                FileTarget::Id(id) => id,
                FileTarget::Path(path) => s.catalog().id_for_path(&path)?,
            };
            s.schedule().add(&id)
        })
        .await?;
    Ok(Json(json!({"ok": true, "item": item})))
}

#[derive(Debug, Deserialize)]
struct RemoveQuery {
    file_id: String,
}

async fn schedule_remove(State(state): State<AppState>, Query(q): Query<RemoveQuery>) -> ApiResult {
    let item = state.store.run(move |s| s.schedule().remove(&q.file_id)).await?;
    Ok(Json(json!({"ok": true, "removed": item})))
}

async fn schedule_remove_item(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let item = state.store.run(move |s| s.schedule().remove_by_id(id)).await?;
    Ok(Json(json!({"ok": true, "removed": item})))
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ReorderReq {
    Single { id: i64, position: i64 },
    Bulk { positions: HashMap<String, i64> },
}

/// JSON object keys are strings; schedule ids are integers.
pub(crate) fn parse_positions(raw: HashMap<String, i64>) -> Result<HashMap<i64, i64>, PlayoutError> {
    raw.into_iter()
        .map(|(k, v)| {
            k.trim()
                .parse::<i64>()
                .map(|id| (id, v))
                .map_err(|_| PlayoutError::InvalidInput(format!("schedule id {k:?} is not an integer")))
        })
        .collect()
}

async fn schedule_reorder(State(state): State<AppState>, Json(req): Json<ReorderReq>) -> ApiResult {
    match req {
        ReorderReq::Single { id, position } => {
            let item = state.store.run(move |s| s.schedule().reorder(id, position)).await?;
            Ok(Json(json!({"ok": true, "item": item})))
        }
        ReorderReq::Bulk { positions } => {
            let positions = parse_positions(positions)?;
            let items = state
                .store
                .run(move |s| {
                    s.schedule().bulk_reorder(&positions)?;
                    s.schedule().list()
                })
                .await?;
            Ok(Json(json!({"ok": true, "items": items})))
        }
    }
}

async fn schedule_clear(State(state): State<AppState>) -> ApiResult {
    let removed = state.store.run(|s| s.schedule().clear()).await?;
    Ok(Json(json!({"ok": true, "removed": removed})))
}

async fn schedule_reset(State(state): State<AppState>) -> ApiResult {
    state.store.run(|s| s.schedule().reset()).await?;
    Ok(Json(json!({"ok": true})))
}

// --- Catalog ----------------------------------------------------------------

async fn files_list(State(state): State<AppState>) -> ApiResult {
    let files = state.store.run(|s| s.catalog().list()).await?;
    Ok(Json(json!({"ok": true, "files": files})))
}

async fn files_get(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let entry = state
        .store
        .run(move |s| {
            s.catalog()
                .get(&id)?
                .ok_or_else(|| PlayoutError::NotFound(format!("catalog entry {id}")))
        })
        .await?;
    Ok(Json(json!({"ok": true, "file": entry})))
}

async fn files_delete(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let entry = state.store.run(move |s| s.catalog().delete(&id)).await?;
    info!(file_id = %entry.id, "catalog entry deleted via api");
    Ok(Json(json!({"ok": true, "deleted": entry})))
}

#[derive(Debug, Deserialize)]
struct DescriptionReq {
    description: String,
}

async fn files_set_description(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<DescriptionReq>,
) -> ApiResult {
    state
        .store
        .run(move |s| s.catalog().set_description(&id, &req.description))
        .await?;
    Ok(Json(json!({"ok": true})))
}

#[derive(Debug, Deserialize)]
struct ActiveReq {
    active: bool,
}

async fn files_set_active(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ActiveReq>,
) -> ApiResult {
    state
        .store
        .run(move |s| s.catalog().set_active(&id, req.active))
        .await?;
    Ok(Json(json!({"ok": true})))
}

/// Run ffprobe again and store the fresh metadata.
async fn files_reprobe(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let ffprobe = state.ffprobe.clone();
    let entry = state
        .store
        .run(move |s| {
            let entry = s
                .catalog()
                .get(&id)?
                .ok_or_else(|| PlayoutError::NotFound(format!("catalog entry {id}")))?;
            if !exists_on_disk(&entry.path) {
                return Err(PlayoutError::FileMissing(entry.path));
            }
            let probed = probe_file(&ffprobe, FsPath::new(&entry.path));
            s.catalog().update_probe(&id, &probed)?;
            s.catalog()
                .get(&id)?
                .ok_or_else(|| PlayoutError::NotFound(format!("catalog entry {id}")))
        })
        .await?;
    info!(file_id = %entry.id, duration_seconds = entry.duration_seconds, "file re-probed");
    Ok(Json(json!({"ok": true, "file": entry})))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Method, Request};
    use tower::ServiceExt;

    use super::*;
    use crate::catalog::test_support::cataloged_file;
    use crate::events::NoopEventSink;
    use crate::feeder::{Feeder, FeederConfig, TranscoderCommand};
    use crate::player::PlayoutSettings;

    fn app(store: &Store, out: &FsPath) -> Router {
        app_with_ffprobe(store, out, "ffprobe")
    }

    fn app_with_ffprobe(store: &Store, out: &FsPath, ffprobe: &str) -> Router {
        let cfg = FeederConfig {
            command: TranscoderCommand::new("cat", Vec::<String>::new()),
            output_dir: None,
            progress_deadline: std::time::Duration::from_secs(5),
            send_timeout: std::time::Duration::from_secs(1),
            stop_grace: std::time::Duration::from_millis(200),
        };
        let coordinator = Coordinator::new(
            store.clone(),
            Arc::new(Feeder::new(cfg)),
            Arc::new(NoopEventSink),
            PlayoutSettings::default(),
        );
        build_router(
            AppState {
                store: store.clone(),
                coordinator: Arc::new(coordinator),
                hub: WsHub::new(16),
                ffprobe: ffprobe.into(),
            },
            out,
        )
    }

    async fn call(app: Router, method: Method, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                req = req.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[test]
    fn error_statuses() {
        assert_eq!(status_for(&PlayoutError::NotCataloged("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&PlayoutError::InvalidInput("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&PlayoutError::NothingPlaying), StatusCode::CONFLICT);
        assert_eq!(status_for(&PlayoutError::Timeout("x".into())), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            status_for(&PlayoutError::Internal("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn history_limit_is_clamped() {
        assert_eq!(clamp_history_limit(None), 50);
        assert_eq!(clamp_history_limit(Some(0)), 1);
        assert_eq!(clamp_history_limit(Some(5000)), 1000);
    }

    #[test]
    fn extension_lists_and_position_keys() {
        assert_eq!(split_extensions(Some("mp4, ts,,")), vec!["mp4", "ts"]);
        assert!(split_extensions(None).is_empty());

        let ok = parse_positions(HashMap::from([("3".to_string(), 0)])).unwrap();
        assert_eq!(ok.get(&3), Some(&0));
        let err = parse_positions(HashMap::from([("three".to_string(), 0)])).unwrap_err();
        assert_eq!(err.reason(), "invalid_input");
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let out = tempfile::TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let (status, body) = call(app(&store, out.path()), Method::GET, "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn adding_an_uncataloged_file_is_not_found() {
        let out = tempfile::TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let (status, body) = call(
            app(&store, out.path()),
            Method::POST,
            "/api/stream/add?file=/nowhere/missing.ts",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["ok"], false);
        assert_eq!(body["reason"], "not_cataloged");
    }

    #[tokio::test]
    async fn ad_injection_lands_at_the_front_of_the_queue() {
        let out = tempfile::TempDir::new().unwrap();
        let media = tempfile::TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let show = cataloged_file(&store, media.path(), "show.ts", 64);
        let ad = cataloged_file(&store, media.path(), "ad.ts", 64);

        let (status, _) = call(
            app(&store, out.path()),
            Method::POST,
            &format!("/api/stream/add?file_id={}", show.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(
            app(&store, out.path()),
            Method::POST,
            &format!("/api/stream/inject-ad?file={}", ad.path),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = call(app(&store, out.path()), Method::GET, "/api/stream/queue", None).await;
        assert_eq!(body["pending"], 2);
        assert_eq!(body["items"][0]["catalog_id"], ad.id.as_str());
        assert_eq!(body["items"][0]["is_ad"], true);
    }

    #[tokio::test]
    async fn skip_with_nothing_playing_conflicts() {
        let out = tempfile::TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let (status, body) = call(app(&store, out.path()), Method::POST, "/api/stream/next", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["reason"], "nothing_playing");
    }

    #[tokio::test]
    async fn schedule_bulk_reorder_and_item_removal() {
        let out = tempfile::TempDir::new().unwrap();
        let media = tempfile::TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let a = cataloged_file(&store, media.path(), "a.ts", 8);
        let b = cataloged_file(&store, media.path(), "b.ts", 8);
        let ia = store.schedule().add(&a.id).unwrap();
        let ib = store.schedule().add(&b.id).unwrap();

        let (status, body) = call(
            app(&store, out.path()),
            Method::POST,
            "/api/schedule/reorder",
            Some(json!({"positions": {ib.id.to_string(): 0, ia.id.to_string(): 1}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["items"][0]["catalog_id"], b.id.as_str());

        let (status, _) = call(
            app(&store, out.path()),
            Method::DELETE,
            &format!("/api/schedule/item/{}", ib.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let remaining = store.schedule().list().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].position, 0);
    }

    #[tokio::test]
    async fn file_metadata_updates() {
        let out = tempfile::TempDir::new().unwrap();
        let media = tempfile::TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let f = cataloged_file(&store, media.path(), "promo.ts", 8);

        let (status, _) = call(
            app(&store, out.path()),
            Method::POST,
            &format!("/api/files/{}/description", f.id),
            Some(json!({"description": "station promo"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(
            app(&store, out.path()),
            Method::POST,
            &format!("/api/files/{}/active", f.id),
            Some(json!({"active": true})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = call(app(&store, out.path()), Method::GET, &format!("/api/files/{}", f.id), None).await;
        assert_eq!(body["file"]["description"], "station promo");
        assert_eq!(body["file"]["active"], true);

        let (status, _) = call(app(&store, out.path()), Method::GET, "/api/files/unknown", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metadata_refresh_updates_duration_and_rejects_missing_files() {
        let out = tempfile::TempDir::new().unwrap();
        let media = tempfile::TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let f = cataloged_file(&store, media.path(), "clip.ts", 8);
        store
            .catalog()
            .update_probe(&f.id, &crate::probe::ProbeData::with_duration(30))
            .unwrap();

        // An unusable ffprobe yields unknown metadata, which replaces the old values.
        let (status, body) = call(
            app_with_ffprobe(&store, out.path(), "/nonexistent/ffprobe"),
            Method::POST,
            &format!("/api/files/{}/probe", f.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["file"]["duration_seconds"], 0);
        assert_eq!(store.catalog().get(&f.id).unwrap().unwrap().duration_seconds, 0);

        std::fs::remove_file(&f.path).unwrap();
        let (status, body) = call(
            app(&store, out.path()),
            Method::POST,
            &format!("/api/files/{}/probe", f.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["reason"], "file_missing");
    }

    #[tokio::test]
    async fn hls_output_is_served_from_the_output_dir() {
        let out = tempfile::TempDir::new().unwrap();
        std::fs::write(out.path().join("stream.m3u8"), "#EXTM3U\n").unwrap();
        let store = Store::open_in_memory().unwrap();

        let resp = app(&store, out.path())
            .oneshot(Request::get("/stream/stream.m3u8").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
