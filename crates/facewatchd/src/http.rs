//! HTTP surface: the multipart MJPEG stream plus event, status and source
//! endpoints.

use crate::config::Config;
use crate::consumer::ChannelConsumer;
use crate::pipeline::{Pipeline, PipelineParams};
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use facewatch_store::{summarize, window_start, EventLog, GalleryStore, SqliteStore, StoreError};
use facewatch_video::{check_source, DeviceLeases, SourceType, VideoSource};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const MULTIPART_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Frames buffered between a pipeline thread and its HTTP response.
const STREAM_BUFFER: usize = 2;

pub struct AppState {
    pub config: Config,
    pub store: Arc<SqliteStore>,
    pub pipeline: Pipeline,
    pub leases: DeviceLeases,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/live_detection", get(live_detection))
        .route("/events", get(list_events).delete(delete_all_events))
        .route("/events/:id", delete(delete_event))
        .route("/status", get(status))
        .route("/detection_config", get(detection_config))
        .route("/sources", get(list_sources))
        .route("/sources/:id/test", get(test_source))
        .with_state(state)
}

struct ApiError(StatusCode, String);

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let status = match e {
            StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            StoreError::DuplicateCode(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.0.is_server_error() {
            tracing::error!(status = %self.0, error = %self.1, "request failed");
        }
        let body = serde_json::json!({ "status": "error", "message": self.1 });
        (self.0, Json(body)).into_response()
    }
}

/// Run a store operation off the async runtime.
async fn blocking<T, F>(state: &Arc<AppState>, op: F) -> Result<T, ApiError>
where
    F: FnOnce(&SqliteStore) -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(&state.store);
    tokio::task::spawn_blocking(move || op(&store))
        .await
        .map_err(|e| ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(ApiError::from)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn detection_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "cooldown_seconds": state.config.cooldown_secs,
        "match_tolerance": state.config.match_tolerance,
    }))
}

// --- live stream ---

#[derive(Debug, Default, Deserialize)]
pub struct LiveQuery {
    pub video: Option<String>,
    pub camera_feed_id: Option<i64>,
    pub device: Option<u32>,
    pub url: Option<String>,
    pub cooldown_secs: Option<u64>,
    pub tolerance: Option<f32>,
}

/// Which origin a stream request names.
#[derive(Debug, PartialEq)]
enum Selection {
    File(String),
    Feed(i64),
    Source(VideoSource),
}

/// Validate the selector parameters. Exactly one may be given; none means
/// scanning for any working camera.
fn select(query: &LiveQuery, config: &Config) -> Result<Selection, String> {
    let given = [
        query.video.is_some(),
        query.camera_feed_id.is_some(),
        query.device.is_some(),
        query.url.is_some(),
    ]
    .iter()
    .filter(|g| **g)
    .count();
    if given > 1 {
        return Err("Specify only one video source".to_string());
    }

    if let Some(name) = &query.video {
        // Bare file names only; uploads never contain directories.
        let is_bare = std::path::Path::new(name)
            .file_name()
            .is_some_and(|f| f == name.as_str());
        if !is_bare {
            return Err("Invalid video reference".to_string());
        }
        let path = config.upload_dir.join(name);
        return Ok(Selection::File(path.to_string_lossy().into_owned()));
    }
    if let Some(id) = query.camera_feed_id {
        return Ok(Selection::Feed(id));
    }
    if let Some(index) = query.device {
        return Ok(Selection::Source(VideoSource::device(index)));
    }
    if let Some(url) = &query.url {
        return Ok(Selection::Source(VideoSource::network(url.clone())));
    }
    Ok(Selection::Source(VideoSource::any_device()))
}

async fn resolve(state: &Arc<AppState>, query: &LiveQuery) -> Result<PipelineParams, String> {
    let mut source_ref = None;
    let source = match select(query, &state.config)? {
        Selection::File(path) => {
            source_ref = std::path::Path::new(&path)
                .file_name()
                .map(|f| f.to_string_lossy().into_owned());
            VideoSource::file(path)
        }
        Selection::Source(source) => source,
        Selection::Feed(id) => {
            let record = blocking(state, move |store| store.source(id))
                .await
                .map_err(|_| format!("Video source {id} not found"))?;
            if !record.active {
                return Err(format!("Video source {id} is inactive"));
            }
            source_ref = Some(record.name.clone());
            VideoSource {
                kind: SourceType::from_registry(&record.kind),
                locator: record.locator,
                active: record.active,
            }
        }
    };

    Ok(PipelineParams {
        source,
        source_ref,
        cooldown_window: Duration::from_secs(query.cooldown_secs.unwrap_or(state.config.cooldown_secs)),
        match_tolerance: query.tolerance.unwrap_or(state.config.match_tolerance),
    })
}

/// One part of the multipart stream.
pub fn multipart_part(jpeg: &[u8]) -> Bytes {
    let mut part = Vec::with_capacity(jpeg.len() + 96);
    part.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n");
    part.extend_from_slice(format!("Content-Length: {}\r\n\r\n", jpeg.len()).as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    Bytes::from(part)
}

async fn live_detection(State(state): State<Arc<AppState>>, Query(query): Query<LiveQuery>) -> Response {
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let consumer = ChannelConsumer::new(tx);

    match resolve(&state, &query).await {
        Ok(params) => {
            if let Err(e) = state.pipeline.spawn(params, consumer) {
                return ApiError(StatusCode::SERVICE_UNAVAILABLE, format!("cannot start pipeline: {e}")).into_response();
            }
        }
        Err(message) => {
            let pipeline = state.pipeline.clone();
            tokio::task::spawn_blocking(move || {
                let mut consumer = consumer;
                pipeline.reject(&message, &mut consumer);
            });
        }
    }

    let parts = futures_util::stream::unfold(rx, |mut rx| async move {
        let frame = rx.recv().await?;
        Some((Ok::<Bytes, Infallible>(multipart_part(&frame.jpeg)), rx))
    });

    (
        [
            (header::CONTENT_TYPE, MULTIPART_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(parts),
    )
        .into_response()
}

// --- events ---

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub identity: Option<String>,
    pub since_secs: Option<u64>,
}

async fn list_events(State(state): State<Arc<AppState>>, Query(query): Query<EventsQuery>) -> Result<Response, ApiError> {
    let since = match query.since_secs {
        Some(secs) => window_start(Utc::now(), secs),
        None => DateTime::<Utc>::UNIX_EPOCH,
    };
    let events = blocking(&state, move |store| store.query_recent(query.identity.as_deref(), since)).await?;
    Ok(Json(events).into_response())
}

async fn delete_event(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Result<Response, ApiError> {
    blocking(&state, move |store| store.delete_event(id)).await?;
    Ok(Json(serde_json::json!({ "status": "success", "message": "Event deleted" })).into_response())
}

async fn delete_all_events(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let deleted = blocking(&state, |store| store.delete_all_events()).await?;
    Ok(Json(serde_json::json!({ "status": "success", "deleted": deleted })).into_response())
}

// --- status ---

async fn status(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let window = state.config.cooldown_secs;
    let report = blocking(&state, move |store| {
        let now = Utc::now();
        let identities = store.load_all_identities()?;
        let recent = store.query_recent(None, window_start(now, window))?;
        Ok(summarize(&identities, &recent, window, now))
    })
    .await?;
    Ok(Json(report).into_response())
}

// --- sources ---

async fn list_sources(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let sources = blocking(&state, |store| store.list_sources()).await?;
    Ok(Json(sources).into_response())
}

/// Open a registered source and read one frame.
async fn test_source(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Result<Response, ApiError> {
    let record = blocking(&state, move |store| store.source(id)).await?;
    let source = VideoSource {
        kind: SourceType::from_registry(&record.kind),
        locator: record.locator.clone(),
        active: record.active,
    };
    let settings = state.config.source_settings();
    let leases = state.leases.clone();
    let checked = tokio::task::spawn_blocking(move || check_source(&source, &settings, &leases))
        .await
        .map_err(|e| ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let body = match checked {
        Ok((width, height)) => serde_json::json!({
            "status": "success",
            "message": format!("Video source {} is working", record.name),
            "width": width,
            "height": height,
        }),
        Err(e) => {
            tracing::info!(id, error = %e, "source test failed");
            serde_json::json!({ "status": "error", "message": e.to_string() })
        }
    };
    Ok(Json(body).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{OnnxModels, SystemSources};
    use facewatch_core::{DetectorSettings, IdentificationEvent, SourceKind};
    use facewatch_video::Annotator;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_config(dir: &std::path::Path) -> Config {
        Config::with_data_dir(dir)
    }

    fn test_state(dir: &std::path::Path) -> Arc<AppState> {
        let config = test_config(dir);
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let leases = DeviceLeases::new();
        let pipeline = Pipeline::new(
            store.clone(),
            store.clone(),
            Arc::new(SystemSources::new(config.source_settings(), leases.clone())),
            Arc::new(OnnxModels {
                detector_path: config.detector_model_path(),
                recognizer_path: config.recognizer_model_path(),
                settings: DetectorSettings::default(),
            }),
            Arc::new(Annotator::new(config.font_path.as_deref(), config.jpeg_quality)),
        );
        Arc::new(AppState {
            config,
            store,
            pipeline,
            leases,
        })
    }

    /// Serve the router on an ephemeral port and issue one raw HTTP/1.1
    /// request; returns the full response text.
    async fn request(state: Arc<AppState>, method: &str, path: &str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let req = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(req.as_bytes()).await.unwrap();
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.unwrap();
        String::from_utf8_lossy(&raw).into_owned()
    }

    #[test]
    fn test_multipart_part_framing() {
        let part = multipart_part(&[1, 2, 3]);
        assert_eq!(
            &part[..],
            b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 3\r\n\r\n\x01\x02\x03\r\n"
        );
    }

    #[test]
    fn test_select() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let none = select(&LiveQuery::default(), &config).unwrap();
        assert_eq!(none, Selection::Source(VideoSource::any_device()));

        let device = LiveQuery { device: Some(2), ..LiveQuery::default() };
        assert_eq!(select(&device, &config).unwrap(), Selection::Source(VideoSource::device(2)));

        let video = LiveQuery { video: Some("clip.mp4".into()), ..LiveQuery::default() };
        let expected = config.upload_dir.join("clip.mp4").to_string_lossy().into_owned();
        assert_eq!(select(&video, &config).unwrap(), Selection::File(expected));

        let escape = LiveQuery { video: Some("../secret.mp4".into()), ..LiveQuery::default() };
        assert!(select(&escape, &config).is_err());

        let both = LiveQuery {
            device: Some(0),
            url: Some("rtsp://cam".into()),
            ..LiveQuery::default()
        };
        assert!(select(&both, &config).is_err());
    }

    #[tokio::test]
    async fn test_health_and_detection_config() {
        let dir = tempfile::tempdir().unwrap();
        let response = request(test_state(dir.path()), "GET", "/health").await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("\"status\":\"ok\""));

        let response = request(test_state(dir.path()), "GET", "/detection_config").await;
        assert!(response.contains("\"cooldown_seconds\":30"));
    }

    #[tokio::test]
    async fn test_events_listing_and_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let id = state
            .store
            .append(&IdentificationEvent {
                identity_name: "Alice".into(),
                timestamp: Utc::now(),
                source_kind: SourceKind::Network,
                source_ref: Some("Lobby".into()),
                confidence: 0.75,
            })
            .unwrap();

        let listed = request(state.clone(), "GET", "/events?identity=Alice&since_secs=600").await;
        assert!(listed.contains("\"identity_name\":\"Alice\""));
        assert!(listed.contains("\"source_kind\":\"network\""));

        let deleted = request(state.clone(), "DELETE", &format!("/events/{id}")).await;
        assert!(deleted.starts_with("HTTP/1.1 200"));
        let again = request(state, "DELETE", &format!("/events/{id}")).await;
        assert!(again.starts_with("HTTP/1.1 404"));
    }

    #[tokio::test]
    async fn test_events_with_huge_window_still_answers() {
        let dir = tempfile::tempdir().unwrap();
        let response = request(test_state(dir.path()), "GET", "/events?since_secs=100000000000000").await;
        assert!(response.starts_with("HTTP/1.1 200"), "got {response}");
        assert!(response.ends_with("[]"));

        let response = request(test_state(dir.path()), "GET", "/events?since_secs=18446744073709551615").await;
        assert!(response.starts_with("HTTP/1.1 200"), "got {response}");
    }

    #[tokio::test]
    async fn test_stream_without_models_sends_one_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let response = request(test_state(dir.path()), "GET", "/live_detection?video=missing.mp4").await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains(MULTIPART_CONTENT_TYPE));
        assert_eq!(response.matches("--frame\r\n").count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_feed_sends_one_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let response = request(test_state(dir.path()), "GET", "/live_detection?camera_feed_id=42").await;
        assert_eq!(response.matches("--frame\r\n").count(), 1);
    }
}
