//! HTTP surface of the daemon.
//!
//! Routes:
//! - GET  /health      - liveness
//! - POST /enroll      - multipart `name` + `files`
//! - POST /match       - multipart `file`, query `thr` and `camera`
//! - GET  /events      - sightings, newest first
//! - POST /events      - log a sighting explicitly
//! - POST /events/clear
//! - GET  /events/csv  - sightings as CSV, insertion order
//! - GET  /gallery     - enrolled names

use crate::service::{Service, ServiceError};
use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        rejection::{JsonRejection, QueryRejection},
        DefaultBodyLimit, Multipart, Query, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use turnstile_core::events::round_score;
use turnstile_core::Event;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<Service>,
    /// `thr` used by `/match` when the query omits it.
    pub default_threshold: f32,
    /// Camera used when a request does not name one.
    pub default_camera: String,
}

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/enroll", post(enroll))
        .route("/match", post(match_face))
        .route("/events", get(list_events).post(record_event))
        .route("/events/clear", post(clear_events))
        .route("/events/csv", get(export_csv))
        .route("/gallery", get(gallery))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::MissingName => return missing_field("name"),
            Self::MissingField(field) => return missing_field(field),
            Self::InvalidInput(_)
            | Self::NoUsableImages(_)
            | Self::DecodeError(_)
            | Self::NoFaceDetected
            | Self::EmptyGallery => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::ExtractionTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Storage(_) | Self::Internal(_) => {
                tracing::error!(error = %self, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// FastAPI-style validation error body.
fn missing_field(field: &str) -> Response {
    let body = json!({
        "detail": [{
            "type": "missing",
            "loc": ["body", field],
            "msg": "Field required",
            "input": null,
        }]
    });
    (StatusCode::UNPROCESSABLE_ENTITY, Json(body)).into_response()
}

impl From<MultipartError> for ServiceError {
    fn from(err: MultipartError) -> Self {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            Self::PayloadTooLarge(err.body_text())
        } else {
            Self::InvalidInput(err.body_text())
        }
    }
}

impl From<MultipartRejection> for ServiceError {
    fn from(err: MultipartRejection) -> Self {
        Self::InvalidInput(err.body_text())
    }
}

impl From<QueryRejection> for ServiceError {
    fn from(err: QueryRejection) -> Self {
        Self::InvalidInput(err.body_text())
    }
}

impl From<JsonRejection> for ServiceError {
    fn from(err: JsonRejection) -> Self {
        let text = err.body_text();
        match err {
            JsonRejection::JsonDataError(_) => match missing_json_field(&text) {
                Some(field) => Self::MissingField(field),
                None => Self::InvalidInput(text),
            },
            _ => Self::InvalidInput(text),
        }
    }
}

/// Field name from a serde "missing field `x`" message.
fn missing_json_field(message: &str) -> Option<String> {
    let rest = message.split_once("missing field `")?.1;
    let (field, _) = rest.split_once('`')?;
    Some(field.to_string())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct EnrollQuery {
    name: Option<String>,
}

#[derive(Serialize)]
struct EnrollResponse {
    enrolled: String,
    images: usize,
    people: Vec<String>,
}

async fn enroll(
    State(state): State<AppState>,
    query: Result<Query<EnrollQuery>, QueryRejection>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<EnrollResponse>, ServiceError> {
    let Query(query) = query?;
    let mut multipart = multipart?;
    let mut name = query.name;
    let mut images = Vec::new();

    while let Some(field) = multipart.next_field().await? {
        let field_name = field.name().map(str::to_owned);
        match field_name.as_deref() {
            Some("name") => name = Some(field.text().await?),
            Some("files" | "file") => images.push(field.bytes().await?.to_vec()),
            other => tracing::debug!(field = ?other, "ignoring multipart field"),
        }
    }

    let name = name.filter(|n| !n.is_empty()).ok_or(ServiceError::MissingName)?;
    let outcome = state.service.enroll(&name, images).await?;

    Ok(Json(EnrollResponse {
        enrolled: outcome.name,
        images: outcome.images,
        people: outcome.people,
    }))
}

#[derive(Deserialize)]
struct MatchQuery {
    thr: Option<f32>,
    camera: Option<String>,
}

#[derive(Serialize)]
struct BestMatch {
    name: String,
    score: f64,
    #[serde(rename = "match")]
    is_match: bool,
}

#[derive(Serialize)]
struct MatchResponse {
    scores: BTreeMap<String, f64>,
    best: BestMatch,
    thr: f32,
    logged: bool,
}

async fn match_face(
    State(state): State<AppState>,
    query: Result<Query<MatchQuery>, QueryRejection>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<MatchResponse>, ServiceError> {
    let Query(query) = query?;
    let mut multipart = multipart?;
    let mut image = None;
    while let Some(field) = multipart.next_field().await? {
        let is_image = matches!(field.name(), Some("file" | "files"));
        if is_image && image.is_none() {
            image = Some(field.bytes().await?.to_vec());
        }
    }
    let image = image.ok_or_else(|| ServiceError::MissingField("file".into()))?;

    let threshold = query.thr.unwrap_or(state.default_threshold);
    let camera = query.camera.unwrap_or(state.default_camera);
    let outcome = state.service.match_face(image, threshold, &camera).await?;
    let result = outcome.result;

    Ok(Json(MatchResponse {
        scores: result
            .scores
            .into_iter()
            .map(|(name, score)| (name, round_score(f64::from(score))))
            .collect(),
        best: BestMatch {
            name: result.best_name,
            score: round_score(f64::from(result.best_score)),
            is_match: result.is_match,
        },
        thr: outcome.threshold,
        logged: outcome.logged,
    }))
}

#[derive(Serialize)]
struct EventsResponse {
    events: Vec<Event>,
}

async fn list_events(State(state): State<AppState>) -> Json<EventsResponse> {
    Json(EventsResponse {
        events: state.service.list_events(),
    })
}

#[derive(Deserialize)]
struct RecordEventRequest {
    person: String,
    score: f64,
    camera: Option<String>,
    timestamp: Option<String>,
}

#[derive(Serialize)]
struct RecordEventResponse {
    status: &'static str,
    count: usize,
}

async fn record_event(
    State(state): State<AppState>,
    payload: Result<Json<RecordEventRequest>, JsonRejection>,
) -> Result<Json<RecordEventResponse>, ServiceError> {
    let Json(req) = payload?;
    let camera = req.camera.unwrap_or(state.default_camera);
    let outcome = state
        .service
        .record_event(&req.person, req.score, &camera, req.timestamp)
        .await?;

    Ok(Json(RecordEventResponse {
        status: if outcome.accepted {
            "logged"
        } else {
            "skipped_duplicate"
        },
        count: outcome.count,
    }))
}

async fn clear_events(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    state.service.clear_events().await?;
    Ok(Json(json!({ "status": "cleared" })))
}

async fn export_csv(State(state): State<AppState>) -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (header::CONTENT_DISPOSITION, "attachment; filename=events.csv"),
        ],
        state.service.export_events_csv(),
    )
}

async fn gallery(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "people": state.service.people() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{seed_gallery, service_in, service_with, StubExtractor};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    const BOUNDARY: &str = "turnstile-test-boundary";

    fn app(dir: &std::path::Path) -> Router {
        app_with(service_in(dir), 1024 * 1024)
    }

    fn app_with(service: Arc<Service>, max_upload_bytes: usize) -> Router {
        let state = AppState {
            service,
            default_threshold: 0.45,
            default_camera: "simulator".into(),
        };
        router(state, max_upload_bytes)
    }

    /// Build a multipart body from `(field, filename, data)` parts.
    fn multipart(parts: &[(&str, Option<&str>, &[u8])]) -> Body {
        let mut body = Vec::new();
        for (field, filename, data) in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match filename {
                Some(file) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{field}\"; filename=\"{file}\"\r\n\
                         Content-Type: application/octet-stream\r\n\r\n"
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{field}\"\r\n\r\n").as_bytes(),
                ),
            }
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        Body::from(body)
    }

    fn multipart_request(uri: &str, parts: &[(&str, Option<&str>, &[u8])]) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(multipart(parts))
            .unwrap()
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes().to_vec();
        (status, body)
    }

    async fn send_json(app: &Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let (status, body) = send(app, req).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn enroll_alice(app: &Router) {
        let req = multipart_request(
            "/enroll",
            &[("name", None, b"alice"), ("files", Some("a.jpg"), b"1,0,0")],
        );
        let (status, _) = send(app, req).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health() {
        let dir = tempfile::tempdir().unwrap();
        let (status, body) = send_json(&app(dir.path()), get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "ok" }));
    }

    #[tokio::test]
    async fn test_enroll_response() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());
        let req = multipart_request(
            "/enroll",
            &[
                ("name", None, b"alice"),
                ("files", Some("a.jpg"), b"1,0,0"),
                ("files", Some("b.jpg"), b"blank"),
            ],
        );
        let (status, body) = send_json(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "enrolled": "alice", "images": 1, "people": ["alice"] }));
    }

    #[tokio::test]
    async fn test_enroll_name_from_query() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());
        let req = multipart_request("/enroll?name=bob", &[("files", Some("a.jpg"), b"0,1")]);
        let (status, body) = send_json(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["enrolled"], "bob");
    }

    #[tokio::test]
    async fn test_enroll_missing_name_is_422() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());
        let req = multipart_request("/enroll", &[("files", Some("a.jpg"), b"1,0,0")]);
        let (status, body) = send_json(&app, req).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["detail"][0]["type"], "missing");
        assert_eq!(body["detail"][0]["loc"], json!(["body", "name"]));
    }

    #[tokio::test]
    async fn test_enroll_no_usable_images_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());
        let req = multipart_request(
            "/enroll",
            &[("name", None, b"alice"), ("files", Some("a.jpg"), b"blank")],
        );
        let (status, body) = send_json(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("no usable images"));
    }

    #[tokio::test]
    async fn test_match_empty_gallery_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());
        let req = multipart_request("/match", &[("file", Some("q.jpg"), b"1,0,0")]);
        let (status, body) = send_json(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "error": "gallery empty, enroll first" }));
    }

    #[tokio::test]
    async fn test_match_response_and_debounced_log() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());
        enroll_alice(&app).await;

        let req = multipart_request("/match?camera=door", &[("file", Some("q.jpg"), b"1,0,0")]);
        let (status, body) = send_json(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["scores"], json!({ "alice": 1.0 }));
        assert_eq!(body["best"], json!({ "name": "alice", "score": 1.0, "match": true }));
        assert_eq!(body["logged"], true);

        let req = multipart_request("/match?camera=door", &[("file", Some("q.jpg"), b"1,0,0")]);
        let (_, body) = send_json(&app, req).await;
        assert_eq!(body["logged"], false);

        let (_, body) = send_json(&app, get("/events")).await;
        let events = body["events"].as_array().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["camera"], "door");
        assert_eq!(events[0]["person"], "alice");
    }

    #[tokio::test]
    async fn test_match_below_threshold_then_explicit_event() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());
        enroll_alice(&app).await;

        let req = multipart_request("/match?thr=0.9", &[("file", Some("q.jpg"), b"0.6,0.8,0")]);
        let (status, body) = send_json(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["best"]["match"], false);
        assert_eq!(body["best"]["score"], 0.6);
        assert_eq!(body["logged"], false);

        let req = json_request("POST", "/events", json!({ "person": "unknown", "score": 0.6 }));
        let (status, body) = send_json(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "logged", "count": 1 }));

        let (_, body) = send_json(&app, get("/events")).await;
        assert_eq!(body["events"][0]["camera"], "simulator");
    }

    #[tokio::test]
    async fn test_match_no_face_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());
        enroll_alice(&app).await;

        let req = multipart_request("/match", &[("file", Some("q.jpg"), b"blank")]);
        let (status, body) = send_json(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "error": "No face detected" }));
    }

    #[tokio::test]
    async fn test_post_events_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());

        let event = json!({
            "person": "bob",
            "score": 0.81,
            "camera": "cam1",
            "timestamp": "2024-05-01T10:00:00"
        });
        let (_, body) = send_json(&app, json_request("POST", "/events", event.clone())).await;
        assert_eq!(body, json!({ "status": "logged", "count": 1 }));
        let (_, body) = send_json(&app, json_request("POST", "/events", event)).await;
        assert_eq!(body, json!({ "status": "skipped_duplicate", "count": 1 }));
    }

    #[tokio::test]
    async fn test_csv_export() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());
        let event = json!({ "person": "bob", "score": 0.81, "camera": "cam1", "timestamp": "T1" });
        // "T1" is not a parseable timestamp.
        let (status, _) = send(&app, json_request("POST", "/events", event)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let event = json!({
            "person": "bob",
            "score": 0.81,
            "camera": "cam1",
            "timestamp": "2024-05-01T10:00:00Z"
        });
        send(&app, json_request("POST", "/events", event)).await;

        let resp = app.clone().oneshot(get("/events/csv")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=events.csv"
        );
        assert!(resp.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/csv"));
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(
            &body[..],
            b"timestamp,camera,person,score\r\n2024-05-01T10:00:00Z,cam1,bob,0.81\r\n"
        );
    }

    #[tokio::test]
    async fn test_clear_events() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());
        send(&app, json_request("POST", "/events", json!({ "person": "bob", "score": 0.5 }))).await;

        let req = json_request("POST", "/events/clear", json!({}));
        let (status, body) = send_json(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "cleared" }));

        let (_, body) = send_json(&app, get("/events")).await;
        assert_eq!(body, json!({ "events": [] }));
    }

    #[tokio::test]
    async fn test_gallery_lists_people() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());
        enroll_alice(&app).await;
        let req = multipart_request("/enroll?name=aaron", &[("files", Some("a.jpg"), b"0,1,0")]);
        send(&app, req).await;

        let (_, body) = send_json(&app, get("/gallery")).await;
        assert_eq!(body, json!({ "people": ["aaron", "alice"] }));
    }

    #[tokio::test]
    async fn test_event_missing_field_is_422_detail() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());

        let req = json_request("POST", "/events", json!({ "score": 0.5 }));
        let (status, body) = send_json(&app, req).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["detail"][0]["type"], "missing");
        assert_eq!(body["detail"][0]["loc"], json!(["body", "person"]));
    }

    #[tokio::test]
    async fn test_event_bad_json_is_400_error() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());

        let req = Request::builder()
            .method("POST")
            .uri("/events")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = send_json(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let req = json_request("POST", "/events", json!({ "person": "bob", "score": "high" }));
        let (status, body) = send_json(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_match_bad_threshold_is_400_error() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());
        enroll_alice(&app).await;

        let req = multipart_request("/match?thr=abc", &[("file", Some("q.jpg"), b"1,0,0")]);
        let (status, body) = send_json(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
        assert!(send_json(&app, get("/events")).await.1["events"]
            .as_array()
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_match_without_multipart_is_400_error() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());

        let req = json_request("POST", "/match", json!({}));
        let (status, body) = send_json(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_oversized_upload_is_413() {
        let dir = tempfile::tempdir().unwrap();
        let app = app_with(service_in(dir.path()), 256);

        let big = vec![b'1'; 4096];
        let req = multipart_request(
            "/enroll",
            &[("name", None, b"alice"), ("files", Some("a.jpg"), big.as_slice())],
        );
        let (status, body) = send_json(&app, req).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_slow_extraction_is_503() {
        let dir = tempfile::tempdir().unwrap();
        seed_gallery(dir.path(), "alice", &[1.0, 0.0, 0.0]);
        let slow = StubExtractor {
            delay: Duration::from_millis(500),
        };
        let app = app_with(
            service_with(dir.path(), slow, Duration::from_millis(50)),
            1024 * 1024,
        );

        let req = multipart_request("/match", &[("file", Some("q.jpg"), b"1,0,0")]);
        let (status, body) = send_json(&app, req).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].as_str().unwrap().contains("timed out"));
    }
}
