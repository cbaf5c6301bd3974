//! Embedded mock HTTP server
//!
//! Replays recorded responses for hermetic runs. The wildcard route keys on
//! the `X-Test-Sheet` / `X-Test-Name` headers plus method and path, cycling
//! through a test's recorded steps call by call. Introspection routes list
//! sheets, tests and recorded steps.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{Path as AxumPath, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use testpilot_common::{Error, Result};

/// One recorded step response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedResponse {
    pub method: String,
    /// Path the original request hit; matching is prefix-tolerant so
    /// tracker-appended instance ids still hit their recording
    pub url_path: String,
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Value,
}

/// Data file layout: sheets → test names → ordered recordings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockData {
    #[serde(default)]
    pub sheets: HashMap<String, HashMap<String, Vec<RecordedResponse>>>,
}

impl MockData {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::input(format!("Cannot read mock data {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::input(format!("Malformed mock data {}: {e}", path.display())))
    }

    fn test_count(&self) -> usize {
        self.sheets.values().map(|tests| tests.len()).sum()
    }
}

struct MockState {
    data: MockData,
    /// Replay cursor per (sheet, test, method)
    cursors: Mutex<HashMap<String, usize>>,
    served: AtomicUsize,
}

type SharedState = Arc<MockState>;

pub fn router(data: MockData) -> Router {
    let state: SharedState = Arc::new(MockState {
        data,
        cursors: Mutex::new(HashMap::new()),
        served: AtomicUsize::new(0),
    });

    Router::new()
        .route("/health", get(health))
        .route("/mock/sheets", get(list_sheets))
        .route("/mock/tests", get(list_tests))
        .route("/mock/test/{sheet}/{name}", get(test_detail))
        .fallback(replay)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind an ephemeral local port and serve in the background; returns the
/// base URL. Intended for hermetic tests.
pub async fn serve_ephemeral(data: MockData) -> Result<String> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| Error::config(format!("Cannot bind mock server: {e}")))?;
    let addr = listener
        .local_addr()
        .map_err(|e| Error::config(format!("Cannot resolve mock address: {e}")))?;
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router(data)).await {
            warn!(error = %e, "mock server stopped");
        }
    });
    Ok(format!("http://{addr}"))
}

/// Serve until the process is stopped
pub async fn serve(port: u16, data: MockData) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::config(format!("Cannot bind mock server on {addr}: {e}")))?;
    info!(%addr, "mock server listening");
    axum::serve(listener, router(data))
        .await
        .map_err(|e| Error::transport(format!("Mock server error: {e}")))?;
    Ok(())
}

async fn health(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "sheets": state.data.sheets.len(),
        "tests": state.data.test_count(),
        "served": state.served.load(Ordering::Relaxed),
    }))
}

async fn list_sheets(State(state): State<SharedState>) -> Json<Value> {
    let mut sheets: Vec<&String> = state.data.sheets.keys().collect();
    sheets.sort();
    Json(json!({ "sheets": sheets }))
}

async fn list_tests(State(state): State<SharedState>) -> Json<Value> {
    let mut tests: Vec<Value> = Vec::new();
    for (sheet, sheet_tests) in &state.data.sheets {
        for (name, steps) in sheet_tests {
            tests.push(json!({
                "sheet": sheet,
                "test_name": name,
                "steps": steps.len(),
            }));
        }
    }
    tests.sort_by_key(|t| {
        (
            t["sheet"].as_str().unwrap_or("").to_string(),
            t["test_name"].as_str().unwrap_or("").to_string(),
        )
    });
    Json(json!({ "tests": tests }))
}

async fn test_detail(
    State(state): State<SharedState>,
    AxumPath((sheet, name)): AxumPath<(String, String)>,
) -> Response {
    match state
        .data
        .sheets
        .get(&sheet)
        .and_then(|tests| tests.get(&name))
    {
        Some(steps) => Json(json!({
            "sheet": sheet,
            "test_name": name,
            "steps": steps,
        }))
        .into_response(),
        None => not_found(format!("No recording for {sheet}/{name}")),
    }
}

/// Wildcard replay route
async fn replay(
    State(state): State<SharedState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let Some(sheet) = header_value(&headers, "x-test-sheet") else {
        return not_found("Missing X-Test-Sheet header".to_string());
    };
    let Some(test) = header_value(&headers, "x-test-name") else {
        return not_found("Missing X-Test-Name header".to_string());
    };

    let Some(steps) = state
        .data
        .sheets
        .get(&sheet)
        .and_then(|tests| tests.get(&test))
    else {
        warn!(%sheet, %test, "no recording for replay key");
        return not_found(format!("No recording for {sheet}/{test}"));
    };

    let path = uri.path();
    let matching: Vec<&RecordedResponse> = steps
        .iter()
        .filter(|step| step.method.eq_ignore_ascii_case(method.as_str()))
        .filter(|step| path_matches(&step.url_path, path))
        .collect();
    if matching.is_empty() {
        warn!(%sheet, %test, %method, path, "no recorded step matches");
        return not_found(format!("No recorded {method} {path} in {sheet}/{test}"));
    }

    let cursor_key = format!("{sheet}::{test}::{method}");
    let index = {
        let mut cursors = match state.cursors.lock() {
            Ok(cursors) => cursors,
            Err(poisoned) => poisoned.into_inner(),
        };
        let cursor = cursors.entry(cursor_key).or_insert(0);
        let index = *cursor % matching.len();
        *cursor += 1;
        index
    };
    let recorded = matching[index];
    state.served.fetch_add(1, Ordering::Relaxed);
    debug!(%sheet, %test, %method, path, status = recorded.status, "replaying recorded response");

    // A null body replays as an empty response (204s must carry no body)
    let mut response = if recorded.body.is_null() {
        ().into_response()
    } else {
        Json(recorded.body.clone()).into_response()
    };
    *response.status_mut() =
        StatusCode::from_u16(recorded.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    for (name, value) in &recorded.headers {
        if let (Ok(name), Ok(value)) = (
            name.parse::<HeaderName>(),
            HeaderValue::from_str(value),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
    response
}

/// Recorded paths match exactly or as a prefix of the request (the tracker
/// appends instance ids), and tolerate recordings that stored the full URL.
fn path_matches(recorded: &str, actual: &str) -> bool {
    let recorded = recorded
        .find("://")
        .and_then(|idx| recorded[idx + 3..].find('/').map(|p| &recorded[idx + 3 + p..]))
        .unwrap_or(recorded);
    actual == recorded || actual.starts_with(recorded) || recorded.starts_with(actual)
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn not_found(message: String) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response()
}
