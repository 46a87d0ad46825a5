//! Local fixture servers for end-to-end scenarios: a range-capable byte
//! server with request recording, and a static map server for HLS
//! playlists, keys, and segments.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::Response;
use bytes::Bytes;
use futures::StreamExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeMode {
    /// Honor range requests with 206 slices.
    Normal,
    /// Answer ranged GETs with 200 and the full body (range HEADs still 206
    /// so the probe passes).
    IgnoreRange,
    /// Answer ranged GETs with 416 (range HEADs still 206).
    RejectRangedGet,
}

#[derive(Debug, Clone)]
pub struct RequestLog {
    pub method: String,
    pub range: Option<String>,
}

pub struct RangeServer {
    pub body: Vec<u8>,
    pub mode: RangeMode,
    /// Stream bodies in `(chunk, delay)` steps to keep transfers in flight.
    pub throttle: Option<(usize, Duration)>,
    pub requests: Mutex<Vec<RequestLog>>,
}

impl RangeServer {
    pub fn new(body: Vec<u8>, mode: RangeMode) -> Arc<Self> {
        Arc::new(Self {
            body,
            mode,
            throttle: None,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn throttled(body: Vec<u8>, mode: RangeMode, chunk: usize, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            body,
            mode,
            throttle: Some((chunk, delay)),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn get_ranges(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.method == "GET")
            .map(|r| r.range.clone().unwrap_or_default())
            .collect()
    }
}

/// Serve the range server on an ephemeral port; returns the file URL.
pub async fn spawn_range_server(state: Arc<RangeServer>) -> String {
    let app = Router::new()
        .route("/file", axum::routing::get(serve_ranged))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/file")
}

async fn serve_ranged(
    State(state): State<Arc<RangeServer>>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let range_header = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(ToOwned::to_owned);
    state.requests.lock().unwrap().push(RequestLog {
        method: method.to_string(),
        range: range_header.clone(),
    });

    let len = state.body.len() as u64;
    let is_head = method == Method::HEAD;

    if let Some(range) = range_header.as_deref() {
        if !is_head && state.mode == RangeMode::RejectRangedGet {
            return Response::builder()
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(header::CONTENT_RANGE, format!("bytes */{len}"))
                .body(Body::empty())
                .unwrap();
        }
        if is_head || state.mode == RangeMode::Normal {
            let Some((start, end)) = parse_range(range, len) else {
                return Response::builder()
                    .status(StatusCode::RANGE_NOT_SATISFIABLE)
                    .header(header::CONTENT_RANGE, format!("bytes */{len}"))
                    .body(Body::empty())
                    .unwrap();
            };
            let slice = state.body[start as usize..=end as usize].to_vec();
            return Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::ACCEPT_RANGES, "bytes")
                .header(header::CONTENT_RANGE, format!("bytes {start}-{end}/{len}"))
                .header(header::CONTENT_LENGTH, slice.len())
                .body(body_for(&state, slice))
                .unwrap();
        }
        // IgnoreRange GET falls through to a full 200.
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_LENGTH, state.body.len())
        .body(body_for(&state, state.body.clone()))
        .unwrap()
}

fn parse_range(value: &str, len: u64) -> Option<(u64, u64)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    if start >= len {
        return None;
    }
    let end: u64 = match end {
        "" => len - 1,
        e => e.parse::<u64>().ok()?.min(len - 1),
    };
    (start <= end).then_some((start, end))
}

fn body_for(state: &Arc<RangeServer>, data: Vec<u8>) -> Body {
    match state.throttle {
        None => Body::from(data),
        Some((chunk, delay)) => {
            let chunks: Vec<Bytes> = data.chunks(chunk.max(1)).map(Bytes::copy_from_slice).collect();
            let stream = futures::stream::iter(chunks).then(move |c| async move {
                tokio::time::sleep(delay).await;
                Ok::<Bytes, std::io::Error>(c)
            });
            Body::from_stream(stream)
        }
    }
}

/// Static file-map server for HLS fixtures, with per-path hit counts.
pub struct MapServer {
    pub files: HashMap<String, Vec<u8>>,
    pub hits: Mutex<HashMap<String, usize>>,
}

impl MapServer {
    pub fn new(files: HashMap<String, Vec<u8>>) -> Arc<Self> {
        Arc::new(Self {
            files,
            hits: Mutex::new(HashMap::new()),
        })
    }

    pub fn hit_count(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }
}

pub async fn spawn_map_server(state: Arc<MapServer>) -> String {
    let app = Router::new().fallback(serve_mapped).with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn serve_mapped(State(state): State<Arc<MapServer>>, uri: Uri) -> Response {
    let path = uri.path().to_owned();
    *state.hits.lock().unwrap().entry(path.clone()).or_insert(0) += 1;
    match state.files.get(&path) {
        Some(data) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, data.len())
            .body(Body::from(data.clone()))
            .unwrap(),
        None => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::empty())
            .unwrap(),
    }
}

/// Deterministic pseudo-random payload.
pub fn seeded_bytes(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| ((i as u64).wrapping_mul(31).wrapping_add(7) % 251) as u8)
        .collect()
}
