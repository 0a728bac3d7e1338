//! Pod side of every comm mode
//!
//! Serves a Rust [`Transformer`] the way a runtime launcher serves user code:
//!
//! - `hpush`/`hpull`: an axum server with `GET /health`, `PUT` on any path,
//!   `POST /pull` and `GET|DELETE /results/:id`
//! - `ws`: a framed TCP listener, one task per request frame
//! - `io`: framed stdin/stdout, strictly sequential

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use etl_common::types::ArgType;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::{Framed, FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::transport::frame::{Frame, FrameCodec, FrameKind};
use super::transport::pull::PullRequest;

/// User transform hosted by a pod.
#[async_trait]
pub trait Transformer: Send + Sync {
    /// Transform one object. An `Err` is reported to the node as a rejection.
    async fn transform(&self, input: Bytes) -> Result<Bytes, String>;
}

struct FnTransformer<F>(F);

#[async_trait]
impl<F> Transformer for FnTransformer<F>
where
    F: Fn(Bytes) -> Result<Bytes, String> + Send + Sync,
{
    async fn transform(&self, input: Bytes) -> Result<Bytes, String> {
        (self.0)(input)
    }
}

/// Wrap a synchronous function as a transformer.
pub fn from_fn<F>(f: F) -> Arc<dyn Transformer>
where
    F: Fn(Bytes) -> Result<Bytes, String> + Send + Sync + 'static,
{
    Arc::new(FnTransformer(f))
}

async fn respond(transformer: &dyn Transformer, frame: Frame) -> Frame {
    match transformer.transform(frame.payload).await {
        Ok(out) => Frame::data(frame.id, out),
        Err(message) => Frame::error(frame.id, message),
    }
}

// ============================================================================
// HTTP (push and pull)
// ============================================================================

enum PullResult {
    Pending,
    Done(Bytes),
    Failed(String),
}

/// State shared by the pod's HTTP handlers.
#[derive(Clone)]
pub struct PodState {
    transformer: Arc<dyn Transformer>,
    client: reqwest::Client,
    arg_type: ArgType,
    ready_at: Instant,
    results: Arc<Mutex<HashMap<u64, PullResult>>>,
}

impl PodState {
    pub fn new(transformer: Arc<dyn Transformer>, client: reqwest::Client, arg_type: ArgType) -> Self {
        Self {
            transformer,
            client,
            arg_type,
            ready_at: Instant::now(),
            results: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Report not-ready on `/health` until `ready_at`.
    pub fn ready_at(mut self, ready_at: Instant) -> Self {
        self.ready_at = ready_at;
        self
    }

    fn store(&self, id: u64, result: PullResult) {
        if let Ok(mut results) = self.results.lock() {
            results.insert(id, result);
        }
    }
}

pub fn http_router(state: PodState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/pull", post(pull_object))
        .route("/results/:id", get(get_result).delete(delete_result))
        .fallback(put(put_object))
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

/// Serve the pod router on `listener` until `token` is cancelled.
pub async fn serve_http(listener: TcpListener, state: PodState, token: CancellationToken) {
    let app = http_router(state);
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(token.cancelled_owned())
        .await
    {
        tracing::warn!(error = %e, "Pod HTTP server stopped");
    }
}

async fn health(State(state): State<PodState>) -> impl IntoResponse {
    if Instant::now() < state.ready_at {
        (StatusCode::SERVICE_UNAVAILABLE, "starting")
    } else {
        (StatusCode::OK, "OK")
    }
}

async fn put_object(State(state): State<PodState>, body: Bytes) -> Response {
    match state.transformer.transform(body).await {
        Ok(out) => (StatusCode::OK, out).into_response(),
        Err(message) => (StatusCode::INTERNAL_SERVER_ERROR, message).into_response(),
    }
}

async fn pull_object(State(state): State<PodState>, Json(request): Json<PullRequest>) -> StatusCode {
    state.store(request.id, PullResult::Pending);
    tokio::spawn(async move {
        let id = request.id;
        let outcome = match fetch_input(&state, request).await {
            Ok(input) => state.transformer.transform(input).await,
            Err(e) => Err(e),
        };
        let result = match outcome {
            Ok(out) => PullResult::Done(out),
            Err(message) => {
                tracing::debug!(id, %message, "Pull transfer failed");
                PullResult::Failed(message)
            },
        };
        state.store(id, result);
    });
    StatusCode::ACCEPTED
}

async fn fetch_input(state: &PodState, request: PullRequest) -> Result<Bytes, String> {
    if state.arg_type == ArgType::Url {
        return Ok(Bytes::from(request.url));
    }
    let response = state
        .client
        .get(&request.url)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    let status = response.status();
    let body = response.bytes().await.map_err(|e| e.to_string())?;
    if !status.is_success() {
        return Err(format!(
            "fetching object {} failed with {}: {}",
            request.id,
            status,
            String::from_utf8_lossy(&body)
        ));
    }
    Ok(body)
}

async fn get_result(State(state): State<PodState>, Path(id): Path<u64>) -> Response {
    let Ok(mut results) = state.results.lock() else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };
    match results.remove(&id) {
        Some(PullResult::Pending) => {
            results.insert(id, PullResult::Pending);
            StatusCode::ACCEPTED.into_response()
        },
        Some(PullResult::Done(out)) => (StatusCode::OK, out).into_response(),
        Some(PullResult::Failed(message)) => {
            (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
        },
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn delete_result(State(state): State<PodState>, Path(id): Path<u64>) -> StatusCode {
    if let Ok(mut results) = state.results.lock() {
        results.remove(&id);
    }
    StatusCode::NO_CONTENT
}

// ============================================================================
// Framed socket
// ============================================================================

/// Accept node connections until `token` is cancelled.
pub async fn serve_socket(
    listener: TcpListener,
    transformer: Arc<dyn Transformer>,
    token: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "Node connected to pod socket");
                tokio::spawn(socket_connection(stream, transformer.clone(), token.clone()));
            },
            Err(e) => tracing::warn!(error = %e, "Pod socket accept failed"),
        }
    }
}

async fn socket_connection(
    stream: TcpStream,
    transformer: Arc<dyn Transformer>,
    token: CancellationToken,
) {
    let (mut sink, mut source) = Framed::new(stream, FrameCodec::new()).split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    });

    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            next = source.next() => match next {
                Some(Ok(frame)) => frame,
                _ => break,
            },
        };
        match frame.kind {
            FrameKind::Ping => {
                let _ = tx.send(Frame::pong(frame.id));
            },
            FrameKind::Data => {
                let tx = tx.clone();
                let transformer = transformer.clone();
                tokio::spawn(async move {
                    let _ = tx.send(respond(transformer.as_ref(), frame).await);
                });
            },
            other => tracing::debug!(id = frame.id, kind = ?other, "Ignoring frame from node"),
        }
    }

    writer.abort();
}

// ============================================================================
// Stdio pipe
// ============================================================================

/// Answer frames from `input` on `output`, one at a time.
pub async fn serve_pipe<R, W>(
    input: R,
    output: W,
    transformer: Arc<dyn Transformer>,
    token: CancellationToken,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut input = FramedRead::new(input, FrameCodec::new());
    let mut output = FramedWrite::new(output, FrameCodec::new());

    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            next = input.next() => match next {
                Some(Ok(frame)) => frame,
                _ => break,
            },
        };
        let reply = match frame.kind {
            FrameKind::Ping => Frame::pong(frame.id),
            FrameKind::Data => {
                tokio::select! {
                    _ = token.cancelled() => break,
                    reply = respond(transformer.as_ref(), frame) => reply,
                }
            },
            _ => continue,
        };
        if output.send(reply).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn upper() -> Arc<dyn Transformer> {
        from_fn(|input| Ok(Bytes::from(input.to_ascii_uppercase())))
    }

    #[tokio::test]
    async fn test_put_transforms_body() {
        let app = http_router(PodState::new(upper(), reqwest::Client::new(), ArgType::Bytes));
        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/bucket/object.txt")
                    .body(Body::from("hello"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"HELLO");
    }

    #[tokio::test]
    async fn test_transform_error_is_500() {
        let failing = from_fn(|_| Err("boom".to_string()));
        let app = http_router(PodState::new(failing, reqwest::Client::new(), ArgType::Bytes));
        let response = app
            .oneshot(Request::builder().method("PUT").uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_health_waits_for_ready() {
        let state = PodState::new(upper(), reqwest::Client::new(), ArgType::Bytes)
            .ready_at(Instant::now() + std::time::Duration::from_secs(60));
        let response = http_router(state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_pull_with_url_argument() {
        let state = PodState::new(upper(), reqwest::Client::new(), ArgType::Url);
        let app = http_router(state);

        let request = Request::builder()
            .method("POST")
            .uri("/pull")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"id":7,"url":"http://node/v1/etl/objects/7"}"#))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let body = loop {
            let response = app
                .clone()
                .oneshot(Request::builder().uri("/results/7").body(Body::empty()).unwrap())
                .await
                .unwrap();
            if response.status() == StatusCode::OK {
                break axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
            }
            assert_eq!(response.status(), StatusCode::ACCEPTED);
            tokio::task::yield_now().await;
        };
        assert_eq!(&body[..], b"HTTP://NODE/V1/ETL/OBJECTS/7");

        let response = app
            .oneshot(Request::builder().uri("/results/7").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_pipe_answers_ping_and_data() {
        let (node_in, pod_in) = tokio::io::duplex(4096);
        let (pod_out, node_out) = tokio::io::duplex(4096);
        let token = CancellationToken::new();
        tokio::spawn(serve_pipe(pod_in, pod_out, upper(), token.clone()));

        let mut writer = FramedWrite::new(node_in, FrameCodec::new());
        let mut reader = FramedRead::new(node_out, FrameCodec::new());
        writer.send(Frame::ping(1)).await.unwrap();
        writer.send(Frame::data(2, Bytes::from_static(b"abc"))).await.unwrap();

        let pong = reader.next().await.unwrap().unwrap();
        assert_eq!((pong.id, pong.kind), (1, FrameKind::Pong));
        let data = reader.next().await.unwrap().unwrap();
        assert_eq!(data.id, 2);
        assert_eq!(&data.payload[..], b"ABC");

        token.cancel();
        assert!(reader.next().await.is_none());
    }
}
