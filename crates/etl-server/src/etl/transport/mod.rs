//! Node-to-pod communication channels
//!
//! A [`Channel`] is bound to exactly one pod and is the only way the node
//! exchanges object bytes with it. Each comm mode has its own implementation:
//!
//! | Mode    | Type            | Ordering                          |
//! |---------|-----------------|-----------------------------------|
//! | `hpush` | [`PushChannel`] | per request/response pair         |
//! | `hpull` | [`PullChannel`] | correlation id per staged object  |
//! | `ws`    | [`SocketChannel`] | correlation id per frame        |
//! | `io`    | [`PipeChannel`] | one transfer in flight            |
//!
//! Every blocking call is bounded by a caller-supplied timeout. A timeout is
//! reported as [`EtlError::Timeout`], never as a transport error.

pub mod frame;
pub mod pipe;
pub mod pull;
pub mod push;
pub mod stream;

use async_trait::async_trait;
use bytes::Bytes;
use etl_common::error::{EtlError, Result, TransportError, ValidationError};
use etl_common::types::{CommMode, CorrelationId};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use url::Url;

pub use pipe::PipeChannel;
pub use pull::{PullChannel, PullStaging, StageOwner};
pub use push::PushChannel;
pub use stream::SocketChannel;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Token returned by [`Channel::send`] and redeemed by [`Channel::receive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferHandle(pub CorrelationId);

impl TransferHandle {
    pub fn id(&self) -> u64 {
        self.0 .0
    }
}

impl fmt::Display for TransferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[async_trait]
pub trait Channel: Send + Sync {
    fn mode(&self) -> CommMode;

    /// Hand an object to the pod. Returns once the pod owns the bytes.
    async fn send(&self, data: Bytes) -> Result<TransferHandle>;

    /// Wait for the transformed bytes of a transfer.
    async fn receive(&self, handle: TransferHandle, timeout: Duration) -> Result<Bytes>;

    /// Abandon a transfer. Its response, if it ever arrives, is discarded.
    async fn cancel(&self, handle: TransferHandle) -> Result<()>;

    /// Readiness and liveness check.
    async fn probe(&self) -> Result<()>;

    /// Release the channel. Later calls fail with [`TransportError::Closed`].
    async fn close(&self) -> Result<()>;

    /// Send and receive one object within `timeout`.
    async fn transform(&self, data: Bytes, timeout: Duration) -> Result<Bytes> {
        let started = Instant::now();
        let handle = within(timeout, self.send(data)).await?;
        let remaining = timeout.saturating_sub(started.elapsed());
        match self.receive(handle, remaining).await {
            Err(e) if e.is_timeout() => {
                let _ = self.cancel(handle).await;
                Err(EtlError::Timeout(timeout))
            },
            other => other,
        }
    }
}

/// Run `fut` with an upper bound, mapping expiry to [`EtlError::Timeout`].
pub async fn within<T, F>(timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| EtlError::Timeout(timeout))?
}

/// Where a launched pod can be reached.
pub enum PodEndpoint {
    /// Base URL of the pod's HTTP server (push and pull modes)
    Http(Url),
    /// Framed TCP listener (socket mode)
    Socket(SocketAddr),
    /// The pod's stdin/stdout; taken by the first successful connect
    Pipe(Option<(BoxedWriter, BoxedReader)>),
}

impl PodEndpoint {
    pub fn pipe(stdin: BoxedWriter, stdout: BoxedReader) -> Self {
        PodEndpoint::Pipe(Some((stdin, stdout)))
    }

    /// Short description for status output.
    pub fn describe(&self) -> String {
        match self {
            PodEndpoint::Http(url) => url.to_string(),
            PodEndpoint::Socket(addr) => format!("tcp://{}", addr),
            PodEndpoint::Pipe(_) => "stdio".to_string(),
        }
    }
}

impl fmt::Debug for PodEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PodEndpoint").field(&self.describe()).finish()
    }
}

/// Node-side resources a channel may need besides the endpoint.
#[derive(Clone)]
pub struct ChannelContext {
    pub client: reqwest::Client,
    pub staging: Arc<PullStaging>,
    /// Base URL pods use to call back into the node
    pub node_url: Url,
    pub owner: StageOwner,
}

/// Open the channel matching `mode` to a pod endpoint.
pub async fn connect(
    mode: CommMode,
    endpoint: &mut PodEndpoint,
    ctx: &ChannelContext,
) -> Result<Arc<dyn Channel>> {
    match (mode, endpoint) {
        (CommMode::Push, PodEndpoint::Http(url)) => {
            Ok(Arc::new(PushChannel::new(ctx.client.clone(), url.clone())))
        },
        (CommMode::Pull, PodEndpoint::Http(url)) => Ok(Arc::new(PullChannel::new(
            ctx.client.clone(),
            url.clone(),
            ctx.staging.clone(),
            ctx.owner.clone(),
            ctx.node_url.clone(),
        ))),
        (CommMode::StreamingSocket, PodEndpoint::Socket(addr)) => {
            Ok(Arc::new(SocketChannel::connect(*addr).await?))
        },
        (CommMode::Pipe, PodEndpoint::Pipe(ends)) => {
            let (stdin, stdout) = ends.take().ok_or(TransportError::Closed)?;
            Ok(Arc::new(PipeChannel::new(stdin, stdout)))
        },
        (mode, endpoint) => Err(ValidationError::Incompatible(format!(
            "endpoint {} cannot carry communication type '{}'",
            endpoint.describe(),
            mode
        ))
        .into()),
    }
}

/// Map a client-side HTTP failure to a transport error.
pub(crate) fn http_failure(err: reqwest::Error) -> EtlError {
    TransportError::ConnectionLost(err.to_string()).into()
}
