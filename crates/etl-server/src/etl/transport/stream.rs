//! `ws`: one long-lived framed TCP connection per pod
//!
//! Requests are written as they come; a reader task matches responses to
//! waiters by correlation id, so responses may arrive in any order. Frames for
//! ids nobody waits on anymore (cancelled or timed out) are dropped.

use async_trait::async_trait;
use bytes::Bytes;
use etl_common::error::{Result, TransportError};
use etl_common::types::{CommMode, CorrelationSeq};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use super::frame::{Frame, FrameCodec, FrameKind};
use super::{within, Channel, TransferHandle};

type Reply = std::result::Result<Bytes, TransportError>;
type FrameSink = SplitSink<Framed<TcpStream, FrameCodec>, Frame>;

#[derive(Default)]
struct Waiters {
    /// Completion side, removed by the reader task
    senders: HashMap<u64, oneshot::Sender<Reply>>,
    /// Waiting side, removed by `receive`
    receivers: HashMap<u64, oneshot::Receiver<Reply>>,
    /// Set once the connection is gone; fails every later registration
    dead: Option<TransportError>,
}

/// Framed socket channel.
pub struct SocketChannel {
    sink: AsyncMutex<FrameSink>,
    waiters: Arc<Mutex<Waiters>>,
    seq: CorrelationSeq,
    reader: JoinHandle<()>,
    closed: AtomicBool,
}

impl SocketChannel {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::ConnectionLost(format!("{}: {}", addr, e)))?;
        stream.set_nodelay(true)?;
        let (sink, source) = Framed::new(stream, FrameCodec::new()).split();

        let waiters = Arc::new(Mutex::new(Waiters::default()));
        let reader = tokio::spawn(read_frames(source, waiters.clone()));

        Ok(Self {
            sink: AsyncMutex::new(sink),
            waiters,
            seq: CorrelationSeq::new(),
            reader,
            closed: AtomicBool::new(false),
        })
    }

    fn waiters(&self) -> Result<std::sync::MutexGuard<'_, Waiters>> {
        self.waiters
            .lock()
            .map_err(|_| TransportError::ConnectionLost("waiter table poisoned".into()).into())
    }

    /// Register a waiter and write the frame.
    ///
    /// The waiter goes in before the write so a fast reply always finds it;
    /// it is removed again if the write fails or the future is dropped.
    async fn submit(&self, frame: Frame) -> Result<u64> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed.into());
        }
        let id = frame.id;
        {
            let mut waiters = self.waiters()?;
            if let Some(err) = &waiters.dead {
                return Err(err.clone().into());
            }
            let (tx, rx) = oneshot::channel();
            waiters.senders.insert(id, tx);
            waiters.receivers.insert(id, rx);
        }
        let registered = Registered { channel: self, id, armed: true };

        self.sink
            .lock()
            .await
            .send(frame)
            .await
            .map_err(|e| TransportError::ConnectionLost(e.to_string()))?;
        registered.keep();
        Ok(id)
    }

    async fn wait(&self, id: u64, timeout: Duration) -> Result<Bytes> {
        let outcome = within(timeout, self.reply(id)).await;
        if outcome.is_err() {
            self.forget(id);
        }
        outcome
    }

    async fn reply(&self, id: u64) -> Result<Bytes> {
        let rx = self
            .waiters()?
            .receivers
            .remove(&id)
            .ok_or(TransportError::UnknownHandle(id))?;
        match rx.await {
            Ok(reply) => Ok(reply?),
            Err(_) => Err(TransportError::ConnectionLost("reader stopped".into()).into()),
        }
    }

    fn forget(&self, id: u64) -> bool {
        match self.waiters.lock() {
            Ok(mut waiters) => {
                let sender = waiters.senders.remove(&id).is_some();
                let receiver = waiters.receivers.remove(&id).is_some();
                sender || receiver
            },
            Err(_) => false,
        }
    }
}

/// Waiter registration that is undone unless the write went through.
struct Registered<'a> {
    channel: &'a SocketChannel,
    id: u64,
    armed: bool,
}

impl Registered<'_> {
    fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for Registered<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.channel.forget(self.id);
        }
    }
}

async fn read_frames(
    mut source: SplitStream<Framed<TcpStream, FrameCodec>>,
    waiters: Arc<Mutex<Waiters>>,
) {
    let failure = loop {
        let frame = match source.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => break TransportError::MalformedFrame(e.to_string()),
            None => break TransportError::ConnectionLost("pod closed the connection".into()),
        };

        let reply = match frame.kind {
            FrameKind::Data | FrameKind::Pong => Ok(frame.payload),
            FrameKind::Error => Err(TransportError::Rejected {
                status: 500,
                message: String::from_utf8_lossy(&frame.payload).into_owned(),
            }),
            FrameKind::Ping => {
                tracing::debug!(id = frame.id, "Ignoring ping from pod");
                continue;
            },
        };

        let sender = match waiters.lock() {
            Ok(mut w) => w.senders.remove(&frame.id),
            Err(_) => break TransportError::ConnectionLost("waiter table poisoned".into()),
        };
        match sender {
            Some(tx) => {
                let _ = tx.send(reply);
            },
            None => tracing::debug!(id = frame.id, "Dropping response for abandoned transfer"),
        }
    };

    tracing::debug!(error = %failure, "Socket reader stopped");
    if let Ok(mut w) = waiters.lock() {
        for (_, tx) in w.senders.drain() {
            let _ = tx.send(Err(failure.clone()));
        }
        w.dead = Some(failure);
    }
}

#[async_trait]
impl Channel for SocketChannel {
    fn mode(&self) -> CommMode {
        CommMode::StreamingSocket
    }

    async fn send(&self, data: Bytes) -> Result<TransferHandle> {
        let id = self.seq.next();
        self.submit(Frame::data(id.0, data)).await?;
        Ok(TransferHandle(id))
    }

    async fn receive(&self, handle: TransferHandle, timeout: Duration) -> Result<Bytes> {
        self.wait(handle.id(), timeout).await
    }

    async fn cancel(&self, handle: TransferHandle) -> Result<()> {
        self.forget(handle.id());
        Ok(())
    }

    async fn probe(&self) -> Result<()> {
        let id = self.seq.next();
        self.submit(Frame::ping(id.0)).await?;
        // Bounded by the caller
        self.reply(id.0).await.map(|_| ())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.reader.abort();
        if let Ok(mut w) = self.waiters.lock() {
            for (_, tx) in w.senders.drain() {
                let _ = tx.send(Err(TransportError::Closed));
            }
            w.receivers.clear();
            w.dead = Some(TransportError::Closed);
        }
        let _ = self.sink.lock().await.close().await;
        Ok(())
    }
}

impl Drop for SocketChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
