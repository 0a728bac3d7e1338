//! `io`: framed exchange over the pod's stdin/stdout
//!
//! There is one stream in each direction and no multiplexing on the pod side,
//! so only one transfer may be in flight. A transfer that is cancelled or
//! times out keeps the slot until its response has been read off the pipe;
//! the next transfer never sees a stale frame.

use async_trait::async_trait;
use bytes::Bytes;
use etl_common::error::{EtlError, Result, TransportError};
use etl_common::types::{CommMode, CorrelationSeq};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::frame::{Frame, FrameCodec, FrameKind};
use super::{within, BoxedReader, BoxedWriter, Channel, TransferHandle};

type Reader = Arc<AsyncMutex<FramedRead<BoxedReader, FrameCodec>>>;

struct InFlight {
    id: u64,
    permit: OwnedSemaphorePermit,
}

/// Stdio pipe channel.
pub struct PipeChannel {
    writer: AsyncMutex<FramedWrite<BoxedWriter, FrameCodec>>,
    reader: Reader,
    slot: Arc<Semaphore>,
    inflight: Mutex<Option<InFlight>>,
    draining: Arc<AtomicBool>,
    seq: CorrelationSeq,
    closed: AtomicBool,
}

impl PipeChannel {
    pub fn new(stdin: BoxedWriter, stdout: BoxedReader) -> Self {
        Self {
            writer: AsyncMutex::new(FramedWrite::new(stdin, FrameCodec::new())),
            reader: Arc::new(AsyncMutex::new(FramedRead::new(stdout, FrameCodec::new()))),
            slot: Arc::new(Semaphore::new(1)),
            inflight: Mutex::new(None),
            draining: Arc::new(AtomicBool::new(false)),
            seq: CorrelationSeq::new(),
            closed: AtomicBool::new(false),
        }
    }

    async fn write(&self, frame: Frame) -> Result<()> {
        self.writer
            .lock()
            .await
            .send(frame)
            .await
            .map_err(|e| TransportError::ProcessExited(format!("pod stdin closed: {}", e)).into())
    }

    fn take_inflight(&self, id: u64) -> Option<InFlight> {
        let mut slot = self.inflight.lock().ok()?;
        if slot.as_ref().is_some_and(|f| f.id == id) {
            slot.take()
        } else {
            None
        }
    }

    /// Read the abandoned response in the background, then free the slot.
    fn drain(&self, inflight: InFlight) {
        let reader = self.reader.clone();
        let draining = self.draining.clone();
        draining.store(true, Ordering::Release);
        tokio::spawn(async move {
            let InFlight { id, permit } = inflight;
            match read_reply(&reader, id).await {
                Ok(_) => tracing::debug!(id, "Drained abandoned pipe response"),
                Err(e) => tracing::debug!(id, error = %e, "Pipe closed while draining"),
            }
            draining.store(false, Ordering::Release);
            drop(permit);
        });
    }
}

/// Read frames until the one answering `id`. Earlier stale frames are skipped.
async fn read_reply(reader: &Reader, id: u64) -> Result<Frame> {
    let mut reader = reader.lock().await;
    loop {
        match reader.next().await {
            Some(Ok(frame)) if frame.id == id => return Ok(frame),
            Some(Ok(frame)) => {
                tracing::debug!(id = frame.id, expected = id, "Skipping stale pipe frame");
            },
            Some(Err(e)) => return Err(TransportError::MalformedFrame(e.to_string()).into()),
            None => {
                return Err(TransportError::ProcessExited("pod closed its stdout".into()).into())
            },
        }
    }
}

fn into_payload(frame: Frame) -> Result<Bytes> {
    match frame.kind {
        FrameKind::Data | FrameKind::Pong => Ok(frame.payload),
        FrameKind::Error => Err(TransportError::Rejected {
            status: 500,
            message: String::from_utf8_lossy(&frame.payload).into_owned(),
        }
        .into()),
        FrameKind::Ping => Err(TransportError::MalformedFrame("unexpected ping from pod".into()).into()),
    }
}

#[async_trait]
impl Channel for PipeChannel {
    fn mode(&self) -> CommMode {
        CommMode::Pipe
    }

    async fn send(&self, data: Bytes) -> Result<TransferHandle> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed.into());
        }
        let permit = self
            .slot
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransportError::Closed)?;
        let id = self.seq.next();
        self.write(Frame::data(id.0, data)).await?;

        if let Ok(mut slot) = self.inflight.lock() {
            *slot = Some(InFlight { id: id.0, permit });
        }
        Ok(TransferHandle(id))
    }

    async fn receive(&self, handle: TransferHandle, timeout: Duration) -> Result<Bytes> {
        let inflight = self
            .take_inflight(handle.id())
            .ok_or(TransportError::UnknownHandle(handle.id()))?;

        match within(timeout, read_reply(&self.reader, handle.id())).await {
            Err(EtlError::Timeout(d)) => {
                self.drain(inflight);
                Err(EtlError::Timeout(d))
            },
            other => other.and_then(into_payload),
        }
    }

    async fn cancel(&self, handle: TransferHandle) -> Result<()> {
        if let Some(inflight) = self.take_inflight(handle.id()) {
            self.drain(inflight);
        }
        Ok(())
    }

    async fn probe(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed.into());
        }
        let permit = if self.draining.load(Ordering::Acquire) {
            // A pod stuck on an abandoned transfer is not healthy.
            self.slot
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| TransportError::Closed)?
        } else {
            match self.slot.clone().try_acquire_owned() {
                Ok(permit) => permit,
                // A live transfer is proof of life.
                Err(TryAcquireError::NoPermits) => return Ok(()),
                Err(TryAcquireError::Closed) => return Err(TransportError::Closed.into()),
            }
        };

        let id = self.seq.next();
        self.write(Frame::ping(id.0)).await?;
        let frame = read_reply(&self.reader, id.0).await?;
        drop(permit);
        match frame.kind {
            FrameKind::Pong => Ok(()),
            other => Err(TransportError::MalformedFrame(format!("expected pong, got {:?}", other)).into()),
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.slot.close();
        let _ = self.writer.lock().await.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};

    /// Pod double: uppercases payloads, sleeps first when asked to be slow.
    fn spawn_pod(stdin: DuplexStream, stdout: DuplexStream) {
        tokio::spawn(async move {
            let mut input = FramedRead::new(stdin, FrameCodec::new());
            let mut output = FramedWrite::new(stdout, FrameCodec::new());
            while let Some(Ok(frame)) = input.next().await {
                let reply = match frame.kind {
                    FrameKind::Ping => Frame::pong(frame.id),
                    _ => {
                        if frame.payload.starts_with(b"slow") {
                            tokio::time::sleep(Duration::from_millis(300)).await;
                        }
                        Frame::data(frame.id, frame.payload.to_ascii_uppercase())
                    },
                };
                if output.send(reply).await.is_err() {
                    break;
                }
            }
        });
    }

    fn channel_with_pod() -> PipeChannel {
        let (node_stdin, pod_stdin) = duplex(64 * 1024);
        let (pod_stdout, node_stdout) = duplex(64 * 1024);
        spawn_pod(pod_stdin, pod_stdout);
        PipeChannel::new(Box::new(node_stdin), Box::new(node_stdout))
    }

    #[tokio::test]
    async fn test_transform_and_probe() {
        let channel = channel_with_pod();
        channel.probe().await.unwrap();
        let out = channel
            .transform(Bytes::from_static(b"abc"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(&out[..], b"ABC");
    }

    #[tokio::test]
    async fn test_timed_out_transfer_does_not_leak_into_next() {
        let channel = channel_with_pod();

        let err = channel
            .transform(Bytes::from_static(b"slow-one"), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        let out = channel
            .transform(Bytes::from_static(b"fast-two"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(&out[..], b"FAST-TWO");
    }

    #[tokio::test]
    async fn test_pod_exit_is_fatal() {
        let (node_stdin, _pod_stdin) = duplex(1024);
        let (pod_stdout, node_stdout) = duplex(1024);
        drop(pod_stdout);
        let channel = PipeChannel::new(Box::new(node_stdin), Box::new(node_stdout));

        let err = channel
            .transform(Bytes::from_static(b"x"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.is_fatal_transport(), "{err:?}");
    }

    #[tokio::test]
    async fn test_closed_channel_rejects_sends() {
        let channel = channel_with_pod();
        channel.close().await.unwrap();
        assert!(matches!(
            channel.send(Bytes::from_static(b"x")).await,
            Err(EtlError::Transport(TransportError::Closed))
        ));
    }
}
