//! The enter broker: relays an interactive exec/attach session between a
//! caller-facing transport and a backend.
//!
//! Both transports carry [`EnterChunk`]s. The caller's first chunk names
//! the target stream and is forwarded to the backend unmodified. After
//! that, bytes flow in both directions at once: chunk payloads are read as
//! a continuous byte stream and rewrapped under the session's stream id on
//! the other side.

pub mod container;

use std::io;
use std::pin::Pin;

use berth_common::error::{BerthError, Result};
use bytes::Bytes;
use futures::channel::mpsc;
use futures::future::{BoxFuture, ready};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio_util::io::{CopyToBytes, SinkWriter, StreamReader};

pub use container::{ContainerEnterBackend, EnterRequest};

/// One frame of an enter session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnterChunk {
    /// Stream the payload belongs to.
    pub stream_id: String,
    /// Payload bytes.
    pub data: Bytes,
}

impl EnterChunk {
    /// Creates a chunk.
    pub fn new(stream_id: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            stream_id: stream_id.into(),
            data: data.into(),
        }
    }
}

/// Outgoing half of a transport.
pub type ChunkSink = Pin<Box<dyn Sink<EnterChunk, Error = io::Error> + Send>>;
/// Incoming half of a transport.
pub type ChunkStream = Pin<Box<dyn Stream<Item = io::Result<EnterChunk>> + Send>>;

/// A bidirectional chunk transport.
pub struct ChunkTransport {
    /// Chunks sent to the peer.
    pub sink: ChunkSink,
    /// Chunks received from the peer.
    pub stream: ChunkStream,
}

impl std::fmt::Debug for ChunkTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkTransport").finish_non_exhaustive()
    }
}

impl ChunkTransport {
    /// Creates two connected in-memory transports.
    #[must_use]
    pub fn pair(buffer: usize) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(buffer);
        let (b_tx, a_rx) = mpsc::channel(buffer);
        (Self::from_channel(a_tx, a_rx), Self::from_channel(b_tx, b_rx))
    }

    fn from_channel(tx: mpsc::Sender<EnterChunk>, rx: mpsc::Receiver<EnterChunk>) -> Self {
        Self {
            sink: Box::pin(tx.sink_map_err(io::Error::other)),
            stream: Box::pin(rx.map(Ok)),
        }
    }
}

/// Opens the backend side of a session.
pub trait EnterBackend: Send + Sync {
    /// Opens a transport to the backend. The first chunk sent on it is the
    /// caller's handshake.
    fn open(&self) -> BoxFuture<'_, Result<ChunkTransport>>;
}

/// Relays one session between `inbound` and a transport opened on
/// `backend`.
///
/// Returns once the backend closes its side. Transport failures after the
/// handshake end the session without an error.
///
/// # Errors
///
/// Returns [`BerthError::Handshake`] if the caller closes before sending a
/// first chunk or the handshake cannot be forwarded, or the backend's error
/// if it cannot be opened.
pub async fn enter(inbound: ChunkTransport, backend: &dyn EnterBackend) -> Result<()> {
    let ChunkTransport {
        sink: inbound_sink,
        stream: mut inbound_stream,
    } = inbound;

    let handshake = match inbound_stream.next().await {
        Some(Ok(chunk)) => chunk,
        Some(Err(e)) => {
            return Err(BerthError::Handshake {
                message: e.to_string(),
            });
        }
        None => {
            return Err(BerthError::Handshake {
                message: "session closed before a handshake was received".into(),
            });
        }
    };
    let stream_id = handshake.stream_id.clone();

    let ChunkTransport {
        sink: mut outbound_sink,
        stream: outbound_stream,
    } = backend.open().await?;
    outbound_sink
        .send(handshake)
        .await
        .map_err(|e| BerthError::Handshake {
            message: format!("failed to forward handshake: {e}"),
        })?;
    tracing::debug!(stream_id, "enter session established");

    let upstream = {
        let stream_id = stream_id.clone();
        tokio::spawn(async move {
            let mut reader = StreamReader::new(inbound_stream.map(|r| r.map(|c| c.data)));
            let mut writer = chunk_writer(outbound_sink, stream_id.clone());
            if let Err(e) = tokio::io::copy(&mut reader, &mut writer).await {
                tracing::debug!(stream_id, error = %e, "enter input relay ended");
            }
            // Tell the backend no more input is coming.
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(stream_id, error = %e, "failed to close backend input");
            }
        })
    };

    let mut reader = StreamReader::new(outbound_stream.map(|r| r.map(|c| c.data)));
    let mut writer = chunk_writer(inbound_sink, stream_id.clone());
    match tokio::io::copy(&mut reader, &mut writer).await {
        Ok(bytes) => tracing::debug!(stream_id, bytes, "enter output relay finished"),
        Err(e) => tracing::debug!(stream_id, error = %e, "enter output relay ended"),
    }
    let _ = writer.shutdown().await;
    upstream.abort();

    tracing::debug!(stream_id, "enter session closed");
    Ok(())
}

/// Wraps `sink` as a byte writer that frames every write as one chunk.
fn chunk_writer(
    sink: ChunkSink,
    stream_id: String,
) -> SinkWriter<CopyToBytes<impl Sink<Bytes, Error = io::Error> + Unpin>> {
    SinkWriter::new(CopyToBytes::new(sink.with(move |data: Bytes| {
        ready(Ok::<_, io::Error>(EnterChunk {
            stream_id: stream_id.clone(),
            data,
        }))
    })))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::FutureExt;

    use super::*;

    /// Echoes every payload back upper-cased, after recording the handshake.
    #[derive(Default)]
    struct EchoBackend {
        opened: AtomicUsize,
        handshake: Arc<std::sync::Mutex<Option<EnterChunk>>>,
        close_after_handshake: bool,
    }

    impl EnterBackend for EchoBackend {
        fn open(&self) -> BoxFuture<'_, Result<ChunkTransport>> {
            async move {
                let _ = self.opened.fetch_add(1, Ordering::SeqCst);
                let (ours, theirs) = ChunkTransport::pair(4);
                let handshake = Arc::clone(&self.handshake);
                let close = self.close_after_handshake;
                let _ = tokio::spawn(async move {
                    let ChunkTransport {
                        mut sink,
                        mut stream,
                    } = theirs;
                    let first = stream.next().await.expect("handshake").expect("chunk");
                    *handshake.lock().expect("lock") = Some(first);
                    if close {
                        return;
                    }
                    while let Some(Ok(chunk)) = stream.next().await {
                        let upper = chunk.data.to_ascii_uppercase();
                        sink.send(EnterChunk::new("backend", upper)).await.expect("echo");
                    }
                    sink.close().await.expect("close");
                });
                Ok(ours)
            }
            .boxed()
        }
    }

    async fn collect(stream: &mut ChunkStream) -> Vec<EnterChunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk.expect("chunk"));
        }
        chunks
    }

    #[tokio::test]
    async fn relays_both_directions_after_handshake() {
        let backend = EchoBackend::default();
        let (mut caller, broker_side) = ChunkTransport::pair(4);

        let session = tokio::spawn(async move {
            let backend = backend;
            let result = enter(broker_side, &backend).await;
            (result, backend)
        });

        caller
            .sink
            .send(EnterChunk::new("c1", Bytes::from_static(br#"{"tty":false}"#)))
            .await
            .expect("handshake");
        caller.sink.send(EnterChunk::new("c1", "hello ")).await.expect("send");
        caller.sink.send(EnterChunk::new("c1", "world")).await.expect("send");
        caller.sink.close().await.expect("close input");

        let chunks = collect(&mut caller.stream).await;
        let (result, backend) = session.await.expect("session task");
        result.expect("session");

        assert!(chunks.iter().all(|c| c.stream_id == "c1"));
        let output: Vec<u8> = chunks.iter().flat_map(|c| c.data.to_vec()).collect();
        assert_eq!(output, b"HELLO WORLD");

        let handshake = backend.handshake.lock().expect("lock").clone();
        assert_eq!(
            handshake,
            Some(EnterChunk::new("c1", Bytes::from_static(br#"{"tty":false}"#)))
        );
    }

    #[tokio::test]
    async fn session_without_handshake_never_opens_backend() {
        let backend = EchoBackend::default();
        let (mut caller, broker_side) = ChunkTransport::pair(4);
        caller.sink.close().await.expect("close");

        let err = enter(broker_side, &backend).await.expect_err("no handshake");
        assert!(matches!(err, BerthError::Handshake { .. }));
        assert_eq!(backend.opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn backend_close_ends_session_while_caller_is_open() {
        let backend = EchoBackend {
            close_after_handshake: true,
            ..EchoBackend::default()
        };
        let (mut caller, broker_side) = ChunkTransport::pair(4);
        caller.sink.send(EnterChunk::new("c1", "")).await.expect("handshake");

        tokio::time::timeout(Duration::from_secs(5), enter(broker_side, &backend))
            .await
            .expect("session must end when the backend closes")
            .expect("session");
        assert!(collect(&mut caller.stream).await.is_empty());
    }
}
