//! Enter backend for containers owned by a [`Manager`].
//!
//! The handshake chunk's stream id is the container UUID. Its payload is an
//! optional JSON [`EnterRequest`]; an empty payload runs a shell. The
//! process is started with `berth-stager run` and its stdout and stderr are
//! relayed as chunks tagged `stdout` and `stderr`.

use std::process::Stdio;
use std::sync::Arc;

use berth_common::error::{BerthError, Result};
use berth_common::types::{ContainerId, ContainerState};
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::io::{ReaderStream, StreamReader};

use super::{ChunkTransport, EnterBackend, EnterChunk};
use crate::manager::Manager;

const CHANNEL_BUFFER: usize = 16;

/// What to run in the container, carried by the handshake chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnterRequest {
    /// App whose context the process runs in.
    pub app: Option<String>,
    /// Argument vector. Empty means the app's exec, or a shell.
    pub command: Vec<String>,
    /// Allocate a pseudo-terminal.
    pub tty: bool,
}

impl EnterRequest {
    /// Parses a handshake payload.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::Handshake`] if a non-empty payload is not a
    /// valid request.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(payload).map_err(|e| BerthError::Handshake {
            message: format!("malformed enter request: {e}"),
        })
    }
}

/// Opens enter sessions against running containers.
#[derive(Debug, Clone)]
pub struct ContainerEnterBackend {
    manager: Arc<Manager>,
}

impl ContainerEnterBackend {
    /// Creates a backend for `manager`'s containers.
    #[must_use]
    pub const fn new(manager: Arc<Manager>) -> Self {
        Self { manager }
    }
}

impl EnterBackend for ContainerEnterBackend {
    fn open(&self) -> BoxFuture<'_, Result<ChunkTransport>> {
        Box::pin(async move {
            let (ours, theirs) = ChunkTransport::pair(CHANNEL_BUFFER);
            let manager = Arc::clone(&self.manager);
            let _ = tokio::spawn(async move {
                if let Err(e) = serve(&manager, theirs).await {
                    tracing::warn!(error = %e, "enter session rejected");
                }
            });
            Ok(ours)
        })
    }
}

async fn serve(manager: &Manager, transport: ChunkTransport) -> Result<()> {
    let ChunkTransport {
        mut sink,
        mut stream,
    } = transport;
    let handshake = match stream.next().await {
        Some(Ok(chunk)) => chunk,
        _ => {
            return Err(BerthError::Handshake {
                message: "no handshake received".into(),
            });
        }
    };
    let request = EnterRequest::parse(&handshake.data)?;

    let uuid = ContainerId::new(handshake.stream_id);
    let container = manager.container(&uuid).ok_or_else(|| BerthError::NotFound {
        kind: "container",
        id: uuid.to_string(),
    })?;
    let state = container.state();
    if state != ContainerState::Running {
        return Err(BerthError::Handshake {
            message: format!("container {uuid} is {state}, not running"),
        });
    }

    let binary = &manager.options().stager_binary;
    let mut cmd = tokio::process::Command::new(binary);
    let _ = cmd.arg("run").arg(container.directory());
    if let Some(app) = &request.app {
        let _ = cmd.arg("--app").arg(app);
    }
    if request.tty {
        let _ = cmd.arg("--tty");
    }
    if !request.command.is_empty() {
        let _ = cmd.arg("--").args(&request.command);
    }
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| BerthError::io(binary, e))?;
    let (Some(mut stdin), Some(stdout), Some(stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        return Err(BerthError::Internal {
            message: "run process spawned without pipes".into(),
        });
    };
    tracing::info!(id = %uuid, pid = ?child.id(), tty = request.tty, "enter session started");

    let input = tokio::spawn(async move {
        let mut reader = StreamReader::new(stream.map(|r| r.map(|c| c.data)));
        let _ = tokio::io::copy(&mut reader, &mut stdin).await;
    });

    let tagged = |name: &'static str| {
        move |r: std::io::Result<bytes::Bytes>| r.map(|data| EnterChunk::new(name, data))
    };
    let mut output = futures::stream::select(
        ReaderStream::new(stdout).map(tagged("stdout")),
        ReaderStream::new(stderr).map(tagged("stderr")),
    );
    if let Err(e) = sink.send_all(&mut output).await {
        tracing::debug!(id = %uuid, error = %e, "enter output relay ended");
    }
    let _ = sink.close().await;

    let status = child.wait().await;
    input.abort();
    match status {
        Ok(status) => tracing::info!(id = %uuid, code = ?status.code(), "enter session finished"),
        Err(e) => tracing::warn!(id = %uuid, error = %e, "failed to wait for run process"),
    }
    Ok(())
}
