use anyhow::Result;
use common::{Command, MixerError, MixerStatus, Response};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};

use crate::gpu::GpuBackend;
use crate::operator::PlaybackOperator;

/// Status snapshot published by the render thread after every update
pub type SharedStatus = Arc<RwLock<MixerStatus>>;

/// How long a client waits for the render thread to answer
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// A command travelling to the render thread
#[derive(Debug)]
pub struct Request {
    pub command: Command,
    pub reply: oneshot::Sender<Response>,
}

/// Delivers requests to whatever owns the operator
pub trait CommandSink: Send + Sync + 'static {
    /// Fails once the receiving side is gone
    fn dispatch(&self, request: Request) -> Result<(), MixerError>;
}

impl CommandSink for mpsc::UnboundedSender<Request> {
    fn dispatch(&self, request: Request) -> Result<(), MixerError> {
        self.send(request).map_err(|_| MixerError::ShuttingDown)
    }
}

pub struct IpcServer {
    socket_path: PathBuf,
    status: SharedStatus,
    sink: Arc<dyn CommandSink>,
    should_exit: Arc<AtomicBool>,
}

impl IpcServer {
    pub fn new(
        socket_path: impl Into<PathBuf>,
        status: SharedStatus,
        sink: Arc<dyn CommandSink>,
        should_exit: Arc<AtomicBool>,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            status,
            sink,
            should_exit,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept clients until `should_exit` is set
    pub async fn run(self) -> Result<()> {
        // Remove old socket if it exists
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        log::info!("IPC server listening on: {}", self.socket_path.display());

        loop {
            if self.should_exit.load(Ordering::Acquire) {
                break;
            }

            // Accept connections with timeout
            let accept_result =
                tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;

            match accept_result {
                Ok(Ok((stream, _addr))) => {
                    let status = Arc::clone(&self.status);
                    let sink = Arc::clone(&self.sink);
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, status, sink).await {
                            log::error!("Error handling client: {}", e);
                        }
                    });
                }
                Ok(Err(e)) => {
                    log::error!("Error accepting connection: {}", e);
                }
                Err(_) => {
                    // Timeout, continue loop to check exit condition
                    continue;
                }
            }
        }

        // Clean up socket
        let _ = std::fs::remove_file(&self.socket_path);
        log::info!("IPC server stopped");
        Ok(())
    }
}

async fn handle_client(
    stream: UnixStream,
    status: SharedStatus,
    sink: Arc<dyn CommandSink>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let response = match serde_json::from_str::<Command>(&line) {
            Ok(command) => handle_command(command, &status, sink.as_ref()).await,
            Err(e) => {
                log::warn!("Invalid command: {}", e);
                Response::Error(MixerError::Ipc(format!("Invalid command: {}", e)))
            }
        };

        let response_json = serde_json::to_string(&response)?;
        writer.write_all(response_json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        line.clear();
    }

    Ok(())
}

async fn handle_command(command: Command, status: &SharedStatus, sink: &dyn CommandSink) -> Response {
    log::debug!("Handling command: {:?}", command);

    match command {
        Command::Ping => Response::Pong,
        Command::Query => Response::Status(status.read().clone()),
        command => forward(command, sink).await,
    }
}

/// Run a mutating command on the render thread and wait for its answer
async fn forward(command: Command, sink: &dyn CommandSink) -> Response {
    let (reply, answer) = oneshot::channel();
    if let Err(e) = sink.dispatch(Request { command, reply }) {
        return Response::Error(e);
    }

    match tokio::time::timeout(REPLY_TIMEOUT, answer).await {
        Ok(Ok(response)) => response,
        Ok(Err(_)) => Response::Error(MixerError::ShuttingDown),
        Err(_) => Response::Error(MixerError::Ipc(
            "render thread did not answer in time".to_string(),
        )),
    }
}

/// Carry out a forwarded command on the render thread
pub fn execute<B: GpuBackend>(operator: &mut PlaybackOperator<B>, command: Command) -> Response {
    match command {
        Command::ShowMedia { slot } => match operator.show_media(slot) {
            Ok(pool_index) => Response::Shown {
                output: operator.output_for(slot),
                pool_index,
            },
            Err(e) => {
                log::info!("ShowMedia {} refused: {}", slot, e);
                Response::Error(e.into())
            }
        },
        Command::SetBank { bank } => {
            operator.set_bank(bank);
            Response::Ok
        }
        Command::SetLooping { slot, looping } => match operator.set_looping(slot, looping) {
            Ok(()) => Response::Ok,
            Err(e) => Response::Error(e.into()),
        },
        Command::SetFadeTime { ms } => {
            operator.set_fade_duration(Duration::from_millis(ms));
            Response::Ok
        }
        Command::Kill => {
            log::info!("Received kill command");
            operator.shutdown();
            Response::Ok
        }
        Command::Ping => Response::Pong,
        Command::Query => Response::Status(operator.status()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_forward_without_receiver() {
        let (tx, rx) = mpsc::unbounded_channel::<Request>();
        drop(rx);
        let response = forward(Command::SetBank { bank: 1 }, &tx).await;
        assert_eq!(response, Response::Error(MixerError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_query_served_from_snapshot() {
        let (tx, _rx) = mpsc::unbounded_channel::<Request>();
        let status: SharedStatus = Arc::new(RwLock::new(MixerStatus {
            version: "test".to_string(),
            ..Default::default()
        }));

        match handle_command(Command::Query, &status, &tx).await {
            Response::Status(s) => assert_eq!(s.version, "test"),
            other => panic!("unexpected response {:?}", other),
        }
        assert_eq!(handle_command(Command::Ping, &status, &tx).await, Response::Pong);
    }
}
