/// Integration tests for IPC communication
/// These tests run the real server on a temporary socket and answer
/// forwarded commands from an operator on its own thread
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use common::{Command, MixerError, MixerStatus, Response};
use mixer::error::ImportError;
use mixer::gpu::GpuBackend;
use mixer::ipc_server::{self, IpcServer, Request, SharedStatus};
use mixer::media::{DecodedFrame, GstSourceFactory, SourceDescriptor, SourceKind};
use mixer::controller::LogReporter;
use mixer::config::PoolSettings;
use mixer::{OperatorSettings, PlaybackOperator};
use parking_lot::RwLock;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

#[derive(Default)]
struct NullBackend {
    next: u32,
}

impl GpuBackend for NullBackend {
    type Image = u32;
    type Fence = ();

    fn import(&mut self, _frame: &DecodedFrame) -> Result<u32, ImportError> {
        self.next += 1;
        Ok(self.next)
    }

    fn destroy_image(&mut self, _image: u32) {}

    fn create_fence(&mut self) {}

    fn wait_fence(&mut self, _fence: &(), _timeout: Duration) -> bool {
        true
    }

    fn destroy_fence(&mut self, _fence: ()) {}
}

/// Owns the operator the way the render thread does
fn spawn_render_thread(
    mut rx: mpsc::UnboundedReceiver<Request>,
    status: SharedStatus,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let settings = OperatorSettings {
            pool: PoolSettings {
                video: 0,
                capture: 0,
                procedural: 2,
                queue_capacity: 2,
            },
            slots: [(0, "bars"), (1, "solid:#00ff00")]
                .into_iter()
                .map(|(id, pattern)| (id, SourceDescriptor::new(SourceKind::Procedural, pattern)))
                .collect(),
            ..OperatorSettings::default()
        };
        let mut operator = PlaybackOperator::new(
            settings,
            NullBackend::default(),
            Box::new(GstSourceFactory::default()),
            Box::new(LogReporter::new()),
        );
        operator.initialize();

        while let Some(request) = rx.blocking_recv() {
            let kill = matches!(request.command, Command::Kill);
            let response = ipc_server::execute(&mut operator, request.command);
            *status.write() = operator.status();
            let _ = request.reply.send(response);
            if kill {
                break;
            }
        }
        operator.shutdown();
    })
}

async fn connect(path: &Path) -> UnixStream {
    for _ in 0..100 {
        if let Ok(stream) = UnixStream::connect(path).await {
            return stream;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("server never came up at {}", path.display());
}

async fn roundtrip(stream: &mut UnixStream, line: &str) -> Response {
    let (reader, mut writer) = stream.split();
    writer.write_all(line.as_bytes()).await.unwrap();
    writer.write_all(b"\n").await.unwrap();
    writer.flush().await.unwrap();

    let mut response = String::new();
    BufReader::new(reader).read_line(&mut response).await.unwrap();
    serde_json::from_str(&response).unwrap()
}

async fn send(stream: &mut UnixStream, command: &Command) -> Response {
    roundtrip(stream, &serde_json::to_string(command).unwrap()).await
}

#[tokio::test]
async fn test_commands_over_socket() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("vmix.sock");

    let status: SharedStatus = Arc::new(RwLock::new(MixerStatus::default()));
    let should_exit = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::unbounded_channel();
    let render = spawn_render_thread(rx, Arc::clone(&status));

    let server = IpcServer::new(
        socket.clone(),
        Arc::clone(&status),
        Arc::new(tx),
        Arc::clone(&should_exit),
    );
    let server_task = tokio::spawn(server.run());

    let mut stream = connect(&socket).await;
    assert_eq!(send(&mut stream, &Command::Ping).await, Response::Pong);

    match send(&mut stream, &Command::ShowMedia { slot: 0 }).await {
        Response::Shown { output, pool_index } => {
            assert_eq!(output, 0);
            assert_eq!(pool_index, 0);
        }
        other => panic!("unexpected {:?}", other),
    }

    // Output 0 is still fading
    assert_eq!(
        send(&mut stream, &Command::ShowMedia { slot: 1 }).await,
        Response::Error(MixerError::MixerBusy(0))
    );
    assert_eq!(
        send(&mut stream, &Command::ShowMedia { slot: 42 }).await,
        Response::Error(MixerError::UnknownSlot(42))
    );
    assert_eq!(
        send(&mut stream, &Command::SetFadeTime { ms: 250 }).await,
        Response::Ok
    );
    assert_eq!(
        send(
            &mut stream,
            &Command::SetLooping {
                slot: 0,
                looping: false
            }
        )
        .await,
        Response::Ok
    );

    match send(&mut stream, &Command::Query).await {
        Response::Status(status) => {
            assert_eq!(status.pool.len(), 2);
            assert_eq!(status.pool[0].media_slot, Some(0));
            assert!(status.controller.media[0].is_active());
        }
        other => panic!("unexpected {:?}", other),
    }

    // Malformed input gets an error line, the connection stays usable
    match roundtrip(&mut stream, "{not json").await {
        Response::Error(MixerError::Ipc(_)) => {}
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(send(&mut stream, &Command::Kill).await, Response::Ok);
    render.join().unwrap();

    // Render thread gone: mutating commands are refused
    assert_eq!(
        send(&mut stream, &Command::SetBank { bank: 1 }).await,
        Response::Error(MixerError::ShuttingDown)
    );

    should_exit.store(true, Ordering::Release);
    server_task.await.unwrap().unwrap();
    assert!(!socket.exists());
}

#[test]
fn test_command_wire_format() {
    let json = serde_json::to_string(&Command::ShowMedia { slot: 5 }).unwrap();
    assert_eq!(json, r#"{"ShowMedia":{"slot":5}}"#);

    let json = serde_json::to_string(&Command::Ping).unwrap();
    assert_eq!(json, r#""Ping""#);

    let cmd: Command = serde_json::from_str(r#"{"SetFadeTime":{"ms":1500}}"#).unwrap();
    assert_eq!(cmd, Command::SetFadeTime { ms: 1500 });
}

#[test]
fn test_response_wire_format() {
    let resp = Response::Error(MixerError::AlreadyShowing(3));
    let json = serde_json::to_string(&resp).unwrap();
    let back: Response = serde_json::from_str(&json).unwrap();
    assert_eq!(back, resp);

    let status = Response::Status(MixerStatus {
        version: "0.1.0".to_string(),
        uptime_secs: 12,
        ..Default::default()
    });
    let json = serde_json::to_string(&status).unwrap();
    assert!(json.contains("uptime_secs"));
    assert_eq!(serde_json::from_str::<Response>(&json).unwrap(), status);
}
