// End-to-end tests for Wally over a real Unix socket
//
// A test client speaks the wire protocol to a server bound in a temporary
// runtime directory. Frames are produced by driving the scheduler by hand.

use std::collections::HashMap;
use std::io::{IoSlice, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt, Interest};
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_test::assert_ok;

use wally::protocol::{
    error_code, format, shm_error, Argument, CodecError, Interface, Message, MessageHeader,
};
use wally::region::Rect;
use wally::renderer::{ChannelVsync, FrameLog, HeadlessRenderer};
use wally::scheduler::{FrameScheduler, SchedulerError, TickOutcome};
use wally::{WallyCompositor, WallyConfig, WaylandServer};

const TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    _dir: TempDir,
    path: PathBuf,
    compositor: Arc<WallyCompositor>,
    server: JoinHandle<anyhow::Result<()>>,
}

impl Harness {
    async fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = WallyConfig::default();
        config.server.runtime_dir = Some(dir.path().to_string_lossy().into_owned());
        config.server.socket_name = "wayland-test".to_string();

        let compositor = WallyCompositor::new(&config);
        let server = WaylandServer::bind(&config, Arc::clone(&compositor)).unwrap();
        let path = server.socket_path().to_path_buf();
        let server = tokio::spawn(async move { server.run().await });

        Self {
            _dir: dir,
            path,
            compositor,
            server,
        }
    }

    fn scheduler(&self, renderer: HeadlessRenderer) -> FrameScheduler {
        let (vsync, _tx) = ChannelVsync::new();
        FrameScheduler::new(
            Arc::clone(&self.compositor),
            Box::new(renderer),
            Box::new(vsync),
            3,
        )
    }
}

struct TestClient {
    stream: UnixStream,
    inbox: Vec<u8>,
    objects: HashMap<u32, Interface>,
    next_sync: u32,
}

impl TestClient {
    async fn connect(path: &Path) -> Self {
        let stream = UnixStream::connect(path).await.unwrap();
        Self {
            stream,
            inbox: Vec::new(),
            objects: HashMap::from([(1, Interface::Display)]),
            next_sync: 1000,
        }
    }

    async fn send(&mut self, object_id: u32, opcode: u16, args: Vec<Argument>) {
        let bytes = Message::new(object_id, opcode, args).to_bytes().unwrap();
        self.stream.write_all(&bytes).await.unwrap();
    }

    /// Sends a request together with one file descriptor
    async fn send_with_fd(&mut self, object_id: u32, opcode: u16, args: Vec<Argument>, fd: &impl AsRawFd) {
        let bytes = Message::new(object_id, opcode, args).to_bytes().unwrap();
        let socket = self.stream.as_raw_fd();
        let fds = [fd.as_raw_fd()];
        loop {
            self.stream.writable().await.unwrap();
            let sent = self.stream.try_io(Interest::WRITABLE, || {
                sendmsg::<()>(
                    socket,
                    &[IoSlice::new(&bytes)],
                    &[ControlMessage::ScmRights(&fds)],
                    MsgFlags::empty(),
                    None,
                )
                .map_err(std::io::Error::from)
            });
            match sent {
                Ok(n) => {
                    assert_eq!(n, bytes.len());
                    return;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => panic!("sendmsg failed: {}", e),
            }
        }
    }

    fn track(&mut self, id: u32, interface: Interface) {
        self.objects.insert(id, interface);
    }

    /// Next event, `None` once the server closed the connection
    async fn next_event(&mut self) -> Option<Message> {
        loop {
            if let Some(size) = MessageHeader::peek(&self.inbox).unwrap() {
                let objects = &self.objects;
                let (message, used) = Message::decode(&self.inbox[..size], |id, opcode| {
                    objects
                        .get(&id)
                        .ok_or(CodecError::UnknownObject(id))?
                        .event_signature(id, opcode)
                })
                .unwrap();
                self.inbox.drain(..used);
                return Some(message);
            }

            let mut chunk = [0u8; 4096];
            let n = timeout(TIMEOUT, self.stream.read(&mut chunk))
                .await
                .expect("timed out waiting for an event")
                .unwrap_or(0);
            if n == 0 {
                return None;
            }
            self.inbox.extend_from_slice(&chunk[..n]);
        }
    }

    /// Sends `wl_display.sync` and returns the events that arrived before
    /// its `done`, plus the serial it carried
    async fn roundtrip(&mut self) -> (Vec<Message>, u32) {
        let callback = self.next_sync;
        self.next_sync += 1;
        self.track(callback, Interface::Callback);
        self.send(1, 0, vec![Argument::NewId(callback)]).await;

        let mut events = Vec::new();
        loop {
            let event = self.next_event().await.expect("connection closed");
            if event.object_id == callback {
                let serial = event.uint(0).unwrap();
                let deleted = self.next_event().await.expect("connection closed");
                assert_eq!(deleted.object_id, 1);
                assert_eq!(deleted.args, vec![Argument::Uint(callback)]);
                return (events, serial);
            }
            events.push(event);
        }
    }

    /// Registry at 2, compositor at 3, buffer allocator at 4
    async fn bind_core(&mut self) -> Vec<Message> {
        self.track(2, Interface::Registry);
        self.send(1, 1, vec![Argument::NewId(2)]).await;
        self.track(3, Interface::Compositor);
        self.send(2, 0, bind_args(1, "wl_compositor", 5, 3)).await;
        self.track(4, Interface::BufferAllocator);
        self.send(2, 0, bind_args(3, "wally_buffer_allocator", 1, 4)).await;
        self.roundtrip().await.0
    }
}

fn bind_args(name: u32, interface: &str, version: u32, id: u32) -> Vec<Argument> {
    vec![
        Argument::Uint(name),
        Argument::Str(Some(interface.to_string())),
        Argument::Uint(version),
        Argument::NewId(id),
    ]
}

fn expect_display_error(event: &Message, code: u32) {
    assert_eq!(event.object_id, 1);
    assert_eq!(event.opcode, 0);
    assert_eq!(event.args[1], Argument::Uint(code));
}

#[tokio::test]
async fn test_registry_advertises_globals_in_order() {
    let harness = Harness::start().await;
    let mut client = TestClient::connect(&harness.path).await;

    let events = client.bind_core().await;
    let globals: Vec<(u32, String, u32)> = events
        .iter()
        .filter(|e| e.object_id == 2)
        .map(|e| {
            (
                e.uint(0).unwrap(),
                e.string(1).unwrap().unwrap_or_default().to_string(),
                e.uint(2).unwrap(),
            )
        })
        .collect();

    assert_eq!(
        globals,
        vec![
            (1, "wl_compositor".to_string(), 5),
            (2, "wl_shm".to_string(), 1),
            (3, "wally_buffer_allocator".to_string(), 1),
            (4, "wl_output".to_string(), 3),
        ]
    );
}

#[tokio::test]
async fn test_sync_serials_increase() {
    let harness = Harness::start().await;
    let mut client = TestClient::connect(&harness.path).await;

    let (_, first) = client.roundtrip().await;
    let (_, second) = client.roundtrip().await;
    let (_, third) = client.roundtrip().await;
    assert!(first < second && second < third);
}

#[tokio::test]
async fn test_output_binding_describes_mode() {
    let harness = Harness::start().await;
    let mut client = TestClient::connect(&harness.path).await;
    client.bind_core().await;

    client.track(6, Interface::Output);
    client.send(2, 0, bind_args(4, "wl_output", 3, 6)).await;
    let (events, _) = client.roundtrip().await;

    let opcodes: Vec<u16> = events.iter().map(|e| e.opcode).collect();
    // geometry, mode, scale, done
    assert_eq!(opcodes, vec![0, 1, 3, 2]);
    assert_eq!(events[1].int(1).unwrap(), 1920);
    assert_eq!(events[1].int(2).unwrap(), 1080);
    assert_eq!(events[1].int(3).unwrap(), 60_000);
}

#[tokio::test]
async fn test_frame_callback_and_buffer_release() {
    let harness = Harness::start().await;
    let mut client = TestClient::connect(&harness.path).await;
    client.bind_core().await;

    client.track(5, Interface::Surface);
    client.send(3, 0, vec![Argument::NewId(5)]).await;
    client.track(9, Interface::Buffer);
    client
        .send(4, 0, vec![Argument::NewId(9), Argument::Int(64), Argument::Int(64), Argument::Uint(0)])
        .await;

    client.send(5, 1, vec![Argument::Object(9), Argument::Int(0), Argument::Int(0)]).await;
    client
        .send(5, 2, vec![Argument::Int(0), Argument::Int(0), Argument::Int(64), Argument::Int(64)])
        .await;
    client.track(10, Interface::Callback);
    client.send(5, 3, vec![Argument::NewId(10)]).await;
    client.send(5, 6, vec![]).await;
    let (events, _) = client.roundtrip().await;
    assert!(events.is_empty());

    let renderer = HeadlessRenderer::new();
    let log: FrameLog = renderer.log();
    let mut scheduler = harness.scheduler(renderer);

    assert_eq!(
        scheduler.tick().unwrap(),
        TickOutcome::Presented {
            frame_seq: 1,
            callbacks: 1
        }
    );
    let frame = log.last().unwrap();
    assert_eq!(frame.quads, vec![(5, 9, Rect::new(0, 0, 64, 64))]);
    assert_eq!(frame.damage.bounding_box(), Some(Rect::new(0, 0, 64, 64)));

    let done = client.next_event().await.unwrap();
    assert_eq!((done.object_id, done.opcode), (10, 0));
    let deleted = client.next_event().await.unwrap();
    assert_eq!(deleted.args, vec![Argument::Uint(10)]);

    // Detach and commit: the buffer stays on screen until the next frame
    client.send(5, 1, vec![Argument::Object(0), Argument::Int(0), Argument::Int(0)]).await;
    client.send(5, 6, vec![]).await;
    let (events, _) = client.roundtrip().await;
    assert!(events.iter().all(|e| e.object_id != 9));

    scheduler.tick().unwrap();
    assert!(log.last().unwrap().quads.is_empty());
    let (events, _) = client.roundtrip().await;
    let releases: Vec<&Message> = events.iter().filter(|e| e.object_id == 9).collect();
    assert_eq!(releases.len(), 1);
    assert_eq!(releases[0].opcode, 0);
}

#[tokio::test]
async fn test_protocol_error_closes_only_that_client() {
    let harness = Harness::start().await;
    let mut bad = TestClient::connect(&harness.path).await;
    let mut good = TestClient::connect(&harness.path).await;
    good.roundtrip().await;

    bad.send(77, 0, vec![]).await;
    let error = bad.next_event().await.unwrap();
    expect_display_error(&error, error_code::INVALID_OBJECT);
    assert!(bad.next_event().await.is_none());

    good.bind_core().await;
    assert_eq!(harness.compositor.client_count(), 1);
}

#[tokio::test]
async fn test_truncated_message_is_not_dispatched() {
    let harness = Harness::start().await;
    let mut client = TestClient::connect(&harness.path).await;

    // Half of a sync request, then the rest
    let bytes = Message::new(1, 0, vec![Argument::NewId(50)]).to_bytes().unwrap();
    client.track(50, Interface::Callback);
    client.stream.write_all(&bytes[..6]).await.unwrap();
    client.stream.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.stream.write_all(&bytes[6..]).await.unwrap();

    let done = client.next_event().await.unwrap();
    assert_eq!(done.object_id, 50);
}

#[tokio::test]
async fn test_presentation_failure_is_broadcast() {
    let harness = Harness::start().await;
    let mut first = TestClient::connect(&harness.path).await;
    let mut second = TestClient::connect(&harness.path).await;
    first.roundtrip().await;
    second.roundtrip().await;

    let renderer = HeadlessRenderer::new();
    renderer.failure_switch().store(true, Ordering::Release);
    let mut scheduler = harness.scheduler(renderer);

    assert_eq!(scheduler.tick().unwrap(), TickOutcome::Retrying { attempt: 1 });
    assert_eq!(scheduler.tick().unwrap(), TickOutcome::Retrying { attempt: 2 });
    assert!(matches!(
        scheduler.tick(),
        Err(SchedulerError::CompositorPresentationFailure { attempts: 3, .. })
    ));

    for client in [&mut first, &mut second] {
        let error = client.next_event().await.unwrap();
        expect_display_error(&error, error_code::IMPLEMENTATION);
        assert!(client.next_event().await.is_none());
    }

    let stopped = timeout(TIMEOUT, harness.server)
        .await
        .expect("server kept running")
        .unwrap();
    assert_ok!(stopped);
    assert!(harness.compositor.is_dying());
}

#[tokio::test]
async fn test_failed_dispatch_disconnects_client() {
    let harness = Harness::start().await;
    let mut client = TestClient::connect(&harness.path).await;
    client.bind_core().await;
    assert_eq!(harness.compositor.client_count(), 1);

    // wl_surface.set_buffer_scale(0) on a live surface
    client.track(5, Interface::Surface);
    client.send(3, 0, vec![Argument::NewId(5)]).await;
    client.send(5, 8, vec![Argument::Int(0)]).await;

    let error = client.next_event().await.unwrap();
    expect_display_error(&error, error_code::INVALID_METHOD);
    assert!(client.next_event().await.is_none());
    assert_eq!(harness.compositor.client_count(), 0);
    assert!(harness.compositor.scene().is_empty());
}

#[tokio::test]
async fn test_extreme_coordinates_keep_compositor_running() {
    let harness = Harness::start().await;
    let mut client = TestClient::connect(&harness.path).await;
    client.bind_core().await;

    client.track(5, Interface::Surface);
    client.send(3, 0, vec![Argument::NewId(5)]).await;
    client.send(5, 10, vec![Argument::Int(10), Argument::Int(0)]).await;
    client
        .send(5, 2, vec![Argument::Int(i32::MAX - 5), Argument::Int(0), Argument::Int(10), Argument::Int(10)])
        .await;
    client
        .send(5, 2, vec![Argument::Int(i32::MIN), Argument::Int(0), Argument::Int(i32::MAX), Argument::Int(1)])
        .await;
    for i in 0..20 {
        client
            .send(5, 2, vec![Argument::Int(i * 20), Argument::Int(10), Argument::Int(5), Argument::Int(5)])
            .await;
    }
    client.send(5, 6, vec![]).await;
    client.send(5, 10, vec![Argument::Int(i32::MAX), Argument::Int(i32::MIN)]).await;
    client.send(5, 6, vec![]).await;
    client.send(5, 10, vec![Argument::Int(1), Argument::Int(-1)]).await;
    client.send(5, 6, vec![]).await;
    let (events, _) = client.roundtrip().await;
    assert!(events.is_empty());

    let mut scheduler = harness.scheduler(HeadlessRenderer::new());
    assert!(matches!(scheduler.tick(), Ok(TickOutcome::Presented { .. })));
    assert_eq!(harness.compositor.scene()[0].current().origin, (i32::MAX, i32::MIN));
    assert_eq!(harness.compositor.client_count(), 1);
}

#[tokio::test]
async fn test_shm_buffer_over_socket() {
    let harness = Harness::start().await;
    let mut client = TestClient::connect(&harness.path).await;
    client.bind_core().await;

    client.track(6, Interface::Shm);
    client.send(2, 0, bind_args(2, "wl_shm", 1, 6)).await;
    let (events, _) = client.roundtrip().await;
    let formats: Vec<u32> = events
        .iter()
        .filter(|e| e.object_id == 6)
        .map(|e| e.uint(0).unwrap())
        .collect();
    assert_eq!(formats, format::SUPPORTED.to_vec());

    // 16x16 XRGB8888 pixels, every byte 0xab
    let mut file = tempfile::tempfile().unwrap();
    file.write_all(&[0xab; 1024]).unwrap();
    client.track(7, Interface::ShmPool);
    client
        .send_with_fd(6, 0, vec![Argument::NewId(7), Argument::Fd, Argument::Int(1024)], &file)
        .await;
    client.track(9, Interface::Buffer);
    client
        .send(
            7,
            0,
            vec![
                Argument::NewId(9),
                Argument::Int(0),
                Argument::Int(16),
                Argument::Int(16),
                Argument::Int(64),
                Argument::Uint(format::XRGB8888),
            ],
        )
        .await;
    // The pool can go; the buffer keeps its memory
    client.send(7, 1, vec![]).await;

    client.track(5, Interface::Surface);
    client.send(3, 0, vec![Argument::NewId(5)]).await;
    client.send(5, 1, vec![Argument::Object(9), Argument::Int(0), Argument::Int(0)]).await;
    client.send(5, 6, vec![]).await;
    let (events, _) = client.roundtrip().await;
    assert_eq!(events.iter().filter(|e| e.object_id == 1 && e.opcode == 0).count(), 0);

    let renderer = HeadlessRenderer::new();
    let log = renderer.log();
    let mut scheduler = harness.scheduler(renderer);
    scheduler.tick().unwrap();
    assert_eq!(log.last().unwrap().quads, vec![(5, 9, Rect::new(0, 0, 16, 16))]);

    let surface = Arc::clone(&harness.compositor.scene()[0]);
    let state = surface.current();
    let pixels = state.buffer.as_ref().unwrap().buffer().read_pixels().unwrap();
    assert_eq!(pixels.len(), 1024);
    assert!(pixels.iter().all(|&b| b == 0xab));
}

#[tokio::test]
async fn test_shm_buffer_outside_pool_is_rejected() {
    let harness = Harness::start().await;
    let mut client = TestClient::connect(&harness.path).await;
    client.bind_core().await;
    client.track(6, Interface::Shm);
    client.send(2, 0, bind_args(2, "wl_shm", 1, 6)).await;

    let file = tempfile::tempfile().unwrap();
    file.set_len(256).unwrap();
    client.track(7, Interface::ShmPool);
    client
        .send_with_fd(6, 0, vec![Argument::NewId(7), Argument::Fd, Argument::Int(256)], &file)
        .await;
    client
        .send(
            7,
            0,
            vec![
                Argument::NewId(9),
                Argument::Int(0),
                Argument::Int(16),
                Argument::Int(16),
                Argument::Int(64),
                Argument::Uint(format::ARGB8888),
            ],
        )
        .await;

    let error = loop {
        let event = client.next_event().await.expect("connection closed before the error");
        if event.object_id == 1 && event.opcode == 0 {
            break event;
        }
    };
    assert_eq!(error.args[0], Argument::Object(7));
    assert_eq!(error.args[1], Argument::Uint(shm_error::INVALID_STRIDE));
    assert!(client.next_event().await.is_none());
}
