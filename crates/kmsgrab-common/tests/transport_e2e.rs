use std::{
    fs::File,
    io::{ErrorKind, Read, Write},
    os::{fd::OwnedFd, unix::net::UnixListener},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use kmsgrab_common::{
    handle_table::FramebufferList,
    protocol_common::{
        Framebuffer, MAX_FDS, MAX_FRAMEBUFFERS, MAX_PLANES, Plane,
        ProtocolError, Response, WireResponse,
    },
    transport::{
        HandleServer, TransportError, TransportMessage, hang_up,
        max_socket_path_len, send_message,
    },
};
use rustix::pipe::{PipeFlags, pipe_with};
use tempfile::TempDir;

/// Helper to get a fresh socket path in its own directory
fn socket_in_tempdir() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("kmsgrab-send.sock");
    (dir, path)
}

fn pipe() -> (OwnedFd, OwnedFd) {
    pipe_with(PipeFlags::CLOEXEC | PipeFlags::NONBLOCK).expect("pipe2")
}

/// A pipe's read end reports EOF only once every write end is closed.
fn all_writers_closed(read_end: &OwnedFd) -> bool {
    let mut file = File::from(read_end.try_clone().expect("dup"));
    let mut buf = [0u8; 16];
    loop {
        match file.read(&mut buf) {
            Ok(0) => return true,
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => return false,
            Err(e) => panic!("unexpected read error: {e}"),
        }
    }
}

fn single_plane_response(num_fds: usize) -> Response {
    let framebuffers = (0..num_fds)
        .map(|slot| Framebuffer {
            id: 0x100 + slot as u32,
            width: 1280,
            height: 720,
            fourcc: 0x3432_5258,
            modifier: 0,
            planes: vec![Plane {
                fd_index: slot,
                pitch: 5120,
                offset: 0,
            }],
        })
        .collect();
    Response::new(framebuffers, num_fds).expect("valid response")
}

fn send_in_background(
    path: &Path,
    message: TransportMessage,
) -> thread::JoinHandle<Result<usize, TransportError>> {
    let path = path.to_path_buf();
    thread::spawn(move || send_message(&path, &message))
}

#[test]
fn test_accept_times_out_without_peer() {
    let (_dir, path) = socket_in_tempdir();
    let server = HandleServer::bind(&path).expect("bind");

    let timeout = Duration::from_millis(200);
    let start = Instant::now();
    let err = server.accept(timeout).unwrap_err();
    let elapsed = start.elapsed();

    assert!(matches!(err, TransportError::Timeout { .. }), "{err}");
    assert!(elapsed >= timeout, "returned early after {elapsed:?}");
    assert!(
        elapsed < timeout + Duration::from_millis(500),
        "overran timeout: {elapsed:?}"
    );
}

#[test]
fn test_descriptors_cross_the_socket() {
    let (_dir, path) = socket_in_tempdir();
    let server = HandleServer::bind(&path).expect("bind");

    let (read_a, write_a) = pipe();
    let (read_b, write_b) = pipe();
    let sender = send_in_background(
        &path,
        TransportMessage {
            payload: single_plane_response(2).encode(),
            descriptors: vec![write_a, write_b],
        },
    );

    let connection = server.accept(Duration::from_secs(5)).expect("accept");
    assert!(connection.peer_pid().is_some());
    let message = connection
        .receive(Duration::from_secs(5))
        .expect("receive");
    let sent = sender.join().expect("sender panicked").expect("send");
    assert_eq!(sent, WireResponse::SIZE);
    assert_eq!(message.payload.len(), WireResponse::SIZE);
    assert_eq!(message.descriptors.len(), 2);

    // the sender dropped its copies, only the received ones keep the pipes
    // open
    let list = FramebufferList::from_message(message).expect("decode");
    assert!(!all_writers_closed(&read_a));
    let fb = list.find(0x101).expect("second framebuffer").clone();
    let fds = list.plane_fds(&fb);
    let mut writer = File::from(fds[0].try_clone_to_owned().expect("dup"));
    writer.write_all(b"ok").expect("write through received fd");
    drop(writer);

    let mut got = [0u8; 2];
    File::from(read_b.try_clone().expect("dup"))
        .read_exact(&mut got)
        .expect("read");
    assert_eq!(&got, b"ok");

    assert_eq!(list.close(), 2);
    assert!(all_writers_closed(&read_a));
    assert!(all_writers_closed(&read_b));
}

#[test]
fn test_full_descriptor_table_crosses_the_socket() {
    let (_dir, path) = socket_in_tempdir();
    let server = HandleServer::bind(&path).expect("bind");

    let framebuffers = (0..MAX_FRAMEBUFFERS)
        .map(|i| Framebuffer {
            id: 0x200 + i as u32,
            width: 2560,
            height: 1440,
            fourcc: 0x3432_5258,
            modifier: 0x0100_0000_0000_0001,
            planes: (0..MAX_PLANES)
                .map(|p| Plane {
                    fd_index: i * MAX_PLANES + p,
                    pitch: 10240,
                    offset: p as u32 * 0x10_0000,
                })
                .collect(),
        })
        .collect();
    let response = Response::new(framebuffers, MAX_FDS).expect("valid");
    let (read_ends, write_ends): (Vec<_>, Vec<_>) =
        (0..MAX_FDS).map(|_| pipe()).unzip();
    let sender = send_in_background(
        &path,
        TransportMessage {
            payload: response.encode(),
            descriptors: write_ends,
        },
    );

    let connection = server.accept(Duration::from_secs(5)).expect("accept");
    let message = connection
        .receive(Duration::from_secs(5))
        .expect("receive");
    sender.join().expect("sender panicked").expect("send");
    assert_eq!(message.descriptors.len(), MAX_FDS);

    let list = FramebufferList::from_message(message).expect("decode");
    assert_eq!(list.response(), &response);
    assert!(read_ends.iter().all(|r| !all_writers_closed(r)));
    assert_eq!(list.close(), MAX_FDS);
    assert!(read_ends.iter().all(all_writers_closed));
}

#[test]
fn test_rejected_message_leaves_nothing_open() {
    let (_dir, path) = socket_in_tempdir();
    let server = HandleServer::bind(&path).expect("bind");

    let (read_end, write_end) = pipe();
    // one descriptor sent, none declared
    let sender = send_in_background(
        &path,
        TransportMessage {
            payload: Response::default().encode(),
            descriptors: vec![write_end],
        },
    );

    let connection = server.accept(Duration::from_secs(5)).expect("accept");
    let message = connection
        .receive(Duration::from_secs(5))
        .expect("receive");
    sender.join().expect("sender panicked").expect("send");

    let err = FramebufferList::from_message(message).unwrap_err();
    assert_eq!(
        err,
        ProtocolError::FdCountMismatch {
            received: 1,
            declared: 0,
        }
    );
    assert!(all_writers_closed(&read_end));
}

#[test]
fn test_hang_up_is_peer_closed() {
    let (_dir, path) = socket_in_tempdir();
    let server = HandleServer::bind(&path).expect("bind");

    hang_up(&path).expect("connect");
    let connection = server.accept(Duration::from_secs(5)).expect("accept");
    let err = connection.receive(Duration::from_secs(5)).unwrap_err();
    assert!(matches!(err, TransportError::PeerClosed { .. }), "{err}");
}

#[test]
fn test_silent_peer_times_out_on_receive() {
    let (_dir, path) = socket_in_tempdir();
    let server = HandleServer::bind(&path).expect("bind");

    let client =
        std::os::unix::net::UnixStream::connect(&path).expect("connect");
    let connection = server.accept(Duration::from_secs(5)).expect("accept");
    let err = connection
        .receive(Duration::from_millis(100))
        .unwrap_err();
    assert!(matches!(err, TransportError::Timeout { .. }), "{err}");
    drop(client);
}

#[test]
fn test_stale_socket_is_replaced_and_unlinked_on_drop() {
    let (_dir, path) = socket_in_tempdir();
    // std listeners leave their path behind
    drop(UnixListener::bind(&path).expect("bind stale"));
    assert!(path.exists());

    let server = HandleServer::bind(&path).expect("rebind over stale socket");
    assert_eq!(server.path(), path);
    drop(server);
    assert!(!path.exists());
}

#[test]
fn test_replaced_socket_is_left_to_its_owner() {
    let (_dir, path) = socket_in_tempdir();
    let first = HandleServer::bind(&path).expect("bind first");
    let second = HandleServer::bind(&path).expect("bind second");

    drop(first);
    assert!(path.exists(), "first server unlinked the second one's socket");

    let client =
        std::os::unix::net::UnixStream::connect(&path).expect("connect");
    second.accept(Duration::from_secs(5)).expect("accept");
    drop(client);

    drop(second);
    assert!(!path.exists());
}

#[test]
fn test_regular_file_is_not_replaced() {
    let (_dir, path) = socket_in_tempdir();
    std::fs::write(&path, b"not a socket").expect("write");

    let err = HandleServer::bind(&path).unwrap_err();
    assert!(matches!(err, TransportError::NotASocket { .. }), "{err}");
    assert_eq!(std::fs::read(&path).expect("read"), b"not a socket");
}

#[test]
fn test_overlong_path_fails_before_any_socket_call() {
    let (dir, _) = socket_in_tempdir();
    let path = dir.path().join("x".repeat(max_socket_path_len()));

    let err = HandleServer::bind(&path).unwrap_err();
    assert!(matches!(err, TransportError::PathTooLong { .. }), "{err}");
    assert!(!path.exists());

    let err = hang_up(&path).unwrap_err();
    assert!(matches!(err, TransportError::PathTooLong { .. }), "{err}");
}
