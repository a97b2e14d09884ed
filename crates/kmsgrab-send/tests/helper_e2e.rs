use std::{
    fs::File,
    io,
    os::fd::OwnedFd,
    path::PathBuf,
    thread,
    time::Duration,
};

use kmsgrab_common::{
    handle_table::FramebufferList,
    protocol_common::HelperExitCode,
    transport::{HandleServer, TransportError},
};
use kmsgrab_send::{
    enumerate::{FramebufferInfo, ScanoutDevice},
    run,
};
use tempfile::TempDir;

/// One plane showing one single-buffer framebuffer, or none at all
struct OnePlane {
    handle: u32,
}

impl ScanoutDevice for OnePlane {
    fn plane_ids(&self) -> io::Result<Vec<u32>> {
        Ok(vec![31])
    }

    fn plane_framebuffer(&self, _plane_id: u32) -> io::Result<Option<u32>> {
        Ok(Some(0x2a))
    }

    fn framebuffer(&self, fb_id: u32) -> io::Result<FramebufferInfo> {
        Ok(FramebufferInfo {
            id: fb_id,
            width: 2560,
            height: 1440,
            fourcc: 0x3432_5241,
            modifier: 0x0100_0000_0000_0001,
            handles: [self.handle, 0, 0, 0],
            pitches: [10240, 0, 0, 0],
            offsets: [0; 4],
        })
    }

    fn export_buffer(&self, _handle: u32) -> io::Result<OwnedFd> {
        Ok(File::open("/dev/null")?.into())
    }
}

fn socket_in_tempdir() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("kmsgrab-send.sock");
    (dir, path)
}

#[test]
fn test_run_delivers_framebuffers() {
    let (_dir, path) = socket_in_tempdir();
    let server = HandleServer::bind(&path).expect("bind");

    let helper_path = path.clone();
    let helper =
        thread::spawn(move || run(&OnePlane { handle: 5 }, &helper_path));

    let connection = server.accept(Duration::from_secs(5)).expect("accept");
    let message = connection
        .receive(Duration::from_secs(5))
        .expect("receive");
    assert_eq!(
        helper.join().expect("helper panicked"),
        HelperExitCode::Success
    );

    let list = FramebufferList::from_message(message).expect("decode");
    let fb = list.find(0x2a).expect("framebuffer");
    assert_eq!((fb.width, fb.height), (2560, 1440));
    assert_eq!(fb.modifier, 0x0100_0000_0000_0001);
    assert_eq!(fb.planes.len(), 1);
    assert_eq!(list.close(), 1);
}

#[test]
fn test_run_reports_enumeration_failure() {
    let (_dir, path) = socket_in_tempdir();
    let server = HandleServer::bind(&path).expect("bind");

    let helper_path = path.clone();
    let helper =
        thread::spawn(move || run(&OnePlane { handle: 0 }, &helper_path));

    let connection = server.accept(Duration::from_secs(5)).expect("accept");
    let err = connection.receive(Duration::from_secs(5)).unwrap_err();
    assert!(matches!(err, TransportError::PeerClosed { .. }), "{err}");
    assert_eq!(
        helper.join().expect("helper panicked"),
        HelperExitCode::NoUsablePlanes
    );
}

#[test]
fn test_run_without_listener() {
    let (_dir, path) = socket_in_tempdir();
    assert_eq!(run(&OnePlane { handle: 5 }, &path), HelperExitCode::Transport);
}
