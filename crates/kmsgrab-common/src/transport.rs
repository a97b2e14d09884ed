//! One-shot exchange of a metadata message plus SCM_RIGHTS descriptors over
//! a UNIX stream socket.

use std::{
    backtrace::Backtrace,
    fs,
    io::{self, IoSlice, IoSliceMut},
    mem::MaybeUninit,
    os::{
        fd::{AsFd, BorrowedFd, OwnedFd},
        unix::{
            fs::{FileTypeExt, MetadataExt, PermissionsExt},
            net::{UnixListener, UnixStream},
        },
    },
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use nix::{
    errno::Errno as NixErrno,
    poll::{PollFd, PollFlags, PollTimeout, poll},
    sys::socket::{getsockopt, sockopt::PeerCredentials},
};
use rustix::{
    io::Errno,
    net::{
        AddressFamily, RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags,
        ReturnFlags, SendAncillaryBuffer, SendAncillaryMessage, SendFlags,
        SocketAddrUnix, SocketFlags, SocketType, bind, listen, recvmsg,
        sendmsg, socket_with,
    },
};
use snafu::{ResultExt, Snafu, ensure};
use tracing::{debug, warn};

use crate::protocol_common::{MAX_FDS, WireResponse};

/// Descriptor room in the receive control buffer. Larger than a valid
/// response needs so an oversized send shows up as a count mismatch instead
/// of truncation.
const RECV_FD_SLOTS: usize = 4 * MAX_FDS;
/// Payload room for one recvmsg; anything past a full response is an error.
const RECV_PAYLOAD_LEN: usize = 2 * WireResponse::SIZE;
const SOCKET_MODE: u32 = 0o600;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TransportError {
    #[snafu(display(
        "socket path {} is {len} bytes, at most {max} fit",
        path.display()
    ))]
    PathTooLong { path: PathBuf, len: usize, max: usize },
    #[snafu(display("{} exists and is not a socket", path.display()))]
    NotASocket { path: PathBuf },
    #[snafu(display("cannot prepare {}: {source}", path.display()))]
    Prepare {
        path: PathBuf,
        source: io::Error,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },
    #[snafu(display("cannot create socket: {source}"))]
    Socket { source: Errno },
    #[snafu(display("cannot bind {}: {source}", path.display()))]
    Bind { path: PathBuf, source: Errno },
    #[snafu(display("cannot listen on {}: {source}", path.display()))]
    Listen { path: PathBuf, source: Errno },
    #[snafu(display("poll failed: {source}"))]
    Poll { source: NixErrno },
    #[snafu(display("nothing arrived within {timeout:?}"))]
    Timeout { timeout: Duration },
    #[snafu(display("accept failed: {source}"))]
    Accept {
        source: io::Error,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },
    #[snafu(display("cannot set receive timeout: {source}"))]
    SetTimeout { source: io::Error },
    #[snafu(display("recvmsg failed: {source}"))]
    Receive { source: Errno },
    #[snafu(display("peer closed the connection without a message"))]
    PeerClosed {},
    #[snafu(display(
        "control data was truncated, {received} descriptors made it"
    ))]
    AncillaryTruncated { received: usize },
    #[snafu(display("cannot connect to {}: {source}", path.display()))]
    Connect {
        path: PathBuf,
        source: io::Error,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },
    #[snafu(display("{count} descriptors to send, at most {MAX_FDS} fit"))]
    TooManyDescriptors { count: usize },
    #[snafu(display("sendmsg failed: {source}"))]
    Send { source: Errno },
    #[snafu(display("short send: {sent} of {len} bytes"))]
    ShortSend { sent: usize, len: usize },
}

/// Metadata bytes and the descriptors that travelled with them.
#[derive(Debug, Default)]
pub struct TransportMessage {
    pub payload: Vec<u8>,
    pub descriptors: Vec<OwnedFd>,
}

/// Longest path that fits in `sockaddr_un.sun_path` with its NUL.
pub fn max_socket_path_len() -> usize {
    std::mem::size_of::<libc::sockaddr_un>()
        - std::mem::size_of::<libc::sa_family_t>()
        - 1
}

pub fn check_socket_path(path: &Path) -> Result<(), TransportError> {
    let len = path.as_os_str().len();
    let max = max_socket_path_len();
    ensure!(len <= max, PathTooLongSnafu { path, len, max });
    Ok(())
}

/// Unlinks the socket path on drop, as long as the path still names the
/// socket this guard was created for.
#[derive(Debug)]
pub struct SocketGuard {
    path: PathBuf,
    dev: u64,
    ino: u64,
}

impl SocketGuard {
    fn new(path: &Path) -> io::Result<Self> {
        let md = fs::symlink_metadata(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            dev: md.dev(),
            ino: md.ino(),
        })
    }
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        match fs::symlink_metadata(&self.path) {
            Ok(md) if md.dev() == self.dev && md.ino() == self.ino => {
                let _ = fs::remove_file(&self.path);
            }
            Ok(_) => debug!(
                path = %self.path.display(),
                "socket was replaced, leaving it"
            ),
            Err(_) => {}
        }
    }
}

// only a leftover socket may be replaced, anything else is somebody's file
fn remove_stale_socket(path: &Path) -> Result<(), TransportError> {
    if let Ok(md) = fs::symlink_metadata(path) {
        ensure!(md.file_type().is_socket(), NotASocketSnafu { path });
        debug!(path = %path.display(), "removing stale socket");
        fs::remove_file(path).context(PrepareSnafu { path })?;
    }
    Ok(())
}

/// Listening end. Accepts a single connection.
#[derive(Debug)]
pub struct HandleServer {
    listener: UnixListener,
    path: PathBuf,
    _guard: SocketGuard,
}

impl HandleServer {
    pub fn bind(path: &Path) -> Result<Self, TransportError> {
        check_socket_path(path)?;
        remove_stale_socket(path)?;

        let fd = socket_with(
            AddressFamily::UNIX,
            SocketType::STREAM,
            SocketFlags::CLOEXEC,
            None,
        )
        .context(SocketSnafu)?;
        let addr = SocketAddrUnix::new(path).context(BindSnafu { path })?;
        bind(&fd, &addr).context(BindSnafu { path })?;
        let guard = SocketGuard::new(path).context(PrepareSnafu { path })?;
        fs::set_permissions(path, fs::Permissions::from_mode(SOCKET_MODE))
            .context(PrepareSnafu { path })?;
        listen(&fd, 1).context(ListenSnafu { path })?;

        debug!(path = %path.display(), "listening");
        Ok(Self {
            listener: UnixListener::from(fd),
            path: path.to_path_buf(),
            _guard: guard,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Waits at most `timeout` for a peer. Interrupted waits resume with
    /// whatever time is left.
    pub fn accept(
        &self,
        timeout: Duration,
    ) -> Result<Connection, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            ensure!(!remaining.is_zero(), TimeoutSnafu { timeout });
            let mut fds = [PollFd::new(self.listener.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, poll_timeout(remaining)) {
                Ok(0) | Err(NixErrno::EINTR) => {}
                Ok(_) => break,
                Err(source) => return Err(source).context(PollSnafu),
            }
        }

        let (stream, _) = self.listener.accept().context(AcceptSnafu)?;
        let connection = Connection { stream };
        debug!(peer = ?connection.peer_pid(), "accepted connection");
        Ok(connection)
    }
}

// round up so a sub-millisecond remainder doesn't spin
fn poll_timeout(remaining: Duration) -> PollTimeout {
    let ms = remaining.as_micros().div_ceil(1000);
    PollTimeout::from(u16::try_from(ms).unwrap_or(u16::MAX))
}

/// An accepted peer.
#[derive(Debug)]
pub struct Connection {
    stream: UnixStream,
}

impl Connection {
    pub fn peer_pid(&self) -> Option<i32> {
        getsockopt(&self.stream.as_fd(), PeerCredentials)
            .ok()
            .map(|creds| creds.pid())
    }

    /// Receives one message. Descriptors arrive close-on-exec and are
    /// owned by the returned message, or closed if an error is returned.
    pub fn receive(
        &self,
        timeout: Duration,
    ) -> Result<TransportMessage, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut payload = vec![0u8; RECV_PAYLOAD_LEN];
        let mut space = vec![
            MaybeUninit::<u8>::uninit();
            rustix::cmsg_space!(ScmRights(RECV_FD_SLOTS))
        ];
        let mut control = RecvAncillaryBuffer::new(&mut space);

        let received = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            ensure!(!remaining.is_zero(), TimeoutSnafu { timeout });
            self.stream
                .set_read_timeout(Some(remaining))
                .context(SetTimeoutSnafu)?;
            match recvmsg(
                &self.stream,
                &mut [IoSliceMut::new(&mut payload)],
                &mut control,
                RecvFlags::CMSG_CLOEXEC,
            ) {
                Err(Errno::INTR) => {}
                Err(Errno::AGAIN) => return TimeoutSnafu { timeout }.fail(),
                other => break other.context(ReceiveSnafu)?,
            }
        };

        let descriptors: Vec<OwnedFd> = control
            .drain()
            .filter_map(|msg| match msg {
                RecvAncillaryMessage::ScmRights(fds) => Some(fds),
                _ => None,
            })
            .flatten()
            .collect();
        ensure!(
            !received.flags.contains(ReturnFlags::CTRUNC),
            AncillaryTruncatedSnafu {
                received: descriptors.len(),
            }
        );
        if received.bytes == 0 && descriptors.is_empty() {
            return PeerClosedSnafu.fail();
        }
        if received.flags.contains(ReturnFlags::TRUNC) {
            warn!(bytes = received.bytes, "payload was truncated");
        }

        payload.truncate(received.bytes);
        debug!(
            bytes = payload.len(),
            fds = descriptors.len(),
            "received message"
        );
        Ok(TransportMessage {
            payload,
            descriptors,
        })
    }
}

/// Connects to `path` and sends `message` in a single sendmsg.
/// Returns the number of payload bytes sent.
pub fn send_message(
    path: &Path,
    message: &TransportMessage,
) -> Result<usize, TransportError> {
    check_socket_path(path)?;
    let count = message.descriptors.len();
    ensure!(count <= MAX_FDS, TooManyDescriptorsSnafu { count });

    let stream = UnixStream::connect(path).context(ConnectSnafu { path })?;
    let fds: Vec<BorrowedFd<'_>> =
        message.descriptors.iter().map(AsFd::as_fd).collect();
    let mut space = vec![
        MaybeUninit::<u8>::uninit();
        rustix::cmsg_space!(ScmRights(MAX_FDS))
    ];
    let mut control = SendAncillaryBuffer::new(&mut space);
    if !fds.is_empty() {
        ensure!(
            control.push(SendAncillaryMessage::ScmRights(&fds)),
            TooManyDescriptorsSnafu { count }
        );
    }

    let sent = loop {
        match sendmsg(
            &stream,
            &[IoSlice::new(&message.payload)],
            &mut control,
            SendFlags::NOSIGNAL,
        ) {
            Err(Errno::INTR) => {}
            other => break other.context(SendSnafu)?,
        }
    };
    ensure!(
        sent == message.payload.len(),
        ShortSendSnafu {
            sent,
            len: message.payload.len(),
        }
    );
    debug!(bytes = sent, fds = count, "sent message");
    Ok(sent)
}

/// Connects and closes without sending, so a waiting server stops waiting.
pub fn hang_up(path: &Path) -> Result<(), TransportError> {
    check_socket_path(path)?;
    let stream = UnixStream::connect(path).context(ConnectSnafu { path })?;
    drop(stream);
    Ok(())
}
