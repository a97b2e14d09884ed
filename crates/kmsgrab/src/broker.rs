//! One round trip with the helper: bind, launch, accept, receive, reap.

use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use kmsgrab_common::{
    handle_table::FramebufferList,
    protocol_common::{
        HelperExitCode, MAX_FRAMEBUFFERS, ProtocolError, fourcc_name,
    },
    transport::{HandleServer, TransportError},
};
use snafu::{ResultExt, Snafu};
use tracing::{debug, info, warn};

use crate::{
    config::{BrokerConfig, ConfigError},
    supervisor::{
        Helper, HelperExit, Launcher, ProcessLauncher, SpawnError,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrokerState {
    #[default]
    Idle,
    Listening,
    WaitingForHelper,
    Exchanging,
    Reaping,
    Done,
    Failed,
}

#[derive(Debug, Snafu)]
pub enum BrokerError {
    #[snafu(display("{source}"))]
    Config { source: ConfigError },
    #[snafu(display("cannot start helper: {source}"))]
    Spawn { source: SpawnError },
    #[snafu(display(
        "helper did not connect within {timeout:?}; check that it can run \
         and has the privileges it needs"
    ))]
    Timeout { timeout: Duration },
    #[snafu(display("exchange with helper failed: {source}"))]
    Transport { source: TransportError },
    #[snafu(display("helper sent a bad response: {source}"))]
    Protocol { source: ProtocolError },
    #[snafu(display(
        "helper could not export the framebuffers of {}. It probably lacks \
         privileges: do `sudo setcap cap_sys_admin+ep {}` or configure an \
         elevation wrapper",
        device.display(),
        helper.display()
    ))]
    Enumeration { device: PathBuf, helper: PathBuf },
    #[snafu(display(
        "{} shows more than {max} framebuffers",
        device.display()
    ))]
    Capacity { device: PathBuf, max: usize },
    #[snafu(display("helper failed with {exit}"))]
    HelperFailed { exit: HelperExit },
}

static NEXT_FETCH: AtomicU64 = AtomicU64::new(0);

// only a missing connection is a helper timeout; a stalled peer is not
fn accept_error(source: TransportError) -> BrokerError {
    match source {
        TransportError::Timeout { timeout } => BrokerError::Timeout { timeout },
        source => BrokerError::Transport { source },
    }
}

/// Fetches framebuffer lists through a helper. Each fetch is independent.
#[derive(Debug)]
pub struct Broker<L: Launcher = ProcessLauncher> {
    config: BrokerConfig,
    launcher: L,
    state: BrokerState,
}

impl Broker<ProcessLauncher> {
    pub fn new(config: BrokerConfig) -> Result<Self, BrokerError> {
        let launcher =
            ProcessLauncher::from_config(&config).context(SpawnSnafu)?;
        Ok(Self::with_launcher(config, launcher))
    }
}

impl<L: Launcher> Broker<L> {
    pub fn with_launcher(config: BrokerConfig, launcher: L) -> Self {
        Self {
            config,
            launcher,
            state: BrokerState::Idle,
        }
    }

    pub fn state(&self) -> BrokerState {
        self.state
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    fn transition(&mut self, next: BrokerState) {
        debug!(from = ?self.state, to = ?next, "broker");
        self.state = next;
    }

    /// Runs the helper against `device` and returns what it exported. The
    /// socket is unlinked and the helper reaped on every path out.
    pub fn fetch(
        &mut self,
        device: &Path,
    ) -> Result<FramebufferList, BrokerError> {
        self.transition(BrokerState::Idle);
        let result = self.fetch_inner(device);
        match &result {
            Ok(list) => {
                log_framebuffers(list);
                self.transition(BrokerState::Done);
            }
            Err(e) => {
                warn!(device = %device.display(), error = %e, "fetch failed");
                self.transition(BrokerState::Failed);
            }
        }
        result
    }

    fn fetch_inner(
        &mut self,
        device: &Path,
    ) -> Result<FramebufferList, BrokerError> {
        let fetch = NEXT_FETCH.fetch_add(1, Ordering::Relaxed);
        let socket_path =
            self.config.socket_path(fetch).context(ConfigSnafu)?;
        self.config.ensure_runtime_dir().context(ConfigSnafu)?;
        let server =
            HandleServer::bind(&socket_path).context(TransportSnafu)?;
        self.transition(BrokerState::Listening);

        let mut helper = self
            .launcher
            .launch(device, &socket_path)
            .context(SpawnSnafu)?;
        self.transition(BrokerState::WaitingForHelper);

        let exchanged = self.exchange(&server, &helper);
        drop(server);

        self.transition(BrokerState::Reaping);
        let exit = match helper.reap(&self.config.reap) {
            Ok(exit) => Some(exit),
            Err(e) => {
                warn!(error = %e, "couldn't reap helper");
                None
            }
        };

        match exchanged {
            Ok(list) => {
                if let Some(exit) = exit.filter(|exit| !exit.success()) {
                    warn!(%exit, "helper failed after a complete exchange");
                }
                Ok(list)
            }
            Err(BrokerError::Transport {
                source: TransportError::PeerClosed {},
            }) => Err(self.helper_failure(device, exit)),
            Err(e) => Err(e),
        }
    }

    fn exchange(
        &mut self,
        server: &HandleServer,
        helper: &L::Helper,
    ) -> Result<FramebufferList, BrokerError> {
        let connection = server
            .accept(self.config.accept_timeout)
            .map_err(accept_error)?;
        self.transition(BrokerState::Exchanging);

        match (connection.peer_pid(), helper.pid()) {
            (Some(peer), Some(pid)) if u32::try_from(peer).ok() != Some(pid) => {
                debug!(peer, pid, "peer is not the spawned process itself");
            }
            (peer, _) => debug!(?peer, "helper connected"),
        }

        let message = connection
            .receive(self.config.receive_timeout)
            .context(TransportSnafu)?;
        drop(connection);
        FramebufferList::from_message(message).context(ProtocolSnafu)
    }

    // helper hung up without sending; its exit code says why
    fn helper_failure(
        &self,
        device: &Path,
        exit: Option<HelperExit>,
    ) -> BrokerError {
        match exit.and_then(HelperExit::helper_code) {
            Some(HelperExitCode::NoUsablePlanes | HelperExitCode::Export) => {
                BrokerError::Enumeration {
                    device: device.to_path_buf(),
                    helper: self.launcher.program().to_path_buf(),
                }
            }
            Some(HelperExitCode::CapacityExceeded) => BrokerError::Capacity {
                device: device.to_path_buf(),
                max: MAX_FRAMEBUFFERS,
            },
            _ => match exit {
                Some(exit) if !exit.success() => {
                    BrokerError::HelperFailed { exit }
                }
                _ => BrokerError::Transport {
                    source: TransportError::PeerClosed {},
                },
            },
        }
    }
}

fn log_framebuffers(list: &FramebufferList) {
    info!(
        framebuffers = list.framebuffers().len(),
        fds = list.num_fds(),
        "received framebuffers"
    );
    for (i, fb) in list.framebuffers().iter().enumerate() {
        info!(
            index = i,
            id = format_args!("{:#x}", fb.id),
            width = fb.width,
            height = fb.height,
            fourcc = %fourcc_name(fb.fourcc),
            modifier = format_args!("{:#x}", fb.modifier),
            planes = fb.planes.len(),
            "framebuffer"
        );
        for (p, plane) in fb.planes.iter().enumerate() {
            debug!(
                plane = p,
                fd_index = plane.fd_index,
                pitch = plane.pitch,
                offset = plane.offset,
                "plane"
            );
        }
    }
}
