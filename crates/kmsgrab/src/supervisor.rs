//! Starting the helper process and collecting its exit status.

use std::{
    ffi::OsString,
    fmt, fs, io,
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    thread,
};

use kmsgrab_common::protocol_common::HelperExitCode;
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::{debug, info};

use crate::config::{BrokerConfig, ReapPolicy};

#[derive(Debug, Snafu)]
pub enum SpawnError {
    #[snafu(display("cannot locate the running executable: {source}"))]
    InstallDir { source: io::Error },
    #[snafu(display("running executable {} has no parent directory", exe.display()))]
    NoInstallDir { exe: PathBuf },
    #[snafu(display("helper binary {} not found", path.display()))]
    HelperNotFound { path: PathBuf },
    #[snafu(display("cannot start {}: {source}", program.display()))]
    Spawn { program: PathBuf, source: io::Error },
}

#[derive(Debug, Snafu)]
pub enum ReapError {
    #[snafu(display(
        "helper still running after {waited:?}, expect zombies"
    ))]
    StillRunning { waited: std::time::Duration },
    #[snafu(display("cannot wait for helper: {source}"))]
    Wait { source: io::Error },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperExit {
    Code(i32),
    Signal(i32),
}

impl HelperExit {
    pub fn success(self) -> bool {
        self == HelperExit::Code(0)
    }

    /// The helper's own reason for exiting, if the code is one it uses.
    pub fn helper_code(self) -> Option<HelperExitCode> {
        match self {
            HelperExit::Code(code) => HelperExitCode::from_exit_code(code),
            HelperExit::Signal(_) => None,
        }
    }
}

impl From<ExitStatus> for HelperExit {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => HelperExit::Code(code),
            (None, Some(signal)) => HelperExit::Signal(signal),
            (None, None) => HelperExit::Code(-1),
        }
    }
}

impl fmt::Display for HelperExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HelperExit::Code(code) => match HelperExitCode::from_exit_code(*code)
            {
                Some(known) => write!(f, "exit code {code} ({known:?})"),
                None => write!(f, "exit code {code}"),
            },
            HelperExit::Signal(signal) => write!(f, "signal {signal}"),
        }
    }
}

/// A running helper.
pub trait Helper {
    fn pid(&self) -> Option<u32>;

    /// Non-blocking exit check.
    fn try_exit(&mut self) -> io::Result<Option<HelperExit>>;

    /// Polls for exit at most `policy.attempts` times, sleeping
    /// `policy.interval` between polls.
    fn reap(&mut self, policy: &ReapPolicy) -> Result<HelperExit, ReapError> {
        for attempt in 0..policy.attempts {
            if let Some(exit) = self.try_exit().context(WaitSnafu)? {
                debug!(attempt, %exit, "helper exited");
                return Ok(exit);
            }
            thread::sleep(policy.interval);
        }
        StillRunningSnafu {
            waited: policy.max_wait(),
        }
        .fail()
    }
}

/// Starts helpers.
pub trait Launcher {
    type Helper: Helper;

    /// Starts the helper against `device`, telling it to connect to
    /// `socket_path`.
    fn launch(
        &mut self,
        device: &Path,
        socket_path: &Path,
    ) -> Result<Self::Helper, SpawnError>;

    /// Helper binary, for error messages.
    fn program(&self) -> &Path;
}

/// Runs the helper binary as a child process, optionally behind an
/// elevation wrapper.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    helper: PathBuf,
    elevate_with: Option<OsString>,
    log_path: Option<PathBuf>,
}

impl ProcessLauncher {
    pub fn new(helper: impl Into<PathBuf>) -> Self {
        Self {
            helper: helper.into(),
            elevate_with: None,
            log_path: None,
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Result<Self, SpawnError> {
        let dir = match &config.helper_dir {
            Some(dir) => dir.clone(),
            None => install_dir()?,
        };
        Ok(Self {
            helper: dir.join(&config.helper_name),
            elevate_with: config.elevate_with.clone(),
            log_path: config.helper_log_path.clone(),
        })
    }

    pub fn elevate_with(mut self, wrapper: impl Into<OsString>) -> Self {
        self.elevate_with = Some(wrapper.into());
        self
    }
}

fn install_dir() -> Result<PathBuf, SpawnError> {
    let exe = std::env::current_exe().context(InstallDirSnafu)?;
    let dir = exe.parent().context(NoInstallDirSnafu { exe: &exe })?;
    Ok(dir.to_path_buf())
}

impl Launcher for ProcessLauncher {
    type Helper = ProcessHandle;

    fn launch(
        &mut self,
        device: &Path,
        socket_path: &Path,
    ) -> Result<ProcessHandle, SpawnError> {
        // the wrapper may run with a different cwd, so hand it an absolute
        // path
        let helper = fs::canonicalize(&self.helper)
            .ok()
            .filter(|p| p.is_file())
            .context(HelperNotFoundSnafu { path: &self.helper })?;

        let mut command = match &self.elevate_with {
            Some(wrapper) => {
                let mut command = Command::new(wrapper);
                command.arg(&helper);
                command
            }
            None => Command::new(&helper),
        };
        command.arg(device).arg(socket_path).stdin(Stdio::null());
        if let Some(log_path) = &self.log_path {
            command.arg("--log-path").arg(log_path);
        }

        info!(
            helper = %helper.display(),
            wrapper = ?self.elevate_with,
            device = %device.display(),
            "starting helper"
        );
        let child = command.spawn().context(SpawnSnafu {
            program: command.get_program(),
        })?;
        debug!(pid = child.id(), "helper started");
        Ok(ProcessHandle {
            child,
            program: helper,
        })
    }

    fn program(&self) -> &Path {
        &self.helper
    }
}

#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    program: PathBuf,
}

impl ProcessHandle {
    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn kill(&mut self) -> io::Result<()> {
        self.child.kill()
    }
}

impl Helper for ProcessHandle {
    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn try_exit(&mut self) -> io::Result<Option<HelperExit>> {
        Ok(self.child.try_wait()?.map(HelperExit::from))
    }
}
