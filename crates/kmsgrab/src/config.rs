use std::{
    ffi::OsString,
    fs,
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use kmsgrab_common::transport::max_socket_path_len;
use snafu::{ResultExt, Snafu, ensure};

pub const SOCKET_FILE_PREFIX: &str = "kmsgrab-send";
pub const HELPER_BINARY_NAME: &str = "kmsgrab-send";
pub const DEFAULT_DEVICE: &str = "/dev/dri/card0";

pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display(
        "socket path {} is {len} bytes, at most {max} fit; pick a shorter \
         runtime directory",
        path.display()
    ))]
    PathTooLong { path: PathBuf, len: usize, max: usize },
    #[snafu(display("cannot create runtime directory {}: {source}", path.display()))]
    RuntimeDir { path: PathBuf, source: io::Error },
}

/// How long to wait for the helper to exit once the exchange is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for ReapPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval: Duration::from_millis(500),
        }
    }
}

impl ReapPolicy {
    pub fn max_wait(&self) -> Duration {
        self.interval * self.attempts
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// directory the rendezvous socket lives in
    pub runtime_dir: PathBuf,
    /// where the helper binary is; defaults to the directory of the running
    /// executable
    pub helper_dir: Option<PathBuf>,
    pub helper_name: OsString,
    /// program that runs the helper with elevated privileges, e.g. pkexec
    pub elevate_with: Option<OsString>,
    /// file the helper appends its logs to
    pub helper_log_path: Option<PathBuf>,
    pub accept_timeout: Duration,
    pub receive_timeout: Duration,
    pub reap: ReapPolicy,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            runtime_dir: default_runtime_dir(),
            helper_dir: None,
            helper_name: HELPER_BINARY_NAME.into(),
            elevate_with: None,
            helper_log_path: None,
            accept_timeout: DEFAULT_ACCEPT_TIMEOUT,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            reap: ReapPolicy::default(),
        }
    }
}

/// `$XDG_RUNTIME_DIR/kmsgrab`, or a directory under the system temp dir.
pub fn default_runtime_dir() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .filter(|dir| !dir.is_empty())
        .map_or_else(std::env::temp_dir, PathBuf::from)
        .join("kmsgrab")
}

impl BrokerConfig {
    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = dir.into();
        self
    }

    /// Rendezvous path of one fetch, checked against the `sun_path` limit.
    /// Distinct `(pid, fetch)` pairs never share a socket.
    pub fn socket_path(&self, fetch: u64) -> Result<PathBuf, ConfigError> {
        let path = self.runtime_dir.join(format!(
            "{SOCKET_FILE_PREFIX}.{}.{fetch}.sock",
            std::process::id()
        ));
        let len = path.as_os_str().len();
        let max = max_socket_path_len();
        ensure!(len <= max, PathTooLongSnafu { path, len, max });
        Ok(path)
    }

    pub fn ensure_runtime_dir(&self) -> Result<&Path, ConfigError> {
        fs::create_dir_all(&self.runtime_dir).context(RuntimeDirSnafu {
            path: &self.runtime_dir,
        })?;
        Ok(&self.runtime_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.accept_timeout, Duration::from_secs(5));
        assert_eq!(config.reap.attempts, 10);
        assert_eq!(config.reap.max_wait(), Duration::from_secs(5));
        assert_eq!(config.helper_name, "kmsgrab-send");
        assert!(config.runtime_dir.ends_with("kmsgrab"));
    }

    #[test]
    fn test_socket_path_is_in_runtime_dir() {
        let config =
            BrokerConfig::default().with_runtime_dir("/run/user/1000/kmsgrab");
        let path = config.socket_path(3).expect("short path");
        assert_eq!(path.parent(), Some(Path::new("/run/user/1000/kmsgrab")));
        let expected = format!("kmsgrab-send.{}.3.sock", std::process::id());
        assert_eq!(
            path.file_name().and_then(|name| name.to_str()),
            Some(expected.as_str())
        );
        assert_ne!(config.socket_path(4).expect("short path"), path);
    }

    #[test]
    fn test_socket_path_too_long() {
        let long = format!("/{}", "d".repeat(max_socket_path_len()));
        let config = BrokerConfig::default().with_runtime_dir(long);
        let err = config.socket_path(0).unwrap_err();
        assert!(matches!(err, ConfigError::PathTooLong { .. }), "{err}");
    }

    #[test]
    fn test_ensure_runtime_dir_creates_parents() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join("a").join("b");
        let config = BrokerConfig::default().with_runtime_dir(&dir);
        assert_eq!(config.ensure_runtime_dir().expect("created"), dir);
        assert!(dir.is_dir());
    }
}
