pub mod ssh;

use crate::{errors::ChannelError, target::Target};
use async_trait::async_trait;
use std::{
    fmt,
    path::{Path, PathBuf},
};

/// Local files receiving the output of a detached command. They are written by the transport
/// process on the controller's machine, not by the remote side.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSinks {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl OutputSinks {
    pub fn new(stdout: impl Into<PathBuf>, stderr: impl Into<PathBuf>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    /// `<dir>/<stem>.stdout.log` and `<dir>/<stem>.stderr.log`
    pub fn in_dir(dir: &Path, stem: &str) -> Self {
        Self::new(
            dir.join(format!("{stem}.stdout.log")),
            dir.join(format!("{stem}.stderr.log")),
        )
    }
}

/// One end of a file copy.
#[derive(Debug, Clone, PartialEq)]
pub enum Location {
    Local(PathBuf),
    Remote { target: Target, path: String },
}

impl Location {
    pub fn remote(target: &Target, path: impl Into<String>) -> Self {
        Location::Remote {
            target: target.clone(),
            path: path.into(),
        }
    }

    pub fn target(&self) -> Option<&Target> {
        match self {
            Location::Local(_) => None,
            Location::Remote { target, .. } => Some(target),
        }
    }

    /// Renders the location as a copy argument, remote ends as `user@[address]:path`.
    pub fn render(&self, user: &str) -> String {
        match self {
            Location::Local(path) => path.to_string_lossy().into_owned(),
            Location::Remote { target, path } => format!("{}:{}", target.copy_prefix(user), path),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Local(path) => write!(f, "{}", path.display()),
            Location::Remote { target, path } => write!(f, "[{target}]:{path}"),
        }
    }
}

/// The secure remote-shell channel every remote operation goes through. Commands are opaque
/// strings passed verbatim to the target's shell.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Runs `command` on `target` and blocks until it terminates, returning its exit code.
    async fn exec(&self, target: &Target, command: &str) -> Result<i32, ChannelError>;

    /// Starts `command` on `target` without waiting for it.
    async fn spawn(
        &self,
        target: &Target,
        command: &str,
        sinks: &OutputSinks,
    ) -> Result<Box<dyn RemoteProcess>, ChannelError>;

    /// Copies a single file, returning the exit code of the copy.
    async fn copy(&self, source: &Location, destination: &Location) -> Result<i32, ChannelError>;
}

/// A transport process started by [`Transport::spawn`].
#[async_trait]
pub trait RemoteProcess: Send + Sync {
    /// Waits for the process to exit. Must be cancel safe: dropping the future leaves the
    /// process running and a later call resumes waiting.
    async fn wait(&mut self) -> Result<i32, ChannelError>;

    /// Returns true once the process has exited.
    fn has_exited(&mut self) -> bool;

    /// Stops the transport process, which closes the remote session.
    fn terminate(&mut self) -> Result<(), ChannelError>;
}
