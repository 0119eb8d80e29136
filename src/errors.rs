use crate::target::Target;
use std::{path::PathBuf, time::Duration};
use thiserror::Error;

/// The transport could not run a command on a target. A command that ran and exited non-zero is
/// not a `ChannelError`; it is a `CommandResult` with a non-zero exit code.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ChannelError {
    #[error("unable to reach {target}: {reason}")]
    Unreachable { target: Target, reason: String },

    #[error("failed to start transport for {target}: {reason}")]
    Spawn { target: Target, reason: String },

    #[error("command on {target} did not finish within {after:?}")]
    Timeout { target: Target, after: Duration },

    #[error("command on {target} was interrupted")]
    Interrupted { target: Target },

    #[error("task running a command on {target} was aborted")]
    Aborted { target: Target },
}

impl ChannelError {
    pub fn target(&self) -> &Target {
        match self {
            ChannelError::Unreachable { target, .. }
            | ChannelError::Spawn { target, .. }
            | ChannelError::Timeout { target, .. }
            | ChannelError::Interrupted { target }
            | ChannelError::Aborted { target } => target,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransferError {
    #[error("copying {source_path} to {destination} exited with code {exit_code}")]
    Failed {
        source_path: String,
        destination: String,
        exit_code: i32,
    },

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("{sources} sources cannot be paired with {destinations} destinations")]
    BatchMismatch { sources: usize, destinations: usize },

    #[error("unable to prepare local path {path:?}: {reason}")]
    LocalPath { path: PathBuf, reason: String },
}

/// Why a target could not be brought to the installed state. The collector that asked for the
/// bootstrap degrades to a no-op for that target.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BootstrapError {
    #[error("probe failed: {0}")]
    Probe(ChannelError),

    #[error("step `{step}` on {target} exited with code {exit_code}")]
    StepFailed {
        target: Target,
        step: String,
        exit_code: i32,
    },

    #[error("step `{step}` could not run: {source}")]
    StepUnreachable { step: String, source: ChannelError },

    #[error("pushing prerequisite to {target} failed: {source}")]
    Push {
        target: Target,
        source: TransferError,
    },
}

/// Failures that stop an experiment before its first iteration.
#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error("no targets configured")]
    EmptyTargets,

    #[error("iteration plan is empty")]
    EmptyPlan,

    #[error("target {0} is listed more than once")]
    DuplicateTarget(Target),

    #[error("none of the {count} targets could be reached")]
    FleetUnreachable { count: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unable to create output directory {path:?}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
