use crate::{
    errors::ChannelError,
    target::Target,
    transport::{OutputSinks, RemoteProcess, Transport},
};
use chrono::{DateTime, Utc};
use colored::Colorize;
use futures_util::future::join_all;
use std::{
    collections::BTreeMap,
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of a remote command that ran to completion. A non-zero `exit_code` means the command
/// ran and failed; it is recorded, never raised.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    pub target: Target,
    pub exit_code: i32,
    pub duration: Duration,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone)]
pub struct CommandInvocation {
    pub target: Target,
    pub command: String,
    pub sinks: Option<OutputSinks>,
    pub started_at: DateTime<Utc>,
}

/// Per-target results of a fan-out. Every target the operation was dispatched to has an entry,
/// whether it succeeded, failed or could not be reached.
#[derive(Debug, Clone, Default)]
pub struct FleetResults(BTreeMap<Target, Result<CommandResult, ChannelError>>);

impl FleetResults {
    pub fn get(&self, target: &Target) -> Option<&Result<CommandResult, ChannelError>> {
        self.0.get(target)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Target, &Result<CommandResult, ChannelError>)> {
        self.0.iter()
    }

    pub fn targets(&self) -> impl Iterator<Item = &Target> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn exit_code(&self, target: &Target) -> Option<i32> {
        match self.0.get(target) {
            Some(Ok(result)) => Some(result.exit_code),
            _ => None,
        }
    }

    pub fn succeeded(&self) -> Vec<Target> {
        self.filter_targets(|result| matches!(result, Ok(r) if r.success()))
    }

    pub fn failed(&self) -> Vec<Target> {
        self.filter_targets(|result| !matches!(result, Ok(r) if r.success()))
    }

    pub fn unreachable(&self) -> Vec<Target> {
        self.filter_targets(Result::is_err)
    }

    pub fn all_succeeded(&self) -> bool {
        self.0.values().all(|result| matches!(result, Ok(r) if r.success()))
    }

    pub fn into_inner(self) -> BTreeMap<Target, Result<CommandResult, ChannelError>> {
        self.0
    }

    fn filter_targets<F>(&self, pred: F) -> Vec<Target>
    where
        F: Fn(&Result<CommandResult, ChannelError>) -> bool,
    {
        self.0
            .iter()
            .filter(|(_, result)| pred(result))
            .map(|(target, _)| target.clone())
            .collect()
    }
}

impl IntoIterator for FleetResults {
    type Item = (Target, Result<CommandResult, ChannelError>);
    type IntoIter = std::collections::btree_map::IntoIter<Target, Result<CommandResult, ChannelError>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromIterator<(Target, Result<CommandResult, ChannelError>)> for FleetResults {
    fn from_iter<I: IntoIterator<Item = (Target, Result<CommandResult, ChannelError>)>>(
        iter: I,
    ) -> Self {
        FleetResults(iter.into_iter().collect())
    }
}

/// Runs shell commands on targets through a [`Transport`], one at a time or fanned out across
/// the fleet. Cloning is cheap and clones share the transport and cancellation token.
#[derive(Clone)]
pub struct RemoteExecutor {
    transport: Arc<dyn Transport>,
    timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl RemoteExecutor {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// A clone that ignores the shared cancellation token, for cleanup that has to run after an
    /// interrupt.
    pub fn detached_from_cancellation(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            timeout: self.timeout,
            cancel: CancellationToken::new(),
        }
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn run(&self, target: &Target, command: &str) -> Result<CommandResult, ChannelError> {
        info!("{}: running {}", target.to_string().blue(), command);
        let start = Instant::now();

        let exit_code = self
            .bounded(target, self.transport.exec(target, command))
            .await?;

        let result = CommandResult {
            target: target.clone(),
            exit_code,
            duration: start.elapsed(),
        };
        let status = if result.success() {
            "OK".green()
        } else {
            format!("rc={exit_code}").red()
        };
        debug!("{}: {} done running {}", target.to_string().blue(), status, command);
        Ok(result)
    }

    /// Runs the same command on every target concurrently and waits for all of them. A failure on
    /// one target never cuts the others short.
    pub async fn run_parallel(&self, targets: &[Target], command: &str) -> FleetResults {
        self.run_each(
            targets
                .iter()
                .map(|target| (target.clone(), command.to_string())),
        )
        .await
    }

    /// Runs a distinct command per target concurrently and waits for all of them. Targets must be
    /// unique.
    pub async fn run_each<I>(&self, jobs: I) -> FleetResults
    where
        I: IntoIterator<Item = (Target, String)>,
    {
        let mut join_set = JoinSet::new();
        let mut dispatched = vec![];

        for (target, command) in jobs {
            dispatched.push(target.clone());
            let executor = self.clone();
            join_set.spawn(async move {
                let result = executor.run(&target, &command).await;
                (target, result)
            });
        }

        let mut results = BTreeMap::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((target, result)) => {
                    results.insert(target, result);
                }
                Err(err) => warn!("fan-out task did not complete: {err}"),
            }
        }

        // a panicked task loses its target, so it is filled back in here
        for target in dispatched {
            results
                .entry(target.clone())
                .or_insert(Err(ChannelError::Aborted { target }));
        }

        FleetResults(results)
    }

    /// Starts a long-running command and returns straight away. The returned handle owns the
    /// remote session and must be waited on or terminated.
    pub async fn run_detached(
        &self,
        target: &Target,
        command: &str,
        sinks: OutputSinks,
    ) -> Result<DetachedHandle, ChannelError> {
        if self.cancel.is_cancelled() {
            return Err(ChannelError::Interrupted {
                target: target.clone(),
            });
        }
        info!(
            "{}: running detached {} (logs in {})",
            target.to_string().blue(),
            command,
            sinks.stdout.display()
        );
        let process = self.transport.spawn(target, command, &sinks).await?;
        Ok(DetachedHandle::new(
            CommandInvocation {
                target: target.clone(),
                command: command.to_string(),
                sinks: Some(sinks),
                started_at: Utc::now(),
            },
            process,
        ))
    }

    /// Launches every job detached, then waits on all of them. Results come back in job order;
    /// a job that could not be launched reports its channel error.
    pub async fn run_batch_detached(
        &self,
        jobs: Vec<(Target, String, OutputSinks)>,
    ) -> Vec<(Target, Result<CommandResult, ChannelError>)> {
        let mut launched = vec![];
        for (target, command, sinks) in jobs {
            let handle = self.run_detached(&target, &command, sinks).await;
            launched.push((target, handle));
        }

        let waits = launched.into_iter().map(|(target, handle)| async move {
            let result = match handle {
                Ok(handle) => handle.wait_or_cancel(&self.cancel).await,
                Err(err) => Err(err),
            };
            (target, result)
        });

        join_all(waits).await
    }

    async fn bounded<F>(&self, target: &Target, fut: F) -> Result<i32, ChannelError>
    where
        F: Future<Output = Result<i32, ChannelError>>,
    {
        let timed = async {
            match self.timeout {
                Some(after) => tokio::time::timeout(after, fut)
                    .await
                    .map_err(|_| ChannelError::Timeout {
                        target: target.clone(),
                        after,
                    })?,
                None => fut.await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ChannelError::Interrupted {
                target: target.clone(),
            }),
            result = timed => result,
        }
    }
}

/// Sole owner of a detached remote command. The command is released exactly once: by waiting on
/// it, by terminating it, or, as a last resort, by dropping the handle, which terminates it.
#[must_use = "a detached command must be waited on or terminated"]
pub struct DetachedHandle {
    invocation: CommandInvocation,
    process: Box<dyn RemoteProcess>,
    started: Instant,
    released: bool,
}

impl DetachedHandle {
    fn new(invocation: CommandInvocation, process: Box<dyn RemoteProcess>) -> Self {
        Self {
            invocation,
            process,
            started: Instant::now(),
            released: false,
        }
    }

    pub fn target(&self) -> &Target {
        &self.invocation.target
    }

    pub fn invocation(&self) -> &CommandInvocation {
        &self.invocation
    }

    pub async fn wait(mut self) -> Result<CommandResult, ChannelError> {
        let result = self.process.wait().await;
        self.released = true;
        result.map(|exit_code| self.result(exit_code))
    }

    /// Waits for the command unless `cancel` fires first, in which case the command is
    /// terminated and `Interrupted` is returned.
    pub async fn wait_or_cancel(
        mut self,
        cancel: &CancellationToken,
    ) -> Result<CommandResult, ChannelError> {
        let outcome = tokio::select! {
            result = self.process.wait() => Some(result),
            _ = cancel.cancelled() => None,
        };

        match outcome {
            Some(result) => {
                self.released = true;
                result.map(|exit_code| self.result(exit_code))
            }
            None => {
                warn!(
                    "{}: interrupted while waiting on {}",
                    self.invocation.target, self.invocation.command
                );
                if let Err(err) = self.release() {
                    warn!("{err}");
                }
                Err(ChannelError::Interrupted {
                    target: self.invocation.target.clone(),
                })
            }
        }
    }

    pub fn terminate(mut self) -> Result<(), ChannelError> {
        self.release()
    }

    fn release(&mut self) -> Result<(), ChannelError> {
        self.released = true;
        self.process.terminate()
    }

    fn result(&self, exit_code: i32) -> CommandResult {
        CommandResult {
            target: self.invocation.target.clone(),
            exit_code,
            duration: self.started.elapsed(),
        }
    }
}

impl Drop for DetachedHandle {
    fn drop(&mut self) {
        if !self.released && !self.process.has_exited() {
            warn!(
                "{}: handle for `{}` dropped without being waited on, terminating",
                self.invocation.target, self.invocation.command
            );
            if let Err(err) = self.process.terminate() {
                warn!("{err}");
            }
        }
    }
}
