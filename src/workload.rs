use crate::{
    config::{WorkloadConfig, WorkloadMode},
    errors::ChannelError,
    plan::distribute_load,
    remote::{CommandResult, FleetResults, RemoteExecutor},
    target::Target,
    transport::OutputSinks,
};
use itertools::Itertools;
use std::{collections::BTreeMap, path::Path, time::Duration};
use tracing::{info, warn};

/// Per-machine values substituted into the workload command.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation<'a> {
    pub target: &'a Target,
    pub load: u64,
    pub load_total: u64,
    pub iteration: usize,
}

/// Drives the load generators on the fleet for one iteration at a time.
#[derive(Clone)]
pub struct Workload {
    config: WorkloadConfig,
    executor: RemoteExecutor,
}

impl Workload {
    pub fn new(config: WorkloadConfig, executor: RemoteExecutor) -> Self {
        Self { config, executor }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.config.duration_secs)
    }

    pub fn render(&self, invocation: &Invocation, fleet: &[Target]) -> String {
        self.config
            .command
            .replace("{load_total}", &invocation.load_total.to_string())
            .replace("{load}", &invocation.load.to_string())
            .replace("{duration}", &self.config.duration_secs.to_string())
            .replace("{iteration}", &invocation.iteration.to_string())
            .replace("{targets}", &fleet.iter().join(","))
            .replace("{target}", invocation.target.address())
    }

    /// Runs the configured `kill_before` command everywhere. Failures are only logged.
    pub async fn kill_stale(&self, targets: &[Target]) {
        let Some(command) = &self.config.kill_before else {
            return;
        };
        let results = self.executor.run_parallel(targets, command).await;
        for target in results.failed() {
            warn!(phase = "kill_before", "{target}: `{command}` did not succeed");
        }
    }

    /// Ends the workload on every target after an interrupt by running `kill_before` outside the
    /// run's cancellation.
    pub async fn stop(&self, targets: &[Target]) {
        let Some(command) = &self.config.kill_before else {
            warn!(
                phase = "interrupt",
                "no kill_before command configured, workload may still be running on the targets"
            );
            return;
        };
        let cleanup = self.executor.detached_from_cancellation();
        let results = cleanup.run_parallel(targets, command).await;
        for target in results.failed() {
            warn!(phase = "interrupt", "{target}: `{command}` did not succeed");
        }
    }

    /// Runs the workload for one iteration on every target, splitting `load_total` across them,
    /// and waits for all of it to finish.
    pub async fn dispatch(
        &self,
        targets: &[Target],
        iteration: usize,
        load_total: u64,
        log_dir: &Path,
    ) -> FleetResults {
        let commands: Vec<(Target, String)> = targets
            .iter()
            .zip(distribute_load(load_total, targets.len()))
            .map(|(target, load)| {
                let invocation = Invocation {
                    target,
                    load,
                    load_total,
                    iteration,
                };
                (target.clone(), self.render(&invocation, targets))
            })
            .collect();

        info!(
            "iteration {iteration}: dispatching load {load_total} over {} targets",
            targets.len()
        );

        match self.config.mode {
            WorkloadMode::Parallel => self.executor.run_each(commands).await,
            WorkloadMode::Batched => self.dispatch_batched(commands, log_dir).await,
        }
    }

    /// Launches `batch_size` detached copies per machine, then waits on all of them. A machine's
    /// result is its worst copy.
    async fn dispatch_batched(&self, commands: Vec<(Target, String)>, log_dir: &Path) -> FleetResults {
        let batch_size = self.config.batch_size.max(1);
        let jobs = commands
            .iter()
            .flat_map(|(target, command)| {
                (1..=batch_size).map(move |copy| {
                    let sinks = OutputSinks::in_dir(log_dir, &format!("workload-{target}-{copy}"));
                    (target.clone(), command.clone(), sinks)
                })
            })
            .collect();

        let mut per_target: BTreeMap<Target, Vec<Result<CommandResult, ChannelError>>> =
            BTreeMap::new();
        for (target, result) in self.executor.run_batch_detached(jobs).await {
            per_target.entry(target).or_default().push(result);
        }

        per_target
            .into_iter()
            .map(|(target, results)| {
                let worst = worst_of(&target, results);
                (target, worst)
            })
            .collect()
    }
}

fn worst_of(
    target: &Target,
    results: Vec<Result<CommandResult, ChannelError>>,
) -> Result<CommandResult, ChannelError> {
    let (completed, errors): (Vec<_>, Vec<_>) = results.into_iter().partition_result();
    if let Some(err) = errors.into_iter().next() {
        return Err(err);
    }

    let exit_code = completed
        .iter()
        .map(|r| r.exit_code)
        .find(|code| *code != 0)
        .unwrap_or(0);
    let duration = completed
        .iter()
        .map(|r| r.duration)
        .max()
        .unwrap_or_default();

    Ok(CommandResult {
        target: target.clone(),
        exit_code,
        duration,
    })
}
