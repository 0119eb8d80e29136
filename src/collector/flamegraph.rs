use super::{
    ArtifactStatus, CollectorOutcome, CollectorState, Instrumentation, IterationContext, Lifecycle,
    MetricCollector,
};
use crate::{
    bootstrap::{ArtifactPush, BootstrapState, Bootstrapper, InstallPlan},
    config::{FlamegraphConfig, TuningPolicy},
    remote::{DetachedHandle, RemoteExecutor},
    target::Target,
    transfer::ArtifactTransfer,
    transport::OutputSinks,
};
use async_trait::async_trait;
use colored::Colorize;
use futures_util::future::join_all;
use std::{collections::BTreeMap, mem, path::Path};
use tracing::{info, warn};

const NAME: &str = "flamegraph";

/// Lets unprivileged samplers read kernel events.
const PERF_PARANOID_TUNING: &str = "echo -1 | sudo tee /proc/sys/kernel/perf_event_paranoid";

/// Profiles the benchmarked process on every instrumented target for the length of each
/// iteration and fetches the resulting `flamegraph.svg`.
///
/// Stopping is a two-step protocol: the sampler (`perf`) is signalled on its own, since stopping
/// only the `flamegraph` wrapper leaves the sampler running and no svg gets written. The wrapper
/// then renders the svg and exits, and only after it has exited is the artifact pulled.
pub struct FlamegraphCollector {
    config: FlamegraphConfig,
    executor: RemoteExecutor,
    transfer: ArtifactTransfer,
    bootstrapper: Bootstrapper,
    instrumentation: Instrumentation,
    lifecycle: Lifecycle,
    handles: BTreeMap<Target, DetachedHandle>,
    launch_failures: BTreeMap<Target, String>,
}

impl FlamegraphCollector {
    pub fn new(
        config: FlamegraphConfig,
        fleet: &[Target],
        executor: RemoteExecutor,
        transfer: ArtifactTransfer,
    ) -> Self {
        let targets: Vec<Target> = match &config.targets {
            Some(subset) => fleet
                .iter()
                .filter(|target| subset.contains(target))
                .cloned()
                .collect(),
            None => fleet.to_vec(),
        };

        let instrumentation = if config.enabled {
            Instrumentation::enabled_for(&targets)
        } else {
            Instrumentation::disabled_for(&targets)
        };

        Self {
            bootstrapper: Bootstrapper::new(executor.clone(), transfer.clone()),
            config,
            executor,
            transfer,
            instrumentation,
            lifecycle: Lifecycle::new(NAME),
            handles: BTreeMap::new(),
            launch_failures: BTreeMap::new(),
        }
    }

    fn binary_name(&self) -> String {
        self.config
            .binary
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| NAME.to_string())
    }

    pub fn install_plan(&self) -> InstallPlan {
        InstallPlan {
            probe: format!("stat {}", self.binary_name()),
            tuning: vec![PERF_PARANOID_TUNING.to_string()],
            prepare: vec![
                // the root filesystem is mounted read-only on the targets
                "sudo mount -o remount,rw /".to_string(),
                "sudo apt update; sudo apt install -y linux-tools-common linux-tools-$(uname -r)"
                    .to_string(),
            ],
            artifact: Some(ArtifactPush {
                local: self.config.binary.clone(),
                remote: String::new(),
            }),
            post_install: vec![],
        }
    }

    fn start_command(&self) -> String {
        let dir = &self.config.remote_dir;
        let binary = self.binary_name();
        format!(
            "sudo rm -rf {dir}; sudo mkdir {dir}; sudo chmod 0777 {dir}; \
             cp -f {binary} {dir}; cd {dir}; \
             sudo ./{binary} -p $(pidof {process}) --root --no-inline -o {dir}/flamegraph.svg",
            process = self.config.process,
        )
    }

    fn stop_command(&self) -> String {
        format!("sudo kill $(pidof {})", self.config.sampler)
    }

    async fn bootstrap(&mut self, targets: &[Target]) {
        let plan = self.install_plan();

        let report = match self.config.tuning {
            TuningPolicy::WithInstall => self.bootstrapper.ensure_installed(targets, &plan).await,
            TuningPolicy::Always => {
                let install_only = InstallPlan {
                    tuning: vec![],
                    ..plan.clone()
                };
                let report = self
                    .bootstrapper
                    .ensure_installed(targets, &install_only)
                    .await;
                let tuned = self.bootstrapper.apply_tuning(&report.ready(), &plan).await;
                for (target, result) in tuned {
                    if let Err(err) = result {
                        warn!(phase = "init", "{target}: flamegraph disabled: {err}");
                        self.instrumentation.disable(&target);
                    }
                }
                report
            }
        };

        for (target, state) in report.iter() {
            if let BootstrapState::Failed(err) = state {
                warn!(phase = "init", "{target}: flamegraph disabled: {err}");
                self.instrumentation.disable(target);
            }
        }
    }

    async fn stop_and_fetch(
        &self,
        target: Target,
        handle: DetachedHandle,
        output_dir: &Path,
    ) -> (Target, ArtifactStatus) {
        // an interrupt must not skip the kill, or the sampler outlives the run
        let stop = self.executor.detached_from_cancellation();
        match stop.run(&target, &self.stop_command()).await {
            Ok(result) if !result.success() => warn!(
                phase = "end_iteration",
                "{target}: stopping {} exited with {}", self.config.sampler, result.exit_code
            ),
            Err(err) => warn!(phase = "end_iteration", "{target}: {err}"),
            Ok(_) => {}
        }

        match handle.wait_or_cancel(self.executor.cancellation()).await {
            Ok(result) if !result.success() => warn!(
                phase = "end_iteration",
                "{target}: flamegraph exited with {}, fetching anyway", result.exit_code
            ),
            Err(err) => {
                warn!(phase = "end_iteration", "{target}: {err}");
                return (
                    target,
                    ArtifactStatus::Absent {
                        reason: err.to_string(),
                    },
                );
            }
            Ok(_) => {}
        }

        let remote = format!("{}/flamegraph.svg", self.config.remote_dir);
        let local = output_dir.join(format!("flamegraph_{target}.svg"));
        let status = match self.transfer.pull(&target, &remote, &local).await {
            Ok(path) => {
                info!("{target}: flamegraph fetched {}", "✓".green());
                ArtifactStatus::Fetched { path }
            }
            Err(err) => {
                warn!(
                    phase = "end_iteration",
                    "{target}: {} failed to fetch flamegraph, continuing: {err}",
                    "✗".red()
                );
                ArtifactStatus::Absent {
                    reason: err.to_string(),
                }
            }
        };
        (target, status)
    }
}

#[async_trait]
impl MetricCollector for FlamegraphCollector {
    fn name(&self) -> &str {
        NAME
    }

    fn state(&self) -> CollectorState {
        self.lifecycle.state()
    }

    fn instrumentation(&self) -> &Instrumentation {
        &self.instrumentation
    }

    async fn init(&mut self) -> anyhow::Result<()> {
        let targets = self.instrumentation.enabled();
        if targets.is_empty() {
            info!("flamegraph collector disabled");
        } else {
            self.bootstrap(&targets).await;
            info!(
                "flamegraph collector instrumenting {:?}",
                self.instrumentation
                    .enabled()
                    .iter()
                    .map(Target::to_string)
                    .collect::<Vec<_>>()
            );
        }
        self.lifecycle.initialized();
        Ok(())
    }

    async fn start_iteration(&mut self, ctx: &IterationContext) -> anyhow::Result<()> {
        self.lifecycle.start()?;

        let command = self.start_command();
        let launches = self.instrumentation.enabled().into_iter().map(|target| {
            let sinks = OutputSinks::in_dir(&ctx.output_dir, &format!("flamegraph-{target}"));
            let command = &command;
            let executor = &self.executor;
            async move {
                let launched = executor.run_detached(&target, command, sinks).await;
                (target, launched)
            }
        });
        let launched = join_all(launches).await;

        for (target, handle) in launched {
            match handle {
                Ok(handle) => {
                    self.handles.insert(target, handle);
                }
                Err(err) => {
                    warn!(phase = "start_iteration", "{target}: {err}");
                    self.launch_failures.insert(target, err.to_string());
                }
            }
        }
        Ok(())
    }

    async fn end_iteration(&mut self, ctx: &IterationContext) -> CollectorOutcome {
        let mut outcome = CollectorOutcome::skipped(NAME, self.instrumentation.targets().cloned());
        if !self.lifecycle.end() {
            return outcome;
        }

        for (target, reason) in mem::take(&mut self.launch_failures) {
            outcome.record(target, ArtifactStatus::Absent { reason });
        }

        let handles = mem::take(&mut self.handles);
        let stops = handles
            .into_iter()
            .map(|(target, handle)| self.stop_and_fetch(target, handle, &ctx.output_dir));
        for (target, status) in join_all(stops).await {
            outcome.record(target, status);
        }
        outcome
    }

    async fn abort(&mut self) {
        self.launch_failures.clear();
        let handles = mem::take(&mut self.handles);

        if !handles.is_empty() {
            // the run's token has fired, so cleanup goes through an executor that ignores it
            let cleanup = self.executor.detached_from_cancellation();
            let targets: Vec<Target> = handles.keys().cloned().collect();
            let results = cleanup.run_parallel(&targets, &self.stop_command()).await;
            for target in results.failed() {
                warn!(phase = "abort", "{target}: could not stop {}", self.config.sampler);
            }
            for (target, handle) in handles {
                if let Err(err) = handle.terminate() {
                    warn!(phase = "abort", "{target}: {err}");
                }
            }
        }
        self.lifecycle.abort();
    }
}
