use crate::{
    collector::{
        flamegraph::FlamegraphCollector,
        prometheus::{PrometheusClient, PrometheusSampler},
        CollectorOutcome, CollectorState, IterationContext, MetricCollector,
    },
    config::{ExperimentConfig, ExperimentSettings, LogsConfig},
    errors::ExperimentError,
    experiment::{ExperimentRun, Iteration, RunStatus},
    plan::IterationPlan,
    remote::RemoteExecutor,
    report::{JsonSummarySink, RunSink},
    target::Target,
    transfer::ArtifactTransfer,
    transport::{OutputSinks, Transport},
    workload::Workload,
};
use chrono::Utc;
use colored::Colorize;
use futures_util::future::join_all;
use serde_json::json;
use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const REACHABILITY_PROBE: &str = "true";

const HOST_INFO: [(&str, &str); 3] = [("lscpu", "lscpu"), ("free", "free -h"), ("df", "df -h")];

/// Drives an experiment: one iteration per plan entry, each going through
/// `start_iteration` on every collector, the workload, then `end_iteration` on every collector.
/// Phases never overlap. Failures on single targets or collectors are recorded and the ramp
/// carries on; only an unusable configuration or an entirely unreachable fleet stop a run
/// before it starts.
pub struct ExperimentController {
    settings: ExperimentSettings,
    logs: Option<LogsConfig>,
    executor: RemoteExecutor,
    workload: Workload,
    collectors: Vec<Box<dyn MetricCollector>>,
    sinks: Vec<Box<dyn RunSink>>,
}

impl ExperimentController {
    pub fn new(settings: ExperimentSettings, executor: RemoteExecutor, workload: Workload) -> Self {
        Self {
            settings,
            logs: None,
            executor,
            workload,
            collectors: vec![],
            sinks: vec![],
        }
    }

    /// Wires up every component the configuration describes, sharing one transport and one
    /// cancellation token.
    pub fn from_config(
        config: &ExperimentConfig,
        transport: Arc<dyn Transport>,
        cancel: CancellationToken,
    ) -> Self {
        let targets = &config.experiment.targets;
        let executor = RemoteExecutor::new(transport.clone())
            .with_timeout(config.experiment.command_timeout())
            .with_cancellation(cancel);
        let transfer = ArtifactTransfer::new(transport);

        let flamegraph = FlamegraphCollector::new(
            config.flamegraph.clone(),
            targets,
            executor.clone(),
            transfer,
        );
        let prometheus = PrometheusSampler::new(
            config.prometheus.clone(),
            targets,
            Arc::new(PrometheusClient::new(config.prometheus.url.clone())),
        );

        Self::new(
            config.experiment.clone(),
            executor.clone(),
            Workload::new(config.workload.clone(), executor),
        )
        .with_logs(config.logs.clone())
        .with_collector(Box::new(flamegraph))
        .with_collector(Box::new(prometheus))
        .with_sink(Box::new(JsonSummarySink))
    }

    pub fn with_logs(mut self, logs: Option<LogsConfig>) -> Self {
        self.logs = logs;
        self
    }

    pub fn with_collector(mut self, collector: Box<dyn MetricCollector>) -> Self {
        self.collectors.push(collector);
        self
    }

    pub fn with_sink(mut self, sink: Box<dyn RunSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        self.executor.cancellation()
    }

    fn targets(&self) -> &[Target] {
        &self.settings.targets
    }

    /// Runs every iteration of `plan` in order. The returned run holds one iteration per plan
    /// entry, unless it was interrupted, in which case it holds those completed before the
    /// interrupt and has status `Interrupted`.
    pub async fn run(&mut self, plan: &IterationPlan) -> Result<ExperimentRun, ExperimentError> {
        self.check_plan(plan)?;
        self.preflight().await?;

        let run_dir = self
            .settings
            .output_root
            .join(&self.settings.name)
            .join(Utc::now().timestamp().to_string());
        create_dir(&run_dir)?;
        info!("writing results to {}", run_dir.display());

        let mut run = ExperimentRun::new(
            self.settings.name.clone(),
            self.targets().to_vec(),
            self.collectors.iter().map(|c| c.name().to_string()).collect(),
            plan.loads().to_vec(),
            run_dir.clone(),
        );
        self.publish(&run);

        if self.settings.capture_host_info {
            self.capture_host_info(&run_dir).await;
        }
        self.workload.kill_stale(&self.settings.targets).await;
        self.init_collectors().await;

        for (index, load_total) in plan.iter() {
            if self.cancellation().is_cancelled() {
                break;
            }

            match self.run_iteration(index, load_total, &run_dir).await {
                Some(iteration) => {
                    report_iteration(&iteration);
                    if let Err(err) = run.record(iteration) {
                        warn!("{err}");
                    }
                    self.publish(&run);
                }
                None => break,
            }
        }

        let status = if self.cancellation().is_cancelled() {
            warn!(
                "experiment interrupted after {} of {} iterations",
                run.iterations().len(),
                plan.len()
            );
            RunStatus::Interrupted
        } else {
            info!("experiment {} {}", run.name, "done".green());
            RunStatus::Done
        };
        run.finish(status);
        self.publish(&run);

        Ok(run)
    }

    fn check_plan(&self, plan: &IterationPlan) -> Result<(), ExperimentError> {
        if self.targets().is_empty() {
            return Err(ExperimentError::EmptyTargets);
        }
        let mut seen = BTreeSet::new();
        if let Some(duplicate) = self.targets().iter().find(|t| !seen.insert(*t)) {
            return Err(ExperimentError::DuplicateTarget(duplicate.clone()));
        }
        if plan.is_empty() {
            return Err(ExperimentError::EmptyPlan);
        }
        Ok(())
    }

    async fn preflight(&self) -> Result<(), ExperimentError> {
        let results = self
            .executor
            .run_parallel(self.targets(), REACHABILITY_PROBE)
            .await;

        let unreachable = results.unreachable();
        if unreachable.len() == self.targets().len() {
            return Err(ExperimentError::FleetUnreachable {
                count: unreachable.len(),
            });
        }
        for target in &unreachable {
            warn!(phase = "preflight", "{target}: unreachable, its failures will be recorded per iteration");
        }
        Ok(())
    }

    async fn capture_host_info(&self, run_dir: &Path) {
        let Some(target) = self.targets().first() else {
            return;
        };

        let jobs = HOST_INFO
            .iter()
            .map(|(name, command)| {
                let sinks = OutputSinks::new(
                    run_dir.join(format!("{name}.stdout.txt")),
                    run_dir.join(format!("{name}.stderr.txt")),
                );
                (target.clone(), command.to_string(), sinks)
            })
            .collect();

        for (target, result) in self.executor.run_batch_detached(jobs).await {
            match result {
                Ok(r) if r.success() => {}
                Ok(r) => warn!(phase = "host_info", "{target}: exited with {}", r.exit_code),
                Err(err) => warn!(phase = "host_info", "{err}"),
            }
        }
    }

    async fn init_collectors(&mut self) {
        let inits = self.collectors.iter_mut().map(|collector| async move {
            let name = collector.name().to_string();
            (name, collector.init().await)
        });

        for (collector, result) in join_all(inits).await {
            if let Err(err) = result {
                warn!(phase = "init", "collector {collector} disabled for this run: {err:#}");
            }
        }
    }

    /// Returns `None` if the run was interrupted before the iteration completed.
    async fn run_iteration(
        &mut self,
        index: usize,
        load_total: u64,
        run_dir: &Path,
    ) -> Option<Iteration> {
        let output_dir = run_dir.join(index.to_string());
        if let Err(err) = create_dir(&output_dir) {
            warn!(phase = "output_dir", "iteration {index} runs without its artifacts: {err}");
        }
        info!(
            "{} {index} with load {load_total}",
            "starting iteration".green()
        );

        let mut ctx = IterationContext {
            index,
            load_total,
            duration: self.workload.duration(),
            output_dir: output_dir.clone(),
            started_at: Utc::now(),
            ended_at: None,
        };

        let starts = self.usable_collectors().map(|collector| {
            let ctx = &ctx;
            async move {
                let name = collector.name().to_string();
                (name, collector.start_iteration(ctx).await)
            }
        });
        for (collector, result) in join_all(starts).await {
            if let Err(err) = result {
                warn!(phase = "start_iteration", "collector {collector}: {err:#}");
            }
        }
        if self.cancellation().is_cancelled() {
            self.abort_collectors().await;
            return None;
        }

        let results = self
            .workload
            .dispatch(&self.settings.targets, index, load_total, &output_dir)
            .await;
        for (target, result) in results.iter() {
            match result {
                Ok(r) if !r.success() => {
                    warn!(phase = "workload", "{target}: exited with {}", r.exit_code)
                }
                Err(err) => warn!(phase = "workload", "{err}"),
                Ok(_) => {}
            }
        }
        if self.cancellation().is_cancelled() {
            self.workload.stop(&self.settings.targets).await;
            self.abort_collectors().await;
            return None;
        }

        let ended_at = Utc::now();
        ctx.ended_at = Some(ended_at);
        let ends = self.collectors.iter_mut().map(|collector| {
            let ctx = &ctx;
            async move {
                if collector.state() == CollectorState::Uninitialized {
                    CollectorOutcome::skipped(
                        collector.name(),
                        collector.instrumentation().targets().cloned(),
                    )
                } else {
                    collector.end_iteration(ctx).await
                }
            }
        });
        let outcomes: Vec<CollectorOutcome> = join_all(ends).await;
        if self.cancellation().is_cancelled() {
            return None;
        }

        write_iteration_summary(&ctx, self.duration_secs());
        if let Some(logs) = &self.logs {
            self.collect_logs(logs, &ctx).await;
        }

        Some(Iteration::new(
            index,
            load_total,
            self.duration_secs(),
            output_dir,
            ctx.started_at,
            ended_at,
            &results,
            outcomes,
        ))
    }

    fn duration_secs(&self) -> u64 {
        self.workload.duration().as_secs()
    }

    /// Collectors whose `init` failed stay out of every later phase.
    fn usable_collectors(&mut self) -> impl Iterator<Item = &mut Box<dyn MetricCollector>> {
        self.collectors
            .iter_mut()
            .filter(|collector| collector.state() != CollectorState::Uninitialized)
    }

    async fn abort_collectors(&mut self) {
        warn!("interrupted, aborting collectors");
        join_all(self.usable_collectors().map(|collector| collector.abort())).await;
    }

    async fn collect_logs(&self, logs: &LogsConfig, ctx: &IterationContext) {
        let since = ctx.observed_duration().as_secs().max(1).to_string();
        let command = logs.command.replace("{since}", &since);

        let jobs = self
            .targets()
            .iter()
            .map(|target| {
                let sinks = OutputSinks::new(
                    ctx.output_dir.join(format!("target-log-{target}-stdout.txt")),
                    ctx.output_dir.join(format!("target-log-{target}-stderr.txt")),
                );
                (target.clone(), command.clone(), sinks)
            })
            .collect();

        for (target, result) in self.executor.run_batch_detached(jobs).await {
            if let Err(err) = result {
                warn!(phase = "logs", "{target}: {err}");
            }
        }
    }

    fn publish(&self, run: &ExperimentRun) {
        for sink in &self.sinks {
            if let Err(err) = sink.consume(run) {
                warn!("report sink {}: {err:#}", sink.name());
            }
        }
    }
}

fn create_dir(path: &Path) -> Result<(), ExperimentError> {
    fs::create_dir_all(path).map_err(|source| ExperimentError::OutputDir {
        path: PathBuf::from(path),
        source,
    })
}

fn write_iteration_summary(ctx: &IterationContext, duration_secs: u64) {
    let summary = json!({
        "t_start": ctx.started_at.timestamp(),
        "t_end": ctx.ended_at.unwrap_or_else(Utc::now).timestamp(),
        "configuration": {
            "load_total": ctx.load_total,
            "duration": duration_secs,
        },
    });
    let path = ctx.output_dir.join("iteration.json");
    let written = serde_json::to_string_pretty(&summary)
        .map_err(anyhow::Error::from)
        .and_then(|json| fs::write(&path, json).map_err(anyhow::Error::from));
    if let Err(err) = written {
        warn!("unable to write {}: {err}", path.display());
    }
}

fn report_iteration(iteration: &Iteration) {
    let mark = if iteration.all_succeeded() {
        "✓".green()
    } else {
        "✗".red()
    };
    info!("iteration {} {mark}", iteration.index);
    for (collector, target) in iteration.missing_artifacts() {
        debug!("iteration {}: no {collector} artifact for {target}", iteration.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        collector::{ArtifactStatus, CollectorState, Instrumentation, Lifecycle},
        config::{FlamegraphConfig, WorkloadConfig, WorkloadMode},
        testing::{Reply, ScriptedTransport},
    };
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn fleet() -> Vec<Target> {
        vec![
            Target::new("10.0.0.1"),
            Target::new("10.0.0.2"),
            Target::new("10.0.0.3"),
        ]
    }

    fn settings(output_root: &Path, targets: Vec<Target>) -> ExperimentSettings {
        ExperimentSettings {
            name: "ramp".to_string(),
            targets,
            ssh_user: "admin".to_string(),
            identity: None,
            output_root: output_root.to_path_buf(),
            command_timeout_secs: None,
            capture_host_info: false,
        }
    }

    fn controller(
        transport: Arc<ScriptedTransport>,
        output_root: &Path,
        targets: Vec<Target>,
    ) -> ExperimentController {
        let executor = RemoteExecutor::new(transport);
        let workload = Workload::new(
            WorkloadConfig {
                command: "generate --rate {load} --iteration={iteration}".to_string(),
                duration_secs: 1,
                mode: WorkloadMode::Parallel,
                batch_size: 1,
                kill_before: None,
            },
            executor.clone(),
        );
        ExperimentController::new(settings(output_root, targets), executor, workload)
            .with_sink(Box::new(JsonSummarySink))
    }

    /// Records lifecycle calls and checks them against the workload commands seen so far.
    struct Probe {
        transport: Arc<ScriptedTransport>,
        events: Arc<Mutex<Vec<String>>>,
        instrumentation: Instrumentation,
        lifecycle: Lifecycle,
        cancel_on_start: Option<(usize, CancellationToken)>,
        fail_init: bool,
        /// Leaves a plain file where the next iteration's directory should go.
        block_next_dir_after: Option<usize>,
    }

    impl Probe {
        fn new(transport: Arc<ScriptedTransport>, events: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                transport,
                events,
                instrumentation: Instrumentation::enabled_for(&fleet()),
                lifecycle: Lifecycle::new("probe"),
                cancel_on_start: None,
                fail_init: false,
                block_next_dir_after: None,
            }
        }

        fn workload_seen(&self, index: usize) -> bool {
            self.transport.count_matching(&format!("--iteration={index}")) > 0
        }
    }

    #[async_trait]
    impl MetricCollector for Probe {
        fn name(&self) -> &str {
            "probe"
        }

        fn state(&self) -> CollectorState {
            self.lifecycle.state()
        }

        fn instrumentation(&self) -> &Instrumentation {
            &self.instrumentation
        }

        async fn init(&mut self) -> anyhow::Result<()> {
            self.events.lock().unwrap().push("init".to_string());
            if self.fail_init {
                return Err(anyhow::anyhow!("metrics endpoint refused the connection"));
            }
            self.lifecycle.initialized();
            Ok(())
        }

        async fn start_iteration(&mut self, ctx: &IterationContext) -> anyhow::Result<()> {
            self.events.lock().unwrap().push(format!(
                "start {} workload_seen={}",
                ctx.index,
                self.workload_seen(ctx.index)
            ));
            if let Some((index, cancel)) = &self.cancel_on_start {
                if *index == ctx.index {
                    cancel.cancel();
                }
            }
            self.lifecycle.start()
        }

        async fn end_iteration(&mut self, ctx: &IterationContext) -> CollectorOutcome {
            self.events.lock().unwrap().push(format!(
                "end {} workload_seen={}",
                ctx.index,
                self.workload_seen(ctx.index)
            ));
            self.lifecycle.end();
            if self.block_next_dir_after == Some(ctx.index) {
                if let Some(run_dir) = ctx.output_dir.parent() {
                    fs::write(run_dir.join((ctx.index + 1).to_string()), "not a directory")
                        .unwrap();
                }
            }
            let mut outcome = CollectorOutcome::new("probe");
            for target in fleet() {
                outcome.record(
                    target.clone(),
                    ArtifactStatus::Fetched {
                        path: ctx.output_dir.join(format!("probe_{target}.txt")),
                    },
                );
            }
            outcome
        }

        async fn abort(&mut self) {
            self.events.lock().unwrap().push("abort".to_string());
            self.lifecycle.abort();
        }
    }

    #[tokio::test]
    async fn one_target_failing_once_is_recorded_per_iteration() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let transport = Arc::new(
            ScriptedTransport::new().on_exec(Some("10.0.0.2"), "--iteration=1", Reply::Exit(1)),
        );
        let mut controller = controller(transport, dir.path(), fleet());

        let run = controller.run(&IterationPlan::explicit(vec![100, 200])).await?;

        assert_eq!(run.status, RunStatus::Done);
        assert_eq!(run.iterations().len(), 2);
        let codes = |i: usize| {
            fleet()
                .iter()
                .map(|t| run.iterations()[i].exit_code(t))
                .collect::<Vec<_>>()
        };
        assert_eq!(codes(0), vec![Some(0), Some(1), Some(0)]);
        assert_eq!(codes(1), vec![Some(0), Some(0), Some(0)]);
        assert_eq!(
            run.iterations().iter().map(|i| i.index).collect::<Vec<_>>(),
            vec![1, 2]
        );
        Ok(())
    }

    #[tokio::test]
    async fn phases_never_overlap() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::new());
        let events = Arc::new(Mutex::new(vec![]));
        let mut controller = controller(transport.clone(), dir.path(), fleet())
            .with_collector(Box::new(Probe::new(transport, events.clone())));

        controller
            .run(&IterationPlan::explicit(vec![100, 200]))
            .await?;

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                "init",
                "start 1 workload_seen=false",
                "end 1 workload_seen=true",
                "start 2 workload_seen=false",
                "end 2 workload_seen=true",
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn run_directory_holds_one_directory_per_iteration() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut controller = controller(Arc::new(ScriptedTransport::new()), dir.path(), fleet());

        let run = controller
            .run(&IterationPlan::explicit(vec![100, 200, 300]))
            .await?;

        for index in 1..=3 {
            let summary: serde_json::Value = serde_json::from_str(&fs::read_to_string(
                run.run_dir.join(index.to_string()).join("iteration.json"),
            )?)?;
            assert_eq!(
                summary["configuration"]["load_total"],
                json!(index as u64 * 100)
            );
        }
        assert!(run.run_dir.join("experiment.json").exists());
        assert!(run.run_dir.starts_with(dir.path().join("ramp")));
        Ok(())
    }

    #[tokio::test]
    async fn failed_flamegraph_pull_is_recorded_as_absent() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let transport = Arc::new(
            ScriptedTransport::new().on_copy(Some("10.0.0.3"), "flamegraph.svg", Reply::Exit(1)),
        );
        let executor = RemoteExecutor::new(transport.clone());
        let flamegraph = FlamegraphCollector::new(
            FlamegraphConfig {
                enabled: true,
                ..FlamegraphConfig::default()
            },
            &fleet(),
            executor,
            ArtifactTransfer::new(transport.clone()),
        );
        let mut controller =
            controller(transport, dir.path(), fleet()).with_collector(Box::new(flamegraph));

        let run = controller
            .run(&IterationPlan::explicit(vec![100, 200]))
            .await?;

        assert_eq!(run.iterations().len(), 2);
        for iteration in run.iterations() {
            assert_eq!(
                iteration.missing_artifacts(),
                vec![("flamegraph", &Target::new("10.0.0.3"))]
            );
        }
        Ok(())
    }

    #[tokio::test]
    async fn interrupt_keeps_completed_iterations() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::new());
        let events = Arc::new(Mutex::new(vec![]));
        let cancel = CancellationToken::new();
        let executor = RemoteExecutor::new(transport.clone()).with_cancellation(cancel.clone());
        let workload = Workload::new(
            WorkloadConfig {
                command: "generate --iteration={iteration}".to_string(),
                duration_secs: 1,
                mode: WorkloadMode::Parallel,
                batch_size: 1,
                kill_before: None,
            },
            executor.clone(),
        );
        let probe = Probe {
            cancel_on_start: Some((2, cancel)),
            ..Probe::new(transport.clone(), events.clone())
        };
        let mut controller =
            ExperimentController::new(settings(dir.path(), fleet()), executor, workload)
                .with_collector(Box::new(probe));

        let run = controller
            .run(&IterationPlan::explicit(vec![100, 200, 300]))
            .await?;

        assert_eq!(run.status, RunStatus::Interrupted);
        assert_eq!(run.iterations().len(), 1);
        assert_eq!(transport.count_matching("--iteration=2"), 0);
        assert_eq!(events.lock().unwrap().last().map(String::as_str), Some("abort"));
        Ok(())
    }

    #[tokio::test]
    async fn interrupt_during_workload_kills_generators() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let events = Arc::new(Mutex::new(vec![]));
        let cancel = CancellationToken::new();
        let transport =
            Arc::new(ScriptedTransport::new().cancel_on("--iteration=2", cancel.clone()));
        let executor = RemoteExecutor::new(transport.clone()).with_cancellation(cancel);
        let workload = Workload::new(
            WorkloadConfig {
                command: "generate --iteration={iteration}".to_string(),
                duration_secs: 1,
                mode: WorkloadMode::Parallel,
                batch_size: 1,
                kill_before: Some("pkill generate".to_string()),
            },
            executor.clone(),
        );
        let mut controller =
            ExperimentController::new(settings(dir.path(), fleet()), executor, workload)
                .with_collector(Box::new(Probe::new(transport.clone(), events.clone())));

        let run = controller
            .run(&IterationPlan::explicit(vec![100, 200, 300]))
            .await?;

        assert_eq!(run.status, RunStatus::Interrupted);
        assert_eq!(run.iterations().len(), 1);
        // once before the ramp, once more when interrupted
        for target in fleet() {
            let kills = transport
                .commands_for(target.address())
                .iter()
                .filter(|command| command.as_str() == "pkill generate")
                .count();
            assert_eq!(kills, 2);
        }
        assert_eq!(events.lock().unwrap().last().map(String::as_str), Some("abort"));
        Ok(())
    }

    #[tokio::test]
    async fn failed_collector_init_leaves_the_run_going() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::new());
        let events = Arc::new(Mutex::new(vec![]));
        let probe = Probe {
            fail_init: true,
            ..Probe::new(transport.clone(), events.clone())
        };
        let mut controller =
            controller(transport, dir.path(), fleet()).with_collector(Box::new(probe));

        let run = controller
            .run(&IterationPlan::explicit(vec![100, 200, 300]))
            .await?;

        assert_eq!(run.status, RunStatus::Done);
        assert_eq!(run.iterations().len(), 3);
        assert_eq!(*events.lock().unwrap(), vec!["init"]);
        for iteration in run.iterations() {
            assert!(iteration.artifacts["probe"]
                .values()
                .all(|status| *status == ArtifactStatus::Skipped));
        }
        Ok(())
    }

    #[tokio::test]
    async fn unusable_iteration_directory_keeps_earlier_iterations() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::new());
        let probe = Probe {
            block_next_dir_after: Some(1),
            ..Probe::new(transport.clone(), Arc::new(Mutex::new(vec![])))
        };
        let mut controller =
            controller(transport, dir.path(), fleet()).with_collector(Box::new(probe));

        let run = controller
            .run(&IterationPlan::explicit(vec![100, 200]))
            .await?;

        assert_eq!(run.status, RunStatus::Done);
        assert_eq!(run.iterations().len(), 2);
        assert!(run.iterations()[0].output_dir.join("iteration.json").exists());
        assert!(!run.iterations()[1].output_dir.is_dir());
        assert_eq!(run.iterations()[1].exit_code(&Target::new("10.0.0.1")), Some(0));
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_fleet_is_fatal() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let transport = Arc::new(
            ScriptedTransport::new()
                .unreachable("10.0.0.1")
                .unreachable("10.0.0.2")
                .unreachable("10.0.0.3"),
        );
        let mut controller = controller(transport, dir.path(), fleet());

        let result = controller.run(&IterationPlan::explicit(vec![100])).await;

        assert!(matches!(
            result,
            Err(ExperimentError::FleetUnreachable { count: 3 })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn partially_unreachable_fleet_still_runs() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::new().unreachable("10.0.0.2"));
        let mut controller = controller(transport, dir.path(), fleet());

        let run = controller.run(&IterationPlan::explicit(vec![100])).await?;

        assert_eq!(run.iterations().len(), 1);
        assert_eq!(run.iterations()[0].exit_code(&Target::new("10.0.0.2")), None);
        assert_eq!(run.iterations()[0].exit_code(&Target::new("10.0.0.1")), Some(0));
        Ok(())
    }

    #[tokio::test]
    async fn empty_targets_or_plan_are_fatal() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::new());

        let mut no_targets = controller(transport.clone(), dir.path(), vec![]);
        assert!(matches!(
            no_targets.run(&IterationPlan::explicit(vec![100])).await,
            Err(ExperimentError::EmptyTargets)
        ));

        let mut no_plan = controller(transport.clone(), dir.path(), fleet());
        assert!(matches!(
            no_plan.run(&IterationPlan::explicit(vec![])).await,
            Err(ExperimentError::EmptyPlan)
        ));
        assert!(transport.calls().is_empty());
        Ok(())
    }
}
