use crate::{
    collector::{ArtifactStatus, CollectorOutcome},
    errors::ChannelError,
    remote::{CommandResult, FleetResults},
    target::Target,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{collections::BTreeMap, path::PathBuf};

/// What happened to one target's workload command in one iteration.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandOutcome {
    Completed { exit_code: i32, duration_ms: u64 },
    Unreachable { reason: String },
}

impl CommandOutcome {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            CommandOutcome::Completed { exit_code, .. } => Some(*exit_code),
            CommandOutcome::Unreachable { .. } => None,
        }
    }
}

impl From<&Result<CommandResult, ChannelError>> for CommandOutcome {
    fn from(result: &Result<CommandResult, ChannelError>) -> Self {
        match result {
            Ok(r) => CommandOutcome::Completed {
                exit_code: r.exit_code,
                duration_ms: r.duration.as_millis() as u64,
            },
            Err(err) => CommandOutcome::Unreachable {
                reason: err.to_string(),
            },
        }
    }
}

/// One pass of the ramp. Immutable once recorded in an [`ExperimentRun`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Iteration {
    pub index: usize,
    pub load_total: u64,
    pub duration_secs: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub output_dir: PathBuf,
    pub results: BTreeMap<Target, CommandOutcome>,
    /// Collector name → target → artifact status. A missing artifact is an explicit `Absent`.
    pub artifacts: BTreeMap<String, BTreeMap<Target, ArtifactStatus>>,
}

impl Iteration {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: usize,
        load_total: u64,
        duration_secs: u64,
        output_dir: PathBuf,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        workload: &FleetResults,
        collectors: Vec<CollectorOutcome>,
    ) -> Self {
        Self {
            index,
            load_total,
            duration_secs,
            started_at,
            ended_at,
            output_dir,
            results: workload
                .iter()
                .map(|(target, result)| (target.clone(), CommandOutcome::from(result)))
                .collect(),
            artifacts: collectors
                .into_iter()
                .map(|outcome| (outcome.collector, outcome.artifacts))
                .collect(),
        }
    }

    pub fn exit_code(&self, target: &Target) -> Option<i32> {
        self.results.get(target).and_then(CommandOutcome::exit_code)
    }

    pub fn all_succeeded(&self) -> bool {
        self.results
            .values()
            .all(|outcome| outcome.exit_code() == Some(0))
    }

    /// `(collector, target)` pairs whose artifact is absent.
    pub fn missing_artifacts(&self) -> Vec<(&str, &Target)> {
        self.artifacts
            .iter()
            .flat_map(|(collector, per_target)| {
                per_target
                    .iter()
                    .filter(|(_, status)| status.is_absent())
                    .map(move |(target, _)| (collector.as_str(), target))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Done,
    Interrupted,
}

/// A whole experiment. Iterations are only ever appended, in plan order.
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentRun {
    pub id: String,
    pub name: String,
    pub targets: Vec<Target>,
    pub collectors: Vec<String>,
    pub plan: Vec<u64>,
    pub run_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub status: RunStatus,
    iterations: Vec<Iteration>,
}

impl ExperimentRun {
    pub fn new(
        name: impl Into<String>,
        targets: Vec<Target>,
        collectors: Vec<String>,
        plan: Vec<u64>,
        run_dir: PathBuf,
    ) -> Self {
        Self {
            id: nanoid::nanoid!(5, &nanoid::alphabet::SAFE),
            name: name.into(),
            targets,
            collectors,
            plan,
            run_dir,
            started_at: Utc::now(),
            status: RunStatus::Running,
            iterations: vec![],
        }
    }

    pub fn iterations(&self) -> &[Iteration] {
        &self.iterations
    }

    pub fn record(&mut self, iteration: Iteration) -> anyhow::Result<()> {
        let expected = self.iterations.len() + 1;
        if iteration.index != expected {
            return Err(anyhow::anyhow!(
                "iteration {} recorded out of order, expected {expected}",
                iteration.index
            ));
        }
        self.iterations.push(iteration);
        Ok(())
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
    }

    pub fn is_complete(&self) -> bool {
        self.status == RunStatus::Done && self.iterations.len() == self.plan.len()
    }
}
