pub mod flamegraph;
pub mod prometheus;

use crate::target::Target;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{collections::BTreeMap, path::PathBuf, time::Duration};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct IterationContext {
    pub index: usize,
    pub load_total: u64,
    pub duration: Duration,
    /// Owned by the controller for the iteration; collectors write only their own sub-paths.
    pub output_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl IterationContext {
    pub fn observed_duration(&self) -> Duration {
        self.ended_at
            .and_then(|end| (end - self.started_at).to_std().ok())
            .unwrap_or(self.duration)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ArtifactStatus {
    Fetched { path: PathBuf },
    /// The collector ran for this target but produced nothing usable.
    Absent { reason: String },
    Skipped,
}

impl ArtifactStatus {
    pub fn is_absent(&self) -> bool {
        matches!(self, ArtifactStatus::Absent { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectorOutcome {
    pub collector: String,
    pub artifacts: BTreeMap<Target, ArtifactStatus>,
}

impl CollectorOutcome {
    pub fn new(collector: impl Into<String>) -> Self {
        Self {
            collector: collector.into(),
            artifacts: BTreeMap::new(),
        }
    }

    /// Every target marked skipped, for a collector asked to end an iteration it never started.
    pub fn skipped(collector: impl Into<String>, targets: impl IntoIterator<Item = Target>) -> Self {
        Self {
            collector: collector.into(),
            artifacts: targets
                .into_iter()
                .map(|target| (target, ArtifactStatus::Skipped))
                .collect(),
        }
    }

    pub fn record(&mut self, target: Target, status: ArtifactStatus) {
        self.artifacts.insert(target, status);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    Uninitialized,
    Idle,
    Running,
}

/// Tracks a collector's position in init → (start → end)* and rejects calls out of order.
#[derive(Debug)]
pub struct Lifecycle {
    name: String,
    state: CollectorState,
}

impl Lifecycle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: CollectorState::Uninitialized,
        }
    }

    pub fn state(&self) -> CollectorState {
        self.state
    }

    pub fn initialized(&mut self) {
        self.state = CollectorState::Idle;
    }

    pub fn start(&mut self) -> anyhow::Result<()> {
        match self.state {
            CollectorState::Idle => {
                self.state = CollectorState::Running;
                Ok(())
            }
            state => Err(anyhow::anyhow!(
                "collector {} cannot start an iteration while {state:?}",
                self.name
            )),
        }
    }

    /// Returns false, leaving the state alone, if no iteration was running.
    pub fn end(&mut self) -> bool {
        if self.state != CollectorState::Running {
            warn!(
                "collector {} asked to end an iteration while {:?}",
                self.name, self.state
            );
            return false;
        }
        self.state = CollectorState::Idle;
        true
    }

    pub fn abort(&mut self) {
        if self.state == CollectorState::Running {
            self.state = CollectorState::Idle;
        }
    }
}

/// Which targets a collector instruments. Fixed once the collector's `init` returns: a target
/// disabled here gets no remote traffic from the collector for the rest of the run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Instrumentation(BTreeMap<Target, bool>);

impl Instrumentation {
    pub fn enabled_for(targets: &[Target]) -> Self {
        Self(targets.iter().map(|t| (t.clone(), true)).collect())
    }

    pub fn disabled_for(targets: &[Target]) -> Self {
        Self(targets.iter().map(|t| (t.clone(), false)).collect())
    }

    pub fn disable(&mut self, target: &Target) {
        if let Some(enabled) = self.0.get_mut(target) {
            *enabled = false;
        }
    }

    pub fn is_enabled(&self, target: &Target) -> bool {
        self.0.get(target).copied().unwrap_or(false)
    }

    pub fn enabled(&self) -> Vec<Target> {
        self.0
            .iter()
            .filter(|(_, enabled)| **enabled)
            .map(|(target, _)| target.clone())
            .collect()
    }

    pub fn targets(&self) -> impl Iterator<Item = &Target> {
        self.0.keys()
    }

    pub fn any_enabled(&self) -> bool {
        self.0.values().any(|enabled| *enabled)
    }
}

/// A pluggable observer of benchmark iterations.
///
/// The controller calls `init` once, then `start_iteration` and `end_iteration` around every
/// workload dispatch. A collector whose instrumentation is disabled for a target never touches
/// that target; with every target disabled, all lifecycle calls are no-ops.
#[async_trait]
pub trait MetricCollector: Send + Sync {
    fn name(&self) -> &str;

    fn state(&self) -> CollectorState;

    fn instrumentation(&self) -> &Instrumentation;

    /// Per-target failures disable instrumentation for that target. An error leaves the
    /// collector uninitialized and the controller keeps it out of the run.
    async fn init(&mut self) -> anyhow::Result<()>;

    async fn start_iteration(&mut self, ctx: &IterationContext) -> anyhow::Result<()>;

    /// Running → Idle. Never fails: anything that goes wrong is reported per target as an absent
    /// artifact.
    async fn end_iteration(&mut self, ctx: &IterationContext) -> CollectorOutcome;

    /// Tears down whatever the current iteration started, without fetching artifacts.
    async fn abort(&mut self);
}
