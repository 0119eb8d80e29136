use crate::{
    errors::BootstrapError,
    remote::RemoteExecutor,
    target::Target,
    transfer::ArtifactTransfer,
    transport::Location,
};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::PathBuf};
use tracing::{info, warn};

/// How to check for a prerequisite on a target and how to install it where it is missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallPlan {
    pub probe: String,

    /// Kernel or OS parameter relaxation run ahead of `prepare` on targets being remediated.
    #[serde(default)]
    pub tuning: Vec<String>,

    /// OS preparation (package installs, remounts) run in order on targets being remediated.
    #[serde(default)]
    pub prepare: Vec<String>,

    /// Local binary pushed to every remediated target.
    pub artifact: Option<ArtifactPush>,

    #[serde(default)]
    pub post_install: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactPush {
    pub local: PathBuf,
    /// Remote destination, relative to the login directory when not absolute. Empty means the
    /// login directory itself.
    #[serde(default)]
    pub remote: String,
}

/// Whether a target has the prerequisite. Derived by probing every time it is needed and never
/// persisted, since targets may be recycled between runs.
#[derive(Debug, Clone, PartialEq)]
pub enum BootstrapState {
    Present,
    Installed,
    Failed(BootstrapError),
}

impl BootstrapState {
    pub fn is_ready(&self) -> bool {
        !matches!(self, BootstrapState::Failed(_))
    }
}

#[derive(Debug, Clone, Default)]
pub struct BootstrapReport {
    states: BTreeMap<Target, BootstrapState>,
}

impl BootstrapReport {
    pub fn state(&self, target: &Target) -> Option<&BootstrapState> {
        self.states.get(target)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Target, &BootstrapState)> {
        self.states.iter()
    }

    pub fn ready(&self) -> Vec<Target> {
        self.targets_where(BootstrapState::is_ready)
    }

    pub fn failed(&self) -> Vec<Target> {
        self.targets_where(|state| !state.is_ready())
    }

    pub fn remediated(&self) -> Vec<Target> {
        self.targets_where(|state| *state == BootstrapState::Installed)
    }

    fn targets_where<F: Fn(&BootstrapState) -> bool>(&self, pred: F) -> Vec<Target> {
        self.states
            .iter()
            .filter(|(_, state)| pred(state))
            .map(|(target, _)| target.clone())
            .collect()
    }
}

/// Brings a fleet to the state an [`InstallPlan`] describes. Running it on a fleet that already
/// has the prerequisite costs one probe per target and nothing else.
#[derive(Clone)]
pub struct Bootstrapper {
    executor: RemoteExecutor,
    transfer: ArtifactTransfer,
}

impl Bootstrapper {
    pub fn new(executor: RemoteExecutor, transfer: ArtifactTransfer) -> Self {
        Self { executor, transfer }
    }

    pub async fn ensure_installed(&self, targets: &[Target], plan: &InstallPlan) -> BootstrapReport {
        let mut states = BTreeMap::new();
        let mut pending = vec![];

        for (target, probe) in self.executor.run_parallel(targets, &plan.probe).await {
            match probe {
                Ok(result) if result.success() => {
                    states.insert(target, BootstrapState::Present);
                }
                Ok(_) => pending.push(target),
                Err(err) => {
                    warn!("{}: bootstrap probe failed: {err}", target);
                    states.insert(target, BootstrapState::Failed(BootstrapError::Probe(err)));
                }
            }
        }

        if pending.is_empty() {
            info!("prerequisite `{}` present on all reachable targets", plan.probe);
            return BootstrapReport { states };
        }

        info!(
            "{} {:?}",
            "prerequisite missing, remediating".yellow(),
            pending.iter().map(Target::to_string).collect::<Vec<_>>()
        );

        pending = self.apply(pending, &plan.tuning, &mut states).await;
        pending = self.apply(pending, &plan.prepare, &mut states).await;
        if let Some(artifact) = &plan.artifact {
            pending = self.push(pending, artifact, &mut states).await;
        }
        pending = self.apply(pending, &plan.post_install, &mut states).await;

        for target in pending {
            info!("{}: prerequisite installed {}", target, "✓".green());
            states.insert(target, BootstrapState::Installed);
        }

        BootstrapReport { states }
    }

    /// Runs the plan's tuning steps on `targets` whether or not the prerequisite is present.
    /// Each target maps to the error of its first failing step, if any.
    pub async fn apply_tuning(
        &self,
        targets: &[Target],
        plan: &InstallPlan,
    ) -> BTreeMap<Target, Result<(), BootstrapError>> {
        let mut failures = BTreeMap::new();
        let ok = self.apply(targets.to_vec(), &plan.tuning, &mut failures).await;

        let mut outcome: BTreeMap<_, _> = ok.into_iter().map(|t| (t, Ok(()))).collect();
        for (target, state) in failures {
            if let BootstrapState::Failed(err) = state {
                outcome.insert(target, Err(err));
            }
        }
        outcome
    }

    /// Runs `steps` in order across `pending`; a target drops out at its first failing step.
    async fn apply(
        &self,
        mut pending: Vec<Target>,
        steps: &[String],
        states: &mut BTreeMap<Target, BootstrapState>,
    ) -> Vec<Target> {
        for step in steps {
            if pending.is_empty() {
                break;
            }

            let results = self.executor.run_parallel(&pending, step).await;
            pending.retain(|target| {
                let failure = match results.get(target) {
                    Some(Ok(result)) if result.success() => return true,
                    Some(Ok(result)) => BootstrapError::StepFailed {
                        target: target.clone(),
                        step: step.clone(),
                        exit_code: result.exit_code,
                    },
                    Some(Err(err)) => BootstrapError::StepUnreachable {
                        step: step.clone(),
                        source: err.clone(),
                    },
                    None => return true,
                };
                warn!("{}: bootstrap degraded: {failure}", target);
                states.insert(target.clone(), BootstrapState::Failed(failure));
                false
            });
        }
        pending
    }

    async fn push(
        &self,
        pending: Vec<Target>,
        artifact: &ArtifactPush,
        states: &mut BTreeMap<Target, BootstrapState>,
    ) -> Vec<Target> {
        let sources = vec![artifact.local.clone(); pending.len()];
        let destinations: Vec<_> = pending
            .iter()
            .map(|target| Location::remote(target, artifact.remote.clone()))
            .collect();

        let statuses = match self.transfer.push(&sources, &destinations).await {
            Ok(statuses) => statuses,
            Err(err) => {
                // sources and destinations are built pairwise above
                warn!("bootstrap push rejected: {err}");
                return pending;
            }
        };

        pending
            .into_iter()
            .zip(statuses)
            .filter_map(|(target, status)| match status {
                Ok(()) => Some(target),
                Err(source) => {
                    states.insert(
                        target.clone(),
                        BootstrapState::Failed(BootstrapError::Push { target, source }),
                    );
                    None
                }
            })
            .collect()
    }
}
