use crate::{errors::ExperimentError, plan::Ramp, target::Target};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    io::Read,
    path::{Path, PathBuf},
    time::Duration,
};

// ******** ******** ********
// **    CONFIGURATION     **
// ******** ******** ********
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ExperimentConfig {
    pub experiment: ExperimentSettings,
    pub plan: Ramp,
    pub workload: WorkloadConfig,
    #[serde(default)]
    pub flamegraph: FlamegraphConfig,
    #[serde(default)]
    pub prometheus: PrometheusConfig,
    pub logs: Option<LogsConfig>,
}

impl ExperimentConfig {
    pub fn try_from_path(path: &Path) -> anyhow::Result<ExperimentConfig> {
        let mut config_str = String::new();
        fs::File::open(path)
            .with_context(|| format!("Unable to open config file {}", path.display()))?
            .read_to_string(&mut config_str)?;
        ExperimentConfig::try_from_str(&config_str)
    }

    pub fn try_from_str(conf_str: &str) -> anyhow::Result<ExperimentConfig> {
        toml::from_str::<ExperimentConfig>(conf_str)
            .map_err(|e| anyhow::anyhow!("TOML parsing error: {}", e))
    }

    /// Turns off collectors from the command line. Applied before any component is built.
    pub fn apply_flags(&mut self, no_instrument: bool, no_prometheus: bool) {
        if no_instrument {
            self.flamegraph.enabled = false;
        }
        if no_prometheus {
            self.prometheus.enabled = false;
        }
    }

    /// Rejects configurations no experiment can start from.
    pub fn validate(&self) -> Result<(), ExperimentError> {
        let targets = &self.experiment.targets;
        if targets.is_empty() {
            return Err(ExperimentError::EmptyTargets);
        }

        let mut seen = BTreeSet::new();
        for target in targets {
            if target.address().is_empty() || target.address().contains(char::is_whitespace) {
                return Err(ExperimentError::InvalidConfig(format!(
                    "invalid target address {:?}",
                    target.address()
                )));
            }
            if !seen.insert(target) {
                return Err(ExperimentError::DuplicateTarget(target.clone()));
            }
        }

        if self.plan.to_plan().is_empty() {
            return Err(ExperimentError::EmptyPlan);
        }

        if self.workload.command.trim().is_empty() {
            return Err(ExperimentError::InvalidConfig(
                "workload command is empty".to_string(),
            ));
        }
        let commands = std::iter::once(&self.workload.command)
            .chain(&self.workload.kill_before)
            .chain(self.logs.as_ref().map(|logs| &logs.command));
        for command in commands {
            if shlex::split(command).is_none() {
                return Err(ExperimentError::InvalidConfig(format!(
                    "command string is not POSIX compliant: {command}"
                )));
            }
        }
        if self.workload.mode == WorkloadMode::Batched && self.workload.batch_size == 0 {
            return Err(ExperimentError::InvalidConfig(
                "batched workloads need a batch_size of at least 1".to_string(),
            ));
        }

        if let Some(subset) = &self.flamegraph.targets {
            if let Some(stranger) = subset.iter().find(|t| !targets.contains(t)) {
                return Err(ExperimentError::InvalidConfig(format!(
                    "flamegraph target {stranger} is not part of the experiment"
                )));
            }
        }

        if self.prometheus.enabled && self.prometheus.url.trim().is_empty() {
            return Err(ExperimentError::InvalidConfig(
                "prometheus is enabled but has no url".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ExperimentSettings {
    pub name: String,
    pub targets: Vec<Target>,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    pub identity: Option<PathBuf>,
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,
    /// Upper bound for every blocking remote command. Unbounded when absent.
    pub command_timeout_secs: Option<u64>,
    #[serde(default = "default_true")]
    pub capture_host_info: bool,
}

impl ExperimentSettings {
    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadMode {
    #[default]
    Parallel,
    Batched,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct WorkloadConfig {
    /// Placeholders: `{load}`, `{load_total}`, `{duration}`, `{iteration}`, `{target}`,
    /// `{targets}`.
    pub command: String,
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,
    #[serde(default)]
    pub mode: WorkloadMode,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Kills workload generators: once before the first iteration, and on every target if the
    /// run is interrupted while the workload is running.
    pub kill_before: Option<String>,
}

/// When the perf sampling relaxation runs.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TuningPolicy {
    /// Only on targets the binary is being installed on.
    #[default]
    WithInstall,
    /// On every instrumented target at the start of each run.
    Always,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct FlamegraphConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_flamegraph_binary")]
    pub binary: PathBuf,
    /// Name of the process to profile, resolved with `pidof` on the target.
    #[serde(default = "default_profiled_process")]
    pub process: String,
    #[serde(default = "default_sampler")]
    pub sampler: String,
    #[serde(default = "default_flamegraph_dir")]
    pub remote_dir: String,
    /// Restricts profiling to these targets.
    pub targets: Option<Vec<Target>>,
    #[serde(default)]
    pub tuning: TuningPolicy,
}

impl Default for FlamegraphConfig {
    /// A missing `[flamegraph]` section means no profiling.
    fn default() -> Self {
        Self {
            enabled: false,
            binary: default_flamegraph_binary(),
            process: default_profiled_process(),
            sampler: default_sampler(),
            remote_dir: default_flamegraph_dir(),
            targets: None,
            tuning: TuningPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct PrometheusConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
    /// Name → PromQL expression, with `{target}` and `{duration}` placeholders.
    #[serde(default)]
    pub queries: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LogsConfig {
    /// `{since}` is replaced by the iteration's length in seconds.
    pub command: String,
}

fn default_true() -> bool {
    true
}

fn default_ssh_user() -> String {
    "admin".to_string()
}

fn default_output_root() -> PathBuf {
    PathBuf::from("results")
}

fn default_duration_secs() -> u64 {
    300
}

fn default_batch_size() -> usize {
    1
}

fn default_flamegraph_binary() -> PathBuf {
    PathBuf::from("bin/flamegraph")
}

fn default_profiled_process() -> String {
    "replica".to_string()
}

fn default_sampler() -> String {
    "perf".to_string()
}

fn default_flamegraph_dir() -> String {
    "/var/lib/ic/data/flamegraph".to_string()
}
