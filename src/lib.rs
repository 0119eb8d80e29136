pub mod bootstrap;
pub mod clap_args;
pub mod collector;
pub mod config;
pub mod controller;
pub mod errors;
pub mod experiment;
pub mod plan;
pub mod remote;
pub mod report;
pub mod target;
pub mod transfer;
pub mod transport;
pub mod workload;

#[cfg(test)]
pub(crate) mod testing;

use config::ExperimentConfig;
use controller::ExperimentController;
use experiment::ExperimentRun;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use transport::ssh::SshTransport;

/// Validates `config` and runs the experiment it describes over ssh. Cancelling `cancel` stops
/// the run after tearing down whatever the current iteration started.
pub async fn run(
    config: &ExperimentConfig,
    cancel: CancellationToken,
) -> anyhow::Result<ExperimentRun> {
    config.validate()?;

    let transport = SshTransport::new(config.experiment.ssh_user.clone())
        .with_identity(config.experiment.identity.clone());
    let plan = config.plan.to_plan();
    info!(
        "running {} over {} targets, {} iterations",
        config.experiment.name,
        config.experiment.targets.len(),
        plan.len()
    );

    let mut controller = ExperimentController::from_config(config, Arc::new(transport), cancel);
    let run = controller.run(&plan).await?;
    Ok(run)
}
