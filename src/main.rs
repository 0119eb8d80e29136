use anyhow::Context;
use colored::Colorize;
use rampart::{
    clap_args::{self, Commands},
    config::ExperimentConfig,
    experiment::RunStatus,
    plan::distribute_load,
    report,
};
use term_table::{row::Row, table_cell::TableCell, Table, TableStyle};
use tokio_util::sync::CancellationToken;
use tracing::{subscriber::set_global_default, warn, Subscriber};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let args = clap_args::parse();
    let env_filter = if args.verbose { "debug" } else { "info" };
    set_global_default(get_subscriber(env_filter.to_string()))
        .context("Failed to set subscriber")?;

    match args.command {
        Commands::Run {
            config,
            no_instrument,
            no_prometheus,
        } => {
            let path = clap_args::config_path(config);
            let mut config = ExperimentConfig::try_from_path(&path)?;
            config.apply_flags(no_instrument, no_prometheus);

            let cancel = CancellationToken::new();
            let handler_token = cancel.clone();
            ctrlc::set_handler(move || {
                warn!("interrupt received, tearing down the current iteration");
                handler_token.cancel();
            })
            .context("Error setting Ctrl-C handler")?;

            let run = rampart::run(&config, cancel).await?;
            println!("{}", report::summary_table(&run));
            if run.status == RunStatus::Interrupted {
                println!("{}", "Run was interrupted, partial results kept.".yellow());
            }
        }

        Commands::Plan { config } => {
            let path = clap_args::config_path(config);
            let config = ExperimentConfig::try_from_path(&path)?;
            config.validate()?;
            print_plan(&config);
        }
    }

    Ok(())
}

fn print_plan(config: &ExperimentConfig) {
    let targets = &config.experiment.targets;
    let plan = config.plan.to_plan();

    let mut header = vec![
        TableCell::new("Iteration".bold()),
        TableCell::new("Load".bold()),
    ];
    header.extend(targets.iter().map(|t| TableCell::new(t.to_string().bold())));

    let mut rows = vec![Row::new(header)];
    for (index, load) in plan.iter() {
        let mut cells = vec![TableCell::new(index), TableCell::new(load)];
        cells.extend(
            distribute_load(load, targets.len())
                .into_iter()
                .map(TableCell::new),
        );
        rows.push(Row::new(cells));
    }

    let table = Table::builder()
        .rows(rows)
        .style(TableStyle::rounded())
        .build();

    println!("{}:", config.experiment.name.green());
    println!("{}", table.render());
}

fn get_subscriber(env_filter: String) -> impl Subscriber + Sync + Send {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(env_filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .finish()
}
