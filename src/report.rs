use crate::experiment::{CommandOutcome, ExperimentRun, RunStatus};
use anyhow::Context;
use colored::Colorize;
use std::fs;
use term_table::{row::Row, table_cell::TableCell, Table, TableStyle};

/// Consumes a run after every recorded iteration and once more when it finishes, so reports can
/// be produced from runs that are still going or were interrupted.
pub trait RunSink: Send + Sync {
    fn name(&self) -> &str;

    fn consume(&self, run: &ExperimentRun) -> anyhow::Result<()>;
}

/// Rewrites `<run_dir>/experiment.json` with the whole run each time it is handed one.
#[derive(Debug, Default)]
pub struct JsonSummarySink;

impl RunSink for JsonSummarySink {
    fn name(&self) -> &str {
        "json-summary"
    }

    fn consume(&self, run: &ExperimentRun) -> anyhow::Result<()> {
        let path = run.run_dir.join("experiment.json");
        let json = serde_json::to_string_pretty(run)?;
        fs::write(&path, json).with_context(|| format!("Unable to write {}", path.display()))
    }
}

/// One row per iteration: load, per-target exit codes and missing artifacts.
pub fn summary_table(run: &ExperimentRun) -> String {
    let mut header = vec![
        TableCell::new("Iteration".bold()),
        TableCell::new("Load".bold()),
    ];
    header.extend(run.targets.iter().map(|t| TableCell::new(t.to_string().bold())));
    header.push(TableCell::new("Missing artifacts".bold()));

    let mut rows = vec![Row::new(header)];
    for iteration in run.iterations() {
        let mut cells = vec![
            TableCell::new(iteration.index),
            TableCell::new(iteration.load_total),
        ];
        cells.extend(run.targets.iter().map(|target| {
            let cell = match iteration.results.get(target) {
                Some(CommandOutcome::Completed { exit_code: 0, .. }) => "✓".green(),
                Some(CommandOutcome::Completed { exit_code, .. }) => format!("rc={exit_code}").red(),
                Some(CommandOutcome::Unreachable { .. }) => "unreachable".red(),
                None => "--".bright_black(),
            };
            TableCell::new(cell)
        }));

        let missing = iteration
            .missing_artifacts()
            .iter()
            .map(|(collector, target)| format!("{collector}@{target}"))
            .collect::<Vec<_>>();
        cells.push(TableCell::new(if missing.is_empty() {
            "--".to_string()
        } else {
            missing.join(", ")
        }));
        rows.push(Row::new(cells));
    }

    let status = match run.status {
        RunStatus::Done => "done".green(),
        RunStatus::Interrupted => "interrupted".yellow(),
        RunStatus::Running => "running".normal(),
    };

    let table = Table::builder()
        .rows(rows)
        .style(TableStyle::rounded())
        .build();

    format!(
        "{} {} ({}, {}/{} iterations)\n{}",
        run.name.green(),
        run.id,
        status,
        run.iterations().len(),
        run.plan.len(),
        table.render()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::Target;
    use serde_json::Value;

    #[test]
    fn json_summary_is_rewritten_in_place() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut run = ExperimentRun::new(
            "ramp",
            vec![Target::new("10.0.0.1")],
            vec!["flamegraph".to_string()],
            vec![100, 200],
            dir.path().to_path_buf(),
        );
        let sink = JsonSummarySink;

        sink.consume(&run)?;
        run.finish(RunStatus::Interrupted);
        sink.consume(&run)?;

        let json: Value = serde_json::from_str(&fs::read_to_string(
            dir.path().join("experiment.json"),
        )?)?;
        assert_eq!(json["status"], "interrupted");
        assert_eq!(json["targets"][0], "10.0.0.1");
        assert_eq!(json["iterations"].as_array().map(Vec::len), Some(0));
        Ok(())
    }

    #[test]
    fn summary_lists_every_target() {
        let run = ExperimentRun::new(
            "ramp",
            vec![Target::new("10.0.0.1"), Target::new("10.0.0.2")],
            vec![],
            vec![100],
            Default::default(),
        );
        let rendered = summary_table(&run);
        assert!(rendered.contains("10.0.0.1"));
        assert!(rendered.contains("10.0.0.2"));
    }
}
