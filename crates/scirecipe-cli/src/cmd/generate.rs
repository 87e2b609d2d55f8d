use crate::output::{print_json, print_table};
use anyhow::Context;
use scirecipe_core::collaborator::Completion;
use scirecipe_core::config::{Config, WarnLevel};
use scirecipe_core::protocol::load_protocols;
use scirecipe_core::runner::{BatchRunner, BatchSummary, RunnerSettings};
use std::path::Path;

pub fn run(root: &Path, input: Option<&Path>, limit: Option<usize>, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let warnings = config.validate();
    for w in &warnings {
        match w.level {
            WarnLevel::Warning => tracing::warn!("{}", w.message),
            WarnLevel::Error => tracing::error!("{}", w.message),
        }
    }
    if Config::has_errors(&warnings) {
        anyhow::bail!("config has errors; run 'scirecipe config validate'");
    }

    let input_path = match input {
        Some(p) => p.to_path_buf(),
        None => config.input_path(root),
    };
    let batch = load_protocols(&input_path)
        .with_context(|| format!("failed to read {}", input_path.display()))?;
    if batch.malformed_lines > 0 {
        tracing::warn!(lines = batch.malformed_lines, "skipped malformed input lines");
    }

    let generator = super::chat_client(&config.collaborator, &config.collaborator.model)?;
    let reviewer = match &config.reviewer {
        Some(r) => Some(super::chat_client(&config.collaborator, &r.model)?),
        None => None,
    };

    let success = config.success_path(root);
    let failure = config.failure_path(root);
    let mut runner = BatchRunner::new(
        &generator,
        reviewer.as_ref().map(|r| r as &dyn Completion),
        RunnerSettings::from_config(&config),
        &success,
        &failure,
    )
    .context("failed to open output streams")?;
    let summary = runner.run(&batch.records, limit)?;

    if json {
        print_json(&serde_json::json!({
            "summary": summary,
            "success": success.display().to_string(),
            "failure": failure.display().to_string(),
            "finished_at": chrono::Utc::now().to_rfc3339(),
        }))?;
    } else {
        print_summary(&summary);
        println!();
        println!("Saved accepted records to: {}", success.display());
        println!("Saved failed records to:   {}", failure.display());
    }
    Ok(())
}

fn print_summary(s: &BatchSummary) {
    let rows = [
        ("input records", s.input_records),
        ("skipped (seen ids)", s.skipped_seen),
        ("skipped (incomplete)", s.skipped_incomplete),
        ("generated", s.generated),
        ("repaired", s.repaired),
        ("accepted", s.accepted),
        ("flagged by reviewer", s.flagged),
        ("rejected (schema)", s.rejected),
        ("generation errors", s.unit_errors),
    ]
    .iter()
    .map(|(k, v)| vec![k.to_string(), v.to_string()])
    .collect();
    print_table(&["STAGE", "COUNT"], rows);
}
