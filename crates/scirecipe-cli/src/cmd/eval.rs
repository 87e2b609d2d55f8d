use crate::output::{print_json, print_table};
use anyhow::Context;
use scirecipe_core::collaborator::{ChatClient, Completion};
use scirecipe_core::config::Config;
use scirecipe_core::eval::{load_samples, EvalHarness, EvalReport};
use scirecipe_core::tasks::{load_task_samples, TaskHarness, TaskKind, TaskReport};
use serde_json::Value;
use std::path::Path;

pub fn run(
    root: &Path,
    input: &Path,
    output: &Path,
    generate: bool,
    json: bool,
) -> anyhow::Result<()> {
    let samples = load_samples(input)
        .with_context(|| format!("failed to read {}", input.display()))?;

    let (client, temperature) = generator(root, generate)?;
    let harness = EvalHarness::new(client.as_ref().map(|c| c as &dyn Completion), temperature);
    let report = harness
        .run(&samples, output)
        .with_context(|| format!("failed to write {}", output.display()))?;

    if json {
        print_json(&report)?;
    } else {
        print_overall(&report);
        println!();
        println!("Saved rows and report to: {}", output.display());
    }
    Ok(())
}

/// Short-answer tasks are answered greedily.
pub fn run_task(
    root: &Path,
    kind: TaskKind,
    input: &Path,
    output: &Path,
    generate: bool,
    json: bool,
) -> anyhow::Result<()> {
    let samples = load_task_samples(input)
        .with_context(|| format!("failed to read {}", input.display()))?;
    let (client, _) = generator(root, generate)?;

    let harness = TaskHarness::new(kind, client.as_ref().map(|c| c as &dyn Completion), 0.0);
    let report = harness
        .run(&samples, output)
        .with_context(|| format!("failed to write {}", output.display()))?;

    if json {
        print_json(&report)?;
    } else {
        print_task(&report);
        println!();
        println!("Saved rows and report to: {}", output.display());
    }
    Ok(())
}

fn generator(root: &Path, generate: bool) -> anyhow::Result<(Option<ChatClient>, f32)> {
    if !generate {
        return Ok((None, 0.0));
    }
    let config = Config::load(root).context("failed to load config")?;
    let client = super::chat_client(&config.collaborator, &config.collaborator.model)?;
    Ok((Some(client), config.collaborator.temperature))
}

fn print_task(report: &TaskReport) {
    println!(
        "Task {}: {} of {} samples evaluated ({} failed)",
        report.task, report.evaluated, report.total, report.failed
    );
    if report.evaluated == 0 {
        return;
    }
    let rows = report
        .metrics
        .iter()
        .map(|(name, value)| vec![name.clone(), format!("{value:.4}")])
        .collect();
    print_table(&["METRIC", "VALUE"], rows);
}

fn print_overall(report: &EvalReport) {
    if report.overall.is_empty() {
        println!("No scorable samples.");
        return;
    }
    let rows = report
        .overall
        .iter()
        .map(|(name, value)| {
            let cell = match value {
                Value::Number(n) if n.is_f64() => format!("{:.4}", n.as_f64().unwrap_or_default()),
                other => other.to_string(),
            };
            vec![name.clone(), cell]
        })
        .collect();
    print_table(&["METRIC", "VALUE"], rows);
}
