use crate::output::{print_json, print_metrics};
use anyhow::Context;
use scirecipe_core::blocks::extract_answer;
use scirecipe_core::schema::validate_action_plan;
use scirecipe_core::scoring::{align, parse_key_lenient, score, score_key_blocks};
use std::path::Path;

pub fn run(predicted: &Path, reference: &Path, json: bool) -> anyhow::Result<()> {
    let predicted = key_block(predicted)?;
    let reference = key_block(reference)?;

    let (mode, metrics, alignment) = match (
        validate_action_plan(&predicted),
        validate_action_plan(&reference),
    ) {
        (Ok(p), Ok(r)) => ("strict", score(&p, &r), align(&p.actions(), &r.actions())),
        _ => {
            let actions = |block: &str| -> Vec<String> {
                parse_key_lenient(block)
                    .map(|steps| steps.into_iter().map(|s| s.action).collect())
                    .unwrap_or_default()
            };
            let p = actions(&predicted);
            let r = actions(&reference);
            let p: Vec<&str> = p.iter().map(String::as_str).collect();
            let r: Vec<&str> = r.iter().map(String::as_str).collect();
            (
                "lenient",
                score_key_blocks(&predicted, &reference),
                align(&p, &r),
            )
        }
    };

    if json {
        print_json(&serde_json::json!({
            "mode": mode,
            "metrics": metrics,
            "alignment": alignment,
        }))?;
    } else {
        println!("Scoring mode: {mode}");
        println!();
        print_metrics(metrics.entries());
        println!();
        println!("Aligned steps: {}", alignment.len());
    }
    Ok(())
}

/// The `<key>` block of a tagged answer, or the whole file when it holds
/// a bare plan.
fn key_block(path: &Path) -> anyhow::Result<String> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(match extract_answer(&text) {
        Some(blocks) => blocks.key,
        None => text.trim().to_string(),
    })
}
