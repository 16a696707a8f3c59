//! Standalone artifact review: `phasegate review <files...>`.

use anyhow::{Context as _, Result};
use console::style;
use phasegate::review::{Candidate, ReviewLoop, Verdict};
use std::path::{Path, PathBuf};

use super::Context;

/// Judge the files once and print the verdict. Returns true on PASS.
pub fn cmd_review(
    ctx: &Context,
    files: &[PathBuf],
    response: Option<&Path>,
    evidence: &[String],
) -> Result<bool> {
    let mut candidate = Candidate::from_disk(files);
    if let Some(path) = response {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read response file: {}", path.display()))?;
        candidate = candidate.with_response(text);
    }
    for id in evidence {
        candidate = candidate.with_evidence(id.clone());
    }

    let mut review = ReviewLoop::from_config(&ctx.config);
    let judgment = review.judge("cli-review", &candidate);

    println!();
    for result in &judgment.criteria {
        let mark = if result.passed {
            style("✓").green()
        } else {
            style("✗").red()
        };
        print!("  {} {} {}", mark, style(result.id).bold(), result.label);
        match &result.detail {
            Some(detail) => println!(" {}", style(format!("({})", detail)).dim()),
            None => println!(),
        }
    }
    println!();

    let verdict = match judgment.verdict {
        Verdict::Pass => style(judgment.verdict.to_string()).green().bold(),
        _ => style(judgment.verdict.to_string()).red().bold(),
    };
    println!("Verdict: {}", verdict);
    if let Some(instruction) = &judgment.modification_instruction {
        println!();
        println!("Modification instruction:");
        println!("{}", instruction);
    }
    println!();

    Ok(judgment.is_pass())
}
