//! Evidence ledger commands: `phasegate verify | inventory`.

use anyhow::{Result, bail};
use console::style;

use super::Context;

pub fn cmd_verify(ctx: &Context, session_id: &str) -> Result<()> {
    let mut ledger = ctx.ledger();
    ledger.initialize_session(session_id)?;

    match ledger.verify_session_integrity(session_id) {
        Ok(report) => {
            println!(
                "{} Evidence for {} is intact",
                style("✓").green().bold(),
                style(session_id).bold()
            );
            println!("  Items verified: {}", report.items_verified);
            println!("  Index hash:     {}", report.index_hash);
            Ok(())
        }
        Err(err) => {
            println!(
                "{} Evidence for {} failed verification",
                style("✗").red().bold(),
                style(session_id).bold()
            );
            for failure in ledger.integrity_failures() {
                println!(
                    "  {} expected {} got {}",
                    failure.evidence_id.as_deref().unwrap_or("index"),
                    style(&failure.expected).dim(),
                    style(&failure.actual).red()
                );
            }
            Err(err.into())
        }
    }
}

pub fn cmd_inventory(ctx: &Context, session_id: &str, operations: &[String]) -> Result<()> {
    if !ctx.session_store().session_dir(session_id).exists() {
        bail!("Session {} does not exist", session_id);
    }
    let mut ledger = ctx.ledger();
    ledger.initialize_session(session_id)?;
    for operation in operations {
        ledger.register_operation(session_id, operation)?;
    }
    let inventory = ledger.get_evidence_inventory(session_id)?;

    println!();
    println!("Evidence inventory for {}", style(session_id).bold());
    println!();
    println!("Covered operations ({}):", inventory.covered.len());
    for op in &inventory.covered {
        let marker = if inventory.unregistered.contains(op) {
            style("(unregistered)").dim().to_string()
        } else {
            String::new()
        };
        println!("  {} {} {}", style("✓").green(), op, marker);
    }

    if !operations.is_empty() {
        println!();
        if inventory.is_complete() {
            println!(
                "{} Every registered operation has evidence",
                style("✓").green().bold()
            );
        } else {
            println!("Missing evidence ({}):", inventory.missing.len());
            for op in &inventory.missing {
                println!("  {} {}", style("✗").red(), op);
            }
        }
    }
    println!();
    Ok(())
}
