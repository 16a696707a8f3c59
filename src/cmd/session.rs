//! Session lifecycle commands: `phasegate init | status | approve | report`.

use anyhow::{Result, bail};
use console::style;
use phasegate::lifecycle::LifecycleController;
use phasegate::session::{OverallStatus, PhaseStatus, SessionStore, TaskStatus};
use std::sync::Arc;

use super::Context;

fn styled_status(status: OverallStatus) -> console::StyledObject<String> {
    let text = status.to_string();
    match status {
        OverallStatus::Complete => style(text).green().bold(),
        OverallStatus::InProgress => style(text).cyan(),
        OverallStatus::Incomplete => style(text).yellow(),
        OverallStatus::Error | OverallStatus::Invalid | OverallStatus::NoEvidence => {
            style(text).red().bold()
        }
    }
}

pub fn cmd_init(ctx: &Context, session_id: &str) -> Result<()> {
    let store = ctx.session_store();
    let _guard = ctx.lock_session(session_id)?;
    if store.exists(session_id) {
        bail!(
            "Session {} already exists in {}",
            session_id,
            store.root().display()
        );
    }

    let mut controller = LifecycleController::new(Arc::new(store.clone()), &ctx.config);
    let session = controller.initialize(session_id)?;
    let phase = session.current_phase();
    ctx.ledger().initialize_session(session_id)?;

    println!(
        "{} Initialized session {}",
        style("✓").green().bold(),
        style(session_id).bold()
    );
    println!("  State:  {}", store.session_dir(session_id).display());
    println!("  Phase:  {} ({})", phase.name(), phase.slug());
    Ok(())
}

pub fn cmd_status(ctx: &Context, session_id: &str) -> Result<()> {
    let controller = ctx.resume(session_id)?;
    let session = controller.session()?;
    let status = session.overall_status();

    println!();
    println!("Session {}", style(&session.session_id).bold());
    println!("{}", "=".repeat(8 + session.session_id.len()));
    println!();
    println!("{:<4} {:<20} {:<12} {:>8} {:>10}", "#", "Phase", "Status", "Retries", "Duration");
    println!("{}", "-".repeat(58));

    for record in session.phases() {
        let marker = if record.phase == session.current_phase() {
            style("▶").cyan().to_string()
        } else {
            " ".to_string()
        };
        let status_text = format!("{:?}", record.status);
        let status_cell = match record.status {
            PhaseStatus::Completed => style(format!("{:<12}", status_text)).green(),
            PhaseStatus::InProgress => style(format!("{:<12}", status_text)).cyan(),
            PhaseStatus::Failed | PhaseStatus::TimedOut => {
                style(format!("{:<12}", status_text)).red()
            }
            PhaseStatus::Pending => style(format!("{:<12}", status_text)).dim(),
        };
        let duration = record
            .duration_ms
            .map(|ms| format!("{:.1}s", ms as f64 / 1000.0))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}{:<3} {:<20} {} {:>8} {:>10}",
            marker,
            record.phase.index() + 1,
            record.phase.name(),
            status_cell,
            record.retry_count,
            duration
        );
    }

    println!();
    println!("Overall:   {}", styled_status(status));
    println!("Progress:  {:.0}%", session.progress() * 100.0);

    if !session.tasks().is_empty() {
        let count = |s: TaskStatus| session.tasks().values().filter(|t| t.status == s).count();
        println!(
            "Tasks:     {} total, {} completed, {} in progress, {} failed, {} escalated",
            session.tasks().len(),
            count(TaskStatus::Completed),
            count(TaskStatus::InProgress),
            count(TaskStatus::Failed),
            count(TaskStatus::Escalated)
        );
    }
    if session.explicit_approval() {
        println!("Approval:  {}", style("continuation approved").green());
    }

    let next = controller
        .continuation()
        .determine_next_action(&session.continuation_state());
    let verdict = if next.proceed {
        style("may proceed").green()
    } else {
        style("halted").red()
    };
    println!("Next:      {} ({})", verdict, next.reason);

    if !session.errors().is_empty() {
        println!();
        println!("Errors:");
        for err in session.errors() {
            println!(
                "  {} {} {}",
                style(err.at.format("%Y-%m-%d %H:%M:%S")).dim(),
                style(&err.code).red(),
                err.message
            );
        }
    }
    println!();
    Ok(())
}

pub fn cmd_approve(
    ctx: &Context,
    session_id: &str,
    yes: bool,
    approver: Option<&str>,
) -> Result<()> {
    let _guard = ctx.lock_session(session_id)?;
    let mut controller = ctx.resume(session_id)?;
    let status = controller.session()?.overall_status();

    if !yes {
        use dialoguer::Confirm;

        println!(
            "Session {} is {}. Approving lets it continue past the current checkpoint.",
            style(session_id).bold(),
            styled_status(status)
        );
        let confirm = Confirm::new()
            .with_prompt("Approve continuation?")
            .default(false)
            .interact()
            .unwrap_or(false);
        if !confirm {
            println!("Approval cancelled.");
            return Ok(());
        }
    }

    let approver = approver
        .map(str::to_string)
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "operator".to_string());
    let request = controller.approve_continuation(&approver)?;
    println!(
        "{} Continuation approved for {} by {} (request {})",
        style("✓").green().bold(),
        session_id,
        approver,
        style(&request.request_id).dim()
    );
    Ok(())
}

pub fn cmd_report(ctx: &Context, session_id: &str) -> Result<()> {
    let _guard = ctx.lock_session(session_id)?;
    let mut controller = ctx.resume(session_id)?;
    let (report, path) = controller.generate_final_report()?;
    let json = serde_json::to_string_pretty(&report)?;
    println!("{}", json);
    eprintln!("Report written to {}", path);
    Ok(())
}
