//! Status, history, clean, and show commands.

use anyhow::{Context, Result};
use console::style;
use guideforge::artifact::ArtifactSlots;
use guideforge::config::TargetConfig;
use guideforge::orchestrator::{self, Liveness, LockFileManager};

pub fn cmd_status(target: &TargetConfig, json: bool) -> Result<()> {
    let report = orchestrator::status(target, &LockFileManager::new())?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize status")?
        );
        return Ok(());
    }

    let liveness = match report.liveness {
        Liveness::Running => style(report.liveness.to_string()).green(),
        Liveness::Stale => style(report.liveness.to_string()).yellow(),
        Liveness::Idle => style(report.liveness.to_string()).dim(),
    };

    println!();
    println!("Target:     {}", style(&report.target).bold());
    println!("State:      {}", liveness);
    if let (Some(run_id), Some(pid)) = (report.run_id, report.pid) {
        println!("Run:        {} (pid {})", run_id, pid);
    }
    if let Some(phase) = report.phase {
        println!("Phase:      {}", phase);
    }
    if let Some(iteration) = report.iteration {
        println!("Iteration:  {}", iteration);
    }
    if let Some(last) = report.last_eval_result {
        println!("Last eval:  {}", last);
    }
    if let Some(best) = report.best_pass_count {
        println!("Best:       {} passing", best);
    }
    if let Some(action) = &report.current_action {
        println!("Action:     {}", style(action).dim());
    }
    match report.committed_tokens {
        Some(tokens) => println!("Committed:  {} tokens", tokens),
        None => println!("Committed:  {}", style("none").dim()),
    }
    if report.liveness == Liveness::Stale {
        println!();
        println!(
            "{}",
            style("The recorded run is no longer alive; the next `run` reclaims its lock.").yellow()
        );
    }
    println!();
    Ok(())
}

pub fn cmd_history(target: &TargetConfig) -> Result<()> {
    let runs = orchestrator::history(target)?;
    if runs.is_empty() {
        println!("No runs recorded for {}.", target.target_id);
        return Ok(());
    }

    println!("{:<32} {:<10} Outcome", "Run", "Ended");
    println!("{:<32} {:<10} -------", "-".repeat(32), "-".repeat(10));
    for (dir, manifest) in runs {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match manifest {
            Some(m) => {
                let ended = m
                    .ended_at
                    .map(|t| t.format("%H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!("{:<32} {:<10} {}", name, ended, m.outcome);
            }
            None => println!(
                "{:<32} {:<10} {}",
                name,
                "-",
                style("(unreadable manifest)").dim()
            ),
        }
    }
    Ok(())
}

pub fn cmd_clean(target: &TargetConfig, keep: usize) -> Result<()> {
    let removed = orchestrator::clean(target, keep, &LockFileManager::new())?;
    if removed.is_empty() {
        println!("Nothing to clean.");
    } else {
        println!(
            "{} Removed {} run director{}",
            style("✓").green(),
            removed.len(),
            if removed.len() == 1 { "y" } else { "ies" }
        );
    }
    Ok(())
}

pub fn cmd_show(target: &TargetConfig) -> Result<()> {
    let slots = ArtifactSlots::new(&target.layout());
    match slots.load_committed()? {
        Some(artifact) => {
            print!("{}", artifact.text);
            if !artifact.text.ends_with('\n') {
                println!();
            }
            Ok(())
        }
        None => anyhow::bail!(
            "No committed guidelines for {}; run `guideforge run` first",
            target.target_id
        ),
    }
}
