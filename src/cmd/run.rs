//! `guideforge run`.

use anyhow::{Result, bail};
use console::style;
use guideforge::config::TargetConfig;
use guideforge::oracle::validate_test_filter;
use guideforge::orchestrator::Orchestrator;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub async fn cmd_run(
    target: TargetConfig,
    test_filter: Option<String>,
    skip_refinement: bool,
) -> Result<()> {
    let settings = target.load_settings()?;

    let problems = settings.validate();
    if !problems.is_empty() {
        for problem in &problems {
            eprintln!("{} {}", style("error:").red().bold(), problem);
        }
        bail!("guideforge.toml has {} problem(s)", problems.len());
    }

    let test_filter = test_filter.or_else(|| settings.test_filter());
    if let Some(filter) = &test_filter {
        validate_test_filter(filter)?;
    }

    let cancel = CancellationToken::new();
    let mut orchestrator = Orchestrator::from_settings(target, &settings)?
        .with_test_filter(test_filter.clone())
        .with_cancel(cancel.clone());
    if skip_refinement {
        orchestrator = orchestrator.with_refinement(false);
    }

    println!(
        "{} {} in {}",
        style("Building guidelines for").bold(),
        style(&orchestrator.target().target_id).cyan(),
        orchestrator.target().base_dir.display()
    );
    if let Some(filter) = &test_filter {
        println!("  test filter: {}", style(filter).dim());
    }

    tokio::select! {
        result = orchestrator.start() => {
            let summary = result?;
            println!();
            println!("{} {}", style("✓").green().bold(), summary);
            println!("  committed: {}", summary.committed_path.display());
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            warn!("Interrupted; the next run resumes from saved state");
            bail!("Interrupted")
        }
    }
}
