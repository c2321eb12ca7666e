//! CLI command implementations.
//!
//! | Module   | Commands handled                    |
//! |----------|-------------------------------------|
//! | `run`    | `Run`                               |
//! | `status` | `Status`, `History`, `Clean`, `Show` |

pub mod run;
pub mod status;

use anyhow::{Result, bail};
use guideforge::config::TargetConfig;
use std::path::PathBuf;

pub use run::cmd_run;
pub use status::{cmd_clean, cmd_history, cmd_show, cmd_status};

/// Resolve the target named on the command line against `base_dir`.
pub fn target_config(target: Option<&str>, base_dir: PathBuf) -> Result<TargetConfig> {
    let Some(target) = target.map(str::trim).filter(|t| !t.is_empty()) else {
        bail!("No target given; pass --target or set GUIDEFORGE_TARGET");
    };
    if !base_dir.is_dir() {
        bail!("Base directory {} does not exist", base_dir.display());
    }
    TargetConfig::new(target, base_dir).canonicalized()
}
