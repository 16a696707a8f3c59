//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module     | Commands handled                          |
//! |------------|-------------------------------------------|
//! | `session`  | `Init`, `Status`, `Approve`, `Report`     |
//! | `evidence` | `Verify`, `Inventory`                     |
//! | `review`   | `Review`                                  |
//! | `config`   | `Config`                                  |

pub mod config;
pub mod evidence;
pub mod review;
pub mod session;

pub use config::cmd_config;
pub use evidence::{cmd_inventory, cmd_verify};
pub use review::cmd_review;
pub use session::{cmd_approve, cmd_init, cmd_report, cmd_status};

use anyhow::{Context as _, Result};
use phasegate::config::PhasegateConfig;
use phasegate::evidence::{EvidenceLedger, FileEvidenceStore};
use phasegate::lifecycle::LifecycleController;
use phasegate::session::{FileSessionStore, SessionGuard};
use std::path::PathBuf;
use std::sync::Arc;

use super::{Cli, Commands};

/// Resolved settings shared by every command.
pub struct Context {
    pub project_dir: PathBuf,
    pub config: PhasegateConfig,
}

impl Context {
    /// Layer the config file, `PHASEGATE_*` variables and CLI flags.
    ///
    /// `config` subcommands skip validation so a broken file can still be
    /// shown and diagnosed.
    pub fn resolve(cli: &Cli) -> Result<Self> {
        let project_dir = match &cli.project_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().context("Failed to get current directory")?,
        };
        let mut config = PhasegateConfig::resolve(&project_dir)?;
        if let Some(dir) = &cli.state_dir {
            config.storage.state_dir = if dir.is_relative() {
                project_dir.join(dir)
            } else {
                dir.clone()
            };
        }
        if !matches!(cli.command, Commands::Config { .. }) {
            config.validate()?;
        }
        Ok(Self {
            project_dir,
            config,
        })
    }

    pub fn session_store(&self) -> FileSessionStore {
        FileSessionStore::new(&self.config.storage.state_dir)
    }

    pub fn ledger(&self) -> EvidenceLedger {
        EvidenceLedger::new(Arc::new(FileEvidenceStore::new(
            &self.config.storage.state_dir,
        )))
    }

    /// Controller over the file store, with the session already loaded.
    pub fn resume(&self, session_id: &str) -> Result<LifecycleController> {
        let mut controller =
            LifecycleController::new(Arc::new(self.session_store()), &self.config);
        controller.resume(session_id)?;
        Ok(controller)
    }

    /// Take ownership of a session directory for a mutating command.
    pub fn lock_session(&self, session_id: &str) -> Result<SessionGuard> {
        Ok(self.session_store().acquire_exclusive(session_id)?)
    }
}
