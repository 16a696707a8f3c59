//! Configuration view and validation commands: `phasegate config`.

use anyhow::{Context as _, Result, bail};
use phasegate::config::{CONFIG_DIR, CONFIG_FILE, PhasegateConfig};

use super::super::ConfigCommands;
use super::Context;

pub fn cmd_config(ctx: &Context, command: Option<ConfigCommands>) -> Result<()> {
    let config_dir = ctx.project_dir.join(CONFIG_DIR);
    let config_path = config_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Phasegate Configuration");
            println!("=======================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No {} found at {}, using defaults.", CONFIG_FILE, config_path.display());
            }
            println!();
            println!("Effective values (with env/CLI overrides):");
            println!();
            let rendered = toml::to_string_pretty(&ctx.config)
                .context("Failed to render configuration")?;
            println!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No {} found. Using defaults (valid).", CONFIG_FILE);
            }
            if let Err(err) = ctx.config.validate() {
                println!("Configuration errors:");
                for problem in err.message().split("; ") {
                    println!("  - {}", problem);
                }
                println!();
                bail!("configuration is invalid");
            }

            let warnings = ctx.config.warnings();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("{} already exists at {}", CONFIG_FILE, config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }
            if !config_dir.exists() {
                std::fs::create_dir_all(&config_dir).with_context(|| {
                    format!("Failed to create {}", config_dir.display())
                })?;
            }

            PhasegateConfig::default().save(&config_path)?;

            println!("Created {} at {}", CONFIG_FILE, config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [lifecycle] max_retries, phase timeouts");
            println!("  - [pools] l1_capacity, l2_capacity, stale_after_secs");
            println!("  - [review] max_iterations");
            println!();
        }
    }

    Ok(())
}
