//! Configuration view and validation commands (`testsmith config`).

use std::path::{Path, PathBuf};

use anyhow::Result;

use testsmith::config::{CONFIG_FILE_NAME, Settings};

use super::super::ConfigCommands;

pub fn cmd_config(explicit: Option<&Path>, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = match explicit {
        Some(p) => p.to_path_buf(),
        None => Settings::default_path(),
    };

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("testsmith Configuration");
            println!("=======================");
            println!();

            let mut settings = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                Settings::load(&config_path)?
            } else {
                println!("No {} found at {}", CONFIG_FILE_NAME, config_path.display());
                println!("Using default configuration.");
                Settings::default()
            };
            settings.apply_env()?;
            println!();
            println!("Effective values (with env overrides):");
            println!();
            print!("{}", settings.to_toml()?);
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let settings = if config_path.exists() {
                Settings::load(&config_path)?
            } else {
                println!("No {} found. Validating defaults.", CONFIG_FILE_NAME);
                Settings::default()
            };
            let warnings = settings.validate()?;

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
            let target = explicit
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
            if target.exists() {
                println!("{} already exists at {}", CONFIG_FILE_NAME, target.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            Settings::default().save(&target)?;

            println!("Created {} at {}", CONFIG_FILE_NAME, target.display());
            println!();
            println!("You can now customize:");
            println!("  - [queue] max_concurrent, average_run_seconds");
            println!("  - [healing] enabled, max_attempts");
            println!("  - [llm] endpoint and [llm.models] fallback lists");
            println!("  - [presets.<name>] depth, page_limit, timeout_secs");
            println!();
        }
    }

    Ok(())
}
