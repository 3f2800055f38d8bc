//! Configuration view and validation commands: `foreman config`.

use anyhow::Result;
use foreman::config::{ForemanConfig, ForemanToml};
use std::path::Path;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = project_dir.join(".foreman").join("foreman.toml");

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No foreman.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();
            println!("Effective values (with FOREMAN_* overrides):");
            println!();

            let config = ForemanConfig::new(project_dir.to_path_buf())?;
            print!("{}", toml::to_string_pretty(&config.toml)?);
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No foreman.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = ForemanToml::load(&config_path)?;
            let warnings = toml.validate();

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
                println!("foreman.toml already exists at {}", config_path.display());
                println!("Remove it first to regenerate.");
                return Ok(());
            }

            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            ForemanToml::default().save(&config_path)?;
            println!("Created {}", config_path.display());
        }
    }

    Ok(())
}
