use crate::config_path;
use crate::output::print_json;
use anyhow::Context;
use clap::Subcommand;
use opsctl_core::config::{Config, WarnLevel};
use opsctl_core::{io, paths};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Validate the config for common mistakes
    Validate,

    /// Print the resolved config file and its contents
    Show,

    /// Write a starter config if none exists
    Init {
        /// Default rule owner (default: $USER)
        #[arg(long)]
        ssh_user: Option<String>,

        /// Write ~/.opsctl/config.yaml instead of ./.opsctl.yaml
        #[arg(long)]
        user: bool,
    },
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(config_file: Option<&Path>, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Validate => validate(config_file, json),
        ConfigSubcommand::Show => show(config_file, json),
        ConfigSubcommand::Init { ssh_user, user } => {
            init(config_file, ssh_user.as_deref(), user, json)
        }
    }
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

fn validate(config_file: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let (path, config) = config_path::load(config_file)?;
    let warnings = config.validate();

    if json {
        let value = serde_json::json!({
            "path": path,
            "warnings": warnings,
        });
        print_json(&value)?;
    } else if warnings.is_empty() {
        println!("Config is valid. No warnings.");
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    let has_errors = warnings.iter().any(|w| w.level == WarnLevel::Error);
    if has_errors {
        anyhow::bail!("config validation found errors");
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// show
// ---------------------------------------------------------------------------

fn show(config_file: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let (path, config) = config_path::load(config_file)?;

    if json {
        return print_json(&serde_json::json!({
            "path": path,
            "config": config,
        }));
    }

    println!("# {}", path.display());
    print!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// init
// ---------------------------------------------------------------------------

fn init_target(explicit: Option<&Path>, user: bool) -> anyhow::Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(p.to_path_buf());
    }
    if user {
        return Ok(paths::user_config_path()?);
    }
    let cwd = std::env::current_dir().context("failed to read working directory")?;
    Ok(cwd.join(paths::LOCAL_CONFIG_FILE))
}

fn init(
    config_file: Option<&Path>,
    ssh_user: Option<&str>,
    user: bool,
    json: bool,
) -> anyhow::Result<()> {
    let path = init_target(config_file, user)?;
    let ssh_user = ssh_user
        .map(str::to_string)
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_default();

    let template = Config::template(&ssh_user);
    let created = io::create_new(&path, template.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))?;

    if json {
        return print_json(&serde_json::json!({
            "path": path,
            "created": created,
        }));
    }
    if created {
        println!("Created {}", path.display());
    } else {
        println!("{} already exists; left unchanged", path.display());
    }
    Ok(())
}
