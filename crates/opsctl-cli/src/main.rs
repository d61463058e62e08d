mod cmd;
mod config_path;
mod output;

use clap::{Parser, Subcommand};
use cmd::{
    access::{AllowArgs, DenyArgs},
    config::ConfigSubcommand,
    env::EnvSubcommand,
};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "opsctl",
    about = "Open and close per-operator access to environment security groups",
    version,
    propagate_version = true
)]
struct Cli {
    /// Config file (default: nearest .opsctl.yaml, then ~/.opsctl/config.yaml)
    #[arg(long, global = true, env = "OPSCTL_CONFIG")]
    config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    /// Seconds before a single aws CLI call is abandoned
    #[arg(
        long,
        global = true,
        env = "OPSCTL_CALL_TIMEOUT",
        value_name = "SECS",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    call_timeout: u64,

    /// Log provider calls and identity resolution
    #[arg(long, global = true, short = 'v')]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the environment's policy ports to your current IP
    Allow(AllowArgs),

    /// Remove every rule labelled with your name from the environment
    Deny(DenyArgs),

    /// List the rules currently owned by a label in an environment
    Rules {
        /// Environment name from config
        env: String,
        /// Rule owner (default: sshUser from config)
        #[arg(long)]
        label: Option<String>,
    },

    /// Show the operator identity allow/deny would use
    Ip {
        /// Use this address instead of resolving one
        #[arg(long)]
        ip: Option<String>,
        /// Rule owner (default: sshUser from config)
        #[arg(long)]
        label: Option<String>,
    },

    /// Inspect configured environments
    Env {
        #[command(subcommand)]
        subcommand: EnvSubcommand,
    },

    /// Validate, show, or create the config file
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = cli.config.as_deref();
    let call_timeout = Duration::from_secs(cli.call_timeout);

    let result = match cli.command {
        Commands::Allow(args) => cmd::access::allow(config, args, call_timeout, cli.json),
        Commands::Deny(args) => cmd::access::deny(config, args, call_timeout, cli.json),
        Commands::Rules { env, label } => {
            cmd::rules::run(config, &env, label.as_deref(), call_timeout, cli.json)
        }
        Commands::Ip { ip, label } => {
            cmd::ip::run(config, ip.as_deref(), label.as_deref(), cli.json)
        }
        Commands::Env { subcommand } => cmd::env::run(config, subcommand, cli.json),
        Commands::Config { subcommand } => cmd::config::run(config, subcommand, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
