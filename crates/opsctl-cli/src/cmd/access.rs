use crate::config_path;
use crate::output::print_json;
use clap::Args;
use opsctl_core::cache::ObservationCache;
use opsctl_core::config::{Config, ExtraPorts};
use opsctl_core::identity::{self, HttpIpLookup, IdentityRequest};
use opsctl_core::provider::AwsCli;
use opsctl_core::reconcile::{reconcile_environment, Outcome, ReconcileResult};
use opsctl_core::report::ConsoleReporter;
use opsctl_core::types::Direction;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Arguments
// ---------------------------------------------------------------------------

#[derive(Args)]
pub struct AllowArgs {
    /// Environment name from config
    pub env: String,

    /// Rule owner (default: sshUser from config)
    #[arg(long)]
    pub label: Option<String>,

    /// Address or CIDR to open (default: ipAddress, OPSCTL_IP_ADDRESS, then lookup)
    #[arg(long)]
    pub ip: Option<String>,

    /// Extra bastion port (repeatable)
    #[arg(long = "bastion-port", value_name = "PORT")]
    pub bastion_ports: Vec<u16>,

    /// Extra publishing ELB port (repeatable)
    #[arg(long = "publishing-port", value_name = "PORT")]
    pub publishing_ports: Vec<u16>,

    /// Extra web ELB port (repeatable)
    #[arg(long = "web-port", value_name = "PORT")]
    pub web_ports: Vec<u16>,
}

#[derive(Args)]
pub struct DenyArgs {
    /// Environment name from config
    pub env: String,

    /// Rule owner (default: sshUser from config)
    #[arg(long)]
    pub label: Option<String>,

    /// Address recorded in the result (default: resolved as for allow; a
    /// failed public-IP lookup does not block the deny)
    #[arg(long)]
    pub ip: Option<String>,
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

pub fn allow(
    config: Option<&Path>,
    args: AllowArgs,
    call_timeout: Duration,
    json: bool,
) -> anyhow::Result<()> {
    let extra = ExtraPorts {
        bastion: args.bastion_ports,
        publishing: args.publishing_ports,
        web: args.web_ports,
    };
    let invocation = Invocation {
        direction: Direction::Allow,
        env: &args.env,
        label: args.label.as_deref(),
        ip: args.ip.as_deref(),
        extra: &extra,
        call_timeout,
    };
    run(config, &invocation, json)
}

pub fn deny(
    config: Option<&Path>,
    args: DenyArgs,
    call_timeout: Duration,
    json: bool,
) -> anyhow::Result<()> {
    let extra = ExtraPorts::default();
    let invocation = Invocation {
        direction: Direction::Deny,
        env: &args.env,
        label: args.label.as_deref(),
        ip: args.ip.as_deref(),
        extra: &extra,
        call_timeout,
    };
    run(config, &invocation, json)
}

struct Invocation<'a> {
    direction: Direction,
    env: &'a str,
    label: Option<&'a str>,
    ip: Option<&'a str>,
    extra: &'a ExtraPorts,
    call_timeout: Duration,
}

fn run(config_file: Option<&Path>, inv: &Invocation<'_>, json: bool) -> anyhow::Result<()> {
    let (_, config) = config_path::load(config_file)?;
    // Input errors surface before the runtime or any provider exists.
    let env = config.environment(inv.env)?;
    if inv.extra.bastion.iter().chain(&inv.extra.publishing).chain(&inv.extra.web).any(|p| *p == 0) {
        anyhow::bail!("port 0 is not a valid extra port");
    }

    let rt = super::runtime()?;
    let result = rt.block_on(reconcile(&config, env.name.as_str(), inv, json))?;

    if json {
        print_json(&result)?;
    }
    finish(&result)
}

async fn reconcile(
    config: &Config,
    env_name: &str,
    inv: &Invocation<'_>,
    json: bool,
) -> anyhow::Result<ReconcileResult> {
    let req = IdentityRequest {
        label: super::label(inv.label, config),
        explicit_ip: inv.ip,
        configured_ip: config.ip_address.as_deref(),
    };
    let identity = identity::resolve_for(inv.direction, &req, &HttpIpLookup::new()).await?;
    tracing::info!(label = %identity.label, cidr = %identity.cidr, source = %identity.source, "operator identity");

    let api = AwsCli::for_environment(config.environment(env_name)?)?
        .with_call_timeout(inv.call_timeout);

    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("interrupted: stopping after the current call");
                cancel.cancel();
            }
        })
    };

    let mut reporter = ConsoleReporter::new(json);
    let mut cache = ObservationCache::new();
    let result = reconcile_environment(
        &api,
        config,
        env_name,
        inv.direction,
        &identity,
        inv.extra,
        &mut reporter,
        &mut cache,
        &cancel,
    )
    .await;
    watcher.abort();
    Ok(result?)
}

fn finish(result: &ReconcileResult) -> anyhow::Result<()> {
    match result.outcome {
        Outcome::Applied | Outcome::NoChanges { .. } => Ok(()),
        Outcome::Cancelled => anyhow::bail!(
            "{} {} cancelled; {} change(s) were applied before stopping",
            result.direction,
            result.environment,
            result.summary.total_changes
        ),
        Outcome::PartialSuccess | Outcome::Failed => anyhow::bail!(
            "{} {}: {} group(s) failed",
            result.direction,
            result.environment,
            result.summary.failed_groups
        ),
    }
}
