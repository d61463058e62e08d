use crate::config_path;
use crate::output::print_json;
use opsctl_core::config::Config;
use opsctl_core::error::OpsError;
use opsctl_core::identity::{self, HttpIpLookup, IdentityRequest};
use std::path::Path;

pub fn run(
    config_file: Option<&Path>,
    ip: Option<&str>,
    label: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    // Identity does not need environments, so a missing config is fine here.
    let config = match config_path::load(config_file) {
        Ok((_, config)) => config,
        Err(e) if matches!(e.downcast_ref::<OpsError>(), Some(OpsError::NotConfigured)) => {
            Config::default()
        }
        Err(e) => return Err(e),
    };

    let req = IdentityRequest {
        label: super::label(label, &config),
        explicit_ip: ip,
        configured_ip: config.ip_address.as_deref(),
    };
    let rt = super::runtime()?;
    let identity = rt.block_on(identity::resolve(&req, &HttpIpLookup::new()))?;

    if json {
        print_json(&identity)?;
    } else {
        println!("label:  {}", identity.label);
        println!("cidr:   {}", identity.cidr);
        println!("source: {}", identity.source);
    }
    Ok(())
}
