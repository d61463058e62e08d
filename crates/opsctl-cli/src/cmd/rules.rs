use crate::config_path;
use crate::output::{print_json, Table};
use opsctl_core::cache::{observe_environment, GroupObservation, ObservationCache};
use opsctl_core::error::OpsError;
use opsctl_core::provider::AwsCli;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub fn run(
    config_file: Option<&Path>,
    env_name: &str,
    label: Option<&str>,
    call_timeout: Duration,
    json: bool,
) -> anyhow::Result<()> {
    let (_, config) = config_path::load(config_file)?;
    let env = config.environment(env_name)?;
    let label = super::label(label, &config);
    if label.trim().is_empty() {
        return Err(OpsError::MissingLabel.into());
    }

    let api = AwsCli::for_environment(env)?.with_call_timeout(call_timeout);
    let rt = super::runtime()?;
    let observations = rt.block_on(async {
        let mut cache = ObservationCache::new();
        observe_environment(
            &api,
            &config,
            env_name,
            label,
            &mut cache,
            &CancellationToken::new(),
        )
        .await
    })?;

    if json {
        return print_json(&serde_json::json!({
            "environment": env_name,
            "label": label,
            "groups": observations,
        }));
    }

    Table::with_rows(&["GROUP", "ID", "PORT", "CIDR", "NOTE"], rows(&observations)).print();
    Ok(())
}

fn rows(observations: &[GroupObservation]) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    for g in observations {
        let id = g.provider_id.clone().unwrap_or_default();
        if let Some(err) = &g.error {
            rows.push(vec![
                g.logical_name.clone(),
                id,
                String::new(),
                String::new(),
                err.message.clone(),
            ]);
            continue;
        }
        if g.observed.is_empty() {
            rows.push(vec![
                g.logical_name.clone(),
                id,
                String::new(),
                String::new(),
                format!("no rules (policy {})", g.ports),
            ]);
            continue;
        }
        for r in &g.observed.rules {
            rows.push(vec![
                g.logical_name.clone(),
                id.clone(),
                r.rule.port.to_string(),
                r.rule.cidr.to_string(),
                if r.unexpected {
                    "unexpected port".to_string()
                } else {
                    String::new()
                },
            ]);
        }
    }
    rows
}
