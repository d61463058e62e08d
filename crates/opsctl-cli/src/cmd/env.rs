use crate::config_path;
use crate::output::{print_json, Table};
use clap::Subcommand;
use opsctl_core::config::{Config, ExtraPorts};
use opsctl_core::policy::{self, EnvironmentKind, GroupPolicy};
use serde::Serialize;
use std::path::Path;

#[derive(Subcommand)]
pub enum EnvSubcommand {
    /// List environments with their kind and the groups allow would touch
    List,
}

#[derive(Serialize)]
struct EnvSummary<'a> {
    name: &'a str,
    kind: EnvironmentKind,
    profile: &'a str,
    region: Option<&'a str>,
    tags: &'a [String],
    groups: Vec<GroupPolicy>,
}

pub fn run(config_file: Option<&Path>, subcmd: EnvSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        EnvSubcommand::List => list(config_file, json),
    }
}

fn list(config_file: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let (_, config) = config_path::load(config_file)?;
    let envs = summarise(&config);

    if json {
        return print_json(&envs);
    }
    if envs.is_empty() {
        println!("No environments configured.");
        return Ok(());
    }

    let mut table = Table::new(&["NAME", "KIND", "PROFILE", "REGION", "GROUPS"]);
    for e in &envs {
        let groups: Vec<String> = e
            .groups
            .iter()
            .map(|g| format!("{} {}", g.logical_name, g.ports))
            .collect();
        table.push(vec![
            e.name.to_string(),
            e.kind.to_string(),
            e.profile.to_string(),
            e.region.unwrap_or_default().to_string(),
            groups.join("; "),
        ]);
    }
    table.print();
    Ok(())
}

fn summarise(config: &Config) -> Vec<EnvSummary<'_>> {
    config
        .environments
        .iter()
        .map(|env| EnvSummary {
            name: &env.name,
            kind: EnvironmentKind::classify(env),
            profile: &env.profile,
            region: env.region.as_deref(),
            tags: &env.tags,
            groups: policy::build_for(env, config.http_only, &ExtraPorts::default()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summaries_carry_kind_and_policy() {
        let config = Config::from_yaml(
            "sshUser: alice\nhttpOnly: true\nenvironments:\n  - name: live\n    tags: [live]\n  - name: build\n    tags: [ci]\n",
        )
        .unwrap();
        let envs = summarise(&config);
        assert_eq!(envs[0].kind, EnvironmentKind::Production);
        assert_eq!(envs[0].groups.len(), 1);
        assert_eq!(envs[0].groups[0].ports.to_string(), "{443}");
        assert_eq!(envs[1].kind, EnvironmentKind::Ci);
        assert_eq!(envs[1].groups[1].logical_name, "build-worker");
    }
}
