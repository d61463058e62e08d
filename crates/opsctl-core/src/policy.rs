//! Desired per-group port policy for an environment.
//!
//! The policy is a pure function of the environment's kind (derived from its
//! tags), the `httpOnly` switch, and any extra ports. No provider access.

use crate::config::{Config, EnvironmentConfig, ExtraPorts};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const SSH_PORT: u16 = 22;
pub const HTTP_PORT: u16 = 80;
pub const HTTPS_PORT: u16 = 443;

// ---------------------------------------------------------------------------
// PortSet
// ---------------------------------------------------------------------------

/// A set of TCP ports. Iteration is ascending; port 0 is never a member.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortSet(BTreeSet<u16>);

impl PortSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, port: u16) -> bool {
        port != 0 && self.0.insert(port)
    }

    pub fn extend(&mut self, ports: impl IntoIterator<Item = u16>) {
        for p in ports {
            self.insert(p);
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        self.0.contains(&port)
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<u16> for PortSet {
    fn from_iter<I: IntoIterator<Item = u16>>(iter: I) -> Self {
        let mut set = PortSet::new();
        set.extend(iter);
        set
    }
}

impl std::fmt::Display for PortSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ports: Vec<String> = self.iter().map(|p| p.to_string()).collect();
        write!(f, "{{{}}}", ports.join(", "))
    }
}

// ---------------------------------------------------------------------------
// Environment kind / role
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentKind {
    Ci,
    Production,
    Standard,
}

impl EnvironmentKind {
    /// `ci` takes precedence over `live`/`production` when both are tagged.
    pub fn classify(env: &EnvironmentConfig) -> Self {
        if env.is_ci() {
            EnvironmentKind::Ci
        } else if env.is_live() {
            EnvironmentKind::Production
        } else {
            EnvironmentKind::Standard
        }
    }
}

impl std::fmt::Display for EnvironmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EnvironmentKind::Ci => "ci",
            EnvironmentKind::Production => "production",
            EnvironmentKind::Standard => "standard",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Bastion,
    PublishingElb,
    WebElb,
    CiWeb,
    CiWorker,
}

impl Role {
    pub fn logical_name(self, env: &str) -> String {
        match self {
            Role::Bastion => format!("{env} - bastion"),
            Role::PublishingElb => format!("{env} - publishing elb"),
            Role::WebElb => format!("{env} - web elb"),
            Role::CiWeb => format!("{env}-web"),
            Role::CiWorker => format!("{env}-worker"),
        }
    }

    /// CI fleets are located by Name tag alone.
    pub fn filters_by_environment(self) -> bool {
        !matches!(self, Role::CiWeb | Role::CiWorker)
    }
}

// ---------------------------------------------------------------------------
// GroupPolicy
// ---------------------------------------------------------------------------

/// Desired state for one logical security group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupPolicy {
    pub logical_name: String,
    pub role: Role,
    pub ports: PortSet,
    /// Value of the `Environment` tag filter, if one applies.
    pub environment_filter: Option<String>,
}

impl GroupPolicy {
    fn new(env: &str, role: Role, ports: PortSet) -> Self {
        Self {
            logical_name: role.logical_name(env),
            role,
            ports,
            environment_filter: role.filters_by_environment().then(|| env.to_string()),
        }
    }
}

/// Build the ordered group policies for `env_name`.
///
/// `extra` is unioned with the environment's configured `extraPorts`.
pub fn build(config: &Config, env_name: &str, extra: &ExtraPorts) -> Result<Vec<GroupPolicy>> {
    let env = config.environment(env_name)?;
    Ok(build_for(env, config.http_only, extra))
}

pub fn build_for(env: &EnvironmentConfig, http_only: bool, extra: &ExtraPorts) -> Vec<GroupPolicy> {
    let extra = env.extra_ports.merged(extra);
    let name = env.name.as_str();

    let bastion = || {
        let mut ports: PortSet = [HTTPS_PORT].into_iter().collect();
        if !http_only {
            ports.insert(SSH_PORT);
        }
        ports.extend(extra.bastion.iter().copied());
        GroupPolicy::new(name, Role::Bastion, ports)
    };

    match EnvironmentKind::classify(env) {
        EnvironmentKind::Ci => vec![
            GroupPolicy::new(name, Role::CiWeb, [SSH_PORT].into_iter().collect()),
            GroupPolicy::new(name, Role::CiWorker, [SSH_PORT].into_iter().collect()),
        ],
        EnvironmentKind::Production => vec![bastion()],
        EnvironmentKind::Standard => {
            let mut publishing: PortSet = [HTTPS_PORT].into_iter().collect();
            publishing.extend(extra.publishing.iter().copied());
            let mut web: PortSet = [HTTP_PORT, HTTPS_PORT].into_iter().collect();
            web.extend(extra.web.iter().copied());
            vec![
                bastion(),
                GroupPolicy::new(name, Role::PublishingElb, publishing),
                GroupPolicy::new(name, Role::WebElb, web),
            ]
        }
    }
}
