use crate::error::{OpsError, Result};
use crate::identity::Cidr;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// ExtraPorts
// ---------------------------------------------------------------------------

/// Ports opened in addition to the policy defaults, per role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraPorts {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bastion: Vec<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub publishing: Vec<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub web: Vec<u16>,
}

impl ExtraPorts {
    pub fn is_empty(&self) -> bool {
        self.bastion.is_empty() && self.publishing.is_empty() && self.web.is_empty()
    }

    pub fn merged(&self, other: &ExtraPorts) -> ExtraPorts {
        let join = |a: &[u16], b: &[u16]| a.iter().chain(b).copied().collect::<Vec<_>>();
        ExtraPorts {
            bastion: join(&self.bastion, &other.bastion),
            publishing: join(&self.publishing, &other.publishing),
            web: join(&self.web, &other.web),
        }
    }

    fn all(&self) -> impl Iterator<Item = u16> + '_ {
        self.bastion
            .iter()
            .chain(&self.publishing)
            .chain(&self.web)
            .copied()
    }
}

// ---------------------------------------------------------------------------
// EnvironmentConfig
// ---------------------------------------------------------------------------

pub const TAG_CI: &str = "ci";
pub const TAG_LIVE: &str = "live";
pub const TAG_PRODUCTION: &str = "production";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentConfig {
    pub name: String,
    /// Provider credentials profile.
    #[serde(default)]
    pub profile: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "ExtraPorts::is_empty")]
    pub extra_ports: ExtraPorts,
}

impl EnvironmentConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            profile: String::new(),
            region: None,
            tags: Vec::new(),
            extra_ports: ExtraPorts::default(),
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn is_ci(&self) -> bool {
        self.has_tag(TAG_CI)
    }

    pub fn is_live(&self) -> bool {
        self.has_tag(TAG_LIVE) || self.has_tag(TAG_PRODUCTION)
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

/// The slice of the tool's config file the access reconciler reads.
/// Keys belonging to other commands are ignored on load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub ssh_user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    /// Serve bastion over HTTPS only (drops port 22 from the bastion policy).
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub environments: Vec<EnvironmentConfig>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(OpsError::NotConfigured);
        }
        let data = std::fs::read_to_string(path)?;
        Self::from_yaml(&data)
    }

    pub fn from_yaml(data: &str) -> Result<Self> {
        // An empty file deserialises to unit; treat it as an empty config.
        if data.trim().is_empty() {
            return Ok(Config::default());
        }
        Ok(serde_yaml::from_str(data)?)
    }

    pub fn environment(&self, name: &str) -> Result<&EnvironmentConfig> {
        self.environments
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| OpsError::UnknownEnvironment(name.to_string()))
    }

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut warn = |level: WarnLevel, message: String| {
            warnings.push(ConfigWarning { level, message })
        };

        if self.ssh_user.trim().is_empty() {
            warn(
                WarnLevel::Warning,
                "sshUser is empty; allow/deny will require --label".to_string(),
            );
        }

        if let Some(ip) = &self.ip_address {
            if let Err(e) = Cidr::parse(ip) {
                warn(WarnLevel::Error, format!("ipAddress: {e}"));
            }
        }

        let mut seen = HashSet::new();
        for env in &self.environments {
            if env.name.trim().is_empty() {
                warn(WarnLevel::Error, "environment with empty name".to_string());
                continue;
            }
            if !seen.insert(env.name.as_str()) {
                warn(
                    WarnLevel::Error,
                    format!("environment '{}' is defined more than once", env.name),
                );
            }
            if env.profile.trim().is_empty() {
                warn(
                    WarnLevel::Warning,
                    format!(
                        "environment '{}' has no profile; the default provider profile will be used",
                        env.name
                    ),
                );
            }
            if env.is_ci() && env.is_live() {
                warn(
                    WarnLevel::Warning,
                    format!(
                        "environment '{}' is tagged both ci and live; ci policy applies",
                        env.name
                    ),
                );
            }
            if env.extra_ports.all().any(|p| p == 0) {
                warn(
                    WarnLevel::Error,
                    format!("environment '{}' lists port 0 in extraPorts", env.name),
                );
            }
            if env.is_ci() && !env.extra_ports.is_empty() {
                warn(
                    WarnLevel::Warning,
                    format!(
                        "environment '{}' is a ci fleet; extraPorts are ignored",
                        env.name
                    ),
                );
            }
        }

        warnings
    }

    /// Starter config written by `opsctl config init`.
    pub fn template(ssh_user: &str) -> String {
        format!(
            "sshUser: \"{ssh_user}\"\n\
             httpOnly: false\n\
             environments:\n  \
               - name: develop\n    \
                 profile: develop\n    \
                 tags: []\n  \
               - name: live\n    \
                 profile: production\n    \
                 tags: [live]\n  \
               - name: build\n    \
                 profile: ci\n    \
                 tags: [ci]\n"
        )
    }
}
