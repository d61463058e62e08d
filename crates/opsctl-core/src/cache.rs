//! Per-invocation memoisation of located groups, plus the read-only
//! observation entry point used by reporting commands.

use crate::config::{Config, ExtraPorts};
use crate::error::{GroupError, Result};
use crate::locator::{self, ObservedState, SecurityGroup};
use crate::policy::{self, GroupPolicy};
use crate::provider::SecurityGroupApi;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// Located groups keyed by environment name, then logical group name.
///
/// Owned by the caller and passed explicitly; never process-global.
/// A reconcile invalidates its environment before observing and after
/// applying, so cached state never outlives a direction change.
#[derive(Debug, Default)]
pub struct ObservationCache {
    entries: HashMap<String, HashMap<String, SecurityGroup>>,
}

impl ObservationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, env: &str, logical_name: &str) -> Option<&SecurityGroup> {
        self.entries.get(env)?.get(logical_name)
    }

    pub fn insert(&mut self, env: &str, group: SecurityGroup) {
        self.entries
            .entry(env.to_string())
            .or_default()
            .insert(group.logical_name.clone(), group);
    }

    pub fn invalidate(&mut self, env: &str) {
        if self.entries.remove(env).is_some() {
            tracing::debug!(env, "invalidated observation cache");
        }
    }

    pub fn contains_env(&self, env: &str) -> bool {
        self.entries.contains_key(env)
    }
}

/// Locate `policy`'s group, serving from `cache` when possible.
pub async fn locate_cached(
    api: &dyn SecurityGroupApi,
    env: &str,
    policy: &GroupPolicy,
    cache: &mut ObservationCache,
    cancel: &CancellationToken,
) -> Result<SecurityGroup> {
    if let Some(group) = cache.get(env, &policy.logical_name) {
        return Ok(group.clone());
    }
    let group = locator::locate(api, policy, cancel).await?;
    cache.insert(env, group.clone());
    Ok(group)
}

// ---------------------------------------------------------------------------
// observe_environment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupObservation {
    pub logical_name: String,
    pub provider_id: Option<String>,
    pub ports: crate::policy::PortSet,
    pub observed: ObservedState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<GroupError>,
}

/// Current rules owned by `label` in every group scoped to `env_name`.
///
/// Discovery failures attach to the affected group; input errors (unknown
/// environment) fail the whole call.
pub async fn observe_environment(
    api: &dyn SecurityGroupApi,
    config: &Config,
    env_name: &str,
    label: &str,
    cache: &mut ObservationCache,
    cancel: &CancellationToken,
) -> Result<Vec<GroupObservation>> {
    let policies = policy::build(config, env_name, &ExtraPorts::default())?;
    let mut out = Vec::with_capacity(policies.len());
    for policy in &policies {
        let entry = match locate_cached(api, env_name, policy, cache, cancel).await {
            Ok(group) => GroupObservation {
                logical_name: policy.logical_name.clone(),
                provider_id: Some(group.provider_id.clone()),
                ports: policy.ports.clone(),
                observed: locator::observe(&group, label, &policy.ports),
                error: None,
            },
            Err(e) => GroupObservation {
                logical_name: policy.logical_name.clone(),
                provider_id: None,
                ports: policy.ports.clone(),
                observed: ObservedState::default(),
                error: Some(GroupError::from(&e)),
            },
        };
        out.push(entry);
    }
    Ok(out)
}
