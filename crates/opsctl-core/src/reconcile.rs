//! Diff desired against observed state per group and apply the difference.
//!
//! The diff ([`plan`]) is pure. [`Reconciler::reconcile`] walks groups in
//! policy order, one authorize and one revoke call at most per group, and
//! records per-group outcomes without aborting on a single group's failure.

use crate::cache::{self, ObservationCache};
use crate::config::{Config, ExtraPorts};
use crate::error::{GroupError, OpsError, Result};
use crate::identity::{Cidr, OperatorIdentity};
use crate::locator::{self, ObservedState};
use crate::policy::{self, GroupPolicy, PortSet};
use crate::provider::SecurityGroupApi;
use crate::report::Reporter;
use crate::types::{Direction, Rule};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Plan (pure diff)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupPlan {
    pub adds: Vec<Rule>,
    pub removes: Vec<Rule>,
    pub skipped: Vec<Rule>,
}

impl GroupPlan {
    pub fn mutation_count(&self) -> usize {
        self.adds.len() + self.removes.len()
    }

    pub fn is_noop(&self) -> bool {
        self.mutation_count() == 0
    }
}

/// Compute the minimal mutations for one group.
///
/// Allow adds `(port, identity.cidr)` for each desired port not already
/// present under the label. Deny ignores `desired` and removes every observed
/// rule under the label, whatever its CIDR or port.
pub fn plan(
    direction: Direction,
    observed: &ObservedState,
    desired: &PortSet,
    identity: &OperatorIdentity,
) -> GroupPlan {
    let mut out = GroupPlan::default();
    match direction {
        Direction::Allow => {
            for port in desired.iter() {
                let rule = Rule::new(port, identity.cidr.clone(), identity.label.clone());
                let present = observed
                    .iter()
                    .any(|r| r.port == port && r.cidr == identity.cidr);
                if present {
                    out.skipped.push(rule);
                } else {
                    out.adds.push(rule);
                }
            }
        }
        Direction::Deny => {
            out.removes = observed
                .iter()
                .filter(|r| r.label == identity.label)
                .cloned()
                .collect();
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoOpKind {
    AllowNoop,
    DenyNoop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Applied,
    NoChanges { reason: NoOpKind },
    PartialSuccess,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupOutcome {
    pub logical_name: String,
    pub provider_id: Option<String>,
    pub added: Vec<Rule>,
    pub removed: Vec<Rule>,
    pub skipped_existing: Vec<Rule>,
    /// Observed rules on ports outside the policy; surfaced as warnings only.
    pub unexpected: Vec<Rule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<GroupError>,
}

impl GroupOutcome {
    fn new(logical_name: &str) -> Self {
        Self {
            logical_name: logical_name.to_string(),
            provider_id: None,
            added: Vec::new(),
            removed: Vec::new(),
            skipped_existing: Vec::new(),
            unexpected: Vec::new(),
            error: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn changes(&self) -> usize {
        self.added.len() + self.removed.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub total_changes: usize,
    pub ok_groups: usize,
    pub failed_groups: usize,
    pub all_ok: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileResult {
    pub direction: Direction,
    pub environment: String,
    pub label: String,
    pub cidr: Cidr,
    pub groups: Vec<GroupOutcome>,
    pub summary: Summary,
    pub outcome: Outcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ReconcileResult {
    /// Applied changes and recognised no-ops both count as success.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Applied | Outcome::NoChanges { .. })
    }

    pub fn group(&self, logical_name: &str) -> Option<&GroupOutcome> {
        self.groups.iter().find(|g| g.logical_name == logical_name)
    }

    pub fn added(&self) -> impl Iterator<Item = &Rule> {
        self.groups.iter().flat_map(|g| &g.added)
    }

    pub fn removed(&self) -> impl Iterator<Item = &Rule> {
        self.groups.iter().flat_map(|g| &g.removed)
    }
}

fn summarise(groups: &[GroupOutcome]) -> Summary {
    let failed_groups = groups.iter().filter(|g| !g.is_ok()).count();
    Summary {
        total_changes: groups.iter().map(GroupOutcome::changes).sum(),
        ok_groups: groups.len() - failed_groups,
        failed_groups,
        all_ok: failed_groups == 0,
    }
}

fn classify(direction: Direction, summary: &Summary, cancelled: bool) -> Outcome {
    if cancelled {
        Outcome::Cancelled
    } else if summary.failed_groups > 0 {
        if summary.ok_groups > 0 {
            Outcome::PartialSuccess
        } else {
            Outcome::Failed
        }
    } else if summary.total_changes == 0 {
        Outcome::NoChanges {
            reason: match direction {
                Direction::Allow => NoOpKind::AllowNoop,
                Direction::Deny => NoOpKind::DenyNoop,
            },
        }
    } else {
        Outcome::Applied
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

pub struct ReconcileRequest<'a> {
    pub direction: Direction,
    pub environment: &'a str,
    pub policies: &'a [GroupPolicy],
    pub identity: &'a OperatorIdentity,
}

pub struct Reconciler<'a> {
    api: &'a dyn SecurityGroupApi,
}

impl<'a> Reconciler<'a> {
    pub fn new(api: &'a dyn SecurityGroupApi) -> Self {
        Self { api }
    }

    pub async fn reconcile(
        &self,
        req: &ReconcileRequest<'_>,
        reporter: &mut dyn Reporter,
        cache: &mut ObservationCache,
        cancel: &CancellationToken,
    ) -> ReconcileResult {
        let started_at = Utc::now();
        let identity = req.identity;
        let mut groups = Vec::with_capacity(req.policies.len());
        let mut cancelled = false;

        // Never diff against state observed under a previous direction.
        cache.invalidate(req.environment);

        for policy in req.policies {
            if cancel.is_cancelled() {
                tracing::debug!(group = %policy.logical_name, "cancelled before group");
                cancelled = true;
                break;
            }
            let outcome = self
                .reconcile_group(req, policy, reporter, cache, cancel)
                .await;
            let was_cancelled = outcome
                .error
                .as_ref()
                .is_some_and(|e| e.kind == crate::error::ErrorKind::Cancelled);
            groups.push(outcome);
            if was_cancelled {
                cancelled = true;
                break;
            }
        }

        cache.invalidate(req.environment);

        let summary = summarise(&groups);
        let result = ReconcileResult {
            direction: req.direction,
            environment: req.environment.to_string(),
            label: identity.label.clone(),
            cidr: identity.cidr.clone(),
            outcome: classify(req.direction, &summary, cancelled),
            summary,
            groups,
            started_at,
            finished_at: Utc::now(),
        };
        reporter.finished(&result);
        result
    }

    async fn reconcile_group(
        &self,
        req: &ReconcileRequest<'_>,
        policy: &GroupPolicy,
        reporter: &mut dyn Reporter,
        cache: &mut ObservationCache,
        cancel: &CancellationToken,
    ) -> GroupOutcome {
        let identity = req.identity;
        let mut outcome = GroupOutcome::new(&policy.logical_name);

        let group = match cache::locate_cached(self.api, req.environment, policy, cache, cancel).await
        {
            Ok(g) => g,
            Err(e) => {
                reporter.group_error(&policy.logical_name, None, &e);
                outcome.error = Some(GroupError::from(&e));
                return outcome;
            }
        };
        outcome.provider_id = Some(group.provider_id.clone());

        let observed = locator::observe(&group, &identity.label, &policy.ports);
        for rule in observed.unexpected() {
            reporter.unexpected_port(&group.logical_name, rule);
            outcome.unexpected.push(rule.clone());
        }

        let plan = plan(req.direction, &observed, &policy.ports, identity);
        for rule in &plan.skipped {
            reporter.skipped_existing(&group.logical_name, rule);
        }
        outcome.skipped_existing = plan.skipped.clone();

        if plan.is_noop() {
            tracing::debug!(group = %group.logical_name, direction = %req.direction, "nothing to change");
            return outcome;
        }

        // Adds strictly before removes.
        if !plan.adds.is_empty() {
            reporter.intent(Direction::Allow, &group, &plan.adds);
            let call = self.api.authorize_ingress(&group.provider_id, &plan.adds);
            match with_cancel(call, cancel).await {
                Ok(()) => outcome.added = plan.adds.clone(),
                Err(e) => {
                    reporter.group_error(&group.logical_name, Some(&group.provider_id), &e);
                    outcome.error = Some(GroupError::from(&e));
                    return outcome;
                }
            }
        }

        if !plan.removes.is_empty() {
            reporter.intent(Direction::Deny, &group, &plan.removes);
            let call = self.api.revoke_ingress(&group.provider_id, &plan.removes);
            match with_cancel(call, cancel).await {
                Ok(()) => outcome.removed = plan.removes.clone(),
                Err(e) => {
                    reporter.group_error(&group.logical_name, Some(&group.provider_id), &e);
                    outcome.error = Some(GroupError::from(&e));
                }
            }
        }

        outcome
    }
}

async fn with_cancel<F>(call: F, cancel: &CancellationToken) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(OpsError::Cancelled),
        r = call => r,
    }
}

// ---------------------------------------------------------------------------
// Environment-level entry point
// ---------------------------------------------------------------------------

/// Build the policy for `env_name` and reconcile it for `identity`.
///
/// Input errors (`MissingLabel`, `UnknownEnvironment`) are returned before
/// any provider call.
#[allow(clippy::too_many_arguments)]
pub async fn reconcile_environment(
    api: &dyn SecurityGroupApi,
    config: &Config,
    env_name: &str,
    direction: Direction,
    identity: &OperatorIdentity,
    extra: &ExtraPorts,
    reporter: &mut dyn Reporter,
    cache: &mut ObservationCache,
    cancel: &CancellationToken,
) -> Result<ReconcileResult> {
    if identity.label.trim().is_empty() {
        return Err(OpsError::MissingLabel);
    }
    let policies = policy::build(config, env_name, extra)?;
    let req = ReconcileRequest {
        direction,
        environment: env_name,
        policies: &policies,
        identity,
    };
    Ok(Reconciler::new(api)
        .reconcile(&req, reporter, cache, cancel)
        .await)
}
