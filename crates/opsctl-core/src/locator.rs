//! Resolve logical group names to provider groups and read their rules.

use crate::error::{OpsError, Result};
use crate::identity::Cidr;
use crate::policy::{GroupPolicy, PortSet};
use crate::provider::{ProviderGroup, SecurityGroupApi, TagFilter, PROTOCOL_TCP};
use crate::types::Rule;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub const NAME_TAG: &str = "Name";
pub const ENVIRONMENT_TAG: &str = "Environment";

// ---------------------------------------------------------------------------
// SecurityGroup / ObservedState
// ---------------------------------------------------------------------------

/// A located provider group: logical name, provider ID and its raw ingress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityGroup {
    pub logical_name: String,
    pub provider_id: String,
    pub raw: ProviderGroup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedRule {
    pub rule: Rule,
    /// Port outside the policy's PortSet. Reported, never pruned by Allow.
    pub unexpected: bool,
}

/// Rules in one group owned by the active label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedState {
    pub rules: Vec<ObservedRule>,
}

impl ObservedState {
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn unexpected(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(|r| r.unexpected).map(|r| &r.rule)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().map(|r| &r.rule)
    }
}

// ---------------------------------------------------------------------------
// locate
// ---------------------------------------------------------------------------

pub fn filters_for(policy: &GroupPolicy) -> Vec<TagFilter> {
    let mut filters = vec![TagFilter::new(NAME_TAG, &policy.logical_name)];
    if let Some(env) = &policy.environment_filter {
        filters.push(TagFilter::new(ENVIRONMENT_TAG, env));
    }
    filters
}

/// Drain every page of a describe call. The diff must see the full set.
pub async fn describe_all(
    api: &dyn SecurityGroupApi,
    filters: &[TagFilter],
    cancel: &CancellationToken,
) -> Result<Vec<ProviderGroup>> {
    let mut groups = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let page = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(OpsError::Cancelled),
            page = api.describe_page(filters, token.as_deref()) => page?,
        };
        groups.extend(page.items);
        match page.next_token {
            Some(next) => token = Some(next),
            None => return Ok(groups),
        }
    }
}

/// Find exactly one provider group for `policy`.
pub async fn locate(
    api: &dyn SecurityGroupApi,
    policy: &GroupPolicy,
    cancel: &CancellationToken,
) -> Result<SecurityGroup> {
    let mut matches = describe_all(api, &filters_for(policy), cancel).await?;
    match matches.len() {
        0 => Err(OpsError::GroupNotFound(policy.logical_name.clone())),
        1 => {
            let raw = matches.remove(0);
            let provider_id = raw
                .group_id
                .clone()
                .filter(|id| !id.trim().is_empty())
                .ok_or_else(|| OpsError::GroupMalformed(policy.logical_name.clone()))?;
            tracing::debug!(group = %policy.logical_name, group_id = %provider_id, "located security group");
            Ok(SecurityGroup {
                logical_name: policy.logical_name.clone(),
                provider_id,
                raw,
            })
        }
        count => Err(OpsError::GroupAmbiguous {
            name: policy.logical_name.clone(),
            count,
        }),
    }
}

// ---------------------------------------------------------------------------
// observe
// ---------------------------------------------------------------------------

/// Single-port TCP rules in `group` whose description is exactly `label`.
///
/// Port ranges, non-TCP permissions, and rules owned by other labels are
/// invisible. Ranges whose CIDR does not parse are skipped with a warning.
pub fn observe(group: &SecurityGroup, label: &str, ports: &PortSet) -> ObservedState {
    let mut rules: Vec<ObservedRule> = Vec::new();
    for perm in &group.raw.ingress {
        if perm.ip_protocol != PROTOCOL_TCP {
            continue;
        }
        let (Some(from), Some(to)) = (perm.from_port, perm.to_port) else {
            continue;
        };
        if from != to {
            continue;
        }
        let Ok(port) = u16::try_from(from) else {
            continue;
        };
        for range in &perm.ip_ranges {
            if range.description.as_deref() != Some(label) {
                continue;
            }
            let cidr = match Cidr::parse(&range.cidr_ip) {
                Ok(c) => c,
                Err(_) => {
                    tracing::warn!(group = %group.logical_name, cidr = %range.cidr_ip, label, "skipping rule with unparseable CIDR");
                    continue;
                }
            };
            let rule = Rule::new(port, cidr, label);
            if rules.iter().any(|r| r.rule == rule) {
                continue;
            }
            rules.push(ObservedRule {
                unexpected: !ports.contains(port),
                rule,
            });
        }
    }
    rules.sort_by(|a, b| a.rule.cmp(&b.rule));
    ObservedState { rules }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{IpPermission, IpRange, MemoryProvider};
    use crate::policy::Role;

    fn policy(name: &str, env: Option<&str>, ports: &[u16]) -> GroupPolicy {
        GroupPolicy {
            logical_name: name.to_string(),
            role: Role::Bastion,
            ports: ports.iter().copied().collect(),
            environment_filter: env.map(str::to_string),
        }
    }

    fn group_with(ingress: Vec<IpPermission>) -> SecurityGroup {
        SecurityGroup {
            logical_name: "develop - bastion".into(),
            provider_id: "sg-1".into(),
            raw: ProviderGroup {
                group_id: Some("sg-1".into()),
                group_name: "bastion".into(),
                tags: vec![],
                ingress,
            },
        }
    }

    fn perm(proto: &str, from: Option<i32>, to: Option<i32>, ranges: &[(&str, Option<&str>)]) -> IpPermission {
        IpPermission {
            ip_protocol: proto.into(),
            from_port: from,
            to_port: to,
            ip_ranges: ranges
                .iter()
                .map(|(c, d)| IpRange {
                    cidr_ip: c.to_string(),
                    description: d.map(str::to_string),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn locate_single_match() {
        let p = MemoryProvider::new();
        p.add_group(Some("sg-1"), "develop - bastion", Some("develop"));
        p.add_group(Some("sg-2"), "develop - bastion", Some("staging"));
        let g = locate(&p, &policy("develop - bastion", Some("develop"), &[22]), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(g.provider_id, "sg-1");
    }

    #[tokio::test]
    async fn locate_zero_matches_is_not_found() {
        let p = MemoryProvider::new();
        let err = locate(&p, &policy("develop - bastion", Some("develop"), &[22]), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OpsError::GroupNotFound(n) if n == "develop - bastion"));
    }

    #[tokio::test]
    async fn locate_sees_matches_across_pages() {
        let p = MemoryProvider::new().with_page_size(1);
        p.add_group(Some("sg-1"), "develop - web elb", Some("develop"));
        p.add_group(Some("sg-2"), "develop - web elb", Some("develop"));
        p.add_group(Some("sg-3"), "develop - web elb", Some("develop"));
        let err = locate(&p, &policy("develop - web elb", Some("develop"), &[80]), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OpsError::GroupAmbiguous { count: 3, .. }));
    }

    #[tokio::test]
    async fn locate_missing_id_is_malformed() {
        let p = MemoryProvider::new();
        p.add_group(None, "build-web", None);
        let err = locate(&p, &policy("build-web", None, &[22]), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OpsError::GroupMalformed(_)));
    }

    #[tokio::test]
    async fn locate_without_environment_filter_ignores_env_tag() {
        let p = MemoryProvider::new();
        p.add_group(Some("sg-9"), "build-worker", Some("whatever"));
        let g = locate(&p, &policy("build-worker", None, &[22]), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(g.provider_id, "sg-9");
        let filters = match &p.calls()[0] {
            crate::provider::memory::Call::Describe { filters } => filters.clone(),
            other => panic!("unexpected call {other:?}"),
        };
        assert_eq!(filters, vec![TagFilter::new("Name", "build-worker")]);
    }

    #[tokio::test]
    async fn locate_honours_cancellation() {
        let p = MemoryProvider::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        p.add_group(Some("sg-1"), "develop - bastion", Some("develop"));
        let err = locate(&p, &policy("develop - bastion", Some("develop"), &[22]), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, OpsError::Cancelled));
        assert!(p.calls().is_empty());
    }

    #[test]
    fn observe_filters_protocol_range_and_label() {
        let g = group_with(vec![
            perm("tcp", Some(22), Some(22), &[("203.0.113.7/32", Some("alice")), ("198.51.100.1/32", Some("bob"))]),
            perm("tcp", Some(1000), Some(2000), &[("203.0.113.7/32", Some("alice"))]),
            perm("udp", Some(53), Some(53), &[("203.0.113.7/32", Some("alice"))]),
            perm("-1", None, None, &[("203.0.113.7/32", Some("alice"))]),
            perm("tcp", Some(443), Some(443), &[("203.0.113.7/32", Some("Alice")), ("203.0.113.7/32", None)]),
        ]);
        let observed = observe(&g, "alice", &[22, 443].into_iter().collect());
        let rules: Vec<_> = observed.iter().cloned().collect();
        assert_eq!(
            rules,
            vec![Rule::new(22, Cidr::parse("203.0.113.7").unwrap(), "alice")]
        );
        assert_eq!(observed.unexpected().count(), 0);
    }

    #[test]
    fn observe_marks_out_of_policy_ports_unexpected() {
        let g = group_with(vec![
            perm("tcp", Some(22), Some(22), &[("203.0.113.7/32", Some("alice"))]),
            perm("tcp", Some(8080), Some(8080), &[("203.0.113.9/32", Some("alice"))]),
        ]);
        let observed = observe(&g, "alice", &[22, 443].into_iter().collect());
        let unexpected: Vec<_> = observed.unexpected().map(|r| r.port).collect();
        assert_eq!(unexpected, vec![8080]);
        assert_eq!(observed.rules.len(), 2);
    }

    #[test]
    fn observe_normalises_bare_provider_cidrs() {
        let g = group_with(vec![perm("tcp", Some(22), Some(22), &[("203.0.113.7", Some("alice"))])]);
        let observed = observe(&g, "alice", &[22].into_iter().collect());
        assert_eq!(observed.rules[0].rule.cidr.as_str(), "203.0.113.7/32");
    }
}
