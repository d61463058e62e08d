//! In-process `SecurityGroupApi` with EC2-like semantics.
//!
//! Used by the test suite and by embedders that want to dry-run a reconcile.
//! Authorize/revoke are atomic per call: a duplicate or missing permission
//! fails the whole batch, as EC2 does.

use super::{IpPermission, IpRange, Page, ProviderGroup, SecurityGroupApi, Tag, TagFilter};
use crate::error::{OpsError, Result};
use crate::types::Rule;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

/// A recorded API call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Describe { filters: Vec<TagFilter> },
    Authorize { group_id: String, rules: Vec<Rule> },
    Revoke { group_id: String, rules: Vec<Rule> },
}

/// Builds the error an injected fault returns; called once per failing call.
pub type Fault = fn() -> OpsError;

#[derive(Default)]
struct MemoryState {
    groups: Vec<ProviderGroup>,
    describe_faults: HashMap<String, Fault>,
    mutation_faults: HashMap<String, Fault>,
    stalled: HashSet<String>,
    calls: Vec<Call>,
}

pub struct MemoryProvider {
    state: Mutex<MemoryState>,
    page_size: usize,
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            page_size: 2,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -----------------------------------------------------------------------
    // Seeding
    // -----------------------------------------------------------------------

    /// Add a group tagged `Name = name` (and `Environment = env` when given).
    pub fn add_group(&self, group_id: Option<&str>, name: &str, env: Option<&str>) {
        let mut tags = vec![Tag {
            key: "Name".to_string(),
            value: name.to_string(),
        }];
        if let Some(env) = env {
            tags.push(Tag {
                key: "Environment".to_string(),
                value: env.to_string(),
            });
        }
        self.lock().groups.push(ProviderGroup {
            group_id: group_id.map(str::to_string),
            group_name: name.replace(' ', ""),
            tags,
            ingress: Vec::new(),
        });
    }

    /// Add a raw ingress permission, bypassing duplicate checks.
    pub fn add_permission(&self, group_id: &str, permission: IpPermission) {
        let mut state = self.lock();
        if let Some(group) = find_group(&mut state.groups, group_id) {
            group.ingress.push(permission);
        }
    }

    /// Convenience for seeding a TCP range rule with a description.
    pub fn add_rule(&self, group_id: &str, from: u16, to: u16, cidr: &str, description: &str) {
        self.add_permission(
            group_id,
            IpPermission {
                ip_protocol: super::PROTOCOL_TCP.to_string(),
                from_port: Some(i32::from(from)),
                to_port: Some(i32::from(to)),
                ip_ranges: vec![IpRange {
                    cidr_ip: cidr.to_string(),
                    description: Some(description.to_string()),
                }],
            },
        );
    }

    // -----------------------------------------------------------------------
    // Fault injection
    // -----------------------------------------------------------------------

    /// Fail every describe whose `Name` filter equals `name`.
    pub fn fail_describe(&self, name: &str, error: Fault) {
        self.lock().describe_faults.insert(name.to_string(), error);
    }

    /// Fail every authorize/revoke against `group_id`.
    pub fn fail_mutations(&self, group_id: &str, error: Fault) {
        self.lock()
            .mutation_faults
            .insert(group_id.to_string(), error);
    }

    /// Make authorize/revoke against `group_id` never complete.
    pub fn stall_mutations(&self, group_id: &str) {
        self.lock().stalled.insert(group_id.to_string());
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub fn group(&self, group_id: &str) -> Option<ProviderGroup> {
        self.lock()
            .groups
            .iter()
            .find(|g| g.group_id.as_deref() == Some(group_id))
            .cloned()
    }

    /// Every `(group_id, port_from, port_to, cidr, description)` currently present,
    /// sorted. Useful for before/after comparisons.
    pub fn snapshot(&self) -> Vec<(String, i32, i32, String, Option<String>)> {
        let state = self.lock();
        let mut out = Vec::new();
        for g in &state.groups {
            let id = g.group_id.clone().unwrap_or_default();
            for p in &g.ingress {
                for r in &p.ip_ranges {
                    out.push((
                        id.clone(),
                        p.from_port.unwrap_or(-1),
                        p.to_port.unwrap_or(-1),
                        r.cidr_ip.clone(),
                        r.description.clone(),
                    ));
                }
            }
        }
        out.sort();
        out
    }

    /// Snapshot restricted to rules described exactly `label`.
    pub fn snapshot_for(&self, label: &str) -> Vec<(String, i32, i32, String, Option<String>)> {
        self.snapshot()
            .into_iter()
            .filter(|r| r.4.as_deref() == Some(label))
            .collect()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn mutation_calls(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| !matches!(c, Call::Describe { .. }))
            .count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    async fn stall_if_requested(&self, group_id: &str) {
        let stalled = self.lock().stalled.contains(group_id);
        if stalled {
            std::future::pending::<()>().await;
        }
    }
}

fn find_group<'a>(groups: &'a mut [ProviderGroup], group_id: &str) -> Option<&'a mut ProviderGroup> {
    groups
        .iter_mut()
        .find(|g| g.group_id.as_deref() == Some(group_id))
}

fn is_single_port(p: &IpPermission, port: u16) -> bool {
    p.ip_protocol == super::PROTOCOL_TCP
        && p.from_port == Some(i32::from(port))
        && p.to_port == Some(i32::from(port))
}

fn has_range(group: &ProviderGroup, rule: &Rule) -> bool {
    group
        .ingress
        .iter()
        .filter(|p| is_single_port(p, rule.port))
        .flat_map(|p| &p.ip_ranges)
        .any(|r| r.cidr_ip == rule.cidr.as_str())
}

#[async_trait]
impl SecurityGroupApi for MemoryProvider {
    async fn describe_page(
        &self,
        filters: &[TagFilter],
        next_token: Option<&str>,
    ) -> Result<Page<ProviderGroup>> {
        let mut state = self.lock();
        state.calls.push(Call::Describe {
            filters: filters.to_vec(),
        });
        for f in filters.iter().filter(|f| f.key == "Name") {
            for v in &f.values {
                if let Some(e) = state.describe_faults.get(v) {
                    return Err(e());
                }
            }
        }

        let matching: Vec<ProviderGroup> = state
            .groups
            .iter()
            .filter(|g| filters.iter().all(|f| f.matches(g)))
            .cloned()
            .collect();

        let start: usize = match next_token {
            Some(t) => t
                .parse()
                .map_err(|_| OpsError::Provider(format!("invalid pagination token '{t}'")))?,
            None => 0,
        };
        let end = (start + self.page_size).min(matching.len());
        let items = matching.get(start..end).map(<[_]>::to_vec).unwrap_or_default();
        let next_token = (end < matching.len()).then(|| end.to_string());
        Ok(Page { items, next_token })
    }

    async fn authorize_ingress(&self, group_id: &str, rules: &[Rule]) -> Result<()> {
        self.stall_if_requested(group_id).await;
        let mut state = self.lock();
        state.calls.push(Call::Authorize {
            group_id: group_id.to_string(),
            rules: rules.to_vec(),
        });
        if let Some(e) = state.mutation_faults.get(group_id) {
            return Err(e());
        }
        let group = find_group(&mut state.groups, group_id).ok_or_else(|| {
            OpsError::Provider(format!("InvalidGroup.NotFound: {group_id}"))
        })?;

        let mut batch = HashSet::new();
        for rule in rules {
            if has_range(group, rule) || !batch.insert((rule.port, rule.cidr.clone())) {
                return Err(OpsError::Provider(format!(
                    "InvalidPermission.Duplicate: {rule} already exists in {group_id}"
                )));
            }
        }

        for rule in rules {
            let range = IpRange {
                cidr_ip: rule.cidr.to_string(),
                description: Some(rule.label.clone()),
            };
            match group
                .ingress
                .iter_mut()
                .find(|p| is_single_port(p, rule.port))
            {
                Some(p) => p.ip_ranges.push(range),
                None => {
                    let mut p = IpPermission::for_rule(rule);
                    p.ip_ranges = vec![range];
                    group.ingress.push(p);
                }
            }
        }
        Ok(())
    }

    async fn revoke_ingress(&self, group_id: &str, rules: &[Rule]) -> Result<()> {
        self.stall_if_requested(group_id).await;
        let mut state = self.lock();
        state.calls.push(Call::Revoke {
            group_id: group_id.to_string(),
            rules: rules.to_vec(),
        });
        if let Some(e) = state.mutation_faults.get(group_id) {
            return Err(e());
        }
        let group = find_group(&mut state.groups, group_id).ok_or_else(|| {
            OpsError::Provider(format!("InvalidGroup.NotFound: {group_id}"))
        })?;

        if let Some(missing) = rules.iter().find(|r| !has_range(group, r)) {
            return Err(OpsError::Provider(format!(
                "InvalidPermission.NotFound: {missing} not present in {group_id}"
            )));
        }

        for rule in rules {
            for p in group
                .ingress
                .iter_mut()
                .filter(|p| is_single_port(p, rule.port))
            {
                p.ip_ranges.retain(|r| r.cidr_ip != rule.cidr.as_str());
            }
        }
        group.ingress.retain(|p| !p.ip_ranges.is_empty());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Cidr;

    fn rule(port: u16, cidr: &str, label: &str) -> Rule {
        Rule::new(port, Cidr::parse(cidr).unwrap(), label)
    }

    #[tokio::test]
    async fn describe_paginates_filtered_groups() {
        let p = MemoryProvider::new().with_page_size(1);
        p.add_group(Some("sg-1"), "develop - bastion", Some("develop"));
        p.add_group(Some("sg-2"), "develop - bastion", Some("develop"));
        p.add_group(Some("sg-3"), "develop - bastion", Some("staging"));
        let filters = vec![
            TagFilter::new("Name", "develop - bastion"),
            TagFilter::new("Environment", "develop"),
        ];
        let first = p.describe_page(&filters, None).await.unwrap();
        assert_eq!(first.items.len(), 1);
        let token = first.next_token.expect("second page");
        let second = p.describe_page(&filters, Some(&token)).await.unwrap();
        assert_eq!(second.items.len(), 1);
        assert!(second.next_token.is_none());
    }

    #[tokio::test]
    async fn authorize_is_atomic_on_duplicate() {
        let p = MemoryProvider::new();
        p.add_group(Some("sg-1"), "g", None);
        p.authorize_ingress("sg-1", &[rule(22, "203.0.113.7", "alice")])
            .await
            .unwrap();
        let err = p
            .authorize_ingress(
                "sg-1",
                &[rule(443, "203.0.113.7", "alice"), rule(22, "203.0.113.7", "alice")],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OpsError::Provider(m) if m.contains("Duplicate")));
        assert_eq!(p.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn revoke_removes_only_named_ranges() {
        let p = MemoryProvider::new();
        p.add_group(Some("sg-1"), "g", None);
        p.authorize_ingress(
            "sg-1",
            &[rule(22, "203.0.113.7", "alice"), rule(22, "198.51.100.1", "bob")],
        )
        .await
        .unwrap();
        p.revoke_ingress("sg-1", &[rule(22, "203.0.113.7", "alice")])
            .await
            .unwrap();
        assert!(p.snapshot_for("alice").is_empty());
        assert_eq!(p.snapshot_for("bob").len(), 1);
    }

    #[tokio::test]
    async fn injected_faults_are_returned() {
        let p = MemoryProvider::new();
        p.add_group(Some("sg-1"), "g", None);
        p.fail_mutations("sg-1", || OpsError::AuthFailed("denied".into()));
        let err = p
            .authorize_ingress("sg-1", &[rule(22, "203.0.113.7", "alice")])
            .await
            .unwrap_err();
        assert!(matches!(err, OpsError::AuthFailed(_)));
        assert_eq!(p.mutation_calls(), 1);
    }

    #[tokio::test]
    async fn faults_repeat_on_every_call() {
        let p = MemoryProvider::new();
        p.add_group(Some("sg-1"), "g", None);
        p.fail_describe("g", || OpsError::Throttled("RequestLimitExceeded".into()));
        for _ in 0..2 {
            let err = p
                .describe_page(&[TagFilter::new("Name", "g")], None)
                .await
                .unwrap_err();
            assert!(matches!(err, OpsError::Throttled(m) if m == "RequestLimitExceeded"));
        }
    }
}
