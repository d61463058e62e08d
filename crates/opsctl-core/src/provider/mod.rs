//! The cloud provider's security-group API, as seen by the reconciler.
//!
//! Shapes mirror the EC2 `DescribeSecurityGroups` JSON so that the AWS CLI
//! backend can deserialise responses directly.

use crate::error::Result;
use crate::types::Rule;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod aws;
pub mod memory;

pub use aws::AwsCli;
pub use memory::MemoryProvider;

pub const PROTOCOL_TCP: &str = "tcp";

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Tag {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IpRange {
    pub cidr_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IpPermission {
    pub ip_protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_port: Option<i32>,
    #[serde(default)]
    pub ip_ranges: Vec<IpRange>,
}

impl IpPermission {
    /// The single-port TCP permission authoring `rule`.
    pub fn for_rule(rule: &Rule) -> Self {
        Self {
            ip_protocol: PROTOCOL_TCP.to_string(),
            from_port: Some(i32::from(rule.port)),
            to_port: Some(i32::from(rule.port)),
            ip_ranges: vec![IpRange {
                cidr_ip: rule.cidr.to_string(),
                description: Some(rule.label.clone()),
            }],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProviderGroup {
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub group_name: String,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default, rename = "IpPermissions")]
    pub ingress: Vec<IpPermission>,
}

impl ProviderGroup {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.value.as_str())
    }
}

/// A `tag:<key>` filter matching any of `values`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagFilter {
    pub key: String,
    pub values: Vec<String>,
}

impl TagFilter {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            values: vec![value.into()],
        }
    }

    pub fn matches(&self, group: &ProviderGroup) -> bool {
        group
            .tag(&self.key)
            .is_some_and(|v| self.values.iter().any(|want| want == v))
    }
}

/// One page of a paginated listing.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_token: Option<String>,
}

// ---------------------------------------------------------------------------
// SecurityGroupApi
// ---------------------------------------------------------------------------

#[async_trait]
pub trait SecurityGroupApi: Send + Sync {
    /// Fetch one page of groups matching every filter.
    async fn describe_page(
        &self,
        filters: &[TagFilter],
        next_token: Option<&str>,
    ) -> Result<Page<ProviderGroup>>;

    /// Add all `rules` to `group_id` in a single call.
    async fn authorize_ingress(&self, group_id: &str, rules: &[Rule]) -> Result<()>;

    /// Remove all `rules` from `group_id` in a single call.
    async fn revoke_ingress(&self, group_id: &str, rules: &[Rule]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialises_describe_output() {
        let json = r#"{
            "GroupId": "sg-0abc",
            "GroupName": "develop-bastion",
            "Tags": [{"Key": "Name", "Value": "develop - bastion"}, {"Key": "Environment", "Value": "develop"}],
            "IpPermissions": [
                {"IpProtocol": "tcp", "FromPort": 22, "ToPort": 22,
                 "IpRanges": [{"CidrIp": "203.0.113.7/32", "Description": "alice"}],
                 "Ipv6Ranges": [], "PrefixListIds": [], "UserIdGroupPairs": []},
                {"IpProtocol": "-1", "IpRanges": [{"CidrIp": "10.0.0.0/8"}]}
            ]
        }"#;
        let g: ProviderGroup = serde_json::from_str(json).unwrap();
        assert_eq!(g.group_id.as_deref(), Some("sg-0abc"));
        assert_eq!(g.tag("Environment"), Some("develop"));
        assert_eq!(g.ingress.len(), 2);
        assert_eq!(g.ingress[0].from_port, Some(22));
        assert_eq!(g.ingress[1].from_port, None);
        assert_eq!(g.ingress[1].ip_ranges[0].description, None);
    }

    #[test]
    fn permission_for_rule_is_single_port_tcp() {
        let rule = Rule::new(
            443,
            crate::identity::Cidr::parse("203.0.113.7").unwrap(),
            "alice",
        );
        let json = serde_json::to_value(IpPermission::for_rule(&rule)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "IpProtocol": "tcp",
                "FromPort": 443,
                "ToPort": 443,
                "IpRanges": [{"CidrIp": "203.0.113.7/32", "Description": "alice"}]
            })
        );
    }
}
