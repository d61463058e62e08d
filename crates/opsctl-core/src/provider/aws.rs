//! `SecurityGroupApi` backed by the `aws ec2` command line.
//!
//! Credentials and region come from the environment's named profile; the CLI
//! owns credential resolution so this crate never touches secrets.

use super::{IpPermission, Page, ProviderGroup, SecurityGroupApi, TagFilter};
use crate::config::EnvironmentConfig;
use crate::error::{OpsError, Result};
use crate::types::Rule;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone)]
pub struct AwsCli {
    binary: PathBuf,
    profile: Option<String>,
    region: Option<String>,
    page_size: u32,
    call_timeout: Duration,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeResponse {
    #[serde(default)]
    security_groups: Vec<ProviderGroup>,
    #[serde(default)]
    next_token: Option<String>,
}

#[derive(serde::Serialize)]
#[serde(rename_all = "PascalCase")]
struct FilterArg<'a> {
    name: String,
    values: &'a [String],
}

impl AwsCli {
    pub fn new(binary: PathBuf) -> Self {
        Self {
            binary,
            profile: None,
            region: None,
            page_size: DEFAULT_PAGE_SIZE,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Locate `aws` on PATH and bind it to the environment's profile/region.
    pub fn for_environment(env: &EnvironmentConfig) -> Result<Self> {
        let binary = which::which("aws").map_err(|_| OpsError::AwsCliNotInstalled)?;
        let mut cli = Self::new(binary);
        if !env.profile.trim().is_empty() {
            cli.profile = Some(env.profile.clone());
        }
        cli.region = env.region.clone();
        Ok(cli)
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec!["--output".to_string(), "json".to_string()];
        if let Some(p) = &self.profile {
            args.extend(["--profile".to_string(), p.clone()]);
        }
        if let Some(r) = &self.region {
            args.extend(["--region".to_string(), r.clone()]);
        }
        args
    }

    async fn run(&self, operation: &str, args: Vec<String>) -> Result<Vec<u8>> {
        tracing::debug!(operation, profile = ?self.profile, "aws ec2");
        let child = tokio::process::Command::new(&self.binary)
            .arg("ec2")
            .arg(operation)
            .args(&args)
            .args(self.base_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the future (timeout or cancellation) must not leave the CLI running.
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| OpsError::Transport(format!("failed to start aws: {e}")))?;

        let output = tokio::time::timeout(self.call_timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                OpsError::Transport(format!(
                    "aws ec2 {operation} timed out after {:?}",
                    self.call_timeout
                ))
            })?
            .map_err(|e| OpsError::Transport(e.to_string()))?;

        if !output.status.success() {
            return Err(classify_failure(&String::from_utf8_lossy(&output.stderr)));
        }
        Ok(output.stdout)
    }

    async fn mutate(&self, operation: &str, group_id: &str, rules: &[Rule]) -> Result<()> {
        let permissions: Vec<IpPermission> = rules.iter().map(IpPermission::for_rule).collect();
        let args = vec![
            "--group-id".to_string(),
            group_id.to_string(),
            "--ip-permissions".to_string(),
            serde_json::to_string(&permissions)?,
        ];
        self.run(operation, args).await?;
        Ok(())
    }
}

#[async_trait]
impl SecurityGroupApi for AwsCli {
    async fn describe_page(
        &self,
        filters: &[TagFilter],
        next_token: Option<&str>,
    ) -> Result<Page<ProviderGroup>> {
        let filter_args: Vec<FilterArg> = filters
            .iter()
            .map(|f| FilterArg {
                name: format!("tag:{}", f.key),
                values: &f.values,
            })
            .collect();
        let mut args = vec![
            "--filters".to_string(),
            serde_json::to_string(&filter_args)?,
            "--max-items".to_string(),
            self.page_size.to_string(),
        ];
        if let Some(token) = next_token {
            args.extend(["--starting-token".to_string(), token.to_string()]);
        }
        let stdout = self.run("describe-security-groups", args).await?;
        parse_describe(&stdout)
    }

    async fn authorize_ingress(&self, group_id: &str, rules: &[Rule]) -> Result<()> {
        self.mutate("authorize-security-group-ingress", group_id, rules)
            .await
    }

    async fn revoke_ingress(&self, group_id: &str, rules: &[Rule]) -> Result<()> {
        self.mutate("revoke-security-group-ingress", group_id, rules)
            .await
    }
}

fn parse_describe(stdout: &[u8]) -> Result<Page<ProviderGroup>> {
    let resp: DescribeResponse = serde_json::from_slice(stdout)?;
    Ok(Page {
        items: resp.security_groups,
        next_token: resp.next_token.filter(|t| !t.is_empty()),
    })
}

/// Map AWS CLI stderr onto the provider error taxonomy.
pub fn classify_failure(stderr: &str) -> OpsError {
    const AUTH: &[&str] = &[
        "UnauthorizedOperation",
        "AuthFailure",
        "InvalidClientTokenId",
        "ExpiredToken",
        "AccessDenied",
        "Unable to locate credentials",
        "The config profile",
    ];
    const THROTTLE: &[&str] = &["RequestLimitExceeded", "Throttling", "TooManyRequests"];
    const TRANSPORT: &[&str] = &[
        "Could not connect to the endpoint URL",
        "EndpointConnectionError",
        "Connect timeout",
        "Read timeout",
        "SSL validation failed",
    ];

    let message = stderr.trim().to_string();
    let has = |needles: &[&str]| needles.iter().any(|n| stderr.contains(n));
    if has(AUTH) {
        OpsError::AuthFailed(message)
    } else if has(THROTTLE) {
        OpsError::Throttled(message)
    } else if has(TRANSPORT) {
        OpsError::Transport(message)
    } else {
        OpsError::Provider(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_auth_failures() {
        let e = classify_failure(
            "An error occurred (UnauthorizedOperation) when calling the AuthorizeSecurityGroupIngress operation: You are not authorized",
        );
        assert!(matches!(e, OpsError::AuthFailed(_)));
        let e = classify_failure("The config profile (prod) could not be found\n");
        assert!(matches!(e, OpsError::AuthFailed(_)));
    }

    #[test]
    fn classifies_throttling_and_transport() {
        assert!(matches!(
            classify_failure("An error occurred (RequestLimitExceeded) when calling ..."),
            OpsError::Throttled(_)
        ));
        assert!(matches!(
            classify_failure("Could not connect to the endpoint URL: \"https://ec2.eu-west-1.amazonaws.com/\""),
            OpsError::Transport(_)
        ));
    }

    #[test]
    fn other_errors_keep_provider_message_verbatim() {
        let stderr = "An error occurred (InvalidPermission.Duplicate) when calling the AuthorizeSecurityGroupIngress operation: the specified rule already exists\n";
        match classify_failure(stderr) {
            OpsError::Provider(m) => assert_eq!(m, stderr.trim()),
            other => panic!("expected Provider, got {other:?}"),
        }
    }

    #[test]
    fn parses_paged_describe_output() {
        let page = parse_describe(
            br#"{"SecurityGroups": [{"GroupId": "sg-1", "GroupName": "a"}], "NextToken": "eyJ0b2tlbiI6IDF9"}"#,
        )
        .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.next_token.as_deref(), Some("eyJ0b2tlbiI6IDF9"));

        let last = parse_describe(br#"{"SecurityGroups": []}"#).unwrap();
        assert!(last.items.is_empty());
        assert!(last.next_token.is_none());
    }

    #[test]
    fn base_args_carry_profile_and_region() {
        let mut env = EnvironmentConfig::new("develop");
        env.profile = "dev".into();
        env.region = Some("eu-west-1".into());
        let mut cli = AwsCli::new(PathBuf::from("aws"));
        cli.profile = Some(env.profile.clone());
        cli.region = env.region.clone();
        assert_eq!(
            cli.base_args(),
            vec!["--output", "json", "--profile", "dev", "--region", "eu-west-1"]
        );
    }

    /// An executable stand-in for `aws` running `body`.
    #[cfg(unix)]
    fn fake_aws(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.path().join("aws");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hung_cli_hits_call_timeout() {
        let dir = tempfile::TempDir::new().unwrap();
        let cli = AwsCli::new(fake_aws(&dir, "sleep 10"))
            .with_call_timeout(Duration::from_millis(200));
        let err = cli
            .describe_page(&[TagFilter::new("Name", "develop - bastion")], None)
            .await
            .unwrap_err();
        match err {
            OpsError::Transport(m) => assert!(m.contains("timed out after 200ms"), "{m}"),
            other => panic!("expected Transport, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_cli_stderr_is_classified() {
        let dir = tempfile::TempDir::new().unwrap();
        let cli = AwsCli::new(fake_aws(
            &dir,
            "echo 'An error occurred (UnauthorizedOperation) when calling the RevokeSecurityGroupIngress operation' >&2; exit 254",
        ));
        let err = cli.revoke_ingress("sg-1", &[]).await.unwrap_err();
        assert!(matches!(err, OpsError::AuthFailed(_)), "{err:?}");
    }
}
