//! Operator identity: who owns a rule (label) and where they connect from (CIDR).

use crate::error::{ErrorKind, OpsError, Result};
use crate::types::Direction;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;

/// Environment variable consulted when no CIDR is given explicitly.
pub const IP_ENV_VAR: &str = "OPSCTL_IP_ADDRESS";

/// Public-IP echo service used as the last resort.
pub const PUBLIC_IP_URL: &str = "https://checkip.amazonaws.com";

pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Cidr
// ---------------------------------------------------------------------------

fn cidr_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{1,3}(\.\d{1,3}){3}(/\d{1,2})?$").expect("valid regex"))
}

/// An IPv4 block in `a.b.c.d/n` form. A bare address is stored as `/32`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cidr(String);

impl Cidr {
    pub fn parse(raw: &str) -> Result<Self> {
        let s = raw.trim();
        if !cidr_re().is_match(s) {
            return Err(OpsError::InvalidIp(raw.to_string()));
        }
        let (addr, mask) = match s.split_once('/') {
            Some((a, m)) => (a, m),
            None => (s, "32"),
        };
        let invalid = || OpsError::InvalidIp(raw.to_string());
        let octets = addr
            .split('.')
            .map(|o| o.parse::<u8>().map_err(|_| invalid()))
            .collect::<Result<Vec<u8>>>()?;
        let mask: u8 = mask.parse().map_err(|_| invalid())?;
        if mask > 32 {
            return Err(invalid());
        }
        // Canonical form: no leading zeros, so "010.0.0.1" and "10.0.0.1" compare equal.
        Ok(Cidr(format!(
            "{}.{}.{}.{}/{mask}",
            octets[0], octets[1], octets[2], octets[3]
        )))
    }

    /// Placeholder recorded when a deny proceeds without a resolved address.
    pub fn unresolved() -> Self {
        Cidr("0.0.0.0/32".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Cidr {
    type Err = OpsError;
    fn from_str(s: &str) -> Result<Self> {
        Cidr::parse(s)
    }
}

impl TryFrom<String> for Cidr {
    type Error = OpsError;
    fn try_from(s: String) -> Result<Self> {
        Cidr::parse(&s)
    }
}

impl From<Cidr> for String {
    fn from(c: Cidr) -> Self {
        c.0
    }
}

// ---------------------------------------------------------------------------
// OperatorIdentity
// ---------------------------------------------------------------------------

/// Where the operator CIDR came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpSource {
    Flag,
    Config,
    Environment,
    Lookup,
    /// Lookup failed during a deny; the CIDR is [`Cidr::unresolved`].
    Unresolved,
}

impl std::fmt::Display for IpSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IpSource::Flag => "flag",
            IpSource::Config => "config",
            IpSource::Environment => IP_ENV_VAR,
            IpSource::Lookup => "lookup",
            IpSource::Unresolved => "unresolved",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorIdentity {
    pub label: String,
    pub cidr: Cidr,
    pub source: IpSource,
}

impl OperatorIdentity {
    pub fn new(label: impl Into<String>, cidr: Cidr) -> Result<Self> {
        let label = label.into();
        if label.trim().is_empty() {
            return Err(OpsError::MissingLabel);
        }
        Ok(Self {
            label,
            cidr,
            source: IpSource::Flag,
        })
    }
}

// ---------------------------------------------------------------------------
// Public IP lookup
// ---------------------------------------------------------------------------

#[async_trait]
pub trait PublicIpLookup: Send + Sync {
    /// Return the caller's public address as reported by an external service.
    async fn lookup(&self) -> Result<String>;
}

pub struct HttpIpLookup {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpIpLookup {
    pub fn new() -> Self {
        Self::with_url(PUBLIC_IP_URL)
    }

    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            timeout: LOOKUP_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for HttpIpLookup {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PublicIpLookup for HttpIpLookup {
    async fn lookup(&self) -> Result<String> {
        tracing::debug!(url = %self.url, "looking up public IP");
        let resp = self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    OpsError::LookupTimeout(self.timeout)
                } else {
                    OpsError::Lookup(e.to_string())
                }
            })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(OpsError::LookupStatus(status.as_u16()));
        }
        resp.text().await.map_err(|e| {
            if e.is_timeout() {
                OpsError::LookupTimeout(self.timeout)
            } else {
                OpsError::Lookup(e.to_string())
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct IdentityRequest<'a> {
    pub label: &'a str,
    /// `--ip` flag.
    pub explicit_ip: Option<&'a str>,
    /// `ipAddress` from config.
    pub configured_ip: Option<&'a str>,
}

/// Resolve the operator identity: `--ip`, then config `ipAddress`, then
/// `OPSCTL_IP_ADDRESS`, then the public-IP lookup.
pub async fn resolve(
    req: &IdentityRequest<'_>,
    lookup: &dyn PublicIpLookup,
) -> Result<OperatorIdentity> {
    let from_env = std::env::var(IP_ENV_VAR).ok();
    resolve_with_env(req, from_env.as_deref(), lookup).await
}

pub async fn resolve_with_env(
    req: &IdentityRequest<'_>,
    env_ip: Option<&str>,
    lookup: &dyn PublicIpLookup,
) -> Result<OperatorIdentity> {
    if req.label.trim().is_empty() {
        return Err(OpsError::MissingLabel);
    }

    let non_empty = |s: &Option<&str>| s.filter(|v| !v.trim().is_empty()).map(str::to_string);

    let (raw, source) = if let Some(ip) = non_empty(&req.explicit_ip) {
        (ip, IpSource::Flag)
    } else if let Some(ip) = non_empty(&req.configured_ip) {
        (ip, IpSource::Config)
    } else if let Some(ip) = non_empty(&env_ip) {
        (ip, IpSource::Environment)
    } else {
        (lookup.lookup().await?, IpSource::Lookup)
    };

    let cidr = Cidr::parse(&raw)?;
    tracing::debug!(label = req.label, cidr = %cidr, source = %source, "resolved operator identity");
    Ok(OperatorIdentity {
        label: req.label.to_string(),
        cidr,
        source,
    })
}

/// Like [`resolve`], but a deny survives a failed public-IP lookup: it never
/// writes the CIDR, so the operator can still revoke their rules offline.
pub async fn resolve_for(
    direction: Direction,
    req: &IdentityRequest<'_>,
    lookup: &dyn PublicIpLookup,
) -> Result<OperatorIdentity> {
    let from_env = std::env::var(IP_ENV_VAR).ok();
    resolve_for_with_env(direction, req, from_env.as_deref(), lookup).await
}

pub async fn resolve_for_with_env(
    direction: Direction,
    req: &IdentityRequest<'_>,
    env_ip: Option<&str>,
    lookup: &dyn PublicIpLookup,
) -> Result<OperatorIdentity> {
    match resolve_with_env(req, env_ip, lookup).await {
        Err(e) if direction == Direction::Deny && e.kind() == ErrorKind::Lookup => {
            tracing::warn!(error = %e, "public IP lookup failed; deny continues without an address");
            Ok(OperatorIdentity {
                label: req.label.to_string(),
                cidr: Cidr::unresolved(),
                source: IpSource::Unresolved,
            })
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedLookup {
        answer: &'static str,
        calls: AtomicUsize,
    }

    impl FixedLookup {
        fn new(answer: &'static str) -> Self {
            Self {
                answer,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PublicIpLookup for FixedLookup {
        async fn lookup(&self) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.answer.to_string())
        }
    }

    #[test]
    fn bare_address_normalises_to_slash_32() {
        let c = Cidr::parse("203.0.113.7").unwrap();
        assert_eq!(c.as_str(), "203.0.113.7/32");
        assert_eq!(c, Cidr::parse("203.0.113.7/32").unwrap());
    }

    #[test]
    fn keeps_explicit_mask() {
        assert_eq!(Cidr::parse("10.1.0.0/16").unwrap().as_str(), "10.1.0.0/16");
    }

    #[test]
    fn strips_leading_zeros() {
        assert_eq!(Cidr::parse("010.0.0.01").unwrap().as_str(), "10.0.0.1/32");
    }

    #[test]
    fn trims_trailing_newline() {
        assert_eq!(
            Cidr::parse("203.0.113.7\n").unwrap().as_str(),
            "203.0.113.7/32"
        );
    }

    #[test]
    fn rejects_malformed_shapes() {
        for bad in [
            "",
            "localhost",
            "1.2.3",
            "1.2.3.4/",
            "1.2.3.4/123",
            "1.2.3.4.5",
            "2001:db8::1",
            "256.1.1.1",
            "1.2.3.4/33",
        ] {
            assert!(
                matches!(Cidr::parse(bad), Err(OpsError::InvalidIp(_))),
                "expected InvalidIp for {bad:?}"
            );
        }
    }

    #[test]
    fn serde_round_trips_through_string() {
        let c: Cidr = serde_json::from_str("\"198.51.100.2\"").unwrap();
        assert_eq!(serde_json::to_string(&c).unwrap(), "\"198.51.100.2/32\"");
        assert!(serde_json::from_str::<Cidr>("\"nope\"").is_err());
    }

    struct DownLookup;

    #[async_trait]
    impl PublicIpLookup for DownLookup {
        async fn lookup(&self) -> Result<String> {
            Err(OpsError::LookupTimeout(LOOKUP_TIMEOUT))
        }
    }

    #[tokio::test]
    async fn explicit_ip_wins_without_lookup() {
        let lookup = FixedLookup::new("198.51.100.1");
        let req = IdentityRequest {
            label: "alice",
            explicit_ip: Some("203.0.113.7"),
            configured_ip: Some("192.0.2.1"),
        };
        let id = resolve_with_env(&req, Some("192.0.2.2"), &lookup)
            .await
            .unwrap();
        assert_eq!(id.cidr.as_str(), "203.0.113.7/32");
        assert_eq!(id.source, IpSource::Flag);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn env_var_used_before_lookup() {
        let lookup = FixedLookup::new("198.51.100.1");
        let req = IdentityRequest {
            label: "alice",
            ..Default::default()
        };
        let id = resolve_with_env(&req, Some("192.0.2.2"), &lookup)
            .await
            .unwrap();
        assert_eq!(id.cidr.as_str(), "192.0.2.2/32");
        assert_eq!(id.source, IpSource::Environment);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn falls_back_to_lookup() {
        let lookup = FixedLookup::new("198.51.100.1\n");
        let req = IdentityRequest {
            label: "alice",
            ..Default::default()
        };
        let id = resolve_with_env(&req, None, &lookup).await.unwrap();
        assert_eq!(id.cidr.as_str(), "198.51.100.1/32");
        assert_eq!(id.source, IpSource::Lookup);
    }

    #[tokio::test]
    async fn empty_label_fails_before_lookup() {
        let lookup = FixedLookup::new("198.51.100.1");
        let req = IdentityRequest {
            label: "  ",
            ..Default::default()
        };
        let err = resolve_with_env(&req, None, &lookup).await.unwrap_err();
        assert!(matches!(err, OpsError::MissingLabel));
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_lookup_answer_is_invalid_ip() {
        let lookup = FixedLookup::new("<html>oops</html>");
        let req = IdentityRequest {
            label: "alice",
            ..Default::default()
        };
        let err = resolve_with_env(&req, None, &lookup).await.unwrap_err();
        assert!(matches!(err, OpsError::InvalidIp(_)));
    }

    #[tokio::test]
    async fn deny_survives_failed_lookup() {
        let req = IdentityRequest {
            label: "alice",
            ..Default::default()
        };
        let id = resolve_for_with_env(Direction::Deny, &req, None, &DownLookup)
            .await
            .unwrap();
        assert_eq!(id.label, "alice");
        assert_eq!(id.cidr, Cidr::unresolved());
        assert_eq!(id.source, IpSource::Unresolved);
    }

    #[tokio::test]
    async fn allow_fails_on_failed_lookup() {
        let req = IdentityRequest {
            label: "alice",
            ..Default::default()
        };
        let err = resolve_for_with_env(Direction::Allow, &req, None, &DownLookup)
            .await
            .unwrap_err();
        assert!(matches!(err, OpsError::LookupTimeout(_)));
    }

    #[tokio::test]
    async fn deny_still_rejects_bad_input() {
        let req = IdentityRequest {
            label: "",
            ..Default::default()
        };
        let err = resolve_for_with_env(Direction::Deny, &req, None, &DownLookup)
            .await
            .unwrap_err();
        assert!(matches!(err, OpsError::MissingLabel));

        let req = IdentityRequest {
            label: "alice",
            explicit_ip: Some("not-an-ip"),
            ..Default::default()
        };
        let err = resolve_for_with_env(Direction::Deny, &req, None, &DownLookup)
            .await
            .unwrap_err();
        assert!(matches!(err, OpsError::InvalidIp(_)));
    }

    #[tokio::test]
    async fn http_lookup_reads_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/")
            .with_status(200)
            .with_body("203.0.113.7\n")
            .create_async()
            .await;
        let lookup = HttpIpLookup::with_url(server.url());
        let body = lookup.lookup().await.unwrap();
        assert_eq!(Cidr::parse(&body).unwrap().as_str(), "203.0.113.7/32");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn http_lookup_surfaces_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/")
            .with_status(503)
            .create_async()
            .await;
        let lookup = HttpIpLookup::with_url(server.url());
        let err = lookup.lookup().await.unwrap_err();
        assert!(matches!(err, OpsError::LookupStatus(503)));
    }

    #[tokio::test]
    async fn http_lookup_times_out_on_silent_service() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept and hold the connection without ever answering.
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(socket);
        });

        let lookup = HttpIpLookup::with_url(format!("http://{addr}/"))
            .with_timeout(Duration::from_millis(200));
        let err = lookup.lookup().await.unwrap_err();
        assert!(matches!(err, OpsError::LookupTimeout(_)), "got {err:?}");
        assert_eq!(err.kind(), crate::error::ErrorKind::Lookup);
        server.abort();
    }
}
