use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OpsError {
    #[error("no config found: run 'opsctl config init' or pass --config")]
    NotConfigured,

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("operator label is empty: set sshUser in config or pass --label")]
    MissingLabel,

    #[error("invalid IP '{0}': expected a.b.c.d or a.b.c.d/n")]
    InvalidIp(String),

    #[error("unknown environment: {0}")]
    UnknownEnvironment(String),

    #[error("public IP lookup timed out after {0:?}")]
    LookupTimeout(std::time::Duration),

    #[error("public IP lookup returned HTTP {0}")]
    LookupStatus(u16),

    #[error("public IP lookup failed: {0}")]
    Lookup(String),

    #[error("security group not found: {0}")]
    GroupNotFound(String),

    #[error("security group '{name}' is ambiguous: {count} groups match")]
    GroupAmbiguous { name: String, count: usize },

    #[error("security group '{0}' has no provider ID")]
    GroupMalformed(String),

    #[error("not authorised: {0}")]
    AuthFailed(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("throttled by provider: {0}")]
    Throttled(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("cancelled")]
    Cancelled,

    #[error("aws CLI not found on PATH")]
    AwsCliNotInstalled,

    #[error("home directory not found: set HOME environment variable")]
    HomeNotFound,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, OpsError>;

/// Coarse classification of an [`OpsError`], carried in serialised results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MissingLabel,
    InvalidIp,
    UnknownEnvironment,
    Lookup,
    GroupNotFound,
    GroupAmbiguous,
    GroupMalformed,
    AuthFailed,
    Transport,
    Throttled,
    Provider,
    Cancelled,
    Config,
    Internal,
}

impl OpsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OpsError::MissingLabel => ErrorKind::MissingLabel,
            OpsError::InvalidIp(_) => ErrorKind::InvalidIp,
            OpsError::UnknownEnvironment(_) => ErrorKind::UnknownEnvironment,
            OpsError::LookupTimeout(_) | OpsError::LookupStatus(_) | OpsError::Lookup(_) => {
                ErrorKind::Lookup
            }
            OpsError::GroupNotFound(_) => ErrorKind::GroupNotFound,
            OpsError::GroupAmbiguous { .. } => ErrorKind::GroupAmbiguous,
            OpsError::GroupMalformed(_) => ErrorKind::GroupMalformed,
            OpsError::AuthFailed(_) => ErrorKind::AuthFailed,
            OpsError::Transport(_) => ErrorKind::Transport,
            OpsError::Throttled(_) => ErrorKind::Throttled,
            OpsError::Provider(_) | OpsError::AwsCliNotInstalled => ErrorKind::Provider,
            OpsError::Cancelled => ErrorKind::Cancelled,
            OpsError::NotConfigured | OpsError::InvalidConfig(_) => ErrorKind::Config,
            OpsError::HomeNotFound | OpsError::Io(_) | OpsError::Yaml(_) | OpsError::Json(_) => {
                ErrorKind::Internal
            }
        }
    }

}

/// Serialisable form of an error attached to one group's outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&OpsError> for GroupError {
    fn from(e: &OpsError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl std::fmt::Display for GroupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_errors_keep_their_own_kind() {
        assert_eq!(OpsError::MissingLabel.kind(), ErrorKind::MissingLabel);
        assert_eq!(OpsError::InvalidIp("x".into()).kind(), ErrorKind::InvalidIp);
        assert_eq!(
            OpsError::UnknownEnvironment("x".into()).kind(),
            ErrorKind::UnknownEnvironment
        );
        assert_eq!(OpsError::AwsCliNotInstalled.kind(), ErrorKind::Provider);
    }

    #[test]
    fn lookup_variants_share_a_kind() {
        let timeout = OpsError::LookupTimeout(std::time::Duration::from_secs(5));
        assert_eq!(timeout.kind(), ErrorKind::Lookup);
        assert_eq!(timeout.to_string(), "public IP lookup timed out after 5s");
        assert_eq!(OpsError::LookupStatus(503).kind(), ErrorKind::Lookup);
    }

    #[test]
    fn ambiguous_message_names_count() {
        let e = OpsError::GroupAmbiguous {
            name: "develop - bastion".into(),
            count: 2,
        };
        assert_eq!(
            e.to_string(),
            "security group 'develop - bastion' is ambiguous: 2 groups match"
        );
    }
}
