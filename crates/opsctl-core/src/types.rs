use crate::identity::Cidr;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Allow,
    Deny,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Allow => "allow",
            Direction::Deny => "deny",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Rule
// ---------------------------------------------------------------------------

/// A single-port TCP ingress rule owned by `label`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Rule {
    pub port: u16,
    pub cidr: Cidr,
    pub label: String,
}

impl Rule {
    pub fn new(port: u16, cidr: Cidr, label: impl Into<String>) -> Self {
        Self {
            port,
            cidr,
            label: label.into(),
        }
    }
}

impl std::fmt::Display for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tcp/{} {} ({})", self.port, self.cidr, self.label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rules_equal_only_when_all_fields_match() {
        let cidr = Cidr::parse("203.0.113.7").unwrap();
        let a = Rule::new(22, cidr.clone(), "alice");
        assert_eq!(a, Rule::new(22, Cidr::parse("203.0.113.7/32").unwrap(), "alice"));
        assert_ne!(a, Rule::new(22, cidr.clone(), "bob"));
        assert_ne!(a, Rule::new(443, cidr, "alice"));
    }

    #[test]
    fn direction_displays_lowercase() {
        assert_eq!(Direction::Allow.to_string(), "allow");
        assert_eq!(Direction::Deny.to_string(), "deny");
    }
}
