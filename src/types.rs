use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A monitored repository, identified by owner and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepositoryIdentity {
    pub owner: String,
    pub name: String,
}

impl RepositoryIdentity {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// Ledger key, `owner/name`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

impl fmt::Display for RepositoryIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl FromStr for RepositoryIdentity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().split_once('/') {
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(owner, name))
            }
            _ => Err(format!("expected 'owner/name', got '{}'", s)),
        }
    }
}

/// A newly published release as seen by one check. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    pub identity: RepositoryIdentity,
    pub tag_name: String,
    pub display_name: String,
    pub description: Option<String>,
    pub url: String,
    pub published_at: DateTime<Utc>,
}

/// Removes repeated identities, keeping the first occurrence of each.
pub fn dedupe_identities(identities: &[RepositoryIdentity]) -> Vec<RepositoryIdentity> {
    let mut seen = std::collections::HashSet::new();
    identities
        .iter()
        .filter(|id| seen.insert((*id).clone()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_parse_and_display() {
        let id: RepositoryIdentity = "tokio-rs/tokio".parse().unwrap();
        assert_eq!(id.owner, "tokio-rs");
        assert_eq!(id.name, "tokio");
        assert_eq!(id.to_string(), "tokio-rs/tokio");
        assert_eq!(id.key(), "tokio-rs/tokio");
    }

    #[test]
    fn test_identity_parse_rejects_malformed() {
        assert!("tokio".parse::<RepositoryIdentity>().is_err());
        assert!("/tokio".parse::<RepositoryIdentity>().is_err());
        assert!("a/b/c".parse::<RepositoryIdentity>().is_err());
    }

    #[test]
    fn test_dedupe_keeps_first_occurrence_order() {
        let ids = vec![
            RepositoryIdentity::new("a", "x"),
            RepositoryIdentity::new("b", "y"),
            RepositoryIdentity::new("a", "x"),
            RepositoryIdentity::new("c", "z"),
        ];
        let deduped = dedupe_identities(&ids);
        assert_eq!(
            deduped,
            vec![
                RepositoryIdentity::new("a", "x"),
                RepositoryIdentity::new("b", "y"),
                RepositoryIdentity::new("c", "z"),
            ]
        );
    }
}
