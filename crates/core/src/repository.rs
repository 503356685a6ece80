//! Repository names and the code hosts they live on.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A repository name such as `github.com/owner/name`.
///
/// The first path segment is the code host. Names are compared exactly;
/// no case folding is applied.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RepoName(String);

impl RepoName {
    /// Parse a repository name as sent by a client. Any non-empty name is
    /// accepted; whether it exists is up to the metadata store.
    pub fn parse(s: &str) -> crate::Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(crate::Error::InvalidRepository(
                "repository name is empty".to_string(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Parse a name that must carry a host segment and a non-empty path, as
    /// configured repositories do.
    pub fn parse_hosted(s: &str) -> crate::Result<Self> {
        let name = Self::parse(s)?;
        match name.0.split_once('/') {
            Some((host, path)) if !host.is_empty() && !path.is_empty() => Ok(name),
            _ => Err(crate::Error::InvalidRepository(format!(
                "{name}: expected <code host>/<path>"
            ))),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The code host prefix, e.g. `github.com`.
    pub fn code_host(&self) -> &str {
        self.0.split_once('/').map(|(host, _)| host).unwrap_or(&self.0)
    }

    /// The host-relative path, e.g. `owner/name`.
    pub fn path(&self) -> &str {
        self.0.split_once('/').map(|(_, path)| path).unwrap_or("")
    }

    /// Split the path into `(owner, name)` for hosts that use that layout.
    pub fn owner_and_name(&self) -> Option<(&str, &str)> {
        match self.path().split_once('/') {
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
                Some((owner, name))
            }
            _ => None,
        }
    }
}

impl TryFrom<String> for RepoName {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::parse(&value)
    }
}

impl From<RepoName> for String {
    fn from(name: RepoName) -> Self {
        name.0
    }
}

impl fmt::Debug for RepoName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RepoName({})", self.0)
    }
}

impl fmt::Display for RepoName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
