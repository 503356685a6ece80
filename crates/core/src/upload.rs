//! Upload identifiers, lifecycle states and blob naming.

use crate::RepoName;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an upload record, assigned by the metadata store.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UploadId(i64);

impl UploadId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Parse from a decimal string. Zero and negative values are rejected.
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s.parse::<i64>() {
            Ok(id) if id > 0 => Ok(Self(id)),
            _ => Err(crate::Error::InvalidUploadId(s.to_string())),
        }
    }

    pub fn get(&self) -> i64 {
        self.0
    }

    /// Blob key of the complete payload.
    pub fn object_key(&self) -> String {
        format!("upload-{}.lsif.gz", self.0)
    }

    /// Blob key of one part of a multipart upload.
    pub fn part_key(&self, index: u32) -> String {
        format!("upload-{}.{}.lsif.gz", self.0, index)
    }

    /// Blob keys of every part, in index order.
    pub fn part_keys(&self, num_parts: u32) -> Vec<String> {
        (0..num_parts).map(|i| self.part_key(i)).collect()
    }
}

impl From<i64> for UploadId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl fmt::Debug for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UploadId({})", self.0)
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Upload record state.
///
/// `Processing` and `Completed` belong to the downstream worker. They are
/// recognized when reading rows but this pipeline never writes them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    /// Row exists, payload bytes are still arriving.
    Uploading,
    /// All bytes are stored and the upload waits for processing.
    Queued,
    /// The upload failed; see the failure message.
    Failed,
    Processing,
    Completed,
}

impl UploadState {
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "uploading" => Ok(Self::Uploading),
            "queued" => Ok(Self::Queued),
            "failed" => Ok(Self::Failed),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            _ => Err(crate::Error::InvalidUploadState(s.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploading => "uploading",
            Self::Queued => "queued",
            Self::Failed => "failed",
            Self::Processing => "processing",
            Self::Completed => "completed",
        }
    }

    /// Check if the upload can still receive parts.
    pub fn accepts_parts(&self) -> bool {
        matches!(self, Self::Uploading)
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upload metadata taken from an initial request, validated but not yet tied
/// to a repository row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadDraft {
    pub repository: RepoName,
    pub commit: String,
    /// Already normalized with [`normalize_root`].
    pub root: String,
    pub indexer: String,
    pub indexer_version: String,
    /// Index this upload supersedes, if any. Never `Some(0)`.
    pub associated_index_id: Option<i64>,
}

/// Validate a commit hash: exactly 40 lowercase hex characters.
pub fn validate_commit(commit: &str) -> crate::Result<()> {
    let valid = commit.len() == crate::COMMIT_HASH_LEN
        && commit
            .bytes()
            .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));

    if valid {
        Ok(())
    } else {
        Err(crate::Error::InvalidCommit(commit.to_string()))
    }
}

/// Normalize an index root so it can be used as a path prefix.
///
/// `""` and `"/"` both mean the repository root and normalize to `""`.
/// Anything else ends with exactly the slash the caller gave, or one added.
pub fn normalize_root(root: &str) -> String {
    if root.is_empty() || root == "/" {
        return String::new();
    }
    if root.ends_with('/') {
        root.to_string()
    } else {
        format!("{root}/")
    }
}
