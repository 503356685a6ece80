//! Query parameters of the upload endpoints.
//!
//! Integer parameters are lenient: an absent or malformed value reads as 0,
//! and the derived fields are checked by the flow that uses them.

use crate::error::{ApiError, ApiResult};
use indexgate_core::{RepoName, UploadDraft, UploadId, normalize_root, validate_commit};
use serde::Deserialize;

/// Raw query string of an upload request.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct UploadQuery {
    pub repository: Option<String>,
    pub commit: Option<String>,
    pub root: Option<String>,
    #[serde(rename = "indexerName")]
    pub indexer_name: Option<String>,
    #[serde(rename = "indexerVersion")]
    pub indexer_version: Option<String>,
    #[serde(rename = "associatedIndexId")]
    pub associated_index_id: Option<String>,
    #[serde(rename = "numParts")]
    pub num_parts: Option<String>,
    #[serde(rename = "multiPart")]
    pub multi_part: Option<String>,
    #[serde(rename = "uploadId")]
    pub upload_id: Option<String>,
    pub index: Option<String>,
    pub done: Option<String>,
    pub github_token: Option<String>,
}

/// What an upload request asks for, decided from its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadRequest {
    /// The whole payload is in this request's body.
    Single(UploadDraft),
    /// Create a multipart upload; parts follow in later requests.
    Setup { draft: UploadDraft, num_parts: i32 },
    /// One part of an existing multipart upload.
    Part { upload_id: UploadId, index: i64 },
    /// All parts are in; assemble them.
    Finalize { upload_id: UploadId },
}

impl UploadRequest {
    /// Continuations refer to an upload created by an earlier request.
    pub fn is_continuation(&self) -> bool {
        matches!(self, Self::Part { .. } | Self::Finalize { .. })
    }
}

fn parse_int(value: Option<&str>) -> i64 {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(0)
}

fn parse_bool(value: Option<&str>) -> bool {
    value.is_some_and(|v| {
        let v = v.trim();
        v == "1" || v.eq_ignore_ascii_case("t") || v.eq_ignore_ascii_case("true")
    })
}

impl UploadQuery {
    pub fn upload_id(&self) -> i64 {
        parse_int(self.upload_id.as_deref())
    }

    pub fn num_parts(&self) -> i64 {
        parse_int(self.num_parts.as_deref())
    }

    pub fn index(&self) -> i64 {
        parse_int(self.index.as_deref())
    }

    pub fn multi_part(&self) -> bool {
        parse_bool(self.multi_part.as_deref())
    }

    pub fn done(&self) -> bool {
        parse_bool(self.done.as_deref())
    }

    /// Whether the request continues an upload created earlier.
    pub fn is_continuation(&self) -> bool {
        self.upload_id() != 0
    }

    /// The target repository of an initial request.
    pub fn repository_name(&self) -> ApiResult<RepoName> {
        let name = self
            .repository
            .as_deref()
            .filter(|r| !r.is_empty())
            .ok_or_else(|| ApiError::BadRequest("repository is required".to_string()))?;
        Ok(RepoName::parse(name)?)
    }

    /// Validate the metadata of an initial request.
    pub fn draft(&self) -> ApiResult<UploadDraft> {
        let repository = self.repository_name()?;

        let commit = self.commit.clone().unwrap_or_default();
        validate_commit(&commit)?;

        let associated_index_id = match parse_int(self.associated_index_id.as_deref()) {
            0 => None,
            id => Some(id),
        };

        Ok(UploadDraft {
            repository,
            commit,
            root: normalize_root(self.root.as_deref().unwrap_or_default()),
            indexer: self.indexer_name.clone().unwrap_or_default(),
            indexer_version: self.indexer_version.clone().unwrap_or_default(),
            associated_index_id,
        })
    }

    /// Decide which flow handles the request.
    ///
    /// Continuations ignore the metadata parameters entirely, so they are
    /// not validated.
    pub fn classify(&self) -> ApiResult<UploadRequest> {
        let upload_id = self.upload_id();
        if upload_id != 0 {
            let upload_id = UploadId::new(upload_id);
            return Ok(if self.done() {
                UploadRequest::Finalize { upload_id }
            } else {
                UploadRequest::Part {
                    upload_id,
                    index: self.index(),
                }
            });
        }

        let draft = self.draft()?;
        if !self.multi_part() {
            return Ok(UploadRequest::Single(draft));
        }

        let num_parts = self.num_parts();
        if num_parts <= 0 {
            return Err(ApiError::BadRequest(
                "numParts must be positive".to_string(),
            ));
        }
        let num_parts = i32::try_from(num_parts)
            .map_err(|_| ApiError::BadRequest(format!("numParts {num_parts} is too large")))?;

        Ok(UploadRequest::Setup { draft, num_parts })
    }
}
