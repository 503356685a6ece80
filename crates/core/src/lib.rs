//! Core domain types and shared logic for the indexgate upload pipeline.
//!
//! This crate defines the data model used across all other crates:
//! - Upload lifecycle states and blob keys
//! - Commit and root validation
//! - Repository names and their code hosts
//! - Token scopes and authorization

pub mod config;
pub mod error;
pub mod repository;
pub mod token;
pub mod upload;

pub use error::{Error, Result};
pub use repository::RepoName;
pub use token::{Token, TokenId, TokenScope};
pub use upload::{UploadDraft, UploadId, UploadState, normalize_root, validate_commit};

/// Length of a full git object name in hex.
pub const COMMIT_HASH_LEN: usize = 40;
