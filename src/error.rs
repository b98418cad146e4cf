//! Error taxonomy shared by the remote client, the local index and the matcher.

use std::path::PathBuf;

use thiserror::Error;

use crate::namaste::Category;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("credential exchange failed: {reason}")]
    Credential { reason: String },

    #[error("{target} failed{}: {reason}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Transport {
        target: String,
        status: Option<u16>,
        reason: String,
    },

    #[error("unexpected payload from {target}: {source}")]
    Decode {
        target: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("search index unavailable at {}: {reason}", .path.display())]
    IndexUnavailable { path: PathBuf, reason: String },

    #[error("rebuild failed for {category} source: {reason}")]
    Rebuild { category: Category, reason: String },

    #[error("matcher produced invalid output: {source}")]
    MatcherOutput {
        #[source]
        source: serde_json::Error,
    },

    #[error("search index error: {0}")]
    Index(#[from] tantivy::TantivyError),

    #[error("io error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("request cancelled")]
    Cancelled,
}

impl BridgeError {
    pub fn transport(target: impl Into<String>, err: reqwest::Error) -> Self {
        Self::Transport {
            target: target.into(),
            status: err.status().map(|s| s.as_u16()),
            reason: err.to_string(),
        }
    }

    pub fn status(target: impl Into<String>, status: reqwest::StatusCode, body: &str) -> Self {
        Self::Transport {
            target: target.into(),
            status: Some(status.as_u16()),
            reason: truncate_for_log(body),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True for conditions a caller may retry once the index generation settles.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::IndexUnavailable { .. })
    }
}

pub fn truncate_for_log(text: &str) -> String {
    let trimmed = text.trim();
    let max_len = 300usize;
    if trimmed.len() <= max_len {
        trimmed.to_string()
    } else {
        let mut end = max_len;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &trimmed[..end])
    }
}
