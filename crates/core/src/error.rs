use thiserror::Error;
use uuid::Uuid;

use crate::backup::BackupFormat;
use crate::target::TargetEngine;

/// Typed failure causes surfaced by the engine.
///
/// Higher layers wrap these in `anyhow::Error` with context; callers recover the
/// cause with `downcast_ref::<EngineError>()`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{tool} is not installed or not on PATH")]
    ToolUnavailable { tool: String },
    #[error("{tool} exited with code {code}: {stderr}")]
    ToolFailed {
        tool: String,
        code: i32,
        stderr: String,
    },
    #[error("{tool} timed out after {secs}s and was killed")]
    ToolTimeout { tool: String, secs: u64 },
    #[error("dump output is {size} bytes, below the {min} byte minimum")]
    DumpTooSmall { size: u64, min: u64 },
    #[error("cannot reach target: {0}")]
    ConnectionError(String),
    #[error("serialization failed: {0}")]
    SerializationError(String),
    #[error("unrecognized backup format: {path}")]
    FormatUnrecognized { path: String },
    #[error("{format} artifacts cannot be restored into a {engine} target")]
    IncompatibleFormat {
        format: BackupFormat,
        engine: TargetEngine,
    },
    #[error("checksum mismatch: expected {expected}, found {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("restore applied {success_count} rows but {error_count} failed")]
    PartialRestoreFailure {
        success_count: usize,
        error_count: usize,
    },
    #[error("schedule {0} is already running")]
    SchedulingConflict(Uuid),
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },
    #[error("backup {0} has no artifact on disk")]
    MissingArtifact(Uuid),
    #[error("operation cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn not_found(what: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            what,
            id: id.to_string(),
        }
    }

    /// Whether a creation strategy failing with this error may hand over to the
    /// next strategy in the plan.
    pub fn allows_fallback(&self) -> bool {
        matches!(
            self,
            Self::ToolUnavailable { .. }
                | Self::ToolFailed { .. }
                | Self::ToolTimeout { .. }
                | Self::DumpTooSmall { .. }
                | Self::ConnectionError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_tool_and_connection_errors_allow_fallback() {
        assert!(EngineError::ToolUnavailable { tool: "pg_dump".into() }.allows_fallback());
        assert!(EngineError::DumpTooSmall { size: 3, min: 256 }.allows_fallback());
        assert!(EngineError::ConnectionError("refused".into()).allows_fallback());
        assert!(!EngineError::SerializationError("bad".into()).allows_fallback());
        assert!(!EngineError::Cancelled.allows_fallback());
    }
}
