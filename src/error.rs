use std::fmt;

use crate::core::Guid;

/// 引擎错误分类（扁平化，便于调用方按类别决定是否重试）
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    MalformedIdentity,
    UnknownType,
    BackendUnavailable,
    NotFound,
    PartialBatchFailure,
    InconsistentState,
    Conflict,
    BatchTooLarge,
    InvalidQuery,
    Serialization,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::MalformedIdentity => "malformed-identity",
            ErrorKind::UnknownType => "unknown-type",
            ErrorKind::BackendUnavailable => "backend-unavailable",
            ErrorKind::NotFound => "not-found",
            ErrorKind::PartialBatchFailure => "partial-batch-failure",
            ErrorKind::InconsistentState => "inconsistent-state",
            ErrorKind::Conflict => "conflict",
            ErrorKind::BatchTooLarge => "batch-too-large",
            ErrorKind::InvalidQuery => "invalid-query",
            ErrorKind::Serialization => "serialization",
        };
        f.write_str(s)
    }
}

/// 批量变更中失败的单个 identity
#[derive(Debug)]
pub struct FailedIdentity {
    pub guid: Guid,
    pub cause: IndexError,
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("malformed identity {input:?}: {reason}")]
    MalformedIdentity { input: String, reason: &'static str },

    #[error("no indexing rules for type {type_name} v{version}")]
    UnknownType { type_name: String, version: u32 },

    #[error("search backend unavailable: {message}")]
    BackendUnavailable { message: String },

    #[error("no indexed record for {guid}")]
    NotFound { guid: String },

    #[error("{} of {} identities failed", failed.len(), failed.len() + succeeded.len())]
    PartialBatchFailure {
        succeeded: Vec<Guid>,
        failed: Vec<FailedIdentity>,
    },

    #[error("inconsistent state for {guid}: {detail}")]
    InconsistentState { guid: String, detail: &'static str },

    /// 同一 identity 已以另一类型存放；重试不会成功
    #[error("conflicting write for {guid}: {detail}")]
    Conflict { guid: String, detail: String },

    #[error("batch of {size} documents exceeds limit {limit}")]
    BatchTooLarge { size: usize, limit: usize },

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IndexError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IndexError::MalformedIdentity { .. } => ErrorKind::MalformedIdentity,
            IndexError::UnknownType { .. } => ErrorKind::UnknownType,
            IndexError::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            IndexError::NotFound { .. } => ErrorKind::NotFound,
            IndexError::PartialBatchFailure { .. } => ErrorKind::PartialBatchFailure,
            IndexError::InconsistentState { .. } => ErrorKind::InconsistentState,
            IndexError::Conflict { .. } => ErrorKind::Conflict,
            IndexError::BatchTooLarge { .. } => ErrorKind::BatchTooLarge,
            IndexError::InvalidQuery(_) => ErrorKind::InvalidQuery,
            IndexError::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// 只有后端连接类故障可由调用方退避重试；引擎内部不重试
    pub fn is_retriable(&self) -> bool {
        matches!(self, IndexError::BackendUnavailable { .. })
    }

    pub fn backend(message: impl Into<String>) -> Self {
        IndexError::BackendUnavailable {
            message: message.into(),
        }
    }

    pub fn not_found(guid: &Guid) -> Self {
        IndexError::NotFound {
            guid: guid.to_string(),
        }
    }

    /// 批量结果收敛：全部成功 → Ok；单个 identity 失败 → 直接返回其原因；否则 PartialBatchFailure
    pub fn collect_batch(
        mut succeeded: Vec<Guid>,
        mut failed: Vec<FailedIdentity>,
    ) -> Result<Vec<Guid>, IndexError> {
        if failed.is_empty() {
            return Ok(succeeded);
        }
        if succeeded.is_empty() && failed.len() == 1 {
            return Err(failed.remove(0).cause);
        }
        succeeded.sort();
        Err(IndexError::PartialBatchFailure { succeeded, failed })
    }
}

pub type Result<T, E = IndexError> = std::result::Result<T, E>;
