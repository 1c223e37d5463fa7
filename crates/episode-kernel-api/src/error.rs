use episode_kernel_core::KernelError;
use episode_kernel_store_sqlite::{classify_error, StoreErrorKind};
use serde::Serialize;

/// Every failure an ingestion or query call can surface.
///
/// Only [`IngestError::TransientStorage`] and [`IngestError::SupersessionConflict`]
/// are retried; everything else is terminal for the call that raised it.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum IngestError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("admission rejected: {0}")]
    AdmissionRejected(String),
    #[error("extraction error: {0}")]
    Extraction(String),
    #[error("transient storage error: {0}")]
    TransientStorage(String),
    #[error("supersession conflict: {0}")]
    SupersessionConflict(String),
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: Box<IngestError> },
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("episode kernel is closed")]
    Closed,
}

impl IngestError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientStorage(_) | Self::SupersessionConflict(_))
    }

    /// Stable machine-readable label for envelopes and logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::AdmissionRejected(_) => "admission_rejected",
            Self::Extraction(_) => "extraction",
            Self::TransientStorage(_) => "transient_storage",
            Self::SupersessionConflict(_) => "supersession_conflict",
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::Timeout { .. } => "timeout",
            Self::Storage(_) => "storage",
            Self::Closed => "closed",
        }
    }

    /// Map a store failure onto the taxonomy by inspecting its cause chain.
    #[must_use]
    pub fn from_store(operation: &str, err: &anyhow::Error) -> Self {
        let message = format!("{operation}: {err:#}");
        match classify_error(err) {
            StoreErrorKind::Conflict => Self::SupersessionConflict(message),
            StoreErrorKind::Busy => Self::TransientStorage(message),
            StoreErrorKind::Fatal => Self::Storage(message),
        }
    }

    #[must_use]
    pub fn to_body(&self) -> ErrorBody {
        let attempts = match self {
            Self::RetryExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        };
        ErrorBody {
            kind: self.kind().to_string(),
            message: self.to_string(),
            retryable: self.is_retryable(),
            attempts,
        }
    }
}

impl From<KernelError> for IngestError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::Validation(message) => Self::Validation(message),
            KernelError::Config(message) => Self::Validation(format!("config: {message}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
}
