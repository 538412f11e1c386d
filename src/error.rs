//! Failure taxonomy for collection and analysis runs.
//!
//! Every error that can end a run carries enough context for the ledger's
//! `error_detail` field and a retryability verdict for the fetch loop.
//! No panics outside tests.

/// Error type shared by fetch, validation, storage and analysis stages.
///
/// `Display` and `Error` are implemented by hand because the `source`
/// fields hold the data-source *name* (a `String`), which `thiserror`'s
/// derive would insist on treating as the error cause.
#[derive(Debug)]
pub enum PipelineError {
    /// Network-level trouble or an upstream 5xx/429. Worth retrying.
    Transient { source: String, message: String },

    /// Credential rejected or missing. Retrying cannot help.
    AuthFailure { source: String, message: String },

    /// Payload no longer matches the declared schema, or too many rows
    /// failed validation to trust the batch.
    SchemaDrift { source: String, message: String },

    /// Artifact store or ledger refused the write.
    Storage(String),

    /// Narrative service failed; analysis degrades instead of aborting.
    Narrative(String),

    /// Run was cancelled at a suspension point.
    Cancelled,

    /// Configuration is unusable (bad TOML, missing env, invalid cadence).
    Config(String),

    /// A request asked for something that does not exist.
    NotFound(String),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::Transient { source, message } => {
                write!(f, "transient upstream failure for {source}: {message}")
            }
            PipelineError::AuthFailure { source, message } => {
                write!(f, "authentication failed for {source}: {message}")
            }
            PipelineError::SchemaDrift { source, message } => {
                write!(f, "schema drift in {source}: {message}")
            }
            PipelineError::Storage(msg) => write!(f, "storage failure: {msg}"),
            PipelineError::Narrative(msg) => write!(f, "narrative service failure: {msg}"),
            PipelineError::Cancelled => write!(f, "cancelled"),
            PipelineError::Config(msg) => write!(f, "configuration error: {msg}"),
            PipelineError::NotFound(msg) => write!(f, "not found: {msg}"),
        }
    }
}

impl std::error::Error for PipelineError {}

impl PipelineError {
    pub fn transient(source: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::Transient {
            source: source.into(),
            message: message.into(),
        }
    }

    pub fn auth(source: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::AuthFailure {
            source: source.into(),
            message: message.into(),
        }
    }

    pub fn schema_drift(source: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::SchemaDrift {
            source: source.into(),
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        PipelineError::Storage(message.into())
    }

    pub fn narrative(message: impl Into<String>) -> Self {
        PipelineError::Narrative(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        PipelineError::Config(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        PipelineError::NotFound(message.into())
    }

    /// Whether the fetch loop should schedule another attempt.
    ///
    /// Only transient upstream failures are retryable; auth failures and
    /// schema drift stay wrong on replay, and storage errors are surfaced
    /// to the operator rather than hammered.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Transient { .. })
    }

    /// Short stable token recorded in the ledger's `error_detail`.
    pub fn detail_code(&self) -> &'static str {
        match self {
            PipelineError::Transient { .. } => "transient",
            PipelineError::AuthFailure { .. } => "auth",
            PipelineError::SchemaDrift { .. } => "schema-drift",
            PipelineError::Storage(_) => "storage",
            PipelineError::Narrative(_) => "narrative",
            PipelineError::Cancelled => "cancelled",
            PipelineError::Config(_) => "config",
            PipelineError::NotFound(_) => "not-found",
        }
    }

    /// Full `error_detail` string: `<code>: <display>`, except for
    /// cancellation which the ledger records as the bare token.
    pub fn error_detail(&self) -> String {
        match self {
            PipelineError::Cancelled => "cancelled".to_string(),
            other => format!("{}: {}", other.detail_code(), other),
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Storage(err.to_string())
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        PipelineError::Storage(format!("ledger: {err}"))
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Storage(format!("serialize: {err}"))
    }
}

/// Convenience alias used across the crate.
pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        assert!(PipelineError::transient("market", "503").is_retryable());
        assert!(!PipelineError::auth("market", "bad key").is_retryable());
        assert!(!PipelineError::schema_drift("weather", "missing ts").is_retryable());
        assert!(!PipelineError::storage("disk full").is_retryable());
        assert!(!PipelineError::Cancelled.is_retryable());
    }

    #[test]
    fn cancelled_detail_is_bare_token() {
        assert_eq!(PipelineError::Cancelled.error_detail(), "cancelled");
    }

    #[test]
    fn detail_includes_code_and_message() {
        let err = PipelineError::auth("market", "key rejected");
        let detail = err.error_detail();
        assert!(detail.starts_with("auth: "));
        assert!(detail.contains("key rejected"));
    }

    #[test]
    fn io_error_maps_to_storage() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: PipelineError = io.into();
        assert!(matches!(err, PipelineError::Storage(_)));
    }
}
