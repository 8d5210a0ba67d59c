//! Failure categories for a run.
//!
//! I/O code returns `anyhow::Result` with context; the root cause of a fatal
//! failure is a [`RunError`] so callers can classify it with
//! `err.downcast_ref::<RunError>()` (see [`kind_of`]).

use thiserror::Error;

/// Fatal error categories. Every variant aborts the current run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid configuration: {0}")]
    ConfigValidation(String),

    #[error("failed to synchronize source: {0}")]
    SourceSync(String),

    #[error("signature verification failed: {0}")]
    SignatureVerification(String),

    #[error("workspace i/o failed: {0}")]
    WorkspaceIo(String),

    /// A planned change touches a protected resource.
    #[error(
        "aborting as forbidden operation is about to be performed on protected resource \"{address}\""
    )]
    ForbiddenOperation { address: String },

    #[error("provisioning tool failed: {0}")]
    Provisioning(String),

    #[error("state store failed: {0}")]
    StateStore(String),

    #[error("cache synchronization failed: {0}")]
    CacheSync(String),

    #[error("termination hook failed: {0}")]
    Hook(String),

    #[error("metrics push failed: {0}")]
    Metrics(String),
}

/// Coarse category of a [`RunError`], used for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConfigValidation,
    SourceSync,
    SignatureVerification,
    WorkspaceIo,
    ForbiddenOperation,
    Provisioning,
    StateStore,
    CacheSync,
    Hook,
    Metrics,
}

impl RunError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RunError::ConfigValidation(_) => ErrorKind::ConfigValidation,
            RunError::SourceSync(_) => ErrorKind::SourceSync,
            RunError::SignatureVerification(_) => ErrorKind::SignatureVerification,
            RunError::WorkspaceIo(_) => ErrorKind::WorkspaceIo,
            RunError::ForbiddenOperation { .. } => ErrorKind::ForbiddenOperation,
            RunError::Provisioning(_) => ErrorKind::Provisioning,
            RunError::StateStore(_) => ErrorKind::StateStore,
            RunError::CacheSync(_) => ErrorKind::CacheSync,
            RunError::Hook(_) => ErrorKind::Hook,
            RunError::Metrics(_) => ErrorKind::Metrics,
        }
    }
}

/// Find the [`RunError`] category anywhere in an error chain.
pub fn kind_of(err: &anyhow::Error) -> Option<ErrorKind> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<RunError>())
        .map(RunError::kind)
}

/// Attach a category to errors that do not carry one yet.
///
/// Errors already classified deeper in the call stack keep their category.
pub trait Categorize<T> {
    fn categorize(self, wrap: fn(String) -> RunError) -> anyhow::Result<T>;
}

impl<T> Categorize<T> for anyhow::Result<T> {
    fn categorize(self, wrap: fn(String) -> RunError) -> anyhow::Result<T> {
        self.map_err(|err| {
            if kind_of(&err).is_some() {
                err
            } else {
                anyhow::Error::new(wrap(format!("{err:#}")))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn kind_is_found_through_context_layers() {
        let err = Err::<(), _>(RunError::SignatureVerification("bad".to_string()))
            .context("sync repo")
            .context("run")
            .unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::SignatureVerification));
    }

    #[test]
    fn categorize_keeps_existing_kind() {
        let inner: anyhow::Result<()> =
            Err(RunError::ForbiddenOperation { address: "a".to_string() }.into());
        let err = inner.categorize(RunError::Provisioning).unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::ForbiddenOperation));

        let plain: anyhow::Result<()> = Err(anyhow::anyhow!("disk full"));
        let err = plain.categorize(RunError::WorkspaceIo).unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::WorkspaceIo));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn plain_errors_have_no_kind() {
        let err = anyhow::anyhow!("boom");
        assert_eq!(kind_of(&err), None);
    }

    #[test]
    fn forbidden_operation_names_resource() {
        let err = RunError::ForbiddenOperation {
            address: "null_resource.protected".to_string(),
        };
        assert!(err.to_string().contains("null_resource.protected"));
    }
}
