//! Build-level error type.

use thiserror::Error;
use vsforge_vsphere::{ErrorCategory, VsphereError};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("{0}")]
    Vsphere(#[from] VsphereError),

    /// Every problem found while preparing the config, in order.
    #[error("invalid build config:\n{}", format_list(.0))]
    Config(Vec<String>),

    #[error("failed to parse build config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("build was cancelled")]
    Cancelled,
}

fn format_list(errs: &[String]) -> String {
    errs.iter().map(|e| format!("  * {e}")).collect::<Vec<_>>().join("\n")
}

impl BuildError {
    /// Taxonomy bucket, for exit codes and reporting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Vsphere(e) => e.category(),
            Self::Config(_) | Self::Parse(_) => ErrorCategory::Configuration,
            Self::Io(_) => ErrorCategory::Transport,
            Self::Cancelled => ErrorCategory::Cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.category() == ErrorCategory::Cancelled
    }
}

pub type BuildResult<T> = Result<T, BuildError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_are_listed() {
        let err = BuildError::Config(vec!["'template' is required".into(), "customize is empty".into()]);
        assert_eq!(
            err.to_string(),
            "invalid build config:\n  * 'template' is required\n  * customize is empty"
        );
        assert_eq!(err.category(), ErrorCategory::Configuration);
    }

    #[test]
    fn wrapped_cancellation() {
        let err: BuildError = VsphereError::cancelled("waiting for IP cancelled").into();
        assert!(err.is_cancelled());
        assert!(BuildError::Cancelled.is_cancelled());
    }
}
