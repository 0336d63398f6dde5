//! Error types for the vSphere provisioning driver.

use std::fmt;

/// Categorised error kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VsphereErrorKind {
    /// vSphere endpoint unreachable or session expired
    ConnectionError,
    /// Authentication failed (401)
    AuthenticationError,
    /// Permission denied (403)
    AccessDenied,
    /// Inventory object not found
    NotFound,
    /// HTTP / API error with status code
    ApiError(u16),
    /// JSON parse / deserialization error
    ParseError,
    /// Local file I/O (media uploads, sysprep files)
    IoError,
    /// Bad or missing request fields, detected before any remote call
    Configuration,
    /// A network name resolves to several networks and the host hint did not help
    AmbiguousNetwork,
    /// A host exposes more than one network and none was named
    MultipleNetworks,
    /// Some other name resolves to more than one object
    Ambiguous,
    /// Linked clone requested but the template has no current snapshot
    NoSnapshot,
    /// The VM has no network adapter to rebind
    NoAdapter,
    /// vApp property override that the template does not allow
    InvalidVAppProperty,
    /// Disk resize on a VM without disks
    NoDisks,
    /// Disk resize on a VM with more than one disk
    MultipleDisks,
    /// No SATA controller present
    NoSataController,
    /// Device layout does not allow the requested change
    DeviceState,
    /// VM already exists and force was not given
    AlreadyExists,
    /// Task failed on vCenter
    TaskError,
    /// Timeout
    Timeout,
    /// Caller cancelled the operation
    Cancelled,
}

/// Error taxonomy exposed to the orchestration layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    AmbiguousResolution,
    Precondition,
    PlatformTask,
    Timeout,
    Cancelled,
    Transport,
}

/// Crate error type carrying a kind + human-readable message.
#[derive(Debug, Clone)]
pub struct VsphereError {
    pub kind: VsphereErrorKind,
    pub message: String,
}

impl VsphereError {
    pub fn new(kind: VsphereErrorKind, msg: impl Into<String>) -> Self {
        Self { kind, message: msg.into() }
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::new(VsphereErrorKind::ConnectionError, msg)
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::new(VsphereErrorKind::AuthenticationError, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(VsphereErrorKind::NotFound, msg)
    }

    pub fn api(status: u16, msg: impl Into<String>) -> Self {
        Self::new(VsphereErrorKind::ApiError(status), msg)
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::new(VsphereErrorKind::ParseError, msg)
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::new(VsphereErrorKind::Configuration, msg)
    }

    pub fn ambiguous(msg: impl Into<String>) -> Self {
        Self::new(VsphereErrorKind::Ambiguous, msg)
    }

    pub fn task(msg: impl Into<String>) -> Self {
        Self::new(VsphereErrorKind::TaskError, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(VsphereErrorKind::Timeout, msg)
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::new(VsphereErrorKind::Cancelled, msg)
    }

    /// Prefix the message with the failed operation and the object it targeted.
    /// The kind is preserved so callers can still branch on it.
    pub fn context(self, op: &str, subject: &str) -> Self {
        let message = if subject.is_empty() {
            format!("{op}: {}", self.message)
        } else {
            format!("{op} '{subject}': {}", self.message)
        };
        Self { kind: self.kind, message }
    }

    pub fn category(&self) -> ErrorCategory {
        use VsphereErrorKind::*;
        match self.kind {
            Configuration => ErrorCategory::Configuration,
            AmbiguousNetwork | MultipleNetworks | Ambiguous => ErrorCategory::AmbiguousResolution,
            NoSnapshot | NoAdapter | InvalidVAppProperty | NoDisks | MultipleDisks
            | NoSataController | DeviceState | AlreadyExists | NotFound => {
                ErrorCategory::Precondition
            }
            TaskError | ApiError(_) => ErrorCategory::PlatformTask,
            Timeout => ErrorCategory::Timeout,
            Cancelled => ErrorCategory::Cancelled,
            ConnectionError | AuthenticationError | AccessDenied | ParseError | IoError => {
                ErrorCategory::Transport
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == VsphereErrorKind::NotFound
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == VsphereErrorKind::Cancelled
    }
}

impl fmt::Display for VsphereError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)
    }
}

impl std::error::Error for VsphereError {}

impl From<VsphereError> for String {
    fn from(e: VsphereError) -> String {
        e.to_string()
    }
}

impl From<reqwest::Error> for VsphereError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::timeout(format!("HTTP timeout: {e}"))
        } else if e.is_connect() {
            Self::connection(format!("Connection failed: {e}"))
        } else {
            Self::connection(format!("HTTP error: {e}"))
        }
    }
}

impl From<serde_json::Error> for VsphereError {
    fn from(e: serde_json::Error) -> Self {
        Self::parse(format!("JSON parse error: {e}"))
    }
}

impl From<std::io::Error> for VsphereError {
    fn from(e: std::io::Error) -> Self {
        Self::new(VsphereErrorKind::IoError, e.to_string())
    }
}

/// Convenience alias.
pub type VsphereResult<T> = Result<T, VsphereError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_keeps_kind() {
        let err = VsphereError::new(VsphereErrorKind::NoSnapshot, "template has no snapshots")
            .context("clone", "ubuntu-template");
        assert_eq!(err.kind, VsphereErrorKind::NoSnapshot);
        assert_eq!(err.message, "clone 'ubuntu-template': template has no snapshots");
    }

    #[test]
    fn context_without_subject() {
        let err = VsphereError::task("fault").context("reconfigure", "");
        assert_eq!(err.message, "reconfigure: fault");
    }

    #[test]
    fn categories() {
        assert_eq!(VsphereError::config("x").category(), ErrorCategory::Configuration);
        assert_eq!(
            VsphereError::new(VsphereErrorKind::AmbiguousNetwork, "x").category(),
            ErrorCategory::AmbiguousResolution
        );
        assert_eq!(
            VsphereError::new(VsphereErrorKind::MultipleDisks, "x").category(),
            ErrorCategory::Precondition
        );
        assert_eq!(VsphereError::task("x").category(), ErrorCategory::PlatformTask);
        assert_eq!(VsphereError::timeout("x").category(), ErrorCategory::Timeout);
        assert_eq!(VsphereError::cancelled("x").category(), ErrorCategory::Cancelled);
        assert_eq!(VsphereError::auth("x").category(), ErrorCategory::Transport);
    }

    #[test]
    fn display_includes_kind() {
        let err = VsphereError::api(500, "boom");
        assert_eq!(err.to_string(), "[ApiError(500)] boom");
    }
}
