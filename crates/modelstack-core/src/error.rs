//! Error taxonomy for the installer engine

/// Errors surfaced by installer components.
///
/// Recoverable conditions (an already satisfied step, a resumable partial
/// download, the autostart fallback mechanism) are handled internally and
/// never reach this type. Anything here aborts the current run.
#[derive(thiserror::Error, Debug)]
pub enum InstallError {
    /// Invalid or unsatisfiable request (bad flag combination, unknown
    /// compat-layer distribution, missing base directory).
    #[error("Configuration error: {0}")]
    Config(String),

    /// A download failed after exhausting its retry budget.
    #[error("Network error: {0}")]
    Network(String),

    /// Both autostart mechanisms were denied.
    #[error("Privilege error: {0}")]
    Privilege(String),

    /// An explicitly requested backend is missing its prerequisite.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A started service never reported live within the configured bound.
    #[error("Service '{service}' did not become ready on port {port} within {timeout_secs}s")]
    ServiceTimeout {
        service: String,
        port: u16,
        timeout_secs: u64,
    },

    /// The run was cancelled from the outside (Ctrl-C).
    #[error("Interrupted")]
    Interrupted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for installer operations.
pub type Result<T> = std::result::Result<T, InstallError>;

impl InstallError {
    /// Process exit code for this error class.
    ///
    /// 0 is success; 1 is the catch-all. The remaining codes let callers
    /// distinguish failure classes without parsing messages.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::BackendUnavailable(_) => 2,
            Self::Network(_) | Self::Http(_) => 3,
            Self::Privilege(_) => 4,
            Self::ServiceTimeout { .. } => 5,
            Self::Interrupted => 130,
            Self::Io(_) | Self::Other(_) => 1,
        }
    }
}

impl From<&str> for InstallError {
    fn from(s: &str) -> Self {
        InstallError::Other(s.to_string())
    }
}

impl From<String> for InstallError {
    fn from(s: String) -> Self {
        InstallError::Other(s)
    }
}
