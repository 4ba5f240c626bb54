//! Error types for utility VM provisioning

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid utility VM options: {0}")]
    InvalidOptions(String),

    #[error("failed to acquire resource: {0}")]
    ResourceAcquisition(String),

    #[error("HCS operation failed: {0}")]
    Hcs(String),

    #[error("failed to clone {resource}: {source}")]
    CloneReplay {
        resource: String,
        #[source]
        source: Box<Error>,
    },

    #[error("network error: {0}")]
    Network(String),

    #[error("network namespace {0} is already attached to the utility VM")]
    NetNsAlreadyAttached(String),

    #[error("network namespace {0} is not attached to the utility VM")]
    NetNsNotFound(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("guest channel error: {0}")]
    GuestChannel(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(windows)]
    #[error("Windows API error: {0}")]
    Windows(#[from] windows::core::Error),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap this error with the operation that produced it.
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping context and clone wrappers.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Context { source, .. } | Error::CloneReplay { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub fn is_invalid_options(&self) -> bool {
        matches!(self.root_cause(), Error::InvalidOptions(_))
    }

    pub fn is_resource_acquisition(&self) -> bool {
        matches!(self.root_cause(), Error::ResourceAcquisition(_))
    }

    /// Whether a clone replay failed anywhere in the chain.
    pub fn is_clone_replay(&self) -> bool {
        match self {
            Error::CloneReplay { .. } => true,
            Error::Context { source, .. } => source.is_clone_replay(),
            _ => false,
        }
    }

    /// Not-found failures are tolerated during teardown.
    pub fn is_not_found(&self) -> bool {
        match self.root_cause() {
            Error::NotFound(_) | Error::NetNsNotFound(_) => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            Error::Network(msg) | Error::Hcs(msg) => msg.to_ascii_lowercase().contains("not found"),
            _ => false,
        }
    }

    /// Create from an HRESULT returned by HCS or HCN
    pub fn from_hresult(hr: i32, context: &str) -> Self {
        // 0x803B0001 = HCN_E_NETWORK_NOT_FOUND, 0x803B0002 = HCN_E_ENDPOINT_NOT_FOUND,
        // 0x803B0003 = HCN_E_LAYER_NOT_FOUND, 0x803B0014 = HCN_E_NAMESPACE_NOT_FOUND
        match hr as u32 {
            0x803B0001 | 0x803B0002 | 0x803B0003 | 0x803B0014 => {
                Error::NotFound(format!("{}: HRESULT 0x{:08X}", context, hr))
            }
            _ => Error::Hcs(format!("{}: HRESULT 0x{:08X}", context, hr)),
        }
    }
}

/// Attach operation context to a failed result.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().context(context))
    }

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.into().context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_display() {
        let err = Error::Hcs("rejected".into()).context("error while creating the compute system");
        assert_eq!(
            err.to_string(),
            "error while creating the compute system: HCS operation failed: rejected"
        );
    }

    #[test]
    fn test_root_cause_unwraps_nested() {
        let err = Error::InvalidOptions("at least 2 layer folders must be supplied".into())
            .context("bad utility VM options")
            .context("create_wcow");
        assert!(err.is_invalid_options());
        assert!(matches!(err.root_cause(), Error::InvalidOptions(_)));
    }

    #[test]
    fn test_clone_replay_classification() {
        let err = Error::CloneReplay {
            resource: "SCSI mount 0:0".into(),
            source: Box::new(Error::Io(std::io::Error::from(std::io::ErrorKind::NotFound))),
        }
        .context("failed while cloning");
        assert!(err.is_clone_replay());
        assert!(err.is_not_found());
        assert!(!err.is_invalid_options());
    }

    #[test]
    fn test_from_hresult() {
        assert!(matches!(
            Error::from_hresult(0x803B0014u32 as i32, "HcnOpenNamespace"),
            Error::NotFound(_)
        ));
        assert!(matches!(
            Error::from_hresult(0x8037011Bu32 as i32, "HcsCreateComputeSystem"),
            Error::Hcs(_)
        ));
    }
}
