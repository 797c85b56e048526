use std::time::Duration;

use thiserror::Error;

/// Coarse classification of a [`WizardError`], used when deciding whether a
/// failure is shown as a check result, a log line, or a terminal job state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No response was received at all.
    Transport,
    /// A response arrived but it reports failure.
    Application,
    /// A response or frame could not be understood.
    Protocol,
    /// A job sent an explicit failure signal.
    JobFailure,
    /// Local problem: configuration, files, bad URLs.
    Local,
}

#[derive(Error, Debug)]
pub enum WizardError {
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} did not answer within {after:?}")]
    Timeout { endpoint: String, after: Duration },
    #[error("{endpoint} answered with HTTP {status}")]
    Status { endpoint: String, status: u16 },
    #[error("{endpoint} reported failure: {message}")]
    Application { endpoint: String, message: String },
    #[error("malformed response from {endpoint}: {reason}")]
    Protocol { endpoint: String, reason: String },
    #[error("job failed: {0}")]
    JobFailed(String),
    #[error("push socket error: {0}")]
    Socket(#[from] Box<tokio_tungstenite::tungstenite::Error>),
    #[error("invalid url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("failed reading `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed parsing yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl WizardError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WizardError::Transport { .. }
            | WizardError::Timeout { .. }
            | WizardError::Socket(_) => ErrorKind::Transport,
            WizardError::Status { .. } | WizardError::Application { .. } => {
                ErrorKind::Application
            }
            WizardError::Protocol { .. } => ErrorKind::Protocol,
            WizardError::JobFailed(_) => ErrorKind::JobFailure,
            WizardError::InvalidUrl { .. }
            | WizardError::Config(_)
            | WizardError::Io { .. }
            | WizardError::Yaml(_) => ErrorKind::Local,
        }
    }

    pub(crate) fn from_reqwest(endpoint: impl Into<String>, err: reqwest::Error) -> Self {
        let endpoint = endpoint.into();
        if err.is_decode() {
            WizardError::Protocol {
                endpoint,
                reason: err.to_string(),
            }
        } else if let Some(status) = err.status() {
            WizardError::Status {
                endpoint,
                status: status.as_u16(),
            }
        } else {
            WizardError::Transport {
                endpoint,
                source: err,
            }
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for WizardError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        WizardError::Socket(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, WizardError>;
