//! Error types for dokube

use thiserror::Error;

/// Main error type for bootstrap operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Certificate authority error
    #[error("pki error: {0}")]
    Pki(#[from] crate::pki::PkiError),

    /// Remote execution error
    #[error("remote error: {0}")]
    Remote(#[from] crate::remote::RemoteError),

    /// Cloud provider error
    #[error("provider error: {0}")]
    Provider(#[from] crate::provider::ProviderError),

    /// Invalid run configuration
    #[error("config error: {0}")]
    Config(String),

    /// A local command failed to execute
    #[error("command failed: {command} - {message}")]
    CommandFailed {
        /// The command that failed
        command: String,
        /// Error message
        message: String,
    },

    /// HTTP error outside the provider API (etcd probe, script fetch)
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a config error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a command failure with the given command and message
    pub fn command_failed(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_carry_message() {
        let err = Error::config("api-token must not be empty");
        assert!(err.to_string().contains("config error"));
        assert!(err.to_string().contains("api-token"));
    }

    #[test]
    fn command_failures_name_the_command() {
        let err = Error::command_failed("kubectl config use-context", "no such context");
        assert!(err.to_string().contains("kubectl config use-context"));
        assert!(err.to_string().contains("no such context"));
    }

    #[test]
    fn subsystem_errors_convert() {
        let pki: Error = crate::pki::PkiError::CaNotInitialized.into();
        assert!(pki.to_string().contains("pki error"));

        let remote: Error = crate::remote::RemoteError::UnboundVariable("FOO".into()).into();
        assert!(remote.to_string().contains("FOO"));
    }
}
