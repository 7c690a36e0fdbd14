//! Error types for bench-mechanic-core

use thiserror::Error;

use crate::config::ConfigError;

/// Core error type
///
/// Variants follow the failure taxonomy of the mechanic: setup problems are
/// detected before any worker or pipeline acts, protocol violations are
/// programming errors in the message exchange, and component failures come
/// from the supplier / provisioner / launcher collaborators.
#[derive(Error, Debug)]
pub enum MechanicError {
    /// The local system is not set up for the requested run
    #[error("system setup error: {0}")]
    Setup(String),

    /// The benchmark candidate could not be launched
    #[error("launch error: {0}")]
    Launch(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A message arrived in a state that does not allow it
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The requested combination is not supported
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A worker could not be reached
    #[error("communication error: {0}")]
    Communication(String),

    /// A pipeline collaborator failed
    #[error("{component} failed: {message}")]
    Component {
        /// Which collaborator failed (e.g. "supplier", "launcher")
        component: &'static str,
        /// Failure detail
        message: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MechanicError {
    /// Create a setup error
    pub fn setup(msg: impl Into<String>) -> Self {
        Self::Setup(msg.into())
    }

    /// Create a launch error
    pub fn launch(msg: impl Into<String>) -> Self {
        Self::Launch(msg.into())
    }

    /// Create a protocol violation
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    /// Create an unsupported-feature error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Create a communication error
    pub fn communication(msg: impl Into<String>) -> Self {
        Self::Communication(msg.into())
    }

    /// Create a component failure
    pub fn component(component: &'static str, msg: impl Into<String>) -> Self {
        Self::Component {
            component,
            message: msg.into(),
        }
    }

    /// Whether this error is a protocol violation
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::ProtocolViolation(_))
    }

    /// Render this error and its source chain, one cause per line
    pub fn cause_chain(&self) -> String {
        let mut rendered = format!("{self:?}");
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            rendered.push_str("\ncaused by: ");
            rendered.push_str(&cause.to_string());
            source = cause.source();
        }
        rendered
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, MechanicError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_error_display() {
        let err = MechanicError::component("provisioner", "disk full");
        assert_eq!(err.to_string(), "provisioner failed: disk full");
    }

    #[test]
    fn test_cause_chain_includes_source() {
        let err = MechanicError::from(ConfigError::missing("client", "hosts"));
        let chain = err.cause_chain();
        assert!(chain.contains("caused by"));
        assert!(chain.contains("client"));
    }

    #[test]
    fn test_is_protocol_violation() {
        assert!(MechanicError::protocol("late reply").is_protocol_violation());
        assert!(!MechanicError::setup("no daemon").is_protocol_violation());
    }
}
