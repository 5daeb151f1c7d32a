use std::time::Duration;
use thiserror::Error;

pub type GiffyResult<T> = Result<T, GiffyError>;

/// Failures surfaced to callers of the preload manager, the job runner and
/// the editor. Engine-level errors are folded into `ConversionFailed` or
/// `InitializationFailed` at the runner boundary.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GiffyError {
    #[error("engine initialization failed: {0}")]
    InitializationFailed(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("conversion failed: {0}")]
    ConversionFailed(String),

    #[error("conversion timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("a conversion is already running on this session")]
    Busy,

    #[error("cannot {action} while {state}")]
    InvalidTransition {
        state: &'static str,
        action: &'static str,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

impl GiffyError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationFailed(msg.into())
    }

    pub fn conversion(msg: impl Into<String>) -> Self {
        Self::ConversionFailed(msg.into())
    }

    pub fn initialization(msg: impl Into<String>) -> Self {
        Self::InitializationFailed(msg.into())
    }

    /// Whole seconds, rounded up so a sub-second limit never reads as 0s.
    pub fn timeout(limit: Duration) -> Self {
        Self::Timeout {
            secs: limit.as_secs() + u64::from(limit.subsec_nanos() > 0),
        }
    }

    /// Message without the category prefix, for crossing the worker boundary.
    pub fn detail(&self) -> String {
        match self {
            GiffyError::InitializationFailed(msg)
            | GiffyError::ValidationFailed(msg)
            | GiffyError::ConversionFailed(msg)
            | GiffyError::Config(msg) => msg.clone(),
            other => other.to_string(),
        }
    }

    /// The single line shown to the user. Timeouts read the same as any
    /// other conversion failure; logs keep the distinction.
    pub fn user_message(&self) -> String {
        match self {
            GiffyError::InitializationFailed(_) => {
                "Setup failed. Please reload and try again.".to_string()
            }
            GiffyError::ValidationFailed(msg) => msg.clone(),
            GiffyError::ConversionFailed(msg) => format!("Conversion failed: {msg}"),
            GiffyError::Timeout { .. } => {
                "Conversion failed: it took too long and was stopped.".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<serde_json::Error> for GiffyError {
    fn from(err: serde_json::Error) -> Self {
        GiffyError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prefixes_are_stable() {
        assert!(GiffyError::validation("x")
            .to_string()
            .starts_with("validation failed:"));
        assert!(GiffyError::conversion("x")
            .to_string()
            .starts_with("conversion failed:"));
        assert!(GiffyError::initialization("x")
            .to_string()
            .starts_with("engine initialization failed:"));
        assert_eq!(
            GiffyError::Timeout { secs: 300 }.to_string(),
            "conversion timed out after 300s"
        );
    }

    #[test]
    fn timeout_reads_like_a_conversion_failure_to_users() {
        let msg = GiffyError::Timeout { secs: 1 }.user_message();
        assert!(msg.starts_with("Conversion failed"));
    }

    #[test]
    fn sub_second_timeouts_round_up() {
        assert_eq!(
            GiffyError::timeout(Duration::from_millis(50)),
            GiffyError::Timeout { secs: 1 }
        );
        assert_eq!(
            GiffyError::timeout(Duration::from_secs(300)),
            GiffyError::Timeout { secs: 300 }
        );
    }

    #[test]
    fn detail_drops_the_category_prefix() {
        assert_eq!(GiffyError::conversion("Out of memory").detail(), "Out of memory");
        assert_eq!(GiffyError::Busy.detail(), GiffyError::Busy.to_string());
    }

    #[test]
    fn invalid_transition_names_state_and_action() {
        let err = GiffyError::InvalidTransition {
            state: "converting",
            action: "select a file",
        };
        assert_eq!(err.to_string(), "cannot select a file while converting");
    }
}
