use thiserror::Error;

/// Error taxonomy for the registration core.
///
/// Stages and control loops classify every failure into one of four
/// families:
/// - transient (network, 5xx, pool contention) — retried with backoff
/// - policy violation — terminal ERROR with a message
/// - backend rejection — parsed from the WalletNode "Task Rejected" step
/// - invariant violation — fatal, never retried
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Backend RPC call failed: {message}")]
    Rpc { message: String, retryable: bool },

    #[error("WalletNode call failed (status {status}): {body}")]
    WalletNode {
        status: u16,
        body: String,
        retryable: bool,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("Policy violation: {0}")]
    Policy(String),

    #[error("Invariant violation: {0}")]
    Invariant(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Secret store error: {0}")]
    Secret(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Burn transaction not confirmed yet: {0}")]
    BurnNotConfirmed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl GatewayError {
    /// Whether the worker retry logic should re-run the failing stage.
    ///
    /// Structural response errors ("field X missing") are not retryable;
    /// transport failures, 5xx and pool-contention signals are.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Rpc { retryable, .. } => *retryable,
            GatewayError::WalletNode { retryable, .. } => *retryable,
            GatewayError::BurnNotConfirmed(_) => true,
            GatewayError::Db(_) | GatewayError::Io(_) | GatewayError::Storage(_) => true,
            GatewayError::Policy(_)
            | GatewayError::Invariant(_)
            | GatewayError::NotFound(_)
            | GatewayError::Secret(_)
            | GatewayError::Config(_)
            | GatewayError::Serialization(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_are_retryable() {
        let e = GatewayError::Rpc {
            message: "connection refused".into(),
            retryable: true,
        };
        assert!(e.is_retryable());

        let e = GatewayError::WalletNode {
            status: 503,
            body: "unavailable".into(),
            retryable: true,
        };
        assert!(e.is_retryable());
    }

    #[test]
    fn test_structural_errors_are_not_retryable() {
        let e = GatewayError::WalletNode {
            status: 200,
            body: "field 'task_id' not found".into(),
            retryable: false,
        };
        assert!(!e.is_retryable());
        assert!(!GatewayError::Policy("fee too high".into()).is_retryable());
        assert!(!GatewayError::Invariant("bad state".into()).is_retryable());
    }

    #[test]
    fn test_unconfirmed_burn_is_retryable() {
        assert!(GatewayError::BurnNotConfirmed("tx123".into()).is_retryable());
    }
}
