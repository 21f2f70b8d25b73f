use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the ledger controller and its components.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    /// Disallowed account source, missing network, or an operation the
    /// current mode does not permit. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("no active account")]
    AccountUnavailable,

    /// Delegated account binding failed; the account is cleared.
    #[error("account derivation failed: {0}")]
    Derivation(String),

    #[error("ledger session unavailable: {0}")]
    SessionUnavailable(String),

    /// The remote ledger service rejected the call.
    #[error("{operation} failed: {reason}")]
    OperationFailure { operation: String, reason: String },

    #[error("a withdrawal request is already pending")]
    AlreadyPending,

    #[error("no withdrawal request is pending")]
    NoPendingWithdrawal,

    #[error("{0} is already in progress")]
    Busy(String),

    #[error("withdrawal cannot be executed yet{}", format_remaining(.time_remaining))]
    NotExecutable { time_remaining: Option<Duration> },

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("insufficient available balance: have {available}, need {requested}")]
    InsufficientBalance { available: String, requested: String },

    #[error("{0} timed out")]
    Timeout(String),
}

fn format_remaining(remaining: &Option<Duration>) -> String {
    match remaining {
        Some(d) => format!(" ({}s remaining)", d.as_secs()),
        None => String::new(),
    }
}

impl LedgerError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn derivation(msg: impl Into<String>) -> Self {
        Self::Derivation(msg.into())
    }

    pub fn session_unavailable(msg: impl Into<String>) -> Self {
        Self::SessionUnavailable(msg.into())
    }

    pub fn operation(operation: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::OperationFailure {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Transient errors are shown as auto-clearing notices; the rest stay
    /// until the user acts.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::OperationFailure { .. }
                | Self::AlreadyPending
                | Self::NoPendingWithdrawal
                | Self::Busy(_)
                | Self::NotExecutable { .. }
                | Self::InvalidAmount(_)
                | Self::InvalidAddress(_)
                | Self::InsufficientBalance { .. }
                | Self::Timeout(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::AccountUnavailable => "account_unavailable",
            Self::Derivation(_) => "derivation",
            Self::SessionUnavailable(_) => "session_unavailable",
            Self::OperationFailure { .. } => "operation_failure",
            Self::AlreadyPending => "already_pending",
            Self::NoPendingWithdrawal => "no_pending_withdrawal",
            Self::Busy(_) => "busy",
            Self::NotExecutable { .. } => "not_executable",
            Self::InvalidAmount(_) => "invalid_amount",
            Self::InvalidAddress(_) => "invalid_address",
            Self::InsufficientBalance { .. } => "insufficient_balance",
            Self::Timeout(_) => "timeout",
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
