use crate::model::{Family, Operation};
use thiserror::Error;

/// Malformed rule intents. These are programmer errors: a rule that fails
/// validation is dropped at enqueue time and never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("{op} rule has no chain")]
    MissingChain { op: Operation },

    #[error("unsupported table '{0}'")]
    UnknownTable(String),

    #[error("unsupported address family '{0}'")]
    UnknownFamily(String),

    #[error("unsupported operation '{0}'")]
    UnknownOperation(String),

    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    #[error("{addr} is not an IPv{family} address")]
    FamilyMismatch { addr: String, family: Family },

    #[error("{option} requires a protocol match")]
    MissingProtocol { option: &'static str },
}

pub type Result<T> = std::result::Result<T, RuleError>;
