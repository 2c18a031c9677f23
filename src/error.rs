use thiserror::Error;
use tracing::error;

use crate::config::ConfigError;

pub type Result<T> = std::result::Result<T, PlanError>;

/// Failures surfaced while choosing access paths.
///
/// `Internal` marks a bookkeeping defect inside the optimizer itself; a plan
/// built past one of these could return wrong results, so callers must abort
/// the compilation instead of retrying.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("internal consistency failure: {0}")]
    Internal(String),
    #[error("no best plan found for query block")]
    NoBestPlan,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Logs and builds an [`PlanError::Internal`] failure.
pub fn internal(message: impl Into<String>) -> PlanError {
    let message = message.into();
    error!(reason = %message, "optimizer.internal_failure");
    PlanError::Internal(message)
}
