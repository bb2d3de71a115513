//! # Pipeline Errors
//!
//! One error enum covers every failure the campaign pipeline can surface to a
//! caller. The prefixes in the display strings are stable and are what the
//! HTTP layer and the logs key on.

use thiserror::Error;

use crate::bus::BusError;
use crate::cache::store::StoreError;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed or negative counters, bad budgets, unregistered campaigns.
    /// Always rejected before any state is touched.
    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),
    #[error("ALREADY_REGISTERED: campaign '{0}' is already registered")]
    AlreadyRegistered(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    /// Bus delivery gave up after its retries. State was already committed.
    #[error("PUBLISH_FAILED: {0}")]
    PublishFailed(String),
    #[error("BUS_DISCONNECTED: {0}")]
    BusDisconnected(String),
    /// The system of record failed while filling the resolver cache.
    #[error("CACHE_LOAD_FAILED: {0}")]
    CacheLoadFailed(#[from] StoreError),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for PipelineError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<BusError> for PipelineError {
    fn from(value: BusError) -> Self {
        match value {
            BusError::Disconnected(reason) => Self::BusDisconnected(reason),
            other => Self::PublishFailed(other.to_string()),
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
