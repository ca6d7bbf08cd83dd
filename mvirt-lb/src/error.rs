//! Reconciler error types.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::clients::ApiError;

/// Step of a lifecycle operation, carried in errors for context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Create,
    Read,
    Update,
    Tags,
    Attributes,
    SecurityGroups,
    Subnets,
    IpAddressType,
    Settle,
    Delete,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Create => "create",
            Phase::Read => "read",
            Phase::Update => "update",
            Phase::Tags => "update tags",
            Phase::Attributes => "modify attributes",
            Phase::SecurityGroups => "set security groups",
            Phase::Subnets => "set subnets",
            Phase::IpAddressType => "set IP address type",
            Phase::Settle => "wait for active",
            Phase::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// Errors surfaced by lifecycle operations.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Remote resource is gone.
    #[error("load balancer {0} not found")]
    NotFound(String),

    /// Desired configuration cannot be applied as given.
    #[error("invalid configuration: {0}")]
    Validation(String),

    /// Malformed identifier or remote payload.
    #[error("format error: {0}")]
    Format(String),

    /// Create call returned something other than exactly one record.
    #[error("create of {name} returned {count} load balancers, expected exactly one")]
    Create { name: String, count: usize },

    #[error("{phase} failed for load balancer {arn}: {source}")]
    Remote {
        phase: Phase,
        arn: String,
        #[source]
        source: ApiError,
    },

    #[error(
        "timed out after {waited:?} waiting for load balancer {arn} ({phase}), \
         last status: {last_status}"
    )]
    Timeout {
        phase: Phase,
        arn: String,
        waited: Duration,
        last_status: String,
    },

    /// Settle saw a state that is neither pending nor the target.
    #[error("load balancer {arn} reached unexpected state {state}")]
    UnexpectedState { arn: String, state: String },

    /// Change cannot be applied in place; destroy and recreate instead.
    #[error("load balancer {arn} must be replaced to change {field}")]
    ReplacementRequired { arn: String, field: String },
}

impl ReconcileError {
    pub fn remote(phase: Phase, arn: impl Into<String>, source: ApiError) -> Self {
        ReconcileError::Remote {
            phase,
            arn: arn.into(),
            source,
        }
    }

    /// True for deadline failures, which callers usually want to report separately.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ReconcileError::Timeout { .. })
    }
}

/// Non-fatal failures of the delete-time cleanup.
#[derive(Debug, Error)]
pub enum CleanupWarning {
    #[error("cleanup of network interfaces for {arn} failed: {source}")]
    Remote {
        arn: String,
        #[source]
        source: ApiError,
    },

    #[error("{remaining} network interfaces of {arn} still present after {waited:?}")]
    Timeout {
        arn: String,
        remaining: usize,
        waited: Duration,
    },

    #[error("cannot derive interface description from {0}")]
    Format(String),
}

/// Result type for lifecycle operations.
pub type Result<T> = std::result::Result<T, ReconcileError>;
