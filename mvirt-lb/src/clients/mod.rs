//! Clients for the remote control plane.
//!
//! The reconciler talks to two services:
//! - load balancing: create, describe, modify and delete load balancers
//! - network interfaces: side-effect interfaces left behind by a load balancer
//!
//! Both are traits so the reconciler can be driven by any transport;
//! [`InMemoryCloud`] implements both for tests and simulation.

pub mod elb;
pub mod eni;
pub mod memory;

use thiserror::Error;

pub use elb::{
    Attribute, AvailabilityZone, CreateLoadBalancerRequest, LoadBalancerAddress,
    LoadBalancerApi, LoadBalancerState, RemoteLoadBalancer, SubnetMappingRequest,
    SubnetSelection, Tag,
};
pub use eni::{InterfaceAttachment, InterfaceFilter, NetworkInterface, NetworkInterfaceApi};
pub use memory::{ApiCall, InMemoryCloud, SimulationOptions};

/// Errors returned by the remote API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("operation not permitted: {0}")]
    OperationNotPermitted(String),

    #[error("request throttled: {0}")]
    Throttled(String),

    #[error("{operation}: {message}")]
    Call {
        operation: &'static str,
        message: String,
    },
}

impl ApiError {
    pub fn call(operation: &'static str, message: impl Into<String>) -> Self {
        ApiError::Call {
            operation,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound(_))
    }
}

/// Result type for remote calls.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
