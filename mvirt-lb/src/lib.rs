//! mvirt-lb: load balancer reconciliation engine.
//!
//! Converges a declared load balancer with a remote, eventually consistent
//! control plane: create and wait for it to settle, read it back, update
//! in place or signal replacement, and delete it while cleaning up the
//! network interfaces it leaves behind.

pub mod arn;
pub mod clients;
pub mod clock;
pub mod config;
pub mod error;
pub mod model;
pub mod reconciler;

pub use config::ReconcilerConfig;
pub use error::{CleanupWarning, Phase, ReconcileError, Result};
pub use model::{DesiredLoadBalancer, LoadBalancer};
pub use reconciler::{DeleteReport, LoadBalancerReconciler, Reconciler};
