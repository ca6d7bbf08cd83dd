//! Load balancer reconciliation.
//!
//! [`LoadBalancerReconciler`] compares declared state with what the
//! control plane reports and issues the calls to converge them. The
//! building blocks live in their own modules:
//! - `diff`: which calls an update needs, and when to replace instead
//! - `mapper`: wire records to the canonical model and back
//! - `wait`: poll until a load balancer settles
//! - `cleanup`: remove or wait out interfaces left behind by a delete

pub mod cleanup;
pub mod diff;
pub mod lifecycle;
pub mod mapper;
pub mod wait;

use async_trait::async_trait;
use tracing::warn;

use crate::error::Result;
use crate::model::DesiredLoadBalancer;

pub use cleanup::DeleteReport;
pub use diff::{TagChanges, UpdatePlan, plan_update, requires_replacement};
pub use lifecycle::{ConvergeAction, Converged, LoadBalancerReconciler};
pub use wait::{Poll, PollPolicy, WaitError, poll_until_settled};

/// Trait for resource reconcilers.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Declared state.
    type Spec;
    /// Observed state after reconciling.
    type Status;

    /// Converge the resource `id` (absent when not created yet) to `spec`.
    /// `prior` is the previously applied spec, if known.
    async fn reconcile(
        &self,
        id: Option<&str>,
        prior: Option<&Self::Spec>,
        spec: &Self::Spec,
    ) -> Result<Self::Status>;

    /// Handle resource deletion (finalization).
    async fn finalize(&self, id: &str) -> Result<()>;
}

#[async_trait]
impl Reconciler for LoadBalancerReconciler {
    type Spec = DesiredLoadBalancer;
    type Status = Converged;

    async fn reconcile(
        &self,
        id: Option<&str>,
        prior: Option<&Self::Spec>,
        spec: &Self::Spec,
    ) -> Result<Self::Status> {
        self.converge(id, prior, spec).await
    }

    async fn finalize(&self, id: &str) -> Result<()> {
        let report = self.delete(id).await?;
        if !report.is_clean() {
            warn!(arn = %id, warnings = report.warnings.len(), "deleted with cleanup warnings");
        }
        Ok(())
    }
}
