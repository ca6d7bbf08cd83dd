//! Load balancer lifecycle: create, read, update, delete and converge.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::cleanup::{DeleteReport, cleanup_owned_interfaces, wait_for_platform_interfaces};
use super::diff::{UpdatePlan, plan_update, requires_replacement};
use super::mapper::{self, RemoteView};
use super::wait::{Poll, WaitError, poll_until_settled};
use crate::clients::{ApiError, LoadBalancerApi, LoadBalancerState, NetworkInterfaceApi, Tag};
use crate::clock::{Clock, TokioClock};
use crate::config::ReconcilerConfig;
use crate::error::{Phase, ReconcileError, Result};
use crate::model::{
    AttachmentKind, DesiredLoadBalancer, LoadBalancer, NetworkAttachments, Scheme, Variant,
};

/// What [`LoadBalancerReconciler::converge`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConvergeAction {
    Created,
    Updated,
    Replaced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Converged {
    pub action: ConvergeAction,
    pub load_balancer: LoadBalancer,
}

/// Drives one load balancer through its lifecycle against the remote API.
///
/// Holds no state between calls; every operation reads what it needs.
pub struct LoadBalancerReconciler {
    elb: Arc<dyn LoadBalancerApi>,
    eni: Arc<dyn NetworkInterfaceApi>,
    clock: Arc<dyn Clock>,
    config: ReconcilerConfig,
}

impl LoadBalancerReconciler {
    pub fn new(
        elb: Arc<dyn LoadBalancerApi>,
        eni: Arc<dyn NetworkInterfaceApi>,
        config: ReconcilerConfig,
    ) -> Self {
        Self::with_clock(elb, eni, Arc::new(TokioClock), config)
    }

    pub fn with_clock(
        elb: Arc<dyn LoadBalancerApi>,
        eni: Arc<dyn NetworkInterfaceApi>,
        clock: Arc<dyn Clock>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            elb,
            eni,
            clock,
            config,
        }
    }

    /// Create a load balancer and converge its attributes.
    ///
    /// The create call carries name, placement, security groups, IP
    /// address type and tags; once active, the attributes the create call
    /// cannot carry are pushed and the load balancer is awaited again.
    pub async fn create(&self, desired: &DesiredLoadBalancer) -> Result<LoadBalancer> {
        desired.validate()?;

        let name = desired.resolve_name(&self.config.default_name_prefix);
        info!(name = %name, variant = %desired.variant(), "creating load balancer");

        let request = mapper::create_request(desired, &name);
        debug!(?request, "create request");
        let mut created = self
            .elb
            .create_load_balancer(request)
            .await
            .map_err(|e| ReconcileError::remote(Phase::Create, &name, e))?;
        if created.len() != 1 {
            return Err(ReconcileError::Create {
                name,
                count: created.len(),
            });
        }
        let arn = created.remove(0).arn;
        info!(arn = %arn, "load balancer created, waiting for it to become active");

        self.wait_for_active(&arn, Phase::Create, self.config.create_timeout)
            .await?;

        let plan = plan_update(None, desired, true);
        if !plan.is_empty() {
            self.apply_plan(&arn, &plan).await?;
            self.wait_for_active(&arn, Phase::Update, self.config.update_timeout)
                .await?;
        }

        self.read_as(&arn, desired.attachments.kind())
            .await?
            .ok_or_else(|| ReconcileError::NotFound(arn.clone()))
    }

    /// Read a load balancer; `None` when it no longer exists.
    ///
    /// The attachment representation is inferred from the zone records.
    pub async fn read(&self, arn: &str) -> Result<Option<LoadBalancer>> {
        match self.fetch(arn).await? {
            Some(view) => {
                let kind = mapper::detect_attachment_kind(&view.load_balancer.availability_zones);
                mapper::decode(&view, kind).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Read a load balancer decoding attachments as `kind`.
    pub async fn read_as(&self, arn: &str, kind: AttachmentKind) -> Result<Option<LoadBalancer>> {
        match self.fetch(arn).await? {
            Some(view) => mapper::decode(&view, kind).map(Some),
            None => Ok(None),
        }
    }

    /// Apply the change from `old` to `new` in place.
    ///
    /// Refuses with [`ReconcileError::ReplacementRequired`] before any
    /// remote call when the change needs a new load balancer. Steps run in
    /// order and the first failing one aborts the update.
    pub async fn update(
        &self,
        arn: &str,
        old: &DesiredLoadBalancer,
        new: &DesiredLoadBalancer,
    ) -> Result<LoadBalancer> {
        new.validate()?;

        let immutable = old.immutable_changes(new);
        if !immutable.is_empty() {
            return Err(ReconcileError::ReplacementRequired {
                arn: arn.to_string(),
                field: immutable.join(", "),
            });
        }

        let plan = plan_update(Some(old), new, false);
        if plan.force_replace {
            return Err(ReconcileError::ReplacementRequired {
                arn: arn.to_string(),
                field: "attachments".to_string(),
            });
        }

        if plan.is_empty() {
            debug!(arn = %arn, "load balancer already up to date");
        } else {
            info!(arn = %arn, "updating load balancer");
            self.apply_plan(arn, &plan).await?;
            self.wait_for_active(arn, Phase::Update, self.config.update_timeout)
                .await?;
        }

        self.read_as(arn, new.attachments.kind())
            .await?
            .ok_or_else(|| ReconcileError::NotFound(arn.to_string()))
    }

    /// Delete a load balancer, then clean up the interfaces it leaves behind.
    ///
    /// Succeeds once the delete call does (or the load balancer is already
    /// gone); cleanup problems are logged and returned in the report.
    pub async fn delete(&self, arn: &str) -> Result<DeleteReport> {
        info!(arn = %arn, "deleting load balancer");
        match self.elb.delete_load_balancer(arn).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                warn!(arn = %arn, "load balancer already deleted");
            }
            Err(e) => return Err(ReconcileError::remote(Phase::Delete, arn, e)),
        }

        let mut report = DeleteReport::default();
        match cleanup_owned_interfaces(self.eni.as_ref(), arn).await {
            Ok(removed) => report.interfaces_removed = removed,
            Err(warning) => {
                warn!(arn = %arn, error = %warning, "network interface cleanup failed");
                report.warnings.push(warning);
            }
        }
        if let Err(warning) = wait_for_platform_interfaces(
            self.eni.as_ref(),
            self.clock.as_ref(),
            arn,
            self.config.delete_timeout,
            self.config.cleanup_retry_interval,
        )
        .await
        {
            warn!(arn = %arn, error = %warning, "platform network interfaces not released");
            report.warnings.push(warning);
        }

        info!(arn = %arn, interfaces_removed = report.interfaces_removed, "load balancer deleted");
        Ok(report)
    }

    /// Whether changing attachments from `old` to `new` needs a new load balancer.
    pub fn requires_replacement(
        &self,
        variant: Variant,
        old: Option<&NetworkAttachments>,
        new: &NetworkAttachments,
    ) -> bool {
        requires_replacement(variant, old, new)
    }

    /// Bring the remote state in line with `desired`.
    ///
    /// Creates when there is no load balancer, replaces (delete then
    /// create) when the change cannot be applied in place, updates
    /// otherwise. Without `prior`, the observed state stands in for it.
    pub async fn converge(
        &self,
        arn: Option<&str>,
        prior: Option<&DesiredLoadBalancer>,
        desired: &DesiredLoadBalancer,
    ) -> Result<Converged> {
        let observed = match arn {
            Some(arn) => self.read_as(arn, desired.attachments.kind()).await?,
            None => None,
        };
        let (Some(arn), Some(observed)) = (arn, observed) else {
            let load_balancer = self.create(desired).await?;
            return Ok(Converged {
                action: ConvergeAction::Created,
                load_balancer,
            });
        };

        let prior = match prior {
            Some(prior) => prior.clone(),
            None => observed_as_prior(&observed, desired),
        };

        let replace = !prior.immutable_changes(desired).is_empty()
            || requires_replacement(
                desired.variant(),
                Some(&prior.attachments),
                &desired.attachments,
            );
        if replace {
            info!(arn = %arn, "load balancer must be replaced");
            self.delete(arn).await?;
            let load_balancer = self.create(desired).await?;
            return Ok(Converged {
                action: ConvergeAction::Replaced,
                load_balancer,
            });
        }

        let load_balancer = self.update(arn, &prior, desired).await?;
        Ok(Converged {
            action: ConvergeAction::Updated,
            load_balancer,
        })
    }

    /// Describe plus attributes and tags. A load balancer that vanishes
    /// between the calls reads as absent.
    async fn fetch(&self, arn: &str) -> Result<Option<RemoteView>> {
        let described = self.elb.describe_load_balancer(arn).await;
        let load_balancer = match absent_if_not_found(arn, described)? {
            Some(Some(lb)) => lb,
            Some(None) | None => {
                warn!(arn = %arn, "load balancer not found, treating as deleted");
                return Ok(None);
            }
        };

        let attributes = self.elb.describe_attributes(arn).await;
        let Some(attributes) = absent_if_not_found(arn, attributes)? else {
            warn!(arn = %arn, "load balancer disappeared while reading attributes");
            return Ok(None);
        };
        let tags = self.elb.describe_tags(arn).await;
        let Some(tags) = absent_if_not_found(arn, tags)? else {
            warn!(arn = %arn, "load balancer disappeared while reading tags");
            return Ok(None);
        };

        Ok(Some(RemoteView {
            load_balancer,
            attributes,
            tags,
        }))
    }

    async fn apply_plan(&self, arn: &str, plan: &UpdatePlan) -> Result<()> {
        let remote = |phase: Phase| move |e: ApiError| ReconcileError::remote(phase, arn, e);

        if let Some(tags) = &plan.tags {
            if !tags.remove.is_empty() {
                debug!(arn = %arn, keys = ?tags.remove, "removing tags");
                self.elb
                    .remove_tags(arn, tags.remove.iter().cloned().collect())
                    .await
                    .map_err(remote(Phase::Tags))?;
            }
            if !tags.add.is_empty() {
                debug!(arn = %arn, keys = ?tags.add.keys().collect::<Vec<_>>(), "adding tags");
                let add = tags
                    .add
                    .iter()
                    .map(|(k, v)| Tag {
                        key: k.clone(),
                        value: v.clone(),
                    })
                    .collect();
                self.elb
                    .add_tags(arn, add)
                    .await
                    .map_err(remote(Phase::Tags))?;
            }
        }

        if !plan.attributes.is_empty() {
            debug!(arn = %arn, attributes = ?plan.attributes, "modifying attributes");
            self.elb
                .modify_attributes(arn, plan.attributes.clone())
                .await
                .map_err(remote(Phase::Attributes))?;
        }

        if let Some(groups) = &plan.security_groups {
            debug!(arn = %arn, ?groups, "setting security groups");
            self.elb
                .set_security_groups(arn, groups.iter().cloned().collect())
                .await
                .map_err(remote(Phase::SecurityGroups))?;
        }

        if let Some(attachments) = &plan.subnets {
            debug!(arn = %arn, ?attachments, "setting subnets");
            self.elb
                .set_subnets(arn, mapper::subnet_selection(attachments))
                .await
                .map_err(remote(Phase::Subnets))?;
        }

        if let Some(ip_address_type) = plan.ip_address_type {
            debug!(
                arn = %arn,
                ip_address_type = ip_address_type.as_str(),
                "setting IP address type"
            );
            self.elb
                .set_ip_address_type(arn, ip_address_type.as_str())
                .await
                .map_err(remote(Phase::IpAddressType))?;
        }

        Ok(())
    }

    /// Block until the load balancer reports `active`.
    async fn wait_for_active(&self, arn: &str, phase: Phase, timeout: Duration) -> Result<()> {
        let elb = self.elb.as_ref();
        let outcome = poll_until_settled(self.clock.as_ref(), &self.config.settle, timeout, || {
            probe_state(elb, arn)
        })
        .await;

        match outcome {
            Ok(()) => {
                info!(arn = %arn, "load balancer active");
                Ok(())
            }
            Err(WaitError::Timeout {
                waited,
                last_status,
            }) => Err(ReconcileError::Timeout {
                phase,
                arn: arn.to_string(),
                waited,
                last_status,
            }),
            Err(WaitError::Failed(e)) => Err(e),
        }
    }
}

fn absent_if_not_found<T>(
    arn: &str,
    result: std::result::Result<T, ApiError>,
) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(ReconcileError::remote(Phase::Read, arn, e)),
    }
}

/// One settle read: `active` is ready, `provisioning` and `failed` are
/// pending, anything else ends the wait.
async fn probe_state(elb: &dyn LoadBalancerApi, arn: &str) -> Result<Poll<()>> {
    let lb = elb
        .describe_load_balancer(arn)
        .await
        .map_err(|e| ReconcileError::remote(Phase::Settle, arn, e))?
        .ok_or_else(|| ReconcileError::NotFound(arn.to_string()))?;
    match lb.state {
        LoadBalancerState::Active => Ok(Poll::Ready(())),
        LoadBalancerState::Provisioning | LoadBalancerState::Failed => {
            Ok(Poll::Pending(lb.state.as_str().to_string()))
        }
        other => Err(ReconcileError::UnexpectedState {
            arn: arn.to_string(),
            state: other.as_str().to_string(),
        }),
    }
}

/// Declared-state equivalent of what is deployed, for converging without
/// a recorded prior. Naming follows `desired` since a generated name
/// cannot be traced back to its prefix.
fn observed_as_prior(
    observed: &LoadBalancer,
    desired: &DesiredLoadBalancer,
) -> DesiredLoadBalancer {
    let access_logs = &observed.access_logs;
    DesiredLoadBalancer {
        name: desired.name.as_ref().map(|_| observed.name.clone()),
        name_prefix: desired.name_prefix.clone(),
        internal: observed.scheme == Scheme::Internal,
        variant: observed.settings.clone(),
        attachments: observed.attachments.clone(),
        security_groups: observed.security_groups.clone(),
        ip_address_type: Some(observed.ip_address_type),
        customer_owned_ipv4_pool: observed.customer_owned_ipv4_pool.clone(),
        deletion_protection: observed.deletion_protection,
        access_logs: (access_logs.enabled || !access_logs.bucket.is_empty())
            .then(|| access_logs.clone()),
        tags: observed.tags.clone(),
    }
}
