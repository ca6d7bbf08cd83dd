//! Delete-time cleanup of network interfaces a load balancer leaves behind.
//!
//! Two classes of interface exist:
//! - owned by the load balancing service: we detach and delete them ourselves
//! - owned by the platform: we may not touch them, only wait until they are gone
//!
//! Neither failure fails a delete; both surface as [`CleanupWarning`].

use std::time::Duration;

use tracing::{debug, info};

use crate::arn::arn_suffix;
use crate::clients::eni::{
    LB_INTERFACE_OWNER, PLATFORM_ATTACHMENT_PREFIX, PLATFORM_INTERFACE_OWNER,
};
use crate::clients::{ApiError, InterfaceFilter, NetworkInterfaceApi};
use super::wait::time_left;
use crate::clock::Clock;
use crate::error::CleanupWarning;

/// Outcome of a successful delete.
#[derive(Debug, Default)]
pub struct DeleteReport {
    /// Owned interfaces detached and deleted.
    pub interfaces_removed: usize,
    pub warnings: Vec<CleanupWarning>,
}

impl DeleteReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Interface description the control plane uses for a load balancer.
pub fn interface_description(arn: &str) -> Result<String, CleanupWarning> {
    arn_suffix(arn)
        .map(|suffix| format!("ELB {suffix}"))
        .map_err(|_| CleanupWarning::Format(arn.to_string()))
}

/// Detach and delete every owned interface of `arn` in a single pass.
///
/// Stops at the first failing call. Returns how many interfaces were deleted.
pub async fn cleanup_owned_interfaces(
    eni: &dyn NetworkInterfaceApi,
    arn: &str,
) -> Result<usize, CleanupWarning> {
    let remote = |source: ApiError| CleanupWarning::Remote {
        arn: arn.to_string(),
        source,
    };

    let filters = [
        InterfaceFilter::new(InterfaceFilter::INSTANCE_OWNER, LB_INTERFACE_OWNER),
        InterfaceFilter::new(InterfaceFilter::DESCRIPTION, interface_description(arn)?),
    ];
    let interfaces = eni
        .describe_network_interfaces(&filters)
        .await
        .map_err(remote)?;

    let mut removed = 0;
    for interface in &interfaces {
        if let Some(attachment) = &interface.attachment {
            debug!(interface = %interface.id, attachment = %attachment.attachment_id, "detaching");
            eni.detach_network_interface(&attachment.attachment_id, true)
                .await
                .map_err(remote)?;
        }
        eni.delete_network_interface(&interface.id)
            .await
            .map_err(remote)?;
        removed += 1;
    }

    if removed > 0 {
        info!(arn = %arn, removed, "deleted load balancer network interfaces");
    }
    Ok(removed)
}

/// Wait for the platform to remove its interfaces of `arn`.
///
/// Re-queries every `retry_interval` until none remain. After `timeout`
/// one final query decides: leftovers become [`CleanupWarning::Timeout`].
pub async fn wait_for_platform_interfaces(
    eni: &dyn NetworkInterfaceApi,
    clock: &dyn Clock,
    arn: &str,
    timeout: Duration,
    retry_interval: Duration,
) -> Result<(), CleanupWarning> {
    let filters = [
        InterfaceFilter::new(InterfaceFilter::INSTANCE_OWNER, PLATFORM_INTERFACE_OWNER),
        InterfaceFilter::new(
            InterfaceFilter::ATTACHMENT_ID,
            format!("{PLATFORM_ATTACHMENT_PREFIX}*"),
        ),
        InterfaceFilter::new(InterfaceFilter::DESCRIPTION, interface_description(arn)?),
    ];

    let start = clock.now();
    let deadline = start.checked_add(timeout);
    loop {
        let remaining = eni
            .describe_network_interfaces(&filters)
            .await
            .map_err(|source| CleanupWarning::Remote {
                arn: arn.to_string(),
                source,
            })?
            .len();
        if remaining == 0 {
            return Ok(());
        }

        let left = time_left(deadline, clock.now());
        if left.is_zero() {
            return Err(CleanupWarning::Timeout {
                arn: arn.to_string(),
                remaining,
                waited: clock.now() - start,
            });
        }
        debug!(arn = %arn, remaining, "waiting for platform interfaces to detach");
        clock.sleep(retry_interval.min(left)).await;
    }
}
