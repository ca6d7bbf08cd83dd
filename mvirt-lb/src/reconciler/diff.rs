//! Attribute diff policy.
//!
//! Turns a desired-state change into the remote calls needed to apply it,
//! and decides when an attachment change can only be realised by
//! replacing the load balancer.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::clients::Attribute;
use crate::clients::elb::keys;
use crate::model::{
    AccessLogs, DesiredLoadBalancer, IpAddressType, NetworkAttachments, Variant, VariantSettings,
    managed_tags,
};

/// Tag calls: removals are sent before additions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TagChanges {
    pub remove: BTreeSet<String>,
    pub add: BTreeMap<String, String>,
}

impl TagChanges {
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.add.is_empty()
    }
}

/// Everything an update has to send, in the order it is sent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpdatePlan {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<TagChanges>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<Attribute>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_groups: Option<BTreeSet<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnets: Option<NetworkAttachments>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address_type: Option<IpAddressType>,
    /// Attachments changed on a variant that cannot move them in place.
    pub force_replace: bool,
}

impl UpdatePlan {
    /// True when applying the plan would not issue any remote call.
    pub fn is_empty(&self) -> bool {
        self.tags.is_none()
            && self.attributes.is_empty()
            && self.security_groups.is_none()
            && self.subnets.is_none()
            && self.ip_address_type.is_none()
    }
}

/// Compute the update plan for `desired`.
///
/// `prior` is the previously declared state, `None` when there is none.
/// `is_new` marks the update chained right after a create: variant
/// attributes and deletion protection are pushed unconditionally, while
/// tags, security groups, subnets and IP address type are skipped since
/// the create request already carried them. Re-sending them would not
/// change the result, so the chained update never issues those calls.
pub fn plan_update(
    prior: Option<&DesiredLoadBalancer>,
    desired: &DesiredLoadBalancer,
    is_new: bool,
) -> UpdatePlan {
    let mut plan = UpdatePlan::default();

    let prior_logs = prior.and_then(|p| p.access_logs.as_ref());
    if prior_logs != desired.access_logs.as_ref() {
        plan.attributes
            .extend(access_log_attributes(desired.access_logs.as_ref()));
    }

    let prior_settings = prior.map(|p| &p.variant);
    plan.attributes
        .extend(variant_attributes(prior_settings, &desired.variant, is_new));

    if is_new || prior.is_none_or(|p| p.deletion_protection != desired.deletion_protection) {
        plan.attributes.push(Attribute::new(
            keys::DELETION_PROTECTION,
            desired.deletion_protection.to_string(),
        ));
    }

    let Some(prior) = prior.filter(|_| !is_new) else {
        return plan;
    };

    let tags = diff_tags(&prior.tags, &desired.tags);
    if !tags.is_empty() {
        plan.tags = Some(tags);
    }

    if prior.security_groups != desired.security_groups {
        plan.security_groups = Some(desired.security_groups.clone());
    }

    if !prior.attachments.same_placement(&desired.attachments) {
        if desired.variant().subnets_force_replacement() {
            plan.force_replace = true;
        } else {
            plan.subnets = Some(desired.attachments.clone());
        }
    }

    if let Some(ip) = desired.ip_address_type
        && prior.ip_address_type != Some(ip)
    {
        plan.ip_address_type = Some(ip);
    }

    plan
}

/// Whether moving from `old` to `new` attachments needs a replacement.
///
/// `old` is `None` when the load balancer does not exist yet.
pub fn requires_replacement(
    variant: Variant,
    old: Option<&NetworkAttachments>,
    new: &NetworkAttachments,
) -> bool {
    match old {
        Some(old) => variant.subnets_force_replacement() && !old.same_placement(new),
        None => false,
    }
}

/// Tags to remove and to add or overwrite, ignoring system tags.
pub fn diff_tags(old: &BTreeMap<String, String>, new: &BTreeMap<String, String>) -> TagChanges {
    let old = managed_tags(old);
    let new = managed_tags(new);

    let remove = old
        .keys()
        .filter(|k| !new.contains_key(*k))
        .cloned()
        .collect();
    let add = new
        .iter()
        .filter(|(k, v)| old.get(*k) != Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    TagChanges { remove, add }
}

/// Access log attributes. Bucket and prefix are only sent when enabling.
pub fn access_log_attributes(logs: Option<&AccessLogs>) -> Vec<Attribute> {
    match logs {
        Some(logs) if logs.enabled => vec![
            Attribute::new(keys::ACCESS_LOGS_ENABLED, "true"),
            Attribute::new(keys::ACCESS_LOGS_BUCKET, logs.bucket.clone()),
            Attribute::new(keys::ACCESS_LOGS_PREFIX, logs.prefix.clone()),
        ],
        _ => vec![Attribute::new(keys::ACCESS_LOGS_ENABLED, "false")],
    }
}

fn variant_attributes(
    prior: Option<&VariantSettings>,
    desired: &VariantSettings,
    is_new: bool,
) -> Vec<Attribute> {
    let mut attrs = Vec::new();
    match desired {
        VariantSettings::Application(app) => {
            let old = match prior {
                Some(VariantSettings::Application(old)) if !is_new => Some(old),
                _ => None,
            };
            if old.is_none_or(|o| o.idle_timeout_secs != app.idle_timeout_secs) {
                attrs.push(Attribute::new(
                    keys::IDLE_TIMEOUT,
                    app.idle_timeout_secs.to_string(),
                ));
            }
            if old.is_none_or(|o| o.http2_enabled != app.http2_enabled) {
                attrs.push(Attribute::new(
                    keys::HTTP2_ENABLED,
                    app.http2_enabled.to_string(),
                ));
            }
            if old.is_none_or(|o| o.drop_invalid_header_fields != app.drop_invalid_header_fields)
            {
                attrs.push(Attribute::new(
                    keys::DROP_INVALID_HEADER_FIELDS,
                    app.drop_invalid_header_fields.to_string(),
                ));
            }
        }
        VariantSettings::Network(zonal) | VariantSettings::Gateway(zonal) => {
            let old = match prior {
                Some(VariantSettings::Network(old) | VariantSettings::Gateway(old)) if !is_new => {
                    Some(old)
                }
                _ => None,
            };
            if old.is_none_or(|o| o.cross_zone_load_balancing != zonal.cross_zone_load_balancing) {
                attrs.push(Attribute::new(
                    keys::CROSS_ZONE,
                    zonal.cross_zone_load_balancing.to_string(),
                ));
            }
        }
    }
    attrs
}
