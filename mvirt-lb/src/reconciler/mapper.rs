//! Remote state mapper: wire records to [`LoadBalancer`] and back.

use crate::arn::arn_suffix;
use crate::clients::elb::keys;
use crate::clients::{
    Attribute, AvailabilityZone, CreateLoadBalancerRequest, LoadBalancerAddress,
    LoadBalancerState, RemoteLoadBalancer, SubnetMappingRequest, SubnetSelection, Tag,
};
use crate::error::{ReconcileError, Result};
use crate::model::{
    AccessLogs, AttachmentKind, DesiredLoadBalancer, LoadBalancer, NetworkAttachments, Scheme,
    SubnetMapping, Variant, VariantSettings, is_system_tag,
};

/// Everything a read gathers about one load balancer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteView {
    pub load_balancer: RemoteLoadBalancer,
    pub attributes: Vec<Attribute>,
    pub tags: Vec<Tag>,
}

/// Mappings when any zone carries an address or an outpost, plain subnets otherwise.
pub fn detect_attachment_kind(zones: &[AvailabilityZone]) -> AttachmentKind {
    if zones
        .iter()
        .any(|z| !z.addresses.is_empty() || z.outpost_id.is_some())
    {
        AttachmentKind::SubnetMappings
    } else {
        AttachmentKind::Subnets
    }
}

pub fn decode(view: &RemoteView, kind: AttachmentKind) -> Result<LoadBalancer> {
    let remote = &view.load_balancer;
    let variant: Variant = remote.lb_type.parse()?;
    let scheme = match remote.scheme.as_str() {
        "internal" => Scheme::Internal,
        "internet-facing" => Scheme::InternetFacing,
        other => {
            return Err(ReconcileError::Format(format!("unknown scheme: {other}")));
        }
    };
    let attrs = decode_attributes(variant, &view.attributes)?;

    Ok(LoadBalancer {
        arn: remote.arn.clone(),
        arn_suffix: arn_suffix(&remote.arn)?,
        name: remote.name.clone(),
        scheme,
        settings: attrs.settings,
        attachments: decode_attachments(&remote.availability_zones, kind),
        security_groups: remote.security_groups.iter().cloned().collect(),
        ip_address_type: remote.ip_address_type.parse()?,
        customer_owned_ipv4_pool: remote
            .customer_owned_ipv4_pool
            .clone()
            .filter(|p| !p.is_empty()),
        deletion_protection: attrs.deletion_protection,
        access_logs: attrs.access_logs,
        tags: view
            .tags
            .iter()
            .filter(|t| !is_system_tag(&t.key))
            .map(|t| (t.key.clone(), t.value.clone()))
            .collect(),
        dns_name: remote.dns_name.clone(),
        zone_id: remote.canonical_hosted_zone_id.clone(),
        vpc_id: remote.vpc_id.clone(),
    })
}

/// Zone records to attachments. Addresses only fill in fields they carry;
/// with several addresses per zone the later present value wins.
pub fn decode_attachments(zones: &[AvailabilityZone], kind: AttachmentKind) -> NetworkAttachments {
    match kind {
        AttachmentKind::Subnets => {
            NetworkAttachments::Subnets(zones.iter().map(|z| z.subnet_id.clone()).collect())
        }
        AttachmentKind::SubnetMappings => NetworkAttachments::SubnetMappings(
            zones
                .iter()
                .map(|zone| {
                    let mut mapping = SubnetMapping::new(zone.subnet_id.clone());
                    mapping.outpost_id = zone.outpost_id.clone();
                    for address in &zone.addresses {
                        if let Some(id) = &address.allocation_id {
                            mapping.allocation_id = Some(id.clone());
                        }
                        if let Some(ip) = &address.private_ipv4_address {
                            mapping.private_ipv4_address = Some(ip.clone());
                        }
                        if let Some(ip) = &address.ipv6_address {
                            mapping.ipv6_address = Some(ip.clone());
                        }
                    }
                    mapping
                })
                .collect(),
        ),
    }
}

/// Structured view of the attribute list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedAttributes {
    pub settings: VariantSettings,
    pub deletion_protection: bool,
    pub access_logs: AccessLogs,
}

/// Decode known attribute keys; keys that are unknown or do not apply to
/// `variant` are ignored.
pub fn decode_attributes(variant: Variant, attributes: &[Attribute]) -> Result<DecodedAttributes> {
    let mut decoded = DecodedAttributes {
        settings: VariantSettings::defaults_for(variant),
        deletion_protection: false,
        access_logs: AccessLogs::default(),
    };

    for Attribute { key, value } in attributes {
        match (key.as_str(), &mut decoded.settings) {
            (keys::ACCESS_LOGS_ENABLED, _) => decoded.access_logs.enabled = parse_bool(key, value)?,
            (keys::ACCESS_LOGS_BUCKET, _) => decoded.access_logs.bucket = value.clone(),
            (keys::ACCESS_LOGS_PREFIX, _) => decoded.access_logs.prefix = value.clone(),
            (keys::DELETION_PROTECTION, _) => decoded.deletion_protection = parse_bool(key, value)?,
            (keys::IDLE_TIMEOUT, VariantSettings::Application(app)) => {
                app.idle_timeout_secs = value.parse().map_err(|_| {
                    ReconcileError::Format(format!("attribute {key}: invalid number {value:?}"))
                })?;
            }
            (keys::HTTP2_ENABLED, VariantSettings::Application(app)) => {
                app.http2_enabled = parse_bool(key, value)?;
            }
            (keys::DROP_INVALID_HEADER_FIELDS, VariantSettings::Application(app)) => {
                app.drop_invalid_header_fields = parse_bool(key, value)?;
            }
            (
                keys::CROSS_ZONE,
                VariantSettings::Network(zonal) | VariantSettings::Gateway(zonal),
            ) => {
                zonal.cross_zone_load_balancing = parse_bool(key, value)?;
            }
            _ => {}
        }
    }

    Ok(decoded)
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(ReconcileError::Format(format!(
            "attribute {key}: invalid boolean {other:?}"
        ))),
    }
}

/// Inverse of [`decode`] for a settled load balancer.
pub fn encode(lb: &LoadBalancer) -> RemoteView {
    let load_balancer = RemoteLoadBalancer {
        arn: lb.arn.clone(),
        name: lb.name.clone(),
        lb_type: lb.variant().as_str().to_string(),
        scheme: lb.scheme.as_str().to_string(),
        state: LoadBalancerState::Active,
        vpc_id: lb.vpc_id.clone(),
        dns_name: lb.dns_name.clone(),
        canonical_hosted_zone_id: lb.zone_id.clone(),
        security_groups: lb.security_groups.iter().cloned().collect(),
        availability_zones: encode_attachments(&lb.attachments),
        ip_address_type: lb.ip_address_type.as_str().to_string(),
        customer_owned_ipv4_pool: lb.customer_owned_ipv4_pool.clone(),
    };

    let mut attributes = vec![
        Attribute::new(keys::ACCESS_LOGS_ENABLED, lb.access_logs.enabled.to_string()),
        Attribute::new(keys::ACCESS_LOGS_BUCKET, lb.access_logs.bucket.clone()),
        Attribute::new(keys::ACCESS_LOGS_PREFIX, lb.access_logs.prefix.clone()),
        Attribute::new(keys::DELETION_PROTECTION, lb.deletion_protection.to_string()),
    ];
    match &lb.settings {
        VariantSettings::Application(app) => {
            attributes.push(Attribute::new(
                keys::IDLE_TIMEOUT,
                app.idle_timeout_secs.to_string(),
            ));
            attributes.push(Attribute::new(
                keys::HTTP2_ENABLED,
                app.http2_enabled.to_string(),
            ));
            attributes.push(Attribute::new(
                keys::DROP_INVALID_HEADER_FIELDS,
                app.drop_invalid_header_fields.to_string(),
            ));
        }
        VariantSettings::Network(zonal) | VariantSettings::Gateway(zonal) => {
            attributes.push(Attribute::new(
                keys::CROSS_ZONE,
                zonal.cross_zone_load_balancing.to_string(),
            ));
        }
    }

    let tags = lb
        .tags
        .iter()
        .map(|(k, v)| Tag {
            key: k.clone(),
            value: v.clone(),
        })
        .collect();

    RemoteView {
        load_balancer,
        attributes,
        tags,
    }
}

fn encode_attachments(attachments: &NetworkAttachments) -> Vec<AvailabilityZone> {
    match attachments {
        NetworkAttachments::Subnets(ids) => ids
            .iter()
            .map(|id| AvailabilityZone {
                subnet_id: id.clone(),
                ..Default::default()
            })
            .collect(),
        NetworkAttachments::SubnetMappings(mappings) => mappings
            .iter()
            .map(|m| {
                let address = LoadBalancerAddress {
                    allocation_id: m.allocation_id.clone(),
                    private_ipv4_address: m.private_ipv4_address.clone(),
                    ipv6_address: m.ipv6_address.clone(),
                };
                AvailabilityZone {
                    zone_name: String::new(),
                    subnet_id: m.subnet_id.clone(),
                    outpost_id: m.outpost_id.clone(),
                    addresses: if address == LoadBalancerAddress::default() {
                        Vec::new()
                    } else {
                        vec![address]
                    },
                }
            })
            .collect(),
    }
}

/// Attachments in the shape create and set-subnets expect.
pub fn subnet_selection(attachments: &NetworkAttachments) -> SubnetSelection {
    match attachments {
        NetworkAttachments::Subnets(ids) => SubnetSelection::Subnets(ids.iter().cloned().collect()),
        NetworkAttachments::SubnetMappings(mappings) => SubnetSelection::Mappings(
            mappings
                .iter()
                .map(|m| SubnetMappingRequest {
                    subnet_id: m.subnet_id.clone(),
                    allocation_id: m.allocation_id.clone(),
                    private_ipv4_address: m.private_ipv4_address.clone(),
                    ipv6_address: m.ipv6_address.clone(),
                })
                .collect(),
        ),
    }
}

pub fn create_request(desired: &DesiredLoadBalancer, name: &str) -> CreateLoadBalancerRequest {
    CreateLoadBalancerRequest {
        name: name.to_string(),
        lb_type: desired.variant().as_str().to_string(),
        scheme: Some(desired.scheme().as_str().to_string()),
        subnets: subnet_selection(&desired.attachments),
        security_groups: desired.security_groups.iter().cloned().collect(),
        ip_address_type: desired.ip_address_type.map(|t| t.as_str().to_string()),
        customer_owned_ipv4_pool: desired.customer_owned_ipv4_pool.clone(),
        tags: desired
            .managed_tags()
            .into_iter()
            .map(|(key, value)| Tag { key, value })
            .collect(),
    }
}
