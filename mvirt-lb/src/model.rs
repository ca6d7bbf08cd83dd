//! Canonical load balancer model.
//!
//! [`DesiredLoadBalancer`] is what the caller declares, [`LoadBalancer`] is
//! what a remote read materialises. Neither is cached between operations.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{ReconcileError, Result};

/// Tag keys with this prefix belong to the platform and are never managed.
pub const SYSTEM_TAG_PREFIX: &str = "aws:";

pub const DEFAULT_IDLE_TIMEOUT_SECS: u32 = 60;

// =============================================================================
// Enums
// =============================================================================

/// Load balancer category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    Application,
    Network,
    Gateway,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Application => "application",
            Variant::Network => "network",
            Variant::Gateway => "gateway",
        }
    }

    /// Path segment used inside ARNs and interface descriptions.
    pub fn arn_path(&self) -> &'static str {
        match self {
            Variant::Application => "app",
            Variant::Network => "net",
            Variant::Gateway => "gwy",
        }
    }

    /// Network and gateway load balancers cannot move subnets in place.
    pub fn subnets_force_replacement(&self) -> bool {
        matches!(self, Variant::Network | Variant::Gateway)
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Variant {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "application" => Ok(Variant::Application),
            "network" => Ok(Variant::Network),
            "gateway" => Ok(Variant::Gateway),
            other => Err(ReconcileError::Format(format!(
                "unknown load balancer type: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scheme {
    Internal,
    #[default]
    InternetFacing,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Internal => "internal",
            Scheme::InternetFacing => "internet-facing",
        }
    }

    pub fn from_internal(internal: bool) -> Self {
        if internal {
            Scheme::Internal
        } else {
            Scheme::InternetFacing
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpAddressType {
    #[default]
    Ipv4,
    Dualstack,
}

impl IpAddressType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IpAddressType::Ipv4 => "ipv4",
            IpAddressType::Dualstack => "dualstack",
        }
    }
}

impl FromStr for IpAddressType {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ipv4" => Ok(IpAddressType::Ipv4),
            "dualstack" => Ok(IpAddressType::Dualstack),
            other => Err(ReconcileError::Format(format!(
                "unknown IP address type: {other}"
            ))),
        }
    }
}

// =============================================================================
// Variant-specific settings
// =============================================================================

/// Settings that only exist on application load balancers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationSettings {
    pub idle_timeout_secs: u32,
    pub http2_enabled: bool,
    pub drop_invalid_header_fields: bool,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            http2_enabled: true,
            drop_invalid_header_fields: false,
        }
    }
}

/// Settings shared by network and gateway load balancers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ZonalSettings {
    pub cross_zone_load_balancing: bool,
}

/// Variant plus the attributes applicable to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum VariantSettings {
    Application(ApplicationSettings),
    Network(ZonalSettings),
    Gateway(ZonalSettings),
}

impl VariantSettings {
    pub fn variant(&self) -> Variant {
        match self {
            VariantSettings::Application(_) => Variant::Application,
            VariantSettings::Network(_) => Variant::Network,
            VariantSettings::Gateway(_) => Variant::Gateway,
        }
    }

    /// Defaults for a variant, as a fresh resource would report them.
    pub fn defaults_for(variant: Variant) -> Self {
        match variant {
            Variant::Application => VariantSettings::Application(ApplicationSettings::default()),
            Variant::Network => VariantSettings::Network(ZonalSettings::default()),
            Variant::Gateway => VariantSettings::Gateway(ZonalSettings::default()),
        }
    }
}

impl Default for VariantSettings {
    fn default() -> Self {
        VariantSettings::Application(ApplicationSettings::default())
    }
}

// =============================================================================
// Network attachments
// =============================================================================

/// Subnet placement with optional fixed addresses.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct SubnetMapping {
    pub subnet_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_ipv4_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6_address: Option<String>,
    /// Assigned by the control plane, never sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outpost_id: Option<String>,
}

impl SubnetMapping {
    pub fn new(subnet_id: impl Into<String>) -> Self {
        Self {
            subnet_id: subnet_id.into(),
            ..Default::default()
        }
    }

    /// The caller-controlled part of a mapping.
    fn placement(&self) -> (&str, Option<&str>, Option<&str>, Option<&str>) {
        (
            &self.subnet_id,
            self.allocation_id.as_deref(),
            self.private_ipv4_address.as_deref(),
            self.ipv6_address.as_deref(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Subnets,
    SubnetMappings,
}

/// Where the load balancer lives. Exactly one representation is used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkAttachments {
    Subnets(BTreeSet<String>),
    SubnetMappings(BTreeSet<SubnetMapping>),
}

impl NetworkAttachments {
    pub fn kind(&self) -> AttachmentKind {
        match self {
            NetworkAttachments::Subnets(_) => AttachmentKind::Subnets,
            NetworkAttachments::SubnetMappings(_) => AttachmentKind::SubnetMappings,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            NetworkAttachments::Subnets(ids) => ids.is_empty(),
            NetworkAttachments::SubnetMappings(m) => m.is_empty(),
        }
    }

    /// Compare placements, ignoring control-plane assigned fields.
    pub fn same_placement(&self, other: &NetworkAttachments) -> bool {
        match (self, other) {
            (NetworkAttachments::Subnets(a), NetworkAttachments::Subnets(b)) => a == b,
            (NetworkAttachments::SubnetMappings(a), NetworkAttachments::SubnetMappings(b)) => {
                let a: BTreeSet<_> = a.iter().map(SubnetMapping::placement).collect();
                let b: BTreeSet<_> = b.iter().map(SubnetMapping::placement).collect();
                a == b
            }
            _ => false,
        }
    }
}

impl Default for NetworkAttachments {
    fn default() -> Self {
        NetworkAttachments::Subnets(BTreeSet::new())
    }
}

// =============================================================================
// Access logs
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessLogs {
    pub enabled: bool,
    pub bucket: String,
    pub prefix: String,
}

// =============================================================================
// Desired state
// =============================================================================

/// Declared configuration for one load balancer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DesiredLoadBalancer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name_prefix: Option<String>,
    pub internal: bool,
    pub variant: VariantSettings,
    pub attachments: NetworkAttachments,
    pub security_groups: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address_type: Option<IpAddressType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_owned_ipv4_pool: Option<String>,
    pub deletion_protection: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_logs: Option<AccessLogs>,
    pub tags: BTreeMap<String, String>,
}

impl DesiredLoadBalancer {
    pub fn variant(&self) -> Variant {
        self.variant.variant()
    }

    pub fn scheme(&self) -> Scheme {
        Scheme::from_internal(self.internal)
    }

    /// Tags the caller manages; platform tags are filtered out.
    pub fn managed_tags(&self) -> BTreeMap<String, String> {
        managed_tags(&self.tags)
    }

    /// Reject configurations that can never be created.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_some() && self.name_prefix.is_some() {
            return Err(ReconcileError::Validation(
                "name and name_prefix are mutually exclusive".to_string(),
            ));
        }
        if self.attachments.is_empty() {
            return Err(ReconcileError::Validation(
                "at least one subnet or subnet mapping is required".to_string(),
            ));
        }
        if let Some(logs) = &self.access_logs
            && logs.enabled
            && logs.bucket.is_empty()
        {
            return Err(ReconcileError::Validation(
                "access_logs.bucket is required when access logs are enabled".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve the name to create with: explicit name, prefix plus unique
    /// suffix, or a fully generated name.
    pub fn resolve_name(&self, default_prefix: &str) -> String {
        match (&self.name, &self.name_prefix) {
            (Some(name), _) => name.clone(),
            (None, Some(prefix)) => prefixed_unique_id(prefix),
            (None, None) => prefixed_unique_id(default_prefix),
        }
    }

    /// Fields that can only change by replacing the load balancer.
    pub fn immutable_changes(&self, new: &DesiredLoadBalancer) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.name != new.name {
            changed.push("name");
        }
        if self.name_prefix != new.name_prefix {
            changed.push("name_prefix");
        }
        if self.variant() != new.variant() {
            changed.push("load_balancer_type");
        }
        if self.internal != new.internal {
            changed.push("internal");
        }
        if self.customer_owned_ipv4_pool != new.customer_owned_ipv4_pool {
            changed.push("customer_owned_ipv4_pool");
        }
        changed
    }
}

// =============================================================================
// Observed state
// =============================================================================

/// A load balancer as the control plane reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub arn: String,
    pub arn_suffix: String,
    pub name: String,
    pub scheme: Scheme,
    pub settings: VariantSettings,
    pub attachments: NetworkAttachments,
    pub security_groups: BTreeSet<String>,
    pub ip_address_type: IpAddressType,
    pub customer_owned_ipv4_pool: Option<String>,
    pub deletion_protection: bool,
    pub access_logs: AccessLogs,
    pub tags: BTreeMap<String, String>,
    pub dns_name: String,
    pub zone_id: String,
    pub vpc_id: String,
}

impl LoadBalancer {
    pub fn variant(&self) -> Variant {
        self.settings.variant()
    }
}

// =============================================================================
// Helpers
// =============================================================================

pub fn is_system_tag(key: &str) -> bool {
    key.starts_with(SYSTEM_TAG_PREFIX)
}

pub fn managed_tags(tags: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    tags.iter()
        .filter(|(k, _)| !is_system_tag(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

static UNIQUE_COUNTER: AtomicU32 = AtomicU32::new(0);

/// `prefix` followed by a 26 character suffix that is unique within the
/// process and sorts by creation time.
pub fn prefixed_unique_id(prefix: &str) -> String {
    let now = Utc::now();
    let counter = UNIQUE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!(
        "{}{}{:04}{:08x}",
        prefix,
        now.format("%Y%m%d%H%M%S"),
        now.timestamp_subsec_micros() / 100,
        counter
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desired() -> DesiredLoadBalancer {
        DesiredLoadBalancer {
            attachments: NetworkAttachments::Subnets(["subnet-a".to_string()].into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_prefixed_unique_id() {
        let a = prefixed_unique_id("lb-");
        let b = prefixed_unique_id("lb-");
        assert!(a.starts_with("lb-"));
        assert_eq!(a.len(), "lb-".len() + 26);
        assert!(a[3..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_resolve_name() {
        let mut d = desired();
        d.name = Some("explicit".to_string());
        assert_eq!(d.resolve_name("mvirt-"), "explicit");

        d.name = None;
        d.name_prefix = Some("lb-".to_string());
        assert!(d.resolve_name("mvirt-").starts_with("lb-"));

        d.name_prefix = None;
        assert!(d.resolve_name("mvirt-").starts_with("mvirt-"));
    }

    #[test]
    fn test_validate() {
        assert!(desired().validate().is_ok());

        let mut d = desired();
        d.name = Some("a".to_string());
        d.name_prefix = Some("b".to_string());
        assert!(matches!(d.validate(), Err(ReconcileError::Validation(_))));

        let mut d = desired();
        d.attachments = NetworkAttachments::Subnets(BTreeSet::new());
        assert!(d.validate().is_err());

        let mut d = desired();
        d.access_logs = Some(AccessLogs {
            enabled: true,
            ..Default::default()
        });
        assert!(d.validate().is_err());
    }

    #[test]
    fn test_same_placement_ignores_outpost() {
        let mut assigned = SubnetMapping::new("subnet-a");
        assigned.outpost_id = Some("op-123".to_string());
        let a = NetworkAttachments::SubnetMappings([assigned].into());
        let b = NetworkAttachments::SubnetMappings([SubnetMapping::new("subnet-a")].into());
        assert!(a.same_placement(&b));

        let mut pinned = SubnetMapping::new("subnet-a");
        pinned.allocation_id = Some("eipalloc-1".to_string());
        let c = NetworkAttachments::SubnetMappings([pinned].into());
        assert!(!b.same_placement(&c));

        let d = NetworkAttachments::Subnets(["subnet-a".to_string()].into());
        assert!(!b.same_placement(&d));
    }

    #[test]
    fn test_immutable_changes() {
        let old = desired();
        let mut new = old.clone();
        assert!(old.immutable_changes(&new).is_empty());

        new.internal = true;
        new.variant = VariantSettings::Network(ZonalSettings::default());
        new.security_groups.insert("sg-1".to_string());
        assert_eq!(
            old.immutable_changes(&new),
            vec!["load_balancer_type", "internal"]
        );
    }

    #[test]
    fn test_desired_from_json() {
        let d: DesiredLoadBalancer = serde_json::from_str(
            r#"{
                "name_prefix": "lb-",
                "variant": { "type": "network", "cross_zone_load_balancing": true },
                "attachments": { "subnet_mappings": [ { "subnet_id": "subnet-a", "allocation_id": "eipalloc-1" } ] },
                "tags": { "env": "test" }
            }"#,
        )
        .unwrap();
        assert_eq!(d.variant(), Variant::Network);
        assert_eq!(
            d.variant,
            VariantSettings::Network(ZonalSettings {
                cross_zone_load_balancing: true
            })
        );
        assert_eq!(d.attachments.kind(), AttachmentKind::SubnetMappings);
        assert_eq!(d.scheme(), Scheme::InternetFacing);

        let d: DesiredLoadBalancer = serde_json::from_str(
            r#"{ "variant": { "type": "application" }, "attachments": { "subnets": ["s-1"] } }"#,
        )
        .unwrap();
        assert_eq!(d.variant, VariantSettings::Application(ApplicationSettings::default()));
    }

    #[test]
    fn test_managed_tags_drop_system_keys() {
        let tags: BTreeMap<String, String> = [
            ("aws:cloudformation:stack-name".to_string(), "x".to_string()),
            ("team".to_string(), "net".to_string()),
        ]
        .into();
        assert_eq!(managed_tags(&tags).len(), 1);
    }
}
