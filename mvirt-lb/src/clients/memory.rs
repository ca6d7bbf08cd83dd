//! In-memory control plane.
//!
//! Behaves like the remote service closely enough to exercise the
//! reconciler end to end: new load balancers report `provisioning` for a
//! number of reads, every load balancer leaves network interfaces behind,
//! platform-owned interfaces disappear on their own some reads after the
//! load balancer is deleted, and any operation can be made to fail once.

use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::elb::keys;
use super::eni::{LB_INTERFACE_OWNER, PLATFORM_ATTACHMENT_PREFIX, PLATFORM_INTERFACE_OWNER};
use super::{
    ApiError, ApiResult, Attribute, AvailabilityZone, CreateLoadBalancerRequest,
    InterfaceAttachment, InterfaceFilter, LoadBalancerAddress, LoadBalancerApi,
    LoadBalancerState, NetworkInterface, NetworkInterfaceApi, RemoteLoadBalancer, SubnetSelection,
    Tag,
};
use crate::arn::format_arn;
use crate::model::Variant;

/// Tunables of the simulated control plane.
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    /// Describe calls that report `provisioning` after a create or subnet change.
    pub provisioning_reads: u32,
    /// Interface describe calls that still see platform-owned interfaces after delete.
    pub platform_interface_lifetime: u32,
    pub region: String,
    pub account: String,
    pub vpc_id: String,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            provisioning_reads: 2,
            platform_interface_lifetime: 2,
            region: "eu-central-1".to_string(),
            account: "123456789012".to_string(),
            vpc_id: "vpc-0a1b2c3d".to_string(),
        }
    }
}

/// A call received by [`InMemoryCloud`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    CreateLoadBalancer { name: String },
    DescribeLoadBalancer { arn: String },
    DescribeAttributes { arn: String },
    ModifyAttributes { arn: String, attributes: Vec<Attribute> },
    SetSecurityGroups { arn: String, groups: Vec<String> },
    SetSubnets { arn: String, subnets: SubnetSelection },
    SetIpAddressType { arn: String, ip_address_type: String },
    DeleteLoadBalancer { arn: String },
    DescribeTags { arn: String },
    AddTags { arn: String, tags: Vec<Tag> },
    RemoveTags { arn: String, keys: Vec<String> },
    DescribeNetworkInterfaces,
    DetachNetworkInterface { attachment_id: String },
    DeleteNetworkInterface { id: String },
}

impl ApiCall {
    pub fn operation(&self) -> &'static str {
        match self {
            ApiCall::CreateLoadBalancer { .. } => "CreateLoadBalancer",
            ApiCall::DescribeLoadBalancer { .. } => "DescribeLoadBalancers",
            ApiCall::DescribeAttributes { .. } => "DescribeLoadBalancerAttributes",
            ApiCall::ModifyAttributes { .. } => "ModifyLoadBalancerAttributes",
            ApiCall::SetSecurityGroups { .. } => "SetSecurityGroups",
            ApiCall::SetSubnets { .. } => "SetSubnets",
            ApiCall::SetIpAddressType { .. } => "SetIpAddressType",
            ApiCall::DeleteLoadBalancer { .. } => "DeleteLoadBalancer",
            ApiCall::DescribeTags { .. } => "DescribeTags",
            ApiCall::AddTags { .. } => "AddTags",
            ApiCall::RemoveTags { .. } => "RemoveTags",
            ApiCall::DescribeNetworkInterfaces => "DescribeNetworkInterfaces",
            ApiCall::DetachNetworkInterface { .. } => "DetachNetworkInterface",
            ApiCall::DeleteNetworkInterface { .. } => "DeleteNetworkInterface",
        }
    }

    /// Whether the call changes remote state.
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            ApiCall::DescribeLoadBalancer { .. }
                | ApiCall::DescribeAttributes { .. }
                | ApiCall::DescribeTags { .. }
                | ApiCall::DescribeNetworkInterfaces
        )
    }
}

struct StoredLoadBalancer {
    record: RemoteLoadBalancer,
    variant: Variant,
    attributes: BTreeMap<String, String>,
    tags: BTreeMap<String, String>,
    provisioning_reads: u32,
    forced_state: Option<LoadBalancerState>,
}

struct StoredInterface {
    interface: NetworkInterface,
    /// Describe calls left before the interface disappears by itself.
    remaining_reads: Option<u32>,
}

struct Inner {
    options: SimulationOptions,
    load_balancers: BTreeMap<String, StoredLoadBalancer>,
    interfaces: BTreeMap<String, StoredInterface>,
    calls: Vec<ApiCall>,
    failures: HashMap<&'static str, VecDeque<ApiError>>,
}

impl Inner {
    /// Record the call and pop an injected failure for it, if any.
    fn enter(&mut self, call: ApiCall) -> ApiResult<()> {
        let operation = call.operation();
        debug!(operation, "in-memory control plane call");
        self.calls.push(call);
        match self.failures.get_mut(operation).and_then(|q| q.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn load_balancer(&mut self, arn: &str) -> ApiResult<&mut StoredLoadBalancer> {
        self.load_balancers
            .get_mut(arn)
            .ok_or_else(|| ApiError::NotFound(format!("load balancer {arn}")))
    }

    fn new_interface(&mut self, description: &str, owner: &str, attachment_prefix: &str) {
        let id = format!("eni-{}", short_id(17));
        let attachment_id = format!("{}{}", attachment_prefix, short_id(17));
        self.interfaces.insert(
            id.clone(),
            StoredInterface {
                interface: NetworkInterface {
                    id,
                    description: description.to_string(),
                    attachment: Some(InterfaceAttachment {
                        attachment_id,
                        instance_owner_id: owner.to_string(),
                    }),
                },
                remaining_reads: None,
            },
        );
    }
}

/// Scripted, call-recording control plane implementing both client traits.
pub struct InMemoryCloud {
    inner: Mutex<Inner>,
}

impl InMemoryCloud {
    pub fn new(options: SimulationOptions) -> Self {
        Self {
            inner: Mutex::new(Inner {
                options,
                load_balancers: BTreeMap::new(),
                interfaces: BTreeMap::new(),
                calls: Vec::new(),
                failures: HashMap::new(),
            }),
        }
    }

    /// Make the next call of `operation` fail with `error`.
    pub async fn fail_next(&self, operation: &'static str, error: ApiError) {
        let mut inner = self.inner.lock().await;
        inner.failures.entry(operation).or_default().push_back(error);
    }

    /// Pin the state reported for a load balancer, or release it with `None`.
    pub async fn force_state(&self, arn: &str, state: Option<LoadBalancerState>) {
        let mut inner = self.inner.lock().await;
        if let Some(lb) = inner.load_balancers.get_mut(arn) {
            lb.forced_state = state;
        }
    }

    pub async fn insert_interface(
        &self,
        interface: NetworkInterface,
        remaining_reads: Option<u32>,
    ) {
        let mut inner = self.inner.lock().await;
        inner.interfaces.insert(
            interface.id.clone(),
            StoredInterface {
                interface,
                remaining_reads,
            },
        );
    }

    pub async fn calls(&self) -> Vec<ApiCall> {
        self.inner.lock().await.calls.clone()
    }

    pub async fn mutation_calls(&self) -> Vec<ApiCall> {
        let inner = self.inner.lock().await;
        inner.calls.iter().filter(|c| c.is_mutation()).cloned().collect()
    }

    pub async fn clear_calls(&self) {
        self.inner.lock().await.calls.clear();
    }

    pub async fn load_balancer_count(&self) -> usize {
        self.inner.lock().await.load_balancers.len()
    }

    pub async fn interfaces(&self) -> Vec<NetworkInterface> {
        let inner = self.inner.lock().await;
        inner.interfaces.values().map(|s| s.interface.clone()).collect()
    }

    /// Current value of one attribute, bypassing call recording.
    pub async fn attribute(&self, arn: &str, key: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        inner.load_balancers.get(arn)?.attributes.get(key).cloned()
    }

    /// Current tags, bypassing call recording.
    pub async fn tags(&self, arn: &str) -> Option<BTreeMap<String, String>> {
        let inner = self.inner.lock().await;
        inner.load_balancers.get(arn).map(|lb| lb.tags.clone())
    }
}

impl Default for InMemoryCloud {
    fn default() -> Self {
        Self::new(SimulationOptions::default())
    }
}

#[async_trait]
impl LoadBalancerApi for InMemoryCloud {
    async fn create_load_balancer(
        &self,
        req: CreateLoadBalancerRequest,
    ) -> ApiResult<Vec<RemoteLoadBalancer>> {
        const OP: &str = "CreateLoadBalancer";
        let mut inner = self.inner.lock().await;
        inner.enter(ApiCall::CreateLoadBalancer {
            name: req.name.clone(),
        })?;

        if inner.load_balancers.values().any(|lb| lb.record.name == req.name) {
            return Err(ApiError::call(
                OP,
                format!("DuplicateLoadBalancerName: {}", req.name),
            ));
        }
        let variant: Variant = req
            .lb_type
            .parse()
            .map_err(|_| ApiError::call(OP, format!("ValidationError: type {}", req.lb_type)))?;

        let id = short_id(16);
        let opts = inner.options.clone();
        let arn = format_arn(&opts.region, &opts.account, variant, &req.name, &id);
        let scheme = req.scheme.unwrap_or_else(|| "internet-facing".to_string());
        let dns_prefix = if scheme == "internal" { "internal-" } else { "" };

        let record = RemoteLoadBalancer {
            arn: arn.clone(),
            name: req.name.clone(),
            lb_type: variant.as_str().to_string(),
            dns_name: format!(
                "{}{}-{}.elb.{}.amazonaws.com",
                dns_prefix,
                req.name,
                &id[..8],
                opts.region
            ),
            scheme,
            state: LoadBalancerState::Provisioning,
            vpc_id: opts.vpc_id.clone(),
            canonical_hosted_zone_id: "Z215JYRZR1TBD5".to_string(),
            security_groups: req.security_groups,
            availability_zones: zones_from_selection(&req.subnets),
            ip_address_type: req.ip_address_type.unwrap_or_else(|| "ipv4".to_string()),
            customer_owned_ipv4_pool: req.customer_owned_ipv4_pool,
        };

        let description = format!("ELB {}/{}/{}", variant.arn_path(), req.name, id);
        for _ in &record.availability_zones {
            match variant {
                Variant::Application => {
                    inner.new_interface(&description, LB_INTERFACE_OWNER, "eni-attach-")
                }
                Variant::Network | Variant::Gateway => inner.new_interface(
                    &description,
                    PLATFORM_INTERFACE_OWNER,
                    PLATFORM_ATTACHMENT_PREFIX,
                ),
            }
        }

        inner.load_balancers.insert(
            arn,
            StoredLoadBalancer {
                record: record.clone(),
                variant,
                attributes: default_attributes(variant),
                tags: req.tags.into_iter().map(|t| (t.key, t.value)).collect(),
                provisioning_reads: opts.provisioning_reads,
                forced_state: None,
            },
        );

        Ok(vec![record])
    }

    async fn describe_load_balancer(&self, arn: &str) -> ApiResult<Option<RemoteLoadBalancer>> {
        let mut inner = self.inner.lock().await;
        inner.enter(ApiCall::DescribeLoadBalancer {
            arn: arn.to_string(),
        })?;

        let Some(lb) = inner.load_balancers.get_mut(arn) else {
            return Ok(None);
        };
        let state = match lb.forced_state {
            Some(state) => state,
            None if lb.provisioning_reads > 0 => {
                lb.provisioning_reads -= 1;
                LoadBalancerState::Provisioning
            }
            None => LoadBalancerState::Active,
        };
        let mut record = lb.record.clone();
        record.state = state;
        Ok(Some(record))
    }

    async fn describe_attributes(&self, arn: &str) -> ApiResult<Vec<Attribute>> {
        let mut inner = self.inner.lock().await;
        inner.enter(ApiCall::DescribeAttributes {
            arn: arn.to_string(),
        })?;
        let lb = inner.load_balancer(arn)?;
        Ok(lb
            .attributes
            .iter()
            .map(|(k, v)| Attribute::new(k.clone(), v.clone()))
            .collect())
    }

    async fn modify_attributes(&self, arn: &str, attributes: Vec<Attribute>) -> ApiResult<()> {
        const OP: &str = "ModifyLoadBalancerAttributes";
        let mut inner = self.inner.lock().await;
        inner.enter(ApiCall::ModifyAttributes {
            arn: arn.to_string(),
            attributes: attributes.clone(),
        })?;
        let lb = inner.load_balancer(arn)?;

        for attr in &attributes {
            if !attribute_applies(lb.variant, &attr.key) {
                return Err(ApiError::call(
                    OP,
                    format!(
                        "ValidationError: attribute {} is not supported on {} load balancers",
                        attr.key, lb.variant
                    ),
                ));
            }
        }
        for attr in attributes {
            lb.attributes.insert(attr.key, attr.value);
        }
        Ok(())
    }

    async fn set_security_groups(&self, arn: &str, groups: Vec<String>) -> ApiResult<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(ApiCall::SetSecurityGroups {
            arn: arn.to_string(),
            groups: groups.clone(),
        })?;
        inner.load_balancer(arn)?.record.security_groups = groups;
        Ok(())
    }

    async fn set_subnets(&self, arn: &str, subnets: SubnetSelection) -> ApiResult<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(ApiCall::SetSubnets {
            arn: arn.to_string(),
            subnets: subnets.clone(),
        })?;
        let provisioning_reads = inner.options.provisioning_reads;
        let lb = inner.load_balancer(arn)?;
        lb.record.availability_zones = zones_from_selection(&subnets);
        lb.provisioning_reads = provisioning_reads;
        Ok(())
    }

    async fn set_ip_address_type(&self, arn: &str, ip_address_type: &str) -> ApiResult<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(ApiCall::SetIpAddressType {
            arn: arn.to_string(),
            ip_address_type: ip_address_type.to_string(),
        })?;
        if !matches!(ip_address_type, "ipv4" | "dualstack") {
            return Err(ApiError::call(
                "SetIpAddressType",
                format!("ValidationError: {ip_address_type}"),
            ));
        }
        inner.load_balancer(arn)?.record.ip_address_type = ip_address_type.to_string();
        Ok(())
    }

    async fn delete_load_balancer(&self, arn: &str) -> ApiResult<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(ApiCall::DeleteLoadBalancer {
            arn: arn.to_string(),
        })?;

        let Some(lb) = inner.load_balancers.get(arn) else {
            return Ok(());
        };
        if lb.attributes.get(keys::DELETION_PROTECTION).map(String::as_str) == Some("true") {
            return Err(ApiError::OperationNotPermitted(format!(
                "load balancer {arn} has deletion protection enabled"
            )));
        }

        let description = format!(
            "ELB {}/{}/{}",
            lb.variant.arn_path(),
            lb.record.name,
            arn.rsplit('/').next().unwrap_or_default()
        );
        inner.load_balancers.remove(arn);

        let lifetime = inner.options.platform_interface_lifetime;
        for stored in inner.interfaces.values_mut() {
            let platform_owned = stored
                .interface
                .attachment
                .as_ref()
                .is_some_and(|a| a.instance_owner_id == PLATFORM_INTERFACE_OWNER);
            if platform_owned && stored.interface.description == description {
                stored.remaining_reads = Some(lifetime);
            }
        }
        inner.interfaces.retain(|_, s| s.remaining_reads != Some(0));
        Ok(())
    }

    async fn describe_tags(&self, arn: &str) -> ApiResult<Vec<Tag>> {
        let mut inner = self.inner.lock().await;
        inner.enter(ApiCall::DescribeTags {
            arn: arn.to_string(),
        })?;
        let lb = inner.load_balancer(arn)?;
        Ok(lb
            .tags
            .iter()
            .map(|(k, v)| Tag {
                key: k.clone(),
                value: v.clone(),
            })
            .collect())
    }

    async fn add_tags(&self, arn: &str, tags: Vec<Tag>) -> ApiResult<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(ApiCall::AddTags {
            arn: arn.to_string(),
            tags: tags.clone(),
        })?;
        let lb = inner.load_balancer(arn)?;
        for tag in tags {
            lb.tags.insert(tag.key, tag.value);
        }
        Ok(())
    }

    async fn remove_tags(&self, arn: &str, keys: Vec<String>) -> ApiResult<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(ApiCall::RemoveTags {
            arn: arn.to_string(),
            keys: keys.clone(),
        })?;
        let lb = inner.load_balancer(arn)?;
        for key in keys {
            lb.tags.remove(&key);
        }
        Ok(())
    }
}

#[async_trait]
impl NetworkInterfaceApi for InMemoryCloud {
    async fn describe_network_interfaces(
        &self,
        filters: &[InterfaceFilter],
    ) -> ApiResult<Vec<NetworkInterface>> {
        let mut inner = self.inner.lock().await;
        inner.enter(ApiCall::DescribeNetworkInterfaces)?;

        let matched: Vec<NetworkInterface> = inner
            .interfaces
            .values()
            .filter(|s| filters.iter().all(|f| filter_matches(&s.interface, f)))
            .map(|s| s.interface.clone())
            .collect();

        for stored in inner.interfaces.values_mut() {
            if let Some(n) = stored.remaining_reads.as_mut() {
                *n = n.saturating_sub(1);
            }
        }
        inner.interfaces.retain(|_, s| s.remaining_reads != Some(0));

        Ok(matched)
    }

    async fn detach_network_interface(&self, attachment_id: &str, _force: bool) -> ApiResult<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(ApiCall::DetachNetworkInterface {
            attachment_id: attachment_id.to_string(),
        })?;

        if attachment_id.starts_with(PLATFORM_ATTACHMENT_PREFIX) {
            return Err(ApiError::OperationNotPermitted(
                "You are not allowed to manage 'ela-attach' attachments".to_string(),
            ));
        }
        let stored = inner
            .interfaces
            .values_mut()
            .find(|s| {
                s.interface
                    .attachment
                    .as_ref()
                    .is_some_and(|a| a.attachment_id == attachment_id)
            })
            .ok_or_else(|| ApiError::NotFound(format!("attachment {attachment_id}")))?;
        stored.interface.attachment = None;
        Ok(())
    }

    async fn delete_network_interface(&self, id: &str) -> ApiResult<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(ApiCall::DeleteNetworkInterface { id: id.to_string() })?;

        let stored = inner
            .interfaces
            .get(id)
            .ok_or_else(|| ApiError::NotFound(format!("network interface {id}")))?;
        if stored.interface.attachment.is_some() {
            return Err(ApiError::call(
                "DeleteNetworkInterface",
                format!("InvalidNetworkInterface.InUse: {id} is currently in use"),
            ));
        }
        inner.interfaces.remove(id);
        Ok(())
    }
}

fn short_id(len: usize) -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(len);
    id
}

fn zones_from_selection(selection: &SubnetSelection) -> Vec<AvailabilityZone> {
    let zone_name = |i: usize| format!("zone-{}", (b'a' + (i % 26) as u8) as char);
    match selection {
        SubnetSelection::Subnets(ids) => ids
            .iter()
            .enumerate()
            .map(|(i, id)| AvailabilityZone {
                zone_name: zone_name(i),
                subnet_id: id.clone(),
                outpost_id: None,
                addresses: Vec::new(),
            })
            .collect(),
        SubnetSelection::Mappings(mappings) => mappings
            .iter()
            .enumerate()
            .map(|(i, m)| {
                let address = LoadBalancerAddress {
                    allocation_id: m.allocation_id.clone(),
                    private_ipv4_address: m.private_ipv4_address.clone(),
                    ipv6_address: m.ipv6_address.clone(),
                };
                AvailabilityZone {
                    zone_name: zone_name(i),
                    subnet_id: m.subnet_id.clone(),
                    outpost_id: None,
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

fn default_attributes(variant: Variant) -> BTreeMap<String, String> {
    let mut attrs: BTreeMap<String, String> = [
        (keys::ACCESS_LOGS_ENABLED, "false"),
        (keys::ACCESS_LOGS_BUCKET, ""),
        (keys::ACCESS_LOGS_PREFIX, ""),
        (keys::DELETION_PROTECTION, "false"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    let specific: &[(&str, &str)] = match variant {
        Variant::Application => &[
            (keys::IDLE_TIMEOUT, "60"),
            (keys::HTTP2_ENABLED, "true"),
            (keys::DROP_INVALID_HEADER_FIELDS, "false"),
        ],
        Variant::Network | Variant::Gateway => &[(keys::CROSS_ZONE, "false")],
    };
    for (k, v) in specific {
        attrs.insert(k.to_string(), v.to_string());
    }
    attrs
}

fn attribute_applies(variant: Variant, key: &str) -> bool {
    match key {
        keys::ACCESS_LOGS_ENABLED
        | keys::ACCESS_LOGS_BUCKET
        | keys::ACCESS_LOGS_PREFIX
        | keys::DELETION_PROTECTION => true,
        keys::IDLE_TIMEOUT | keys::HTTP2_ENABLED | keys::DROP_INVALID_HEADER_FIELDS => {
            variant == Variant::Application
        }
        keys::CROSS_ZONE => matches!(variant, Variant::Network | Variant::Gateway),
        _ => false,
    }
}

fn filter_matches(interface: &NetworkInterface, filter: &InterfaceFilter) -> bool {
    let value = match filter.name.as_str() {
        InterfaceFilter::INSTANCE_OWNER => interface
            .attachment
            .as_ref()
            .map(|a| a.instance_owner_id.as_str()),
        InterfaceFilter::ATTACHMENT_ID => {
            interface.attachment.as_ref().map(|a| a.attachment_id.as_str())
        }
        InterfaceFilter::DESCRIPTION => Some(interface.description.as_str()),
        _ => None,
    };
    value.is_some_and(|v| filter.values.iter().any(|p| wildcard_match(p, v)))
}

/// Match `text` against a pattern where `*` matches any run of characters.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }
    let first = parts[0];
    let last = parts[parts.len() - 1];
    if text.len() < first.len() + last.len() || !text.starts_with(first) || !text.ends_with(last)
    {
        return false;
    }
    let mut rest = &text[first.len()..text.len() - last.len()];
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(i) => rest = &rest[i + part.len()..],
            None => return false,
        }
    }
    true
}
