//! Load balancing API surface and its wire shapes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::ApiResult;

/// Well-known load balancer attribute keys.
pub mod keys {
    pub const ACCESS_LOGS_ENABLED: &str = "access_logs.s3.enabled";
    pub const ACCESS_LOGS_BUCKET: &str = "access_logs.s3.bucket";
    pub const ACCESS_LOGS_PREFIX: &str = "access_logs.s3.prefix";
    pub const DELETION_PROTECTION: &str = "deletion_protection.enabled";
    pub const IDLE_TIMEOUT: &str = "idle_timeout.timeout_seconds";
    pub const HTTP2_ENABLED: &str = "routing.http2.enabled";
    pub const DROP_INVALID_HEADER_FIELDS: &str = "routing.http.drop_invalid_header_fields.enabled";
    pub const CROSS_ZONE: &str = "load_balancing.cross_zone.enabled";
}

/// Provisioning state reported by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancerState {
    Provisioning,
    Active,
    ActiveImpaired,
    Failed,
}

impl LoadBalancerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalancerState::Provisioning => "provisioning",
            LoadBalancerState::Active => "active",
            LoadBalancerState::ActiveImpaired => "active_impaired",
            LoadBalancerState::Failed => "failed",
        }
    }
}

/// Fixed address of a load balancer node in one zone.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LoadBalancerAddress {
    pub allocation_id: Option<String>,
    pub private_ipv4_address: Option<String>,
    pub ipv6_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AvailabilityZone {
    pub zone_name: String,
    pub subnet_id: String,
    pub outpost_id: Option<String>,
    pub addresses: Vec<LoadBalancerAddress>,
}

/// Load balancer record as returned by describe/create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteLoadBalancer {
    pub arn: String,
    pub name: String,
    pub lb_type: String,
    pub scheme: String,
    pub state: LoadBalancerState,
    pub vpc_id: String,
    pub dns_name: String,
    pub canonical_hosted_zone_id: String,
    pub security_groups: Vec<String>,
    pub availability_zones: Vec<AvailabilityZone>,
    pub ip_address_type: String,
    pub customer_owned_ipv4_pool: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub key: String,
    pub value: String,
}

impl Attribute {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubnetMappingRequest {
    pub subnet_id: String,
    pub allocation_id: Option<String>,
    pub private_ipv4_address: Option<String>,
    pub ipv6_address: Option<String>,
}

/// Subnet placement sent with create or set-subnets; exactly one form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubnetSelection {
    Subnets(Vec<String>),
    Mappings(Vec<SubnetMappingRequest>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateLoadBalancerRequest {
    pub name: String,
    pub lb_type: String,
    pub scheme: Option<String>,
    pub subnets: SubnetSelection,
    pub security_groups: Vec<String>,
    pub ip_address_type: Option<String>,
    pub customer_owned_ipv4_pool: Option<String>,
    pub tags: Vec<Tag>,
}

/// Load balancing service.
#[async_trait]
pub trait LoadBalancerApi: Send + Sync {
    /// Create a load balancer. The contract is exactly one record back.
    async fn create_load_balancer(
        &self,
        req: CreateLoadBalancerRequest,
    ) -> ApiResult<Vec<RemoteLoadBalancer>>;

    /// Describe a load balancer by ARN, `None` if it does not exist.
    async fn describe_load_balancer(&self, arn: &str) -> ApiResult<Option<RemoteLoadBalancer>>;

    async fn describe_attributes(&self, arn: &str) -> ApiResult<Vec<Attribute>>;

    async fn modify_attributes(&self, arn: &str, attributes: Vec<Attribute>) -> ApiResult<()>;

    async fn set_security_groups(&self, arn: &str, groups: Vec<String>) -> ApiResult<()>;

    async fn set_subnets(&self, arn: &str, subnets: SubnetSelection) -> ApiResult<()>;

    async fn set_ip_address_type(&self, arn: &str, ip_address_type: &str) -> ApiResult<()>;

    async fn delete_load_balancer(&self, arn: &str) -> ApiResult<()>;

    async fn describe_tags(&self, arn: &str) -> ApiResult<Vec<Tag>>;

    async fn add_tags(&self, arn: &str, tags: Vec<Tag>) -> ApiResult<()>;

    async fn remove_tags(&self, arn: &str, keys: Vec<String>) -> ApiResult<()>;
}
