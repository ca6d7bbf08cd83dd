//! Network interface API surface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::ApiResult;

/// Attachment owner of interfaces the load balancer service creates and we may remove.
pub const LB_INTERFACE_OWNER: &str = "amazon-elb";
/// Attachment owner of interfaces only the platform may remove.
pub const PLATFORM_INTERFACE_OWNER: &str = "amazon-aws";
pub const PLATFORM_ATTACHMENT_PREFIX: &str = "ela-attach-";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceAttachment {
    pub attachment_id: String,
    pub instance_owner_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub id: String,
    pub description: String,
    pub attachment: Option<InterfaceAttachment>,
}

/// Describe filter; values may contain `*` wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceFilter {
    pub name: String,
    pub values: Vec<String>,
}

impl InterfaceFilter {
    pub const INSTANCE_OWNER: &'static str = "attachment.instance-owner-id";
    pub const ATTACHMENT_ID: &'static str = "attachment.attachment-id";
    pub const DESCRIPTION: &'static str = "description";

    pub fn new(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            values: vec![value.into()],
        }
    }
}

/// Network interface service.
#[async_trait]
pub trait NetworkInterfaceApi: Send + Sync {
    /// List interfaces matching all filters.
    async fn describe_network_interfaces(
        &self,
        filters: &[InterfaceFilter],
    ) -> ApiResult<Vec<NetworkInterface>>;

    async fn detach_network_interface(&self, attachment_id: &str, force: bool) -> ApiResult<()>;

    async fn delete_network_interface(&self, id: &str) -> ApiResult<()>;
}
