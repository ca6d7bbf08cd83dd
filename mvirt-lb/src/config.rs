//! Reconciler configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::reconciler::wait::PollPolicy;

/// Deadlines and cadences used by lifecycle operations.
///
/// Durations are read and written as whole seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Deadline for a new load balancer to become active.
    #[serde(with = "duration_secs")]
    pub create_timeout: Duration,
    /// Deadline for an updated load balancer to become active again.
    #[serde(with = "duration_secs")]
    pub update_timeout: Duration,
    /// Deadline for platform-owned interfaces to disappear after delete.
    #[serde(with = "duration_secs")]
    pub delete_timeout: Duration,
    pub settle: PollPolicy,
    #[serde(with = "duration_secs")]
    pub cleanup_retry_interval: Duration,
    /// Prefix for generated names when neither name nor prefix is declared.
    pub default_name_prefix: String,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            create_timeout: Duration::from_secs(10 * 60),
            update_timeout: Duration::from_secs(10 * 60),
            delete_timeout: Duration::from_secs(5 * 60),
            settle: PollPolicy::default(),
            cleanup_retry_interval: Duration::from_secs(10),
            default_name_prefix: "mvirt-".to_string(),
        }
    }
}

pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
