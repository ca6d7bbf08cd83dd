//! Load balancer identity (ARN) helpers.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{ReconcileError, Result};
use crate::model::Variant;

static SUFFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^arn:[^:]*:[^:]*:[^:]*:[^:]*:loadbalancer/([^/]+/[^/]+/[^/]+)$")
        .expect("static regex")
});

/// Extract the `<variant-path>/<name>/<id>` suffix from a load balancer ARN.
///
/// `arn:aws:elasticloadbalancing:eu-central-1:123456789012:loadbalancer/app/my-lb/50dc6c495c0c9188`
/// yields `app/my-lb/50dc6c495c0c9188`.
pub fn arn_suffix(arn: &str) -> Result<String> {
    SUFFIX_RE
        .captures(arn)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| ReconcileError::Format(format!("unexpected load balancer ARN: {arn:?}")))
}

/// Build an ARN in the shape the control plane hands out.
pub fn format_arn(region: &str, account: &str, variant: Variant, name: &str, id: &str) -> String {
    format!(
        "arn:aws:elasticloadbalancing:{region}:{account}:loadbalancer/{}/{name}/{id}",
        variant.arn_path()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arn_suffix() {
        let arn = "arn:partition:service:region:account:loadbalancer/app/my-lb/abcdef0123456789";
        assert_eq!(arn_suffix(arn).unwrap(), "app/my-lb/abcdef0123456789");

        let arn = "arn:aws:elasticloadbalancing:us-west-2:123456789012:loadbalancer/net/nlb-1/0a1b2c3d4e5f6789";
        assert_eq!(arn_suffix(arn).unwrap(), "net/nlb-1/0a1b2c3d4e5f6789");
    }

    #[test]
    fn test_arn_suffix_rejects_malformed() {
        let arn = "arn:aws:elasticloadbalancing:us-west-2:123:targetgroup/tg/abc";
        let err = arn_suffix(arn).unwrap_err();
        assert!(matches!(err, ReconcileError::Format(_)));

        assert!(arn_suffix("").is_err());
        assert!(arn_suffix("loadbalancer/app/my-lb/abc").is_err());
        assert!(arn_suffix("arn:aws:elb:r:a:loadbalancer/app/my-lb").is_err());
    }

    #[test]
    fn test_format_arn_round_trips_through_suffix() {
        let arn = format_arn("eu-central-1", "123456789012", Variant::Gateway, "gw", "0011");
        assert_eq!(arn_suffix(&arn).unwrap(), "gwy/gw/0011");
    }
}
