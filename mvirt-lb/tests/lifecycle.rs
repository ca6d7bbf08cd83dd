//! End-to-end lifecycle tests against the in-memory control plane.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use mvirt_lb::clients::elb::keys;
use mvirt_lb::clients::{
    ApiCall, ApiError, Attribute, InMemoryCloud, LoadBalancerState, SimulationOptions,
    SubnetSelection,
};
use mvirt_lb::clock::ManualClock;
use mvirt_lb::model::{
    ApplicationSettings, IpAddressType, NetworkAttachments, SubnetMapping, VariantSettings,
    ZonalSettings,
};
use mvirt_lb::reconciler::ConvergeAction;
use mvirt_lb::{
    CleanupWarning, DesiredLoadBalancer, LoadBalancerReconciler, Phase, ReconcileError,
    Reconciler, ReconcilerConfig,
};

fn setup_with(
    options: SimulationOptions,
    config: ReconcilerConfig,
) -> (Arc<InMemoryCloud>, LoadBalancerReconciler) {
    let cloud = Arc::new(InMemoryCloud::new(options));
    let reconciler = LoadBalancerReconciler::with_clock(
        cloud.clone(),
        cloud.clone(),
        Arc::new(ManualClock::new()),
        config,
    );
    (cloud, reconciler)
}

fn setup() -> (Arc<InMemoryCloud>, LoadBalancerReconciler) {
    setup_with(SimulationOptions::default(), ReconcilerConfig::default())
}

fn subnets(ids: &[&str]) -> NetworkAttachments {
    NetworkAttachments::Subnets(ids.iter().map(|s| s.to_string()).collect())
}

fn application(ids: &[&str]) -> DesiredLoadBalancer {
    DesiredLoadBalancer {
        attachments: subnets(ids),
        ..Default::default()
    }
}

fn network(ids: &[&str]) -> DesiredLoadBalancer {
    DesiredLoadBalancer {
        variant: VariantSettings::Network(ZonalSettings::default()),
        attachments: subnets(ids),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_create_with_prefix_skips_subnets_in_chained_update() {
    let (cloud, reconciler) = setup();
    let mut desired = application(&["subnet-a", "subnet-b"]);
    desired.name_prefix = Some("lb-".to_string());

    let lb = reconciler.create(&desired).await.unwrap();

    assert!(lb.name.starts_with("lb-"));
    assert_eq!(lb.name.len(), "lb-".len() + 26);
    assert_eq!(lb.attachments, desired.attachments);
    assert_eq!(
        lb.settings,
        VariantSettings::Application(ApplicationSettings::default())
    );

    let calls = cloud.calls().await;
    assert!(!calls.iter().any(|c| matches!(c, ApiCall::SetSubnets { .. })));
    let modified = calls
        .iter()
        .find_map(|c| match c {
            ApiCall::ModifyAttributes { attributes, .. } => Some(attributes.clone()),
            _ => None,
        })
        .expect("attributes pushed after create");
    assert!(modified.contains(&Attribute::new(keys::IDLE_TIMEOUT, "60")));
}

#[tokio::test]
async fn test_identical_update_makes_no_mutations() {
    let (cloud, reconciler) = setup();
    let mut desired = application(&["subnet-a", "subnet-b"]);
    desired.security_groups.insert("sg-1".to_string());
    desired.tags.insert("env".to_string(), "test".to_string());

    let lb = reconciler.create(&desired).await.unwrap();
    cloud.clear_calls().await;

    let updated = reconciler.update(&lb.arn, &desired, &desired).await.unwrap();

    assert_eq!(updated, lb);
    assert!(cloud.mutation_calls().await.is_empty());
}

#[tokio::test]
async fn test_read_missing_is_absent() {
    let (_cloud, reconciler) = setup();
    let arn = "arn:aws:elasticloadbalancing:eu-central-1:123456789012:loadbalancer/app/gone/0123456789abcdef";

    assert!(reconciler.read(arn).await.unwrap().is_none());
}

#[tokio::test]
async fn test_read_detects_subnet_mappings() {
    let (_cloud, reconciler) = setup();
    let mut pinned = SubnetMapping::new("subnet-a");
    pinned.allocation_id = Some("eipalloc-1".to_string());
    let mut desired = network(&[]);
    desired.attachments = NetworkAttachments::SubnetMappings([pinned].into());

    let lb = reconciler.create(&desired).await.unwrap();
    let read = reconciler.read(&lb.arn).await.unwrap().unwrap();

    assert_eq!(read.attachments, desired.attachments);
}

#[tokio::test]
async fn test_network_subnet_change_requires_replacement() {
    let (cloud, reconciler) = setup();
    let old = network(&["subnet-a", "subnet-b"]);
    let new = network(&["subnet-a", "subnet-c"]);

    let lb = reconciler.create(&old).await.unwrap();
    assert!(reconciler.requires_replacement(
        lb.variant(),
        Some(&old.attachments),
        &new.attachments
    ));
    cloud.clear_calls().await;

    let err = reconciler.update(&lb.arn, &old, &new).await.unwrap_err();
    assert!(matches!(err, ReconcileError::ReplacementRequired { .. }));
    assert!(cloud.calls().await.is_empty());
}

#[tokio::test]
async fn test_immutable_change_refused_before_remote_calls() {
    let (cloud, reconciler) = setup();
    let old = application(&["subnet-a"]);
    let mut new = old.clone();
    new.internal = true;

    let lb = reconciler.create(&old).await.unwrap();
    cloud.clear_calls().await;

    let err = reconciler.update(&lb.arn, &old, &new).await.unwrap_err();
    match err {
        ReconcileError::ReplacementRequired { field, .. } => assert_eq!(field, "internal"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(cloud.calls().await.is_empty());
}

#[tokio::test]
async fn test_application_mappings_updated_in_place() {
    let (cloud, reconciler) = setup();
    let mut old = application(&[]);
    old.attachments = NetworkAttachments::SubnetMappings([SubnetMapping::new("subnet-a")].into());
    let mut new = old.clone();
    new.attachments = NetworkAttachments::SubnetMappings(
        [SubnetMapping::new("subnet-a"), SubnetMapping::new("subnet-b")].into(),
    );

    let lb = reconciler.create(&old).await.unwrap();
    cloud.clear_calls().await;

    let updated = reconciler.update(&lb.arn, &old, &new).await.unwrap();

    assert_eq!(updated.arn, lb.arn);
    assert_eq!(updated.attachments, new.attachments);
    let set_subnets: Vec<_> = cloud
        .mutation_calls()
        .await
        .into_iter()
        .filter_map(|c| match c {
            ApiCall::SetSubnets { subnets, .. } => Some(subnets),
            _ => None,
        })
        .collect();
    assert_eq!(set_subnets.len(), 1);
    assert!(matches!(&set_subnets[0], SubnetSelection::Mappings(m) if m.len() == 2));
}

#[tokio::test]
async fn test_update_applies_steps_in_order() {
    let (cloud, reconciler) = setup();
    let mut old = application(&["subnet-a"]);
    old.tags.insert("drop".to_string(), "x".to_string());
    old.security_groups.insert("sg-1".to_string());
    let mut new = application(&["subnet-a", "subnet-b"]);
    new.tags.insert("env".to_string(), "prod".to_string());
    new.security_groups.insert("sg-2".to_string());
    new.ip_address_type = Some(IpAddressType::Dualstack);
    new.deletion_protection = true;

    let lb = reconciler.create(&old).await.unwrap();
    cloud.clear_calls().await;

    let updated = reconciler.update(&lb.arn, &old, &new).await.unwrap();

    let operations: Vec<_> = cloud
        .mutation_calls()
        .await
        .iter()
        .map(|c| c.operation())
        .collect();
    assert_eq!(
        operations,
        vec![
            "RemoveTags",
            "AddTags",
            "ModifyLoadBalancerAttributes",
            "SetSecurityGroups",
            "SetSubnets",
            "SetIpAddressType",
        ]
    );
    assert!(updated.deletion_protection);
    assert_eq!(updated.ip_address_type, IpAddressType::Dualstack);
    assert_eq!(updated.security_groups, BTreeSet::from(["sg-2".to_string()]));
    assert_eq!(updated.tags, new.tags);
}

#[tokio::test]
async fn test_failed_step_aborts_update_with_context() {
    let (cloud, reconciler) = setup();
    let mut old = application(&["subnet-a"]);
    old.security_groups.insert("sg-1".to_string());
    old.tags.insert("env".to_string(), "a".to_string());
    let mut new = old.clone();
    new.security_groups = BTreeSet::from(["sg-2".to_string()]);
    new.tags.insert("env".to_string(), "b".to_string());
    new.ip_address_type = Some(IpAddressType::Dualstack);

    let lb = reconciler.create(&old).await.unwrap();
    cloud
        .fail_next("SetSecurityGroups", ApiError::Throttled("rate exceeded".to_string()))
        .await;
    cloud.clear_calls().await;

    let err = reconciler.update(&lb.arn, &old, &new).await.unwrap_err();

    match &err {
        ReconcileError::Remote { phase, arn, source } => {
            assert_eq!(*phase, Phase::SecurityGroups);
            assert_eq!(arn, &lb.arn);
            assert!(matches!(source, ApiError::Throttled(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains(&lb.arn));

    // Tags went through, the IP address type was never attempted.
    let tags = cloud.tags(&lb.arn).await.unwrap();
    assert_eq!(tags.get("env").map(String::as_str), Some("b"));
    assert!(
        !cloud
            .calls()
            .await
            .iter()
            .any(|c| matches!(c, ApiCall::SetIpAddressType { .. }))
    );
}

#[tokio::test]
async fn test_create_times_out_while_provisioning() {
    let config = ReconcilerConfig {
        create_timeout: Duration::from_secs(120),
        ..Default::default()
    };
    let (cloud, reconciler) = setup_with(
        SimulationOptions {
            provisioning_reads: 1000,
            ..Default::default()
        },
        config,
    );

    let err = reconciler
        .create(&application(&["subnet-a"]))
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert!(matches!(
        err,
        ReconcileError::Timeout {
            phase: Phase::Create,
            ref last_status,
            ..
        } if last_status == "provisioning"
    ));
    assert_eq!(cloud.load_balancer_count().await, 1);
}

#[tokio::test]
async fn test_failed_state_keeps_waiting_until_deadline() {
    let config = ReconcilerConfig {
        update_timeout: Duration::from_secs(60),
        ..Default::default()
    };
    let (cloud, reconciler) = setup_with(SimulationOptions::default(), config);
    let old = application(&["subnet-a"]);
    let mut new = old.clone();
    new.deletion_protection = true;

    let lb = reconciler.create(&old).await.unwrap();
    cloud
        .force_state(&lb.arn, Some(LoadBalancerState::Failed))
        .await;

    let err = reconciler.update(&lb.arn, &old, &new).await.unwrap_err();
    assert!(matches!(
        err,
        ReconcileError::Timeout {
            phase: Phase::Update,
            ref last_status,
            ..
        } if last_status == "failed"
    ));
}

#[tokio::test]
async fn test_impaired_state_is_not_retried() {
    let (cloud, reconciler) = setup();
    let old = application(&["subnet-a"]);
    let mut new = old.clone();
    new.deletion_protection = true;

    let lb = reconciler.create(&old).await.unwrap();
    cloud
        .force_state(&lb.arn, Some(LoadBalancerState::ActiveImpaired))
        .await;
    cloud.clear_calls().await;

    let err = reconciler.update(&lb.arn, &old, &new).await.unwrap_err();
    assert!(matches!(
        err,
        ReconcileError::UnexpectedState { ref state, .. } if state == "active_impaired"
    ));

    let describes = cloud
        .calls()
        .await
        .iter()
        .filter(|c| matches!(c, ApiCall::DescribeLoadBalancer { .. }))
        .count();
    assert_eq!(describes, 1);
}

#[tokio::test]
async fn test_delete_removes_owned_interfaces() {
    let (cloud, reconciler) = setup();
    let lb = reconciler
        .create(&application(&["subnet-a", "subnet-b"]))
        .await
        .unwrap();
    assert_eq!(cloud.interfaces().await.len(), 2);

    let report = reconciler.delete(&lb.arn).await.unwrap();

    assert!(report.is_clean());
    assert_eq!(report.interfaces_removed, 2);
    assert!(cloud.interfaces().await.is_empty());
    assert!(reconciler.read(&lb.arn).await.unwrap().is_none());
}

#[tokio::test]
async fn test_delete_waits_for_platform_interfaces() {
    let (cloud, reconciler) = setup();
    let lb = reconciler
        .create(&network(&["subnet-a", "subnet-b"]))
        .await
        .unwrap();

    let report = reconciler.delete(&lb.arn).await.unwrap();

    assert!(report.is_clean());
    assert_eq!(report.interfaces_removed, 0);
    assert!(cloud.interfaces().await.is_empty());
    assert!(!cloud.calls().await.iter().any(|c| matches!(
        c,
        ApiCall::DetachNetworkInterface { .. } | ApiCall::DeleteNetworkInterface { .. }
    )));
}

#[tokio::test]
async fn test_delete_succeeds_when_platform_cleanup_times_out() {
    let config = ReconcilerConfig {
        delete_timeout: Duration::from_secs(15),
        ..Default::default()
    };
    let (cloud, reconciler) = setup_with(
        SimulationOptions {
            platform_interface_lifetime: 100,
            ..Default::default()
        },
        config,
    );
    let lb = reconciler
        .create(&network(&["subnet-a", "subnet-b"]))
        .await
        .unwrap();

    let report = reconciler.delete(&lb.arn).await.unwrap();

    assert_eq!(report.warnings.len(), 1);
    assert!(matches!(
        report.warnings[0],
        CleanupWarning::Timeout { remaining: 2, .. }
    ));
    assert_eq!(cloud.load_balancer_count().await, 0);
}

#[tokio::test]
async fn test_delete_succeeds_when_owned_cleanup_fails() {
    let (cloud, reconciler) = setup();
    let lb = reconciler
        .create(&application(&["subnet-a", "subnet-b"]))
        .await
        .unwrap();
    cloud
        .fail_next(
            "DetachNetworkInterface",
            ApiError::call("DetachNetworkInterface", "InternalError"),
        )
        .await;

    let report = reconciler.delete(&lb.arn).await.unwrap();

    assert!(!report.is_clean());
    assert_eq!(report.interfaces_removed, 0);
    assert_eq!(report.warnings.len(), 1);
    assert!(matches!(
        &report.warnings[0],
        CleanupWarning::Remote { arn, source: ApiError::Call { .. } } if arn == &lb.arn
    ));
    assert_eq!(cloud.load_balancer_count().await, 0);
    assert_eq!(cloud.interfaces().await.len(), 2);
}

#[tokio::test]
async fn test_gateway_lifecycle() {
    let (cloud, reconciler) = setup();
    let desired = DesiredLoadBalancer {
        name: Some("gw".to_string()),
        variant: VariantSettings::Gateway(ZonalSettings {
            cross_zone_load_balancing: true,
        }),
        attachments: subnets(&["subnet-a", "subnet-b"]),
        ..Default::default()
    };

    let lb = reconciler.create(&desired).await.unwrap();
    assert_eq!(lb.name, "gw");
    assert!(lb.arn_suffix.starts_with("gwy/gw/"));
    assert_eq!(lb.settings, desired.variant);
    assert_eq!(
        cloud.attribute(&lb.arn, keys::CROSS_ZONE).await.as_deref(),
        Some("true")
    );

    let read = reconciler.read(&lb.arn).await.unwrap().unwrap();
    assert_eq!(read, lb);

    let mut moved = desired.clone();
    moved.attachments = subnets(&["subnet-c"]);
    assert!(matches!(
        reconciler.update(&lb.arn, &desired, &moved).await,
        Err(ReconcileError::ReplacementRequired { .. })
    ));

    let report = reconciler.delete(&lb.arn).await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.interfaces_removed, 0);
    assert!(cloud.interfaces().await.is_empty());
    assert_eq!(cloud.load_balancer_count().await, 0);
}

#[tokio::test]
async fn test_create_with_unbounded_timeouts() {
    let config = ReconcilerConfig {
        create_timeout: Duration::MAX,
        update_timeout: Duration::MAX,
        delete_timeout: Duration::MAX,
        ..Default::default()
    };
    let (cloud, reconciler) = setup_with(SimulationOptions::default(), config);

    let lb = reconciler.create(&network(&["subnet-a"])).await.unwrap();
    let report = reconciler.delete(&lb.arn).await.unwrap();

    assert!(report.is_clean());
    assert_eq!(cloud.load_balancer_count().await, 0);
}

#[tokio::test]
async fn test_delete_missing_load_balancer_is_ok() {
    let (_cloud, reconciler) = setup();
    let arn = "arn:aws:elasticloadbalancing:eu-central-1:123456789012:loadbalancer/app/gone/0123456789abcdef";

    let report = reconciler.delete(arn).await.unwrap();
    assert!(report.is_clean());
}

#[tokio::test]
async fn test_delete_protection_fails_delete() {
    let (cloud, reconciler) = setup();
    let mut desired = application(&["subnet-a"]);
    desired.deletion_protection = true;
    let lb = reconciler.create(&desired).await.unwrap();

    let err = reconciler.delete(&lb.arn).await.unwrap_err();

    assert!(matches!(
        err,
        ReconcileError::Remote {
            phase: Phase::Delete,
            source: ApiError::OperationNotPermitted(_),
            ..
        }
    ));
    assert_eq!(cloud.load_balancer_count().await, 1);
}

#[tokio::test]
async fn test_converge_create_update_replace() {
    let (cloud, reconciler) = setup();
    let first = network(&["subnet-a", "subnet-b"]);

    let created = reconciler.converge(None, None, &first).await.unwrap();
    assert_eq!(created.action, ConvergeAction::Created);
    let arn = created.load_balancer.arn.clone();

    let mut second = first.clone();
    second.variant = VariantSettings::Network(ZonalSettings {
        cross_zone_load_balancing: true,
    });
    let updated = reconciler
        .converge(Some(&arn), Some(&first), &second)
        .await
        .unwrap();
    assert_eq!(updated.action, ConvergeAction::Updated);
    assert_eq!(updated.load_balancer.arn, arn);
    assert_eq!(
        cloud.attribute(&arn, keys::CROSS_ZONE).await.as_deref(),
        Some("true")
    );

    let mut third = second.clone();
    third.attachments = subnets(&["subnet-a", "subnet-c"]);
    let replaced = reconciler
        .converge(Some(&arn), Some(&second), &third)
        .await
        .unwrap();
    assert_eq!(replaced.action, ConvergeAction::Replaced);
    assert_ne!(replaced.load_balancer.arn, arn);
    assert_eq!(replaced.load_balancer.attachments, third.attachments);
    assert_eq!(cloud.load_balancer_count().await, 1);
}

#[tokio::test]
async fn test_converge_without_prior_uses_observed_state() {
    let (cloud, reconciler) = setup();
    let mut desired = application(&["subnet-a"]);
    desired.tags.insert("team".to_string(), "net".to_string());

    let lb = reconciler.create(&desired).await.unwrap();
    cloud.clear_calls().await;

    let converged = reconciler
        .converge(Some(&lb.arn), None, &desired)
        .await
        .unwrap();

    assert_eq!(converged.action, ConvergeAction::Updated);
    assert!(cloud.mutation_calls().await.is_empty());
}

#[tokio::test]
async fn test_converge_recreates_vanished_load_balancer() {
    let (_cloud, reconciler) = setup();
    let desired = application(&["subnet-a"]);
    let arn = "arn:aws:elasticloadbalancing:eu-central-1:123456789012:loadbalancer/app/gone/0123456789abcdef";

    let converged = reconciler
        .converge(Some(arn), Some(&desired), &desired)
        .await
        .unwrap();
    assert_eq!(converged.action, ConvergeAction::Created);
}

#[tokio::test]
async fn test_reconciler_trait() {
    let (cloud, reconciler) = setup();
    let desired = application(&["subnet-a"]);

    let status = reconciler.reconcile(None, None, &desired).await.unwrap();
    reconciler
        .finalize(&status.load_balancer.arn)
        .await
        .unwrap();

    assert_eq!(cloud.load_balancer_count().await, 0);
}

#[tokio::test]
async fn test_invalid_desired_state_rejected() {
    let (cloud, reconciler) = setup();
    let mut desired = application(&["subnet-a"]);
    desired.name = Some("web".to_string());
    desired.name_prefix = Some("web-".to_string());

    let err = reconciler.create(&desired).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Validation(_)));
    assert!(cloud.calls().await.is_empty());
}
