//! Provider failures, retries and partial results.

mod common;

use common::{bucket, urn, TestDeployment};
use converge_engine::config::{EngineConfig, RetryConfig};
use converge_engine::deploy::{StepKind, StepStatus};

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let test = TestDeployment::new();
    test.provider.fail("a", "create", Some(2), true);

    let report = test.deploy(vec![bucket("a", "small")]).await;

    assert!(report.is_success());
    let step = report.step(&urn("a"), StepKind::Create).unwrap();
    assert_eq!(step.attempts, 3);
    assert_eq!(test.provider.count("create", "a"), 3);
    assert_eq!(test.resource_names().await, vec!["a".to_string()]);
}

#[tokio::test]
async fn test_retries_stop_at_the_attempt_limit() {
    let test = TestDeployment::new();
    test.provider.fail("a", "create", None, true);

    let report = test.deploy(vec![bucket("a", "small")]).await;

    let step = report.step(&urn("a"), StepKind::Create).unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(step.attempts, 3);
    assert!(step.error.as_deref().unwrap().contains("Maximum retry attempts"));
    assert!(test.resource_names().await.is_empty());
}

#[tokio::test]
async fn test_terminal_failure_is_not_retried_and_halts() {
    let test = TestDeployment::new().sequential();
    test.provider.fail("a", "create", None, false);

    let report = test
        .deploy(vec![bucket("a", "small"), bucket("b", "small")])
        .await;

    assert!(!report.is_success());
    assert_eq!(test.provider.count("create", "a"), 1);
    assert_eq!(report.failed, 1);
    assert_eq!(
        report.step(&urn("b"), StepKind::Create).unwrap().status,
        StepStatus::Skipped
    );
    assert_eq!(test.provider.count("create", "b"), 0);

    let snapshot = test.snapshot().await;
    assert!(snapshot.pending_operations.is_empty());
    assert!(snapshot.find(&urn("a")).is_none());
}

#[tokio::test]
async fn test_continue_on_error_skips_only_dependents() {
    let test = TestDeployment::new().with_config(
        EngineConfig::default()
            .with_continue_on_error(true)
            .with_retry(RetryConfig::none()),
    );
    test.provider.fail("a", "create", None, false);

    let report = test
        .deploy(vec![
            bucket("a", "small"),
            bucket("b", "small").depends_on(urn("a")),
            bucket("c", "small").depends_on(urn("b")),
            bucket("d", "small"),
        ])
        .await;

    assert_eq!(report.failed, 1);
    assert_eq!(report.skipped, 2);
    let b = report.step(&urn("b"), StepKind::Create).unwrap();
    assert_eq!(b.status, StepStatus::Skipped);
    assert!(b.error.as_deref().unwrap().contains(urn("a").as_str()));
    let c = report.step(&urn("c"), StepKind::Create).unwrap();
    assert!(c.error.as_deref().unwrap().contains(urn("b").as_str()));
    assert_eq!(
        report.step(&urn("d"), StepKind::Create).unwrap().status,
        StepStatus::Succeeded
    );
    assert_eq!(test.resource_names().await, vec!["d".to_string()]);
}

#[tokio::test]
async fn test_failed_update_keeps_prior_state() {
    let test = TestDeployment::new();
    test.deploy(vec![bucket("a", "small")]).await;
    test.provider.fail("a", "update", None, false);

    let report = test.deploy(vec![bucket("a", "large")]).await;

    assert_eq!(
        report.step(&urn("a"), StepKind::Update).unwrap().status,
        StepStatus::Failed
    );
    let snapshot = test.snapshot().await;
    assert_eq!(snapshot.find(&urn("a")).unwrap().inputs["size"].as_str(), Some("small"));
}

#[tokio::test]
async fn test_partial_create_is_recorded_and_finished_later() {
    let test = TestDeployment::new();
    test.provider.partial_create("a");

    let report = test.deploy(vec![bucket("a", "small")]).await;

    let step = report.step(&urn("a"), StepKind::Create).unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert!(report.warnings.iter().any(|w| w.contains("partially")));
    let snapshot = test.snapshot().await;
    let a = snapshot.find(&urn("a")).unwrap();
    assert!(a.is_partial());
    assert_eq!(a.id.as_deref(), Some("a-1"));
    assert!(snapshot.has_partial_resources());

    let report = test.deploy(vec![bucket("a", "small")]).await;

    assert_eq!(
        report.step(&urn("a"), StepKind::Update).unwrap().status,
        StepStatus::Succeeded
    );
    let snapshot = test.snapshot().await;
    let a = snapshot.find(&urn("a")).unwrap();
    assert!(!a.is_partial());
    assert_eq!(a.id.as_deref(), Some("a-1"));
    assert_eq!(test.provider.count("create", "a"), 1);
}

#[tokio::test]
async fn test_rejected_inputs_fail_before_create() {
    let test = TestDeployment::new();
    test.provider.reject("a");

    let report = test.deploy(vec![bucket("a", "huge")]).await;

    let step = report.step(&urn("a"), StepKind::Create).unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert!(step.error.as_deref().unwrap().contains("unsupported size"));
    assert_eq!(test.provider.count("create", "a"), 0);
}

#[tokio::test]
async fn test_failed_delete_blocks_deletes_it_protects() {
    let test = TestDeployment::new().with_config(
        EngineConfig::default()
            .with_continue_on_error(true)
            .with_retry(RetryConfig::none()),
    );
    test.deploy(vec![bucket("a", "small"), bucket("b", "small").depends_on(urn("a"))])
        .await;
    test.provider.fail("b", "delete", None, false);

    let report = test.deploy(Vec::new()).await;

    assert_eq!(
        report.step(&urn("b"), StepKind::Delete).unwrap().status,
        StepStatus::Failed
    );
    assert_eq!(
        report.step(&urn("a"), StepKind::Delete).unwrap().status,
        StepStatus::Skipped
    );
    assert_eq!(test.resource_names().await, vec!["a".to_string(), "b".to_string()]);
    test.snapshot().await.verify_integrity().unwrap();
}
