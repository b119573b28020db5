// ABOUTME: Integration tests for the container worker command loop
// ABOUTME: Feeds agent events through the queue and checks the workload events that come back

mod support;

use edgenode_container::{
    AgentEvent, AgreementLaunchContext, ContainerWorker, WorkerCommand, WorkerConfig,
    WorkloadEvent,
};
use pretty_assertions::assert_eq;
use rstest::rstest;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use support::{agreement, deployment, env, Harness, SHARED_GPS};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

fn worker(h: &Harness) -> ContainerWorker {
    let mut config = WorkerConfig::new(h.storage.path());
    config.image_dir = PathBuf::from("/images");
    config.command_queue_capacity = 4;
    ContainerWorker::new(h.orchestrator.clone(), &config)
}

fn launch(agreement_id: &str, deployment: &str) -> AgreementLaunchContext {
    AgreementLaunchContext {
        agreement_id: agreement_id.to_string(),
        deployment: deployment.to_string(),
        environment_additions: env(),
        config_payload: b"{}".to_vec(),
    }
}

async fn next(events: &mut UnboundedReceiver<WorkloadEvent>) -> WorkloadEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no workload event within five seconds")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_configure_then_end_agreement() {
    let h = Harness::new(&["a:1"]);
    let mut worker = worker(&h);
    let mut events = worker.messages().unwrap();
    let ag = agreement(1);
    worker.start().unwrap();

    worker
        .new_event(AgentEvent::ImagesFetched {
            image_files: vec!["a.tar".to_string()],
            launch: launch(&ag, r#"{"services":{"a":{"image":"a:1"}}}"#),
        })
        .await
        .unwrap();

    match next(&mut events).await {
        WorkloadEvent::ExecutionBegun {
            agreement_id,
            deployment,
        } => {
            assert_eq!(agreement_id, ag);
            assert_eq!(deployment.len(), 1);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(h.runtime.archives(), vec![PathBuf::from("/images/a.tar")]);
    assert_eq!(h.runtime.container_names(), vec![format!("{}-a", ag)]);

    worker
        .new_event(AgentEvent::AgreementEnded {
            agreement_ids: vec![ag.clone()],
            current_agreement_id: ag.clone(),
            deployment: None,
        })
        .await
        .unwrap();

    assert_eq!(
        next(&mut events).await,
        WorkloadEvent::PatternDestroyed {
            agreement_id: ag.clone()
        }
    );
    assert!(h.runtime.container_names().is_empty());

    worker.stop().await.unwrap();
}

#[tokio::test]
async fn test_image_load_failure_reports_without_deployment() {
    let h = Harness::new(&["a:1"]);
    h.runtime.fail_archives();
    let mut worker = worker(&h);
    let mut events = worker.messages().unwrap();
    worker.start().unwrap();

    worker
        .new_event(AgentEvent::ImagesFetched {
            image_files: vec!["a.tar".to_string()],
            launch: launch(&agreement(1), r#"{"services":{"a":{"image":"a:1"}}}"#),
        })
        .await
        .unwrap();

    assert!(matches!(
        next(&mut events).await,
        WorkloadEvent::ExecutionFailed { deployment: None, .. }
    ));
    assert!(h.runtime.container_names().is_empty());

    worker.stop().await.unwrap();
}

#[tokio::test]
async fn test_create_failure_reports_partial_deployment() {
    let h = Harness::new(&[]);
    let mut worker = worker(&h);
    let mut events = worker.messages().unwrap();
    worker.start().unwrap();

    worker
        .new_event(AgentEvent::ImagesFetched {
            image_files: Vec::new(),
            launch: launch(&agreement(1), r#"{"services":{"a":{"image":"a:1"}}}"#),
        })
        .await
        .unwrap();

    match next(&mut events).await {
        WorkloadEvent::ExecutionFailed {
            deployment: Some(partial),
            reason,
            ..
        } => {
            assert_eq!(partial.len(), 1);
            assert!(reason.contains("a:1"), "reason was {}", reason);
        }
        other => panic!("unexpected event {:?}", other),
    }

    worker.stop().await.unwrap();
}

#[tokio::test]
async fn test_malformed_deployment_fails_execution() {
    let h = Harness::new(&[]);
    let mut worker = worker(&h);
    let mut events = worker.messages().unwrap();
    let handler = worker.command_handler();

    assert!(
        handler
            .handle(WorkerCommand::Configure {
                image_files: Vec::new(),
                launch: launch(&agreement(1), "{not json"),
            })
            .await
    );

    assert!(matches!(
        events.try_recv().unwrap(),
        WorkloadEvent::ExecutionFailed { deployment: None, .. }
    ));
}

#[tokio::test]
async fn test_maintain_reports_missing_containers() {
    let h = Harness::new(&["gps:1", "app:1"]);
    let ag = agreement(1);
    let configs = h
        .orchestrator
        .create(&ag, &deployment(SHARED_GPS), &env(), b"{}")
        .await
        .unwrap();

    let mut worker = worker(&h);
    let mut events = worker.messages().unwrap();
    let handler = worker.command_handler();

    let maintain = || WorkerCommand::Maintain {
        agreement_id: ag.clone(),
        deployment: configs.clone(),
    };

    assert!(handler.handle(maintain()).await);
    assert!(events.try_recv().is_err());

    h.runtime.stop("singleton-gps");
    assert!(handler.handle(maintain()).await);
    match events.try_recv().unwrap() {
        WorkloadEvent::ExecutionFailed {
            agreement_id,
            deployment,
            reason,
        } => {
            assert_eq!(agreement_id, ag);
            assert_eq!(deployment, Some(configs.clone()));
            assert_eq!(reason, "1 of 2 containers running");
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[rstest]
#[case::only_current(vec![])]
#[case::current_also_listed(vec![agreement(1)])]
#[tokio::test]
async fn test_shutdown_removes_current_agreement(#[case] agreement_ids: Vec<String>) {
    let h = Harness::new(&["a:1"]);
    let ag = agreement(1);
    h.orchestrator
        .create(&ag, &deployment(r#"{"services":{"a":{"image":"a:1"}}}"#), &env(), b"{}")
        .await
        .unwrap();

    let mut worker = worker(&h);
    let mut events = worker.messages().unwrap();
    let handler = worker.command_handler();

    assert!(
        handler
            .handle(WorkerCommand::Shutdown {
                agreement_ids,
                current_agreement_id: ag.clone(),
                deployment: None,
            })
            .await
    );

    assert!(h.runtime.container_names().is_empty());
    assert!(h.runtime.network_names().is_empty());
    assert!(!h.storage_dir(&ag).exists());
    assert_eq!(
        events.try_recv().unwrap(),
        WorkloadEvent::PatternDestroyed { agreement_id: ag }
    );
}

#[tokio::test]
async fn test_sync_resources_reports_success() {
    let h = Harness::new(&["a:1"]);
    let desc = deployment(r#"{"services":{"a":{"image":"a:1"}}}"#);
    let stale = agreement(2);
    h.orchestrator.create(&stale, &desc, &env(), b"{}").await.unwrap();

    let mut worker = worker(&h);
    let mut events = worker.messages().unwrap();
    worker.start().unwrap();

    worker
        .enqueue(WorkerCommand::SyncResources {
            known_agreements: HashSet::new(),
        })
        .await
        .unwrap();

    assert_eq!(
        next(&mut events).await,
        WorkloadEvent::ContainersSynced { successful: true }
    );
    assert!(h.runtime.container_names().is_empty());

    worker.stop().await.unwrap();
}

#[tokio::test]
async fn test_worker_starts_once() {
    let h = Harness::new(&[]);
    let mut worker = worker(&h);

    worker.start().unwrap();
    assert!(worker.start().is_err());
    assert!(worker.messages().is_some());
    assert!(worker.messages().is_none());

    worker.stop().await.unwrap();
    worker.stop().await.unwrap();
}

#[tokio::test]
async fn test_terminate_stops_processing() {
    let h = Harness::new(&[]);
    let worker = worker(&h);
    let handler = worker.command_handler();

    assert!(!handler.handle(WorkerCommand::Terminate).await);
}
