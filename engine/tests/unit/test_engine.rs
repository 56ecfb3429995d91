//! End-to-end engine scenarios driven by shell scripts standing in for the
//! provisioning and configuration tools

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use deploy_engine::deploy::credentials::StaticCredentialProvider;
use deploy_engine::deploy::tools::{ToolSet, ToolSpec};
use deploy_engine::engine::{DeploymentEngine, EngineOptions};
use deploy_engine::errors::EngineError;
use deploy_engine::filesys::dir::Dir;
use deploy_engine::models::deployment::{
    Deployment, DeploymentId, DeploymentParams, DeploymentRequest, DeploymentState, FailureKind,
    Outcome, Provider, StageName, StageStatus, StageUpdate,
};
use deploy_engine::models::log_event::{LogEvent, LogSource, Marker};
use deploy_engine::store::{MemoryStatusStore, StatusStore};

const WAIT: Duration = Duration::from_secs(20);

fn shell(script: &str) -> ToolSpec {
    ToolSpec::new("/bin/sh").with_args(["-c", script])
}

fn tools(provision: &str, configure: &str) -> ToolSet {
    ToolSet {
        provision: shell(provision),
        configure: shell(configure),
        teardown: shell("echo destroyed"),
    }
}

async fn engine_with(tools: ToolSet) -> (Arc<DeploymentEngine>, Dir) {
    engine_configured(tools, |_| {}).await
}

async fn engine_configured<F>(tools: ToolSet, configure: F) -> (Arc<DeploymentEngine>, Dir)
where
    F: FnOnce(&mut EngineOptions),
{
    let workspace = Dir::create_temp_dir("engine-test").await.unwrap();
    let mut options = EngineOptions {
        concurrency: 2,
        cancel_grace: Duration::from_millis(500),
        log_flush_interval: Duration::from_millis(50),
        workspace_dir: workspace.path().to_path_buf(),
        tools,
        ..Default::default()
    };
    configure(&mut options);
    let credentials = StaticCredentialProvider::new().with(Provider::Aws, "AWS_ACCESS_KEY_ID", "test");
    let engine = Arc::new(DeploymentEngine::new(
        options,
        Arc::new(MemoryStatusStore::new()),
        Arc::new(credentials),
    ));
    engine.start().await;
    (engine, workspace)
}

fn request(project: &str) -> DeploymentRequest {
    DeploymentRequest {
        project: project.to_string(),
        provider: "aws".to_string(),
        region: "us-east-1".to_string(),
        instance_size: "1".to_string(),
        branch: None,
        env_vars: BTreeMap::new(),
    }
}

/// Follow the live feed until the transcript closes
async fn drain(engine: &DeploymentEngine, id: &DeploymentId) -> Vec<LogEvent> {
    let mut subscription = engine.stream_logs(id, 0).await.unwrap();
    let mut events = Vec::new();
    tokio::time::timeout(WAIT, async {
        while let Some(event) = subscription.next().await.unwrap() {
            events.push(event);
        }
    })
    .await
    .expect("deployment did not finish in time");
    events
}

fn assert_gapless(events: &[LogEvent]) {
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.sequence, i as u64);
    }
}

#[tokio::test]
async fn test_failed_configuration_records_stage_and_exit_code() {
    let (engine, _workspace) = engine_with(tools(
        "for i in 1 2 3 4 5; do echo provisioning $i; done",
        "echo one; echo two >&2; echo three; exit 1",
    ))
    .await;

    let id = engine.submit_deployment(request("shop")).await.unwrap();
    let events = drain(&engine, &id).await;

    let deployment = engine.get_deployment(&id).await.unwrap();
    assert_eq!(deployment.state, DeploymentState::Failed);
    match deployment.outcome {
        Some(Outcome::Failed {
            stage,
            kind,
            exit_code,
            ..
        }) => {
            assert_eq!(stage, Some(StageName::Configure));
            assert_eq!(kind, FailureKind::StageFailure);
            assert_eq!(exit_code, Some(1));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    // 5 markers: two stage brackets plus the final one
    assert_eq!(events.len(), 13);
    assert_gapless(&events);
    let system = events.iter().filter(|e| e.source == LogSource::System).count();
    assert_eq!(system, 5);
    assert!(events.iter().any(|e| e.source == LogSource::Stderr && e.text == "two"));
    assert!(events.last().unwrap().is_terminal());

    // Stage results point into the transcript
    assert_eq!(deployment.stage_results.len(), 2);
    let provision = &deployment.stage_results[0];
    assert_eq!(provision.status, StageStatus::Ok);
    assert_eq!(provision.log_segment.first_sequence, 0);
    assert_eq!(provision.log_segment.last_sequence, 6);
    let configure = &deployment.stage_results[1];
    assert_eq!(configure.status, StageStatus::Failed);
    assert_eq!(configure.exit_code, Some(1));
    assert_eq!(configure.log_segment.first_sequence, 7);
    assert_eq!(configure.log_segment.last_sequence, 11);

    // The store holds the same transcript the subscriber saw
    assert_eq!(engine.transcript(&id).await.unwrap(), events);

    engine.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_provisioning_outputs_reach_configuration() {
    let (engine, _workspace) = engine_with(tools(
        "echo applying; printf '{{\"public_ip\": {{\"value\": \"10.0.0.5\"}}}}' > outputs.json",
        "echo configuring {output.public_ip} in {region}",
    ))
    .await;

    let id = engine.submit_deployment(request("blog")).await.unwrap();
    let events = drain(&engine, &id).await;

    let deployment = engine.get_deployment(&id).await.unwrap();
    assert_eq!(deployment.state, DeploymentState::Succeeded);
    assert_eq!(deployment.outcome, Some(Outcome::Succeeded));
    assert_eq!(deployment.outputs.get("public_ip").map(String::as_str), Some("10.0.0.5"));
    assert!(deployment.completed_at.is_some());
    assert!(events
        .iter()
        .any(|e| e.text == "configuring 10.0.0.5 in us-east-1"));
    assert!(matches!(
        events.last().and_then(|e| e.marker),
        Some(Marker::DeploymentFinished {
            state: DeploymentState::Succeeded
        })
    ));

    engine.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_cancel_during_provisioning() {
    let (engine, workspace) = engine_with(tools(
        "echo $$ > tool.pid; echo started; exec sleep 30",
        "echo should-not-run",
    ))
    .await;

    let id = engine.submit_deployment(request("shop")).await.unwrap();
    let mut subscription = engine.stream_logs(&id, 0).await.unwrap();
    tokio::time::timeout(WAIT, async {
        while let Some(event) = subscription.next().await.unwrap() {
            if event.text == "started" {
                break;
            }
        }
    })
    .await
    .unwrap();

    // Same target while in flight
    let err = engine.submit_deployment(request("shop")).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
    let err = engine.start_deployment(&id).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyRunning(_)));
    let err = engine.delete_deployment(&id).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));

    let deployment = engine.cancel_deployment(&id).await.unwrap();
    assert_eq!(deployment.state, DeploymentState::Cancelled);

    let events = drain(&engine, &id).await;
    assert_gapless(&events);
    assert!(!events.iter().any(|e| e.text == "should-not-run"));
    assert!(!events.iter().any(|e| matches!(
        e.marker,
        Some(Marker::StageStarted {
            stage: StageName::Configure
        })
    )));

    let pid = workspace
        .subdir(id.as_str())
        .file("tool.pid")
        .read_string()
        .await
        .unwrap();
    let proc_dir = format!("/proc/{}", pid.trim());
    assert!(!Path::new(&proc_dir).exists(), "tool process still running");

    // Cancelling again is rejected
    let err = engine.cancel_deployment(&id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));

    engine.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_late_subscriber_replays_full_transcript() {
    let (engine, _workspace) = engine_with(tools("echo a; echo b", "echo c")).await;

    let id = engine.submit_deployment(request("shop")).await.unwrap();
    let live = drain(&engine, &id).await;

    let mut late = engine.stream_logs(&id, 0).await.unwrap();
    let mut replayed = Vec::new();
    while let Some(event) = late.next().await.unwrap() {
        replayed.push(event);
    }
    assert_eq!(replayed, live);
    assert!(replayed.last().unwrap().is_terminal());

    // Resume after a given event
    let mut resumed = engine.stream_logs(&id, 3).await.unwrap();
    let first = resumed.next().await.unwrap().unwrap();
    assert_eq!(first.sequence, 3);

    engine.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_retry_and_delete_terminal_deployment() {
    let (engine, workspace) = engine_with(tools("echo up", "exit 3")).await;

    let id = engine.submit_deployment(request("shop")).await.unwrap();
    drain(&engine, &id).await;
    assert_eq!(engine.get_status(&id).await.unwrap().state, DeploymentState::Failed);

    let retry = engine.retry_deployment(&id).await.unwrap();
    assert_ne!(retry, id);
    drain(&engine, &retry).await;
    let retried = engine.get_deployment(&retry).await.unwrap();
    assert_eq!(retried.params, engine.get_deployment(&id).await.unwrap().params);

    engine.delete_deployment(&id).await.unwrap();
    assert!(matches!(
        engine.get_status(&id).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(!workspace.subdir(id.as_str()).exists().await);
    assert_eq!(engine.list_deployments(&Default::default()).await.unwrap().len(), 1);

    engine.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_retry_rejected_for_succeeded_deployment() {
    let (engine, _workspace) = engine_with(tools("true", "true")).await;

    let id = engine.submit_deployment(request("shop")).await.unwrap();
    drain(&engine, &id).await;

    let err = engine.retry_deployment(&id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));

    engine.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_missing_tool_is_spawn_error() {
    let mut tools = tools("true", "true");
    tools.provision = ToolSpec::new("/nonexistent/provision-tool");
    let (engine, _workspace) = engine_with(tools).await;

    let id = engine.submit_deployment(request("shop")).await.unwrap();
    let events = drain(&engine, &id).await;

    let deployment = engine.get_deployment(&id).await.unwrap();
    assert_eq!(deployment.state, DeploymentState::Failed);
    assert!(matches!(
        deployment.outcome,
        Some(Outcome::Failed {
            kind: FailureKind::ProcessSpawnError,
            exit_code: None,
            ..
        })
    ));
    assert_eq!(deployment.stage_results[0].status, StageStatus::SpawnError);
    // Markers only: stage bracket and the final marker
    assert_eq!(events.len(), 3);

    engine.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_invalid_requests_are_rejected() {
    let (engine, _workspace) = engine_with(ToolSet::default()).await;

    let mut bad_provider = request("shop");
    bad_provider.provider = "digitalocean".to_string();
    let mut empty_project = request(" ");
    empty_project.provider = "gcp".to_string();
    let mut bad_env = request("shop");
    bad_env.env_vars.insert("1BAD".to_string(), "x".to_string());

    for request in [bad_provider, empty_project, bad_env] {
        let err = engine.submit_deployment(request).await.unwrap_err();
        assert!(matches!(err, EngineError::ValidationError(_)), "{:?}", err);
    }
    assert!(engine.list_deployments(&Default::default()).await.unwrap().is_empty());

    engine.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_recover_fails_stranded_deployments() {
    let workspace = Dir::create_temp_dir("engine-recover").await.unwrap();
    let store: Arc<dyn StatusStore> = Arc::new(MemoryStatusStore::new());

    let stranded = Deployment::new(DeploymentParams {
        project: "shop".to_string(),
        provider: Provider::Gcp,
        region: "us-central1".to_string(),
        instance_size: "2".to_string(),
        branch: "main".to_string(),
        env_vars: BTreeMap::new(),
    });
    store.create(&stranded).await.unwrap();
    store
        .update_stage(&stranded.id, &StageUpdate::state(DeploymentState::Provisioning))
        .await
        .unwrap();

    let engine = DeploymentEngine::new(
        EngineOptions {
            workspace_dir: workspace.path().to_path_buf(),
            ..Default::default()
        },
        store.clone(),
        Arc::new(StaticCredentialProvider::new()),
    );
    assert_eq!(engine.recover().await.unwrap(), 1);

    let recovered = store.get(&stranded.id).await.unwrap();
    assert_eq!(recovered.state, DeploymentState::Failed);
    assert!(matches!(
        recovered.outcome,
        Some(Outcome::Failed {
            kind: FailureKind::Interrupted,
            ..
        })
    ));
    let transcript = store.transcript(&stranded.id).await.unwrap();
    assert_eq!(transcript.len(), 1);
    assert!(transcript[0].is_terminal());

    // Nothing left to recover
    assert_eq!(engine.recover().await.unwrap(), 0);
}

#[tokio::test]
async fn test_cancel_pending_deployment_without_workers() {
    let workspace = Dir::create_temp_dir("engine-pending").await.unwrap();
    let engine = DeploymentEngine::new(
        EngineOptions {
            workspace_dir: workspace.path().to_path_buf(),
            ..Default::default()
        },
        Arc::new(MemoryStatusStore::new()),
        Arc::new(StaticCredentialProvider::new()),
    );

    // Workers never started: the deployment stays queued
    let id = engine.submit_deployment(request("shop")).await.unwrap();
    assert_eq!(engine.get_status(&id).await.unwrap().state, DeploymentState::Pending);

    let cancelled = engine.cancel_deployment(&id).await.unwrap();
    assert_eq!(cancelled.state, DeploymentState::Cancelled);
    assert_eq!(cancelled.outcome, Some(Outcome::Cancelled { stage: None }));

    let transcript = engine.transcript(&id).await.unwrap();
    assert_eq!(transcript.len(), 1);
    assert!(transcript[0].is_terminal());
}

#[tokio::test]
async fn test_single_worker_runs_deployments_in_submit_order() {
    let (engine, workspace) = engine_configured(
        tools(
            "echo start {project} >> ../runs.log; sleep 0.3; echo end {project} >> ../runs.log",
            "echo configured",
        ),
        |options| options.concurrency = 1,
    )
    .await;

    let mut ids = Vec::new();
    for project in ["alpha", "beta", "gamma"] {
        ids.push(engine.submit_deployment(request(project)).await.unwrap());
    }

    // Only one slot: the later submissions wait their turn
    let queued = engine.get_status(&ids[2]).await.unwrap();
    assert_eq!(queued.state, DeploymentState::Pending);

    for id in &ids {
        drain(&engine, id).await;
        let deployment = engine.get_deployment(id).await.unwrap();
        assert_eq!(deployment.state, DeploymentState::Succeeded);
    }

    let runs = workspace.file("runs.log").read_string().await.unwrap();
    let runs: Vec<&str> = runs.lines().collect();
    assert_eq!(
        runs,
        vec![
            "start alpha",
            "end alpha",
            "start beta",
            "end beta",
            "start gamma",
            "end gamma"
        ]
    );

    engine.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_stage_timeout_fails_deployment() {
    let (engine, _workspace) = engine_configured(
        tools("echo started; sleep 30", "echo should-not-run"),
        |options| options.max_stage_duration = Duration::from_millis(300),
    )
    .await;

    let id = engine.submit_deployment(request("shop")).await.unwrap();
    let events = drain(&engine, &id).await;

    let deployment = engine.get_deployment(&id).await.unwrap();
    assert_eq!(deployment.state, DeploymentState::Failed);
    match &deployment.outcome {
        Some(Outcome::Failed { stage, kind, .. }) => {
            assert_eq!(*stage, Some(StageName::Provision));
            assert_eq!(*kind, FailureKind::StageTimeout);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(deployment.stage_results.len(), 1);
    assert_eq!(deployment.stage_results[0].status, StageStatus::Timeout);

    assert_gapless(&events);
    assert!(events.iter().any(|e| e.text == "started"));
    assert!(events.iter().any(|e| e.marker
        == Some(Marker::StageFinished {
            stage: StageName::Provision,
            status: StageStatus::Timeout,
        })));
    assert!(!events.iter().any(|e| e.text == "should-not-run"));
    assert!(matches!(
        events.last().and_then(|e| e.marker),
        Some(Marker::DeploymentFinished {
            state: DeploymentState::Failed
        })
    ));

    engine.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_cancel_reports_error_while_deployment_winds_down() {
    let (engine, _workspace) = engine_configured(
        tools("trap '' TERM; echo started; sleep 30", "echo should-not-run"),
        |options| {
            options.cancel_grace = Duration::from_secs(2);
            options.cancel_timeout = Some(Duration::from_millis(200));
        },
    )
    .await;

    let id = engine.submit_deployment(request("shop")).await.unwrap();
    let mut subscription = engine.stream_logs(&id, 0).await.unwrap();
    tokio::time::timeout(WAIT, async {
        while let Some(event) = subscription.next().await.unwrap() {
            if event.text == "started" {
                break;
            }
        }
    })
    .await
    .unwrap();

    // The tool ignores SIGTERM, so it is still alive when the wait runs out
    let err = engine.cancel_deployment(&id).await.unwrap_err();
    assert!(matches!(err, EngineError::Internal(_)));
    let status = engine.get_status(&id).await.unwrap();
    assert_eq!(status.state, DeploymentState::Provisioning);

    drain(&engine, &id).await;
    let deployment = engine.get_deployment(&id).await.unwrap();
    assert_eq!(deployment.state, DeploymentState::Cancelled);
    assert_eq!(
        deployment.outcome,
        Some(Outcome::Cancelled {
            stage: Some(StageName::Provision)
        })
    );

    engine.shutdown(Duration::from_secs(5)).await.unwrap();
}
