//! Status store tests, run against both implementations

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};

use deploy_engine::errors::EngineError;
use deploy_engine::filesys::dir::Dir;
use deploy_engine::models::deployment::{
    Deployment, DeploymentParams, DeploymentState, FailureKind, ListFilter, Outcome, Provider,
    StageUpdate,
};
use deploy_engine::models::log_event::{LogEvent, LogSource};
use deploy_engine::store::{FileStatusStore, MemoryStatusStore, StatusStore};

fn deployment(project: &str, provider: Provider) -> Deployment {
    Deployment::new(DeploymentParams {
        project: project.to_string(),
        provider,
        region: "us-east-1".to_string(),
        instance_size: "1".to_string(),
        branch: "main".to_string(),
        env_vars: BTreeMap::new(),
    })
}

fn events(deployment: &Deployment, range: std::ops::Range<u64>) -> Vec<LogEvent> {
    range
        .map(|sequence| LogEvent {
            deployment_id: deployment.id.clone(),
            sequence,
            timestamp: Utc::now(),
            source: LogSource::Stdout,
            text: format!("line {}", sequence),
            marker: None,
        })
        .collect()
}

async fn stores() -> Vec<(&'static str, Arc<dyn StatusStore>)> {
    let dir = Dir::create_temp_dir("store-test").await.unwrap();
    vec![
        ("memory", Arc::new(MemoryStatusStore::new())),
        ("file", Arc::new(FileStatusStore::open(dir).await.unwrap())),
    ]
}

#[tokio::test]
async fn test_create_get_and_duplicate() {
    for (name, store) in stores().await {
        let d = deployment("shop", Provider::Aws);
        store.create(&d).await.unwrap();

        let loaded = store.get(&d.id).await.unwrap();
        assert_eq!(loaded, d, "{}", name);

        let err = store.create(&d).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)), "{}", name);
    }
}

#[tokio::test]
async fn test_missing_deployment_is_not_found() {
    for (name, store) in stores().await {
        let d = deployment("ghost", Provider::Gcp);
        assert!(matches!(store.get(&d.id).await, Err(EngineError::NotFound(_))), "{}", name);
        assert!(matches!(store.transcript(&d.id).await, Err(EngineError::NotFound(_))), "{}", name);
        assert!(matches!(store.delete(&d.id).await, Err(EngineError::NotFound(_))), "{}", name);
        assert!(matches!(
            store.update_stage(&d.id, &StageUpdate::state(DeploymentState::Provisioning)).await,
            Err(EngineError::NotFound(_))
        ), "{}", name);
    }
}

#[tokio::test]
async fn test_update_stage_applies_transitions() {
    for (name, store) in stores().await {
        let d = deployment("shop", Provider::Aws);
        store.create(&d).await.unwrap();

        let running = store
            .update_stage(&d.id, &StageUpdate::state(DeploymentState::Provisioning))
            .await
            .unwrap();
        assert_eq!(running.state, DeploymentState::Provisioning, "{}", name);
        assert!(running.started_at.is_some(), "{}", name);

        let outcome = Outcome::Failed {
            stage: None,
            kind: FailureKind::StageFailure,
            exit_code: Some(2),
            reason: "exit 2".to_string(),
        };
        store
            .update_stage(
                &d.id,
                &StageUpdate::state(DeploymentState::Failed).with_outcome(outcome.clone()),
            )
            .await
            .unwrap();

        let loaded = store.get(&d.id).await.unwrap();
        assert_eq!(loaded.state, DeploymentState::Failed, "{}", name);
        assert_eq!(loaded.outcome, Some(outcome), "{}", name);
        assert!(loaded.completed_at.is_some(), "{}", name);
    }
}

#[tokio::test]
async fn test_append_log_segment_is_idempotent() {
    for (name, store) in stores().await {
        let d = deployment("shop", Provider::Aws);
        store.create(&d).await.unwrap();

        store.append_log_segment(&d.id, &events(&d, 0..3)).await.unwrap();
        // Overlapping resend: 1 and 2 are already stored
        store.append_log_segment(&d.id, &events(&d, 1..5)).await.unwrap();
        store.append_log_segment(&d.id, &[]).await.unwrap();

        let transcript = store.transcript(&d.id).await.unwrap();
        let sequences: Vec<u64> = transcript.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3, 4], "{}", name);

        let err = store.append_log_segment(&d.id, &events(&d, 7..8)).await.unwrap_err();
        assert!(matches!(err, EngineError::StorageError(_)), "{}", name);
    }
}

#[tokio::test]
async fn test_list_filters_newest_first() {
    for (name, store) in stores().await {
        let mut older = deployment("shop", Provider::Aws);
        older.created_at = Utc::now() - ChronoDuration::minutes(5);
        let newer = deployment("shop", Provider::Aws);
        let other = deployment("blog", Provider::Gcp);
        for d in [&older, &newer, &other] {
            store.create(d).await.unwrap();
        }
        store
            .update_stage(
                &other.id,
                &StageUpdate::state(DeploymentState::Cancelled)
                    .with_outcome(Outcome::Cancelled { stage: None }),
            )
            .await
            .unwrap();

        let all = store.list(&ListFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3, "{}", name);
        assert!(all.windows(2).all(|w| w[0].created_at >= w[1].created_at), "{}", name);

        let shop = store
            .list(&ListFilter {
                project: Some("shop".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let ids: Vec<_> = shop.iter().map(|d| d.id.clone()).collect();
        assert_eq!(ids, vec![newer.id.clone(), older.id.clone()], "{}", name);

        let active = store.list(&ListFilter::non_terminal()).await.unwrap();
        assert_eq!(active.len(), 2, "{}", name);

        let gcp = store
            .list(&ListFilter {
                provider: Some(Provider::Gcp),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(gcp.len(), 1, "{}", name);
        assert_eq!(gcp[0].state, DeploymentState::Cancelled, "{}", name);
    }
}

#[tokio::test]
async fn test_delete_removes_record_and_transcript() {
    for (name, store) in stores().await {
        let d = deployment("shop", Provider::Azure);
        store.create(&d).await.unwrap();
        store.append_log_segment(&d.id, &events(&d, 0..2)).await.unwrap();

        store.delete(&d.id).await.unwrap();
        assert!(matches!(store.get(&d.id).await, Err(EngineError::NotFound(_))), "{}", name);
        assert!(store.list(&ListFilter::default()).await.unwrap().is_empty(), "{}", name);
    }
}

#[tokio::test]
async fn test_file_store_survives_reopen() {
    let dir = Dir::create_temp_dir("store-reopen").await.unwrap();
    let d = deployment("shop", Provider::Aws);
    {
        let store = FileStatusStore::open(dir.clone()).await.unwrap();
        store.create(&d).await.unwrap();
        store
            .update_stage(&d.id, &StageUpdate::state(DeploymentState::Provisioning))
            .await
            .unwrap();
        store.append_log_segment(&d.id, &events(&d, 0..3)).await.unwrap();
    }

    let store = FileStatusStore::open(dir).await.unwrap();
    assert_eq!(store.get(&d.id).await.unwrap().state, DeploymentState::Provisioning);
    assert_eq!(store.transcript(&d.id).await.unwrap().len(), 3);

    // The reopened store learns the stored length from disk
    store.append_log_segment(&d.id, &events(&d, 2..4)).await.unwrap();
    assert_eq!(store.transcript(&d.id).await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_file_store_skips_corrupt_records() {
    let dir = Dir::create_temp_dir("store-corrupt").await.unwrap();
    let store = FileStatusStore::open(dir.clone()).await.unwrap();
    let d = deployment("shop", Provider::Aws);
    store.create(&d).await.unwrap();

    dir.subdir("broken")
        .file("deployment.json")
        .write_string("{ not json")
        .await
        .unwrap();

    let listed = store.list(&ListFilter::default()).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, d.id);
}

#[tokio::test]
async fn test_file_store_ignores_torn_transcript_tail() {
    let dir = Dir::create_temp_dir("store-torn").await.unwrap();
    let store = FileStatusStore::open(dir.clone()).await.unwrap();
    let d = deployment("shop", Provider::Aws);
    store.create(&d).await.unwrap();
    store.append_log_segment(&d.id, &events(&d, 0..2)).await.unwrap();

    let transcript_file = dir.subdir(d.id.as_str()).file("transcript.jsonl");
    let mut contents = transcript_file.read_string().await.unwrap();
    contents.push_str("{\"deployment_id\": \"");
    transcript_file.write_string(&contents).await.unwrap();

    assert_eq!(store.transcript(&d.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_file_store_appends_after_torn_tail() {
    let dir = Dir::create_temp_dir("store-torn-append").await.unwrap();
    let d = deployment("shop", Provider::Aws);
    {
        let store = FileStatusStore::open(dir.clone()).await.unwrap();
        store.create(&d).await.unwrap();
        store.append_log_segment(&d.id, &events(&d, 0..2)).await.unwrap();
    }

    // Crash halfway through writing the next line
    let transcript_file = dir.subdir(d.id.as_str()).file("transcript.jsonl");
    let mut contents = transcript_file.read_string().await.unwrap();
    contents.push_str("{\"deployment_id\": \"");
    transcript_file.write_string(&contents).await.unwrap();

    let store = FileStatusStore::open(dir.clone()).await.unwrap();
    store.append_log_segment(&d.id, &events(&d, 2..4)).await.unwrap();

    let transcript = store.transcript(&d.id).await.unwrap();
    let sequences: Vec<u64> = transcript.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![0, 1, 2, 3]);
    assert!(transcript_file.read_string().await.unwrap().ends_with('\n'));
}

#[tokio::test]
async fn test_file_store_keeps_unterminated_complete_line() {
    let dir = Dir::create_temp_dir("store-unterminated").await.unwrap();
    let d = deployment("shop", Provider::Aws);
    {
        let store = FileStatusStore::open(dir.clone()).await.unwrap();
        store.create(&d).await.unwrap();
        store.append_log_segment(&d.id, &events(&d, 0..3)).await.unwrap();
    }

    // Last newline never reached the disk
    let transcript_file = dir.subdir(d.id.as_str()).file("transcript.jsonl");
    let contents = transcript_file.read_string().await.unwrap();
    transcript_file
        .write_string(contents.trim_end_matches('\n'))
        .await
        .unwrap();

    let store = FileStatusStore::open(dir).await.unwrap();
    store.append_log_segment(&d.id, &events(&d, 0..5)).await.unwrap();

    let sequences: Vec<u64> = store
        .transcript(&d.id)
        .await
        .unwrap()
        .iter()
        .map(|e| e.sequence)
        .collect();
    assert_eq!(sequences, vec![0, 1, 2, 3, 4]);
}
