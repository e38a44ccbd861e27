use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tempfile::TempDir;

use warden::store::{Artifact, Session, SessionStatus, Store, StoreError};

async fn open_store(temp: &TempDir) -> Store {
    Store::open(
        &temp.path().join("state/metadata.db"),
        &temp.path().join("state/artifacts"),
    )
    .await
    .unwrap()
}

fn sample_artifact(session_id: &str, path: &str, content: &[u8]) -> Artifact {
    Artifact {
        id: format!("art-{session_id}-1"),
        session_id: session_id.to_string(),
        path: path.to_string(),
        kind: "tool_output".to_string(),
        created_at: warden::store::now_secs(),
        digest: format!("{:x}", Sha256::digest(content)),
    }
}

#[tokio::test]
async fn test_session_round_trip() {
    let temp = TempDir::new().unwrap();
    let store = open_store(&temp).await;

    let mut metadata = HashMap::new();
    metadata.insert("spec".to_string(), "/tmp/task.yaml".to_string());
    metadata.insert("env".to_string(), "test".to_string());

    let session = Session::new("sess-1", metadata.clone());
    store.create_session(&session).await.unwrap();

    let loaded = store.get_session("sess-1").await.unwrap();
    assert_eq!(loaded.id, "sess-1");
    assert_eq!(loaded.status, SessionStatus::Initialized);
    assert_eq!(loaded.metadata, metadata);

    let mut updated = loaded;
    updated.status = SessionStatus::Running;
    store.update_session(&updated).await.unwrap();

    let reloaded = store.get_session("sess-1").await.unwrap();
    assert_eq!(reloaded.status, SessionStatus::Running);
    assert!(reloaded.updated_at >= reloaded.created_at);
}

#[tokio::test]
async fn test_get_missing_session() {
    let temp = TempDir::new().unwrap();
    let store = open_store(&temp).await;

    let result = store.get_session("no-such-session").await;
    assert!(matches!(result, Err(StoreError::SessionNotFound(_))));
}

#[tokio::test]
async fn test_artifact_round_trip_and_digest() {
    let temp = TempDir::new().unwrap();
    let store = open_store(&temp).await;

    store
        .create_session(&Session::new("sess-2", HashMap::new()))
        .await
        .unwrap();

    let content = b"raw tool output\nwith a second line";
    let artifact = sample_artifact("sess-2", "artifacts/sess-2/run_shell_call-1.txt", content);
    store.save_artifact(&artifact, content).await.unwrap();

    let (loaded, bytes) = store.get_artifact(&artifact.id).await.unwrap();
    assert_eq!(bytes, content);
    assert_eq!(loaded.digest, format!("{:x}", Sha256::digest(content)));
    assert_eq!(loaded.session_id, "sess-2");

    // The content file exists under the artifact root.
    let on_disk = store.artifact_root().join(&loaded.path);
    assert!(on_disk.exists());
}

#[tokio::test]
async fn test_artifact_traversal_rejected_without_write() {
    let temp = TempDir::new().unwrap();
    let store = open_store(&temp).await;

    for path in ["../escape.txt", "/etc/hostile", "a/../../b.txt"] {
        let artifact = sample_artifact("sess-3", path, b"nope");
        let result = store.save_artifact(&artifact, b"nope").await;
        assert!(
            matches!(result, Err(StoreError::PathTraversal(_))),
            "expected traversal rejection for {path}"
        );
    }

    // Nothing escaped next to the root.
    assert!(!temp.path().join("state/escape.txt").exists());
    assert!(!temp.path().join("escape.txt").exists());
    assert!(store.list_artifacts("sess-3").await.unwrap().is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn test_artifact_written_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let temp = TempDir::new().unwrap();
    let store = open_store(&temp).await;

    store
        .create_session(&Session::new("sess-4", HashMap::new()))
        .await
        .unwrap();

    let artifact = sample_artifact("sess-4", "artifacts/sess-4/out.txt", b"x");
    store.save_artifact(&artifact, b"x").await.unwrap();

    let mode = std::fs::metadata(store.artifact_root().join(&artifact.path))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[tokio::test]
async fn test_list_artifacts_per_session() {
    let temp = TempDir::new().unwrap();
    let store = open_store(&temp).await;

    store
        .create_session(&Session::new("sess-5", HashMap::new()))
        .await
        .unwrap();
    store
        .create_session(&Session::new("sess-6", HashMap::new()))
        .await
        .unwrap();

    for (session, name) in [("sess-5", "a"), ("sess-5", "b"), ("sess-6", "c")] {
        let mut artifact =
            sample_artifact(session, &format!("artifacts/{session}/{name}.txt"), b"x");
        artifact.id = format!("art-{session}-{name}");
        store.save_artifact(&artifact, b"x").await.unwrap();
    }

    assert_eq!(store.list_artifacts("sess-5").await.unwrap().len(), 2);
    assert_eq!(store.list_artifacts("sess-6").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_config_round_trip() {
    let temp = TempDir::new().unwrap();
    let store = open_store(&temp).await;

    assert_eq!(store.get_config("provider").await.unwrap(), None);

    store.set_config("provider", "stub").await.unwrap();
    assert_eq!(
        store.get_config("provider").await.unwrap(),
        Some("stub".to_string())
    );

    // Upsert overwrites.
    store.set_config("provider", "openai").await.unwrap();
    assert_eq!(
        store.get_config("provider").await.unwrap(),
        Some("openai".to_string())
    );

    // The store treats sensitive-looking values as opaque.
    store.set_config("openai_api_key", "enc:v1:abc").await.unwrap();
    assert_eq!(
        store.get_config("openai_api_key").await.unwrap(),
        Some("enc:v1:abc".to_string())
    );
}

#[tokio::test]
async fn test_memory_add_and_search() {
    let temp = TempDir::new().unwrap();
    let store = open_store(&temp).await;

    let mut meta = HashMap::new();
    meta.insert("goal".to_string(), "demo".to_string());

    store
        .add_memory("close match", &[1.0, 0.0, 0.0], meta.clone())
        .await
        .unwrap();
    store
        .add_memory("far match", &[0.0, 1.0, 0.0], HashMap::new())
        .await
        .unwrap();

    let results = store.search_memory(&[0.9, 0.1, 0.0], 2).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].content, "close match");
    assert_eq!(results[0].metadata.get("goal").unwrap(), "demo");
    assert!(results[0].similarity > results[1].similarity);
}

#[tokio::test]
async fn test_memory_zero_query_returns_empty() {
    let temp = TempDir::new().unwrap();
    let store = open_store(&temp).await;

    store
        .add_memory("anything", &[1.0, 0.0], HashMap::new())
        .await
        .unwrap();

    let results = store.search_memory(&[0.0, 0.0], 3).await.unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn test_memory_index_rebuilds_after_reopen() {
    let temp = TempDir::new().unwrap();

    {
        let store = open_store(&temp).await;
        store
            .add_memory("persisted lesson", &[0.5, 0.5], HashMap::new())
            .await
            .unwrap();
        store.close().await.unwrap();
    }

    // Fresh process: the index starts empty and is rebuilt lazily from
    // the database on first search.
    let store = open_store(&temp).await;
    let results = store.search_memory(&[0.5, 0.5], 1).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].content, "persisted lesson");
    assert!((results[0].similarity - 1.0).abs() < 1e-6);
}

#[tokio::test]
async fn test_memory_topk_sorted_and_bounded() {
    let temp = TempDir::new().unwrap();
    let store = open_store(&temp).await;

    // Deterministic spread of vectors around the plane.
    let mut seed = 7u64;
    for i in 0..40 {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let x = ((seed >> 33) as f32 / u32::MAX as f32) * 2.0 - 1.0;
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let y = ((seed >> 33) as f32 / u32::MAX as f32) * 2.0 - 1.0;
        store
            .add_memory(&format!("m{i}"), &[x, y], HashMap::new())
            .await
            .unwrap();
    }

    for k in [1usize, 3, 10, 40, 100] {
        let results = store.search_memory(&[0.7, -0.2], k).await.unwrap();
        assert!(results.len() <= k);
        for pair in results.windows(2) {
            assert!(pair[0].similarity >= pair[1].similarity);
        }
        for item in &results {
            assert!(item.similarity >= -1.0 - 1e-5);
            assert!(item.similarity <= 1.0 + 1e-5);
        }
    }
}

#[tokio::test]
async fn test_memory_length_mismatch_scores_zero() {
    let temp = TempDir::new().unwrap();
    let store = open_store(&temp).await;

    store
        .add_memory("short vector", &[1.0, 0.0], HashMap::new())
        .await
        .unwrap();
    store
        .add_memory("full vector", &[1.0, 0.0, 0.0], HashMap::new())
        .await
        .unwrap();

    let results = store.search_memory(&[1.0, 0.0, 0.0], 2).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].content, "full vector");
    assert_eq!(results[1].similarity, 0.0);
}
