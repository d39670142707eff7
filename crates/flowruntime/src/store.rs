use crate::checkpoint::{Checkpoint, CHECKPOINT_VERSION};
use async_trait::async_trait;
use flowcore::{CheckpointError, FlowError, ResumeError, RunId};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

/// Durable slot per run holding its latest checkpoint.
///
/// A save either becomes fully visible or not at all; a reader never
/// observes a partially written checkpoint.
#[async_trait]
pub trait ContinuationStore: Send + Sync {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    async fn load(&self, run_id: RunId) -> Result<Checkpoint, ResumeError>;

    /// Every run with a stored checkpoint, terminal or not.
    async fn list(&self) -> Result<Vec<RunId>, FlowError>;

    async fn remove(&self, run_id: RunId) -> Result<(), FlowError>;
}

fn decode(run_id: RunId, text: &str) -> Result<Checkpoint, ResumeError> {
    let raw: serde_json::Value = serde_json::from_str(text).map_err(|e| ResumeError::Corrupt {
        run: run_id,
        reason: e.to_string(),
    })?;
    let found = raw
        .get("version")
        .and_then(|v| v.as_u64())
        .map(|v| u32::try_from(v).unwrap_or(u32::MAX))
        .unwrap_or(0);
    if found != CHECKPOINT_VERSION {
        return Err(ResumeError::Version {
            found,
            expected: CHECKPOINT_VERSION,
        });
    }
    serde_json::from_value(raw).map_err(|e| ResumeError::Corrupt {
        run: run_id,
        reason: e.to_string(),
    })
}

/// Keeps encoded checkpoints in memory. Outlives any number of runtimes
/// sharing it, which is how tests simulate a process restart.
#[derive(Default)]
pub struct InMemoryContinuationStore {
    slots: RwLock<HashMap<RunId, String>>,
}

impl InMemoryContinuationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContinuationStore for InMemoryContinuationStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let run = checkpoint.run.id;
        let encoded =
            serde_json::to_string(checkpoint).map_err(|source| CheckpointError::Encode { run, source })?;
        self.slots.write().await.insert(run, encoded);
        Ok(())
    }

    async fn load(&self, run_id: RunId) -> Result<Checkpoint, ResumeError> {
        let slots = self.slots.read().await;
        let text = slots.get(&run_id).ok_or(ResumeError::Missing(run_id))?;
        decode(run_id, text)
    }

    async fn list(&self) -> Result<Vec<RunId>, FlowError> {
        let mut ids: Vec<RunId> = self.slots.read().await.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    async fn remove(&self, run_id: RunId) -> Result<(), FlowError> {
        self.slots
            .write()
            .await
            .remove(&run_id)
            .map(|_| ())
            .ok_or(FlowError::RunNotFound(run_id))
    }
}

/// One `<run-id>.json` file per run under a state directory.
pub struct FileContinuationStore {
    dir: PathBuf,
}

impl FileContinuationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, run_id: RunId) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }

    async fn write_atomically(&self, run_id: RunId, bytes: &[u8]) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let final_path = self.path_for(run_id);
        let temp_path = self
            .dir
            .join(format!(".{run_id}-{}.tmp", uuid::Uuid::new_v4().simple()));

        let mut file = tokio::fs::File::create(&temp_path).await?;
        let written = async {
            file.write_all(bytes).await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e);
        }
        tokio::fs::rename(&temp_path, &final_path).await?;
        sync_dir(&self.dir).await
    }
}

/// Flushes directory entries so a completed rename survives a crash.
#[cfg(unix)]
async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::File::open(dir).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

#[async_trait]
impl ContinuationStore for FileContinuationStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let run = checkpoint.run.id;
        let bytes =
            serde_json::to_vec_pretty(checkpoint).map_err(|source| CheckpointError::Encode { run, source })?;
        self.write_atomically(run, &bytes)
            .await
            .map_err(|source| CheckpointError::Write { run, source })?;
        tracing::debug!(run = %run, path = %self.path_for(run).display(), "checkpoint written");
        Ok(())
    }

    async fn load(&self, run_id: RunId) -> Result<Checkpoint, ResumeError> {
        let text = match tokio::fs::read_to_string(self.path_for(run_id)).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(ResumeError::Missing(run_id)),
            Err(e) => {
                return Err(ResumeError::Corrupt {
                    run: run_id,
                    reason: e.to_string(),
                })
            }
        };
        decode(run_id, &text)
    }

    async fn list(&self) -> Result<Vec<RunId>, FlowError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| uuid::Uuid::parse_str(s).ok())
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn remove(&self, run_id: RunId) -> Result<(), FlowError> {
        match tokio::fs::remove_file(self.path_for(run_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(FlowError::RunNotFound(run_id)),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flowcore::{
        Construct, Definition, EnvMap, FlowGraph, FlowNodeKind, Principal, RunRecord, RunStatus,
    };
    use std::collections::BTreeMap;

    fn checkpoint() -> Checkpoint {
        let mut graph = FlowGraph::new();
        graph.append(FlowNodeKind::Start, vec![], "Start");
        Checkpoint {
            version: CHECKPOINT_VERSION,
            run: RunRecord::new("demo"),
            definition: Definition::new("demo", Construct::step("echo")),
            graph,
            threads: Vec::new(),
            next_thread: 1,
            pending: Vec::new(),
            env_overrides: EnvMap::new(),
            vars: BTreeMap::new(),
            principal: Principal::system(),
            result: RunStatus::Success,
            log: Vec::new(),
            saved_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn file_store_saves_loads_and_lists() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileContinuationStore::new(dir.path().join("runs"));
        assert!(store.list().await.unwrap().is_empty());

        let cp = checkpoint();
        store.save(&cp).await.unwrap();
        store.save(&cp).await.unwrap();

        assert_eq!(store.list().await.unwrap(), vec![cp.run.id]);
        assert_eq!(store.load(cp.run.id).await.unwrap(), cp);

        let leftovers: Vec<_> = std::fs::read_dir(store.dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());

        store.remove(cp.run.id).await.unwrap();
        assert!(matches!(store.load(cp.run.id).await, Err(ResumeError::Missing(_))));
    }

    #[tokio::test]
    async fn truncated_file_is_corrupt_not_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileContinuationStore::new(dir.path());
        let cp = checkpoint();
        store.save(&cp).await.unwrap();
        std::fs::write(dir.path().join(format!("{}.json", cp.run.id)), "{\"version\": 1, \"run\"").unwrap();
        assert!(matches!(store.load(cp.run.id).await, Err(ResumeError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn unknown_version_is_rejected() {
        let store = InMemoryContinuationStore::new();
        let mut cp = checkpoint();
        cp.version = 99;
        store.save(&cp).await.unwrap();
        assert!(matches!(
            store.load(cp.run.id).await,
            Err(ResumeError::Version { found: 99, expected: 1 })
        ));
    }

    #[tokio::test]
    async fn oversized_version_is_a_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileContinuationStore::new(dir.path());
        let cp = checkpoint();
        store.save(&cp).await.unwrap();

        let path = dir.path().join(format!("{}.json", cp.run.id));
        let mut raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        // 2^32 + 1 would read back as version 1 if narrowed
        raw["version"] = serde_json::json!(4_294_967_297u64);
        std::fs::write(&path, raw.to_string()).unwrap();

        assert!(matches!(
            store.load(cp.run.id).await,
            Err(ResumeError::Version { found: u32::MAX, expected: 1 })
        ));
    }

    #[tokio::test]
    async fn save_leaves_only_the_final_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileContinuationStore::new(dir.path().join("nested").join("runs"));
        let cp = checkpoint();
        store.save(&cp).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(store.dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![format!("{}.json", cp.run.id)]);
        assert_eq!(store.load(cp.run.id).await.unwrap(), cp);
    }
}
