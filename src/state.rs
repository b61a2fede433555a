use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Initialized,
    InProgress,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

/// One end-to-end video generation attempt with its per-stage checkpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    #[serde(default)]
    pub niche: String,
    #[serde(default)]
    pub language: String,
    pub status: RunStatus,
    pub steps_completed: Vec<String>,
    pub data: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Run {
    pub fn stage_payload(&self, stage: &str) -> Option<&Value> {
        self.data.get(stage)
    }
}

/// Durable store for run checkpoints. The whole document (run id -> Run) is
/// rewritten via write-temp-then-rename on every mutation, so a crash leaves
/// either the previous document or the new one, never a torn payload.
///
/// The store carries no locking; the deployment must ensure at most one
/// process advances a given run at a time.
pub struct RunStore {
    path: PathBuf,
    runs: BTreeMap<String, Run>,
}

impl RunStore {
    /// Opens (or creates) the store at `path`. Runs persisted by older
    /// versions get missing fields back-filled and are rewritten once.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        if !path.exists() {
            let store = Self {
                path,
                runs: BTreeMap::new(),
            };
            store.save()?;
            return Ok(store);
        }

        let raw = fs::read_to_string(&path)?;
        let mut doc: BTreeMap<String, Value> = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("Corrupt run state document {}: {}", path.display(), e))?;

        let migrated = migrate_runs(&mut doc);
        let runs: BTreeMap<String, Run> = serde_json::from_value(Value::Object(
            doc.into_iter().collect(),
        ))
        .map_err(|e| anyhow::anyhow!("Corrupt run record in {}: {}", path.display(), e))?;

        let store = Self { path, runs };
        if migrated {
            info!("Migrated run state document, rewriting {}", store.path.display());
            store.save()?;
        }
        Ok(store)
    }

    fn save(&self) -> anyhow::Result<()> {
        let data = serde_json::to_string_pretty(&self.runs)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Allocates a new run in `initialized` state and persists it.
    pub fn create(&mut self, niche: &str, language: &str) -> anyhow::Result<String> {
        let id = Uuid::new_v4().to_string();
        let run = Run {
            id: id.clone(),
            niche: niche.to_string(),
            language: language.to_string(),
            status: RunStatus::Initialized,
            steps_completed: Vec::new(),
            data: BTreeMap::new(),
            created_at: Utc::now(),
            last_updated: None,
            completed_at: None,
            video_path: None,
            failed_at: None,
            error: None,
        };
        self.runs.insert(id.clone(), run);
        self.save()?;
        Ok(id)
    }

    pub fn get(&self, run_id: &str) -> Option<&Run> {
        self.runs.get(run_id)
    }

    /// Checkpoints one stage result: appends to `steps_completed`, stores the
    /// payload and moves the run to `in_progress`. Rejected with a logged
    /// error for unknown or already-terminal runs; Err only on store I/O.
    pub fn save_step(&mut self, run_id: &str, stage: &str, payload: Value) -> anyhow::Result<()> {
        let Some(run) = self.runs.get_mut(run_id) else {
            error!("Run {} not found, dropping {} checkpoint", run_id, stage);
            return Ok(());
        };
        if run.status.is_terminal() {
            error!(
                "Run {} is already terminal ({:?}), rejecting {} checkpoint",
                run_id, run.status, stage
            );
            return Ok(());
        }
        run.steps_completed.push(stage.to_string());
        run.data.insert(stage.to_string(), payload);
        run.status = RunStatus::InProgress;
        run.last_updated = Some(Utc::now());
        self.save()
    }

    /// Terminal success transition. Rejected with a logged error if the run
    /// is unknown or already terminal.
    pub fn mark_completed(&mut self, run_id: &str, video_path: &str) -> anyhow::Result<()> {
        let Some(run) = self.runs.get_mut(run_id) else {
            error!("Run {} not found, cannot mark completed", run_id);
            return Ok(());
        };
        if run.status.is_terminal() {
            error!(
                "Run {} is already terminal ({:?}), rejecting completion",
                run_id, run.status
            );
            return Ok(());
        }
        run.status = RunStatus::Completed;
        run.video_path = Some(video_path.to_string());
        run.completed_at = Some(Utc::now());
        self.save()
    }

    /// Terminal failure transition. Failed runs stay resumable via
    /// `list_incomplete`. Rejected with a logged error if the run is unknown
    /// or already terminal.
    pub fn mark_failed(&mut self, run_id: &str, message: &str) -> anyhow::Result<()> {
        let Some(run) = self.runs.get_mut(run_id) else {
            error!("Run {} not found, cannot mark failed", run_id);
            return Ok(());
        };
        if run.status.is_terminal() {
            error!(
                "Run {} is already terminal ({:?}), rejecting failure mark",
                run_id, run.status
            );
            return Ok(());
        }
        run.status = RunStatus::Failed;
        run.error = Some(message.to_string());
        run.failed_at = Some(Utc::now());
        self.save()
    }

    /// Moves a failed run back to `in_progress` so the controller can resume
    /// it. Completed runs stay immutable; anything not failed is a logged
    /// no-op. This is the only path out of a terminal state, which keeps
    /// stray `save_step` calls against terminal runs rejected.
    pub fn reopen(&mut self, run_id: &str) -> anyhow::Result<bool> {
        let Some(run) = self.runs.get_mut(run_id) else {
            error!("Run {} not found, cannot reopen", run_id);
            return Ok(false);
        };
        if run.status != RunStatus::Failed {
            warn!("Run {} is {:?}, not failed; reopen ignored", run_id, run.status);
            return Ok(false);
        }
        run.status = RunStatus::InProgress;
        run.error = None;
        run.failed_at = None;
        run.last_updated = Some(Utc::now());
        self.save()?;
        Ok(true)
    }

    /// Every run that has not completed. Failed runs count as resumable.
    pub fn list_incomplete(&self) -> Vec<&Run> {
        self.runs
            .values()
            .filter(|run| run.status != RunStatus::Completed)
            .collect()
    }

    /// Most recently touched incomplete run, by `last_updated` falling back
    /// to `created_at`.
    pub fn latest_incomplete(&self) -> Option<&Run> {
        self.list_incomplete()
            .into_iter()
            .max_by_key(|run| run.last_updated.unwrap_or(run.created_at))
    }

    /// Removes every non-completed run.
    pub fn delete_incomplete(&mut self) -> anyhow::Result<usize> {
        let before = self.runs.len();
        self.runs.retain(|_, run| run.status == RunStatus::Completed);
        let removed = before - self.runs.len();
        if removed > 0 {
            info!("Removed {} incomplete run(s)", removed);
            self.save()?;
        }
        Ok(removed)
    }

    /// Prunes completed runs whose `completed_at` is older than `max_age`.
    pub fn delete_completed_older_than(&mut self, max_age: Duration) -> anyhow::Result<usize> {
        let cutoff = Utc::now() - max_age;
        let before = self.runs.len();
        self.runs.retain(|id, run| {
            if run.status != RunStatus::Completed {
                return true;
            }
            match run.completed_at {
                Some(at) if at < cutoff => {
                    info!("Pruning completed run {} from {}", id, at);
                    false
                }
                Some(_) => true,
                None => {
                    warn!("Completed run {} has no completed_at, keeping", id);
                    true
                }
            }
        });
        let removed = before - self.runs.len();
        if removed > 0 {
            self.save()?;
        }
        Ok(removed)
    }
}

/// Back-fills fields older documents may lack. Returns true when anything
/// changed so the caller can rewrite the document once.
fn migrate_runs(doc: &mut BTreeMap<String, Value>) -> bool {
    let mut modified = false;
    for (run_id, raw) in doc.iter_mut() {
        let Some(run) = raw.as_object_mut() else {
            continue;
        };
        if !run.contains_key("id") {
            run.insert("id".into(), Value::String(run_id.clone()));
            modified = true;
        }
        if !run.contains_key("created_at") {
            run.insert("created_at".into(), serde_json::json!(Utc::now()));
            modified = true;
        }
        if !run.contains_key("status") {
            run.insert("status".into(), Value::String("initialized".into()));
            modified = true;
        }
        if !run.contains_key("steps_completed") {
            run.insert("steps_completed".into(), Value::Array(Vec::new()));
            modified = true;
        }
        if !run.contains_key("data") {
            run.insert("data".into(), Value::Object(Default::default()));
            modified = true;
        }
        let completed = run.get("status").and_then(Value::as_str) == Some("completed");
        if !completed && !run.contains_key("last_updated") {
            let created = run.get("created_at").cloned().unwrap_or(Value::Null);
            run.insert("last_updated".into(), created);
            modified = true;
        }
    }
    modified
}
