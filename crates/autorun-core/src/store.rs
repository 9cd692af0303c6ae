// Run persistence: one JSON record per run plus append-only step/output logs.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;

use autorun_types::{OutputEntry, RunRecord, StepLogEntry};

use crate::error::{EngineError, Result};

pub trait RunStore: Send + Sync {
    fn upsert_run(&self, record: &RunRecord) -> Result<()>;
    fn load_run(&self, run_id: &str) -> Result<RunRecord>;
    fn append_step(&self, run_id: &str, entry: &StepLogEntry) -> Result<()>;
    fn append_output(&self, run_id: &str, entry: &OutputEntry) -> Result<()>;
    fn load_steps(&self, run_id: &str) -> Result<Vec<StepLogEntry>>;
    fn load_outputs(&self, run_id: &str) -> Result<Vec<OutputEntry>>;
}

// ============================================================================
// File store
// ============================================================================

/// `<root>/<run_id>/{run.json,steps.jsonl,outputs.jsonl}`
pub struct FileRunStore {
    base_dir: PathBuf,
}

impl FileRunStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir)
            .map_err(|e| EngineError::Store(format!("Failed to create store directory: {}", e)))?;
        Ok(Self { base_dir })
    }

    /// Store under `<workspace>/.autorun/runs`.
    pub fn in_workspace(workspace: &Path) -> Result<Self> {
        Self::new(workspace.join(".autorun").join("runs"))
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.base_dir.join(run_id)
    }

    fn ensure_run_dir(&self, run_id: &str) -> Result<PathBuf> {
        let dir = self.run_dir(run_id);
        fs::create_dir_all(&dir)
            .map_err(|e| EngineError::Store(format!("Failed to create run directory: {}", e)))?;
        Ok(dir)
    }

    pub fn list_runs(&self) -> Result<Vec<String>> {
        let mut runs = Vec::new();
        for entry in fs::read_dir(&self.base_dir)
            .map_err(|e| EngineError::Store(format!("Failed to read store directory: {}", e)))?
        {
            let entry = entry
                .map_err(|e| EngineError::Store(format!("Failed to read directory entry: {}", e)))?;
            if entry.path().join("run.json").is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    runs.push(name.to_string());
                }
            }
        }
        runs.sort();
        Ok(runs)
    }
}

impl RunStore for FileRunStore {
    fn upsert_run(&self, record: &RunRecord) -> Result<()> {
        let dir = self.ensure_run_dir(&record.run_id)?;
        let content = serde_json::to_string_pretty(record)?;
        atomic_write(&dir.join("run.json"), &content)
    }

    fn load_run(&self, run_id: &str) -> Result<RunRecord> {
        let path = self.run_dir(run_id).join("run.json");
        if !path.exists() {
            return Err(EngineError::NotFound(format!("run {}", run_id)));
        }
        let content = fs::read_to_string(&path)
            .map_err(|e| EngineError::Store(format!("Failed to read run file: {}", e)))?;
        Ok(serde_json::from_str(&content)?)
    }

    fn append_step(&self, run_id: &str, entry: &StepLogEntry) -> Result<()> {
        let dir = self.ensure_run_dir(run_id)?;
        append_jsonl(&dir.join("steps.jsonl"), entry)
    }

    fn append_output(&self, run_id: &str, entry: &OutputEntry) -> Result<()> {
        let dir = self.ensure_run_dir(run_id)?;
        append_jsonl(&dir.join("outputs.jsonl"), entry)
    }

    fn load_steps(&self, run_id: &str) -> Result<Vec<StepLogEntry>> {
        load_jsonl(&self.run_dir(run_id).join("steps.jsonl"))
    }

    fn load_outputs(&self, run_id: &str) -> Result<Vec<OutputEntry>> {
        load_jsonl(&self.run_dir(run_id).join("outputs.jsonl"))
    }
}

fn append_jsonl<T: Serialize>(path: &Path, entry: &T) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| EngineError::Store(format!("Failed to open log: {}", e)))?;
    let line = serde_json::to_string(entry)?;
    writeln!(file, "{}", line).map_err(|e| EngineError::Store(format!("Failed to append: {}", e)))
}

/// Unparseable lines (e.g. a torn final write) are skipped.
fn load_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file =
        File::open(path).map_err(|e| EngineError::Store(format!("Failed to open log: {}", e)))?;
    let mut out = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| EngineError::Store(format!("Failed to read log: {}", e)))?;
        if let Ok(entry) = serde_json::from_str(&line) {
            out.push(entry);
        }
    }
    Ok(out)
}

/// Atomic write using temp file and rename
fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, content)
        .map_err(|e| EngineError::Store(format!("Failed to write temp file: {}", e)))?;
    fs::rename(&temp_path, path)
        .map_err(|e| EngineError::Store(format!("Failed to rename temp file: {}", e)))?;
    Ok(())
}

// ============================================================================
// Memory store
// ============================================================================

#[derive(Default)]
struct MemoryRun {
    record: Option<RunRecord>,
    steps: Vec<StepLogEntry>,
    outputs: Vec<OutputEntry>,
    upserts: usize,
}

/// In-process store for embedding hosts and tests.
#[derive(Default)]
pub struct MemoryRunStore {
    runs: Mutex<HashMap<String, MemoryRun>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_run<T>(&self, run_id: &str, f: impl FnOnce(&mut MemoryRun) -> T) -> T {
        let mut runs = self.runs.lock().unwrap_or_else(|p| p.into_inner());
        f(runs.entry(run_id.to_string()).or_default())
    }

    /// Number of `upsert_run` calls seen for a run.
    pub fn upsert_count(&self, run_id: &str) -> usize {
        self.with_run(run_id, |run| run.upserts)
    }
}

impl RunStore for MemoryRunStore {
    fn upsert_run(&self, record: &RunRecord) -> Result<()> {
        self.with_run(&record.run_id, |run| {
            run.record = Some(record.clone());
            run.upserts += 1;
        });
        Ok(())
    }

    fn load_run(&self, run_id: &str) -> Result<RunRecord> {
        self.with_run(run_id, |run| run.record.clone())
            .ok_or_else(|| EngineError::NotFound(format!("run {}", run_id)))
    }

    fn append_step(&self, run_id: &str, entry: &StepLogEntry) -> Result<()> {
        self.with_run(run_id, |run| run.steps.push(entry.clone()));
        Ok(())
    }

    fn append_output(&self, run_id: &str, entry: &OutputEntry) -> Result<()> {
        self.with_run(run_id, |run| run.outputs.push(entry.clone()));
        Ok(())
    }

    fn load_steps(&self, run_id: &str) -> Result<Vec<StepLogEntry>> {
        Ok(self.with_run(run_id, |run| run.steps.clone()))
    }

    fn load_outputs(&self, run_id: &str) -> Result<Vec<OutputEntry>> {
        Ok(self.with_run(run_id, |run| run.outputs.clone()))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use autorun_types::{ActionKind, OutputKind, Plan, RunMode, RunStatus, Step, StepStatus};
    use chrono::Utc;
    use tempfile::tempdir;

    fn record() -> RunRecord {
        let mut record = RunRecord::new("task-1", "write a haiku", RunMode::Do);
        record.plan = Plan::new(
            vec![Step::new("step_1", "final_output", [ActionKind::FinalOutput])],
            vec![],
        );
        record
    }

    #[test]
    fn file_store_round_trips_run_record() {
        let temp = tempdir().unwrap();
        let store = FileRunStore::new(temp.path()).unwrap();
        let mut rec = record();
        store.upsert_run(&rec).unwrap();

        rec.status = RunStatus::Done;
        rec.state.cursor = 1;
        store.upsert_run(&rec).unwrap();

        let loaded = store.load_run(&rec.run_id).unwrap();
        assert_eq!(loaded.status, RunStatus::Done);
        assert_eq!(loaded.state.cursor, 1);
        assert!(!temp.path().join(&rec.run_id).join("run.tmp").exists());
        assert_eq!(store.list_runs().unwrap(), vec![rec.run_id.clone()]);
    }

    #[test]
    fn file_store_appends_logs() {
        let temp = tempdir().unwrap();
        let store = FileRunStore::new(temp.path()).unwrap();
        let entry = StepLogEntry {
            step_index: 0,
            step_id: "step_1".to_string(),
            title: "final_output".to_string(),
            status: StepStatus::Done,
            action: Some(ActionKind::FinalOutput),
            detail: None,
            at: Utc::now(),
        };
        store.append_step("r1", &entry).unwrap();
        store.append_step("r1", &entry).unwrap();
        store
            .append_output("r1", &OutputEntry::new(OutputKind::Final, "done"))
            .unwrap();

        assert_eq!(store.load_steps("r1").unwrap().len(), 2);
        let outputs = store.load_outputs("r1").unwrap();
        assert_eq!(outputs[0].content, "done");
    }

    #[test]
    fn missing_run_is_not_found() {
        let temp = tempdir().unwrap();
        let store = FileRunStore::new(temp.path()).unwrap();
        assert!(matches!(store.load_run("nope"), Err(EngineError::NotFound(_))));
        let mem = MemoryRunStore::new();
        assert!(matches!(mem.load_run("nope"), Err(EngineError::NotFound(_))));
    }
}
