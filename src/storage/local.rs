//! File-backed storage: one JSON file per run plus a single
//! `definitions.json` blob for all workflow definitions.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::engine::types::*;
use crate::storage::{RunFilter, WorkflowStore, apply_filter_and_sort};

pub struct LocalFileStore {
    base_dir: PathBuf,
    lock: RwLock<()>,
}

impl LocalFileStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            lock: RwLock::new(()),
        }
    }

    fn defs_path(&self) -> PathBuf {
        self.base_dir.join("definitions.json")
    }

    fn runs_dir(&self) -> PathBuf {
        self.base_dir.join("runs")
    }

    fn run_path(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(format!("{run_id}.json"))
    }

    async fn read_defs(&self) -> Result<Vec<WorkflowDef>> {
        let path = self.defs_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read definitions file: {}", path.display()))?;
        serde_json::from_str(&data).context("Failed to parse definitions.json")
    }

    async fn write_defs(&self, defs: &[WorkflowDef]) -> Result<()> {
        tokio::fs::create_dir_all(&self.base_dir).await?;
        let path = self.defs_path();
        let tmp_path = path.with_extension("json.tmp");
        let data = serde_json::to_string_pretty(defs)?;
        tokio::fs::write(&tmp_path, &data).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    async fn write_run(&self, run: &Run) -> Result<()> {
        tokio::fs::create_dir_all(self.runs_dir()).await?;
        let path = self.run_path(&run.id);
        let tmp_path = path.with_extension("json.tmp");
        let data = serde_json::to_string_pretty(run)?;
        tokio::fs::write(&tmp_path, &data).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl WorkflowStore for LocalFileStore {
    async fn list_defs(&self) -> Result<Vec<WorkflowDef>> {
        let _lock = self.lock.read().await;
        self.read_defs().await
    }

    async fn get_def(&self, id: &str) -> Result<Option<WorkflowDef>> {
        let _lock = self.lock.read().await;
        let defs = self.read_defs().await?;
        Ok(defs.into_iter().find(|d| d.id == id))
    }

    async fn save_def(&self, def: &WorkflowDef) -> Result<()> {
        let _lock = self.lock.write().await;
        let mut defs = self.read_defs().await?;
        if let Some(existing) = defs.iter_mut().find(|d| d.id == def.id) {
            *existing = def.clone();
        } else {
            defs.push(def.clone());
        }
        self.write_defs(&defs).await
    }

    async fn delete_def(&self, id: &str) -> Result<()> {
        let _lock = self.lock.write().await;
        let mut defs = self.read_defs().await?;
        defs.retain(|d| d.id != id);
        self.write_defs(&defs).await
    }

    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<RunSummary>> {
        let _lock = self.lock.read().await;

        let dir = self.runs_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut summaries = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(data) = tokio::fs::read_to_string(&path).await else {
                continue;
            };
            let Ok(run) = serde_json::from_str::<Run>(&data) else {
                continue;
            };
            summaries.push(RunSummary::from(&run));
        }

        Ok(apply_filter_and_sort(summaries, &filter))
    }

    async fn get_run(&self, id: &str) -> Result<Option<Run>> {
        let _lock = self.lock.read().await;
        let path = self.run_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read run file: {}", path.display()))?;
        let run: Run =
            serde_json::from_str(&data).with_context(|| format!("Failed to parse run: {id}"))?;
        Ok(Some(run))
    }

    async fn save_run(&self, run: &Run) -> Result<()> {
        let _lock = self.lock.write().await;
        self.write_run(run).await
    }

    async fn delete_run(&self, id: &str) -> Result<()> {
        let _lock = self.lock.write().await;
        let path = self.run_path(id);
        if path.exists() {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }
}
