//! Cloud document-store backend.
//!
//! Mirrors a key-value cloud store (DynamoDB/Firestore-shaped) where a
//! workspace owns exactly two logical documents — `workflow_defs` and
//! `workflow_runs` — each holding its *entire* collection. An upsert
//! replaces the whole collection document, not a single row.
//!
//! This is a known scaling bottleneck: every `save_run` rewrites every run
//! in the workspace. The fix is to partition by run id (one record per
//! run), mirroring `LocalFileStore` — the `WorkflowStore` trait already
//! permits that without callers changing, but is not implemented here; a
//! real client (e.g. an AWS/GCP document-store SDK) would replace the
//! in-memory map below with one.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::engine::types::*;
use crate::storage::{RunFilter, WorkflowStore, apply_filter_and_sort};

#[derive(Default)]
struct Collections {
    workflow_defs: HashMap<String, WorkflowDef>,
    workflow_runs: HashMap<String, Run>,
}

pub struct CloudKvStore {
    collections: Mutex<Collections>,
}

impl CloudKvStore {
    pub fn new() -> Self {
        Self {
            collections: Mutex::new(Collections::default()),
        }
    }
}

impl Default for CloudKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowStore for CloudKvStore {
    async fn list_defs(&self) -> Result<Vec<WorkflowDef>> {
        let collections = self.collections.lock().await;
        Ok(collections.workflow_defs.values().cloned().collect())
    }

    async fn get_def(&self, id: &str) -> Result<Option<WorkflowDef>> {
        let collections = self.collections.lock().await;
        Ok(collections.workflow_defs.get(id).cloned())
    }

    async fn save_def(&self, def: &WorkflowDef) -> Result<()> {
        let mut collections = self.collections.lock().await;
        // Replace-whole-collection semantics: the document is rewritten in
        // full even though only one entry changed.
        let mut defs = collections.workflow_defs.clone();
        defs.insert(def.id.clone(), def.clone());
        collections.workflow_defs = defs;
        Ok(())
    }

    async fn delete_def(&self, id: &str) -> Result<()> {
        let mut collections = self.collections.lock().await;
        let mut defs = collections.workflow_defs.clone();
        defs.remove(id);
        collections.workflow_defs = defs;
        Ok(())
    }

    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<RunSummary>> {
        let collections = self.collections.lock().await;
        let summaries: Vec<RunSummary> = collections
            .workflow_runs
            .values()
            .map(RunSummary::from)
            .collect();
        Ok(apply_filter_and_sort(summaries, &filter))
    }

    async fn get_run(&self, id: &str) -> Result<Option<Run>> {
        let collections = self.collections.lock().await;
        Ok(collections.workflow_runs.get(id).cloned())
    }

    async fn save_run(&self, run: &Run) -> Result<()> {
        let mut collections = self.collections.lock().await;
        let mut runs = collections.workflow_runs.clone();
        runs.insert(run.id.clone(), run.clone());
        collections.workflow_runs = runs;
        Ok(())
    }

    async fn delete_run(&self, id: &str) -> Result<()> {
        let mut collections = self.collections.lock().await;
        let mut runs = collections.workflow_runs.clone();
        runs.remove(id);
        collections.workflow_runs = runs;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_run(id: &str, status: RunStatus) -> Run {
        Run {
            id: id.to_string(),
            workflow_id: "w1".into(),
            workflow_name: "demo".into(),
            task: "task".into(),
            status,
            context: Context::new(),
            run_token: "tok".into(),
            steps: Vec::new(),
            stories: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_and_get_run_round_trips() {
        let store = CloudKvStore::new();
        store.save_run(&sample_run("r1", RunStatus::Running)).await.unwrap();
        let fetched = store.get_run("r1").await.unwrap().unwrap();
        assert_eq!(fetched.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn save_run_is_upsert_and_preserves_siblings() {
        let store = CloudKvStore::new();
        store.save_run(&sample_run("r1", RunStatus::Running)).await.unwrap();
        store.save_run(&sample_run("r2", RunStatus::Running)).await.unwrap();
        store.save_run(&sample_run("r1", RunStatus::Completed)).await.unwrap();

        assert_eq!(
            store.get_run("r1").await.unwrap().unwrap().status,
            RunStatus::Completed
        );
        assert!(store.get_run("r2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn list_runs_filters_by_workflow_id() {
        let store = CloudKvStore::new();
        let mut a = sample_run("r1", RunStatus::Running);
        a.workflow_id = "wa".into();
        let mut b = sample_run("r2", RunStatus::Running);
        b.workflow_id = "wb".into();
        store.save_run(&a).await.unwrap();
        store.save_run(&b).await.unwrap();

        let filtered = store
            .list_runs(RunFilter {
                workflow_id: Some("wa".into()),
                status: None,
            })
            .await
            .unwrap();

        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id, "r1");
    }

    #[tokio::test]
    async fn delete_def_removes_it() {
        let store = CloudKvStore::new();
        let def = WorkflowDef {
            id: "w1".into(),
            name: "demo".into(),
            description: None,
            steps: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.save_def(&def).await.unwrap();
        store.delete_def("w1").await.unwrap();
        assert!(store.get_def("w1").await.unwrap().is_none());
    }
}
