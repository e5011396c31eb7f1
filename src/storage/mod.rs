pub mod cloud;
pub mod local;

use anyhow::Result;
use async_trait::async_trait;

use crate::engine::types::*;

/// Filter applied by `list_runs`.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub workflow_id: Option<String>,
    pub status: Option<RunStatus>,
}

impl RunFilter {
    fn matches(&self, summary: &RunSummary) -> bool {
        if let Some(ref workflow_id) = self.workflow_id
            && &summary.workflow_id != workflow_id
        {
            return false;
        }
        if let Some(status) = self.status
            && summary.status != status
        {
            return false;
        }
        true
    }
}

/// Whole-object CRUD over workflow definitions and runs. Implementations
/// must make `save_run` atomic (last-writer-wins) and never return a
/// partially-written record.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn list_defs(&self) -> Result<Vec<WorkflowDef>>;
    async fn get_def(&self, id: &str) -> Result<Option<WorkflowDef>>;
    async fn save_def(&self, def: &WorkflowDef) -> Result<()>;
    async fn delete_def(&self, id: &str) -> Result<()>;

    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<RunSummary>>;
    async fn get_run(&self, id: &str) -> Result<Option<Run>>;
    async fn save_run(&self, run: &Run) -> Result<()>;
    async fn delete_run(&self, id: &str) -> Result<()>;

    /// All runs currently in `Running` status, used by the claim scan.
    async fn list_active_runs(&self) -> Result<Vec<Run>> {
        let mut runs = Vec::new();
        for summary in self.list_runs(RunFilter::default()).await? {
            if summary.status != RunStatus::Running {
                continue;
            }
            if let Some(run) = self.get_run(&summary.id).await? {
                runs.push(run);
            }
        }
        Ok(runs)
    }
}

fn apply_filter_and_sort(mut runs: Vec<RunSummary>, filter: &RunFilter) -> Vec<RunSummary> {
    runs.retain(|r| filter.matches(r));
    runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    runs
}
