use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Flat run context — intentionally never descended into for dotted template
/// lookups (see `template::resolve`).
pub type Context = HashMap<String, String>;

/// Status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Paused,
    Failed,
    Completed,
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Paused => write!(f, "paused"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "paused" => Ok(RunStatus::Paused),
            "failed" => Ok(RunStatus::Failed),
            "completed" => Ok(RunStatus::Completed),
            "cancelled" => Ok(RunStatus::Cancelled),
            _ => anyhow::bail!(
                "Invalid status '{}'. Use: running, paused, failed, completed, cancelled",
                s
            ),
        }
    }
}

/// Status of a single RunStep within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Waiting,
    Pending,
    Running,
    Done,
    Failed,
}

/// Status of a story carved out of a loop step's agent output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoryStatus {
    Pending,
    Running,
    Done,
    Failed,
}

/// What a loop step iterates over. Only `Stories` exists today; the
/// catch-all keeps future loop sources from silently failing to parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopOver {
    Stories,
    #[serde(other)]
    Unknown,
}

/// Loop-step configuration: what to iterate over and whether each
/// iteration is gated behind a verify step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    pub over: LoopOver,
    #[serde(default)]
    pub verify_each: bool,
    #[serde(default)]
    pub verify_step: Option<String>,
}

/// Single vs loop step discriminator. Modeled as a tagged enum rather than
/// a class hierarchy so the engine can match exhaustively.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Single,
    Loop { loop_config: LoopConfig },
}

/// Definition of a single step in a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDef {
    pub id: String,
    pub agent_id: String,
    pub input_template: String,
    #[serde(default)]
    pub expects: Option<String>,
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    2
}

/// A named, ordered template of steps. Immutable during an active run —
/// Runs carry their own copies of the fields they need.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDef {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<StepDef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A story carved out of agent output at a `STORIES_JSON:` boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Story {
    pub id: String,
    pub run_id: String,
    pub story_index: usize,
    pub story_id: String,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    pub status: StoryStatus,
    #[serde(default)]
    pub output: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A unit of work delegated to one agent, instantiated from a `StepDef`
/// when its owning run was started.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStep {
    pub id: String,
    pub run_id: String,
    pub step_id: String,
    pub agent_id: String,
    pub step_index: usize,
    pub input_template: String,
    #[serde(flatten)]
    pub kind: StepKind,
    pub status: StepStatus,
    #[serde(default)]
    pub output: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub current_story_id: Option<String>,
}

/// An executing instance of a `WorkflowDef`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub workflow_id: String,
    pub workflow_name: String,
    pub task: String,
    pub status: RunStatus,
    pub context: Context,
    pub run_token: String,
    pub steps: Vec<RunStep>,
    pub stories: Vec<Story>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut RunStep> {
        self.steps.iter_mut().find(|s| s.id == step_id)
    }

    pub fn story_mut(&mut self, story_id: &str) -> Option<&mut Story> {
        self.stories.iter_mut().find(|s| s.id == story_id)
    }
}

/// Story progress counters surfaced on run summaries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StoryProgress {
    pub done: usize,
    pub total: usize,
}

/// Lightweight projection of a `Run`, returned by `list_runs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: String,
    pub workflow_id: String,
    pub workflow_name: String,
    pub task: String,
    pub status: RunStatus,
    pub step_count: usize,
    pub current_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub story_progress: Option<StoryProgress>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Run> for RunSummary {
    fn from(run: &Run) -> Self {
        let current_step = run
            .steps
            .iter()
            .find(|s| matches!(s.status, StepStatus::Pending | StepStatus::Running))
            .map(|s| s.step_id.clone());

        let story_progress = if run.stories.is_empty() {
            None
        } else {
            let done = run
                .stories
                .iter()
                .filter(|s| s.status == StoryStatus::Done)
                .count();
            Some(StoryProgress {
                done,
                total: run.stories.len(),
            })
        };

        Self {
            id: run.id.clone(),
            workflow_id: run.workflow_id.clone(),
            workflow_name: run.workflow_name.clone(),
            task: run.task.clone(),
            status: run.status,
            step_count: run.steps.len(),
            current_step,
            story_progress,
            created_at: run.created_at,
            updated_at: run.updated_at,
        }
    }
}
