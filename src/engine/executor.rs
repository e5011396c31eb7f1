//! The core workflow state machine: claim/complete/fail over a run's
//! steps and stories, with pause/resume/cancel on top.

use std::sync::Arc;
use std::sync::LazyLock;

use chrono::Utc;
use dashmap::DashMap;
use regex::Regex;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::errors::EngineError;
use crate::engine::types::*;
use crate::storage::WorkflowStore;
use crate::stories::{self, StoryParseError};
use crate::template;

type Result<T> = std::result::Result<T, EngineError>;

static KEY_VALUE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Z_]+):\s*(.+)$").unwrap());

/// Response to `claim_step`.
#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub struct ClaimResult {
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_input: Option<String>,
}

impl ClaimResult {
    fn not_found() -> Self {
        Self::default()
    }
}

/// Response to `complete_step`.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct CompleteResult {
    pub advanced: bool,
    pub run_completed: bool,
}

/// Response to `fail_step`.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct FailResult {
    pub retrying: bool,
    pub run_failed: bool,
}

/// The workflow execution engine: creates runs, claims steps for agents,
/// advances the pipeline, and applies retry policy. All mutation of a
/// given run is serialized behind a per-run mutex.
pub struct WorkflowEngine {
    store: Arc<dyn WorkflowStore>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl WorkflowEngine {
    pub fn new(store: Arc<dyn WorkflowStore>) -> Self {
        Self {
            store,
            locks: DashMap::new(),
        }
    }

    fn run_lock(&self, run_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn evict_lock_if_terminal(&self, run: &Run) {
        if matches!(run.status, RunStatus::Completed | RunStatus::Cancelled) {
            self.locks.remove(&run.id);
        }
    }

    /// Create a run from a definition and persist it once.
    pub async fn start_run(&self, def: &WorkflowDef, task: String) -> Result<Run> {
        let run_id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let mut context = Context::new();
        context.insert("task".to_string(), task.clone());

        let steps = def
            .steps
            .iter()
            .enumerate()
            .map(|(index, step_def)| RunStep {
                id: Uuid::new_v4().to_string(),
                run_id: run_id.clone(),
                step_id: step_def.id.clone(),
                agent_id: step_def.agent_id.clone(),
                step_index: index,
                input_template: step_def.input_template.clone(),
                kind: step_def.kind.clone(),
                status: if index == 0 {
                    StepStatus::Pending
                } else {
                    StepStatus::Waiting
                },
                output: None,
                retry_count: 0,
                max_retries: step_def.max_retries,
                current_story_id: None,
            })
            .collect();

        let run = Run {
            id: run_id.clone(),
            workflow_id: def.id.clone(),
            workflow_name: def.name.clone(),
            task,
            status: RunStatus::Running,
            context,
            run_token: generate_run_token(),
            steps,
            stories: Vec::new(),
            created_at: now,
            updated_at: now,
        };

        self.store.save_run(&run).await.map_err(EngineError::Storage)?;
        info!(run_id = %run.id, workflow = %run.workflow_name, "Started run");
        Ok(run)
    }

    /// Find a pending step for `agent_id`, optionally scoped to the run
    /// whose token matches `run_token`.
    pub async fn claim_step(&self, agent_id: &str, run_token: Option<&str>) -> Result<ClaimResult> {
        let mut candidates = self.store.list_active_runs().await.map_err(EngineError::Storage)?;
        candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        for candidate in candidates {
            if let Some(token) = run_token
                && candidate.run_token != token
            {
                continue;
            }

            let lock = self.run_lock(&candidate.id);
            let _guard = lock.lock().await;

            // Re-read under the lock — the candidate snapshot may be stale.
            let Some(mut run) = self.store.get_run(&candidate.id).await.map_err(EngineError::Storage)?
            else {
                continue;
            };
            if run.status != RunStatus::Running {
                continue;
            }

            if let Some(result) = self.claim_within_run(&mut run, agent_id)? {
                run.updated_at = Utc::now();
                self.store.save_run(&run).await.map_err(EngineError::Storage)?;
                self.evict_lock_if_terminal(&run);
                return Ok(result);
            }

            // Pipeline may have advanced (tail-call auto-done) even without
            // a match for this agent — persist that before moving on.
            run.updated_at = Utc::now();
            self.store.save_run(&run).await.map_err(EngineError::Storage)?;
            self.evict_lock_if_terminal(&run);

            if run_token.is_some() {
                // Token-scoped claims only ever consider one run.
                return Ok(ClaimResult::not_found());
            }
        }

        Ok(ClaimResult::not_found())
    }

    /// Repeatedly scans `run` for a pending step bound to `agent_id`,
    /// auto-advancing loop steps with no stories left (the "tail-call"
    /// behaviour: a single claim may silently finish several steps
    /// before returning the one it hands to the caller).
    fn claim_within_run(&self, run: &mut Run, agent_id: &str) -> Result<Option<ClaimResult>> {
        loop {
            let Some(index) = run
                .steps
                .iter()
                .position(|s| s.agent_id == agent_id && s.status == StepStatus::Pending)
            else {
                return Ok(None);
            };

            match run.steps[index].kind.clone() {
                StepKind::Single => {
                    let resolved = template::resolve(&run.steps[index].input_template, &run.context);
                    run.steps[index].status = StepStatus::Running;
                    return Ok(Some(ClaimResult {
                        found: true,
                        step_id: Some(run.steps[index].id.clone()),
                        run_id: Some(run.id.clone()),
                        resolved_input: Some(resolved),
                    }));
                }
                StepKind::Loop { .. } => {
                    let next_story = run
                        .stories
                        .iter()
                        .filter(|s| s.status == StoryStatus::Pending)
                        .min_by_key(|s| s.story_index)
                        .map(|s| s.id.clone());

                    if let Some(story_id) = next_story {
                        self.enrich_context_for_story(run, &story_id);
                        let story = run.story_mut(&story_id).unwrap();
                        story.status = StoryStatus::Running;
                        story.updated_at = Utc::now();

                        let resolved =
                            template::resolve(&run.steps[index].input_template, &run.context);

                        let step = &mut run.steps[index];
                        step.status = StepStatus::Running;
                        step.current_story_id = Some(story_id);

                        return Ok(Some(ClaimResult {
                            found: true,
                            step_id: Some(step.id.clone()),
                            run_id: Some(run.id.clone()),
                            resolved_input: Some(resolved),
                        }));
                    }

                    let all_done = !run.stories.is_empty()
                        && run.stories.iter().all(|s| s.status == StoryStatus::Done);

                    if all_done {
                        run.steps[index].status = StepStatus::Done;
                        advance_pipeline(run);
                        // Keep scanning — the newly-pending step may match.
                        continue;
                    }

                    // A story is already running, or none exist yet — no
                    // claim available for this step right now.
                    return Ok(None);
                }
            }
        }
    }

    fn enrich_context_for_story(&self, run: &mut Run, story_id: &str) {
        let completed: Vec<String> = run
            .stories
            .iter()
            .filter(|s| s.status == StoryStatus::Done)
            .map(|s| format!("- {}", s.title))
            .collect();
        let completed_stories = if completed.is_empty() {
            "(none yet)".to_string()
        } else {
            completed.join("\n")
        };

        let remaining = run
            .stories
            .iter()
            .filter(|s| matches!(s.status, StoryStatus::Pending | StoryStatus::Running))
            .count();

        let story = run.stories.iter().find(|s| s.id == story_id).unwrap();
        let acceptance = story
            .acceptance_criteria
            .iter()
            .map(|c| format!("- {c}"))
            .collect::<Vec<_>>()
            .join("\n");
        let current_story = format!(
            "{}\n{}\n\nAcceptance Criteria:\n{}",
            story.title, story.description, acceptance
        );
        let current_story_id = story.story_id.clone();
        let current_story_title = story.title.clone();

        run.context.insert("current_story".to_string(), current_story);
        run.context.insert("current_story_id".to_string(), current_story_id);
        run.context.insert("current_story_title".to_string(), current_story_title);
        run.context.insert("completed_stories".to_string(), completed_stories);
        run.context.insert("stories_remaining".to_string(), remaining.to_string());
    }

    /// Merge agent output into the run, advance or loop, and persist.
    pub async fn complete_step(
        &self,
        step_id: &str,
        output: String,
        run_token: Option<&str>,
    ) -> Result<CompleteResult> {
        let run_id = self
            .locate_run_for_step(step_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("step '{step_id}' not found")))?;

        let lock = self.run_lock(&run_id);
        let _guard = lock.lock().await;

        let mut run = self
            .store
            .get_run(&run_id)
            .await
            .map_err(EngineError::Storage)?
            .ok_or_else(|| EngineError::NotFound(format!("run '{run_id}' not found")))?;

        if let Some(token) = run_token
            && token != run.run_token
        {
            return Err(EngineError::TokenMismatch);
        }

        if run.status != RunStatus::Running {
            return Err(EngineError::IllegalTransition(format!(
                "run '{run_id}' is not running"
            )));
        }

        merge_context_lines(&mut run.context, &output);

        if output.contains("STORIES_JSON:") {
            match stories::parse(&output) {
                Ok(parsed) => {
                    let story_max_retries = run
                        .steps
                        .iter()
                        .find_map(|s| matches!(s.kind, StepKind::Loop { .. }).then_some(s.max_retries))
                        .unwrap_or(2);
                    append_stories(&mut run, parsed, story_max_retries);
                }
                Err(e) => {
                    return self.fail_run_on_malformed_stories(run, step_id, e).await;
                }
            }
        }

        let result = self.dispatch_completion(&mut run, step_id, output)?;

        run.updated_at = Utc::now();
        self.store.save_run(&run).await.map_err(EngineError::Storage)?;
        self.evict_lock_if_terminal(&run);
        Ok(result)
    }

    async fn fail_run_on_malformed_stories(
        &self,
        mut run: Run,
        step_id: &str,
        error: StoryParseError,
    ) -> Result<CompleteResult> {
        if let Some(step) = run.step_mut(step_id) {
            step.status = StepStatus::Failed;
            step.output = Some(format!("STORIES_JSON parse error: {error}"));
        }
        run.status = RunStatus::Failed;
        run.updated_at = Utc::now();
        warn!(step_id = %step_id, error = %error, "Malformed STORIES_JSON — run failed");
        self.store.save_run(&run).await.map_err(EngineError::Storage)?;
        self.evict_lock_if_terminal(&run);
        Ok(CompleteResult {
            advanced: false,
            run_completed: false,
        })
    }

    fn dispatch_completion(
        &self,
        run: &mut Run,
        step_id: &str,
        output: String,
    ) -> Result<CompleteResult> {
        // 4b: is `step_id` a verify step currently referenced by a running
        // loop step's verify_step? The loop step clears `current_story_id`
        // before the verify step is claimed, so parentage is keyed on
        // `verify_step` alone, not on a story being attached.
        let verify_parent = run.steps.iter().find(|s| {
            s.status == StepStatus::Running
                && matches!(
                    &s.kind,
                    StepKind::Loop { loop_config } if loop_config.verify_step.as_deref() == Some(step_id)
                )
        });

        if let Some(parent) = verify_parent {
            let loop_step_id = parent.id.clone();
            return self.complete_verify_step(run, &loop_step_id, step_id, output);
        }

        let completing = run
            .step_mut(step_id)
            .ok_or_else(|| EngineError::NotFound(format!("step '{step_id}' not found")))?;

        let is_loop_iteration =
            matches!(completing.kind, StepKind::Loop { .. }) && completing.current_story_id.is_some();

        if is_loop_iteration {
            self.complete_loop_iteration(run, step_id, output)
        } else {
            self.complete_single_step(run, step_id, output)
        }
    }

    fn complete_single_step(
        &self,
        run: &mut Run,
        step_id: &str,
        output: String,
    ) -> Result<CompleteResult> {
        let step = run.step_mut(step_id).unwrap();
        step.status = StepStatus::Done;
        step.output = Some(output);

        let run_completed = advance_pipeline(run);
        info!(run_id = %run.id, step_id = %step_id, "Step completed");
        Ok(CompleteResult {
            advanced: true,
            run_completed,
        })
    }

    fn complete_loop_iteration(
        &self,
        run: &mut Run,
        step_id: &str,
        output: String,
    ) -> Result<CompleteResult> {
        let story_id = run
            .step_mut(step_id)
            .unwrap()
            .current_story_id
            .clone()
            .expect("loop iteration step must carry current_story_id");

        {
            let story = run.story_mut(&story_id).unwrap();
            story.status = StoryStatus::Done;
            story.output = Some(output.clone());
            story.updated_at = Utc::now();
        }

        let loop_config = {
            let step = run.step_mut(step_id).unwrap();
            step.current_story_id = None;
            step.output = Some(output);
            match &step.kind {
                StepKind::Loop { loop_config } => loop_config.clone(),
                StepKind::Single => unreachable!("checked by caller"),
            }
        };

        if loop_config.verify_each
            && let Some(verify_step_id) = &loop_config.verify_step
        {
            let verify_run_step_id = run
                .steps
                .iter()
                .find(|s| s.step_id == *verify_step_id)
                .map(|s| s.id.clone())
                .ok_or_else(|| {
                    EngineError::NotFound(format!("verify step '{verify_step_id}' not found"))
                })?;
            run.step_mut(&verify_run_step_id).unwrap().status = StepStatus::Pending;
            // Loop step stays Running; no pipeline advance.
            return Ok(CompleteResult {
                advanced: false,
                run_completed: false,
            });
        }

        let any_pending = run.stories.iter().any(|s| s.status == StoryStatus::Pending);
        if any_pending {
            run.step_mut(step_id).unwrap().status = StepStatus::Pending;
            return Ok(CompleteResult {
                advanced: false,
                run_completed: false,
            });
        }

        run.step_mut(step_id).unwrap().status = StepStatus::Done;
        let run_completed = advance_pipeline(run);
        Ok(CompleteResult {
            advanced: true,
            run_completed,
        })
    }

    fn complete_verify_step(
        &self,
        run: &mut Run,
        loop_step_id: &str,
        verify_step_id: &str,
        output: String,
    ) -> Result<CompleteResult> {
        {
            let verify_step = run.step_mut(verify_step_id).unwrap();
            verify_step.status = StepStatus::Waiting;
            verify_step.output = Some(output);
        }

        let status_value = run
            .context
            .get("status")
            .map(|v| v.to_lowercase())
            .unwrap_or_default();

        if status_value == "retry" {
            let story_id = run
                .stories
                .iter()
                .filter(|s| s.status == StoryStatus::Done)
                .max_by_key(|s| s.updated_at)
                .map(|s| s.id.clone())
                .ok_or_else(|| {
                    EngineError::NotFound("no completed story to retry".to_string())
                })?;

            let story = run.story_mut(&story_id).unwrap();
            story.retry_count += 1;
            story.updated_at = Utc::now();

            if story.retry_count >= story.max_retries {
                story.status = StoryStatus::Failed;
                run.step_mut(loop_step_id).unwrap().status = StepStatus::Failed;
                run.status = RunStatus::Failed;
                return Ok(CompleteResult {
                    advanced: false,
                    run_completed: false,
                });
            }

            story.status = StoryStatus::Pending;
            run.step_mut(loop_step_id).unwrap().status = StepStatus::Pending;
            return Ok(CompleteResult {
                advanced: false,
                run_completed: false,
            });
        }

        run.context.remove("verify_feedback");

        let any_pending = run.stories.iter().any(|s| s.status == StoryStatus::Pending);
        if any_pending {
            run.step_mut(loop_step_id).unwrap().status = StepStatus::Pending;
            return Ok(CompleteResult {
                advanced: false,
                run_completed: false,
            });
        }

        run.step_mut(loop_step_id).unwrap().status = StepStatus::Done;
        let run_completed = advance_pipeline(run);
        Ok(CompleteResult {
            advanced: true,
            run_completed,
        })
    }

    /// Apply bounded-retry policy to an agent-reported failure.
    pub async fn fail_step(
        &self,
        step_id: &str,
        error: String,
        run_token: Option<&str>,
    ) -> Result<FailResult> {
        let run_id = self
            .locate_run_for_step(step_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("step '{step_id}' not found")))?;

        let lock = self.run_lock(&run_id);
        let _guard = lock.lock().await;

        let mut run = self
            .store
            .get_run(&run_id)
            .await
            .map_err(EngineError::Storage)?
            .ok_or_else(|| EngineError::NotFound(format!("run '{run_id}' not found")))?;

        if let Some(token) = run_token
            && token != run.run_token
        {
            return Err(EngineError::TokenMismatch);
        }

        if run.status != RunStatus::Running {
            return Err(EngineError::IllegalTransition(format!(
                "run '{run_id}' is not running"
            )));
        }

        let is_loop_iteration = {
            let step = run
                .step_mut(step_id)
                .ok_or_else(|| EngineError::NotFound(format!("step '{step_id}' not found")))?;
            matches!(step.kind, StepKind::Loop { .. }) && step.current_story_id.is_some()
        };

        let result = if is_loop_iteration {
            self.fail_loop_iteration(&mut run, step_id, &error)
        } else {
            self.fail_plain_step(&mut run, step_id, &error)
        };

        run.updated_at = Utc::now();
        self.store.save_run(&run).await.map_err(EngineError::Storage)?;
        self.evict_lock_if_terminal(&run);
        Ok(result)
    }

    fn fail_loop_iteration(&self, run: &mut Run, step_id: &str, error: &str) -> FailResult {
        let story_id = run
            .step_mut(step_id)
            .unwrap()
            .current_story_id
            .clone()
            .unwrap();

        let story = run.story_mut(&story_id).unwrap();
        story.retry_count += 1;
        story.updated_at = Utc::now();
        story.output = Some(error.to_string());

        if story.retry_count >= story.max_retries {
            story.status = StoryStatus::Failed;
            let step = run.step_mut(step_id).unwrap();
            step.status = StepStatus::Failed;
            step.output = Some(error.to_string());
            run.status = RunStatus::Failed;
            warn!(step_id = %step_id, story_id = %story_id, "Story exhausted retries — run failed");
            return FailResult {
                retrying: false,
                run_failed: true,
            };
        }

        story.status = StoryStatus::Pending;
        let step = run.step_mut(step_id).unwrap();
        step.status = StepStatus::Pending;
        step.current_story_id = None;
        FailResult {
            retrying: true,
            run_failed: false,
        }
    }

    fn fail_plain_step(&self, run: &mut Run, step_id: &str, error: &str) -> FailResult {
        let step = run.step_mut(step_id).unwrap();
        step.retry_count += 1;
        step.output = Some(error.to_string());

        if step.retry_count >= step.max_retries {
            step.status = StepStatus::Failed;
            run.status = RunStatus::Failed;
            warn!(step_id = %step_id, "Step exhausted retries — run failed");
            return FailResult {
                retrying: false,
                run_failed: true,
            };
        }

        step.status = StepStatus::Pending;
        FailResult {
            retrying: true,
            run_failed: false,
        }
    }

    pub async fn pause_run(&self, run_id: &str) -> Result<Run> {
        let lock = self.run_lock(run_id);
        let _guard = lock.lock().await;

        let mut run = self.load_run(run_id).await?;
        run.status = RunStatus::Paused;
        run.updated_at = Utc::now();
        self.store.save_run(&run).await.map_err(EngineError::Storage)?;
        Ok(run)
    }

    pub async fn resume_run(&self, run_id: &str) -> Result<Run> {
        let lock = self.run_lock(run_id);
        let _guard = lock.lock().await;

        let mut run = self.load_run(run_id).await?;
        if !matches!(run.status, RunStatus::Failed | RunStatus::Paused) {
            return Err(EngineError::IllegalTransition(format!(
                "run '{run_id}' can only resume from failed or paused (currently {})",
                run.status
            )));
        }

        if let Some(step) = run.steps.iter_mut().find(|s| s.status == StepStatus::Failed) {
            step.status = StepStatus::Pending;
            step.current_story_id = None;
        }

        if let Some(story) = run.stories.iter_mut().find(|s| s.status == StoryStatus::Failed) {
            story.status = StoryStatus::Pending;
        }

        run.status = RunStatus::Running;
        run.updated_at = Utc::now();
        self.store.save_run(&run).await.map_err(EngineError::Storage)?;
        Ok(run)
    }

    pub async fn cancel_run(&self, run_id: &str) -> Result<Run> {
        let lock = self.run_lock(run_id);
        let _guard = lock.lock().await;

        let mut run = self.load_run(run_id).await?;
        run.status = RunStatus::Cancelled;
        run.updated_at = Utc::now();
        self.store.save_run(&run).await.map_err(EngineError::Storage)?;
        self.evict_lock_if_terminal(&run);
        Ok(run)
    }

    async fn load_run(&self, run_id: &str) -> Result<Run> {
        self.store
            .get_run(run_id)
            .await
            .map_err(EngineError::Storage)?
            .ok_or_else(|| EngineError::NotFound(format!("run '{run_id}' not found")))
    }

    /// Scan every run for the one owning `step_id`. O(active runs); fine at
    /// the scale this engine targets (see the cloud-store scaling note).
    async fn locate_run_for_step(&self, step_id: &str) -> Result<Option<String>> {
        for summary in self
            .store
            .list_runs(crate::storage::RunFilter::default())
            .await
            .map_err(EngineError::Storage)?
        {
            if let Some(run) = self.store.get_run(&summary.id).await.map_err(EngineError::Storage)?
                && run.steps.iter().any(|s| s.id == step_id)
            {
                return Ok(Some(run.id));
            }
        }
        Ok(None)
    }
}

fn advance_pipeline(run: &mut Run) -> bool {
    if let Some(next) = run.steps.iter_mut().find(|s| s.status == StepStatus::Waiting) {
        next.status = StepStatus::Pending;
        false
    } else {
        run.status = RunStatus::Completed;
        true
    }
}

fn merge_context_lines(context: &mut Context, output: &str) {
    for line in output.lines() {
        let Some(caps) = KEY_VALUE_LINE.captures(line) else {
            continue;
        };
        let key = &caps[1];
        if key == "STORIES_JSON" {
            continue;
        }
        context.insert(key.to_lowercase(), caps[2].trim().to_string());
    }
}

fn append_stories(run: &mut Run, parsed: Vec<stories::ParsedStory>, max_retries: u32) {
    let mut next_index = run.stories.len();
    let now = Utc::now();
    for story in parsed {
        run.stories.push(Story {
            id: Uuid::new_v4().to_string(),
            run_id: run.id.clone(),
            story_index: next_index,
            story_id: story.id,
            title: story.title,
            description: story.description,
            acceptance_criteria: story.acceptance_criteria,
            status: StoryStatus::Pending,
            output: None,
            retry_count: 0,
            max_retries,
            created_at: now,
            updated_at: now,
        });
        next_index += 1;
    }
}

fn generate_run_token() -> String {
    use base64::Engine as _;
    use rand::RngCore;

    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{LoopConfig, LoopOver, StepDef, WorkflowDef};
    use crate::storage::local::LocalFileStore;

    fn single_step_def(id: &str, agent_id: &str) -> StepDef {
        StepDef {
            id: id.to_string(),
            agent_id: agent_id.to_string(),
            input_template: "{{task}}".to_string(),
            expects: None,
            kind: StepKind::Single,
            max_retries: 2,
        }
    }

    fn two_step_workflow() -> WorkflowDef {
        let now = Utc::now();
        WorkflowDef {
            id: "wf1".into(),
            name: "demo".into(),
            description: None,
            steps: vec![single_step_def("plan", "planner"), single_step_def("build", "builder")],
            created_at: now,
            updated_at: now,
        }
    }

    fn loop_workflow() -> WorkflowDef {
        let now = Utc::now();
        WorkflowDef {
            id: "wf2".into(),
            name: "loop-demo".into(),
            description: None,
            steps: vec![
                StepDef {
                    id: "plan".into(),
                    agent_id: "planner".into(),
                    input_template: "{{task}}".into(),
                    expects: Some("STORIES_JSON".into()),
                    kind: StepKind::Single,
                    max_retries: 2,
                },
                StepDef {
                    id: "implement".into(),
                    agent_id: "builder".into(),
                    input_template: "{{current_story}}".into(),
                    expects: None,
                    kind: StepKind::Loop {
                        loop_config: LoopConfig {
                            over: LoopOver::Stories,
                            verify_each: true,
                            verify_step: Some("verify".into()),
                        },
                    },
                    max_retries: 2,
                },
                StepDef {
                    id: "verify".into(),
                    agent_id: "reviewer".into(),
                    input_template: "{{current_story}}".into(),
                    expects: None,
                    kind: StepKind::Single,
                    max_retries: 2,
                },
            ],
            created_at: now,
            updated_at: now,
        }
    }

    async fn engine_with_store() -> (WorkflowEngine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalFileStore::new(dir.path()));
        (WorkflowEngine::new(store), dir)
    }

    #[tokio::test]
    async fn start_run_marks_first_step_pending() {
        let (engine, _dir) = engine_with_store().await;
        let run = engine.start_run(&two_step_workflow(), "build a thing".into()).await.unwrap();
        assert_eq!(run.steps[0].status, StepStatus::Pending);
        assert_eq!(run.steps[1].status, StepStatus::Waiting);
        assert_eq!(run.context.get("task").map(String::as_str), Some("build a thing"));
    }

    #[tokio::test]
    async fn claim_then_complete_advances_pipeline() {
        let (engine, _dir) = engine_with_store().await;
        let run = engine.start_run(&two_step_workflow(), "t".into()).await.unwrap();

        let claim = engine.claim_step("planner", None).await.unwrap();
        assert!(claim.found);
        assert_eq!(claim.resolved_input.as_deref(), Some("t"));

        let result = engine.complete_step(&claim.step_id.unwrap(), "STATUS: done".into(), None).await.unwrap();
        assert!(result.advanced);
        assert!(!result.run_completed);

        let claim2 = engine.claim_step("builder", None).await.unwrap();
        assert!(claim2.found);
        assert_eq!(claim2.run_id.as_deref(), Some(run.id.as_str()));
    }

    #[tokio::test]
    async fn completing_last_step_completes_run() {
        let (engine, _dir) = engine_with_store().await;
        engine.start_run(&two_step_workflow(), "t".into()).await.unwrap();

        let c1 = engine.claim_step("planner", None).await.unwrap();
        engine.complete_step(&c1.step_id.unwrap(), "ok".into(), None).await.unwrap();
        let c2 = engine.claim_step("builder", None).await.unwrap();
        let result = engine.complete_step(&c2.step_id.unwrap(), "ok".into(), None).await.unwrap();
        assert!(result.run_completed);
    }

    #[tokio::test]
    async fn fail_step_retries_until_exhausted() {
        let (engine, _dir) = engine_with_store().await;
        engine.start_run(&two_step_workflow(), "t".into()).await.unwrap();

        let c1 = engine.claim_step("planner", None).await.unwrap();
        let step_id = c1.step_id.unwrap();

        let f1 = engine.fail_step(&step_id, "boom".into(), None).await.unwrap();
        assert!(f1.retrying);
        assert!(!f1.run_failed);

        let c1b = engine.claim_step("planner", None).await.unwrap();
        assert!(c1b.found);
        let f2 = engine.fail_step(&step_id, "boom again".into(), None).await.unwrap();
        assert!(f2.run_failed);
    }

    #[tokio::test]
    async fn resume_resets_only_first_failed_story() {
        let (engine, _dir) = engine_with_store().await;
        let run = engine.start_run(&loop_workflow(), "t".into()).await.unwrap();

        let c1 = engine.claim_step("planner", None).await.unwrap();
        let stories_payload = r#"STATUS: ok
STORIES_JSON:
[{"id":"S1","title":"first","description":"d","acceptanceCriteria":["a"]},
 {"id":"S2","title":"second","description":"d","acceptanceCriteria":["a"]}]
"#;
        engine.complete_step(&c1.step_id.unwrap(), stories_payload.into(), None).await.unwrap();

        let c2 = engine.claim_step("builder", None).await.unwrap();
        assert!(c2.found);
        let step_id = c2.step_id.unwrap();

        engine.fail_step(&step_id, "e1".into(), None).await.unwrap();
        engine.claim_step("builder", None).await.unwrap();
        let failed = engine.fail_step(&step_id, "e2".into(), None).await.unwrap();
        assert!(failed.run_failed);

        let resumed = engine.resume_run(&run.id).await.unwrap();
        assert_eq!(resumed.status, RunStatus::Running);
        let first_story = resumed.stories.iter().find(|s| s.story_id == "S1").unwrap();
        assert_eq!(first_story.status, StoryStatus::Pending);
    }

    #[tokio::test]
    async fn cancel_run_is_terminal() {
        let (engine, _dir) = engine_with_store().await;
        let run = engine.start_run(&two_step_workflow(), "t".into()).await.unwrap();
        let cancelled = engine.cancel_run(&run.id).await.unwrap();
        assert_eq!(cancelled.status, RunStatus::Cancelled);
    }
}
