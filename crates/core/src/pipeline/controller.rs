//! # Pipeline Controller
//!
//! The migration phase machine, built as a state graph over the kernel:
//!
//! ```text
//! init → analyzing → building → executing → validating → complete
//!                        ↑                      ↓
//!                        └──── diagnosing ←─────┘
//! ```
//!
//! Every working phase falls through to `failed` on an unsuccessful tool
//! result or a handler error. `diagnosing` loops back to `building` only
//! while `retry_count < max_iterations`, incrementing the counter, so a run
//! always reaches `complete` or `failed`.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use super::config::PipelineConfig;
use super::phase::Phase;
use crate::error::{KernelError, KernelResult};
use crate::events::{EventBus, EventKind};
use crate::graph::{
    when, CompiledGraph, GraphState, NodeHandler, Predicate, RunOutcome, StateGraph, StateUpdate,
    StateView, ToolNode,
};
use crate::hooks::{HookContext, HookManager, HookType};
use crate::kernel::Kernel;
use crate::memory::{MemoryManager, MemoryTier, StoreOptions};
use crate::storage::{PhaseRecord, RunSummary};
use crate::tools::{ToolRegistry, ToolResult};

/// Tools every pipeline needs registered before it starts
pub const REQUIRED_TOOLS: [&str; 5] = ["analyze", "build", "execute", "validate", "diagnose"];

const RETRY_GRANTED: &str = "retry_granted";
const FEEDBACK_HISTORY: &str = "feedback_history";
const DIAGNOSIS_REPORT: &str = "diagnosis_report.md";

/// Episode recording the phase entries of a run
pub fn episode_name(run_id: &str) -> String {
    format!("run:{}", run_id)
}

struct PhaseContext {
    events: Arc<EventBus>,
    hooks: Arc<HookManager>,
    memory: Arc<MemoryManager>,
    config: PipelineConfig,
}

/// Node handler for one phase
struct PhaseNode {
    phase: Phase,
    /// Working phases call their tool; the result envelope is kept so edges
    /// can route on `success`
    tool: Option<ToolNode>,
    ctx: Arc<PhaseContext>,
}

#[async_trait]
impl NodeHandler for PhaseNode {
    async fn run(&self, input: StateView) -> anyhow::Result<StateUpdate> {
        self.enter(&input).await;
        let update = StateUpdate::new().with_phase(self.phase.as_str());

        match self.phase {
            Phase::Init => Ok(update),
            Phase::Analyzing | Phase::Building | Phase::Executing | Phase::Validating => {
                let (key, result) = self.call_tool(&input).await?;
                update.set_json(key, &result)
            }
            Phase::Diagnosing => self.diagnose(&input, update).await,
            Phase::Complete => {
                self.close_episode(&input);
                Ok(update)
            }
            Phase::Failed => {
                self.save_diagnosis_report(&input).await?;
                self.close_episode(&input);
                Ok(update)
            }
        }
    }
}

impl PhaseNode {
    async fn enter(&self, input: &StateView) {
        let to = self.phase.as_str();
        tracing::info!(
            run_id = %input.run_id,
            from = %input.phase,
            to,
            retry_count = input.retry_count,
            "Phase entered"
        );
        self.ctx.events.emit(
            EventKind::PhaseEntered,
            to,
            json!({
                "run_id": input.run_id,
                "phase": to,
                "from": input.phase,
                "retry_count": input.retry_count,
            }),
        );
        self.ctx
            .hooks
            .trigger(
                HookContext::new(HookType::OnPhaseTransition, to)
                    .with_data("run_id", json!(input.run_id))
                    .with_data("from", json!(input.phase))
                    .with_data("retry_count", json!(input.retry_count)),
            )
            .await;
        if let Err(e) = self.ctx.memory.record_event(
            &episode_name(&input.run_id),
            "phase_entered",
            json!({ "phase": to, "retry_count": input.retry_count }),
        ) {
            tracing::warn!(run_id = %input.run_id, error = %e, "Phase not recorded in episode");
        }
    }

    async fn call_tool(&self, input: &StateView) -> anyhow::Result<(&str, ToolResult)> {
        let tool = self
            .tool
            .as_ref()
            .with_context(|| format!("Phase '{}' has no tool", self.phase))?;
        let result = tool
            .call(input)
            .await
            .with_context(|| format!("Phase '{}' could not run", self.phase))?;
        if !result.success {
            tracing::warn!(
                run_id = %input.run_id,
                phase = %self.phase,
                error = result.error.as_deref().unwrap_or(""),
                "Phase tool reported failure"
            );
        }
        Ok((tool.output_key(), result))
    }

    async fn diagnose(&self, input: &StateView, update: StateUpdate) -> anyhow::Result<StateUpdate> {
        let (key, result) = self.call_tool(input).await?;
        let fix_proposed = result.success
            && ["fix_proposed", "can_retry"]
                .iter()
                .any(|k| result.data.get(*k).and_then(Value::as_bool).unwrap_or(false));
        let granted = fix_proposed && input.retry_count < self.ctx.config.max_iterations;

        let mut update = update.set_json(key, &result)?.set(RETRY_GRANTED, granted);
        if granted {
            let retry_count = input.retry_count + 1;
            let mut history: Vec<Value> = input
                .get(FEEDBACK_HISTORY)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            history.push(json!({
                "kind": "retry_approved",
                "retry_count": retry_count,
                "diagnosis": result.data,
                "timestamp": Utc::now(),
            }));
            update = update
                .set(FEEDBACK_HISTORY, history)
                .with_retry_count(retry_count);
            tracing::info!(
                run_id = %input.run_id,
                retry_count,
                max_iterations = self.ctx.config.max_iterations,
                "Retry granted"
            );
        }

        self.ctx.memory.store(
            result.data.clone(),
            MemoryTier::ShortTerm,
            StoreOptions::new()
                .tags(["diagnosis", input.run_id.as_str()])
                .metadata("retry_count", json!(input.retry_count)),
        )?;
        Ok(update)
    }

    /// Keep the last diagnosis report when no retry follows it
    async fn save_diagnosis_report(&self, input: &StateView) -> anyhow::Result<()> {
        if input.get_bool(RETRY_GRANTED) {
            return Ok(());
        }
        let report = input
            .get("diagnosis")
            .and_then(|d| d.get("data"))
            .and_then(|d| d.get("report"))
            .and_then(Value::as_str)
            .filter(|r| !r.is_empty());
        if let Some(report) = report {
            let path = self.ctx.config.output_dir.join(DIAGNOSIS_REPORT);
            tokio::fs::create_dir_all(&self.ctx.config.output_dir).await?;
            tokio::fs::write(&path, report)
                .await
                .with_context(|| format!("Failed to write diagnosis report: {:?}", path))?;
            tracing::info!(path = ?path, "Diagnosis report saved");
        }
        Ok(())
    }

    fn close_episode(&self, input: &StateView) {
        if let Err(e) = self.ctx.memory.end_episode(&episode_name(&input.run_id)) {
            tracing::debug!(run_id = %input.run_id, error = %e, "Episode not closed");
        }
    }
}

fn succeeded(key: &'static str) -> Predicate {
    when(move |s: &GraphState| {
        s.get(key)
            .and_then(|r| r.get("success"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    })
}

fn validation_passed(state: &GraphState) -> bool {
    state
        .get("validation")
        .filter(|r| r.get("success").and_then(Value::as_bool).unwrap_or(false))
        .and_then(|r| r.get("data"))
        .and_then(|d| d.get("passed"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Runs migrations through the phase machine
pub struct PipelineController {
    kernel: Arc<Kernel>,
    config: PipelineConfig,
    graph: CompiledGraph,
}

impl PipelineController {
    /// Build the phase graph. Fails with `ToolNotFound` if a phase tool is
    /// not registered.
    pub fn new(kernel: Arc<Kernel>, config: PipelineConfig) -> KernelResult<Self> {
        for tool in REQUIRED_TOOLS {
            kernel.tools.get(tool)?;
        }

        let ctx = Arc::new(PhaseContext {
            events: Arc::clone(&kernel.events),
            hooks: Arc::clone(&kernel.hooks),
            memory: Arc::clone(&kernel.memory),
            config: config.clone(),
        });
        let graph = Self::build_graph(&ctx, &kernel.tools, config.max_iterations)?
            .with_services(kernel.graph_services())
            .with_options(kernel.graph_options());

        Ok(Self {
            kernel,
            config,
            graph,
        })
    }

    fn build_graph(
        ctx: &Arc<PhaseContext>,
        tools: &Arc<ToolRegistry>,
        max_iterations: u32,
    ) -> KernelResult<CompiledGraph> {
        let mut g = StateGraph::new("migration");
        let node = |phase: Phase| PhaseNode {
            phase,
            tool: phase.tool().zip(phase.output_key()).map(|(tool, key)| {
                ToolNode::new(Arc::clone(tools), tool, key)
                    .with_run_context()
                    .keep_envelope()
            }),
            ctx: Arc::clone(ctx),
        };
        let (init, analyzing, building, executing, validating, diagnosing, complete, failed) = (
            Phase::Init.as_str(),
            Phase::Analyzing.as_str(),
            Phase::Building.as_str(),
            Phase::Executing.as_str(),
            Phase::Validating.as_str(),
            Phase::Diagnosing.as_str(),
            Phase::Complete.as_str(),
            Phase::Failed.as_str(),
        );

        g.add_node(init, node(Phase::Init))?;
        g.add_node(analyzing, node(Phase::Analyzing))?
            .reads(["input_path", "output_dir"])
            .writes(["analysis"]);
        g.add_node(building, node(Phase::Building))?
            .reads(["input_path", "output_dir", "analysis", "diagnosis", FEEDBACK_HISTORY])
            .writes(["build"]);
        g.add_node(executing, node(Phase::Executing))?
            .reads(["output_dir", "build", "auto_approve"])
            .writes(["execution"]);
        g.add_node(validating, node(Phase::Validating))?
            .reads(["output_dir", "build", "execution"])
            .writes(["validation"]);
        g.add_node(diagnosing, node(Phase::Diagnosing))?
            .reads(["validation", "build", FEEDBACK_HISTORY])
            .writes(["diagnosis", RETRY_GRANTED, FEEDBACK_HISTORY]);
        g.add_node(complete, node(Phase::Complete))?;
        g.add_node(failed, node(Phase::Failed))?
            .reads(["diagnosis", RETRY_GRANTED]);

        g.add_edge(init, analyzing)?;
        g.add_conditional_edges(analyzing, vec![(building, succeeded("analysis"))], Some(failed))?;
        g.add_conditional_edges(building, vec![(executing, succeeded("build"))], Some(failed))?;
        g.add_conditional_edges(executing, vec![(validating, succeeded("execution"))], Some(failed))?;
        g.add_conditional_edges(
            validating,
            vec![
                (complete, when(validation_passed)),
                (
                    diagnosing,
                    when(move |s: &GraphState| s.retry_count < max_iterations),
                ),
            ],
            Some(failed),
        )?;
        g.add_conditional_edges(
            diagnosing,
            vec![(building, when(|s: &GraphState| s.get_bool(RETRY_GRANTED)))],
            Some(failed),
        )?;
        for phase in [init, analyzing, building, executing, validating, diagnosing] {
            g.add_failure_edge(phase, failed)?;
        }

        g.set_entry_point(init)?;
        g.set_finish_point(complete)?;
        g.set_finish_point(failed)?;
        g.compile()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn visualize(&self) -> String {
        self.graph.visualize()
    }

    /// Seed state from the launcher inputs
    pub fn initial_state(&self, run_id: &str) -> GraphState {
        GraphState::new(run_id)
            .with("input_path", json!(self.config.input_path))
            .with("output_dir", json!(self.config.output_dir))
            .with("auto_approve", json!(self.config.auto_approve))
            .with("max_iterations", json!(self.config.max_iterations))
    }

    /// Run a new migration under a fresh run id
    pub async fn run(&self) -> KernelResult<RunSummary> {
        let run_id = uuid::Uuid::new_v4().to_string();
        self.run_with_id(&run_id).await
    }

    #[tracing::instrument(skip(self), fields(input = ?self.config.input_path))]
    pub async fn run_with_id(&self, run_id: &str) -> KernelResult<RunSummary> {
        self.kernel.memory.start_episode(&episode_name(run_id))?;
        let result = self
            .graph
            .execute(self.initial_state(run_id), self.kernel.config.graph.max_parallel)
            .await;
        self.finish(result).await
    }

    /// Continue a run from its latest checkpoint
    #[tracing::instrument(skip(self))]
    pub async fn resume(&self, run_id: &str) -> KernelResult<RunSummary> {
        match self.kernel.memory.start_episode(&episode_name(run_id)) {
            Ok(()) | Err(KernelError::EpisodeClosed(_)) => {}
            Err(e) => return Err(e),
        }
        let result = self
            .graph
            .resume(run_id, self.kernel.config.graph.max_parallel)
            .await;
        self.finish(result).await
    }

    /// Persist the run summary for a finished or aborted run
    async fn finish(&self, result: KernelResult<RunOutcome>) -> KernelResult<RunSummary> {
        let (state, error) = match result {
            Ok(outcome) => (outcome.state, None),
            Err(e) => {
                let Some(state) = e.state().cloned() else {
                    return Err(e);
                };
                (state, Some(e))
            }
        };

        let name = episode_name(&state.run_id);
        if let Err(e) = self.kernel.memory.end_episode(&name) {
            tracing::debug!(run_id = %state.run_id, error = %e, "Episode already closed");
        }
        let (started_at, history) = match self.kernel.memory.episode(&name) {
            Ok(episode) => {
                let history = episode
                    .events
                    .iter()
                    .filter(|e| e.kind == "phase_entered")
                    .map(|e| PhaseRecord {
                        phase: e.data.get("phase").and_then(Value::as_str).unwrap_or_default().to_string(),
                        retry_count: e
                            .data
                            .get("retry_count")
                            .and_then(Value::as_u64)
                            .unwrap_or(0) as u32,
                        entered_at: e.timestamp,
                    })
                    .collect();
                (episode.started_at, history)
            }
            Err(_) => (Utc::now(), Vec::new()),
        };

        let summary = RunSummary::new(&state, started_at, history);
        self.kernel.summaries.save(&summary)?;
        let path = summary.write_to(&self.config.output_dir).await?;
        tracing::info!(
            run_id = %summary.run_id,
            phase = %summary.final_phase,
            retry_count = summary.retry_count,
            path = ?path,
            "Run finished"
        );

        match error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::graph::CheckpointStatus;
    use crate::tools::{FnTool, ToolCategory, ToolSpec};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Harness {
        kernel: Arc<Kernel>,
        validations: Arc<AtomicUsize>,
        output_dir: std::path::PathBuf,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.output_dir);
        }
    }

    fn ok_tool(name: &str, data: Value) -> Arc<FnTool> {
        Arc::new(FnTool::new(
            ToolSpec::new(name, "test tool", ToolCategory::Pipeline),
            move |_args| {
                let data = data.clone();
                async move { Ok(data) }
            },
        ))
    }

    /// Validation fails `failures` times before passing
    fn harness(failures: usize) -> Harness {
        let kernel = Arc::new(Kernel::in_memory(KernelConfig::default()).unwrap());
        let validations = Arc::new(AtomicUsize::new(0));

        kernel.tools.register(ok_tool("analyze", json!({ "models": 3 }))).unwrap();
        kernel.tools.register(ok_tool("build", json!({ "files": 3 }))).unwrap();
        kernel
            .tools
            .register(Arc::new(FnTool::new(
                ToolSpec::new("execute", "run models", ToolCategory::Pipeline),
                |args: Value| async move {
                    anyhow::ensure!(args["run_id"].is_string(), "run id not passed");
                    anyhow::ensure!(args["auto_approve"] == json!(true), "approval required");
                    Ok(json!({ "models_success": 3 }))
                },
            )))
            .unwrap();
        let counter = Arc::clone(&validations);
        kernel
            .tools
            .register(Arc::new(FnTool::new(
                ToolSpec::new("validate", "compare outputs", ToolCategory::Validation),
                move |_args| {
                    let counter = Arc::clone(&counter);
                    async move {
                        let n = counter.fetch_add(1, Ordering::SeqCst);
                        Ok(json!({ "passed": n >= failures }))
                    }
                },
            )))
            .unwrap();
        kernel
            .tools
            .register(ok_tool(
                "diagnose",
                json!({ "fix_proposed": true, "report": "row counts differ" }),
            ))
            .unwrap();

        let output_dir =
            std::env::temp_dir().join(format!("waypoint-pipeline-{}", uuid::Uuid::new_v4()));
        Harness {
            kernel,
            validations,
            output_dir,
        }
    }

    fn controller(h: &Harness, max_iterations: u32) -> PipelineController {
        let config = PipelineConfig::new("legacy", &h.output_dir)
            .with_auto_approve(true)
            .with_max_iterations(max_iterations);
        PipelineController::new(Arc::clone(&h.kernel), config).unwrap()
    }

    fn phases(h: &Harness) -> Vec<String> {
        h.kernel
            .events
            .history_of(&EventKind::PhaseEntered)
            .into_iter()
            .map(|e| e.source)
            .collect()
    }

    #[tokio::test]
    async fn test_clean_run_completes() {
        let h = harness(0);
        let summary = controller(&h, 3).run_with_id("clean").await.unwrap();

        assert_eq!(summary.final_phase, "complete");
        assert_eq!(summary.retry_count, 0);
        assert_eq!(
            phases(&h),
            ["init", "analyzing", "building", "executing", "validating", "complete"]
        );
        assert_eq!(summary.phase_history.len(), 6);

        let stored = h.kernel.summaries.load("clean").unwrap().unwrap();
        assert_eq!(stored.final_phase, "complete");
        assert!(h.output_dir.join("run_summary_clean.json").exists());

        let episode = h.kernel.memory.episode(&episode_name("clean")).unwrap();
        assert!(!episode.is_open());
    }

    #[tokio::test]
    async fn test_two_failed_validations_then_success() {
        let h = harness(2);
        let summary = controller(&h, 3).run_with_id("retry-twice").await.unwrap();

        assert_eq!(summary.final_phase, "complete");
        assert_eq!(summary.retry_count, 2);
        assert_eq!(h.validations.load(Ordering::SeqCst), 3);

        let loop_once = ["validating", "diagnosing", "building", "executing"];
        let expected: Vec<&str> = ["init", "analyzing", "building", "executing"]
            .into_iter()
            .chain(loop_once)
            .chain(loop_once)
            .chain(["validating", "complete"])
            .collect();
        assert_eq!(phases(&h), expected);

        let feedback = summary.state.get(FEEDBACK_HISTORY).unwrap().as_array().unwrap();
        assert_eq!(feedback.len(), 2);
    }

    #[tokio::test]
    async fn test_retry_bound_stops_loop() {
        let h = harness(4);
        let summary = controller(&h, 3).run_with_id("exhausted").await.unwrap();

        assert_eq!(summary.final_phase, "failed");
        assert_eq!(summary.retry_count, 3);
        assert_eq!(h.validations.load(Ordering::SeqCst), 4);
        let seen = phases(&h);
        assert_eq!(&seen[seen.len() - 2..], ["validating", "failed"]);
        assert_eq!(seen.iter().filter(|p| *p == "diagnosing").count(), 3);
        // The last diagnosis granted a retry, so no report is kept
        assert!(!h.output_dir.join(DIAGNOSIS_REPORT).exists());
    }

    #[tokio::test]
    async fn test_missing_tool_rejected_upfront() {
        let h = harness(0);
        h.kernel.tools.unregister("diagnose").unwrap();
        let err = PipelineController::new(Arc::clone(&h.kernel), PipelineConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, KernelError::ToolNotFound(name) if name == "diagnose"));
    }

    #[tokio::test]
    async fn test_unsuccessful_tool_routes_to_failed() {
        let h = harness(0);
        // Without approval the execute tool fails
        let config = PipelineConfig::new("legacy", &h.output_dir).with_max_iterations(3);
        let controller = PipelineController::new(Arc::clone(&h.kernel), config).unwrap();

        let summary = controller.run_with_id("unapproved").await.unwrap();
        assert_eq!(summary.final_phase, "failed");
        assert_eq!(
            phases(&h),
            ["init", "analyzing", "building", "executing", "failed"]
        );
        assert_eq!(h.validations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_declined_fix_writes_diagnosis_report() {
        let h = harness(1);
        h.kernel.tools.unregister("diagnose").unwrap();
        h.kernel
            .tools
            .register(ok_tool(
                "diagnose",
                json!({ "fix_proposed": false, "report": "manual review needed" }),
            ))
            .unwrap();

        let summary = controller(&h, 3).run_with_id("declined").await.unwrap();
        assert_eq!(summary.final_phase, "failed");
        assert_eq!(summary.retry_count, 0);
        let report = std::fs::read_to_string(h.output_dir.join(DIAGNOSIS_REPORT)).unwrap();
        assert_eq!(report, "manual review needed");
    }

    #[tokio::test]
    async fn test_resume_of_finished_run_is_stable() {
        let h = harness(1);
        let controller = controller(&h, 3);
        let first = controller.run_with_id("again").await.unwrap();

        let latest = h.kernel.checkpoints.latest("again").unwrap().unwrap();
        assert_eq!(latest.status, CheckpointStatus::Completed);

        let resumed = controller.resume("again").await.unwrap();
        assert_eq!(resumed.final_phase, first.final_phase);
        assert_eq!(resumed.state.data, first.state.data);
        assert_eq!(h.validations.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_graph_shape() {
        let h = harness(0);
        let text = controller(&h, 3).visualize();
        assert!(text.contains("[diagnosing]"));
        assert!(text.contains("-> failed (on failure)"));
    }
}
