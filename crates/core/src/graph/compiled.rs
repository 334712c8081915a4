//! # Graph Executor
//!
//! Runs a compiled graph with bounded parallelism.
//!
//! The coordinating loop owns the state. It dispatches ready nodes into a
//! `JoinSet` gated by a semaphore of `max_parallel` permits, merges each
//! completion into the state, activates outgoing edges and writes a
//! checkpoint, in completion order. Handlers never see the live state and
//! never write checkpoints.
//!
//! A node that already completed is activated again only through an edge
//! that closes a loop (its target can reach its source). Any other
//! activation of a completed node is ignored, so on an acyclic graph every
//! reachable node runs at most once.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::{self, JoinSet};

use super::builder::{Edge, EdgeCondition, Router, StateGraph};
use super::checkpoint::{Checkpoint, CheckpointStatus, CheckpointStore, InMemoryCheckpointStore};
use super::node::NodeSpec;
use super::state::{GraphState, StateUpdate};
use crate::config::GraphConfig;
use crate::error::{ExecutionFailure, FailureCause, KernelError, KernelResult};
use crate::events::{EventBus, EventKind};
use crate::hooks::{HookContext, HookManager, HookType};
use crate::tracer::{Span, Tracer};

/// Shared services a graph reports to
#[derive(Clone)]
pub struct GraphServices {
    pub events: Arc<EventBus>,
    pub hooks: Arc<HookManager>,
    pub tracer: Arc<Tracer>,
    pub checkpoints: Arc<dyn CheckpointStore>,
}

impl Default for GraphServices {
    fn default() -> Self {
        Self {
            events: Arc::new(EventBus::default()),
            hooks: Arc::new(HookManager::default()),
            tracer: Arc::new(Tracer::default()),
            checkpoints: Arc::new(InMemoryCheckpointStore::new()),
        }
    }
}

/// Execution limits
#[derive(Debug, Clone, Default)]
pub struct GraphOptions {
    /// Abort once this many node outcomes have been processed
    pub max_total_steps: Option<usize>,
    /// Timeout for nodes that do not declare their own
    pub node_timeout: Option<Duration>,
}

impl From<&GraphConfig> for GraphOptions {
    fn from(config: &GraphConfig) -> Self {
        Self {
            max_total_steps: config.max_total_steps,
            node_timeout: config
                .node_timeout_secs
                .map(|s| Duration::from_secs_f64(s.max(0.0))),
        }
    }
}

/// Cooperative cancellation flag, checked between node completions
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Run ids with an execution in flight
pub type RunRegistry = Arc<Mutex<HashSet<String>>>;

struct RunGuard {
    runs: RunRegistry,
    run_id: String,
}

impl RunGuard {
    fn acquire(runs: &RunRegistry, run_id: &str) -> KernelResult<Self> {
        let mut active = runs.lock().map_err(KernelError::lock)?;
        if !active.insert(run_id.to_string()) {
            return Err(KernelError::RunInProgress(run_id.to_string()));
        }
        Ok(Self {
            runs: Arc::clone(runs),
            run_id: run_id.to_string(),
        })
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Ok(mut active) = self.runs.lock() {
            active.remove(&self.run_id);
        }
    }
}

/// Successful end of an execution
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub state: GraphState,
    /// Node outcomes processed by this execution
    pub steps: usize,
    pub duration: Duration,
    pub resumed: bool,
}

impl RunOutcome {
    pub fn execution_path(&self) -> &[String] {
        &self.state.execution_path
    }
}

struct TaskOutput {
    node_id: String,
    result: Result<StateUpdate, FailureCause>,
    elapsed: Duration,
}

/// Node tasks in flight. A task that dies without producing output is
/// reported as a panicked run of the node it was spawned for.
struct InFlight {
    tasks: JoinSet<TaskOutput>,
    nodes: HashMap<task::Id, String>,
    spans: HashMap<String, Span>,
}

impl InFlight {
    fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
            nodes: HashMap::new(),
            spans: HashMap::new(),
        }
    }

    fn spawn<F>(&mut self, node_id: &str, span: Span, work: F)
    where
        F: Future<Output = TaskOutput> + Send + 'static,
    {
        let handle = self.tasks.spawn(work);
        self.nodes.insert(handle.id(), node_id.to_string());
        self.spans.insert(node_id.to_string(), span);
    }

    fn contains(&self, node_id: &str) -> bool {
        self.spans.contains_key(node_id)
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }

    fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn node_ids(&self) -> Vec<&String> {
        let mut ids: Vec<&String> = self.spans.keys().collect();
        ids.sort();
        ids
    }

    /// Next finished task with the span opened for its node
    async fn next(&mut self) -> Option<(TaskOutput, Option<Span>)> {
        let output = match self.tasks.join_next_with_id().await? {
            Ok((id, output)) => {
                self.nodes.remove(&id);
                output
            }
            Err(e) => {
                let node_id = self
                    .nodes
                    .remove(&e.id())
                    .unwrap_or_else(|| format!("task-{}", e.id()));
                let reason = if e.is_cancelled() {
                    "task aborted".to_string()
                } else {
                    e.to_string()
                };
                TaskOutput {
                    node_id,
                    result: Err(FailureCause::Panicked(reason)),
                    elapsed: Duration::ZERO,
                }
            }
        };
        let span = self.spans.remove(&output.node_id);
        Some((output, span))
    }
}

/// Mutable progress of one execution
struct Execution {
    state: GraphState,
    queue: VecDeque<String>,
    pending_joins: BTreeMap<String, BTreeSet<String>>,
    finished: bool,
    steps: usize,
    run_span: Span,
}

impl Execution {
    fn enqueue(&mut self, id: &str) -> bool {
        if self.queue.iter().any(|q| q == id) {
            return false;
        }
        self.queue.push_back(id.to_string());
        true
    }
}

/// A validated, immutable graph ready to run
pub struct CompiledGraph {
    name: String,
    nodes: HashMap<String, NodeSpec>,
    order: Vec<String>,
    edges: Vec<Edge>,
    routers: HashMap<String, Router>,
    entry: String,
    finish: BTreeSet<String>,
    /// Plain-edge predecessors per join target
    joins: HashMap<String, BTreeSet<String>>,
    reach: HashMap<String, HashSet<String>>,
    services: GraphServices,
    options: GraphOptions,
    runs: RunRegistry,
}

impl CompiledGraph {
    pub(crate) fn new(
        graph: StateGraph,
        entry: String,
        reach: HashMap<String, HashSet<String>>,
    ) -> Self {
        let mut joins: HashMap<String, BTreeSet<String>> = HashMap::new();
        for edge in &graph.edges {
            if matches!(edge.condition, EdgeCondition::Always) {
                joins.entry(edge.to.clone()).or_default().insert(edge.from.clone());
            }
        }
        Self {
            name: graph.name,
            nodes: graph.nodes,
            order: graph.order,
            edges: graph.edges,
            routers: graph.routers,
            entry,
            finish: graph.finish,
            joins,
            reach,
            services: GraphServices::default(),
            options: GraphOptions::default(),
            runs: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_services(mut self, services: GraphServices) -> Self {
        self.services = services;
        self
    }

    pub fn with_options(mut self, options: GraphOptions) -> Self {
        self.options = options;
        self
    }

    /// Share the in-flight run set with other graphs
    pub fn with_run_registry(mut self, runs: RunRegistry) -> Self {
        self.runs = runs;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn services(&self) -> &GraphServices {
        &self.services
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.services.checkpoints
    }

    /// Run from the entry point to completion
    pub async fn execute(&self, initial: GraphState, max_parallel: usize) -> KernelResult<RunOutcome> {
        self.execute_with_cancel(initial, max_parallel, CancelHandle::new())
            .await
    }

    pub async fn execute_with_cancel(
        &self,
        initial: GraphState,
        max_parallel: usize,
        cancel: CancelHandle,
    ) -> KernelResult<RunOutcome> {
        let mut queue = VecDeque::new();
        queue.push_back(self.entry.clone());
        self.run(initial, queue, BTreeMap::new(), false, max_parallel, cancel, false)
            .await
    }

    /// Resume a run from a checkpoint. Completed nodes are not re-invoked.
    pub async fn execute_from_checkpoint(
        &self,
        checkpoint: Checkpoint,
        max_parallel: usize,
    ) -> KernelResult<RunOutcome> {
        self.resume_with_cancel(checkpoint, max_parallel, CancelHandle::new())
            .await
    }

    pub async fn resume_with_cancel(
        &self,
        checkpoint: Checkpoint,
        max_parallel: usize,
        cancel: CancelHandle,
    ) -> KernelResult<RunOutcome> {
        if checkpoint.status == CheckpointStatus::Completed {
            return Ok(RunOutcome {
                run_id: checkpoint.run_id,
                state: checkpoint.state,
                steps: 0,
                duration: Duration::ZERO,
                resumed: true,
            });
        }

        let mut queue: VecDeque<String> = checkpoint
            .frontier
            .into_iter()
            .filter(|id| self.nodes.contains_key(id))
            .collect();
        if queue.is_empty() && checkpoint.state.completed.is_empty() && !checkpoint.finished {
            queue.push_back(self.entry.clone());
        }
        self.run(
            checkpoint.state,
            queue,
            checkpoint.pending_joins,
            checkpoint.finished,
            max_parallel,
            cancel,
            true,
        )
        .await
    }

    /// Resume the latest checkpoint of a run
    pub async fn resume(&self, run_id: &str, max_parallel: usize) -> KernelResult<RunOutcome> {
        let checkpoint = self
            .services
            .checkpoints
            .latest(run_id)?
            .ok_or_else(|| KernelError::NotFound(format!("checkpoint for run '{}'", run_id)))?;
        self.execute_from_checkpoint(checkpoint, max_parallel).await
    }

    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(skip_all, fields(graph = %self.name, run_id = %state.run_id, resumed = resumed))]
    async fn run(
        &self,
        state: GraphState,
        queue: VecDeque<String>,
        pending_joins: BTreeMap<String, BTreeSet<String>>,
        finished: bool,
        max_parallel: usize,
        cancel: CancelHandle,
        resumed: bool,
    ) -> KernelResult<RunOutcome> {
        let _guard = RunGuard::acquire(&self.runs, &state.run_id)?;
        let started = Instant::now();
        let max_parallel = max_parallel.max(1);

        let mut run_span = self.services.tracer.start_span("graph.run", None);
        run_span.set_attribute("graph", self.name.as_str());
        run_span.set_attribute("run_id", state.run_id.as_str());

        let mut exec = Execution {
            state,
            queue,
            pending_joins,
            finished,
            steps: 0,
            run_span,
        };

        tracing::info!(max_parallel, "Run started");
        self.services.events.emit(
            EventKind::RunStarted,
            &self.name,
            json!({ "run_id": exec.state.run_id, "resumed": resumed }),
        );

        let semaphore = Arc::new(Semaphore::new(max_parallel));
        let mut in_flight = InFlight::new();

        loop {
            if cancel.is_cancelled() {
                self.drain(&mut in_flight, &mut exec).await;
                let frontier = self.frontier(&exec, &in_flight, &[]);
                self.save(&exec, frontier, CheckpointStatus::Cancelled)?;
                return Err(self.abort(exec, "cancelled", |run_id, state| KernelError::Cancelled {
                    run_id,
                    state: Box::new(state),
                }));
            }

            // Dispatch as many ready nodes as permits allow
            let mut idx = 0;
            while idx < exec.queue.len() {
                let node_id = exec.queue[idx].clone();
                if in_flight.contains(&node_id) {
                    idx += 1;
                    continue;
                }
                if let Some(limit) = self.options.max_total_steps {
                    if exec.state.step + in_flight.len() >= limit {
                        self.drain(&mut in_flight, &mut exec).await;
                        let frontier = self.frontier(&exec, &in_flight, &[]);
                        self.save(&exec, frontier, CheckpointStatus::Failed)?;
                        return Err(self.abort(exec, "step budget exceeded", |run_id, state| {
                            KernelError::StepBudgetExceeded {
                                run_id,
                                limit,
                                state: Box::new(state),
                            }
                        }));
                    }
                }
                let permit = match Arc::clone(&semaphore).try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                exec.queue.remove(idx);

                let before = self
                    .services
                    .hooks
                    .trigger(
                        HookContext::new(HookType::BeforeExecute, &node_id)
                            .with_data("run_id", json!(exec.state.run_id))
                            .with_data("phase", json!(exec.state.phase)),
                    )
                    .await;
                if !before.should_continue {
                    drop(permit);
                    self.on_skipped(&mut exec, &node_id);
                    let frontier = self.frontier(&exec, &in_flight, &[]);
                    self.save(&exec, frontier, CheckpointStatus::Running)?;
                    continue;
                }

                let node = &self.nodes[&node_id];
                let mut span = self
                    .services
                    .tracer
                    .start_span(&format!("node.{}", node_id), Some(&exec.run_span.context));
                span.set_attribute("node", node_id.as_str());
                let view = exec.state.view(&node_id, &node.reads, Some(span.context.clone()));
                let handler = Arc::clone(&node.handler);
                let timeout = node.timeout.or(self.options.node_timeout);

                self.services.events.emit(
                    EventKind::NodeStarted,
                    &node_id,
                    json!({ "run_id": exec.state.run_id, "node": node_id, "step": exec.state.step }),
                );
                tracing::debug!(node = %node_id, "Node dispatched");

                let task_node = node_id.clone();
                in_flight.spawn(&node_id, span, async move {
                    let _permit = permit;
                    let started = Instant::now();
                    let handle = tokio::spawn(async move { handler.run(view).await });
                    let abort = handle.abort_handle();
                    let joined = match timeout {
                        Some(limit) => match tokio::time::timeout(limit, handle).await {
                            Ok(joined) => joined,
                            Err(_) => {
                                abort.abort();
                                return TaskOutput {
                                    node_id: task_node,
                                    result: Err(FailureCause::Timeout(limit)),
                                    elapsed: started.elapsed(),
                                };
                            }
                        },
                        None => handle.await,
                    };
                    let result = match joined {
                        Ok(Ok(update)) => Ok(update),
                        Ok(Err(e)) => Err(FailureCause::Handler(format!("{:#}", e))),
                        Err(e) => Err(FailureCause::Panicked(e.to_string())),
                    };
                    TaskOutput {
                        node_id: task_node,
                        result,
                        elapsed: started.elapsed(),
                    }
                });
            }

            if in_flight.is_empty() {
                if exec.queue.is_empty() {
                    break;
                }
                continue;
            }

            let Some((output, span)) = in_flight.next().await else {
                continue;
            };

            let checked = self.check_update(&output);
            self.record_node_metrics(&output, checked.is_ok());
            match checked {
                Ok(()) => {
                    let TaskOutput { node_id, result, elapsed } = output;
                    if let Ok(update) = result {
                        self.on_success(&mut exec, &node_id, update, elapsed, span).await;
                    }
                    let frontier = self.frontier(&exec, &in_flight, &[]);
                    self.save(&exec, frontier, CheckpointStatus::Running)?;
                }
                Err(cause) => {
                    let node_id = output.node_id;
                    let recovered = self.on_failure(&mut exec, &node_id, &cause, span).await;
                    if recovered {
                        let frontier = self.frontier(&exec, &in_flight, &[]);
                        self.save(&exec, frontier, CheckpointStatus::Running)?;
                        continue;
                    }

                    let mut retry = vec![node_id.clone()];
                    retry.extend(self.drain(&mut in_flight, &mut exec).await);
                    let frontier = self.frontier(&exec, &in_flight, &retry);
                    self.save(&exec, frontier, CheckpointStatus::Failed)?;

                    let failure = ExecutionFailure {
                        node_id: node_id.clone(),
                        phase: exec.state.phase.clone(),
                        retry_count: exec.state.retry_count,
                        cause: cause.clone(),
                        state: exec.state.clone(),
                    };
                    return Err(self.abort(exec, &format!("node '{}' failed: {}", node_id, cause), |_, _| {
                        KernelError::execution(failure)
                    }));
                }
            }
        }

        if !exec.finished {
            let waiting: Vec<String> = exec.pending_joins.keys().cloned().collect();
            self.save(&exec, Vec::new(), CheckpointStatus::Failed)?;
            return Err(self.abort(exec, "stalled before reaching a finish point", |run_id, state| {
                KernelError::Stalled {
                    run_id,
                    waiting,
                    state: Box::new(state),
                }
            }));
        }

        self.save(&exec, Vec::new(), CheckpointStatus::Completed)?;
        let Execution {
            state,
            steps,
            mut run_span,
            ..
        } = exec;
        run_span.set_attribute("steps", steps);
        run_span.set_ok();
        self.services.tracer.end_span(run_span);
        let duration = started.elapsed();
        self.services.events.emit(
            EventKind::RunCompleted,
            &self.name,
            json!({
                "run_id": state.run_id,
                "phase": state.phase,
                "steps": steps,
                "duration_ms": duration.as_millis() as u64,
            }),
        );
        tracing::info!(steps, duration_ms = duration.as_millis() as u64, "Run completed");

        Ok(RunOutcome {
            run_id: state.run_id.clone(),
            state,
            steps,
            duration,
            resumed,
        })
    }

    fn record_node_metrics(&self, output: &TaskOutput, succeeded: bool) {
        let metrics = self.services.tracer.metrics();
        let node = [("node", output.node_id.as_str())];
        let outcome = if succeeded { "node.completed" } else { "node.failed" };
        metrics.increment(outcome, 1, &node);
        metrics.histogram("node.duration_ms", output.elapsed.as_secs_f64() * 1000.0, &node);
    }

    /// Reject writes outside the node's declared write set
    fn check_update(&self, output: &TaskOutput) -> Result<(), FailureCause> {
        match &output.result {
            Ok(update) => {
                let writes = &self.nodes[&output.node_id].writes;
                match update.keys().find(|k| !writes.contains(*k)) {
                    Some(key) => Err(FailureCause::UndeclaredWrite(key.clone())),
                    None => Ok(()),
                }
            }
            Err(cause) => Err(cause.clone()),
        }
    }

    async fn on_success(
        &self,
        exec: &mut Execution,
        node_id: &str,
        update: StateUpdate,
        elapsed: Duration,
        span: Option<Span>,
    ) {
        exec.state.merge(update);
        self.mark_done(exec, node_id);

        if let Some(mut span) = span {
            span.set_ok();
            self.services.tracer.end_span(span);
        }
        self.services.events.emit(
            EventKind::NodeCompleted,
            node_id,
            json!({
                "run_id": exec.state.run_id,
                "node": node_id,
                "phase": exec.state.phase,
                "duration_ms": elapsed.as_secs_f64() * 1000.0,
            }),
        );
        self.services
            .hooks
            .trigger(
                HookContext::new(HookType::AfterExecute, node_id)
                    .with_data("run_id", json!(exec.state.run_id))
                    .with_data("phase", json!(exec.state.phase)),
            )
            .await;

        self.activate_successors(exec, node_id);
    }

    fn on_skipped(&self, exec: &mut Execution, node_id: &str) {
        self.mark_done(exec, node_id);
        tracing::info!(node = %node_id, "Node skipped by hook");
        self.services.events.emit(
            EventKind::NodeSkipped,
            node_id,
            json!({ "run_id": exec.state.run_id, "node": node_id }),
        );
        self.activate_successors(exec, node_id);
    }

    fn mark_done(&self, exec: &mut Execution, node_id: &str) {
        exec.state.completed.insert(node_id.to_string());
        exec.state.execution_path.push(node_id.to_string());
        exec.state.step += 1;
        exec.steps += 1;
        if self.finish.contains(node_id) {
            exec.finished = true;
        }
    }

    /// Returns true when a failure edge took over
    async fn on_failure(
        &self,
        exec: &mut Execution,
        node_id: &str,
        cause: &FailureCause,
        span: Option<Span>,
    ) -> bool {
        let message = cause.to_string();
        exec.state.failed.insert(node_id.to_string());
        exec.state.record_error(node_id, &message);
        exec.state.step += 1;
        exec.steps += 1;

        if let Some(mut span) = span {
            span.set_error(&message);
            self.services.tracer.end_span(span);
        }
        tracing::warn!(node = %node_id, error = %message, "Node failed");
        self.services.events.emit(
            EventKind::NodeFailed,
            node_id,
            json!({
                "run_id": exec.state.run_id,
                "node": node_id,
                "phase": exec.state.phase,
                "error": message,
            }),
        );
        self.services
            .hooks
            .trigger(HookContext::new(HookType::OnError, node_id).with_error(&message))
            .await;

        let targets: Vec<String> = self
            .edges
            .iter()
            .filter(|e| e.from == node_id && matches!(e.condition, EdgeCondition::OnFailure))
            .map(|e| e.to.clone())
            .collect();
        for target in &targets {
            self.trigger(exec, node_id, target);
        }
        !targets.is_empty()
    }

    /// Await every in-flight node. Returns the ids of nodes that failed.
    async fn drain(&self, in_flight: &mut InFlight, exec: &mut Execution) -> Vec<String> {
        let mut failed = Vec::new();
        while let Some((output, span)) = in_flight.next().await {
            let checked = self.check_update(&output);
            self.record_node_metrics(&output, checked.is_ok());
            match checked {
                Ok(()) => {
                    let TaskOutput { node_id, result, elapsed } = output;
                    if let Ok(update) = result {
                        self.on_success(exec, &node_id, update, elapsed, span).await;
                    }
                }
                Err(cause) => {
                    // Failure edges are not followed while the run is aborting
                    let node_id = output.node_id;
                    exec.state.failed.insert(node_id.clone());
                    exec.state.record_error(&node_id, &cause.to_string());
                    if let Some(mut span) = span {
                        span.set_error(&cause.to_string());
                        self.services.tracer.end_span(span);
                    }
                    self.services.events.emit(
                        EventKind::NodeFailed,
                        &node_id,
                        json!({ "run_id": exec.state.run_id, "node": node_id, "error": cause.to_string() }),
                    );
                    failed.push(node_id);
                }
            }
        }
        failed
    }

    fn activate_successors(&self, exec: &mut Execution, from: &str) {
        for edge in self.edges.iter().filter(|e| e.from == from) {
            match &edge.condition {
                EdgeCondition::Always => self.satisfy_join(exec, from, &edge.to),
                EdgeCondition::When(predicate) => {
                    if predicate(&exec.state) {
                        self.trigger(exec, from, &edge.to);
                    }
                }
                EdgeCondition::OnFailure => {}
            }
        }
        if let Some(router) = self.routers.get(from) {
            if let Some(target) = router.select(&exec.state).cloned() {
                self.trigger(exec, from, &target);
            }
        }
    }

    fn satisfy_join(&self, exec: &mut Execution, from: &str, to: &str) {
        let done = exec.pending_joins.entry(to.to_string()).or_default();
        done.insert(from.to_string());
        let complete = self.joins.get(to).map_or(true, |needed| needed.is_subset(done));
        if complete {
            self.trigger(exec, from, to);
        }
    }

    fn trigger(&self, exec: &mut Execution, from: &str, to: &str) {
        if exec.state.completed.contains(to) && !self.closes_loop(from, to) {
            tracing::debug!(from, to, "Ignoring activation of completed node");
            exec.pending_joins.remove(to);
            return;
        }
        exec.pending_joins.remove(to);
        exec.enqueue(to);
    }

    /// `from -> to` lies on a cycle
    fn closes_loop(&self, from: &str, to: &str) -> bool {
        from == to || self.reach.get(to).map_or(false, |r| r.contains(from))
    }

    /// Queued and in-flight nodes, plus any failed nodes to retry on resume
    fn frontier(&self, exec: &Execution, in_flight: &InFlight, retry: &[String]) -> Vec<String> {
        let mut frontier: Vec<String> = retry.to_vec();
        for id in in_flight.node_ids().into_iter().chain(exec.queue.iter()) {
            if !frontier.contains(id) {
                frontier.push(id.clone());
            }
        }
        frontier
    }

    fn save(&self, exec: &Execution, frontier: Vec<String>, status: CheckpointStatus) -> KernelResult<()> {
        let checkpoint = Checkpoint::capture(
            &exec.state,
            frontier,
            status,
            exec.finished,
            exec.pending_joins.clone(),
        );
        self.services.checkpoints.save(&checkpoint)?;
        self.services.events.emit(
            EventKind::CheckpointSaved,
            &self.name,
            json!({
                "run_id": checkpoint.run_id,
                "checkpoint_id": checkpoint.id,
                "step": checkpoint.step,
                "status": status.as_str(),
            }),
        );
        Ok(())
    }

    /// Close the run span, report the failure and build the error
    fn abort<F>(&self, exec: Execution, reason: &str, make: F) -> KernelError
    where
        F: FnOnce(String, GraphState) -> KernelError,
    {
        let Execution {
            state,
            mut run_span,
            ..
        } = exec;
        run_span.set_error(reason);
        self.services.tracer.end_span(run_span);
        tracing::warn!(run_id = %state.run_id, reason, "Run aborted");
        self.services.events.emit(
            EventKind::RunFailed,
            &self.name,
            json!({ "run_id": state.run_id, "phase": state.phase, "error": reason }),
        );
        make(state.run_id.clone(), state)
    }

    /// Text rendering of nodes and edges
    pub fn visualize(&self) -> String {
        let finish: Vec<&String> = self.finish.iter().collect();
        let mut out = format!(
            "Graph '{}' (entry: {}, finish: {:?})\n",
            self.name, self.entry, finish
        );
        for id in &self.order {
            let node = &self.nodes[id];
            out.push_str(&format!("  [{}]", node.id));
            if !node.reads.is_empty() {
                out.push_str(&format!(" reads={:?}", node.reads));
            }
            if !node.writes.is_empty() {
                out.push_str(&format!(" writes={:?}", node.writes));
            }
            out.push('\n');
            for edge in self.edges.iter().filter(|e| &e.from == id) {
                let label = match edge.condition {
                    EdgeCondition::Always => "",
                    EdgeCondition::When(_) => " (when)",
                    EdgeCondition::OnFailure => " (on failure)",
                };
                out.push_str(&format!("    -> {}{}\n", edge.to, label));
            }
            if let Some(router) = self.routers.get(id) {
                for (i, (_, target)) in router.routes.iter().enumerate() {
                    out.push_str(&format!("    -> {} (route {})\n", target, i + 1));
                }
                if let Some(default) = &router.default {
                    out.push_str(&format!("    -> {} (default)\n", default));
                }
            }
        }
        out
    }
}
