//! # Graph Builder
//!
//! Declares nodes and edges, then validates the whole graph in `compile`.
//!
//! Edge families:
//! - plain edges (`add_edge`) are join edges: a target with several plain
//!   predecessors runs once all of them have completed;
//! - guarded edges (`add_edge_if`) and conditional routers
//!   (`add_conditional_edges`) activate their target on their own;
//! - failure edges (`add_failure_edge`) are taken only when the source
//!   node fails, and turn that failure into a recovery path.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use super::compiled::CompiledGraph;
use super::node::{NodeBuilder, NodeHandler, NodeSpec};
use super::state::GraphState;
use crate::error::{KernelError, KernelResult};

/// Routing condition evaluated against the merged state
pub type Predicate = Arc<dyn Fn(&GraphState) -> bool + Send + Sync>;

/// Wrap a closure as a [`Predicate`]
pub fn when<P>(predicate: P) -> Predicate
where
    P: Fn(&GraphState) -> bool + Send + Sync + 'static,
{
    Arc::new(predicate)
}

#[derive(Clone)]
pub(crate) enum EdgeCondition {
    Always,
    When(Predicate),
    OnFailure,
}

#[derive(Clone)]
pub(crate) struct Edge {
    pub(crate) from: String,
    pub(crate) to: String,
    pub(crate) condition: EdgeCondition,
}

/// Ordered predicate routes out of one node
pub(crate) struct Router {
    pub(crate) routes: Vec<(Predicate, String)>,
    pub(crate) default: Option<String>,
}

impl Router {
    pub(crate) fn targets(&self) -> impl Iterator<Item = &String> {
        self.routes.iter().map(|(_, t)| t).chain(self.default.iter())
    }

    pub(crate) fn select(&self, state: &GraphState) -> Option<&String> {
        self.routes
            .iter()
            .find(|(p, _)| p(state))
            .map(|(_, t)| t)
            .or(self.default.as_ref())
    }
}

/// Mutable graph definition
pub struct StateGraph {
    pub(crate) name: String,
    pub(crate) nodes: HashMap<String, NodeSpec>,
    /// Node ids in insertion order
    pub(crate) order: Vec<String>,
    pub(crate) edges: Vec<Edge>,
    pub(crate) routers: HashMap<String, Router>,
    pub(crate) entry: Option<String>,
    pub(crate) finish: BTreeSet<String>,
}

impl StateGraph {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            nodes: HashMap::new(),
            order: Vec::new(),
            edges: Vec::new(),
            routers: HashMap::new(),
            entry: None,
            finish: BTreeSet::new(),
        }
    }

    /// Add a node; declare its reads, writes and timeout on the returned builder
    pub fn add_node<H>(&mut self, id: &str, handler: H) -> KernelResult<NodeBuilder<'_>>
    where
        H: NodeHandler + 'static,
    {
        if self.nodes.contains_key(id) {
            return Err(KernelError::DuplicateNode(id.to_string()));
        }
        self.order.push(id.to_string());
        let node = self.nodes.entry(id.to_string()).or_insert(NodeSpec {
            id: id.to_string(),
            handler: Arc::new(handler),
            reads: BTreeSet::new(),
            writes: BTreeSet::new(),
            timeout: None,
        });
        Ok(NodeBuilder { node })
    }

    fn require_node(&self, id: &str) -> KernelResult<()> {
        if self.nodes.contains_key(id) {
            Ok(())
        } else {
            Err(KernelError::GraphValidation(format!("unknown node '{}'", id)))
        }
    }

    fn push_edge(&mut self, from: &str, to: &str, condition: EdgeCondition) -> KernelResult<()> {
        self.require_node(from)?;
        self.require_node(to)?;
        self.edges.push(Edge {
            from: from.to_string(),
            to: to.to_string(),
            condition,
        });
        Ok(())
    }

    pub fn add_edge(&mut self, from: &str, to: &str) -> KernelResult<()> {
        self.push_edge(from, to, EdgeCondition::Always)
    }

    pub fn add_edge_if<P>(&mut self, from: &str, to: &str, predicate: P) -> KernelResult<()>
    where
        P: Fn(&GraphState) -> bool + Send + Sync + 'static,
    {
        self.push_edge(from, to, EdgeCondition::When(Arc::new(predicate)))
    }

    /// Route to the first target whose predicate holds, else to `default`
    pub fn add_conditional_edges(
        &mut self,
        from: &str,
        routes: Vec<(&str, Predicate)>,
        default: Option<&str>,
    ) -> KernelResult<()> {
        self.require_node(from)?;
        if self.routers.contains_key(from) {
            return Err(KernelError::GraphValidation(format!(
                "node '{}' already has conditional edges",
                from
            )));
        }
        for (target, _) in &routes {
            self.require_node(target)?;
        }
        if let Some(target) = default {
            self.require_node(target)?;
        }
        self.routers.insert(
            from.to_string(),
            Router {
                routes: routes
                    .into_iter()
                    .map(|(t, p)| (p, t.to_string()))
                    .collect(),
                default: default.map(str::to_string),
            },
        );
        Ok(())
    }

    /// Take `to` when `from` fails instead of aborting the run
    pub fn add_failure_edge(&mut self, from: &str, to: &str) -> KernelResult<()> {
        self.push_edge(from, to, EdgeCondition::OnFailure)
    }

    pub fn set_entry_point(&mut self, id: &str) -> KernelResult<()> {
        self.require_node(id)?;
        self.entry = Some(id.to_string());
        Ok(())
    }

    /// Mark a node as a finish point. A graph may have several.
    pub fn set_finish_point(&mut self, id: &str) -> KernelResult<()> {
        self.require_node(id)?;
        self.finish.insert(id.to_string());
        Ok(())
    }

    /// Chain existing nodes with plain edges. The first becomes the entry
    /// point and the last a finish point.
    pub fn sequential(&mut self, ids: &[&str]) -> KernelResult<()> {
        let (first, last) = match (ids.first(), ids.last()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => {
                return Err(KernelError::GraphValidation(
                    "sequential needs at least one node".to_string(),
                ))
            }
        };
        for pair in ids.windows(2) {
            self.add_edge(pair[0], pair[1])?;
        }
        self.set_entry_point(first)?;
        self.set_finish_point(last)
    }

    /// Fan out from `start` (the entry point) to every branch. With a
    /// `join`, every branch feeds it and it is the finish point; without
    /// one, each branch is a finish point.
    pub fn parallel(&mut self, start: &str, branches: &[&str], join: Option<&str>) -> KernelResult<()> {
        if branches.is_empty() {
            return Err(KernelError::GraphValidation(
                "parallel needs at least one branch".to_string(),
            ));
        }
        for branch in branches {
            self.add_edge(start, branch)?;
            match join {
                Some(join) => self.add_edge(branch, join)?,
                None => self.set_finish_point(branch)?,
            }
        }
        if let Some(join) = join {
            self.set_finish_point(join)?;
        }
        self.set_entry_point(start)
    }

    /// Every successor of `id`, whatever the edge family
    pub(crate) fn successors(&self, id: &str) -> Vec<&String> {
        let mut out: Vec<&String> = self
            .edges
            .iter()
            .filter(|e| e.from == id)
            .map(|e| &e.to)
            .collect();
        if let Some(router) = self.routers.get(id) {
            out.extend(router.targets());
        }
        out
    }

    fn reachable_from(&self, start: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([start]);
        while let Some(id) = queue.pop_front() {
            for next in self.successors(id) {
                if seen.insert(next.clone()) {
                    queue.push_back(next);
                }
            }
        }
        seen
    }

    /// Validate and freeze the graph
    pub fn compile(self) -> KernelResult<CompiledGraph> {
        let entry = self
            .entry
            .clone()
            .ok_or_else(|| KernelError::GraphValidation("no entry point set".to_string()))?;
        if self.finish.is_empty() {
            return Err(KernelError::GraphValidation("no finish point set".to_string()));
        }

        let mut reachable = self.reachable_from(&entry);
        reachable.insert(entry.clone());
        let mut unreachable: Vec<&String> = self
            .order
            .iter()
            .filter(|id| !reachable.contains(*id))
            .collect();
        unreachable.sort();
        if !unreachable.is_empty() {
            return Err(KernelError::GraphValidation(format!(
                "unreachable from '{}': {:?}",
                entry, unreachable
            )));
        }

        self.check_unconditional_cycles()?;

        // reach[a] = nodes reachable from a through one or more edges
        let reach: HashMap<String, HashSet<String>> = self
            .order
            .iter()
            .map(|id| (id.clone(), self.reachable_from(id)))
            .collect();
        self.check_write_conflicts(&reach)?;

        tracing::debug!(graph = %self.name, nodes = self.nodes.len(), edges = self.edges.len(), "Graph compiled");
        Ok(CompiledGraph::new(self, entry, reach))
    }

    /// Plain and guarded edges must not close a cycle on their own
    fn check_unconditional_cycles(&self) -> KernelResult<()> {
        let mut indegree: HashMap<&str, usize> = self.order.iter().map(|id| (id.as_str(), 0)).collect();
        let plain: Vec<&Edge> = self
            .edges
            .iter()
            .filter(|e| matches!(e.condition, EdgeCondition::Always))
            .collect();
        for edge in &plain {
            *indegree.entry(edge.to.as_str()).or_insert(0) += 1;
        }

        let mut ready: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0;
        while let Some(id) = ready.pop_front() {
            visited += 1;
            for edge in plain.iter().filter(|e| e.from == id) {
                if let Some(d) = indegree.get_mut(edge.to.as_str()) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push_back(edge.to.as_str());
                    }
                }
            }
        }

        if visited < self.order.len() {
            let mut stuck: Vec<&str> = indegree
                .iter()
                .filter(|(_, d)| **d > 0)
                .map(|(id, _)| *id)
                .collect();
            stuck.sort();
            return Err(KernelError::GraphValidation(format!(
                "cycle of unconditional edges through {:?}",
                stuck
            )));
        }
        Ok(())
    }

    /// Nodes that may run concurrently (neither reaches the other) must
    /// declare disjoint write sets
    fn check_write_conflicts(&self, reach: &HashMap<String, HashSet<String>>) -> KernelResult<()> {
        let reaches = |a: &str, b: &str| reach.get(a).map_or(false, |r| r.contains(b));
        for (i, a) in self.order.iter().enumerate() {
            for b in self.order.iter().skip(i + 1) {
                let (na, nb) = (&self.nodes[a], &self.nodes[b]);
                let overlap: Vec<&String> = na.writes.intersection(&nb.writes).collect();
                if overlap.is_empty() || reaches(a, b) || reaches(b, a) {
                    continue;
                }
                return Err(KernelError::GraphValidation(format!(
                    "nodes '{}' and '{}' may run concurrently but both write {:?}",
                    a, b, overlap
                )));
            }
        }
        Ok(())
    }
}
