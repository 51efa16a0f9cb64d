/// DAG templates: the step graph of one operation, ready to be materialised
///
/// Every step of group `i` depends on every step of group `i - 1`. The reverse
/// template (used when destroying) flips each edge so teardown walks the groups
/// backwards. Templates are validated with petgraph before being persisted.

use crate::error::{SchedulerError, SchedulerResult};
use crate::operation::registry::Operation;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeSet, HashMap};

/// Nodes are step references, edges are `(depends_on, step)` pairs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DagTemplate {
    pub workflow_id: String,
    pub nodes: BTreeSet<String>,
    pub edges: BTreeSet<(String, String)>,
}

impl DagTemplate {
    pub fn new(
        workflow_id: impl Into<String>,
        nodes: BTreeSet<String>,
        edges: BTreeSet<(String, String)>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            nodes,
            edges,
        }
    }

    /// Forward template of `operation`, keyed by the operation name
    pub fn from_operation(operation_name: &str, operation: &Operation) -> Self {
        let mut nodes = BTreeSet::new();
        let mut edges = BTreeSet::new();
        let mut previous: Vec<String> = Vec::new();

        for group in &operation.step_groups {
            let current: Vec<String> = group
                .get_step_subgroup_to_run()
                .iter()
                .map(|step| step.unique_reference().to_string())
                .collect();

            for step in &current {
                nodes.insert(step.clone());
                for dependency in &previous {
                    edges.insert((dependency.clone(), step.clone()));
                }
            }
            previous = current;
        }

        Self::new(operation_name, nodes, edges)
    }

    /// Same nodes with every edge flipped
    pub fn reversed(&self) -> Self {
        let edges = self
            .edges
            .iter()
            .map(|(depends_on, step)| (step.clone(), depends_on.clone()))
            .collect();
        Self::new(self.workflow_id.clone(), self.nodes.clone(), edges)
    }

    /// Sub-template keeping only `keep` and the edges between them
    pub fn restricted_to(&self, keep: &BTreeSet<String>) -> Self {
        let nodes = self.nodes.intersection(keep).cloned().collect();
        let edges = self
            .edges
            .iter()
            .filter(|(depends_on, step)| keep.contains(depends_on) && keep.contains(step))
            .cloned()
            .collect();
        Self::new(self.workflow_id.clone(), nodes, edges)
    }

    /// Check edges reference known nodes and the graph has no cycles
    pub fn validate(&self) -> SchedulerResult<()> {
        self.execution_order().map(|_| ())
    }

    /// Topological order of the nodes
    pub fn execution_order(&self) -> SchedulerResult<Vec<String>> {
        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut index_of: HashMap<&str, NodeIndex> = HashMap::new();

        for node in &self.nodes {
            index_of.insert(node.as_str(), graph.add_node(node.as_str()));
        }

        for (depends_on, step) in &self.edges {
            let from = index_of.get(depends_on.as_str()).ok_or_else(|| self.invalid(format!(
                "edge references unknown node '{depends_on}'"
            )))?;
            let to = index_of
                .get(step.as_str())
                .ok_or_else(|| self.invalid(format!("edge references unknown node '{step}'")))?;
            graph.add_edge(*from, *to, ());
        }

        let order = toposort(&graph, None).map_err(|_| self.invalid("template contains cycles".to_string()))?;
        Ok(order.into_iter().map(|index| graph[index].to_string()).collect())
    }

    fn invalid(&self, reason: String) -> SchedulerError {
        SchedulerError::InvalidTemplate {
            workflow_id: self.workflow_id.clone(),
            reason,
        }
    }
}
