//! Per-run node states for a validated plan.

use std::collections::{HashMap, VecDeque};

use crate::types::{Plan, Step, StepId};

/// Node state in the execution DAG
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Pending,
    /// Every dependency completed
    Ready,
    Running,
    Completed,
    Failed,
    /// Never ran (upstream failure, budget, deadline or cancellation)
    Skipped,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// One step plus its scheduling state
#[derive(Debug, Clone)]
pub struct DagNode {
    pub step: Step,
    pub state: NodeState,
    /// Reverse edges
    pub dependents: Vec<StepId>,
    /// Declaration index in the plan
    pub position: usize,
}

impl DagNode {
    fn new(step: Step, position: usize) -> Self {
        Self {
            step,
            state: NodeState::Pending,
            dependents: Vec::new(),
            position,
        }
    }

    /// True once every `depends_on` entry is `Completed`
    pub fn dependencies_satisfied(&self, nodes: &HashMap<String, DagNode>) -> bool {
        self.step.depends_on.iter().all(|dep_id| {
            nodes
                .get(dep_id.as_str())
                .map(|n| n.state == NodeState::Completed)
                .unwrap_or(false)
        })
    }
}

/// Execution DAG built from a validated plan
#[derive(Debug, Clone)]
pub struct ExecutionDag {
    pub nodes: HashMap<String, DagNode>,
    /// Ready nodes in declaration order
    pub ready_nodes: Vec<String>,
}

impl ExecutionDag {
    /// Errors name the first dependency that is not a step of `plan`.
    pub fn from_plan(plan: &Plan) -> Result<Self, String> {
        let mut nodes = HashMap::with_capacity(plan.steps.len());
        for (position, step) in plan.steps.iter().enumerate() {
            nodes.insert(step.id.to_string(), DagNode::new(step.clone(), position));
        }

        for step in &plan.steps {
            for dep_id in &step.depends_on {
                match nodes.get_mut(dep_id.as_str()) {
                    Some(dep_node) => dep_node.dependents.push(step.id.clone()),
                    None => return Err(format!("step '{}' depends on unknown step '{}'", step.id, dep_id)),
                }
            }
        }

        let mut dag = Self {
            nodes,
            ready_nodes: Vec::new(),
        };
        dag.update_ready_nodes();
        Ok(dag)
    }

    /// Recompute `ready_nodes`, promoting satisfied `Pending` nodes.
    pub fn update_ready_nodes(&mut self) {
        let mut ready: Vec<(usize, String)> = self
            .nodes
            .iter()
            .filter(|(_, node)| {
                matches!(node.state, NodeState::Pending | NodeState::Ready)
                    && node.dependencies_satisfied(&self.nodes)
            })
            .map(|(id, node)| (node.position, id.clone()))
            .collect();
        ready.sort();
        self.ready_nodes = ready.into_iter().map(|(_, id)| id).collect();

        for id in &self.ready_nodes {
            if let Some(node) = self.nodes.get_mut(id) {
                if node.state == NodeState::Pending {
                    node.state = NodeState::Ready;
                }
            }
        }
    }

    pub fn get_node(&self, id: &str) -> Option<&DagNode> {
        self.nodes.get(id)
    }

    pub fn state(&self, id: &str) -> Option<NodeState> {
        self.nodes.get(id).map(|n| n.state)
    }

    pub fn mark_running(&mut self, id: &str) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.state = NodeState::Running;
            self.ready_nodes.retain(|n| n != id);
        }
    }

    /// Completing a node may release its dependents.
    pub fn mark_completed(&mut self, id: &str) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.state = NodeState::Completed;
        }
        self.update_ready_nodes();
    }

    pub fn mark_failed(&mut self, id: &str) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.state = NodeState::Failed;
        }
        self.ready_nodes.retain(|n| n != id);
    }

    pub fn mark_skipped(&mut self, id: &str) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.state = NodeState::Skipped;
        }
        self.ready_nodes.retain(|n| n != id);
    }

    /// Skip every non-terminal transitive dependent of `id`.
    /// Returns the newly skipped ids in declaration order.
    pub fn skip_dependents(&mut self, id: &str) -> Vec<String> {
        let mut skipped = Vec::new();
        let mut queue: VecDeque<StepId> = self
            .nodes
            .get(id)
            .map(|n| n.dependents.iter().cloned().collect())
            .unwrap_or_default();

        while let Some(next) = queue.pop_front() {
            let Some(node) = self.nodes.get_mut(next.as_str()) else {
                continue;
            };
            if node.state.is_terminal() || node.state == NodeState::Running {
                continue;
            }
            node.state = NodeState::Skipped;
            queue.extend(node.dependents.iter().cloned());
            skipped.push((node.position, next.to_string()));
        }

        skipped.sort();
        let skipped: Vec<String> = skipped.into_iter().map(|(_, id)| id).collect();
        self.ready_nodes.retain(|n| !skipped.contains(n));
        skipped
    }

    /// Non-terminal node ids in declaration order
    pub fn unfinished_nodes(&self) -> Vec<String> {
        let mut open: Vec<(usize, String)> = self
            .nodes
            .iter()
            .filter(|(_, n)| !n.state.is_terminal())
            .map(|(id, n)| (n.position, id.clone()))
            .collect();
        open.sort();
        open.into_iter().map(|(_, id)| id).collect()
    }

    pub fn is_settled(&self) -> bool {
        self.nodes.values().all(|n| n.state.is_terminal())
    }
}
