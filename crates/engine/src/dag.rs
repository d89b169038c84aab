//! Compiled workflow definitions.
//!
//! A declarative [`WorkflowConfig`] is compiled into a [`WorkflowDefinition`]:
//! an acyclic execution graph with a synthetic `root` wired before every
//! predecessor-less node and a synthetic `end` wired after every
//! successor-less node. Compiled nodes reference each other through arena
//! indices — the pre/next edges form a cyclic object graph, and indices keep
//! that ownership-free.
//!
//! Rules enforced at compile time:
//! 1. Node ids must be unique within the config.
//! 2. Every node must have a registered worker.
//! 3. Every `next_nodes` entry must reference a declared node.
//! 4. The graph must be acyclic (DFS from `root`; `end` is a sink).

use std::collections::HashMap;
use std::sync::Arc;

use workers::{NoopWorker, TaskWorker};

use crate::models::WorkflowConfig;
use crate::EngineError;

/// Task type of the synthetic start node.
pub const ROOT_TASK_TYPE: &str = "root";
/// Task type of the synthetic sink node.
pub const END_TASK_TYPE: &str = "end";

/// A compiled task node. Edges are indices into the owning definition's
/// node arena.
pub struct TaskNodeDefinition {
    pub task_type: String,
    pub task_name: String,
    /// Terminate the workflow once `fail_count + 1` reaches this; `<= 0`
    /// disables the bound.
    pub fail_max_count: i64,
    /// Terminate the workflow when a failing task has existed for longer
    /// than this many seconds; `<= 0` disables the bound.
    pub max_wait_time_ts: i64,
    pub pre_nodes: Vec<usize>,
    pub next_nodes: Vec<usize>,
    pub worker: Arc<dyn TaskWorker>,
}

impl std::fmt::Debug for TaskNodeDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskNodeDefinition")
            .field("task_type", &self.task_type)
            .field("task_name", &self.task_name)
            .field("fail_max_count", &self.fail_max_count)
            .field("max_wait_time_ts", &self.max_wait_time_ts)
            .field("pre_nodes", &self.pre_nodes)
            .field("next_nodes", &self.next_nodes)
            .finish()
    }
}

impl TaskNodeDefinition {
    fn new(task_type: &str, task_name: &str, worker: Arc<dyn TaskWorker>) -> Self {
        Self {
            task_type: task_type.to_string(),
            task_name: task_name.to_string(),
            fail_max_count: 0,
            max_wait_time_ts: 0,
            pre_nodes: Vec::new(),
            next_nodes: Vec::new(),
            worker,
        }
    }
}

/// A compiled, validated workflow graph. Immutable once built; shared via
/// `Arc` out of the registry's cache for the life of the process.
#[derive(Debug)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    /// Declared nodes plus the two synthetic ones.
    pub node_count: i64,
    /// Arena: `[root, declared nodes in config order…, end]`.
    nodes: Vec<TaskNodeDefinition>,
    root: usize,
    end: usize,
}

impl WorkflowDefinition {
    /// Compile `config`, resolving each node's worker through `resolve`
    /// (keyed by task type; the workflow type is fixed by the caller).
    pub fn compile(
        config: &WorkflowConfig,
        resolve: impl Fn(&str) -> Option<Arc<dyn TaskWorker>>,
    ) -> Result<Self, EngineError> {
        let mut nodes = Vec::with_capacity(config.nodes.len() + 2);
        nodes.push(TaskNodeDefinition::new(
            ROOT_TASK_TYPE,
            "root",
            Arc::new(NoopWorker),
        ));

        let mut index: HashMap<String, usize> = HashMap::new();
        for node_config in &config.nodes {
            if node_config.id == ROOT_TASK_TYPE || node_config.id == END_TASK_TYPE {
                return Err(EngineError::ParamInvalid(format!(
                    "node id '{}' is reserved in workflow config {}",
                    node_config.id, config.id
                )));
            }
            let worker = resolve(&node_config.id).ok_or_else(|| {
                EngineError::WorkerNotFound(format!(
                    "workflow_type: {}, task_type: {}",
                    config.id, node_config.id
                ))
            })?;
            let mut node = TaskNodeDefinition::new(&node_config.id, &node_config.name, worker);
            node.fail_max_count = node_config.fail_max_count.unwrap_or(0);
            node.max_wait_time_ts = node_config.max_wait_time_ts.unwrap_or(0);
            let idx = nodes.len();
            if index.insert(node_config.id.clone(), idx).is_some() {
                return Err(EngineError::ParamInvalid(format!(
                    "duplicate node id '{}' in workflow config {}",
                    node_config.id, config.id
                )));
            }
            nodes.push(node);
        }

        let end = nodes.len();
        nodes.push(TaskNodeDefinition::new(
            END_TASK_TYPE,
            "end",
            Arc::new(NoopWorker),
        ));

        // Wire declared edges; successor-less nodes feed `end`.
        for node_config in &config.nodes {
            let idx = index[&node_config.id];
            if node_config.next_nodes.is_empty() {
                nodes[idx].next_nodes.push(end);
                push_unique(&mut nodes[end].pre_nodes, idx);
                continue;
            }
            for next_id in &node_config.next_nodes {
                let next_idx = *index.get(next_id).ok_or_else(|| {
                    EngineError::UnknownNode(format!(
                        "node '{}' references undeclared next node '{}' in workflow config {}",
                        node_config.id, next_id, config.id
                    ))
                })?;
                nodes[idx].next_nodes.push(next_idx);
                push_unique(&mut nodes[next_idx].pre_nodes, idx);
            }
        }

        // Predecessor-less nodes hang off `root`.
        for idx in 1..end {
            if nodes[idx].pre_nodes.is_empty() {
                nodes[idx].pre_nodes.push(0);
                nodes[0].next_nodes.push(idx);
            }
        }

        let definition = Self {
            id: config.id.clone(),
            name: config.name.clone(),
            node_count: config.nodes.len() as i64 + 2,
            nodes,
            root: 0,
            end,
        };
        definition.check_acyclic()?;
        Ok(definition)
    }

    pub fn root(&self) -> usize {
        self.root
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn node(&self, idx: usize) -> &TaskNodeDefinition {
        &self.nodes[idx]
    }

    /// All nodes in linearized order: root, declared order, end.
    pub fn nodes(&self) -> &[TaskNodeDefinition] {
        &self.nodes
    }

    pub fn index_of(&self, task_type: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.task_type == task_type)
    }

    /// Task types of all nodes transitively reachable from `idx` through
    /// next-edges, excluding `idx` itself, deduplicated.
    pub fn descendant_task_types(&self, idx: usize) -> Vec<String> {
        let mut seen = vec![false; self.nodes.len()];
        let mut stack: Vec<usize> = self.nodes[idx].next_nodes.clone();
        let mut result = Vec::new();
        while let Some(current) = stack.pop() {
            if seen[current] {
                continue;
            }
            seen[current] = true;
            result.push(self.nodes[current].task_type.clone());
            stack.extend(&self.nodes[current].next_nodes);
        }
        result
    }

    /// DFS cycle check from `root`. A node re-entered while still on the
    /// current DFS path is a back edge; `end` terminates descent.
    fn check_acyclic(&self) -> Result<(), EngineError> {
        let mut on_path = vec![false; self.nodes.len()];
        self.visit_acyclic(self.root, &mut on_path)
    }

    fn visit_acyclic(&self, idx: usize, on_path: &mut [bool]) -> Result<(), EngineError> {
        if idx == self.end {
            return Ok(());
        }
        if on_path[idx] {
            return Err(EngineError::CycleDetected(format!(
                "node '{}' is reachable from itself in workflow {}",
                self.nodes[idx].task_type, self.id
            )));
        }
        on_path[idx] = true;
        for &next in &self.nodes[idx].next_nodes {
            self.visit_acyclic(next, on_path)
                .map_err(|e| e.context(format!("via node '{}'", self.nodes[idx].task_type)))?;
        }
        on_path[idx] = false;
        Ok(())
    }
}

fn push_unique(list: &mut Vec<usize>, value: usize) {
    if !list.contains(&value) {
        list.push(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NodeConfig;
    use crate::ErrorKind;

    fn node(id: &str, next: &[&str]) -> NodeConfig {
        NodeConfig {
            id: id.into(),
            name: format!("node {id}"),
            next_nodes: next.iter().map(|s| s.to_string()).collect(),
            fail_max_count: None,
            max_wait_time_ts: None,
        }
    }

    fn config(nodes: Vec<NodeConfig>) -> WorkflowConfig {
        WorkflowConfig {
            id: "wf".into(),
            name: "test workflow".into(),
            nodes,
        }
    }

    fn compile(config: &WorkflowConfig) -> Result<WorkflowDefinition, EngineError> {
        WorkflowDefinition::compile(config, |_| Some(Arc::new(NoopWorker)))
    }

    #[test]
    fn linear_chain_gets_root_and_end() {
        let def = compile(&config(vec![
            node("a", &["b"]),
            node("b", &["c"]),
            node("c", &[]),
        ]))
        .expect("compiles");

        assert_eq!(def.node_count, 5);
        let types: Vec<_> = def.nodes().iter().map(|n| n.task_type.as_str()).collect();
        assert_eq!(types, vec!["root", "a", "b", "c", "end"]);

        // root → a, c → end
        let a = def.index_of("a").unwrap();
        let c = def.index_of("c").unwrap();
        assert_eq!(def.node(def.root()).next_nodes, vec![a]);
        assert_eq!(def.node(a).pre_nodes, vec![def.root()]);
        assert_eq!(def.node(c).next_nodes, vec![def.end()]);
        assert_eq!(def.node(def.end()).pre_nodes, vec![c]);
    }

    #[test]
    fn diamond_predecessors_are_deduplicated() {
        let def = compile(&config(vec![
            node("a", &["b", "c"]),
            node("b", &["d"]),
            node("c", &["d"]),
            node("d", &[]),
        ]))
        .expect("compiles");

        let d = def.index_of("d").unwrap();
        let pre: Vec<_> = def
            .node(d)
            .pre_nodes
            .iter()
            .map(|&i| def.node(i).task_type.as_str())
            .collect();
        assert_eq!(pre.len(), 2);
        assert!(pre.contains(&"b") && pre.contains(&"c"));
    }

    #[test]
    fn parallel_sources_all_hang_off_root() {
        let def = compile(&config(vec![
            node("left", &["join"]),
            node("right", &["join"]),
            node("join", &[]),
        ]))
        .expect("compiles");

        let roots: Vec<_> = def
            .node(def.root())
            .next_nodes
            .iter()
            .map(|&i| def.node(i).task_type.as_str())
            .collect();
        assert_eq!(roots, vec!["left", "right"]);
    }

    #[test]
    fn undeclared_successor_is_rejected() {
        let err = compile(&config(vec![node("a", &["ghost"])])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownNode);
    }

    #[test]
    fn duplicate_node_id_is_rejected() {
        let err = compile(&config(vec![node("a", &[]), node("a", &[])])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParamInvalid);
    }

    #[test]
    fn missing_worker_is_rejected() {
        let cfg = config(vec![node("a", &[])]);
        let err = WorkflowDefinition::compile(&cfg, |_| None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WorkerNotFound);
    }

    #[test]
    fn cycle_is_detected() {
        let err = compile(&config(vec![
            node("a", &["b"]),
            node("b", &["c"]),
            node("c", &["a"]),
        ]))
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CycleDetected);
    }

    #[test]
    fn self_loop_is_detected() {
        let err = compile(&config(vec![node("a", &["a"])])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CycleDetected);
    }

    #[test]
    fn diamond_join_is_not_a_cycle() {
        // d is reached twice (via b and via c) but never while on the path.
        assert!(compile(&config(vec![
            node("a", &["b", "c"]),
            node("b", &["d"]),
            node("c", &["d"]),
            node("d", &[]),
        ]))
        .is_ok());
    }

    #[test]
    fn descendants_are_transitive_and_deduplicated() {
        let def = compile(&config(vec![
            node("a", &["b", "c"]),
            node("b", &["d"]),
            node("c", &["d"]),
            node("d", &[]),
        ]))
        .expect("compiles");

        let b = def.index_of("b").unwrap();
        let mut desc = def.descendant_task_types(b);
        desc.sort();
        assert_eq!(desc, vec!["d", "end"]);

        let a = def.index_of("a").unwrap();
        let mut desc = def.descendant_task_types(a);
        desc.sort();
        assert_eq!(desc, vec!["b", "c", "d", "end"]);
    }
}
