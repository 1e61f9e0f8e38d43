//! Dependency graph over project actions.
//!
//! Edges point from a dependency to the action that needs it. Every id that
//! appears as a key or inside a `needs` list is a node, so an undefined
//! dependency is only reported when something tries to materialize it.

use std::collections::{BTreeMap, BTreeSet};

use super::definition::ActionDefinition;
use crate::error::JobError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Directed graph of actions built from `needs` declarations.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// node -> actions it needs
    dependencies: BTreeMap<String, BTreeSet<String>>,
    /// node -> actions that need it
    dependents: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Builds the graph, failing if the `needs` declarations form a cycle.
    pub fn build<'a>(
        actions: impl IntoIterator<Item = &'a ActionDefinition>,
    ) -> Result<Self, JobError> {
        let mut graph = Self::default();

        for action in actions {
            graph.add_node(&action.action_id);
            for dependency in &action.needs {
                graph.add_node(dependency);
                graph.add_edge(dependency, &action.action_id);
            }
        }

        if let Some(cycle) = graph.find_cycle() {
            return Err(JobError::CyclicDependency { cycle });
        }

        Ok(graph)
    }

    fn add_node(&mut self, id: &str) {
        self.dependencies.entry(id.to_string()).or_default();
        self.dependents.entry(id.to_string()).or_default();
    }

    fn add_edge(&mut self, from: &str, to: &str) {
        self.dependents
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string());
        self.dependencies
            .entry(to.to_string())
            .or_default()
            .insert(from.to_string());
    }

    /// Direct dependencies of `action_id`, sorted.
    pub fn predecessors(&self, action_id: &str) -> Vec<&str> {
        self.dependencies
            .get(action_id)
            .map(|deps| deps.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Actions that directly need `action_id`, sorted.
    pub fn successors(&self, action_id: &str) -> Vec<&str> {
        self.dependents
            .get(action_id)
            .map(|deps| deps.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, action_id: &str) -> bool {
        self.dependencies.contains_key(action_id)
    }

    /// All node ids, sorted.
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.dependencies.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    /// Returns one cycle as `a -> b -> ... -> a`, if any exists.
    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();
        let mut stack: Vec<&str> = Vec::new();

        for node in self.nodes() {
            if !marks.contains_key(node) {
                if let Some(cycle) = self.visit(node, &mut marks, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn visit<'a>(
        &'a self,
        node: &'a str,
        marks: &mut BTreeMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        marks.insert(node, Mark::Visiting);
        stack.push(node);

        for next in self.successors(node) {
            match marks.get(next) {
                Some(Mark::Visiting) => {
                    let start = stack.iter().position(|n| *n == next).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        stack[start..].iter().map(|n| n.to_string()).collect();
                    cycle.push(next.to_string());
                    return Some(cycle);
                }
                Some(Mark::Done) => {}
                None => {
                    if let Some(cycle) = self.visit(next, marks, stack) {
                        return Some(cycle);
                    }
                }
            }
        }

        stack.pop();
        marks.insert(node, Mark::Done);
        None
    }
}
