//! Agent dependency graph.
//!
//! Built once at startup. A cycle or a dependency on an unknown agent is a
//! configuration error and the graph refuses to build.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use thiserror::Error;

use super::registry::{AgentDescriptor, AgentId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Agent {agent} depends on unknown agent {dependency}")]
    UnknownDependency { agent: AgentId, dependency: AgentId },

    #[error("Dependency cycle: {}", format_cycle(.0))]
    Cycle(Vec<AgentId>),

    #[error("Agent not found: {0}")]
    NotFound(AgentId),
}

fn format_cycle(path: &[AgentId]) -> String {
    path.iter()
        .map(|a| a.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Validated DAG of agent dependencies.
#[derive(Debug, Clone, Default)]
pub struct AgentGraph {
    edges: BTreeMap<AgentId, BTreeSet<AgentId>>,
}

impl AgentGraph {
    pub fn new<'a>(agents: impl IntoIterator<Item = &'a AgentDescriptor>) -> Result<Self, GraphError> {
        let edges: BTreeMap<AgentId, BTreeSet<AgentId>> = agents
            .into_iter()
            .map(|a| (a.id.clone(), a.dependencies.iter().cloned().collect()))
            .collect();

        for (agent, deps) in &edges {
            if let Some(missing) = deps.iter().find(|d| !edges.contains_key(*d)) {
                return Err(GraphError::UnknownDependency {
                    agent: agent.clone(),
                    dependency: missing.clone(),
                });
            }
        }

        let graph = Self { edges };
        let mut marks = HashMap::new();
        for agent in graph.edges.keys() {
            let mut path = Vec::new();
            graph.visit(agent, &mut marks, &mut path, &mut Vec::new())?;
        }
        Ok(graph)
    }

    pub fn contains(&self, agent: &AgentId) -> bool {
        self.edges.contains_key(agent)
    }

    pub fn dependencies_of(&self, agent: &AgentId) -> Vec<AgentId> {
        self.edges
            .get(agent)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// `agent` and all its transitive dependencies, dependencies first.
    /// Siblings are ordered by id so the order is deterministic.
    pub fn activation_order(&self, agent: &AgentId) -> Result<Vec<AgentId>, GraphError> {
        if !self.contains(agent) {
            return Err(GraphError::NotFound(agent.clone()));
        }
        let mut order = Vec::new();
        self.visit(agent, &mut HashMap::new(), &mut Vec::new(), &mut order)?;
        Ok(order)
    }

    /// Depth-first post-order walk. `path` holds the current chain for cycle
    /// reporting.
    fn visit(
        &self,
        agent: &AgentId,
        marks: &mut HashMap<AgentId, Mark>,
        path: &mut Vec<AgentId>,
        order: &mut Vec<AgentId>,
    ) -> Result<(), GraphError> {
        match marks.get(agent) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = path.iter().position(|a| a == agent).unwrap_or(0);
                let mut cycle: Vec<AgentId> = path[start..].to_vec();
                cycle.push(agent.clone());
                return Err(GraphError::Cycle(cycle));
            }
            None => {}
        }

        marks.insert(agent.clone(), Mark::Visiting);
        path.push(agent.clone());
        if let Some(deps) = self.edges.get(agent) {
            for dep in deps {
                self.visit(dep, marks, path, order)?;
            }
        }
        path.pop();
        marks.insert(agent.clone(), Mark::Done);
        order.push(agent.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<AgentId> {
        names.iter().map(|n| AgentId::from(*n)).collect()
    }

    #[test]
    fn test_chain_activates_leaf_first() {
        let agents = [
            AgentDescriptor::new("a").depends_on(&["b"]),
            AgentDescriptor::new("b").depends_on(&["c"]),
            AgentDescriptor::new("c"),
        ];
        let graph = AgentGraph::new(&agents).unwrap();
        assert_eq!(
            graph.activation_order(&AgentId::from("a")).unwrap(),
            ids(&["c", "b", "a"])
        );
    }

    #[test]
    fn test_diamond_visits_shared_dependency_once() {
        let agents = [
            AgentDescriptor::new("tutor").depends_on(&["vision", "speech"]),
            AgentDescriptor::new("vision").depends_on(&["context"]),
            AgentDescriptor::new("speech").depends_on(&["context"]),
            AgentDescriptor::new("context"),
        ];
        let graph = AgentGraph::new(&agents).unwrap();
        assert_eq!(
            graph.activation_order(&AgentId::from("tutor")).unwrap(),
            ids(&["context", "speech", "vision", "tutor"])
        );
    }

    #[test]
    fn test_cycle_rejected_with_path() {
        let agents = [
            AgentDescriptor::new("a").depends_on(&["b"]),
            AgentDescriptor::new("b").depends_on(&["c"]),
            AgentDescriptor::new("c").depends_on(&["a"]),
        ];
        let err = AgentGraph::new(&agents).unwrap_err();
        assert_eq!(err, GraphError::Cycle(ids(&["a", "b", "c", "a"])));
        assert_eq!(err.to_string(), "Dependency cycle: a -> b -> c -> a");
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let agents = [AgentDescriptor::new("loop").depends_on(&["loop"])];
        assert!(matches!(
            AgentGraph::new(&agents),
            Err(GraphError::Cycle(_))
        ));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let agents = [AgentDescriptor::new("a").depends_on(&["ghost"])];
        assert_eq!(
            AgentGraph::new(&agents).unwrap_err(),
            GraphError::UnknownDependency {
                agent: AgentId::from("a"),
                dependency: AgentId::from("ghost"),
            }
        );
    }
}
