//! Dependency graph among constraints and dependency-ordered evaluation.
//!
//! A depth-first topological sort produces a linear order in which every
//! constraint appears after all of its declared dependencies. A cycle is
//! fatal for the run and is reported naming a constraint on the cycle,
//! never silently broken.

use std::collections::HashMap;

use thiserror::Error;

use crate::model::ConstraintDefinition;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DependencyError {
    #[error("circular dependency involving constraint '{constraint_id}'")]
    CircularDependency { constraint_id: String },
}

pub type DependencyResult<T> = Result<T, DependencyError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VisitState {
    Unvisited,
    InProgress,
    Done,
}

/// Partial order among constraints, built from their declared dependencies.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Node ids in declaration order.
    nodes: Vec<String>,
    /// id -> dependency ids (restricted to ids present in the input set).
    edges: HashMap<String, Vec<String>>,
    priorities: HashMap<String, i32>,
}

impl DependencyGraph {
    /// Builds the graph for a constraint set. Dependencies on ids outside
    /// the set are ignored so callers can evaluate subsets.
    pub fn build(definitions: &[ConstraintDefinition]) -> Self {
        let known: HashMap<&str, ()> = definitions.iter().map(|d| (d.id.as_str(), ())).collect();
        let mut nodes = Vec::with_capacity(definitions.len());
        let mut edges = HashMap::with_capacity(definitions.len());
        let mut priorities = HashMap::with_capacity(definitions.len());
        for def in definitions {
            nodes.push(def.id.clone());
            priorities.insert(def.id.clone(), def.priority);
            let deps: Vec<String> = def
                .dependencies
                .iter()
                .filter(|dep| known.contains_key(dep.as_str()))
                .cloned()
                .collect();
            edges.insert(def.id.clone(), deps);
        }
        Self {
            nodes,
            edges,
            priorities,
        }
    }

    pub fn dependencies_of(&self, id: &str) -> &[String] {
        self.edges.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_dependencies(&self) -> bool {
        self.edges.values().any(|deps| !deps.is_empty())
    }

    /// Copy of the adjacency map, for dependency-aware evaluation.
    pub fn dependency_map(&self) -> HashMap<String, Vec<String>> {
        self.edges.clone()
    }

    /// Linear evaluation order: every constraint after its dependencies.
    /// Independent constraints are ordered by descending priority, then
    /// declaration order.
    pub fn evaluation_order(&self) -> DependencyResult<Vec<String>> {
        let mut states: HashMap<&str, VisitState> = self
            .nodes
            .iter()
            .map(|id| (id.as_str(), VisitState::Unvisited))
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        // Priority only breaks ties among roots; it never overrides the
        // partial order.
        let mut roots: Vec<&String> = self.nodes.iter().collect();
        roots.sort_by_key(|id| -self.priorities.get(*id).copied().unwrap_or(0));

        for id in roots {
            self.visit(id, &mut states, &mut order)?;
        }
        Ok(order)
    }

    fn visit<'a>(
        &'a self,
        id: &'a str,
        states: &mut HashMap<&'a str, VisitState>,
        order: &mut Vec<String>,
    ) -> DependencyResult<()> {
        match states.get(id).copied().unwrap_or(VisitState::Unvisited) {
            VisitState::Done => return Ok(()),
            VisitState::InProgress => {
                return Err(DependencyError::CircularDependency {
                    constraint_id: id.to_string(),
                });
            }
            VisitState::Unvisited => {}
        }
        states.insert(id, VisitState::InProgress);
        for dep in self.dependencies_of(id) {
            self.visit(dep, states, order)?;
        }
        states.insert(id, VisitState::Done);
        order.push(id.to_string());
        Ok(())
    }
}
