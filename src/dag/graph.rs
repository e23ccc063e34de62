// src/dag/graph.rs

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::errors::{EngineError, Result};
use crate::job::Job;

/// Why one job waits for another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edge {
    /// Listed in `needs`.
    Needs,
    /// Implied by stage order for a job without `needs`.
    Stage,
}

/// Dependency graph between the latest jobs of a pipeline, keyed by job
/// name. An edge `a -> b` means `b` waits for `a`.
///
/// Jobs with `needs` wait for exactly those jobs; every other job waits for
/// all jobs in earlier stages. Needs that point at jobs not in the pipeline
/// produce no edge.
#[derive(Debug, Clone)]
pub struct NeedsGraph<'a> {
    graph: DiGraphMap<&'a str, Edge>,
}

impl<'a> NeedsGraph<'a> {
    pub fn from_jobs<I>(jobs: I) -> Self
    where
        I: IntoIterator<Item = &'a Job>,
    {
        let mut jobs: Vec<&'a Job> = jobs.into_iter().collect();
        // Node insertion order breaks ties in the topological order.
        jobs.sort_by(|a, b| (a.stage_idx, &a.name).cmp(&(b.stage_idx, &b.name)));

        let mut graph: DiGraphMap<&'a str, Edge> = DiGraphMap::new();
        for job in &jobs {
            graph.add_node(job.name.as_str());
        }

        for job in &jobs {
            if job.needs.is_empty() {
                for earlier in jobs.iter().filter(|other| other.stage_idx < job.stage_idx) {
                    graph.add_edge(earlier.name.as_str(), job.name.as_str(), Edge::Stage);
                }
            } else {
                for need in &job.needs {
                    if graph.contains_node(need.as_str()) {
                        graph.add_edge(need.as_str(), job.name.as_str(), Edge::Needs);
                    }
                }
            }
        }

        Self { graph }
    }

    pub fn jobs(&self) -> impl Iterator<Item = &'a str> + '_ {
        self.graph.nodes()
    }

    /// Jobs `name` lists in `needs` that exist in the pipeline.
    pub fn needs_of(&self, name: &str) -> Vec<&'a str> {
        self.neighbors(name, Direction::Incoming)
    }

    /// Jobs that list `name` in their `needs`.
    pub fn dependents_of(&self, name: &str) -> Vec<&'a str> {
        self.neighbors(name, Direction::Outgoing)
    }

    fn neighbors(&self, name: &str, direction: Direction) -> Vec<&'a str> {
        let Some(node) = self.graph.nodes().find(|n| *n == name) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(node, direction)
            .filter(|other| {
                let (from, to) = match direction {
                    Direction::Incoming => (*other, node),
                    Direction::Outgoing => (node, *other),
                };
                self.graph.edge_weight(from, to) == Some(&Edge::Needs)
            })
            .collect()
    }

    /// Names in an order where every job comes after everything it waits for.
    pub fn processing_order(&self) -> Result<Vec<String>> {
        match toposort(&self.graph, None) {
            Ok(order) => Ok(order.into_iter().map(str::to_string).collect()),
            Err(cycle) => Err(EngineError::NeedsCycle(format!(
                "cycle detected in job needs involving job '{}'",
                cycle.node_id()
            ))),
        }
    }
}
