use std::collections::BTreeMap;

use vigil_core::query::{DependencyGraph, GraphEdge, GraphNode, ServiceDependency};

use crate::TraceStore;

/// Caller-service to callee-service call and error counters.
#[derive(Debug, Default)]
pub(crate) struct DependencyGraphBuilder {
    by_caller: BTreeMap<String, ServiceDependency>,
}

impl DependencyGraphBuilder {
    pub(crate) fn record(&mut self, caller: &str, callee: &str, is_error: bool) {
        if caller == callee {
            return;
        }
        let dep = self
            .by_caller
            .entry(caller.to_string())
            .or_insert_with(|| ServiceDependency {
                service: caller.to_string(),
                ..ServiceDependency::default()
            });

        if !dep.dependencies.iter().any(|d| d == callee) {
            dep.dependencies.push(callee.to_string());
        }
        *dep.call_counts.entry(callee.to_string()).or_insert(0) += 1;
        if is_error {
            *dep.error_counts.entry(callee.to_string()).or_insert(0) += 1;
        }
    }

    pub(crate) fn dependencies(&self) -> Vec<ServiceDependency> {
        self.by_caller.values().cloned().collect()
    }

    pub(crate) fn graph(&self) -> DependencyGraph {
        fn add_node(id: &str, nodes: &mut Vec<GraphNode>) {
            if !nodes.iter().any(|n| n.id == id) {
                nodes.push(GraphNode {
                    id: id.to_string(),
                    label: id.to_string(),
                    kind: "service".to_string(),
                });
            }
        }

        let mut nodes = Vec::new();
        let mut edges = Vec::new();

        for dep in self.by_caller.values() {
            add_node(&dep.service, &mut nodes);
            for callee in &dep.dependencies {
                add_node(callee, &mut nodes);
                edges.push(GraphEdge {
                    from: dep.service.clone(),
                    to: callee.clone(),
                    weight: dep.call_counts.get(callee).copied().unwrap_or(0),
                    errors: dep.error_counts.get(callee).copied().unwrap_or(0),
                });
            }
        }

        DependencyGraph { nodes, edges }
    }
}

impl TraceStore {
    pub fn dependency_graph(&self) -> DependencyGraph {
        self.state().graph.graph()
    }

    pub fn service_dependencies(&self) -> Vec<ServiceDependency> {
        self.state().graph.dependencies()
    }
}

#[cfg(test)]
mod tests {
    use testkit::ManualClock;
    use vigil_core::model::span::{SpanStatusCode, Tags};

    use super::DependencyGraphBuilder;
    use crate::{StartSpan, TraceStore, TraceStoreConfig};

    #[test]
    fn builder_ignores_same_service_calls() {
        let mut builder = DependencyGraphBuilder::default();
        builder.record("api", "api", false);
        builder.record("api", "db", true);
        builder.record("api", "db", false);

        let graph = builder.graph();
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.edges.len(), 1);
        let edge = graph.edge("api", "db").unwrap();
        assert_eq!(edge.weight, 2);
        assert_eq!(edge.errors, 1);
    }

    #[test]
    fn cross_service_child_spans_build_edges() {
        let clock = ManualClock::at_base();
        let store = TraceStore::with_clock(TraceStoreConfig::default(), clock.shared());

        let root = store.start_span(StartSpan::new("GET /orders", "api"));
        let local = store.start_span(StartSpan::new("render", "api").child_of(&root));
        let query = store.start_span(StartSpan::new("SELECT", "db").child_of(&root));
        let cache = store.start_span(StartSpan::new("GET", "cache").child_of(&root));
        clock.advance_ms(3);
        store.set_status(&cache.span_id, SpanStatusCode::Error, None);
        for span in [&local, &query, &cache, &root] {
            store.finish_span(&span.span_id, Tags::new());
        }

        let graph = store.dependency_graph();
        assert_eq!(graph.edges.len(), 2);
        assert_eq!(graph.edge("api", "db").unwrap().weight, 1);
        assert_eq!(graph.edge("api", "cache").unwrap().errors, 1);
        assert!(graph.nodes.iter().all(|n| n.kind == "service"));

        let deps = store.service_dependencies();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].service, "api");
        assert_eq!(deps[0].dependencies, vec!["db".to_string(), "cache".to_string()]);
    }
}
