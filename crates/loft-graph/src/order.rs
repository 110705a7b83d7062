use std::collections::HashMap;

use loft_domain::ComposeDocument;
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::GraphError;

/// Validated execution order for a compose document's services.
#[derive(Debug, Clone)]
pub struct ServiceOrder {
    /// Dependencies before dependents. Create and start walk this forward.
    pub startup: Vec<String>,
}

impl ServiceOrder {
    /// Dependents before dependencies. Stop and destroy walk this.
    pub fn shutdown(&self) -> Vec<String> {
        self.startup.iter().rev().cloned().collect()
    }
}

/// Build the `depends_on` graph and return services in topological order.
///
/// The parser already guarantees every `depends_on` target is a declared
/// service; this rejects cycles, which make the document unprovisionable.
pub fn service_order(doc: &ComposeDocument) -> Result<ServiceOrder, GraphError> {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let node_map: HashMap<&str, NodeIndex> = doc
        .services
        .keys()
        .map(|name| (name.as_str(), graph.add_node(name.as_str())))
        .collect();

    // Edge dependency → dependent: "db must come up before backend".
    for (name, svc) in &doc.services {
        for dep in &svc.depends_on {
            graph.add_edge(node_map[dep.as_str()], node_map[name.as_str()], ());
        }
    }

    if is_cyclic_directed(&graph) {
        return Err(cycle_error(doc));
    }

    let topo = toposort(&graph, None).map_err(|_| cycle_error(doc))?;
    let startup = topo.iter().map(|idx| graph[*idx].to_string()).collect();

    Ok(ServiceOrder { startup })
}

fn cycle_error(doc: &ComposeDocument) -> GraphError {
    GraphError::CycleDetected {
        services: doc.services.keys().cloned().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loft_domain::{ComposeService, ComposeDocument};
    use std::collections::BTreeMap;

    fn doc(edges: &[(&str, &[&str])]) -> ComposeDocument {
        let mut services = BTreeMap::new();
        for (name, deps) in edges {
            services.insert(
                name.to_string(),
                ComposeService {
                    image: "img".into(),
                    ports: vec![],
                    environment: BTreeMap::new(),
                    depends_on: deps.iter().map(|d| d.to_string()).collect(),
                    volumes: vec![],
                    health_url: None,
                },
            );
        }
        ComposeDocument { services, volumes: vec![], networks: vec![] }
    }

    #[test]
    fn dependencies_come_first() {
        let d = doc(&[("backend", &["db"]), ("frontend", &["backend"]), ("db", &[])]);
        let order = service_order(&d).unwrap();
        let pos = |s: &str| order.startup.iter().position(|x| x == s).unwrap();
        assert!(pos("db") < pos("backend"));
        assert!(pos("backend") < pos("frontend"));
    }

    #[test]
    fn shutdown_reverses_startup() {
        let d = doc(&[("a", &[]), ("b", &["a"])]);
        let order = service_order(&d).unwrap();
        let mut rev = order.startup.clone();
        rev.reverse();
        assert_eq!(order.shutdown(), rev);
    }

    #[test]
    fn cycle_is_rejected() {
        let d = doc(&[("a", &["b"]), ("b", &["a"])]);
        assert!(matches!(service_order(&d), Err(GraphError::CycleDetected { .. })));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let d = doc(&[("a", &["a"])]);
        assert!(service_order(&d).is_err());
    }

    #[test]
    fn independent_services_all_present() {
        let d = doc(&[("a", &[]), ("b", &[]), ("c", &[])]);
        let order = service_order(&d).unwrap();
        assert_eq!(order.startup.len(), 3);
    }
}
