use std::collections::HashMap;
use std::sync::Arc;

use camino::Utf8Path;
use petgraph::Graph;
use petgraph::algo::kosaraju_scc;
use petgraph::graph::NodeIndex;

use crate::error::KilnError;
use crate::task::Task;

/// Explains why none of the `blocked` tasks could run: names them all and
/// lists the dependency cycles among them.
pub(super) fn diagnose(blocked: &[Arc<Task>]) -> KilnError {
    let mut graph: Graph<&str, ()> = Graph::new();
    let nodes: Vec<NodeIndex> = blocked.iter().map(|task| graph.add_node(task.name())).collect();

    let mut producers: HashMap<&Utf8Path, NodeIndex> = HashMap::new();
    for (task, &node) in blocked.iter().zip(&nodes) {
        for output in task.outputs() {
            producers.insert(output.abs_path(), node);
        }
    }

    for (task, &node) in blocked.iter().zip(&nodes) {
        for input in task.inputs() {
            if let Some(&producer) = producers.get(input.abs_path()) {
                graph.update_edge(producer, node, ());
            }
        }
    }

    let cycles = kosaraju_scc(&graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .map(|scc| scc.into_iter().map(|n| graph[n].to_string()).collect())
        .collect();

    KilnError::Stalled {
        blocked: blocked.iter().map(|t| t.name().to_string()).collect(),
        cycles,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{BuildContext, Builder, BuilderDescriptor, BuilderRegistry};
    use crate::error::BuildError;
    use crate::resource::FileSystem;
    use crate::task::TaskDef;

    struct Noop;

    impl Builder for Noop {
        fn build(&self, _: &Task, _: &mut BuildContext<'_>) -> Result<(), BuildError> {
            Ok(())
        }
    }

    #[test]
    fn test_cycle_is_reported() {
        let mut registry = BuilderRegistry::new();
        registry
            .register(BuilderDescriptor::new("x", "x", "y"), Arc::new(Noop))
            .unwrap();
        let registered = registry.get("x").unwrap();
        let fs = FileSystem::new("/p", "build");

        let a_out = fs.get("a.y").output();
        let b_out = fs.get("b.y").output();

        let a = TaskDef::new(fs.get("a.x"))
            .input(b_out.clone())
            .output(a_out.clone())
            .name("a")
            .finish(registered);
        let b = TaskDef::new(fs.get("b.x"))
            .input(a_out)
            .output(b_out)
            .name("b")
            .finish(registered);
        let c = TaskDef::new(fs.get("c.x"))
            .output(fs.get("c.y").output())
            .name("c")
            .finish(registered);

        let err = diagnose(&[Arc::new(a), Arc::new(b), Arc::new(c)]);
        match err {
            KilnError::Stalled { blocked, cycles } => {
                assert_eq!(blocked, ["a", "b", "c"]);
                assert_eq!(cycles.len(), 1);
                let mut cycle = cycles[0].clone();
                cycle.sort();
                assert_eq!(cycle, ["a", "b"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
