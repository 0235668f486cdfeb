use proptest::prelude::*;
use provision::{
    ActionError, CancelToken, ExecuteOptions, FnAction, GraphExecutor, NodeStatus, ProvisionGraph,
    ResourceNode,
};
use serde_json::json;
use statekit::{LockManager, MemoryStateStore};
use std::sync::{Arc, Mutex};

/// Random DAG: node `i` may only depend on nodes declared before it
fn dag() -> impl Strategy<Value = Vec<Vec<usize>>> {
    prop::collection::vec(prop::collection::vec(any::<bool>(), 10), 1..10).prop_map(|rows| {
        rows.iter()
            .enumerate()
            .map(|(i, row)| (0..i).filter(|&j| row[j]).collect())
            .collect()
    })
}

fn name(i: usize) -> String {
    format!("node-{i}")
}

fn build(deps: &[Vec<usize>], failing: Option<usize>, log: &Arc<Mutex<Vec<String>>>) -> Vec<ResourceNode> {
    deps.iter()
        .enumerate()
        .map(|(i, node_deps)| {
            let log = log.clone();
            let label = name(i);
            let fail = failing == Some(i);
            let action = FnAction::new(format!("create {label}"), move |_, _| {
                log.lock().unwrap().push(label.clone());
                if fail {
                    Err(ActionError::permanent("boom"))
                } else {
                    Ok(json!({ "id": label }))
                }
            });
            ResourceNode::new(name(i), Arc::new(action))
                .depends_on(node_deps.iter().map(|&d| name(d)))
                .state_resource(name(i))
        })
        .collect()
}

fn executor() -> GraphExecutor {
    let store = Arc::new(MemoryStateStore::new());
    let opts = ExecuteOptions {
        jobs: 3,
        ..ExecuteOptions::default()
    };
    GraphExecutor::new(store.clone(), LockManager::new(store), opts)
}

fn transitive_dependents(deps: &[Vec<usize>], root: usize) -> Vec<usize> {
    let mut found = vec![false; deps.len()];
    for i in 0..deps.len() {
        found[i] = deps[i].iter().any(|&d| d == root || found[d]);
    }
    (0..deps.len()).filter(|&i| found[i]).collect()
}

proptest! {
    #[test]
    fn topological_order_respects_dependencies(deps in dag()) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let graph = ProvisionGraph::build(build(&deps, None, &log)).unwrap();
        let order = graph.topological_order();

        prop_assert_eq!(order.len(), deps.len());
        for (i, node_deps) in deps.iter().enumerate() {
            let at = order.iter().position(|n| *n == name(i)).unwrap();
            for &d in node_deps {
                let dep_at = order.iter().position(|n| *n == name(d)).unwrap();
                prop_assert!(dep_at < at);
            }
        }
    }

    #[test]
    fn execution_never_starts_a_node_before_its_dependencies(deps in dag()) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let report = executor()
            .run_simple(build(&deps, None, &log), &CancelToken::new())
            .unwrap();

        prop_assert!(report.summary().is_success());
        let started = log.lock().unwrap().clone();
        prop_assert_eq!(started.len(), deps.len());
        for (i, node_deps) in deps.iter().enumerate() {
            let at = started.iter().position(|n| *n == name(i)).unwrap();
            for &d in node_deps {
                let dep_at = started.iter().position(|n| *n == name(d)).unwrap();
                prop_assert!(dep_at < at);
            }
        }
    }

    #[test]
    fn failure_skips_exactly_the_transitive_dependents(deps in dag(), pick in any::<prop::sample::Index>()) {
        let failing = pick.index(deps.len());
        let log = Arc::new(Mutex::new(Vec::new()));
        let report = executor()
            .run_simple(build(&deps, Some(failing), &log), &CancelToken::new())
            .unwrap();

        let downstream = transitive_dependents(&deps, failing);
        let started = log.lock().unwrap().clone();

        prop_assert_eq!(report.status_of(&name(failing)), Some(NodeStatus::Failed));
        for i in 0..deps.len() {
            let status = report.status_of(&name(i));
            if downstream.contains(&i) {
                prop_assert_eq!(status, Some(NodeStatus::Skipped));
                prop_assert!(!started.contains(&name(i)));
            } else if i != failing {
                prop_assert_eq!(status, Some(NodeStatus::Succeeded));
            }
        }
    }
}
