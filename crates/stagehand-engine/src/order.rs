//! Deploy and destroy ordering.

use stagehand_core::{Error, Result};
use stagehand_resources::Resource;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Order resources so every requirement comes first.
///
/// Depth-first over the declared list, so independent resources keep their
/// declared order. Unknown requirements and cycles are configuration errors.
pub fn topological_sort(resources: Vec<Arc<dyn Resource>>) -> Result<Vec<Arc<dyn Resource>>> {
    let index: HashMap<String, usize> = resources
        .iter()
        .enumerate()
        .map(|(i, r)| (r.name(), i))
        .collect();
    if index.len() != resources.len() {
        return Err(Error::Configuration("duplicate resource names".to_string()));
    }

    let mut marks: HashMap<usize, Mark> = HashMap::new();
    let mut order = Vec::with_capacity(resources.len());
    for i in 0..resources.len() {
        visit(i, &resources, &index, &mut marks, &mut order)?;
    }

    let mut slots: Vec<Option<Arc<dyn Resource>>> = resources.into_iter().map(Some).collect();
    Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
}

fn visit(
    i: usize,
    resources: &[Arc<dyn Resource>],
    index: &HashMap<String, usize>,
    marks: &mut HashMap<usize, Mark>,
    order: &mut Vec<usize>,
) -> Result<()> {
    match marks.get(&i) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::Visiting) => {
            return Err(Error::Configuration(format!(
                "dependency cycle through {}",
                resources[i].name()
            )));
        }
        None => {}
    }
    marks.insert(i, Mark::Visiting);

    for requirement in resources[i].requires() {
        let Some(&dep) = index.get(&requirement) else {
            return Err(Error::Configuration(format!(
                "{} requires {}, which is not declared",
                resources[i].name(),
                requirement
            )));
        };
        if marks.get(&dep) == Some(&Mark::Visiting) {
            return Err(Error::Configuration(format!(
                "dependency cycle: {} -> {}",
                resources[i].name(),
                requirement
            )));
        }
        visit(dep, resources, index, marks, order)?;
    }

    marks.insert(i, Mark::Done);
    order.push(i);
    Ok(())
}

/// Reverse deploy order, with every `teardown_with_dependents` resource
/// moved right after the last resource that requires it.
pub fn destroy_order(deploy_order: &[Arc<dyn Resource>]) -> Vec<Arc<dyn Resource>> {
    let mut order: Vec<Arc<dyn Resource>> = deploy_order.iter().rev().cloned().collect();
    let movable: Vec<String> = order
        .iter()
        .filter(|r| r.teardown_with_dependents())
        .map(|r| r.name())
        .collect();

    for name in movable {
        let Some(from) = order.iter().position(|r| r.name() == name) else {
            continue;
        };
        let resource = order.remove(from);
        let last_dependent = order
            .iter()
            .rposition(|r| r.requires().iter().any(|req| *req == name));
        match last_dependent {
            Some(at) => order.insert(at + 1, resource),
            None => order.insert(from, resource),
        }
    }
    order
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use stagehand_core::ResourceStatus;
    use stagehand_resources::{Mediator, ResourceKind};

    /// A resource that only carries ordering metadata.
    pub(crate) struct Named {
        name: String,
        requires: Vec<String>,
        teardown_with_dependents: bool,
    }

    pub(crate) fn named(name: &str, requires: &[&str], teardown: bool) -> Arc<dyn Resource> {
        Arc::new(Named {
            name: name.to_string(),
            requires: requires.iter().map(|r| r.to_string()).collect(),
            teardown_with_dependents: teardown,
        })
    }

    #[async_trait]
    impl Resource for Named {
        fn name(&self) -> String {
            self.name.clone()
        }

        fn kind(&self) -> ResourceKind {
            ResourceKind::Storage
        }

        fn description(&self) -> String {
            format!("Create {}", self.name)
        }

        fn requires(&self) -> Vec<String> {
            self.requires.clone()
        }

        fn teardown_with_dependents(&self) -> bool {
            self.teardown_with_dependents
        }

        async fn status(&self) -> Result<ResourceStatus> {
            Ok(ResourceStatus::NoExist)
        }

        async fn create(&self, _mediator: Option<&Mediator>) -> Result<()> {
            Ok(())
        }

        async fn update(&self, _mediator: Option<&Mediator>) -> Result<()> {
            Ok(())
        }

        async fn delete(&self) -> Result<()> {
            Ok(())
        }

        fn state_info(&self) -> Result<Value> {
            Ok(json!({}))
        }

        async fn destroy_targets(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    fn names(resources: &[Arc<dyn Resource>]) -> Vec<String> {
        resources.iter().map(|r| r.name()).collect()
    }

    #[test]
    fn test_topological_sort_keeps_declared_order() {
        let sorted = topological_sort(vec![
            named("cdn", &["container"], false),
            named("storage", &[], false),
            named("container", &["network"], false),
            named("network", &[], true),
        ])
        .unwrap();
        assert_eq!(names(&sorted), ["network", "container", "cdn", "storage"]);
    }

    #[test]
    fn test_unknown_requirement_and_cycle_are_rejected() {
        let unknown = topological_sort(vec![named("container", &["network"], false)]);
        assert!(matches!(unknown, Err(Error::Configuration(msg)) if msg.contains("network")));

        let cycle = topological_sort(vec![
            named("a", &["b"], false),
            named("b", &["a"], false),
        ]);
        assert!(matches!(cycle, Err(Error::Configuration(msg)) if msg.contains("cycle")));
    }

    #[test]
    fn test_destroy_moves_shared_infrastructure_after_dependents() {
        let deploy = vec![
            named("network", &[], true),
            named("db", &[], false),
            named("storage", &[], false),
            named("signing-keys", &[], false),
            named("compute", &["network"], false),
            named("cdn", &["compute", "signing-keys"], false),
        ];
        assert_eq!(
            names(&destroy_order(&deploy)),
            ["cdn", "compute", "network", "signing-keys", "storage", "db"]
        );
    }

    #[test]
    fn test_destroy_order_of_a_full_stage() {
        let deploy = topological_sort(vec![
            named("network", &[], true),
            named("managed-db", &["network"], true),
            named("branched-db", &[], false),
            named("distributed-sql", &[], false),
            named("storage", &[], false),
            named("cdn-keys:web", &[], false),
            named(
                "container",
                &["network", "managed-db", "branched-db", "distributed-sql"],
                false,
            ),
            named("cdn:web", &["container", "cdn-keys:web"], false),
        ])
        .unwrap();
        assert_eq!(
            names(&destroy_order(&deploy)),
            [
                "cdn:web",
                "container",
                "managed-db",
                "network",
                "cdn-keys:web",
                "storage",
                "distributed-sql",
                "branched-db",
            ]
        );
    }

    #[test]
    fn test_teardown_resource_without_dependents_stays() {
        let deploy = vec![named("network", &[], true), named("storage", &[], false)];
        assert_eq!(names(&destroy_order(&deploy)), ["storage", "network"]);
    }
}
