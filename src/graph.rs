//! The explicit task graph: named tasks, their dependency edges, and the
//! validation pass that runs before any transform is invoked.

use std::collections::{BTreeMap, HashMap, HashSet};

use camino::Utf8Path;
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::config::Config;
use crate::error::{ConfigError, GraphError, PipelineError};
use crate::stage::Stage;
use crate::transform::Transforms;

/// A named unit of work: zero or more stages plus dependency edges.
#[derive(Debug)]
pub(crate) struct Task {
    pub name: String,
    /// Tasks that must reach a terminal state before this one may start.
    pub after: Vec<String>,
    /// Glob subscriptions that re-trigger this task in watch mode.
    pub watch: Vec<String>,
    pub stages: Vec<Stage>,
}

/// The validated task graph. Constructed once at startup and handed to the
/// scheduler; there is no ambient registry.
#[derive(Debug)]
pub(crate) struct TaskGraph {
    tasks: BTreeMap<String, Task>,
    dependents: HashMap<String, Vec<String>>,
}

impl TaskGraph {
    /// Build the graph from a parsed configuration, then validate it.
    pub(crate) fn from_config(
        cfg: &Config,
        transforms: &Transforms,
        output_root: &Utf8Path,
    ) -> Result<Self, PipelineError> {
        let mut tasks = BTreeMap::new();

        for (name, tc) in cfg.task.iter() {
            let stages = tc
                .stages
                .iter()
                .map(|stage| Stage::from_config(name, stage.clone()))
                .collect::<Result<Vec<_>, ConfigError>>()?;

            let watch = match &tc.watch {
                Some(globs) => globs.clone(),
                None => stages
                    .iter()
                    .flat_map(Stage::input_globs)
                    .map(str::to_string)
                    .collect(),
            };

            tasks.insert(
                name.clone(),
                Task {
                    name: name.clone(),
                    after: tc.after.clone(),
                    watch,
                    stages,
                },
            );
        }

        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for task in tasks.values() {
            for dep in &task.after {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(task.name.clone());
            }
        }

        let graph = Self { tasks, dependents };
        graph.validate(transforms, output_root)?;
        Ok(graph)
    }

    /// Validate the graph before any work runs: dependency references,
    /// acyclicity, transform names, and the single-writer discipline over
    /// the output tree.
    pub(crate) fn validate(
        &self,
        transforms: &Transforms,
        output_root: &Utf8Path,
    ) -> Result<(), GraphError> {
        if self.tasks.is_empty() {
            return Err(GraphError::Empty);
        }

        for task in self.tasks.values() {
            for dep in &task.after {
                if dep == &task.name {
                    return Err(GraphError::SelfDependency(task.name.clone()));
                }
                if !self.tasks.contains_key(dep) {
                    return Err(GraphError::UnknownDependency {
                        task: task.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }

            for stage in &task.stages {
                if let Some(name) = stage.transform_name()
                    && !transforms.contains(name)
                {
                    return Err(GraphError::UnknownTransform {
                        task: task.name.clone(),
                        transform: name.to_string(),
                    });
                }
            }
        }

        // Edge direction dep -> task; a toposort failure names a task on
        // the cycle.
        let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
        for name in self.tasks.keys() {
            graph.add_node(name.as_str());
        }
        for task in self.tasks.values() {
            for dep in &task.after {
                graph.add_edge(dep.as_str(), task.name.as_str(), ());
            }
        }

        if let Err(cycle) = toposort(&graph, None) {
            return Err(GraphError::Cycle(cycle.node_id().to_string()));
        }

        self.check_single_writer(transforms, output_root)
    }

    /// No output path may have two writing tasks. Planned destinations are
    /// computed from the current source tree; stages within one task run
    /// sequentially and may share paths.
    fn check_single_writer(
        &self,
        transforms: &Transforms,
        output_root: &Utf8Path,
    ) -> Result<(), GraphError> {
        let mut writers: HashMap<camino::Utf8PathBuf, &str> = HashMap::new();

        for task in self.tasks.values() {
            for stage in &task.stages {
                for dest in stage.planned_outputs(output_root, transforms) {
                    match writers.get(&dest) {
                        Some(&other) if other != task.name => {
                            return Err(GraphError::OverlappingOutputs {
                                first: other.to_string(),
                                second: task.name.clone(),
                                path: dest,
                            });
                        }
                        _ => {
                            writers.insert(dest, &task.name);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    pub(crate) fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Task> {
        self.tasks.get(name)
    }

    pub(crate) fn names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    /// Immediate dependents of a task.
    pub(crate) fn dependents_of(&self, name: &str) -> &[String] {
        self.dependents
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The given tasks plus every task they transitively depend on.
    pub(crate) fn with_dependencies(&self, targets: &HashSet<String>) -> HashSet<String> {
        let mut closure = HashSet::new();
        let mut stack: Vec<&str> = targets
            .iter()
            .filter(|name| self.tasks.contains_key(*name))
            .map(String::as_str)
            .collect();

        while let Some(name) = stack.pop() {
            if !closure.insert(name.to_string()) {
                continue;
            }
            if let Some(task) = self.tasks.get(name) {
                stack.extend(task.after.iter().map(String::as_str));
            }
        }

        closure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn graph_from(toml: &str) -> Result<TaskGraph, PipelineError> {
        let cfg: Config = toml::from_str(toml).unwrap();
        TaskGraph::from_config(&cfg, &Transforms::none(), Utf8Path::new("build"))
    }

    #[test]
    fn test_empty_graph_rejected() {
        let err = graph_from("").unwrap_err();
        assert!(matches!(err, PipelineError::Graph(GraphError::Empty)));
    }

    #[test]
    fn test_cycle_detected_and_named() {
        let err = graph_from(
            r#"
            [task.a]
            after = ["c"]
            [task.b]
            after = ["a"]
            [task.c]
            after = ["b"]
            "#,
        )
        .unwrap_err();

        match err {
            PipelineError::Graph(GraphError::Cycle(name)) => {
                assert!(["a", "b", "c"].contains(&name.as_str()));
            }
            other => panic!("expected a cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let err = graph_from(
            r#"
            [task.scripts]
            after = ["bundels"]
            "#,
        )
        .unwrap_err();

        match err {
            PipelineError::Graph(GraphError::UnknownDependency { task, dependency }) => {
                assert_eq!(task, "scripts");
                assert_eq!(dependency, "bundels");
            }
            other => panic!("expected an unknown dependency error, got {other:?}"),
        }
    }

    #[test]
    fn test_self_dependency_rejected() {
        let err = graph_from(
            r#"
            [task.a]
            after = ["a"]
            "#,
        )
        .unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Graph(GraphError::SelfDependency(name)) if name == "a"
        ));
    }

    #[test]
    fn test_unknown_transform_rejected() {
        let err = graph_from(
            r#"
            [task.styles]
            [[task.styles.stage]]
            kind = "compile"
            transform = "stylus"
            input = "source/css/*.styl"
            output = "css"
            "#,
        )
        .unwrap_err();

        match err {
            PipelineError::Graph(GraphError::UnknownTransform { transform, .. }) => {
                assert_eq!(transform, "stylus");
            }
            other => panic!("expected an unknown transform error, got {other:?}"),
        }
    }

    #[test]
    fn test_acyclic_graph_passes() {
        let graph = graph_from(
            r#"
            [task.styles]
            [task.scripts]
            [task.archive]
            after = ["styles", "scripts"]
            "#,
        )
        .unwrap();

        assert_eq!(graph.names().count(), 3);
        assert_eq!(graph.dependents_of("styles"), &["archive".to_string()]);
    }

    #[test]
    fn test_overlapping_bundle_outputs_rejected() {
        let err = graph_from(
            r#"
            [task.scripts]
            [[task.scripts.stage]]
            kind = "bundle"
            inputs = ["src/js/*.js"]
            output = "js/main.js"

            [task.vendor]
            [[task.vendor.stage]]
            kind = "bundle"
            inputs = ["src/vendor/*.js"]
            output = "js/main.js"
            "#,
        )
        .unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Graph(GraphError::OverlappingOutputs { .. })
        ));
    }

    #[test]
    fn test_with_dependencies_closure() {
        let graph = graph_from(
            r#"
            [task.a]
            [task.b]
            after = ["a"]
            [task.c]
            after = ["b"]
            [task.d]
            "#,
        )
        .unwrap();

        let targets = HashSet::from(["c".to_string()]);
        let closure = graph.with_dependencies(&targets);

        assert_eq!(
            closure,
            HashSet::from(["a".to_string(), "b".to_string(), "c".to_string()])
        );
    }

    #[test]
    fn test_derived_watch_globs_from_stage_inputs() {
        let graph = graph_from(
            r#"
            [task.data]
            [[task.data.stage]]
            kind = "copy"
            input = "source/data/**/*"
            output = "data"
            "#,
        )
        .unwrap();

        let task = graph.get("data").unwrap();
        assert_eq!(task.watch, vec!["source/data/**/*".to_string()]);
    }
}
