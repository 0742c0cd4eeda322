//! Parallel execution of the task graph.
//!
//! The scheduler performs a dependency-counted topological dispatch: a pool
//! of workers is seeded with every task whose dependencies are already
//! satisfied, and each completion unlocks its dependents. A failed task
//! marks all transitively dependent tasks in the run as failed upstream
//! without running them; siblings are unaffected.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use camino::Utf8Path;
use console::style;
use crossbeam_channel::unbounded;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::error::FailCause;
use crate::fresh::FreshnessTracker;
use crate::graph::{Task, TaskGraph};
use crate::io::human_size;
use crate::stage::{Artifact, ArtifactKind, FileOutcome, StageContext};
use crate::transform::Transforms;

/// Terminal state of one task in a build generation.
#[derive(Debug)]
pub enum TaskStatus {
    Succeeded,
    Failed(FailCause),
}

impl TaskStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Succeeded)
    }
}

/// What one task did during a build generation.
#[derive(Debug)]
pub struct TaskReport {
    pub name: String,
    pub status: TaskStatus,
    /// Per-source results, successes and failures alike.
    pub files: Vec<FileOutcome>,
    /// Artifacts written during this generation; fresh skips write none.
    pub artifacts: Vec<Artifact>,
    /// Transform invocations actually performed.
    pub invoked: usize,
    pub duration: Duration,
}

impl TaskReport {
    fn upstream(name: String, failed_dependency: String) -> Self {
        Self {
            name,
            status: TaskStatus::Failed(FailCause::Upstream(failed_dependency)),
            files: Vec::new(),
            artifacts: Vec::new(),
            invoked: 0,
            duration: Duration::ZERO,
        }
    }
}

/// Which kind of browser refresh a finished build calls for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadScope {
    /// Only stylesheets changed; styles can be swapped in place.
    Style,
    /// Anything else, or a mixed change set.
    Full,
}

/// The outcome of one `run_all` / `run_affected` generation.
#[derive(Debug)]
pub struct BuildReport {
    pub tasks: Vec<TaskReport>,
    pub duration: Duration,
}

impl BuildReport {
    pub fn success(&self) -> bool {
        self.tasks.iter().all(|t| t.status.is_success())
    }

    pub(crate) fn succeeded_names(&self) -> impl Iterator<Item = &str> {
        self.tasks
            .iter()
            .filter(|t| t.status.is_success())
            .map(|t| t.name.as_str())
    }

    /// Reload scope for the artifacts this generation wrote. A change set
    /// consisting solely of stylesheets allows in-place style injection;
    /// everything else is a full reload.
    pub fn reload_scope(&self) -> ReloadScope {
        let mut artifacts = self
            .tasks
            .iter()
            .flat_map(|t| t.artifacts.iter())
            .peekable();

        if artifacts.peek().is_none() {
            return ReloadScope::Full;
        }

        if artifacts.all(|a| a.kind == ArtifactKind::Style) {
            ReloadScope::Style
        } else {
            ReloadScope::Full
        }
    }

    /// Per-task summary in the style of the original build logs.
    pub fn print_summary(&self) {
        for task in &self.tasks {
            let size: u64 = task.artifacts.iter().map(|a| a.size).sum();

            match &task.status {
                TaskStatus::Succeeded => {
                    let detail = if task.artifacts.is_empty() {
                        "up to date".to_string()
                    } else {
                        format!(
                            "{} file(s), {}",
                            task.artifacts.len(),
                            human_size(size)
                        )
                    };
                    eprintln!(
                        "  {} {:<16} {} ({:.1?})",
                        style("✓").green(),
                        task.name,
                        detail,
                        task.duration
                    );
                }
                TaskStatus::Failed(FailCause::Upstream(dep)) => {
                    eprintln!(
                        "  {} {:<16} skipped, upstream '{}' failed",
                        style("↷").yellow(),
                        task.name,
                        dep
                    );
                }
                TaskStatus::Failed(cause) => {
                    eprintln!(
                        "  {} {:<16} {}",
                        style("✗").red(),
                        task.name,
                        cause
                    );
                    for file in task.files.iter().filter(|f| f.error.is_some()) {
                        if let Some(error) = &file.error {
                            eprintln!("      {error}");
                        }
                    }
                }
            }
        }

        eprintln!("Finished in {:.1?}", self.duration);
    }
}

/// Everything a build generation needs, borrowed from the pipeline.
pub(crate) struct BuildCtx<'a> {
    pub graph: &'a TaskGraph,
    pub transforms: &'a Transforms,
    pub tracker: &'a Mutex<FreshnessTracker>,
    pub output_root: &'a Utf8Path,
    pub cache_dir: &'a Utf8Path,
    pub pool: &'a rayon::ThreadPool,
}

/// Execute every task in the graph.
pub(crate) fn run_all(ctx: &BuildCtx<'_>) -> BuildReport {
    let run: HashSet<String> = ctx.graph.names().map(str::to_string).collect();
    run_set(ctx, &run, &HashSet::new())
}

/// Execute the named tasks plus their transitive dependencies, skipping
/// dependencies that already succeeded in the current build generation.
/// The named tasks themselves always run, with freshness checks bypassed.
pub(crate) fn run_affected(
    ctx: &BuildCtx<'_>,
    targets: &HashSet<String>,
    satisfied: &HashSet<String>,
) -> BuildReport {
    let mut run = ctx.graph.with_dependencies(targets);
    run.retain(|name| targets.contains(name) || !satisfied.contains(name));

    run_set(ctx, &run, targets)
}

fn run_set(ctx: &BuildCtx<'_>, run: &HashSet<String>, forced: &HashSet<String>) -> BuildReport {
    let started = Instant::now();
    let total = run.len();
    let mut reports = Vec::with_capacity(total);

    if total == 0 {
        return BuildReport {
            tasks: reports,
            duration: started.elapsed(),
        };
    }

    // Dependency counts within the run set; tasks outside it are treated
    // as satisfied, which `run_affected` guarantees.
    let mut counts: HashMap<&str, usize> = run
        .iter()
        .map(|name| {
            let task = ctx.graph.get(name).expect("run set built from the graph");
            let count = task
                .after
                .iter()
                .filter(|dep| run.contains(*dep))
                .count();
            (name.as_str(), count)
        })
        .collect();

    let mp = MultiProgress::new();
    let main_pb = mp.add(ProgressBar::new(total as u64));
    main_pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .expect("invalid progress bar template")
            .progress_chars("#>-"),
    );

    let spinner_style = ProgressStyle::default_spinner()
        .template("{spinner:.blue} {msg}")
        .expect("invalid progress bar template");

    let (result_tx, result_rx) = unbounded::<TaskReport>();

    // Terminal states, used to avoid double-marking upstream failures.
    let mut done: HashSet<&str> = HashSet::new();

    // The orchestration loop stays on the calling thread; only the task
    // bodies run on the bounded pool.
    ctx.pool.in_place_scope(|s| {
        let spawn_task = |name: &str| {
            let task = ctx.graph.get(name).expect("run set built from the graph");
            let force = forced.contains(name);
            let sender = result_tx.clone();
            let mp = mp.clone();
            let style = spinner_style.clone();

            s.spawn(move |_| {
                let pb = mp.add(ProgressBar::new_spinner());
                pb.set_style(style);
                pb.set_message(task.name.clone());
                pb.enable_steady_tick(Duration::from_millis(100));

                let report = run_task(ctx, task, force);

                pb.finish_and_clear();
                sender.send(report).expect("scheduler loop dropped the receiver");
            });
        };

        for name in run {
            if counts[name.as_str()] == 0 {
                spawn_task(name);
            }
        }

        let mut completed = 0;
        while completed < total {
            let report = result_rx.recv().expect("worker dropped the channel");
            completed += 1;
            main_pb.inc(1);

            let name = ctx
                .graph
                .get(&report.name)
                .map(|t| t.name.as_str())
                .expect("report for an unknown task");
            done.insert(name);

            let succeeded = report.status.is_success();
            let failed_name = report.name.clone();
            reports.push(report);

            if succeeded {
                for dependent in ctx.graph.dependents_of(name) {
                    // A dependent may already be terminal through another
                    // failed dependency.
                    if !run.contains(dependent) || done.contains(dependent.as_str()) {
                        continue;
                    }
                    if let Some(count) = counts.get_mut(dependent.as_str()) {
                        *count -= 1;
                        if *count == 0 {
                            spawn_task(dependent);
                        }
                    }
                }
            } else {
                // Fail every transitively dependent task in this run
                // without running it.
                let mut stack: Vec<&str> = ctx
                    .graph
                    .dependents_of(name)
                    .iter()
                    .map(String::as_str)
                    .collect();

                while let Some(dependent) = stack.pop() {
                    if !run.contains(dependent) || done.contains(dependent) {
                        continue;
                    }

                    let dependent = ctx
                        .graph
                        .get(dependent)
                        .map(|t| t.name.as_str())
                        .expect("dependent missing from the graph");
                    done.insert(dependent);
                    completed += 1;
                    main_pb.inc(1);

                    reports.push(TaskReport::upstream(
                        dependent.to_string(),
                        failed_name.clone(),
                    ));

                    stack.extend(
                        ctx.graph
                            .dependents_of(dependent)
                            .iter()
                            .map(String::as_str),
                    );
                }
            }
        }
    });

    main_pb.finish_and_clear();

    BuildReport {
        tasks: reports,
        duration: started.elapsed(),
    }
}

fn run_task(ctx: &BuildCtx<'_>, task: &Task, force: bool) -> TaskReport {
    let started = Instant::now();

    let mut files = Vec::new();
    let mut artifacts = Vec::new();
    let mut invoked = 0;
    let mut structural = None;

    let stage_ctx = StageContext {
        output_root: ctx.output_root,
        cache_dir: ctx.cache_dir,
        transforms: ctx.transforms,
        tracker: ctx.tracker,
        force,
    };

    for stage in &task.stages {
        match stage.run(&stage_ctx) {
            Ok(outcome) => {
                files.extend(outcome.files);
                artifacts.extend(outcome.artifacts);
                invoked += outcome.invoked;
            }
            Err(e) => {
                tracing::error!("task '{}' aborted: {e}", task.name);
                structural = Some(e);
                break;
            }
        }
    }

    let status = match structural {
        Some(e) => TaskStatus::Failed(FailCause::Stage(e)),
        None => {
            let failed = files.iter().filter(|f| f.error.is_some()).count();
            if failed > 0 {
                TaskStatus::Failed(FailCause::Transform(failed))
            } else {
                TaskStatus::Succeeded
            }
        }
    };

    TaskReport {
        name: task.name.clone(),
        status,
        files,
        artifacts,
        invoked,
        duration: started.elapsed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use camino::Utf8PathBuf;

    use crate::config::Config;
    use crate::transform::{Transform, TransformJob};

    /// Counts invocations; fails when constructed with `fail = true`.
    struct Probe {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl Transform for Probe {
        fn rewrite_ext(&self) -> Option<&'static str> {
            Some("out")
        }

        fn apply(&self, job: TransformJob<'_>) -> anyhow::Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("refused");
            }
            Ok(job.data.to_vec())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        root: Utf8PathBuf,
        graph: TaskGraph,
        transforms: Transforms,
        calls: Arc<AtomicUsize>,
        fail_calls: Arc<AtomicUsize>,
    }

    impl Fixture {
        fn new(config: &str) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();

            fs::create_dir_all(root.join("src")).unwrap();
            fs::write(root.join("src/a.txt"), "alpha").unwrap();
            fs::write(root.join("src/b.txt"), "beta").unwrap();

            let calls = Arc::new(AtomicUsize::new(0));
            let fail_calls = Arc::new(AtomicUsize::new(0));

            let mut transforms = Transforms::none();
            transforms.register(
                "probe",
                Probe {
                    calls: calls.clone(),
                    fail: false,
                },
            );
            transforms.register(
                "broken",
                Probe {
                    calls: fail_calls.clone(),
                    fail: true,
                },
            );

            let config = config.replace("{root}", root.as_str());
            let cfg: Config = toml::from_str(&config).unwrap();
            let graph =
                TaskGraph::from_config(&cfg, &transforms, &root.join("build")).unwrap();

            Self {
                _dir: dir,
                root,
                graph,
                transforms,
                calls,
                fail_calls,
            }
        }

        fn run_all(&self, tracker: &Mutex<FreshnessTracker>) -> BuildReport {
            let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
            let output_root = self.root.join("build");
            let cache_dir = self.root.join(".cache");
            let ctx = BuildCtx {
                graph: &self.graph,
                transforms: &self.transforms,
                tracker,
                output_root: &output_root,
                cache_dir: &cache_dir,
                pool: &pool,
            };
            run_all(&ctx)
        }
    }

    #[test]
    fn test_independent_tasks_both_run() {
        let fixture = Fixture::new(
            r#"
            [task.first]
            [[task.first.stage]]
            kind = "copy"
            input = "{root}/src/a.txt"
            output = "one"

            [task.second]
            [[task.second.stage]]
            kind = "copy"
            input = "{root}/src/b.txt"
            output = "two"
            "#,
        );

        let tracker = Mutex::new(FreshnessTracker::new(true));
        let report = fixture.run_all(&tracker);

        assert!(report.success());
        assert!(fixture.root.join("build/one/a.txt").is_file());
        assert!(fixture.root.join("build/two/b.txt").is_file());
    }

    #[test]
    fn test_upstream_failure_skips_dependents() {
        let fixture = Fixture::new(
            r#"
            [task.bad]
            [[task.bad.stage]]
            kind = "compile"
            transform = "broken"
            input = "{root}/src/*.txt"
            output = "bad"

            [task.mid]
            after = ["bad"]
            [[task.mid.stage]]
            kind = "compile"
            transform = "probe"
            input = "{root}/src/a.txt"
            output = "mid"

            [task.leaf]
            after = ["mid"]

            [task.bystander]
            [[task.bystander.stage]]
            kind = "copy"
            input = "{root}/src/b.txt"
            output = "aside"
            "#,
        );

        let tracker = Mutex::new(FreshnessTracker::new(true));
        let report = fixture.run_all(&tracker);

        assert!(!report.success());
        assert_eq!(report.tasks.len(), 4);

        let by_name: HashMap<&str, &TaskReport> = report
            .tasks
            .iter()
            .map(|t| (t.name.as_str(), t))
            .collect();

        assert!(matches!(
            by_name["bad"].status,
            TaskStatus::Failed(FailCause::Transform(2))
        ));
        assert!(matches!(
            by_name["mid"].status,
            TaskStatus::Failed(FailCause::Upstream(ref dep)) if dep == "bad"
        ));
        assert!(matches!(
            by_name["leaf"].status,
            TaskStatus::Failed(FailCause::Upstream(_))
        ));
        assert!(by_name["bystander"].status.is_success());

        // Dependents never invoked their transform.
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 0);
        assert_eq!(by_name["mid"].invoked, 0);
    }

    #[test]
    fn test_rerun_invokes_nothing_when_fresh() {
        let fixture = Fixture::new(
            r#"
            [task.compile]
            [[task.compile.stage]]
            kind = "compile"
            transform = "probe"
            input = "{root}/src/*.txt"
            output = "out"
            "#,
        );

        let tracker = Mutex::new(FreshnessTracker::new(true));

        let first = fixture.run_all(&tracker);
        assert!(first.success());
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 2);

        let second = fixture.run_all(&tracker);
        assert!(second.success());
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 2);
        assert!(second.tasks[0].artifacts.is_empty());
    }

    #[test]
    fn test_run_affected_skips_satisfied_dependencies() {
        let fixture = Fixture::new(
            r#"
            [task.base]
            [[task.base.stage]]
            kind = "copy"
            input = "{root}/src/a.txt"
            output = "base"

            [task.styles]
            after = ["base"]
            [[task.styles.stage]]
            kind = "copy"
            input = "{root}/src/b.txt"
            output = "styles"
            "#,
        );

        let tracker = Mutex::new(FreshnessTracker::new(true));
        let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
        let output_root = fixture.root.join("build");
        let cache_dir = fixture.root.join(".cache");
        let ctx = BuildCtx {
            graph: &fixture.graph,
            transforms: &fixture.transforms,
            tracker: &tracker,
            output_root: &output_root,
            cache_dir: &cache_dir,
            pool: &pool,
        };

        let first = run_all(&ctx);
        let satisfied: HashSet<String> =
            first.succeeded_names().map(str::to_string).collect();

        let targets = HashSet::from(["styles".to_string()]);
        let report = run_affected(&ctx, &targets, &satisfied);

        let names: Vec<&str> = report.tasks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["styles"]);
    }

    #[test]
    fn test_reload_scope_style_only() {
        let report = BuildReport {
            tasks: vec![TaskReport {
                name: "styles".to_string(),
                status: TaskStatus::Succeeded,
                files: Vec::new(),
                artifacts: vec![Artifact {
                    path: Utf8PathBuf::from("build/css/master.css"),
                    kind: ArtifactKind::Style,
                    size: 10,
                }],
                invoked: 1,
                duration: Duration::ZERO,
            }],
            duration: Duration::ZERO,
        };

        assert_eq!(report.reload_scope(), ReloadScope::Style);
    }

    #[test]
    fn test_reload_scope_mixed_is_full() {
        let report = BuildReport {
            tasks: vec![TaskReport {
                name: "site".to_string(),
                status: TaskStatus::Succeeded,
                files: Vec::new(),
                artifacts: vec![
                    Artifact {
                        path: Utf8PathBuf::from("build/css/master.css"),
                        kind: ArtifactKind::Style,
                        size: 10,
                    },
                    Artifact {
                        path: Utf8PathBuf::from("build/index.html"),
                        kind: ArtifactKind::Markup,
                        size: 20,
                    },
                ],
                invoked: 2,
                duration: Duration::ZERO,
            }],
            duration: Duration::ZERO,
        };

        assert_eq!(report.reload_scope(), ReloadScope::Full);
    }
}
