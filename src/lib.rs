#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod cli;
mod config;
mod error;
mod fresh;
mod graph;
mod hash;
mod io;
pub mod logging;
mod scheduler;
mod stage;
pub mod transform;
#[cfg(feature = "live")]
mod watch;

use std::collections::HashSet;
use std::sync::Mutex;

use camino::Utf8PathBuf;
use console::style;

pub use crate::config::{Config, PipelineSection, StageConfig, StageKind, TaskConfig};
pub use crate::error::*;
pub use crate::scheduler::{BuildReport, ReloadScope, TaskReport, TaskStatus};
pub use crate::stage::{Artifact, ArtifactKind, FileOutcome};
pub use crate::transform::{
    CompileOptions, OptimizeOptions, StageOptions, Transform, TransformJob, Transforms,
};
#[cfg(feature = "live")]
pub use crate::watch::live_reload_script;

use crate::fresh::FreshnessTracker;
use crate::graph::TaskGraph;
use crate::scheduler::BuildCtx;

/// A validated asset pipeline, ready to build, watch or clean.
///
/// Constructed once at startup from a [`Config`] and a [`Transforms`]
/// registry; there is no ambient task registry. Tasks live for the process
/// lifetime and are re-run in place across build generations.
pub struct Pipeline {
    pub(crate) graph: TaskGraph,
    pub(crate) transforms: Transforms,
    pub(crate) tracker: Mutex<FreshnessTracker>,
    pub(crate) source_root: Utf8PathBuf,
    pub(crate) output_root: Utf8PathBuf,
    pub(crate) cache_dir: Utf8PathBuf,
    pub(crate) pool: rayon::ThreadPool,
    pub(crate) debounce_ms: u64,
    pub(crate) port: u16,
    pub(crate) ws_port: Option<u16>,
    /// Tasks that succeeded in the current build generation; their
    /// dependents may skip them on affected re-runs.
    succeeded: HashSet<String>,
}

impl Pipeline {
    /// Validate the configuration and assemble the pipeline. Fails fast on
    /// any graph defect before a single transform runs.
    pub fn from_config(config: Config, transforms: Transforms) -> Result<Self, PipelineError> {
        let output_root = config.pipeline.output_root.clone();
        let graph = TaskGraph::from_config(&config, &transforms, &output_root)?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.pipeline.concurrency)
            .build()?;

        let cache_dir = config.pipeline.cache_dir.clone();
        let tracker = FreshnessTracker::load(&cache_dir.join("fresh.cbor"), config.pipeline.use_hash);

        Ok(Self {
            graph,
            transforms,
            tracker: Mutex::new(tracker),
            source_root: config.pipeline.source_root.clone(),
            output_root,
            cache_dir,
            pool,
            debounce_ms: config.pipeline.debounce_ms,
            port: config.pipeline.port,
            ws_port: None,
            succeeded: HashSet::new(),
        })
    }

    /// Run the full task graph once, clearing the output root first so
    /// artifacts of removed sources cannot linger.
    pub fn build(&mut self) -> Result<BuildReport, PipelineError> {
        io::clean_output(&self.output_root).map_err(PipelineError::Clean)?;

        let report = scheduler::run_all(&self.ctx());
        self.absorb(&report);
        Ok(report)
    }

    /// Build once, then watch the sources, serve the output directory and
    /// push reload notifications to connected clients. Never exits on task
    /// failure; a broken build is reported and the loop keeps waiting.
    #[cfg(feature = "live")]
    pub fn watch(&mut self) -> Result<(), PipelineError> {
        eprintln!(
            "Running {} in {} mode.",
            style("bellows").red(),
            style("watch").blue()
        );

        watch::watch(self)
    }

    /// Remove the output root and the on-disk caches.
    pub fn clean(&self) -> Result<(), PipelineError> {
        io::clean_output(&self.output_root).map_err(PipelineError::Clean)?;
        io::clean_cache(&self.cache_dir).map_err(PipelineError::Clean)?;
        Ok(())
    }

    /// The port of the live reload socket, once watch mode reserved one.
    pub fn ws_port(&self) -> Option<u16> {
        self.ws_port
    }

    /// Re-run the given tasks and their not-yet-satisfied dependencies.
    pub(crate) fn rebuild(&mut self, targets: &HashSet<String>) -> BuildReport {
        let report = scheduler::run_affected(&self.ctx(), targets, &self.succeeded);
        self.absorb(&report);
        report
    }

    fn ctx(&self) -> BuildCtx<'_> {
        BuildCtx {
            graph: &self.graph,
            transforms: &self.transforms,
            tracker: &self.tracker,
            output_root: &self.output_root,
            cache_dir: &self.cache_dir,
            pool: &self.pool,
        }
    }

    fn absorb(&mut self, report: &BuildReport) {
        for task in &report.tasks {
            if task.status.is_success() {
                self.succeeded.insert(task.name.clone());
            } else {
                self.succeeded.remove(&task.name);
            }
        }

        let cache = self.cache_dir.join("fresh.cbor");
        if let Err(e) = self.tracker.lock().unwrap().store(&cache) {
            tracing::debug!("couldn't persist freshness records: {e}");
        }
    }
}

/// Entry point used by the binary: dispatch a parsed command line.
///
/// Returns whether every task succeeded; configuration and graph defects
/// surface as errors instead.
pub fn run(args: cli::CliArgs) -> Result<bool, PipelineError> {
    let config = Config::load(&args.config)?;

    match args.command {
        cli::Command::Build => {
            eprintln!(
                "Running {} in {} mode.",
                style("bellows").red(),
                style("build").blue()
            );

            let mut pipeline = Pipeline::from_config(config, Transforms::builtin())?;
            let report = pipeline.build()?;
            report.print_summary();
            Ok(report.success())
        }
        #[cfg(feature = "live")]
        cli::Command::Watch | cli::Command::Serve => {
            let mut pipeline = Pipeline::from_config(config, Transforms::builtin())?;
            pipeline.watch()?;
            Ok(true)
        }
        cli::Command::Clean => {
            let pipeline = Pipeline::from_config(config, Transforms::builtin())?;
            pipeline.clean()?;
            eprintln!("Removed '{}' and the caches.", pipeline.output_root);
            Ok(true)
        }
    }
}
