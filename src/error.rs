use camino::Utf8PathBuf;
use thiserror::Error;

/// Fatal problems with the pipeline configuration file itself.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read config file '{0}':\n{1}")]
    Read(Utf8PathBuf, std::io::Error),

    #[error("Couldn't parse config file '{0}':\n{1}")]
    Parse(Utf8PathBuf, Box<toml::de::Error>),

    #[error("Task '{task}': {reason}")]
    Stage { task: String, reason: String },
}

/// Structural defects in the task graph, detected before any work runs.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Cycle detected in the task graph involving task '{0}'")]
    Cycle(String),

    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("Task '{0}' cannot depend on itself")]
    SelfDependency(String),

    #[error("Task '{task}' references unknown transform '{transform}'")]
    UnknownTransform { task: String, transform: String },

    #[error("Tasks '{first}' and '{second}' both write under '{path}'")]
    OverlappingOutputs {
        first: String,
        second: String,
        path: Utf8PathBuf,
    },

    #[error("The pipeline defines no tasks")]
    Empty,
}

/// A single source file failed to transform. Stays local to the stage;
/// sibling files keep processing.
#[derive(Debug, Error)]
#[error("'{source_path}': {cause}")]
pub struct TransformError {
    pub source_path: Utf8PathBuf,
    #[source]
    pub cause: anyhow::Error,
}

/// Failures that abort an entire stage rather than a single file.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Couldn't compile glob pattern.\n{0}")]
    Pattern(#[from] glob::PatternError),

    #[error("Couldn't enumerate sources.\n{0}")]
    Glob(#[from] glob::GlobError),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Why a task ended up `Failed`.
#[derive(Debug)]
pub enum FailCause {
    /// One or more files failed their transform; the rest were processed.
    Transform(usize),
    /// A structural failure aborted one of the task's stages.
    Stage(StageError),
    /// A dependency failed, so this task never ran.
    Upstream(String),
}

impl std::fmt::Display for FailCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailCause::Transform(n) => write!(f, "{n} file(s) failed to transform"),
            FailCause::Stage(e) => write!(f, "stage aborted: {e}"),
            FailCause::Upstream(task) => write!(f, "upstream task '{task}' failed"),
        }
    }
}

#[cfg(feature = "live")]
#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Couldn't compile watch subscription.\n{0}")]
    Pattern(#[from] globset::Error),

    #[error(transparent)]
    Notify(#[from] notify::Error),

    #[error("Couldn't bind the reload socket.\n{0}")]
    Bind(std::io::Error),
}

/// Top-level error for the pipeline entry points.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Error while clearing the output directory:\n{0}")]
    Clean(std::io::Error),

    #[error("Failed to build the worker pool.\n{0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[cfg(feature = "live")]
    #[error("Error while watching for file changes:\n{0}")]
    Watch(#[from] WatchError),
}
