//! Declarative pipeline configuration.
//!
//! A deployment is described by a single TOML file:
//!
//! ```toml
//! [pipeline]
//! source_root = "source"
//! output_root = "build"
//! debounce_ms = 100
//!
//! [task.styles]
//! watch = ["source/css/**/*.scss"]
//!
//! [[task.styles.stage]]
//! kind = "compile"
//! transform = "scss"
//! input = "source/css/[!_]*.scss"
//! output = "css"
//! ```
//!
//! Parsing is strict: unrecognized keys anywhere in the file are rejected
//! at startup, and stage options are re-validated per stage kind before the
//! graph is built.

use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::error::ConfigError;

/// Top-level configuration as read from a TOML file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Global settings from `[pipeline]`.
    #[serde(default)]
    pub pipeline: PipelineSection,

    /// All tasks from `[task.<name>]`, keyed by task name.
    #[serde(default)]
    pub task: BTreeMap<String, TaskConfig>,
}

impl Config {
    /// Read and parse a configuration file.
    pub fn load(path: impl AsRef<Utf8Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;

        toml::from_str(&text).map_err(|e| ConfigError::Parse(path.to_path_buf(), Box::new(e)))
    }
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineSection {
    /// Root directory holding source assets; watch roots resolve below it.
    #[serde(default = "default_source_root")]
    pub source_root: Utf8PathBuf,

    /// Root directory receiving built artifacts. Cleared on a full build.
    #[serde(default = "default_output_root")]
    pub output_root: Utf8PathBuf,

    /// Directory holding freshness records and cached transform results.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: Utf8PathBuf,

    /// Worker pool size; 0 picks the rayon default.
    #[serde(default)]
    pub concurrency: usize,

    /// Coalescing window for filesystem events, in milliseconds.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Use content hashes instead of modification times for staleness.
    #[serde(default)]
    pub use_hash: bool,

    /// Port for the static dev server.
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_source_root() -> Utf8PathBuf {
    Utf8PathBuf::from("source")
}

fn default_output_root() -> Utf8PathBuf {
    Utf8PathBuf::from("build")
}

fn default_cache_dir() -> Utf8PathBuf {
    Utf8PathBuf::from(".cache")
}

fn default_debounce_ms() -> u64 {
    100
}

fn default_port() -> u16 {
    8080
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            source_root: default_source_root(),
            output_root: default_output_root(),
            cache_dir: default_cache_dir(),
            concurrency: 0,
            debounce_ms: default_debounce_ms(),
            use_hash: false,
            port: default_port(),
        }
    }
}

/// `[task.<name>]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskConfig {
    /// Dependency list: this task waits for all tasks listed here.
    #[serde(default)]
    pub after: Vec<String>,

    /// Glob subscriptions that re-trigger this task in watch mode.
    ///
    /// If absent, the union of the task's stage input globs is used.
    #[serde(default)]
    pub watch: Option<Vec<String>>,

    /// Ordered stages from `[[task.<name>.stage]]`.
    #[serde(default, rename = "stage")]
    pub stages: Vec<StageConfig>,
}

/// The kind of work a stage performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    /// One input, one output, format conversion with an extension rewrite.
    Compile,
    /// One input, one output, size reduction keeping the format.
    Optimize,
    /// Many inputs concatenated into one output, declared order preserved.
    Bundle,
    /// One input, one output, byte-identical passthrough.
    Copy,
    /// Many inputs collected into one tar archive.
    Archive,
}

impl StageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Compile => "compile",
            StageKind::Optimize => "optimize",
            StageKind::Bundle => "bundle",
            StageKind::Copy => "copy",
            StageKind::Archive => "archive",
        }
    }
}

/// One `[[task.<name>.stage]]` table, before per-kind validation.
///
/// All option fields are optional here; which of them are accepted is
/// decided by the stage kind when the config is turned into a
/// [`crate::stage::Stage`]. Supplying an option a kind doesn't recognize is
/// a startup error, same as an unknown key.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    pub kind: StageKind,

    /// Registered transform name, for `compile` and `optimize` stages.
    #[serde(default)]
    pub transform: Option<String>,

    /// Input glob, relative to the project root.
    #[serde(default)]
    pub input: Option<String>,

    /// Ordered input globs, for `bundle` stages.
    #[serde(default)]
    pub inputs: Option<Vec<String>>,

    /// Output location: a directory below the output root for one-to-one
    /// kinds, a file path below the output root for `bundle`, a
    /// project-root-relative file path for `archive`.
    pub output: Utf8PathBuf,

    /// `compile`: emit human-readable output instead of compressed.
    #[serde(default)]
    pub pretty_print: Option<bool>,

    /// `compile`: browser targets forwarded to the transform.
    #[serde(default)]
    pub browser_targets: Option<Vec<String>>,

    /// `optimize`: effort level, 0 through 9.
    #[serde(default)]
    pub compression_level: Option<u32>,

    /// `optimize`: request progressive encoding where the format allows it.
    #[serde(default)]
    pub progressive: Option<bool>,

    /// `bundle`: separator inserted between concatenated inputs.
    #[serde(default)]
    pub separator: Option<String>,
}
