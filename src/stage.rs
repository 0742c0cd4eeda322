//! Transform stages: the typed units of work a task is composed of.
//!
//! A stage owns an input pattern, an output location and validated
//! options. Running a stage enumerates its inputs, drops the ones whose
//! outputs are still fresh, pushes the rest through its transform, and
//! writes artifacts under the output root, creating directories as needed.
//!
//! Compile and optimize results are kept in a content-addressed cache
//! under `.cache/`, keyed by the source bytes and the stage fingerprint.
//! A cache hit restores the artifact without invoking the transform, so a
//! clean build over unchanged sources costs only file copies.

use std::fs;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};

use crate::config::{StageConfig, StageKind};
use crate::error::{ConfigError, StageError, TransformError};
use crate::fresh::FreshnessTracker;
use crate::hash::Hash32;
use crate::io::write_artifact;
use crate::transform::{
    CompileOptions, OptimizeOptions, StageOptions, TransformJob, Transforms,
};

/// Classification of a built artifact, used to scope reload notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Style,
    Markup,
    Script,
    Image,
    Data,
    Other,
}

impl ArtifactKind {
    pub(crate) fn from_path(path: &Utf8Path) -> Self {
        match path.extension() {
            Some("css") => ArtifactKind::Style,
            Some("html" | "htm") => ArtifactKind::Markup,
            Some("js" | "mjs") => ArtifactKind::Script,
            Some("png" | "jpg" | "jpeg" | "gif" | "webp" | "svg" | "avif") => ArtifactKind::Image,
            Some("json" | "yaml" | "csv") => ArtifactKind::Data,
            _ => ArtifactKind::Other,
        }
    }
}

/// One output file produced by a stage run.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub path: Utf8PathBuf,
    pub kind: ArtifactKind,
    pub size: u64,
}

impl Artifact {
    fn new(path: Utf8PathBuf, size: u64) -> Self {
        Self {
            kind: ArtifactKind::from_path(&path),
            path,
            size,
        }
    }
}

/// Per-source result of a stage run.
#[derive(Debug)]
pub struct FileOutcome {
    pub source: Utf8PathBuf,
    pub error: Option<TransformError>,
}

/// Everything a single stage run produced.
#[derive(Debug, Default)]
pub(crate) struct StageOutcome {
    pub files: Vec<FileOutcome>,
    pub artifacts: Vec<Artifact>,
    /// Number of transform invocations actually performed, cache hits and
    /// fresh skips excluded.
    pub invoked: usize,
}

impl StageOutcome {
    fn ok(&mut self, source: Utf8PathBuf) {
        self.files.push(FileOutcome {
            source,
            error: None,
        });
    }

    fn fail(&mut self, source: Utf8PathBuf, cause: anyhow::Error) {
        tracing::warn!("'{source}': {cause:#}");
        self.files.push(FileOutcome {
            error: Some(TransformError {
                source_path: source.clone(),
                cause,
            }),
            source,
        });
    }
}

/// A validated stage, ready to run.
#[derive(Debug, Clone)]
pub(crate) enum Stage {
    Compile {
        transform: String,
        input: String,
        output: Utf8PathBuf,
        options: CompileOptions,
    },
    Optimize {
        transform: String,
        input: String,
        output: Utf8PathBuf,
        options: OptimizeOptions,
    },
    Bundle {
        inputs: Vec<String>,
        output: Utf8PathBuf,
        separator: String,
    },
    Copy {
        input: String,
        output: Utf8PathBuf,
    },
    Archive {
        input: String,
        output: Utf8PathBuf,
    },
}

impl Stage {
    /// Check a raw stage table against its kind and produce the typed
    /// stage. Options a kind doesn't recognize are rejected, same as
    /// unknown keys.
    pub(crate) fn from_config(task: &str, cfg: StageConfig) -> Result<Self, ConfigError> {
        let kind = cfg.kind;

        let reject = |field: &str| -> ConfigError {
            ConfigError::Stage {
                task: task.to_string(),
                reason: format!("'{field}' is not a '{}' stage option", kind.as_str()),
            }
        };
        let require = |field: &str| -> ConfigError {
            ConfigError::Stage {
                task: task.to_string(),
                reason: format!("a '{}' stage requires '{field}'", kind.as_str()),
            }
        };

        if kind != StageKind::Bundle && cfg.inputs.is_some() {
            return Err(reject("inputs"));
        }
        if kind != StageKind::Bundle && cfg.separator.is_some() {
            return Err(reject("separator"));
        }
        if kind != StageKind::Compile && cfg.pretty_print.is_some() {
            return Err(reject("pretty_print"));
        }
        if kind != StageKind::Compile && cfg.browser_targets.is_some() {
            return Err(reject("browser_targets"));
        }
        if kind != StageKind::Optimize && cfg.compression_level.is_some() {
            return Err(reject("compression_level"));
        }
        if kind != StageKind::Optimize && cfg.progressive.is_some() {
            return Err(reject("progressive"));
        }
        if !matches!(kind, StageKind::Compile | StageKind::Optimize) && cfg.transform.is_some() {
            return Err(reject("transform"));
        }

        let check_pattern = |pattern: &str| -> Result<(), ConfigError> {
            glob::Pattern::new(pattern)
                .map(|_| ())
                .map_err(|e| ConfigError::Stage {
                    task: task.to_string(),
                    reason: format!("invalid glob pattern '{pattern}': {e}"),
                })
        };

        let input = |cfg: &StageConfig| -> Result<String, ConfigError> {
            let input = cfg.input.clone().ok_or_else(|| require("input"))?;
            check_pattern(&input)?;
            Ok(input)
        };

        match kind {
            StageKind::Compile => Ok(Stage::Compile {
                transform: cfg.transform.clone().ok_or_else(|| require("transform"))?,
                input: input(&cfg)?,
                output: cfg.output,
                options: CompileOptions {
                    pretty_print: cfg.pretty_print.unwrap_or(false),
                    browser_targets: cfg.browser_targets.unwrap_or_default(),
                },
            }),
            StageKind::Optimize => {
                let level = cfg.compression_level.unwrap_or(5);
                if level > 9 {
                    return Err(ConfigError::Stage {
                        task: task.to_string(),
                        reason: format!("'compression_level' must be 0..=9, got {level}"),
                    });
                }

                Ok(Stage::Optimize {
                    transform: cfg.transform.clone().ok_or_else(|| require("transform"))?,
                    input: input(&cfg)?,
                    output: cfg.output,
                    options: OptimizeOptions {
                        compression_level: level,
                        progressive: cfg.progressive.unwrap_or(false),
                    },
                })
            }
            StageKind::Bundle => {
                if cfg.input.is_some() {
                    return Err(reject("input"));
                }

                let inputs = cfg.inputs.ok_or_else(|| require("inputs"))?;
                if inputs.is_empty() {
                    return Err(ConfigError::Stage {
                        task: task.to_string(),
                        reason: "a 'bundle' stage requires at least one input glob".to_string(),
                    });
                }
                for pattern in &inputs {
                    check_pattern(pattern)?;
                }

                Ok(Stage::Bundle {
                    inputs,
                    output: cfg.output,
                    separator: cfg.separator.unwrap_or_else(|| "\n".to_string()),
                })
            }
            StageKind::Copy => Ok(Stage::Copy {
                input: input(&cfg)?,
                output: cfg.output,
            }),
            StageKind::Archive => {
                if !cfg!(feature = "archive") {
                    return Err(ConfigError::Stage {
                        task: task.to_string(),
                        reason: "archive stages require the 'archive' feature".to_string(),
                    });
                }

                Ok(Stage::Archive {
                    input: input(&cfg)?,
                    output: cfg.output,
                })
            }
        }
    }

    /// The transform this stage invokes, if it names one.
    pub(crate) fn transform_name(&self) -> Option<&str> {
        match self {
            Stage::Compile { transform, .. } | Stage::Optimize { transform, .. } => {
                Some(transform)
            }
            _ => None,
        }
    }

    /// Input globs, used to derive default watch subscriptions.
    pub(crate) fn input_globs(&self) -> Vec<&str> {
        match self {
            Stage::Compile { input, .. }
            | Stage::Optimize { input, .. }
            | Stage::Copy { input, .. }
            | Stage::Archive { input, .. } => vec![input],
            Stage::Bundle { inputs, .. } => inputs.iter().map(String::as_str).collect(),
        }
    }

    /// Destination paths this stage would produce for the current source
    /// tree. Used by the single-writer validation; enumeration errors are
    /// ignored here and surface when the stage actually runs.
    pub(crate) fn planned_outputs(
        &self,
        output_root: &Utf8Path,
        transforms: &Transforms,
    ) -> Vec<Utf8PathBuf> {
        match self {
            Stage::Compile {
                transform, input, output, ..
            }
            | Stage::Optimize {
                transform, input, output, ..
            } => {
                let ext = transforms.get(transform).and_then(|t| t.rewrite_ext());
                planned_one_to_one(input, &output_root.join(output), ext)
            }
            Stage::Copy { input, output } => {
                planned_one_to_one(input, &output_root.join(output), None)
            }
            Stage::Bundle { output, .. } => vec![output_root.join(output)],
            // Archives land relative to the project root, outside the
            // cleaned output tree.
            Stage::Archive { output, .. } => vec![output.clone()],
        }
    }

    /// Stable fingerprint of the stage configuration, part of the
    /// transform cache key so option changes invalidate cached results.
    fn fingerprint(&self) -> Vec<u8> {
        let mut buf = Vec::new();

        let tag: (&str, String) = match self {
            Stage::Compile {
                transform, options, ..
            } => ("compile", format!("{transform}:{options:?}")),
            Stage::Optimize {
                transform, options, ..
            } => ("optimize", format!("{transform}:{options:?}")),
            Stage::Bundle { separator, .. } => ("bundle", separator.clone()),
            Stage::Copy { .. } => ("copy", String::new()),
            Stage::Archive { .. } => ("archive", String::new()),
        };

        buf.extend_from_slice(tag.0.as_bytes());
        buf.push(0);
        buf.extend_from_slice(tag.1.as_bytes());
        buf
    }

    /// Run the stage to completion. `Err` is structural and fatal for the
    /// owning task; per-file failures are collected in the outcome.
    pub(crate) fn run(&self, ctx: &StageContext<'_>) -> Result<StageOutcome, StageError> {
        match self {
            Stage::Compile { transform, input, output, options } => self.run_one_to_one(
                ctx,
                input,
                output,
                Some(transform),
                &StageOptions::Compile(options.clone()),
            ),
            Stage::Optimize { transform, input, output, options } => self.run_one_to_one(
                ctx,
                input,
                output,
                Some(transform),
                &StageOptions::Optimize(options.clone()),
            ),
            Stage::Copy { input, output } => {
                self.run_one_to_one(ctx, input, output, None, &StageOptions::None)
            }
            Stage::Bundle { inputs, output, separator } => {
                self.run_bundle(ctx, inputs, output, separator)
            }
            Stage::Archive { input, output } => self.run_archive(ctx, input, output),
        }
    }

    fn run_one_to_one(
        &self,
        ctx: &StageContext<'_>,
        input: &str,
        output: &Utf8Path,
        transform: Option<&str>,
        options: &StageOptions,
    ) -> Result<StageOutcome, StageError> {
        let mut outcome = StageOutcome::default();
        let base = static_prefix(input);
        let out_dir = ctx.output_root.join(output);

        let transform = transform.and_then(|name| ctx.transforms.get(name));
        let fingerprint = self.fingerprint();

        for source in enumerate(input)? {
            if !ctx.force && !ctx.tracker.lock().unwrap().is_stale(&source) {
                continue;
            }

            let data = match fs::read(&source) {
                Ok(data) => data,
                Err(e) => {
                    outcome.fail(source, e.into());
                    continue;
                }
            };

            let mut dest = out_dir.join(relative_to(&source, &base));
            if let Some(ext) = transform.as_ref().and_then(|t| t.rewrite_ext()) {
                dest.set_extension(ext);
            }

            let built = match &transform {
                Some(transform) => {
                    let key = cache_key(&fingerprint, &data);
                    let cached = ctx.cache_dir.join("transform").join(key.to_hex());

                    if !ctx.force && cached.is_file() {
                        fs::read(&cached)?
                    } else {
                        let job = TransformJob {
                            source: &source,
                            data: &data,
                            options,
                        };

                        match transform.apply(job) {
                            Ok(bytes) => {
                                outcome.invoked += 1;
                                write_artifact(&cached, &bytes)?;
                                bytes
                            }
                            Err(cause) => {
                                outcome.fail(source, cause);
                                continue;
                            }
                        }
                    }
                }
                None => data,
            };

            // An unwritable output tree is fatal for the whole stage.
            write_artifact(&dest, &built)?;

            let size = built.len() as u64;
            ctx.tracker
                .lock()
                .unwrap()
                .record_built(&source, vec![dest.clone()]);
            outcome.ok(source);
            outcome.artifacts.push(Artifact::new(dest, size));
        }

        Ok(outcome)
    }

    fn run_bundle(
        &self,
        ctx: &StageContext<'_>,
        inputs: &[String],
        output: &Utf8Path,
        separator: &str,
    ) -> Result<StageOutcome, StageError> {
        let mut outcome = StageOutcome::default();
        let dest = ctx.output_root.join(output);

        // Enumeration order is the declared glob order; within one glob,
        // sorted paths. This is what fixes the concatenation order. A file
        // matched by several globs keeps its first position only, so
        // "vendor/jquery*" followed by "vendor/*" front-loads jquery.
        let mut sources = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for glob in inputs {
            for path in enumerate(glob)? {
                if seen.insert(path.clone()) {
                    sources.push(path);
                }
            }
        }

        let stale = ctx.force
            || !dest.is_file()
            || sources
                .iter()
                .any(|src| ctx.tracker.lock().unwrap().is_stale(src));
        if !stale {
            return Ok(outcome);
        }

        let mut parts: Vec<Vec<u8>> = Vec::with_capacity(sources.len());
        for source in &sources {
            match fs::read(source) {
                Ok(data) => {
                    parts.push(data);
                    outcome.ok(source.clone());
                }
                // The file's content is dropped from the bundle; surface
                // it loudly instead of silently.
                Err(e) => outcome.fail(source.clone(), e.into()),
            }
        }

        let built = parts.join(separator.as_bytes());
        write_artifact(&dest, &built)?;
        outcome.invoked += 1;

        let mut tracker = ctx.tracker.lock().unwrap();
        for source in &sources {
            tracker.record_built(source, vec![dest.clone()]);
        }
        drop(tracker);

        let size = built.len() as u64;
        outcome.artifacts.push(Artifact::new(dest, size));
        Ok(outcome)
    }

    #[cfg(feature = "archive")]
    fn run_archive(
        &self,
        ctx: &StageContext<'_>,
        input: &str,
        output: &Utf8Path,
    ) -> Result<StageOutcome, StageError> {
        let mut outcome = StageOutcome::default();
        let base = static_prefix(input);

        let files: Vec<(Utf8PathBuf, Utf8PathBuf)> = enumerate(input)?
            .into_iter()
            .map(|path| {
                let name = relative_to(&path, &base);
                (path, name)
            })
            .collect();

        crate::transform::archive::pack(&files, output)?;

        for (source, _) in &files {
            outcome.ok(source.clone());
        }

        let size = fs::metadata(output).map(|m| m.len()).unwrap_or(0);
        outcome.artifacts.push(Artifact::new(output.to_path_buf(), size));
        Ok(outcome)
    }

    #[cfg(not(feature = "archive"))]
    fn run_archive(
        &self,
        _: &StageContext<'_>,
        _: &str,
        _: &Utf8Path,
    ) -> Result<StageOutcome, StageError> {
        unreachable!("archive stages are rejected at validation time")
    }
}

/// Shared state handed to every stage run.
pub(crate) struct StageContext<'a> {
    pub output_root: &'a Utf8Path,
    pub cache_dir: &'a Utf8Path,
    pub transforms: &'a Transforms,
    pub tracker: &'a Mutex<FreshnessTracker>,
    /// Bypass freshness and cache checks; set for tasks the watcher
    /// triggered directly, so import-only edits still rebuild.
    pub force: bool,
}

fn cache_key(fingerprint: &[u8], data: &[u8]) -> Hash32 {
    let mut buf = Vec::with_capacity(fingerprint.len() + data.len());
    buf.extend_from_slice(fingerprint);
    buf.extend_from_slice(data);
    Hash32::hash(buf)
}

/// Enumerate files matching a glob, in sorted order. Directories are
/// skipped; a broken pattern or unreadable directory is structural.
fn enumerate(pattern: &str) -> Result<Vec<Utf8PathBuf>, StageError> {
    let mut files = Vec::new();

    for entry in glob::glob(pattern)? {
        let path = Utf8PathBuf::try_from(entry?)?;
        if path.is_file() {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}

/// The static directory prefix of a glob, i.e. everything before the first
/// component containing a wildcard.
pub(crate) fn static_prefix(pattern: &str) -> Utf8PathBuf {
    let path = Utf8Path::new(pattern);
    let components: Vec<_> = path.components().collect();
    let split_idx = components
        .iter()
        .position(|c| c.as_str().contains(['*', '?', '[']))
        .unwrap_or(components.len().saturating_sub(1));

    components.iter().take(split_idx).collect()
}

fn planned_one_to_one(input: &str, out_dir: &Utf8Path, ext: Option<&str>) -> Vec<Utf8PathBuf> {
    let base = static_prefix(input);
    let Ok(paths) = glob::glob(input) else {
        return Vec::new();
    };

    paths
        .flatten()
        .filter_map(|path| Utf8PathBuf::try_from(path).ok())
        .filter(|path| path.is_file())
        .map(|path| {
            let mut dest = out_dir.join(relative_to(&path, &base));
            if let Some(ext) = ext {
                dest.set_extension(ext);
            }
            dest
        })
        .collect()
}

fn relative_to(path: &Utf8Path, base: &Utf8Path) -> Utf8PathBuf {
    match path.strip_prefix(base) {
        Ok(rel) if !rel.as_str().is_empty() => rel.to_path_buf(),
        _ => Utf8PathBuf::from(path.file_name().unwrap_or(path.as_str())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageKind;

    fn stage_cfg(kind: StageKind) -> StageConfig {
        StageConfig {
            kind,
            transform: None,
            input: None,
            inputs: None,
            output: Utf8PathBuf::from("out"),
            pretty_print: None,
            browser_targets: None,
            compression_level: None,
            progressive: None,
            separator: None,
        }
    }

    #[test]
    fn test_static_prefix() {
        assert_eq!(static_prefix("source/img/**/*"), "source/img");
        assert_eq!(static_prefix("source/css/[!_]*.scss"), "source/css");
        assert_eq!(static_prefix("source/data.json"), "source");
        assert_eq!(static_prefix("*.js"), "");
    }

    #[test]
    fn test_artifact_kind_from_path() {
        assert_eq!(
            ArtifactKind::from_path(Utf8Path::new("build/css/master.css")),
            ArtifactKind::Style
        );
        assert_eq!(
            ArtifactKind::from_path(Utf8Path::new("build/index.html")),
            ArtifactKind::Markup
        );
        assert_eq!(
            ArtifactKind::from_path(Utf8Path::new("build/js/main.js")),
            ArtifactKind::Script
        );
        assert_eq!(
            ArtifactKind::from_path(Utf8Path::new("build/img/logo.png")),
            ArtifactKind::Image
        );
        assert_eq!(
            ArtifactKind::from_path(Utf8Path::new("build/font.woff2")),
            ArtifactKind::Other
        );
    }

    #[test]
    fn test_copy_rejects_foreign_options() {
        let mut cfg = stage_cfg(StageKind::Copy);
        cfg.input = Some("source/data/**/*".to_string());
        cfg.compression_level = Some(7);

        let err = Stage::from_config("data", cfg).unwrap_err();
        assert!(err.to_string().contains("compression_level"));
    }

    #[test]
    fn test_compile_requires_transform() {
        let mut cfg = stage_cfg(StageKind::Compile);
        cfg.input = Some("source/css/*.scss".to_string());

        let err = Stage::from_config("styles", cfg).unwrap_err();
        assert!(err.to_string().contains("transform"));
    }

    #[test]
    fn test_optimize_level_range_checked() {
        let mut cfg = stage_cfg(StageKind::Optimize);
        cfg.transform = Some("image".to_string());
        cfg.input = Some("source/img/**/*".to_string());
        cfg.compression_level = Some(12);

        assert!(Stage::from_config("images", cfg).is_err());
    }

    #[test]
    fn test_bundle_requires_ordered_inputs() {
        let cfg = stage_cfg(StageKind::Bundle);
        assert!(Stage::from_config("scripts", cfg).is_err());

        let mut cfg = stage_cfg(StageKind::Bundle);
        cfg.inputs = Some(vec![]);
        assert!(Stage::from_config("scripts", cfg).is_err());
    }

    #[test]
    fn test_bundle_preserves_declared_order() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let src = root.join("js");
        fs::create_dir_all(&src).unwrap();

        // Declared order puts the z-prefixed vendor file first.
        fs::write(src.join("z-vendor.js"), "vendor").unwrap();
        fs::write(src.join("a.js"), "alpha").unwrap();
        fs::write(src.join("b.js"), "beta").unwrap();

        let stage = Stage::Bundle {
            inputs: vec![
                format!("{src}/z-vendor.js"),
                format!("{src}/[ab].js"),
            ],
            output: Utf8PathBuf::from("js/main.js"),
            separator: "\n".to_string(),
        };

        let tracker = Mutex::new(FreshnessTracker::new(true));
        let output_root = root.join("build");
        let cache_dir = root.join(".cache");
        let transforms = Transforms::none();
        let ctx = StageContext {
            output_root: &output_root,
            cache_dir: &cache_dir,
            transforms: &transforms,
            tracker: &tracker,
            force: false,
        };

        let outcome = stage.run(&ctx).unwrap();
        assert_eq!(outcome.invoked, 1);

        let bundled = fs::read_to_string(root.join("build/js/main.js")).unwrap();
        assert_eq!(bundled, "vendor\nalpha\nbeta");
    }

    #[test]
    fn test_fresh_inputs_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let src = root.join("data");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a.json"), "{}").unwrap();

        let stage = Stage::Copy {
            input: format!("{src}/*.json"),
            output: Utf8PathBuf::from("data"),
        };

        let tracker = Mutex::new(FreshnessTracker::new(true));
        let output_root = root.join("build");
        let cache_dir = root.join(".cache");
        let transforms = Transforms::none();
        let ctx = StageContext {
            output_root: &output_root,
            cache_dir: &cache_dir,
            transforms: &transforms,
            tracker: &tracker,
            force: false,
        };

        let first = stage.run(&ctx).unwrap();
        assert_eq!(first.artifacts.len(), 1);

        // Nothing changed, so the second run writes nothing.
        let second = stage.run(&ctx).unwrap();
        assert!(second.artifacts.is_empty());
        assert!(second.files.is_empty());
    }

    #[test]
    fn test_copy_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let src = root.join("vendor");
        fs::create_dir_all(&src).unwrap();

        let payload = b"\x00\x01binary\xffpayload";
        fs::write(src.join("lib.js"), payload).unwrap();

        let stage = Stage::Copy {
            input: format!("{src}/*.js"),
            output: Utf8PathBuf::from("js/vendor"),
        };

        let tracker = Mutex::new(FreshnessTracker::new(true));
        let output_root = root.join("build");
        let cache_dir = root.join(".cache");
        let transforms = Transforms::none();
        let ctx = StageContext {
            output_root: &output_root,
            cache_dir: &cache_dir,
            transforms: &transforms,
            tracker: &tracker,
            force: false,
        };

        stage.run(&ctx).unwrap();
        let copied = fs::read(root.join("build/js/vendor/lib.js")).unwrap();
        assert_eq!(copied, payload);
    }
}
