//! The boundary between the pipeline core and the libraries doing the
//! substantive work.
//!
//! A [`Transform`] turns the bytes of one source file into the bytes of one
//! artifact. The core never looks inside: it enumerates inputs, filters
//! them for staleness, invokes the transform, and writes whatever comes
//! back. Built-in transforms are feature-gated and registered by name in
//! [`Transforms`]; deployments may register their own under any unused
//! name.

#[cfg(feature = "archive")]
pub(crate) mod archive;
#[cfg(feature = "images")]
mod images;
#[cfg(feature = "styles")]
mod styles;
#[cfg(feature = "templates")]
mod templates;

use std::collections::HashMap;
use std::sync::Arc;

use camino::Utf8Path;

/// Options accepted by `compile` stages.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Emit human-readable output instead of compressed.
    pub pretty_print: bool,
    /// Browser targets forwarded to the transform; the built-in transforms
    /// ignore them.
    pub browser_targets: Vec<String>,
}

/// Options accepted by `optimize` stages.
#[derive(Debug, Clone)]
pub struct OptimizeOptions {
    /// Effort level, 0 through 9. Higher trades time for smaller output.
    pub compression_level: u32,
    /// Request progressive encoding where the format allows it.
    pub progressive: bool,
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        Self {
            compression_level: 5,
            progressive: false,
        }
    }
}

/// The options a stage hands to its transform.
#[derive(Debug, Clone)]
pub enum StageOptions {
    Compile(CompileOptions),
    Optimize(OptimizeOptions),
    None,
}

/// One unit of transform work.
pub struct TransformJob<'a> {
    /// Path of the source file, for diagnostics and import resolution.
    pub source: &'a Utf8Path,
    /// Raw source bytes.
    pub data: &'a [u8],
    /// Validated stage options.
    pub options: &'a StageOptions,
}

/// A replaceable input-to-artifact conversion.
pub trait Transform: Send + Sync {
    /// Extension given to produced artifacts, or `None` to keep the
    /// source's own extension.
    fn rewrite_ext(&self) -> Option<&'static str>;

    /// Convert one source file into artifact bytes.
    fn apply(&self, job: TransformJob<'_>) -> anyhow::Result<Vec<u8>>;
}

/// Named registry of transforms available to a pipeline.
#[derive(Clone, Default)]
pub struct Transforms {
    map: HashMap<String, Arc<dyn Transform>>,
}

impl Transforms {
    /// An empty registry, for deployments supplying everything themselves.
    pub fn none() -> Self {
        Self::default()
    }

    /// The registry of built-in transforms enabled by crate features.
    pub fn builtin() -> Self {
        #[allow(unused_mut)]
        let mut transforms = Self::default();

        #[cfg(feature = "styles")]
        transforms.register("scss", styles::Scss);

        #[cfg(feature = "templates")]
        transforms.register("jinja", templates::Jinja);

        #[cfg(feature = "images")]
        transforms.register("image", images::Raster);

        transforms
    }

    /// Register a transform under a name referable from stage configs.
    pub fn register(&mut self, name: impl Into<String>, transform: impl Transform + 'static) {
        self.map.insert(name.into(), Arc::new(transform));
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<dyn Transform>> {
        self.map.get(name).cloned()
    }
}

impl std::fmt::Debug for Transforms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.map.keys().collect();
        names.sort();
        f.debug_tuple("Transforms").field(&names).finish()
    }
}
