use super::{StageOptions, Transform, TransformJob};

/// Stylesheet compilation via `grass`.
///
/// Compiles from the source path rather than the in-memory bytes so that
/// `@use` and `@import` resolve relative to the file.
pub(crate) struct Scss;

impl Transform for Scss {
    fn rewrite_ext(&self) -> Option<&'static str> {
        Some("css")
    }

    fn apply(&self, job: TransformJob<'_>) -> anyhow::Result<Vec<u8>> {
        let style = match job.options {
            StageOptions::Compile(opts) if opts.pretty_print => grass::OutputStyle::Expanded,
            _ => grass::OutputStyle::Compressed,
        };

        let opts = grass::Options::default().style(style);
        let css = grass::from_path(job.source, &opts)
            .map_err(|e| anyhow::anyhow!("compiling stylesheet '{}': {e}", job.source))?;

        Ok(css.into_bytes())
    }
}
