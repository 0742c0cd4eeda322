use anyhow::Context;

use super::{Transform, TransformJob};

/// Template rendering via `minijinja`, one standalone template per page.
pub(crate) struct Jinja;

impl Transform for Jinja {
    fn rewrite_ext(&self) -> Option<&'static str> {
        Some("html")
    }

    fn apply(&self, job: TransformJob<'_>) -> anyhow::Result<Vec<u8>> {
        let text = std::str::from_utf8(job.data)
            .with_context(|| format!("template '{}' is not UTF-8", job.source))?;

        let env = minijinja::Environment::new();
        let html = env
            .render_str(text, minijinja::context! {})
            .with_context(|| format!("rendering template '{}'", job.source))?;

        Ok(html.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8Path;

    #[test]
    fn test_renders_expressions() {
        let out = Jinja
            .apply(TransformJob {
                source: Utf8Path::new("index.jinja"),
                data: b"<title>{{ 1 + 1 }}</title>",
                options: &super::super::StageOptions::None,
            })
            .unwrap();

        assert_eq!(out, b"<title>2</title>");
    }

    #[test]
    fn test_syntax_error_is_an_error() {
        let result = Jinja.apply(TransformJob {
            source: Utf8Path::new("broken.jinja"),
            data: b"{% if %}",
            options: &super::super::StageOptions::None,
        });
        assert!(result.is_err());
    }
}
