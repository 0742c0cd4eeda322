use std::fmt::Display;
use std::fs;
use std::time::Instant;

use camino::Utf8Path;
use console::Style;

const ANSI_BLUE: Style = Style::new().blue();

pub(crate) fn as_overhead(s: Instant) -> impl Display {
    let e = Instant::now();
    let f = format!("(+{}ms)", e.duration_since(s).as_millis());
    ANSI_BLUE.apply_to(f)
}

/// Delete the output directory if it exists, then recreate it empty, so
/// artifacts of renamed or removed sources cannot linger.
pub(crate) fn clean_output(root: &Utf8Path) -> std::io::Result<()> {
    let s = Instant::now();

    if fs::metadata(root).is_ok() {
        fs::remove_dir_all(root)?;
    }

    fs::create_dir_all(root)?;

    tracing::debug!("cleaned the output directory {}", as_overhead(s));
    Ok(())
}

/// Remove the on-disk caches. Only a wall-clock cost; the next build
/// recreates everything.
pub(crate) fn clean_cache(cache: &Utf8Path) -> std::io::Result<()> {
    if fs::metadata(cache).is_ok() {
        fs::remove_dir_all(cache)?;
    }

    Ok(())
}

/// Write an artifact, creating intermediate directories as needed.
pub(crate) fn write_artifact(path: &Utf8Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }

    fs::write(path, data)
}

/// Human-readable byte count for the build summary.
pub(crate) fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "kB", "MB", "GB"];

    let mut value = bytes as f64;
    let mut unit = 0;

    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(999), "999 B");
        assert_eq!(human_size(1500), "1.5 kB");
        assert_eq!(human_size(2_400_000), "2.4 MB");
    }

    #[test]
    fn test_clean_output_recreates_empty() {
        let dir = tempfile::tempdir().unwrap();
        let root = camino::Utf8PathBuf::try_from(dir.path().join("build")).unwrap();

        fs::create_dir_all(root.join("css")).unwrap();
        fs::write(root.join("css/old.css"), "stale").unwrap();

        clean_output(&root).unwrap();
        assert!(root.exists());
        assert_eq!(fs::read_dir(&root).unwrap().count(), 0);
    }
}
