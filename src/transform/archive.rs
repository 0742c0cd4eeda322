use std::fs::{self, File};
use std::io::BufWriter;

use camino::{Utf8Path, Utf8PathBuf};

/// Pack the given files into a tar archive at `dest`, preserving their
/// paths relative to the enumeration root.
pub(crate) fn pack(
    files: &[(Utf8PathBuf, Utf8PathBuf)],
    dest: &Utf8Path,
) -> std::io::Result<()> {
    if let Some(dir) = dest.parent() {
        fs::create_dir_all(dir)?;
    }

    let file = File::create(dest)?;
    let mut builder = tar::Builder::new(BufWriter::new(file));

    for (path, name) in files {
        builder.append_path_with_name(path, name)?;
    }

    builder.into_inner()?;
    Ok(())
}
