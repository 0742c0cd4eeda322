//! Freshness bookkeeping: decides, per source file, whether its outputs are
//! out of date.
//!
//! A source is stale iff no record exists for it, or the recorded signature
//! differs from the current filesystem signature, or any recorded output is
//! missing on disk. `record_built` is the only mutator; `is_stale` never
//! touches the records.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::time::UNIX_EPOCH;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::hash::Hash32;

/// The change-detection signature of a source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum Signature {
    /// Modification time, milliseconds since the epoch.
    Mtime(u64),
    /// BLAKE3 content hash, hex-encoded.
    Hash(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Record {
    signature: Signature,
    outputs: Vec<Utf8PathBuf>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct FreshnessTracker {
    use_hash: bool,
    records: HashMap<Utf8PathBuf, Record>,
}

impl FreshnessTracker {
    pub(crate) fn new(use_hash: bool) -> Self {
        Self {
            use_hash,
            records: HashMap::new(),
        }
    }

    fn signature(&self, path: &Utf8Path) -> std::io::Result<Signature> {
        if self.use_hash {
            Ok(Signature::Hash(Hash32::hash_file(path)?.to_hex()))
        } else {
            let modified = fs::metadata(path)?.modified()?;
            let millis = modified
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            Ok(Signature::Mtime(millis))
        }
    }

    /// Whether the outputs recorded for `source` are out of date.
    pub(crate) fn is_stale(&self, source: &Utf8Path) -> bool {
        let Some(record) = self.records.get(source) else {
            return true;
        };

        if record.outputs.iter().any(|out| !out.exists()) {
            return true;
        }

        match self.signature(source) {
            Ok(current) => current != record.signature,
            // Unreadable source; let the stage surface the actual error.
            Err(_) => true,
        }
    }

    /// Record a successful build of `source` into `outputs`.
    pub(crate) fn record_built(&mut self, source: &Utf8Path, outputs: Vec<Utf8PathBuf>) {
        if let Ok(signature) = self.signature(source) {
            self.records
                .insert(source.to_path_buf(), Record { signature, outputs });
        }
    }

    /// Drop the record for a removed source.
    pub(crate) fn forget(&mut self, source: &Utf8Path) {
        self.records.remove(source);
    }

    /// Load persisted records, if a readable cache exists. A missing or
    /// corrupt cache file simply yields an empty tracker.
    pub(crate) fn load(path: &Utf8Path, use_hash: bool) -> Self {
        let tracker = File::open(path)
            .ok()
            .and_then(|file| ciborium::from_reader::<Self, _>(BufReader::new(file)).ok());

        match tracker {
            // A cache written under the other signature scheme is useless.
            Some(tracker) if tracker.use_hash == use_hash => tracker,
            _ => Self::new(use_hash),
        }
    }

    /// Persist the records for the next process.
    pub(crate) fn store(&self, path: &Utf8Path) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let file = File::create(path)?;
        ciborium::into_writer(self, BufWriter::new(file)).map_err(std::io::Error::other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf8(path: &std::path::Path) -> Utf8PathBuf {
        Utf8PathBuf::try_from(path.to_path_buf()).unwrap()
    }

    #[test]
    fn test_unknown_source_is_stale() {
        let tracker = FreshnessTracker::new(false);
        assert!(tracker.is_stale(Utf8Path::new("no/such/file.css")));
    }

    #[test]
    fn test_recorded_source_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let src = utf8(&dir.path().join("a.scss"));
        let out = utf8(&dir.path().join("a.css"));
        fs::write(&src, "body {}").unwrap();
        fs::write(&out, "body{}").unwrap();

        let mut tracker = FreshnessTracker::new(true);
        tracker.record_built(&src, vec![out]);
        assert!(!tracker.is_stale(&src));
    }

    #[test]
    fn test_missing_output_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let src = utf8(&dir.path().join("a.scss"));
        let out = utf8(&dir.path().join("a.css"));
        fs::write(&src, "body {}").unwrap();
        fs::write(&out, "body{}").unwrap();

        let mut tracker = FreshnessTracker::new(true);
        tracker.record_built(&src, vec![out.clone()]);

        fs::remove_file(&out).unwrap();
        assert!(tracker.is_stale(&src));
    }

    #[test]
    fn test_changed_content_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let src = utf8(&dir.path().join("a.scss"));
        let out = utf8(&dir.path().join("a.css"));
        fs::write(&src, "body {}").unwrap();
        fs::write(&out, "body{}").unwrap();

        let mut tracker = FreshnessTracker::new(true);
        tracker.record_built(&src, vec![out]);

        fs::write(&src, "body { color: red }").unwrap();
        assert!(tracker.is_stale(&src));
    }

    #[test]
    fn test_store_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let src = utf8(&dir.path().join("a.txt"));
        let out = utf8(&dir.path().join("out/a.txt"));
        let cache = utf8(&dir.path().join(".cache/fresh.cbor"));
        fs::write(&src, "data").unwrap();
        fs::create_dir_all(out.parent().unwrap()).unwrap();
        fs::write(&out, "data").unwrap();

        let mut tracker = FreshnessTracker::new(true);
        tracker.record_built(&src, vec![out]);
        tracker.store(&cache).unwrap();

        let restored = FreshnessTracker::load(&cache, true);
        assert!(!restored.is_stale(&src));

        // A scheme mismatch discards the cache.
        let mismatched = FreshnessTracker::load(&cache, false);
        assert!(mismatched.is_stale(&src));
    }
}
