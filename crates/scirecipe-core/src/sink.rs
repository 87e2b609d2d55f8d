//! Append-only JSON-Lines output streams and the resume index built from
//! them.

use crate::error::Result;
use crate::io;
use crate::record::{IdOnly, RecordId};
use serde::Serialize;
use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::debug;

// ---------------------------------------------------------------------------
// JsonlSink
// ---------------------------------------------------------------------------

/// One output stream. Every [`append`](JsonlSink::append) is flushed and
/// fsynced before it returns.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    file: File,
    written: usize,
}

impl JsonlSink {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            file: io::open_append(path)?,
            written: 0,
        })
    }

    pub fn append<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        io::append_synced(&mut self.file, &line)?;
        self.written += 1;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lines appended through this handle.
    pub fn written(&self) -> usize {
        self.written
    }
}

// ---------------------------------------------------------------------------
// ProcessedIds
// ---------------------------------------------------------------------------

/// Identifiers already committed to an output stream.
#[derive(Debug, Default, Clone)]
pub struct ProcessedIds {
    ids: HashSet<RecordId>,
}

impl ProcessedIds {
    /// Scan every line of every existing file. Lines that are not valid
    /// UTF-8 JSON with an `id` are skipped; missing files are ignored.
    pub fn load(paths: &[&Path]) -> Result<Self> {
        let mut ids = HashSet::new();
        for path in paths {
            if !path.exists() {
                continue;
            }
            let bytes = std::fs::read(path)?;
            let mut skipped = 0usize;
            for line in bytes.split(|b| *b == b'\n') {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                match serde_json::from_slice::<IdOnly>(line) {
                    Ok(entry) => {
                        ids.insert(entry.id);
                    }
                    Err(_) => skipped += 1,
                }
            }
            if skipped > 0 {
                debug!(path = %path.display(), skipped, "skipped unreadable stream lines");
            }
        }
        Ok(Self { ids })
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.ids.contains(id)
    }

    pub fn insert(&mut self, id: RecordId) -> bool {
        self.ids.insert(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
