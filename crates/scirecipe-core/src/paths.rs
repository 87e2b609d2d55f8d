use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const RECIPE_DIR: &str = ".scirecipe";
pub const CONFIG_FILE: &str = ".scirecipe/config.yaml";

pub const DEFAULT_INPUT: &str = "data/protocols.jsonl";
pub const DEFAULT_SUCCESS: &str = "data/success.jsonl";
pub const DEFAULT_FAILURE: &str = "data/failed.jsonl";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

/// Resolve a configured path against the project root. Absolute paths are
/// returned unchanged.
pub fn resolve(root: &Path, configured: &Path) -> PathBuf {
    if configured.is_absolute() {
        configured.to_path_buf()
    } else {
        root.join(configured)
    }
}
