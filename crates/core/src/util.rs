//! Small filesystem helpers shared across the crate.

use std::path::{Path, PathBuf};

/// Derive a randomized temp path in the same directory as `target`.
///
/// Keeping the temp file a sibling guarantees the final rename stays on one
/// filesystem and therefore atomic.
pub(crate) fn sibling_temp_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let suffix: u64 = rand::random();
    target.with_file_name(format!(".{name}.{suffix:016x}.tmp"))
}
