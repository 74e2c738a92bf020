use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::shared::constants::{OUTPUT_EXTENSION, OUTPUT_PREFIX};

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Picks a fresh output path in `dir`: `compressed-<unix-millis>-<seq>.mp4`.
///
/// The process-wide sequence number keeps paths distinct for calls that
/// land in the same millisecond.
pub fn next_output_path(dir: &Path) -> PathBuf {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    dir.join(format!("{OUTPUT_PREFIX}{millis}-{seq}.{OUTPUT_EXTENSION}"))
}
