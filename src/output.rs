//! Output placement and crash-safe writes.
//!
//! Every durable write in the crate goes through [`write_atomic`]: the bytes
//! land in a temp file in the destination directory which is then renamed
//! over the target, so a killed process or an abandoned task never leaves a
//! half-written file behind.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::asset_cache::content_hash;

/// Writes `contents` to `path` via temp-file-then-rename, creating parent directories.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;
    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

const STEM_PREFIX_MAX_CHARS: usize = 64;
const STEM_HASH_LEN: usize = 12;

/// Replaces anything outside `[A-Za-z0-9_-]` with `_`.
fn sanitize_stem(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// File stem for an item id: readable sanitized prefix plus a hash of the
/// raw id, so ids that sanitize alike never share an output file.
pub fn item_file_stem(item_id: &str) -> String {
    let prefix: String = sanitize_stem(item_id)
        .chars()
        .take(STEM_PREFIX_MAX_CHARS)
        .collect();
    let hash = content_hash(item_id.as_bytes());
    let suffix = &hash[..STEM_HASH_LEN];
    if prefix.is_empty() {
        format!("item-{suffix}")
    } else {
        format!("{prefix}-{suffix}")
    }
}

/// Directory name for a variant. Variants come from configuration, where
/// distinct names are enforced at load time.
pub fn variant_dir_name(variant: &str) -> String {
    let name = sanitize_stem(variant);
    if name.is_empty() {
        "variant".to_string()
    } else {
        name
    }
}

/// `<output_dir>/<variant>/<item stem>.md`
pub fn output_path(output_dir: &Path, variant: &str, item_id: &str) -> PathBuf {
    output_dir
        .join(variant_dir_name(variant))
        .join(format!("{}.md", item_file_stem(item_id)))
}

/// Removes previously written outputs. Best effort: returns how many files were removed.
pub fn remove_outputs<'a, I>(paths: I) -> usize
where
    I: IntoIterator<Item = &'a PathBuf>,
{
    let mut removed = 0;
    for path in paths {
        match fs::remove_file(path) {
            Ok(()) => {
                debug!(path = %path.display(), "[OUTPUT] Removed output of deleted item");
                removed += 1;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "[OUTPUT] Failed to remove output"),
        }
    }
    removed
}
