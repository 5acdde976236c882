//! Content digest of a build context, used as the artifact tag.

use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};
use walkdir::{DirEntry, WalkDir};

/// Directories that never influence the built artifact.
const IGNORED_DIRS: &[&str] = &[".git", "target", "node_modules", "__pycache__", ".venv"];

fn is_ignored(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| IGNORED_DIRS.contains(&name))
}

/// SHA-256 over every file's relative path and contents, walked in a
/// stable order. Returns the full hex digest.
pub fn context_digest(root: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_ignored(e));

    for entry in walker {
        let entry = entry.map_err(io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(std::fs::read(entry.path())?);
        hasher.update([0u8]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Artifact tag for a build context: `sha-` plus 12 hex characters.
pub fn context_tag(root: &Path) -> io::Result<String> {
    let digest = context_digest(root)?;
    Ok(format!("sha-{}", &digest[..12]))
}
