//! Recursive discovery of Mach-O/Universal binaries under a folder.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::macho;
use crate::paths;

/// Walk `folder` and return every file that passes the Mach-O magic check,
/// in walk order.
///
/// Symlinked files are inspected normally; symlinked directories are not
/// descended into. I/O errors on individual entries are logged and skipped,
/// so a single unreadable entry cannot abort the walk.
pub fn find_binaries(folder: &Path) -> crate::Result<Vec<PathBuf>> {
    let folder = paths::resolve_abs_path(folder)?;

    let mut found = Vec::new();
    for entry in WalkDir::new(&folder) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!("could not walk entry: {err}");
                continue;
            }
        };

        if entry.file_type().is_symlink() {
            // walkdir does not follow links, so a symlinked directory never
            // gets descended into; we still admit symlinked files.
            match fs_err::metadata(entry.path()) {
                Ok(meta) if meta.is_dir() => {
                    debug!("skipping symlinked directory: {}", entry.path().display());
                    continue;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("could not check symlink {}: {err}", entry.path().display());
                    continue;
                }
            }
        } else if entry.file_type().is_dir() {
            continue;
        }

        match macho::is_fat_or_macho(entry.path()) {
            Ok(true) => {
                info!("found Mach-O/Universal binary: {}", entry.path().display());
                found.push(entry.path().to_path_buf());
            }
            Ok(false) => {}
            Err(err) => warn!("could not check {}: {err}", entry.path().display()),
        }
    }
    Ok(found)
}
