//! Path canonicalisation and Mach-O loader token expansion.
//!
//! Install-name paths recorded in load commands may begin with the loader
//! tokens `@executable_path` or `@loader_path`, which are resolved against
//! the crawl options and the referring binary respectively. Everything else
//! is resolved directly against the filesystem, following symlinks.

use std::path::{Path, PathBuf};

use crate::crawler::DependencyOptions;
use crate::graph::Dependency;
use crate::{Error, Result};

/// Whether the path uses a loader token (`@executable_path`, `@loader_path`,
/// `@rpath`, ...).
pub fn is_special_path(path: &str) -> bool {
    path.starts_with('@')
}

/// Resolve a path to its canonical absolute form, following symlinks.
pub fn resolve_abs_path(path: &Path) -> Result<PathBuf> {
    std::fs::canonicalize(path).map_err(|source| Error::ResolveFailed {
        path: path.display().to_string(),
        source,
    })
}

/// Expand a declared dependency path into a canonical absolute path.
///
/// `@executable_path/X` substitutes the executable path from the options and
/// fails with [`Error::NoExecutablePath`] when none is set. `@loader_path/X`
/// is anchored at the directory of the referring binary's real path; if that
/// real path itself still carries a loader token the reference cannot be
/// anchored and expansion fails with [`Error::UnsupportedToken`], as it does
/// for any other `@` prefix. The final canonicalisation step fails with
/// [`Error::ResolveFailed`] when the expanded path does not exist; callers
/// keep the declared path and record the node as not resolved.
pub fn expand_path(
    path: &str,
    referrer: &Dependency,
    opts: &DependencyOptions,
) -> Result<PathBuf> {
    let full = if let Some(rest) = path.strip_prefix("@executable_path/") {
        match &opts.executable_path {
            Some(executable) => executable.join(rest),
            None => return Err(Error::NoExecutablePath(path.to_string())),
        }
    } else if let Some(rest) = path.strip_prefix("@loader_path/") {
        let loader = referrer.real_path();
        if is_special_path(&loader.to_string_lossy()) {
            // Chained loader tokens cannot be anchored.
            return Err(Error::UnsupportedToken(path.to_string()));
        }
        match loader.parent() {
            Some(dir) => dir.join(rest),
            None => PathBuf::from(rest),
        }
    } else if is_special_path(path) {
        return Err(Error::UnsupportedToken(path.to_string()));
    } else {
        PathBuf::from(path)
    };

    resolve_abs_path(&full)
}

/// Compute a path describing `path` relative to `base`.
///
/// `base` is walked upwards until an ancestor prefixes `path`; the result
/// climbs out of `base` with `..` components and descends into the stripped
/// remainder. Returns `None` when the two paths share no common ancestor
/// (e.g. one of them is relative).
pub fn relative_to(path: &Path, base: &Path) -> Option<PathBuf> {
    let (stripped, common_prefix) = base
        .ancestors()
        .find_map(|ancestor| path.strip_prefix(ancestor).ok().map(|s| (s, ancestor)))?;

    let levels_up = base.components().count() - common_prefix.components().count();
    let up = std::iter::repeat_n("..", levels_up).collect::<PathBuf>();
    Some(up.join(stripped))
}

/// The final component of a declared install-name path.
pub(crate) fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    fn referrer(real_path: Option<PathBuf>) -> Dependency {
        Dependency::new(
            "libref.dylib".to_string(),
            "@rpath/libref.dylib".to_string(),
            real_path,
            String::new(),
            false,
        )
    }

    #[test]
    fn special_paths_start_with_at() {
        assert!(is_special_path("@executable_path/libz.dylib"));
        assert!(is_special_path("@rpath/libz.dylib"));
        assert!(!is_special_path("/usr/lib/libz.dylib"));
        assert!(!is_special_path("libz.dylib"));
    }

    #[test]
    fn resolve_abs_path_follows_symlinks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("libreal.dylib");
        std::fs::write(&target, b"x").expect("write target");
        let link = dir.path().join("liblink.dylib");
        symlink(&target, &link).expect("symlink");

        let resolved = resolve_abs_path(&link).expect("resolve symlink");
        assert_eq!(resolved, resolve_abs_path(&target).expect("resolve target"));
    }

    #[test]
    fn resolve_abs_path_fails_for_missing_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = resolve_abs_path(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, Error::ResolveFailed { .. }));
    }

    #[test]
    fn expands_executable_path_token() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("libz.dylib"), b"x").expect("write");

        let opts = DependencyOptions {
            executable_path: Some(dir.path().to_path_buf()),
            ..DependencyOptions::default()
        };
        let resolved = expand_path("@executable_path/libz.dylib", &referrer(None), &opts)
            .expect("expand");
        assert!(resolved.ends_with("libz.dylib"));
        assert!(resolved.is_absolute());
    }

    #[test]
    fn executable_path_token_requires_the_option() {
        let err = expand_path(
            "@executable_path/libz.dylib",
            &referrer(None),
            &DependencyOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::NoExecutablePath(_)));
    }

    #[test]
    fn expands_loader_path_against_the_referrer() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("libz.dylib"), b"x").expect("write");
        let parent = referrer(Some(dir.path().join("libparent.dylib")));

        let resolved = expand_path(
            "@loader_path/libz.dylib",
            &parent,
            &DependencyOptions::default(),
        )
        .expect("expand");
        assert_eq!(
            resolved,
            resolve_abs_path(&dir.path().join("libz.dylib")).expect("resolve")
        );
    }

    #[test]
    fn loader_path_through_an_unanchored_referrer_is_unsupported() {
        // The referrer's own path is still a loader token, so there is no
        // directory to anchor against.
        let err = expand_path(
            "@loader_path/libz.dylib",
            &referrer(None),
            &DependencyOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnsupportedToken(_)));
    }

    #[test]
    fn unknown_tokens_are_unsupported() {
        let err = expand_path(
            "@rpath/libz.dylib",
            &referrer(None),
            &DependencyOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnsupportedToken(_)));
    }

    #[test]
    fn plain_paths_pass_through_to_resolution() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lib = dir.path().join("libz.dylib");
        std::fs::write(&lib, b"x").expect("write");

        let resolved = expand_path(
            &lib.display().to_string(),
            &referrer(None),
            &DependencyOptions::default(),
        )
        .expect("expand");
        assert_eq!(resolved, resolve_abs_path(&lib).expect("resolve"));
    }

    #[test]
    fn relative_paths_descend_and_climb() {
        assert_eq!(
            relative_to(Path::new("/a/b/c/lib.dylib"), Path::new("/a/b/c")),
            Some(PathBuf::from("lib.dylib"))
        );
        assert_eq!(
            relative_to(Path::new("/a/marker.txt"), Path::new("/a/b/c")),
            Some(PathBuf::from("../../marker.txt"))
        );
        assert_eq!(
            relative_to(Path::new("/bin/foo"), Path::new("/lib/site")),
            Some(PathBuf::from("../../bin/foo"))
        );
        assert_eq!(relative_to(Path::new("relative"), Path::new("/abs")), None);
    }

    #[test]
    fn basename_takes_the_final_component() {
        assert_eq!(basename("/usr/lib/libz.dylib"), "libz.dylib");
        assert_eq!(basename("@rpath/libz.dylib"), "libz.dylib");
        assert_eq!(basename("libz.dylib"), "libz.dylib");
    }
}
