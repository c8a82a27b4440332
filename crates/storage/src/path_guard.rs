//! Lexical sandbox checks shared by every storage backend.
//!
//! Containment is decided on normalized absolute paths only. Nothing here
//! touches the filesystem, so the same rules hold for key namespaces that
//! have no real directories or symlinks.

use std::path::{Component, Path, PathBuf};

/// Returns `true` when `target` resolves inside `root` (or is `root` itself).
///
/// Both paths are made absolute against the current working directory and
/// normalized lexically before comparison. A target whose relative path from
/// the root would start with `..` is rejected.
pub fn is_contained(root: &Path, target: &Path) -> bool {
    let (Some(root), Some(target)) = (absolute(root), absolute(target)) else {
        return false;
    };
    target.starts_with(&root)
}

/// Makes `path` absolute and removes `.` and `..` components lexically.
///
/// Returns `None` only when the working directory cannot be determined for a
/// relative input.
pub fn absolute(path: &Path) -> Option<PathBuf> {
    if path.is_absolute() {
        Some(normalize(path))
    } else {
        let cwd = std::env::current_dir().ok()?;
        Some(normalize(&cwd.join(path)))
    }
}

/// Lexical normalization. `..` never climbs above the filesystem root.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                // pop() refuses to remove the root component
                if !out.pop() && !out.has_root() {
                    out.push("..");
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

/// Strips leading separators so a request path always joins *under* a root.
///
/// `Path::join` replaces the base when handed an absolute path, which would
/// turn `/etc/passwd` into an escape instead of `<root>/etc/passwd`.
pub fn relative_request(path: &str) -> &Path {
    Path::new(path.trim_start_matches(['/', '\\']))
}

/// `true` when any segment of a `/` or `\` separated path is `..`.
pub fn has_parent_segment(path: &str) -> bool {
    path.split(['/', '\\']).any(|segment| segment == "..")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn root_contains_itself() {
        assert!(is_contained(Path::new("/srv/data"), Path::new("/srv/data")));
        assert!(is_contained(Path::new("/srv/data"), Path::new("/srv/data/.")));
    }

    #[test]
    fn nested_paths_are_contained() {
        let root = Path::new("/srv/data");
        assert!(is_contained(root, Path::new("/srv/data/a/b.txt")));
        assert!(is_contained(root, Path::new("/srv/data/a/../b.txt")));
    }

    #[test]
    fn traversal_is_rejected() {
        let root = Path::new("/srv/data");
        assert!(!is_contained(root, Path::new("/srv/data/../etc/passwd")));
        assert!(!is_contained(root, Path::new("/srv/data/a/../../x")));
        assert!(!is_contained(root, Path::new("/srv")));
    }

    #[test]
    fn sibling_with_shared_prefix_is_rejected() {
        assert!(!is_contained(
            Path::new("/srv/data"),
            Path::new("/srv/data2/file")
        ));
    }

    #[test]
    fn relative_paths_resolve_against_cwd() {
        assert!(is_contained(Path::new("storage"), Path::new("storage/2")));
        assert!(!is_contained(Path::new("storage"), Path::new("storage/../x")));
    }

    #[test]
    fn normalize_stops_at_filesystem_root() {
        assert_eq!(normalize(Path::new("/../../etc")), PathBuf::from("/etc"));
        assert_eq!(normalize(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
    }

    #[test]
    fn request_paths_lose_leading_separators() {
        assert_eq!(relative_request("/a/b"), Path::new("a/b"));
        assert_eq!(relative_request("//a"), Path::new("a"));
        assert_eq!(relative_request(""), Path::new(""));
    }

    #[test]
    fn parent_segments_are_detected() {
        assert!(has_parent_segment("../x"));
        assert!(has_parent_segment("a\\..\\b"));
        assert!(!has_parent_segment("a/..b/c"));
        assert!(!has_parent_segment("a/b"));
    }

    fn segment() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("..".to_string()),
            Just(".".to_string()),
            "[a-m]{1,6}",
        ]
    }

    proptest! {
        #[test]
        fn containment_matches_lexical_depth(segments in prop::collection::vec(segment(), 0..8)) {
            let root = Path::new("/sandbox/root");
            let mut depth: i64 = 0;
            let mut escaped = false;
            for seg in &segments {
                match seg.as_str() {
                    "." => {}
                    ".." => depth -= 1,
                    _ => depth += 1,
                }
                if depth < 0 {
                    escaped = true;
                    break;
                }
            }

            let target = root.join(segments.join("/"));
            // names are drawn from a-m, so an escaped walk can never spell
            // its way back into "/sandbox/root"
            prop_assert_eq!(is_contained(root, &target), !escaped);
        }
    }
}
