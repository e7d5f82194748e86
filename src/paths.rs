use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Returns the user's home directory. HOME wins so tests and hook
/// environments can redirect storage; `dirs` covers platforms without it.
pub fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .ok()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns `~/.rewind`.
pub fn global_rewind_dir() -> PathBuf {
    home_dir().join(".rewind")
}

/// Returns `~/.rewind/storage`.
pub fn global_storage_dir() -> PathBuf {
    global_rewind_dir().join("storage")
}

/// Returns `<project_root>/.agent/rewind`.
pub fn project_rewind_dir(project_root: &Path) -> PathBuf {
    project_root.join(".agent").join("rewind")
}

/// Short hash of the absolute project path, used to key global storage.
/// First 12 hex chars of SHA-256(abs(project_root)).
pub fn project_hash(project_root: &Path) -> String {
    let canon = std::fs::canonicalize(project_root)
        .unwrap_or_else(|_| project_root.to_path_buf());
    let mut hasher = Sha256::new();
    hasher.update(canon.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..12].to_string()
}

pub fn shorten_home(path: &str) -> String {
    let h = home_dir();
    let h_str = h.to_string_lossy();
    if !h_str.is_empty() && path.starts_with(h_str.as_ref()) {
        format!("~{}", &path[h_str.len()..])
    } else {
        path.to_string()
    }
}

/// Expand a leading `~/` against the home directory.
pub fn expand_user(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        return home_dir().join(rest);
    }
    if path == "~" {
        return home_dir();
    }
    PathBuf::from(path)
}

/// Walk upward from `start` to find a directory containing `.git`.
pub fn find_git_root(start: &Path) -> Option<PathBuf> {
    let mut cur = std::fs::canonicalize(start).unwrap_or_else(|_| start.to_path_buf());
    for _ in 0..25 {
        if cur.join(".git").exists() {
            return Some(cur);
        }
        match cur.parent() {
            Some(parent) => cur = parent.to_path_buf(),
            None => return None,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_hash_is_12_hex_chars() {
        let h = project_hash(Path::new("/tmp"));
        assert_eq!(h.len(), 12);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn project_hash_is_stable() {
        let a = project_hash(Path::new("/tmp"));
        let b = project_hash(Path::new("/tmp"));
        assert_eq!(a, b);
    }

    #[test]
    fn expand_user_passes_absolute_paths() {
        assert_eq!(expand_user("/a/b"), PathBuf::from("/a/b"));
    }

    #[test]
    fn expand_user_resolves_tilde() {
        let p = expand_user("~/x");
        assert!(p.ends_with("x"));
        assert!(!p.to_string_lossy().contains('~'));
    }

    #[test]
    fn find_git_root_walks_up() {
        let dir = tempfile::tempdir().expect("temp dir");
        let root = dir.path().join("repo");
        let nested = root.join("a/b");
        std::fs::create_dir_all(&nested).expect("mkdir");
        std::fs::create_dir_all(root.join(".git")).expect("mkdir .git");

        let found = find_git_root(&nested).expect("git root");
        let canon_root = std::fs::canonicalize(&root).expect("canon");
        assert_eq!(found, canon_root);
    }

    #[test]
    fn find_git_root_none_without_repo() {
        let dir = tempfile::tempdir().expect("temp dir");
        assert!(find_git_root(dir.path()).is_none());
    }
}
