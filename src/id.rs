//! Ticket id generation.
//!
//! Ids look like `<prefix>-<4 hex chars>`. The prefix comes from the project
//! directory name (the git root when there is one): the first letter of each
//! `-`/`_` separated part, or the first three characters of a name without
//! separators. `my-project` gives `mp`, `kticket` gives `kti`.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Prefix used when the project name yields nothing usable.
pub const FALLBACK_PREFIX: &str = "kt";

/// Number of hex characters in the random suffix.
pub const SUFFIX_LEN: usize = 4;

/// Generate an id for a ticket in the project containing the current directory.
pub fn generate_id_from_cwd() -> Result<String> {
    let cwd = std::env::current_dir().map_err(|e| Error::io("get current dir", ".", e))?;
    Ok(generate_id_in(&cwd))
}

/// Generate an id whose prefix is derived from the project containing `dir`.
pub fn generate_id_in(dir: &Path) -> String {
    generate_id(&extract_prefix(&project_name(dir)))
}

/// Generate `<prefix>-<suffix>`, the suffix hashed from the process id and
/// the current time in nanoseconds.
pub fn generate_id(prefix: &str) -> String {
    let prefix = if prefix.is_empty() {
        FALLBACK_PREFIX
    } else {
        prefix
    };

    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0);
    let mut hasher = Sha256::new();
    hasher.update(format!("{}{}", std::process::id(), nanos).as_bytes());
    let hash_hex = format!("{:x}", hasher.finalize());

    format!("{}-{}", prefix, &hash_hex[..SUFFIX_LEN])
}

/// Derive a short prefix from a project name. Leading dots are ignored so a
/// hidden directory never yields a hidden ticket file.
pub fn extract_prefix(name: &str) -> String {
    let name = name.trim_start_matches('.');
    let parts: Vec<&str> = name.split(['-', '_']).collect();
    if parts.len() == 1 {
        return name.chars().take(3).collect();
    }
    parts.iter().filter_map(|p| p.chars().next()).collect()
}

/// Name of the project containing `dir`: the git root's directory name if
/// `dir` is inside a repository, otherwise `dir`'s own name.
pub fn project_name(dir: &Path) -> String {
    let root = find_git_root(dir).unwrap_or_else(|| dir.to_path_buf());
    root.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Walk up from `start` looking for a directory containing `.git`.
pub fn find_git_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(".git").is_dir())
        .map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_extract_prefix() {
        let cases = [
            ("my-project", "mp"),
            ("kticket", "kti"),
            ("kt", "kt"),
            ("a", "a"),
            ("foo-bar-baz", "fbb"),
            ("some_thing", "st"),
            ("mix-of_both", "mob"),
            ("verylongname", "ver"),
            ("double--dash", "dd"),
            ("", ""),
            (".hidden", "hid"),
            (".tmpA1b2c3", "tmp"),
        ];
        for (input, expected) in cases {
            assert_eq!(extract_prefix(input), expected, "input {input:?}");
        }
    }

    #[test]
    fn test_generate_id_format() {
        let id = generate_id("kt");
        assert!(id.starts_with("kt-"));
        assert_eq!(id.len(), 3 + SUFFIX_LEN);
        assert!(id[3..].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_generate_id_empty_prefix_falls_back() {
        assert!(generate_id("").starts_with("kt-"));
    }

    #[test]
    fn test_generate_id_uniqueness() {
        let id1 = generate_id("kt");
        std::thread::sleep(std::time::Duration::from_millis(1));
        let id2 = generate_id("kt");
        // Different with high probability
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_find_git_root_from_subdir() {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("foo-bar");
        let sub = repo.join("src").join("deep");
        fs::create_dir_all(repo.join(".git")).unwrap();
        fs::create_dir_all(&sub).unwrap();

        assert_eq!(find_git_root(&sub).unwrap(), repo);
        assert_eq!(project_name(&sub), "foo-bar");
        assert!(generate_id_in(&sub).starts_with("fb-"));
    }

    #[test]
    fn test_git_file_is_not_a_root() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("worktree");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(".git"), "gitdir: elsewhere").unwrap();

        assert_ne!(find_git_root(&dir), Some(dir.clone()));
    }

    #[test]
    fn test_project_name_without_repo() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("sandbox");
        fs::create_dir_all(&dir).unwrap();

        if find_git_root(&dir).is_none() {
            assert_eq!(project_name(&dir), "sandbox");
            assert!(generate_id_in(&dir).starts_with("san-"));
        }
    }
}
