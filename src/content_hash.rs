//! Deterministic content fingerprint of a source tree.
//!
//! The fingerprint covers `(relative path, file content)` pairs only. File
//! metadata, modification times and directory enumeration order never
//! affect it, so it can key an image cache across machines and checkouts.
//!
//! Algorithm:
//! 1. walk `dir`, skipping anything under an excluded relative prefix
//! 2. sha256 each regular file
//! 3. sort `(path, digest)` by path
//! 4. sha256 the `"<digest>  <path>\n"` lines and keep the first
//!    [`FINGERPRINT_LEN`] hex characters
//!
//! Truncation to 8 hex characters leaves a real collision probability for
//! very large or very long-lived caches; it is kept short because it is
//! embedded in image tags.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::BootstrapError;

pub const FINGERPRINT_LEN: usize = 8;

/// Fingerprint `dir`, ignoring files under any of `excluded`.
///
/// Exclusions are paths relative to `dir` and match whole components:
/// `node_modules` excludes `node_modules/**` but not `node_modules.lock`.
pub fn fingerprint_dir(dir: &Path, excluded: &[PathBuf]) -> Result<String> {
    if !dir.is_dir() {
        return Err(BootstrapError::DirectoryNotFound(dir.to_path_buf()).into());
    }

    let excluded: Vec<PathBuf> = excluded.iter().map(|p| normalize_relative(p)).collect();
    let mut entries = collect_file_digests(dir, &excluded)?;
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha256::new();
    for (path, digest) in &entries {
        hasher.update(digest.as_bytes());
        hasher.update(b"  ");
        hasher.update(path.as_bytes());
        hasher.update(b"\n");
    }
    let full = format!("{:x}", hasher.finalize());
    Ok(full[..FINGERPRINT_LEN].to_string())
}

fn collect_file_digests(dir: &Path, excluded: &[PathBuf]) -> Result<Vec<(String, String)>> {
    let mut entries = Vec::new();
    let walker = WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            let rel = entry.path().strip_prefix(dir).unwrap_or(entry.path());
            !is_excluded(rel, excluded)
        });

    for entry in walker {
        let entry = entry.with_context(|| format!("walking source tree '{}'", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .with_context(|| format!("relativizing '{}'", entry.path().display()))?;
        let digest = sha256_file(entry.path())?;
        entries.push((slash_path(rel), digest));
    }
    Ok(entries)
}

fn is_excluded(rel: &Path, excluded: &[PathBuf]) -> bool {
    if rel.as_os_str().is_empty() {
        return false;
    }
    excluded
        .iter()
        .any(|prefix| !prefix.as_os_str().is_empty() && rel.starts_with(prefix))
}

/// Drop `.` components and trailing separators so `./dist/` matches `dist`.
fn normalize_relative(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

fn slash_path(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn sha256_file(path: &Path) -> Result<String> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = r
            .read(&mut buf)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn tree(files: &[(&str, &str)]) -> TempDir {
        let temp = TempDir::new().unwrap();
        for (path, content) in files {
            let full = temp.path().join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
        }
        temp
    }

    #[test]
    fn test_fingerprint_is_short_hex() {
        let t = tree(&[("a.txt", "x")]);
        let fp = fingerprint_dir(t.path(), &[]).unwrap();
        assert_eq!(fp.len(), FINGERPRINT_LEN);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_equal_trees_hash_equal() {
        // Created in opposite order so directory enumeration differs.
        let one = tree(&[("a.txt", "x"), ("sub/b.txt", "y")]);
        let two = tree(&[("sub/b.txt", "y"), ("a.txt", "x")]);
        assert_eq!(
            fingerprint_dir(one.path(), &[]).unwrap(),
            fingerprint_dir(two.path(), &[]).unwrap()
        );
    }

    #[test]
    fn test_rename_changes_hash() {
        let one = tree(&[("a.txt", "x")]);
        let two = tree(&[("b.txt", "x")]);
        assert_ne!(
            fingerprint_dir(one.path(), &[]).unwrap(),
            fingerprint_dir(two.path(), &[]).unwrap()
        );
    }

    #[test]
    fn test_exclusion_matches_whole_components() {
        let t = tree(&[("a.txt", "x"), ("dist/out.js", "1")]);
        let excluded = vec![PathBuf::from("./dist/")];
        let before = fingerprint_dir(t.path(), &excluded).unwrap();

        fs::write(t.path().join("dist/out.js"), "2").unwrap();
        assert_eq!(before, fingerprint_dir(t.path(), &excluded).unwrap());

        fs::write(t.path().join("dist.txt"), "not excluded").unwrap();
        assert_ne!(before, fingerprint_dir(t.path(), &excluded).unwrap());
    }

    #[test]
    fn test_nested_exclusion() {
        let t = tree(&[("a.txt", "x"), ("web/node_modules/m.js", "1")]);
        let excluded = vec![PathBuf::from("web/node_modules")];
        let before = fingerprint_dir(t.path(), &excluded).unwrap();
        fs::write(t.path().join("web/node_modules/n.js"), "2").unwrap();
        assert_eq!(before, fingerprint_dir(t.path(), &excluded).unwrap());
    }

    #[test]
    fn test_empty_dirs_do_not_matter() {
        let t = tree(&[("a.txt", "x")]);
        let before = fingerprint_dir(t.path(), &[]).unwrap();
        fs::create_dir_all(t.path().join("empty/nested")).unwrap();
        assert_eq!(before, fingerprint_dir(t.path(), &[]).unwrap());
    }

    #[test]
    fn test_missing_dir_is_directory_not_found() {
        let err = fingerprint_dir(Path::new("/definitely/not/here"), &[]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BootstrapError>(),
            Some(BootstrapError::DirectoryNotFound(_))
        ));
    }
}
