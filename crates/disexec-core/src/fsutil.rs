use crate::error::Result;
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

pub fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Replaces `path` with `bytes` via a synced temp file in the same
/// directory; readers see the old contents or the new, never a mix.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    ensure_dir(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Replace every character outside `[A-Za-z0-9._-]` so the result is usable
/// as a single path component.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "._-".contains(c) {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_creates_parents_and_leaves_no_temp_files() {
        let root = tempfile::tempdir().expect("tempdir");
        let target = root.path().join("a").join("b").join("out.txt");
        atomic_write_bytes(&target, b"hello").expect("write");
        assert_eq!(fs::read_to_string(&target).expect("read"), "hello");
        let leftovers = fs::read_dir(target.parent().unwrap())
            .expect("list")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .count();
        assert_eq!(leftovers, 0);

        atomic_write_bytes(&target, b"again").expect("overwrite");
        assert_eq!(fs::read_to_string(&target).expect("read"), "again");
    }

    #[test]
    fn sanitize_file_name_replaces_separators_and_wildcards() {
        assert_eq!(sanitize_file_name("run_.*/x"), "run_.__x");
        assert_eq!(sanitize_file_name(".."), "_");
        assert_eq!(sanitize_file_name("ok-name_1.txt"), "ok-name_1.txt");
    }
}
