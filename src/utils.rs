//! Path and filename helpers.

use std::path::{Path, PathBuf};

/// Characters never allowed in output filenames
const BAD_CHARS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|', '\0'];

/// Replace filesystem-hostile characters and trim the result.
///
/// An empty or fully-stripped name falls back to `_`.
pub fn make_valid_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if BAD_CHARS.contains(&c) || (c as u32) < 0x20 { '_' } else { c })
        .collect();
    let trimmed = cleaned.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

/// First non-existing variant of `path`: the path itself, then
/// `name.1.ext`, `name.2.ext`, …
pub fn unique_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }

    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("file");
    let ext = path.extension().and_then(|s| s.to_str());
    let parent = path.parent().unwrap_or_else(|| Path::new(""));

    for n in 1u32.. {
        let candidate = match ext {
            Some(ext) => parent.join(format!("{stem}.{n}.{ext}")),
            None => parent.join(format!("{stem}.{n}")),
        };
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!("u32 counter exhausted probing unique names")
}

/// Base filename of a path as UTF-8, empty on failure
pub fn base_file_name(path: &Path) -> &str {
    path.file_name().and_then(|n| n.to_str()).unwrap_or("")
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostile_characters_are_replaced() {
        assert_eq!(make_valid_filename("a/b\\c:d*e"), "a_b_c_d_e");
        assert_eq!(make_valid_filename("movie?.mkv"), "movie_.mkv");
        assert_eq!(make_valid_filename("ok-name_2024.bin"), "ok-name_2024.bin");
    }

    #[test]
    fn control_characters_are_replaced() {
        assert_eq!(make_valid_filename("a\x01b\x1fc"), "a_b_c");
    }

    #[test]
    fn trailing_dots_and_spaces_are_trimmed() {
        assert_eq!(make_valid_filename("name... "), "name");
        assert_eq!(make_valid_filename("  padded  "), "padded");
    }

    #[test]
    fn degenerate_names_fall_back_to_underscore() {
        assert_eq!(make_valid_filename(""), "_");
        assert_eq!(make_valid_filename("..."), "_");
    }

    #[test]
    fn unique_path_probes_numbered_variants() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.txt");

        assert_eq!(unique_path(&path), path);

        std::fs::write(&path, b"x").unwrap();
        assert_eq!(unique_path(&path), dir.path().join("file.1.txt"));

        std::fs::write(dir.path().join("file.1.txt"), b"x").unwrap();
        assert_eq!(unique_path(&path), dir.path().join("file.2.txt"));
    }

    #[test]
    fn unique_path_without_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        std::fs::write(&path, b"x").unwrap();
        assert_eq!(unique_path(&path), dir.path().join("file.1"));
    }
}
