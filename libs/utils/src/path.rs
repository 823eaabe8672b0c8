//! Storage-key and user-path handling.
//!
//! All user-facing paths are relative, slash-separated UTF-8 strings. The
//! object store itself is flat: "directories" only exist as key prefixes, so
//! everything here is string algebra over `/`-separated segments.

const SEPARATOR: char = '/';

/// Trim leading/trailing separators and collapse empty segments.
///
/// `"/a//b/"` becomes `"a/b"`. The empty string (the owner root) stays empty.
pub fn normalize_dir(path: &str) -> String {
    path.split(SEPARATOR)
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Join path parts into a single key, normalizing each part on the way.
/// Empty parts vanish rather than producing `//`.
pub fn join_key<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::new();
    for part in parts {
        let normalized = normalize_dir(part.as_ref());
        if normalized.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push(SEPARATOR);
        }
        out.push_str(&normalized);
    }
    out
}

/// Build an absolute storage key under an owner prefix.
pub fn owner_key<I, S>(owner: &str, parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let tail = join_key(parts);
    if tail.is_empty() {
        owner.to_string()
    } else {
        format!("{owner}/{tail}")
    }
}

/// Last path segment, i.e. the object or directory name.
pub fn file_name(key: &str) -> &str {
    key.trim_end_matches(SEPARATOR)
        .rsplit(SEPARATOR)
        .next()
        .unwrap_or(key)
}

/// Suffix after the last `.` of the file name, lowercased. `"a/b.TAR"` -> `tar`.
pub fn extension(key: &str) -> Option<String> {
    let name = file_name(key);
    let idx = name.rfind('.')?;
    if idx == 0 || idx + 1 == name.len() {
        return None;
    }
    Some(name[idx + 1..].to_ascii_lowercase())
}

/// Parent directory of a path, `None` at the owner root.
pub fn parent_dir(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches(SEPARATOR);
    let idx = trimmed.rfind(SEPARATOR)?;
    Some(&trimmed[..idx])
}

/// All enclosing directories of `path`, nearest first: `"a/b/c"` yields
/// `"a/b"`, `"a"`.
pub fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    std::iter::successors(parent_dir(path), |p| parent_dir(p))
}

/// A leaf name used in rename/create must be a single non-empty segment.
pub fn is_valid_leaf_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(SEPARATOR) && name != "." && name != ".."
}

/// Normalize a path found inside an archive into a safe relative key.
///
/// Windows-style separators are folded to `/`. Entries that are absolute,
/// carry a drive prefix, contain `..` segments, or normalize to nothing are
/// rejected with `None` and must be skipped by the caller.
pub fn normalize_archive_entry_path(raw: &str) -> Option<String> {
    let forward = raw.replace('\\', "/");
    if forward.starts_with('/') {
        return None;
    }
    // "C:/evil" and friends
    if forward.len() >= 2 && forward.as_bytes()[1] == b':' {
        return None;
    }
    let mut segments = Vec::new();
    for segment in forward.split(SEPARATOR) {
        match segment {
            "" | "." => continue,
            ".." => return None,
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        return None;
    }
    Some(segments.join("/"))
}

/// Where an archive's contents land after extraction: the archive's own key
/// with the format extension stripped, so `docs/photos.tar.gz` extracts
/// under `docs/photos/`.
pub fn archive_extract_prefix(archive_key: &str, format_extensions: &[&str]) -> String {
    let normalized = normalize_dir(archive_key);
    let lower = normalized.to_ascii_lowercase();
    for ext in format_extensions {
        let suffix = format!(".{ext}");
        if lower.ends_with(&suffix) && normalized.len() > suffix.len() {
            return normalized[..normalized.len() - suffix.len()].to_string();
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_separators() {
        assert_eq!(normalize_dir("/a/b/"), "a/b");
        assert_eq!(normalize_dir("a//b"), "a/b");
        assert_eq!(normalize_dir("///"), "");
        assert_eq!(normalize_dir(""), "");
    }

    #[test]
    fn join_skips_empty_parts() {
        assert_eq!(join_key(["a", "", "b/c/"]), "a/b/c");
        assert_eq!(join_key(Vec::<&str>::new()), "");
    }

    #[test]
    fn owner_key_prefixes() {
        assert_eq!(owner_key("u1", ["docs", "x.txt"]), "u1/docs/x.txt");
        assert_eq!(owner_key("team/t9", [""; 0]), "team/t9");
    }

    #[test]
    fn names_and_extensions() {
        assert_eq!(file_name("a/b/c.txt"), "c.txt");
        assert_eq!(file_name("a/b/"), "b");
        assert_eq!(extension("a/b/c.TXT"), Some("txt".to_string()));
        assert_eq!(extension("a/b/noext"), None);
        assert_eq!(extension("a/.hidden"), None);
    }

    #[test]
    fn ancestors_nearest_first() {
        let all: Vec<_> = ancestors("a/b/c").collect();
        assert_eq!(all, vec!["a/b", "a"]);
        assert_eq!(ancestors("a").count(), 0);
    }

    #[test]
    fn archive_entry_paths_are_sanitized() {
        assert_eq!(
            normalize_archive_entry_path("dir/file.txt"),
            Some("dir/file.txt".to_string())
        );
        assert_eq!(
            normalize_archive_entry_path("dir\\sub\\file.txt"),
            Some("dir/sub/file.txt".to_string())
        );
        assert_eq!(
            normalize_archive_entry_path("./a/./b"),
            Some("a/b".to_string())
        );
        assert_eq!(normalize_archive_entry_path("../evil.txt"), None);
        assert_eq!(normalize_archive_entry_path("a/../../evil"), None);
        assert_eq!(normalize_archive_entry_path("/etc/passwd"), None);
        assert_eq!(normalize_archive_entry_path("C:\\windows"), None);
        assert_eq!(normalize_archive_entry_path(""), None);
        assert_eq!(normalize_archive_entry_path("."), None);
    }

    #[test]
    fn extract_prefix_strips_format_extension() {
        assert_eq!(
            archive_extract_prefix("docs/photos.tar.gz", &["tar.gz", "tgz"]),
            "docs/photos"
        );
        assert_eq!(archive_extract_prefix("a/b.zip", &["zip"]), "a/b");
        // Unknown extension stays as-is rather than truncating blindly.
        assert_eq!(archive_extract_prefix("a/b.bin", &["zip"]), "a/b.bin");
    }
}
