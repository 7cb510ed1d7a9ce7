//! Path helpers shared by every storage backend.
//!
//! Paths are plain `/`-separated strings rather than `std::path::Path` so that
//! document-tree and service backends can use the same representation as the
//! direct filesystem backend.

fn is_separator(c: char) -> bool {
    c == '/' || c == '\\'
}

/// Unifies separators, collapses repeated separators, drops `.` segments and
/// resolves `..` against a preceding named segment. Trailing separators are
/// removed. The result is stable: `normalize(normalize(p)) == normalize(p)`.
pub fn normalize(path: &str) -> String {
    let absolute = path.starts_with(is_separator);
    let mut segments: Vec<&str> = Vec::new();

    for segment in path.split(is_separator) {
        match segment {
            "" | "." => {}
            ".." => match segments.last() {
                Some(last) if *last != ".." => {
                    segments.pop();
                }
                _ => segments.push(".."),
            },
            other => segments.push(other),
        }
    }

    let joined = segments.join("/");
    if absolute {
        format!("/{joined}")
    } else {
        joined
    }
}

/// Case-insensitive equality of two normalized paths.
pub fn path_equal(a: &str, b: &str) -> bool {
    equals_ignore_case(&normalize(a), &normalize(b))
}

/// Joins `parts` onto `base` with single separators and normalizes the result.
pub fn combine(base: &str, parts: &[&str]) -> String {
    let mut combined = base.to_string();
    for part in parts.iter().filter(|part| !part.is_empty()) {
        if !combined.is_empty()
            && !combined.ends_with(is_separator)
            && !part.starts_with(is_separator)
        {
            combined.push('/');
        }
        combined.push_str(part);
    }
    normalize(&combined)
}

/// Parent of a path. `"/a"` yields `"/"` and a bare name yields `""`.
pub fn parent(path: &str) -> String {
    let normalized = normalize(path);
    match normalized.rfind('/') {
        Some(0) => "/".to_string(),
        Some(index) => normalized[..index].to_string(),
        None => String::new(),
    }
}

/// Last segment of a path.
pub fn name(path: &str) -> String {
    let normalized = normalize(path);
    match normalized.rfind('/') {
        Some(index) => normalized[index + 1..].to_string(),
        None => normalized,
    }
}

pub fn equals_ignore_case(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

pub fn starts_with_ignore_case(value: &str, prefix: &str) -> bool {
    value.to_lowercase().starts_with(&prefix.to_lowercase())
}

/// True when `path` is `root` itself or lies somewhere below it.
pub fn is_under(root: &str, path: &str) -> bool {
    relative_to(root, path).is_some()
}

/// The part of `path` below `root`, compared case-insensitively.
/// Returns `Some("")` when both name the same location.
pub fn relative_to(root: &str, path: &str) -> Option<String> {
    let root = normalize(root);
    let path = normalize(path);

    // Walk both by char so the remainder is sliced at a boundary of `path`
    // itself, whatever the lowercase forms' lengths.
    let mut path_chars = path.char_indices();
    for expected in root.chars() {
        let (_, actual) = path_chars.next()?;
        if !expected.to_lowercase().eq(actual.to_lowercase()) {
            return None;
        }
    }
    let rest = path_chars.next().map_or("", |(index, _)| &path[index..]);

    if rest.is_empty() || root.ends_with('/') {
        Some(rest.to_string())
    } else {
        rest.strip_prefix('/').map(str::to_string)
    }
}

/// Whether `name` can be used as a single file or directory name on every
/// backend.
pub fn is_name_valid(name: &str) -> bool {
    const RESERVED: &[char] = &['/', '\\', '\0', '"', '*', ':', '<', '>', '?', '|'];

    !name.is_empty() && name != "." && name != ".." && !name.contains(RESERVED)
}
