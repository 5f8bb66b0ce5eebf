use crate::config::FilesystemConfig;

/// Lexically clean a path: collapse repeated separators, drop `.` segments
/// and resolve `..` without touching the filesystem.
fn lexical_clean(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    let joined = segments.join("/");
    if absolute {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Normalize a virtual/agent path to an absolute sandbox path.
///
/// `""`, `"."` and `"/"` map to the working directory; paths already under an
/// allowed directory pass through; other absolute paths are treated as
/// virtual and mapped under the working directory; relative paths are joined
/// to it.
pub fn normalize_path(fs: &FilesystemConfig, path: &str) -> String {
    let work_dir = &fs.working_directory;
    let path = path.trim();

    if path.is_empty() || path == "." || path == "/" {
        return work_dir.clone();
    }

    for allowed in &fs.allowed_directories {
        if path.starts_with(allowed.as_str()) {
            return lexical_clean(path);
        }
    }

    if path.starts_with('/') {
        return lexical_clean(&format!("{work_dir}{path}"));
    }

    lexical_clean(&format!("{work_dir}/{path}"))
}

/// Convert a real sandbox path back into the virtual form handed to the
/// agent: the working-directory prefix is stripped, anything else is
/// returned unchanged.
pub fn virtualize_path(fs: &FilesystemConfig, path: &str) -> String {
    let work_dir = &fs.working_directory;

    if let Some(stripped) = path.strip_prefix(&format!("{work_dir}/")) {
        return format!("/{stripped}");
    }
    if path == work_dir {
        return "/".to_string();
    }
    path.to_string()
}

/// Allow-list check with deny-list override.
pub fn validate_path(fs: &FilesystemConfig, path: &str) -> bool {
    if !fs.enable_path_validation {
        return true;
    }

    let normalized = normalize_path(fs, path);

    for denied in &fs.denied_directories {
        if normalized == *denied || normalized.starts_with(&format!("{denied}/")) {
            return false;
        }
    }

    for allowed in &fs.allowed_directories {
        if normalized == *allowed || normalized.starts_with(&format!("{allowed}/")) {
            return true;
        }
    }

    tracing::warn!(%path, %normalized, "path validation failed");
    false
}

/// Allow-list-only check for explicit user-initiated inspection, where denied
/// directories stay hidden by default but remain reachable on request.
pub fn validate_path_allow_denied(fs: &FilesystemConfig, path: &str) -> bool {
    let normalized = normalize_search_path(fs, path);
    fs.allowed_directories
        .iter()
        .any(|allowed| normalized == *allowed || normalized.starts_with(&format!("{allowed}/")))
}

/// Normalize a search root for glob/grep: `.` and relative paths resolve
/// against the working directory, absolute paths pass through.
pub fn normalize_search_path(fs: &FilesystemConfig, path: &str) -> String {
    if path == "." {
        return fs.working_directory.clone();
    }
    if !path.starts_with('/') {
        return format!("{}/{path}", fs.working_directory);
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs() -> FilesystemConfig {
        FilesystemConfig {
            working_directory: "/home/sandbox".into(),
            allowed_directories: vec!["/home/sandbox".into(), "/tmp".into()],
            denied_directories: vec!["/home/sandbox/_internal".into()],
            enable_path_validation: true,
        }
    }

    #[test]
    fn root_like_inputs_map_to_working_directory() {
        let fs = fs();
        assert_eq!(normalize_path(&fs, ""), "/home/sandbox");
        assert_eq!(normalize_path(&fs, "."), "/home/sandbox");
        assert_eq!(normalize_path(&fs, "/"), "/home/sandbox");
    }

    #[test]
    fn virtual_and_relative_paths_land_under_the_working_directory() {
        let fs = fs();
        assert_eq!(
            normalize_path(&fs, "/results/report.csv"),
            "/home/sandbox/results/report.csv"
        );
        assert_eq!(
            normalize_path(&fs, "data/input.json"),
            "/home/sandbox/data/input.json"
        );
        // Allowed external prefixes pass through untouched.
        assert_eq!(normalize_path(&fs, "/tmp/scratch.txt"), "/tmp/scratch.txt");
    }

    #[test]
    fn virtualize_strips_the_working_directory_prefix() {
        let fs = fs();
        assert_eq!(
            virtualize_path(&fs, "/home/sandbox/results/report.csv"),
            "/results/report.csv"
        );
        assert_eq!(virtualize_path(&fs, "/home/sandbox"), "/");
        assert_eq!(virtualize_path(&fs, "/tmp/scratch.txt"), "/tmp/scratch.txt");
    }

    #[test]
    fn normalize_virtualize_round_trip_is_stable() {
        let fs = fs();
        for path in ["/results/a.txt", "data/b.csv", "/tmp/c.log", "."] {
            if !validate_path(&fs, path) {
                continue;
            }
            let normalized = normalize_path(&fs, path);
            let virtual_once = virtualize_path(&fs, &normalized);
            // Re-applying the pair changes nothing further.
            let normalized_again = normalize_path(&fs, &virtual_once);
            assert_eq!(normalized, normalized_again, "unstable for {path}");
            assert_eq!(virtual_once, virtualize_path(&fs, &normalized_again));
        }
    }

    #[test]
    fn deny_list_overrides_allow_list() {
        let fs = fs();
        assert!(!validate_path(&fs, "/home/sandbox/_internal/secrets.py"));
        assert!(!validate_path(&fs, "/_internal/secrets.py"));
        assert!(validate_path(&fs, "/results/out.txt"));
        // Virtual absolute paths are mapped under the working directory, so
        // they validate as workspace-local files rather than host paths.
        assert!(validate_path(&fs, "/etc/passwd"));
        // The inspection mode checks the allow list only.
        assert!(validate_path_allow_denied(
            &fs,
            "/home/sandbox/_internal/secrets.py"
        ));
        assert!(!validate_path_allow_denied(&fs, "/etc/passwd"));
    }

    #[test]
    fn validation_can_be_disabled() {
        let mut fs = fs();
        fs.enable_path_validation = false;
        assert!(validate_path(&fs, "/etc/passwd"));
    }

    #[test]
    fn lexical_cleaning_handles_dot_segments() {
        let fs = fs();
        assert_eq!(
            normalize_path(&fs, "data/../results/./x.txt"),
            "/home/sandbox/results/x.txt"
        );
    }
}
