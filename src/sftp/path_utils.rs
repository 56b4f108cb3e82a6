//! Remote path helpers
//!
//! Remote SFTP paths always use `/` as separator (per SFTP protocol),
//! even when the server runs on Windows.

/// Check if a remote SFTP path is absolute.
pub fn is_absolute_remote_path(path: &str) -> bool {
    path.starts_with('/')
}

/// Join a remote directory and an entry name.
///
/// # Examples
/// ```
/// use oxideterm_engine::sftp::path_utils::join_remote_path;
/// assert_eq!(join_remote_path("/home/user", "file.txt"), "/home/user/file.txt");
/// assert_eq!(join_remote_path("/", "etc"), "/etc");
/// ```
pub fn join_remote_path(base: &str, name: &str) -> String {
    if is_absolute_remote_path(name) {
        return name.to_string();
    }
    let trimmed = base.trim_end_matches('/');
    if trimmed.is_empty() {
        format!("/{}", name)
    } else {
        format!("{}/{}", trimmed, name)
    }
}

/// Collapse duplicate and trailing separators so `/home//u/` and `/home/u`
/// name the same queue entry.
pub fn normalize_remote_path(path: &str) -> String {
    let absolute = is_absolute_remote_path(path);
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty() && *p != ".").collect();
    let joined = parts.join("/");
    match (absolute, joined.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join() {
        assert_eq!(join_remote_path("/home/user/", "a"), "/home/user/a");
        assert_eq!(join_remote_path("/home", "/etc/passwd"), "/etc/passwd");
        assert_eq!(join_remote_path("", "a"), "/a");
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_remote_path("/home//user/"), "/home/user");
        assert_eq!(normalize_remote_path("/"), "/");
        assert_eq!(normalize_remote_path("./docs/./a"), "docs/a");
        assert_eq!(normalize_remote_path(""), ".");
    }
}
