//! Server-relative path handling. Paths on the wire are `/`-rooted and
//! lexically cleaned; `..` can never climb above the root.

/// Clean a path into its `/`-rooted canonical form: empty and `.` segments
/// dropped, `..` resolved, never escaping the root.
pub fn clean_path(path: &str) -> String {
    let mut kept: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                kept.pop();
            }
            other => kept.push(other),
        }
    }
    let mut out = String::with_capacity(path.len() + 1);
    out.push('/');
    out.push_str(&kept.join("/"));
    out
}

/// Join a name (or relative path) onto a `/`-rooted base and clean the result.
pub fn join_path(base: &str, name: &str) -> String {
    clean_path(&format!("{base}/{name}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleans_dots_and_doubles() {
        assert_eq!(clean_path("/"), "/");
        assert_eq!(clean_path(""), "/");
        assert_eq!(clean_path("/a/b"), "/a/b");
        assert_eq!(clean_path("a//b/./c"), "/a/b/c");
        assert_eq!(clean_path("/a/b/../c"), "/a/c");
    }

    #[test]
    fn cannot_escape_root() {
        assert_eq!(clean_path("/../.."), "/");
        assert_eq!(clean_path("/../etc/passwd"), "/etc/passwd");
        assert_eq!(clean_path("../../.."), "/");
    }

    #[test]
    fn joins_relative_names() {
        assert_eq!(join_path("/", "a"), "/a");
        assert_eq!(join_path("/a", "b"), "/a/b");
        assert_eq!(join_path("/a/b", "../c"), "/a/c");
    }
}
