//! Lexical path handling.
//!
//! Paths are normalized before resolution: relative paths are joined onto
//! the process cwd, then `.` and `..` components are folded away. `..` at
//! the root stays at the root.

use alloc::string::String;
use alloc::vec::Vec;

/// Build a normalized absolute path from `base` (the cwd) and `p`.
pub fn absolute(base: &str, p: &str) -> String {
    let joined: Vec<&str> = if p.starts_with('/') {
        p.split('/').collect()
    } else {
        base.split('/').chain(p.split('/')).collect()
    };

    let mut stack: Vec<&str> = Vec::new();
    for component in joined {
        match component {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            other => stack.push(other),
        }
    }

    if stack.is_empty() {
        return String::from("/");
    }
    let mut out = String::new();
    for component in stack {
        out.push('/');
        out.push_str(component);
    }
    out
}

/// Split an absolute path into `(parent, final_component)`.
/// Returns None for paths without a final component ("/").
pub fn split_parent(p: &str) -> Option<(&str, &str)> {
    let trimmed = p.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    let pos = trimmed.rfind('/')?;
    let parent = if pos == 0 { "/" } else { &trimmed[..pos] };
    Some((parent, &trimmed[pos + 1..]))
}

/// The final component of a path, for deriving process names.
pub fn file_name(p: &str) -> &str {
    p.rsplit('/').find(|c| !c.is_empty()).unwrap_or(p)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_relative_onto_cwd() {
        assert_eq!(absolute("/home", "notes.txt"), "/home/notes.txt");
        assert_eq!(absolute("/", "a/b"), "/a/b");
    }

    #[test]
    fn absolute_paths_ignore_cwd() {
        assert_eq!(absolute("/home", "/etc/rc"), "/etc/rc");
    }

    #[test]
    fn folds_dot_and_dotdot() {
        assert_eq!(absolute("/a/b", "../c"), "/a/c");
        assert_eq!(absolute("/a/b", "./c/.."), "/a/b");
        assert_eq!(absolute("/", "../../x"), "/x");
        assert_eq!(absolute("/a", ".."), "/");
    }

    #[test]
    fn split_parent_handles_root_children() {
        assert_eq!(split_parent("/iso.txt"), Some(("/", "iso.txt")));
        assert_eq!(split_parent("/a/b/c"), Some(("/a/b", "c")));
        assert_eq!(split_parent("/"), None);
    }

    #[test]
    fn file_name_takes_last_component() {
        assert_eq!(file_name("/bin/init"), "init");
        assert_eq!(file_name("init"), "init");
        assert_eq!(file_name("/bin/"), "bin");
    }
}
