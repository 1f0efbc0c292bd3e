//! Shared ignore rules for the watcher and the reconciler.

use glob::Pattern;
use tracing::warn;

use crate::repository::SYSTEM_DIR;

/// Compiled per-repository ignore rules: hidden entries, the protected
/// system subtree, and the repository's configured glob patterns.
#[derive(Debug)]
pub struct IgnoreRules {
    patterns: Vec<Pattern>,
}

impl IgnoreRules {
    /// Invalid patterns are logged and skipped; watching must not fail
    /// because of one bad glob.
    pub fn new(patterns: &[String]) -> Self {
        let patterns = patterns
            .iter()
            .filter_map(|raw| match Pattern::new(raw) {
                Ok(pattern) => Some(pattern),
                Err(err) => {
                    warn!(pattern = raw, error = %err, "ignoring unparseable glob pattern");
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    /// Whether a repository-relative path (`/`-separated) is excluded from
    /// watching and reconciliation.
    pub fn is_ignored(&self, rel_path: &str) -> bool {
        let mut segments = rel_path.split('/').filter(|s| !s.is_empty()).peekable();
        if segments.peek() == Some(&SYSTEM_DIR) {
            return true;
        }

        let mut file_name = "";
        for segment in rel_path.split('/').filter(|s| !s.is_empty()) {
            if segment.starts_with('.') {
                return true;
            }
            file_name = segment;
        }

        self.patterns
            .iter()
            .any(|pattern| pattern.matches(rel_path) || pattern.matches(file_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hidden_entries_and_the_system_tree_are_ignored() {
        let rules = IgnoreRules::new(&[]);
        assert!(rules.is_ignored(".luma/staging/incoming/x.jpg"));
        assert!(rules.is_ignored(".DS_Store"));
        assert!(rules.is_ignored("photos/.thumbnails/a.jpg"));
        assert!(!rules.is_ignored("photos/a.jpg"));
    }

    #[test]
    fn glob_patterns_match_whole_paths_and_file_names() {
        let rules = IgnoreRules::new(&["*.tmp".to_string(), "cache/**".to_string()]);
        assert!(rules.is_ignored("upload.tmp"));
        assert!(rules.is_ignored("photos/partial.tmp"));
        assert!(rules.is_ignored("cache/previews/a.jpg"));
        assert!(!rules.is_ignored("photos/a.jpg"));
    }

    #[test]
    fn bad_patterns_are_skipped_not_fatal() {
        let rules = IgnoreRules::new(&["[".to_string(), "*.tmp".to_string()]);
        assert!(rules.is_ignored("x.tmp"));
        assert!(!rules.is_ignored("x.jpg"));
    }
}
