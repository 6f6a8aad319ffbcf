//! Path mapping: ordered `(from, to)` prefix rewrites applied to every
//! file path before open, translating the database's view of a path into
//! the local filesystem.

use std::path::{Path, PathBuf};

use tracing::trace;

/// An ordered list of prefix substitutions. The first matching pair
/// wins; non-matching paths pass through unchanged.
#[derive(Debug, Clone, Default)]
pub struct PathMapping {
    pairs: Vec<(String, String)>,
}

impl PathMapping {
    #[must_use]
    pub fn new(pairs: Vec<(String, String)>) -> Self {
        for (source, target) in &pairs {
            trace!(source, target, "path mapping added");
        }
        Self { pairs }
    }

    /// Rewrite one path.
    #[must_use]
    pub fn apply(&self, path: &str) -> String {
        for (source, target) in &self.pairs {
            if let Some(rest) = path.strip_prefix(source.as_str()) {
                return format!("{target}{rest}");
            }
        }
        path.to_owned()
    }

    #[must_use]
    pub fn apply_path(&self, path: &Path) -> PathBuf {
        PathBuf::from(self.apply(&path.to_string_lossy()))
    }

    /// The inverse mapping (targets become sources). For pure prefix
    /// substitutions `inverse().apply(apply(p)) == p`.
    #[must_use]
    pub fn inverse(&self) -> Self {
        Self {
            pairs: self
                .pairs
                .iter()
                .map(|(s, t)| (t.clone(), s.clone()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn first_match_wins() {
        let mapping = PathMapping::new(vec![
            ("/opt/oracle".to_owned(), "/mnt/redo".to_owned()),
            ("/opt".to_owned(), "/elsewhere".to_owned()),
        ]);
        assert_eq!(
            mapping.apply("/opt/oracle/redo01.log"),
            "/mnt/redo/redo01.log"
        );
        assert_eq!(mapping.apply("/opt/other/x"), "/elsewhere/other/x");
        assert_eq!(mapping.apply("/var/unrelated"), "/var/unrelated");
    }

    #[test]
    fn empty_mapping_is_identity() {
        let mapping = PathMapping::default();
        assert_eq!(mapping.apply("/a/b/c"), "/a/b/c");
    }

    proptest! {
        // Prefix substitutions invert cleanly when the source prefix
        // matches and the target prefix is unambiguous.
        #[test]
        fn inverse_restores_original(rest in "[a-z/]{0,20}") {
            let mapping = PathMapping::new(vec![
                ("/ora".to_owned(), "/local-mirror".to_owned()),
            ]);
            let original = format!("/ora/{rest}");
            let mapped = mapping.apply(&original);
            prop_assert_eq!(mapping.inverse().apply(&mapped), original);
        }
    }
}
