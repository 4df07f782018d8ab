//! Path normalization and root identity.
//!
//! Every path-bearing API goes through [`normalize_path`] before hashing,
//! comparison, or persistence, and every stable workspace identifier is
//! derived from the normalized path via [`root_id_for_path`].

use std::path::{Component, Path, PathBuf};
use unicode_normalization::UnicodeNormalization;

/// Expands `~`, collapses `.`/`..` components lexically, strips a trailing
/// separator, and (on case-insensitive platforms) lowercases the result.
/// Does not touch the filesystem unless `resolve_symlinks` is requested by
/// the caller — callers that need symlink resolution call
/// [`resolve_real_path`] themselves after normalizing.
pub fn normalize_path(input: &str) -> PathBuf {
    let expanded = expand_home(input);
    let collapsed = collapse_dots(&expanded);
    lowercase_if_case_insensitive(collapsed)
}

fn expand_home(input: &str) -> PathBuf {
    if let Some(rest) = input.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    } else if input == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(input)
}

fn collapse_dots(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(comp);
                }
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(target_os = "windows")]
fn lowercase_if_case_insensitive(path: PathBuf) -> PathBuf {
    PathBuf::from(path.to_string_lossy().to_lowercase())
}

#[cfg(not(target_os = "windows"))]
fn lowercase_if_case_insensitive(path: PathBuf) -> PathBuf {
    path
}

/// Resolves symlinks and relative components against the filesystem. Only
/// called where the configuration explicitly requests it (`SARI_FOLLOW_SYMLINKS`
/// or one-time root registration), never on every lookup.
pub fn resolve_real_path(path: &Path) -> std::io::Result<PathBuf> {
    std::fs::canonicalize(path)
}

/// Stable 160-bit digest of a normalized absolute path, used as `root_id`.
/// Same path spelling produces the same id on any host or process.
pub fn root_id_for_path(normalized_absolute: &Path) -> String {
    stable_digest(normalized_absolute.to_string_lossy().as_bytes())
}

/// Stable 160-bit (20-byte) digest used for `root_id` and `symbol_id`.
/// Built on `blake3`, truncated to 20 bytes and hex-encoded — see
/// DESIGN.md for why a single hash primitive is used for both.
pub fn stable_digest(bytes: &[u8]) -> String {
    let hash = blake3::hash(bytes);
    hex::encode(&hash.as_bytes()[..20])
}

/// NFKC-normalizes, case-folds, and whitespace-collapses `text` for
/// substring matching against the overlay and the FTS index. Compatibility
/// forms (full-width digits, CJK compatibility ideographs) fold to their
/// canonical equivalent before case-folding, so a query typed in one form
/// matches content stored in another.
pub fn normalize_for_match(text: &str) -> String {
    let folded: String = text.nfkc().collect::<String>().to_lowercase();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Nearest ancestor directory containing `.sariroot`. A `.sari` directory is
/// configuration-only and must never be treated as a project boundary.
pub fn find_project_root(start: &Path) -> Option<PathBuf> {
    let mut cur = if start.is_file() {
        start.parent()?
    } else {
        start
    };
    loop {
        if cur.join(".sariroot").is_file() {
            return Some(cur.to_path_buf());
        }
        match cur.parent() {
            Some(parent) => cur = parent,
            None => return None,
        }
    }
}

/// Nearest git top-level directory, used only for repository-label
/// inference; never expands the active workspace root.
pub fn find_git_toplevel(start: &Path) -> Option<PathBuf> {
    let repo = git2::Repository::discover(start).ok()?;
    repo.workdir().map(|p| p.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize_path("/tmp/a/../a/./b/");
        let twice = normalize_path(&once.to_string_lossy());
        assert_eq!(once, twice);
    }

    #[test]
    fn collapses_parent_refs() {
        let p = normalize_path("/tmp/a/b/../c");
        assert_eq!(p, PathBuf::from("/tmp/a/c"));
    }

    #[test]
    fn root_id_stable_across_calls() {
        let p = normalize_path("/tmp/workspace");
        assert_eq!(root_id_for_path(&p), root_id_for_path(&p));
    }

    #[test]
    fn root_id_differs_for_different_paths() {
        let a = root_id_for_path(&normalize_path("/tmp/one"));
        let b = root_id_for_path(&normalize_path("/tmp/two"));
        assert_ne!(a, b);
    }

    #[test]
    fn normalize_for_match_folds_fullwidth_forms() {
        // U+FF21 FULLWIDTH LATIN CAPITAL LETTER A -> "a"
        assert_eq!(normalize_for_match("\u{FF21}BC"), "abc");
    }

    #[test]
    fn normalize_for_match_collapses_whitespace() {
        assert_eq!(normalize_for_match("  foo   bar\tbaz  "), "foo bar baz");
    }
}
