//! Layered configuration merge.
//!
//! Merge order: built-in `core` profile, auto-detected profiles, global
//! config (`~/.config/sari/config.json`), workspace config
//! (`<root>/.sari/mcp-config.json`, migrating the legacy
//! `<root>/.sari/config.json` on first read), additive `include_add`/
//! `exclude_add`, then strict `include_remove`/`exclude_remove`.

use crate::error::{Result, SariError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// A single named profile (built-in `core`, or one auto-detected from a
/// marker file such as `package.json` or `go.mod`).
#[derive(Clone, Debug)]
pub struct Profile {
    pub name: &'static str,
    pub marker_files: &'static [&'static str],
    pub extensions: &'static [&'static str],
    pub exclude_dirs: &'static [&'static str],
}

pub const CORE_PROFILE: Profile = Profile {
    name: "core",
    marker_files: &[],
    extensions: &[
        "rs", "py", "js", "ts", "tsx", "jsx", "go", "java", "c", "h", "cpp", "hpp", "rb", "md",
        "toml", "json", "yaml", "yml",
    ],
    exclude_dirs: &[".git", ".sari", ".hg", ".svn"],
};

pub const KNOWN_PROFILES: &[Profile] = &[
    Profile {
        name: "web",
        marker_files: &["package.json"],
        extensions: &["js", "jsx", "ts", "tsx", "vue", "css", "html"],
        exclude_dirs: &["node_modules", "dist", "build", ".next"],
    },
    Profile {
        name: "rust",
        marker_files: &["Cargo.toml"],
        extensions: &["rs"],
        exclude_dirs: &["target"],
    },
    Profile {
        name: "python",
        marker_files: &["pyproject.toml", "setup.py"],
        extensions: &["py", "pyi"],
        exclude_dirs: &["__pycache__", ".venv", "venv"],
    },
    Profile {
        name: "go",
        marker_files: &["go.mod"],
        extensions: &["go"],
        exclude_dirs: &["vendor"],
    },
];

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LayerPatch {
    #[serde(default)]
    pub include_add: Vec<String>,
    #[serde(default)]
    pub exclude_add: Vec<String>,
    #[serde(default)]
    pub include_remove: Vec<String>,
    #[serde(default)]
    pub exclude_remove: Vec<String>,
    #[serde(default)]
    pub db_path: Option<String>,
}

/// The final, merged, immutable configuration for a workspace.
#[derive(Clone, Debug)]
pub struct ResolvedConfig {
    pub workspace_root: PathBuf,
    pub final_extensions: BTreeSet<String>,
    pub final_exclude_dirs: BTreeSet<String>,
    pub gitignore_lines: Vec<String>,
    pub active_profiles: Vec<String>,
    pub db_path: PathBuf,
}

/// First 16 bytes of a well-formed SQLite file.
const SQLITE_MAGIC: &[u8] = b"SQLite format 3\0";

/// Reads a JSON config layer, sniffing for the SQLite magic header first so
/// a misrouted database file produces a typed error instead of a parse
/// panic.
fn read_json_layer(path: &Path) -> Result<Option<LayerPatch>> {
    if !path.is_file() {
        return Ok(None);
    }
    let bytes = std::fs::read(path)?;
    if bytes.len() >= SQLITE_MAGIC.len() && &bytes[..SQLITE_MAGIC.len()] == SQLITE_MAGIC {
        return Err(SariError::InvalidArgs(format!(
            "config file {} is a SQLite database, not JSON",
            path.display()
        )));
    }
    if bytes.is_empty() {
        return Ok(None);
    }
    let patch: LayerPatch = serde_json::from_slice(&bytes)
        .map_err(|e| SariError::InvalidArgs(format!("invalid config json {}: {e}", path.display())))?;
    Ok(Some(patch))
}

/// Migrates `<root>/.sari/config.json` (legacy) to `<root>/.sari/mcp-config.json`
/// when the legacy file is JSON-shaped (not a stray SQLite file) and the new
/// path does not already exist.
fn migrate_legacy_workspace_config(root: &Path) -> Result<()> {
    let legacy = root.join(".sari").join("config.json");
    let current = root.join(".sari").join("mcp-config.json");
    if current.exists() || !legacy.is_file() {
        return Ok(());
    }
    let bytes = std::fs::read(&legacy)?;
    if bytes.len() >= SQLITE_MAGIC.len() && &bytes[..SQLITE_MAGIC.len()] == SQLITE_MAGIC {
        return Ok(());
    }
    if serde_json::from_slice::<serde_json::Value>(&bytes).is_ok() {
        std::fs::write(&current, &bytes)?;
    }
    Ok(())
}

fn parse_sariignore(root: &Path) -> Vec<String> {
    let path = root.join(".sariignore");
    let Ok(text) = std::fs::read_to_string(&path) else {
        return Vec::new();
    };
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

fn detect_profiles(root: &Path, ignore_lines: &[String]) -> Vec<&'static Profile> {
    let mut active = Vec::new();
    for profile in KNOWN_PROFILES {
        let marker_present = profile.marker_files.iter().any(|marker| {
            find_marker_within_levels(root, marker, 3, ignore_lines)
        });
        if marker_present {
            active.push(profile);
        }
    }
    active
}

fn find_marker_within_levels(root: &Path, marker: &str, levels: usize, ignore_lines: &[String]) -> bool {
    fn walk(dir: &Path, marker: &str, remaining: usize, ignore_lines: &[String]) -> bool {
        if dir.join(marker).exists() {
            return true;
        }
        if remaining == 0 {
            return false;
        }
        let Ok(entries) = std::fs::read_dir(dir) else {
            return false;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = path.file_name().unwrap_or_default().to_string_lossy().to_string();
            if ignore_lines.iter().any(|pat| pat.trim_end_matches('/') == name) {
                continue;
            }
            if walk(&path, marker, remaining - 1, ignore_lines) {
                return true;
            }
        }
        false
    }
    walk(root, marker, levels, ignore_lines)
}

/// Resolves the final, layered configuration for a workspace root. `root`
/// must already be normalized (see [`crate::workspace::normalize_path`]).
pub fn resolve_final_config(root: &Path) -> Result<ResolvedConfig> {
    let ignore_lines = parse_sariignore(root);

    let mut extensions: BTreeSet<String> = CORE_PROFILE.extensions.iter().map(|s| s.to_string()).collect();
    let mut exclude_dirs: BTreeSet<String> = CORE_PROFILE.exclude_dirs.iter().map(|s| s.to_string()).collect();
    let mut active_profiles = vec![CORE_PROFILE.name.to_string()];

    for profile in detect_profiles(root, &ignore_lines) {
        active_profiles.push(profile.name.to_string());
        extensions.extend(profile.extensions.iter().map(|s| s.to_string()));
        exclude_dirs.extend(profile.exclude_dirs.iter().map(|s| s.to_string()));
    }

    let global_config_path = dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sari")
        .join("config.json");
    if let Some(patch) = read_json_layer(&global_config_path)? {
        apply_patch(&mut extensions, &mut exclude_dirs, &patch);
    }

    migrate_legacy_workspace_config(root)?;
    let workspace_config_path = root.join(".sari").join("mcp-config.json");
    let mut db_path_override = None;
    if let Some(patch) = read_json_layer(&workspace_config_path)? {
        db_path_override = patch.db_path.clone();
        apply_patch(&mut extensions, &mut exclude_dirs, &patch);
    }

    let db_path = db_path_override
        .map(PathBuf::from)
        .unwrap_or_else(global_db_path);

    if db_path == workspace_config_path {
        return Err(SariError::InvalidArgs(
            "db_path must not equal the config file path".to_string(),
        ));
    }

    let persist = std::env::var("SARI_PERSIST_PATHS").ok().or_else(|| std::env::var("SARI_PERSIST_ROOTS").ok());
    if matches!(persist.as_deref(), Some("1") | Some("true") | Some("yes")) {
        persist_resolved_paths(&workspace_config_path, &extensions, &exclude_dirs)?;
    }

    Ok(ResolvedConfig {
        workspace_root: root.to_path_buf(),
        final_extensions: extensions,
        final_exclude_dirs: exclude_dirs,
        gitignore_lines: ignore_lines,
        active_profiles,
        db_path,
    })
}

/// Writes the fully-merged extension/exclude sets back into the workspace's
/// own config layer, so a later read sees the resolved set directly instead
/// of re-running profile auto-detection (`SARI_PERSIST_PATHS`/`PERSIST_ROOTS`).
/// Only the `include_add`/`exclude_add` fields are rewritten; any
/// `db_path` or removal lists already on disk are preserved.
fn persist_resolved_paths(workspace_config_path: &Path, extensions: &BTreeSet<String>, exclude_dirs: &BTreeSet<String>) -> Result<()> {
    let mut patch = read_json_layer(workspace_config_path)?.unwrap_or_default();
    patch.include_add = extensions.iter().cloned().collect();
    patch.exclude_add = exclude_dirs.iter().cloned().collect();
    if let Some(parent) = workspace_config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let text = serde_json::to_string_pretty(&patch).map_err(|e| SariError::InvalidArgs(e.to_string()))?;
    std::fs::write(workspace_config_path, text)?;
    Ok(())
}

fn apply_patch(extensions: &mut BTreeSet<String>, exclude_dirs: &mut BTreeSet<String>, patch: &LayerPatch) {
    for e in &patch.include_add {
        extensions.insert(e.clone());
    }
    for e in &patch.exclude_add {
        exclude_dirs.insert(e.clone());
    }
    for e in &patch.include_remove {
        extensions.remove(e);
    }
    for e in &patch.exclude_remove {
        exclude_dirs.remove(e);
    }
}

/// Single global database path used for all workspaces. A workspace-local
/// `.sari` data directory, if present, is
/// ignored in favor of this path; callers should log that override.
pub fn global_db_path() -> PathBuf {
    sari_data_dir().join("index.db")
}

pub fn sari_data_dir() -> PathBuf {
    if let Ok(over) = std::env::var("SARI_DATA_DIR") {
        return PathBuf::from(over);
    }
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sari")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sqlite_magic_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mcp-config.json");
        std::fs::write(&path, b"SQLite format 3\0garbage").unwrap();
        let err = read_json_layer(&path).unwrap_err();
        assert!(matches!(err, SariError::InvalidArgs(_)));
    }

    #[test]
    fn merge_is_deterministic() {
        let dir = tempdir().unwrap();
        let a = resolve_final_config(dir.path()).unwrap();
        let b = resolve_final_config(dir.path()).unwrap();
        assert_eq!(a.final_extensions, b.final_extensions);
        assert_eq!(a.final_exclude_dirs, b.final_exclude_dirs);
    }

    #[test]
    fn rejects_db_path_equal_to_config_path() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".sari")).unwrap();
        let config_path = dir.path().join(".sari").join("mcp-config.json");
        let patch = format!("{{\"db_path\": \"{}\"}}", config_path.display());
        std::fs::write(&config_path, patch).unwrap();
        let err = resolve_final_config(dir.path()).unwrap_err();
        assert!(matches!(err, SariError::InvalidArgs(_)));
    }
}
