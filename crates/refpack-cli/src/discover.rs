//! Finding candidate modules below a source directory.

use crate::config::Config;
use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};
use std::path::{Path, PathBuf};
use tracing::trace;
use walkdir::WalkDir;

/// File selection rules of one configuration
///
/// A file is selected when its name matches a force-include pattern, or when
/// none of its folders starts with an excluded prefix, its name matches an
/// include pattern (if any are set) and no exclude pattern.
#[derive(Debug)]
pub(crate) struct Discovery {
    root: PathBuf,
    recursive: bool,
    include: Vec<Regex>,
    exclude: Vec<Regex>,
    force_include: Vec<Regex>,
    excluded_folders: Vec<String>,
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            RegexBuilder::new(p)
                .case_insensitive(true)
                .build()
                .with_context(|| format!("Invalid file name pattern: {p}"))
        })
        .collect()
}

impl Discovery {
    pub(crate) fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            root: config.source_path.clone(),
            recursive: config.recursive,
            include: compile(&config.include_patterns)?,
            exclude: compile(&config.exclude_patterns)?,
            force_include: compile(&config.force_include_patterns)?,
            excluded_folders: config
                .exclude_path_patterns
                .iter()
                .map(|p| p.to_lowercase())
                .collect(),
        })
    }

    /// Applies the rules to a path relative to the source root
    pub(crate) fn selects(&self, relative: &Path) -> bool {
        let Some(name) = relative.file_name().map(|n| n.to_string_lossy()) else {
            return false;
        };
        if self.force_include.iter().any(|r| r.is_match(&name)) {
            return true;
        }

        let in_excluded_folder = relative
            .parent()
            .into_iter()
            .flat_map(Path::components)
            .map(|c| c.as_os_str().to_string_lossy().to_lowercase())
            .any(|folder| self.excluded_folders.iter().any(|p| folder.starts_with(p.as_str())));
        if in_excluded_folder {
            return false;
        }

        if !self.include.is_empty() && !self.include.iter().any(|r| r.is_match(&name)) {
            return false;
        }
        !self.exclude.iter().any(|r| r.is_match(&name))
    }

    /// Selected files in a stable, name-sorted walk order
    pub(crate) fn search(&self) -> Result<Vec<PathBuf>> {
        if !self.root.is_dir() {
            anyhow::bail!("Source directory does not exist: {}", self.root.display());
        }

        let mut found = Vec::new();
        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name()
            .max_depth(if self.recursive { usize::MAX } else { 1 });
        for entry in walker.into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            if self.selects(relative) {
                found.push(path.to_path_buf());
            } else {
                trace!("Not selected: {}", relative.display());
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::TempDir;

    fn discovery(root: &Path, recursive: bool) -> Discovery {
        let config = Config {
            source_path: root.to_path_buf(),
            recursive,
            exclude_path_patterns: vec!["runtimes".into(), "Plugins".into()],
            force_include_patterns: vec![r"^System\.Special\.dll$".into()],
            ..Config::default()
        };
        Discovery::new(&config).unwrap()
    }

    #[test]
    fn test_rules() {
        let d = discovery(Path::new("/root"), true);
        assert!(d.selects(Path::new("Game.dll")));
        assert!(d.selects(Path::new("Tool.EXE")));
        assert!(!d.selects(Path::new("notes.txt")));
        assert!(!d.selects(Path::new("System.Core.dll")));
        assert!(!d.selects(Path::new("microsoft.csharp.dll")));
        assert!(d.selects(Path::new("System.Special.dll")));
        assert!(!d.selects(Path::new("runtimes/win/Game.Native.dll")));
        assert!(!d.selects(Path::new("PluginsExtra/Mod.dll")));
        assert!(d.selects(Path::new("runtimes/System.Special.dll")));
        assert!(d.selects(Path::new("lib/Game.Extra.dll")));
    }

    #[test]
    fn test_search_respects_recursion() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::create_dir_all(root.join("runtimes")).unwrap();
        for file in ["B.dll", "A.dll", "readme.txt", "sub/C.dll", "runtimes/D.dll"] {
            fs::write(root.join(file), b"").unwrap();
        }

        let flat = discovery(root, false).search().unwrap();
        assert_eq!(flat, vec![root.join("A.dll"), root.join("B.dll")]);

        let deep = discovery(root, true).search().unwrap();
        assert_eq!(
            deep,
            vec![root.join("A.dll"), root.join("B.dll"), root.join("sub").join("C.dll")]
        );
    }

    #[test]
    fn test_bad_pattern() {
        let config = Config {
            include_patterns: vec!["(".into()],
            ..Config::default()
        };
        assert!(Discovery::new(&config).is_err());
    }
}
