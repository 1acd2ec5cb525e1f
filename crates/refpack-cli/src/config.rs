//! Configuration documents.
//!
//! Each command line argument names one JSON document. A document that does
//! not exist yet is generated with defaults so it can be filled in.

use anyhow::{bail, Context, Result};
use refpack_core::package::CompanionResolver;
use refpack_core::{
    PackageSettings, RunSettings, StripPolicy, StripStrategy, StripperKind, VersionSpec,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Where and whether packages are pushed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct PublishTarget {
    /// Feed API key
    pub(crate) api_key: String,
    /// Push packages after writing them
    pub(crate) publish: bool,
    /// Feed address: a v3 service index, a v2 feed root, or a local directory
    pub(crate) source: String,
}

/// One configuration document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct Config {
    /// Directory searched for modules
    pub(crate) source_path: PathBuf,
    /// Descend into subdirectories of `source_path`
    pub(crate) recursive: bool,
    /// File name patterns a module must match (case-insensitive)
    pub(crate) include_patterns: Vec<String>,
    /// File name patterns that rule a module out (case-insensitive)
    pub(crate) exclude_patterns: Vec<String>,
    /// File name patterns admitted regardless of every other rule
    pub(crate) force_include_patterns: Vec<String>,
    /// Folder name prefixes whose contents are skipped
    pub(crate) exclude_path_patterns: Vec<String>,

    /// Where reference modules are written; emptied on every run
    pub(crate) module_output_path: PathBuf,
    /// Where packages are written
    pub(crate) package_output_path: PathBuf,
    /// Documentation companions are looked up here before `source_path`
    pub(crate) documentation_path: Option<PathBuf>,
    /// Symbol companions are looked up here before `source_path`
    pub(crate) debug_symbols_path: Option<PathBuf>,

    /// Prepended to every package id
    pub(crate) package_id_prefix: String,
    /// Target framework folder inside `ref/`
    pub(crate) target_framework: String,
    /// Package authors
    pub(crate) authors: Vec<String>,
    /// Package tags
    pub(crate) tags: Vec<String>,
    /// Project home page
    pub(crate) project_url: Option<String>,
    /// Source repository
    pub(crate) repository_url: Option<String>,
    /// Remote icon
    pub(crate) icon_url: Option<String>,
    /// Icon file bundled into every package
    pub(crate) icon_path: Option<PathBuf>,
    /// Readme file bundled into every package
    pub(crate) readme_path: Option<PathBuf>,

    /// Put every module into one package
    pub(crate) single_package_mode: bool,
    /// Name of the single package
    pub(crate) single_package_name: String,
    /// Version of the single package before boosting
    pub(crate) single_package_version: Option<VersionSpec>,
    /// Added to every package version
    pub(crate) version_boost: VersionSpec,
    /// Versions replacing a module's own, keyed by file name
    pub(crate) version_overrides: BTreeMap<String, VersionSpec>,
    /// Pre-release label
    pub(crate) version_release_label: String,

    /// Stripping implementation
    pub(crate) stripper: StripperKind,
    /// Stripping policy
    pub(crate) strip: StripPolicy,
    /// Package feed
    pub(crate) publish_target: Option<PublishTarget>,
}

impl Default for Config {
    fn default() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            source_path: cwd.clone(),
            recursive: false,
            include_patterns: vec![r".+\.dll$".into(), r".+\.exe$".into()],
            exclude_patterns: vec![
                r"^Microsoft\..+".into(),
                r"^System\..+".into(),
                r"^Mono\..+".into(),
                r"^UnityEngine\..+".into(),
            ],
            force_include_patterns: Vec::new(),
            exclude_path_patterns: Vec::new(),
            module_output_path: cwd.join("Public"),
            package_output_path: cwd.join("Packages"),
            documentation_path: None,
            debug_symbols_path: None,
            package_id_prefix: String::new(),
            target_framework: String::new(),
            authors: Vec::new(),
            tags: Vec::new(),
            project_url: None,
            repository_url: None,
            icon_url: None,
            icon_path: None,
            readme_path: None,
            single_package_mode: false,
            single_package_name: refpack_core::package::DEFAULT_AGGREGATE_NAME.to_string(),
            single_package_version: None,
            version_boost: VersionSpec::EMPTY,
            version_overrides: BTreeMap::new(),
            version_release_label: String::new(),
            stripper: StripperKind::Filtering,
            strip: StripPolicy::default(),
            publish_target: None,
        }
    }
}

impl Config {
    /// Reads a configuration document
    ///
    /// `source_path` must be present; every other key falls back to its default.
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let value: serde_json::Value = serde_json::from_str(&text)
            .with_context(|| format!("Config file is not valid JSON: {}", path.display()))?;
        if value.get("source_path").is_none() {
            bail!("Config file {} does not set source_path", path.display());
        }
        serde_json::from_value(value)
            .with_context(|| format!("Config file has invalid settings: {}", path.display()))
    }

    /// Writes a document holding the defaults
    pub(crate) fn write_default(path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&Self::default())
            .context("Failed to serialize default config")?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        fs::write(path, json)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    /// Output locations and packaging mode
    pub(crate) fn run_settings(&self) -> RunSettings {
        RunSettings {
            source_root: self.source_path.clone(),
            module_output_dir: self.module_output_path.clone(),
            package_output_dir: self.package_output_path.clone(),
            aggregate: self.single_package_mode,
        }
    }

    /// Stripping strategy with this document's policy
    pub(crate) fn strategy(&self) -> Box<dyn StripStrategy> {
        self.stripper.build(self.strip.clone())
    }

    /// Package metadata, versioning, and companion lookup
    pub(crate) fn package_settings(&self) -> PackageSettings {
        let resolver = |preferred: &Option<PathBuf>| {
            CompanionResolver::new(preferred.iter().cloned()).with_root(&self.source_path)
        };
        PackageSettings {
            id_prefix: self.package_id_prefix.clone(),
            target_framework: self.target_framework.clone(),
            authors: self.authors.clone(),
            tags: self.tags.clone(),
            project_url: self.project_url.clone(),
            icon_url: self.icon_url.clone(),
            repository_url: self.repository_url.clone(),
            icon_path: self.icon_path.clone(),
            readme_path: self.readme_path.clone(),
            release_label: self.version_release_label.clone(),
            version_boost: self.version_boost,
            version_overrides: self.version_overrides.clone(),
            aggregate_name: self.single_package_name.clone(),
            aggregate_version: self.single_package_version,
            documentation: resolver(&self.documentation_path),
            symbols: resolver(&self.debug_symbols_path),
        }
    }

    /// The publish target, if publishing is switched on
    pub(crate) fn active_publish_target(&self) -> Option<&PublishTarget> {
        self.publish_target
            .as_ref()
            .filter(|t| t.publish && !t.source.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use refpack_core::FilterMode;
    use tempfile::TempDir;

    #[test]
    fn test_generated_default_roundtrips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("configs").join("game.json");
        Config::write_default(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), Config::default());
    }

    #[test]
    fn test_partial_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("game.json");
        fs::write(
            &path,
            r#"{
                "source_path": "/games/example/Managed",
                "single_package_mode": true,
                "version_boost": "0.1",
                "version_overrides": { "Lib.dll": "2.0.0" },
                "strip": { "filter_mode": "public", "make_mock": true },
                "publish_target": { "source": "https://feed.example/v3/index.json", "api_key": "k", "publish": true }
            }"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.source_path, PathBuf::from("/games/example/Managed"));
        assert!(config.single_package_mode);
        assert_eq!(config.version_boost, VersionSpec::major_minor(0, 1));
        assert_eq!(
            config.version_overrides["Lib.dll"],
            VersionSpec::new(Some(2), Some(0), Some(0), None)
        );
        assert_eq!(config.strip.filter_mode, FilterMode::Public);
        assert!(config.strip.make_mock);
        assert_eq!(config.include_patterns.len(), 2);
        assert!(config.active_publish_target().is_some());
    }

    #[test]
    fn test_source_path_is_required() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("game.json");
        fs::write(&path, r#"{ "recursive": true }"#).unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("source_path"));
    }

    #[test]
    fn test_invalid_version_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("game.json");
        fs::write(&path, r#"{ "source_path": ".", "version_boost": "1.x" }"#).unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_companion_roots() {
        let config = Config {
            source_path: PathBuf::from("/src"),
            documentation_path: Some(PathBuf::from("/docs")),
            ..Config::default()
        };
        let settings = config.package_settings();
        assert_eq!(
            settings.documentation.roots(),
            &[PathBuf::from("/docs"), PathBuf::from("/src")]
        );
        assert_eq!(settings.symbols.roots(), &[PathBuf::from("/src")]);
    }

    #[test]
    fn test_disabled_publish_target() {
        let config = Config {
            publish_target: Some(PublishTarget {
                source: "https://feed.example".into(),
                ..PublishTarget::default()
            }),
            ..Config::default()
        };
        assert!(config.active_publish_target().is_none());
    }
}
