//! Grouping stripped modules and their companions into packages.

use super::{Package, PackageMetadata, Repository};
use crate::error::Result;
use crate::version::VersionSpec;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Version used when a module carries none
pub const FALLBACK_MODULE_VERSION: VersionSpec = VersionSpec::full(1, 0, 0, 0);

/// Version of the aggregate package when none is configured
pub const DEFAULT_AGGREGATE_VERSION: VersionSpec = VersionSpec::new(Some(1), Some(0), Some(0), None);

/// Name of the aggregate package when none is configured
pub const DEFAULT_AGGREGATE_NAME: &str = "AllReferences";

/// A reference module written by the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrippedModule {
    /// The original module
    pub source: PathBuf,
    /// The reference module
    pub output: PathBuf,
    /// Directory depth of `source` below the search root
    pub depth: usize,
    /// Version recorded in the module
    pub version: VersionSpec,
}

impl StrippedModule {
    /// File name of the reference module
    pub fn file_name(&self) -> String {
        file_name(&self.output)
    }

    /// File name without extension
    pub fn stem(&self) -> String {
        self.output
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Files that travel with a module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Companion {
    /// XML documentation
    Documentation,
    /// Debug symbols
    Symbols,
}

impl Companion {
    /// File extension, without the dot
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Documentation => "xml",
            Self::Symbols => "pdb",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Documentation => "documentation",
            Self::Symbols => "debug symbols",
        }
    }
}

/// Ordered list of directories searched for a companion file
///
/// The first directory holding `<stem>.<ext>` wins. When the assembler
/// resolves a module's companions it searches these roots first and the
/// directory the module was read from last. With the roots the command line
/// configures, the order is: the configured documentation or symbols
/// directory, then the source root, then the module's own directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompanionResolver {
    roots: Vec<PathBuf>,
}

impl CompanionResolver {
    /// Creates a resolver searching `roots` in order
    pub fn new(roots: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            roots: roots.into_iter().collect(),
        }
    }

    /// Appends a fallback directory
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.roots.push(root.into());
        self
    }

    /// Directories searched, in order
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Finds the companion of the module named `stem`
    pub fn resolve(&self, stem: &str, companion: Companion) -> Option<PathBuf> {
        let name = format!("{stem}.{}", companion.extension());
        self.roots
            .iter()
            .map(|root| root.join(&name))
            .find(|candidate| candidate.is_file())
    }
}

/// Package metadata and layout settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSettings {
    /// Prepended to every package id
    pub id_prefix: String,
    /// Target framework moniker of the `ref/` folder; empty for `ref/` itself
    pub target_framework: String,
    /// Package authors
    pub authors: Vec<String>,
    /// Package tags
    pub tags: Vec<String>,
    /// Project home page
    pub project_url: Option<String>,
    /// Remote icon location
    pub icon_url: Option<String>,
    /// Source repository location
    pub repository_url: Option<String>,
    /// Icon copied to the archive root
    pub icon_path: Option<PathBuf>,
    /// Readme copied to the archive root
    pub readme_path: Option<PathBuf>,
    /// Pre-release label appended to every version
    pub release_label: String,
    /// Added to every package version
    pub version_boost: VersionSpec,
    /// Versions replacing a module's own, keyed by module file name (ASCII case-insensitive)
    pub version_overrides: BTreeMap<String, VersionSpec>,
    /// Name of the aggregate package
    pub aggregate_name: String,
    /// Version of the aggregate package before boosting
    pub aggregate_version: Option<VersionSpec>,
    /// Where documentation companions are looked up
    pub documentation: CompanionResolver,
    /// Where symbol companions are looked up
    pub symbols: CompanionResolver,
}

impl Default for PackageSettings {
    fn default() -> Self {
        Self {
            id_prefix: String::new(),
            target_framework: String::new(),
            authors: Vec::new(),
            tags: Vec::new(),
            project_url: None,
            icon_url: None,
            repository_url: None,
            icon_path: None,
            readme_path: None,
            release_label: String::new(),
            version_boost: VersionSpec::EMPTY,
            version_overrides: BTreeMap::new(),
            aggregate_name: DEFAULT_AGGREGATE_NAME.to_string(),
            aggregate_version: None,
            documentation: CompanionResolver::default(),
            symbols: CompanionResolver::default(),
        }
    }
}

impl PackageSettings {
    /// Override for the module file `name`, if any
    pub fn version_override(&self, name: &str) -> Option<VersionSpec> {
        self.version_overrides
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, version)| *version)
    }
}

/// A module left out of an aggregate package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedDuplicate {
    /// The module that was left out
    pub skipped: PathBuf,
    /// The same-named module that was kept
    pub retained: PathBuf,
    /// Whether both files have identical content
    pub identical: bool,
}

/// Outcome of aggregate assembly
#[derive(Debug, Clone)]
pub struct AggregatePackage {
    /// The assembled package
    pub package: Package,
    /// Modules in the package, in inclusion order
    pub included: Vec<PathBuf>,
    /// Modules left out because a shallower one had the same name
    pub skipped: Vec<SkippedDuplicate>,
}

/// Returns true if both files exist and hash identically
pub(crate) fn same_content(a: &Path, b: &Path) -> bool {
    match (fs::read(a), fs::read(b)) {
        (Ok(a), Ok(b)) => blake3::hash(&a) == blake3::hash(&b),
        _ => false,
    }
}

/// Builds packages from stripped modules
#[derive(Debug, Clone)]
pub struct PackageAssembler {
    settings: PackageSettings,
}

impl PackageAssembler {
    /// Creates an assembler
    pub fn new(settings: PackageSettings) -> Self {
        Self { settings }
    }

    /// Settings the assembler runs with
    pub fn settings(&self) -> &PackageSettings {
        &self.settings
    }

    /// Archive folder the payload goes into, with a trailing `/`
    pub fn destination(&self) -> String {
        let framework = self.settings.target_framework.trim().trim_matches('/');
        if framework.is_empty() {
            "ref/".to_string()
        } else {
            format!("ref/{framework}/")
        }
    }

    /// Package version of a single-module package
    ///
    /// The override for the module's file name, else the module's own
    /// version, merged with the boost.
    pub fn module_version(&self, module: &StrippedModule) -> Result<String> {
        let primary = match self.settings.version_override(&module.file_name()) {
            Some(version) => {
                debug!("using version override {} for {}", version, module.file_name());
                version
            }
            None if module.version.defined_len() == 0 => FALLBACK_MODULE_VERSION,
            None => module.version,
        };
        let version = VersionSpec::combine(&primary, &self.settings.version_boost)?;
        Ok(version.to_package_version(&self.settings.release_label))
    }

    /// Package version of the aggregate package
    pub fn aggregate_version(&self) -> Result<String> {
        let primary = self
            .settings
            .aggregate_version
            .unwrap_or(DEFAULT_AGGREGATE_VERSION);
        let version = VersionSpec::combine(&primary, &self.settings.version_boost)?;
        Ok(version.to_package_version(&self.settings.release_label))
    }

    /// Package holding one module and its companions
    pub fn assemble_module(&self, module: &StrippedModule) -> Result<Package> {
        let stem = module.stem();
        let mut package = Package::new(self.metadata(
            format!("{}{stem}", self.settings.id_prefix),
            self.module_version(module)?,
            format!("Stripped {stem} Reference"),
            format!("Stripped reference package for {}.", module.file_name()),
        ));

        let destination = self.destination();
        package.add_file(format!("{destination}{}", module.file_name()), &module.output);
        self.attach_companions(&mut package, module);
        self.attach_extras(&mut package);
        Ok(package)
    }

    /// Package holding every module, one copy per file name
    ///
    /// Modules are taken in ascending depth order (ties keep their given
    /// order); a module whose file name, ignoring ASCII case, is already in
    /// the package is skipped and reported together with its companions.
    pub fn assemble_aggregate(&self, modules: &[StrippedModule]) -> Result<AggregatePackage> {
        let mut package = Package::new(self.metadata(
            format!("{}{}", self.settings.id_prefix, self.settings.aggregate_name),
            self.aggregate_version()?,
            "Stripped All References Package".to_string(),
            "Stripped reference package containing all modules.".to_string(),
        ));

        let mut ordered: Vec<&StrippedModule> = modules.iter().collect();
        ordered.sort_by_key(|m| m.depth);

        let destination = self.destination();
        let mut included: Vec<&StrippedModule> = Vec::new();
        let mut skipped = Vec::new();
        for module in ordered {
            let name = module.file_name();
            let retained = included
                .iter()
                .find(|m| m.file_name().eq_ignore_ascii_case(&name));
            if let Some(retained) = retained {
                let identical = same_content(&module.output, &retained.output);
                warn!(
                    "skipping duplicate module {} from {} ({})",
                    name,
                    module.source.display(),
                    if identical { "identical content" } else { "different content" }
                );
                skipped.push(SkippedDuplicate {
                    skipped: module.source.clone(),
                    retained: retained.source.clone(),
                    identical,
                });
                continue;
            }

            package.add_file(format!("{destination}{name}"), &module.output);
            self.attach_companions(&mut package, module);
            included.push(module);
        }
        self.attach_extras(&mut package);

        info!(
            "aggregate package {} holds {} modules, {} duplicates skipped",
            package.metadata().id,
            included.len(),
            skipped.len()
        );
        Ok(AggregatePackage {
            package,
            included: included.iter().map(|m| m.source.clone()).collect(),
            skipped,
        })
    }

    fn metadata(
        &self,
        id: String,
        version: String,
        title: String,
        description: String,
    ) -> PackageMetadata {
        let non_blank = |value: &Option<String>| {
            value
                .as_ref()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        PackageMetadata {
            id,
            version,
            title,
            description,
            authors: self.settings.authors.clone(),
            tags: self.settings.tags.clone(),
            project_url: non_blank(&self.settings.project_url),
            icon_url: non_blank(&self.settings.icon_url),
            repository: non_blank(&self.settings.repository_url).map(Repository::from_url),
            icon: None,
            readme: None,
        }
    }

    fn attach_companions(&self, package: &mut Package, module: &StrippedModule) {
        let stem = module.stem();
        let destination = self.destination();
        let source_dir = module.source.parent().map(Path::to_path_buf);

        for companion in [Companion::Documentation, Companion::Symbols] {
            let entry = format!("{destination}{stem}.{}", companion.extension());
            if package.contains(&entry) {
                debug!("skipping duplicate {} {}", companion.label(), entry);
                continue;
            }
            let mut resolver = match companion {
                Companion::Documentation => self.settings.documentation.clone(),
                Companion::Symbols => self.settings.symbols.clone(),
            };
            if let Some(dir) = &source_dir {
                resolver = resolver.with_root(dir);
            }
            if let Some(found) = resolver.resolve(&stem, companion) {
                debug!("adding {} {}", companion.label(), found.display());
                package.add_file(entry, found);
            }
        }
    }

    fn attach_extras(&self, package: &mut Package) {
        if let Some(icon) = self.root_file(self.settings.icon_path.as_deref(), package) {
            package.metadata_mut().icon = Some(icon);
        }
        if let Some(readme) = self.root_file(self.settings.readme_path.as_deref(), package) {
            package.metadata_mut().readme = Some(readme);
        }
    }

    fn root_file(&self, path: Option<&Path>, package: &mut Package) -> Option<String> {
        let path = path.filter(|p| !p.as_os_str().is_empty())?;
        if !path.is_file() {
            warn!("{} does not exist, not attaching it", path.display());
            return None;
        }
        let name = file_name(path);
        package.add_file(name.clone(), path);
        Some(name)
    }
}
