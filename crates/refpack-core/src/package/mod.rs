//! Package archives.
//!
//! A [`Package`] is an id, a version, descriptive metadata, and an ordered
//! list of payload entries. [`Package::save`] writes it as a NuGet-style
//! `.nupkg` ZIP archive:
//!
//! ```text
//! [Content_Types].xml
//! _rels/.rels
//! <id>.nuspec
//! ref/<framework>/<Module>.dll
//! ref/<framework>/<Module>.xml
//! ...
//! ```
//!
//! Entries are written in insertion order with a fixed timestamp, so the
//! same package always produces the same bytes.

mod assemble;
mod manifest;

pub use assemble::{
    AggregatePackage, Companion, CompanionResolver, PackageAssembler, PackageSettings,
    SkippedDuplicate, StrippedModule, DEFAULT_AGGREGATE_NAME, DEFAULT_AGGREGATE_VERSION,
    FALLBACK_MODULE_VERSION,
};
pub(crate) use assemble::same_content;

use crate::error::{Error, Result};
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

/// File extension of package archives
pub const PACKAGE_EXTENSION: &str = "nupkg";

/// Source repository of a package
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Repository {
    /// Repository type, e.g. `git`
    pub kind: String,
    /// Repository location
    pub url: String,
}

impl Repository {
    /// Derives the repository type from the URL's extension (`.../lib.git` is `git`)
    pub fn from_url(url: impl Into<String>) -> Self {
        let url = url.into();
        let last = url.trim_end_matches('/').rsplit('/').next().unwrap_or_default();
        let kind = last
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_string())
            .unwrap_or_default();
        Self { kind, url }
    }
}

/// Descriptive metadata written to the package manifest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageMetadata {
    /// Package id
    pub id: String,
    /// Package version, including any release label
    pub version: String,
    /// Human readable title
    pub title: String,
    /// Description
    pub description: String,
    /// Authors; the id is used when empty
    pub authors: Vec<String>,
    /// Search tags
    pub tags: Vec<String>,
    /// Project home page
    pub project_url: Option<String>,
    /// Remote icon location
    pub icon_url: Option<String>,
    /// Source repository
    pub repository: Option<Repository>,
    /// Name of the icon file at the archive root
    pub icon: Option<String>,
    /// Name of the readme file at the archive root
    pub readme: Option<String>,
}

/// One payload file of a package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageEntry {
    /// Path inside the archive, `/` separated
    pub path: String,
    /// File the entry's bytes are read from
    pub source: PathBuf,
}

/// A package ready to be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    metadata: PackageMetadata,
    entries: Vec<PackageEntry>,
}

impl Package {
    /// Creates a package without payload
    pub fn new(metadata: PackageMetadata) -> Self {
        Self {
            metadata,
            entries: Vec::new(),
        }
    }

    /// Package metadata
    pub fn metadata(&self) -> &PackageMetadata {
        &self.metadata
    }

    /// Package metadata for mutation
    pub fn metadata_mut(&mut self) -> &mut PackageMetadata {
        &mut self.metadata
    }

    /// Payload entries in insertion order
    pub fn entries(&self) -> &[PackageEntry] {
        &self.entries
    }

    /// Returns true if an entry with `path` exists, ignoring ASCII case
    pub fn contains(&self, path: &str) -> bool {
        self.entries.iter().any(|e| e.path.eq_ignore_ascii_case(path))
    }

    /// Adds a payload file
    ///
    /// Returns false and leaves the package unchanged if the path is
    /// already taken (ignoring ASCII case).
    pub fn add_file(&mut self, path: impl Into<String>, source: impl Into<PathBuf>) -> bool {
        let path = path.into();
        if self.contains(&path) {
            return false;
        }
        self.entries.push(PackageEntry {
            path,
            source: source.into(),
        });
        true
    }

    /// Archive file name, `<id>.nupkg`
    pub fn file_name(&self) -> String {
        format!("{}.{PACKAGE_EXTENSION}", self.metadata.id)
    }

    /// Manifest file name, `<id>.nuspec`
    pub fn manifest_name(&self) -> String {
        format!("{}.nuspec", self.metadata.id)
    }

    /// Builds the archive in memory
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let name = self.file_name();
        let fail = |reason: &dyn std::fmt::Display| Error::package_write(&name, reason);

        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(DateTime::default());
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));

        let add = |zip: &mut ZipWriter<Cursor<Vec<u8>>>, path: &str, data: &[u8]| -> Result<()> {
            zip.start_file(path, options).map_err(|e| fail(&e))?;
            zip.write_all(data).map_err(|e| fail(&e))
        };

        let content_types = manifest::content_types(self.entries.iter().map(|e| e.path.as_str()))?;
        add(&mut zip, "[Content_Types].xml", &content_types)?;
        add(&mut zip, "_rels/.rels", &manifest::relationships(&self.manifest_name())?)?;
        add(&mut zip, &self.manifest_name(), &manifest::nuspec(&self.metadata)?)?;

        for entry in &self.entries {
            let data = fs::read(&entry.source).map_err(|e| {
                fail(&format!("cannot read {}: {e}", entry.source.display()))
            })?;
            add(&mut zip, &entry.path, &data)?;
            debug!("packed {} ({} bytes)", entry.path, data.len());
        }

        let cursor = zip.finish().map_err(|e| fail(&e))?;
        Ok(cursor.into_inner())
    }

    /// Writes the archive into `dir` and returns its path
    ///
    /// The archive is built in memory first, so a failure leaves no partial
    /// file behind.
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(self.file_name());
        let bytes = self.to_bytes()?;
        fs::write(&path, bytes).map_err(|e| Error::package_write(&path, e))?;
        info!(
            "saved package {} {} to {}",
            self.metadata.id,
            self.metadata.version,
            path.display()
        );
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn package(dir: &Path) -> Package {
        let dll = dir.join("Lib.dll");
        fs::write(&dll, b"module bytes").unwrap();
        let mut package = Package::new(PackageMetadata {
            id: "Ref.Lib".into(),
            version: "1.5.0.0".into(),
            description: "Stripped reference package for Lib.dll.".into(),
            ..PackageMetadata::default()
        });
        assert!(package.add_file("ref/net472/Lib.dll", &dll));
        package
    }

    #[test]
    fn test_repository_kind_from_url() {
        assert_eq!(Repository::from_url("https://host/org/lib.git").kind, "git");
        assert_eq!(Repository::from_url("https://host/org/lib").kind, "");
        assert_eq!(Repository::from_url("https://host/org/lib.hg/").kind, "hg");
    }

    #[test]
    fn test_add_file_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let mut package = package(dir.path());
        assert!(!package.add_file("REF/net472/lib.DLL", dir.path().join("Other.dll")));
        assert_eq!(package.entries().len(), 1);
    }

    #[test]
    fn test_archive_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = package(dir.path()).save(dir.path()).unwrap();
        assert_eq!(path.file_name().unwrap(), "Ref.Lib.nupkg");

        let mut archive = zip::ZipArchive::new(fs::File::open(&path).unwrap()).unwrap();
        let names: Vec<String> = archive.file_names().map(str::to_string).collect();
        for expected in ["[Content_Types].xml", "_rels/.rels", "Ref.Lib.nuspec", "ref/net472/Lib.dll"] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }

        let mut data = Vec::new();
        archive
            .by_name("ref/net472/Lib.dll")
            .unwrap()
            .read_to_end(&mut data)
            .unwrap();
        assert_eq!(data, b"module bytes");
    }

    #[test]
    fn test_archive_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let package = package(dir.path());
        assert_eq!(package.to_bytes().unwrap(), package.to_bytes().unwrap());
    }

    #[test]
    fn test_missing_payload_is_package_write_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut package = package(dir.path());
        package.add_file("ref/net472/Gone.xml", dir.path().join("Gone.xml"));
        let err = package.save(dir.path()).unwrap_err();
        assert!(matches!(err, Error::PackageWrite { .. }));
        assert!(!dir.path().join("Ref.Lib.nupkg").exists());
    }
}
