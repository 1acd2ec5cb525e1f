//! One configuration's run: strip every source, package, publish.
//!
//! Failures are contained at the smallest unit of work. A source that is
//! not a module, a module that fails to strip, a package that cannot be
//! versioned or written, and a failed upload are each logged and recorded in
//! the [`RunReport`]; the run carries on with the next item. Only a failure
//! to prepare the output directories ends the run early.

use crate::error::{Error, Result};
use crate::image;
use crate::package::{same_content, Package, PackageAssembler, SkippedDuplicate, StrippedModule};
use crate::strip::{create_reference_module, StripStrategy};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Hands finished packages to a package feed
pub trait Publisher {
    /// Where packages go, for logs
    fn destination(&self) -> &str;

    /// Returns false if publishing is switched off
    fn is_enabled(&self) -> bool {
        true
    }

    /// Uploads the package at `package`
    fn publish(&mut self, package: &Path) -> Result<()>;
}

/// A [`Publisher`] that keeps packages local
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPublish;

impl Publisher for NoPublish {
    fn destination(&self) -> &str {
        "nowhere"
    }

    fn is_enabled(&self) -> bool {
        false
    }

    fn publish(&mut self, _package: &Path) -> Result<()> {
        Ok(())
    }
}

/// Output locations and packaging mode of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSettings {
    /// Root the sources were discovered under
    pub source_root: PathBuf,
    /// Where reference modules are written; emptied at the start of a run
    pub module_output_dir: PathBuf,
    /// Where packages are written
    pub package_output_dir: PathBuf,
    /// One package for all modules instead of one per module
    pub aggregate: bool,
}

/// What a run produced
#[derive(Debug, Default)]
pub struct RunReport {
    /// Reference modules written
    pub stripped: Vec<StrippedModule>,
    /// Sources that are not modules, as [`Error::InvalidModule`]
    pub invalid: Vec<Error>,
    /// Same-named sources left out of the aggregate package
    pub duplicates: Vec<SkippedDuplicate>,
    /// Packages written
    pub packages: Vec<PathBuf>,
    /// Packages uploaded
    pub published: Vec<PathBuf>,
    /// Everything that went wrong, in order
    pub failures: Vec<Error>,
}

impl RunReport {
    /// Returns true if nothing failed
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Runs a strategy and an assembler over discovered sources
pub struct Pipeline {
    settings: RunSettings,
    strategy: Box<dyn StripStrategy>,
    assembler: PackageAssembler,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("settings", &self.settings)
            .field("strategy", &self.strategy.name())
            .field("assembler", &self.assembler)
            .finish()
    }
}

impl Pipeline {
    /// Creates a pipeline
    pub fn new(
        settings: RunSettings,
        strategy: Box<dyn StripStrategy>,
        assembler: PackageAssembler,
    ) -> Self {
        Self {
            settings,
            strategy,
            assembler,
        }
    }

    /// Run settings
    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Directory depth of `source` below the source root
    pub fn depth(&self, source: &Path) -> usize {
        source
            .strip_prefix(&self.settings.source_root)
            .map(|relative| relative.components().count().saturating_sub(1))
            .unwrap_or(0)
    }

    /// Empties the module output directory and creates both output directories
    pub fn prepare_output(&self) -> Result<()> {
        let modules = &self.settings.module_output_dir;
        if self.settings.source_root.starts_with(modules) {
            return Err(Error::setup(
                modules,
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "module output directory contains the source root",
                ),
            ));
        }
        if modules.exists() {
            info!("cleaning up existing output directory {}", modules.display());
            fs::remove_dir_all(modules).map_err(|e| Error::setup(modules, e))?;
        }
        fs::create_dir_all(modules).map_err(|e| Error::setup(modules, e))?;

        let packages = &self.settings.package_output_dir;
        fs::create_dir_all(packages).map_err(|e| Error::setup(packages, e))
    }

    /// Strips, packages, and publishes `sources`
    ///
    /// Returns an error only if the output directories cannot be prepared.
    pub fn run(&self, sources: &[PathBuf], publisher: &mut dyn Publisher) -> Result<RunReport> {
        self.prepare_output()?;
        info!(
            "stripping {} candidate files from {}",
            sources.len(),
            self.settings.source_root.display()
        );

        let mut ordered: Vec<&PathBuf> = sources.iter().collect();
        if self.settings.aggregate {
            // shallower modules claim their file name first
            ordered.sort_by_key(|source| self.depth(source));
        }

        let mut report = RunReport::default();
        for source in ordered {
            let Some(name) = source.file_name() else {
                continue;
            };
            if let Err(e) = image::probe_path(source) {
                warn!("skipping {}", e);
                report.invalid.push(e);
                continue;
            }

            if self.settings.aggregate {
                let name = name.to_string_lossy();
                let retained = report
                    .stripped
                    .iter()
                    .find(|m| m.file_name().eq_ignore_ascii_case(&name))
                    .map(|m| m.source.clone());
                if let Some(retained) = retained {
                    let identical = same_content(source, &retained);
                    warn!(
                        "skipping duplicate module {} ({} content as {})",
                        source.display(),
                        if identical { "same" } else { "different" },
                        retained.display()
                    );
                    report.duplicates.push(SkippedDuplicate {
                        skipped: source.clone(),
                        retained,
                        identical,
                    });
                    continue;
                }
            }

            let target = self.settings.module_output_dir.join(name);
            let module = match create_reference_module(self.strategy.as_ref(), source, &target) {
                Ok(module) => module,
                Err(e) => {
                    error!("{}", e);
                    report.failures.push(e);
                    continue;
                }
            };
            info!("stripped {} to {}", source.display(), target.display());

            let stripped = StrippedModule {
                source: source.clone(),
                output: target,
                depth: self.depth(source),
                version: module.version,
            };
            if !self.settings.aggregate {
                let package = self.assembler.assemble_module(&stripped);
                self.deliver(package, publisher, &mut report);
            }
            report.stripped.push(stripped);
        }

        if self.settings.aggregate && !report.stripped.is_empty() {
            match self.assembler.assemble_aggregate(&report.stripped) {
                Ok(aggregate) => {
                    report.duplicates.extend(aggregate.skipped);
                    self.deliver(Ok(aggregate.package), publisher, &mut report);
                }
                Err(e) => {
                    error!("{}", e);
                    report.failures.push(e);
                }
            }
        }

        info!(
            "run finished: {} stripped, {} packages, {} published, {} skipped, {} failed",
            report.stripped.len(),
            report.packages.len(),
            report.published.len(),
            report.invalid.len() + report.duplicates.len(),
            report.failures.len()
        );
        Ok(report)
    }

    fn deliver(
        &self,
        package: Result<Package>,
        publisher: &mut dyn Publisher,
        report: &mut RunReport,
    ) {
        let saved = package.and_then(|p| p.save(&self.settings.package_output_dir));
        let path = match saved {
            Ok(path) => path,
            Err(e) => {
                error!("{}", e);
                report.failures.push(e);
                return;
            }
        };
        report.packages.push(path.clone());

        if !publisher.is_enabled() {
            debug!("publishing disabled, keeping {} local", path.display());
            return;
        }
        info!("publishing {} to {}", path.display(), publisher.destination());
        match publisher.publish(&path) {
            Ok(()) => {
                info!("published {}", path.display());
                report.published.push(path);
            }
            Err(e) => {
                error!("{}", e);
                report.failures.push(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{
        opcodes, MethodAttributes, MethodBody, MethodDef, Module, TypeAttributes, TypeDef,
    };
    use crate::package::PackageSettings;
    use crate::strip::{StripPolicy, StripperKind};
    use crate::version::VersionSpec;

    struct Recording {
        fail: bool,
        seen: Vec<PathBuf>,
    }

    impl Publisher for Recording {
        fn destination(&self) -> &str {
            "https://feed.invalid/v3/index.json"
        }

        fn publish(&mut self, package: &Path) -> Result<()> {
            self.seen.push(package.to_path_buf());
            if self.fail {
                Err(Error::publish(package, self.destination(), "rejected"))
            } else {
                Ok(())
            }
        }
    }

    fn write_module(path: &Path, name: &str) {
        let mut module = Module::new(name, VersionSpec::full(1, 0, 0, 0));
        module.add_type(
            TypeDef::new(name, "Api", TypeAttributes::PUBLIC).with_method(
                MethodDef::new("Run", MethodAttributes::PUBLIC)
                    .with_body(MethodBody::new(vec![opcodes::RET])),
            ),
        );
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, image::encode(&module).unwrap()).unwrap();
    }

    fn pipeline(root: &Path, aggregate: bool) -> Pipeline {
        Pipeline::new(
            RunSettings {
                source_root: root.join("game"),
                module_output_dir: root.join("Public"),
                package_output_dir: root.join("Packages"),
                aggregate,
            },
            StripperKind::Filtering.build(StripPolicy::default()),
            PackageAssembler::new(PackageSettings::default()),
        )
    }

    #[test]
    fn test_depth() {
        let pipeline = pipeline(Path::new("/data"), false);
        assert_eq!(pipeline.depth(Path::new("/data/game/Lib.dll")), 0);
        assert_eq!(pipeline.depth(Path::new("/data/game/a/b/Lib.dll")), 2);
        assert_eq!(pipeline.depth(Path::new("/elsewhere/Lib.dll")), 0);
    }

    #[test]
    fn test_invalid_sources_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("game").join("Lib.dll");
        let bad = dir.path().join("game").join("native.dll");
        write_module(&good, "Lib");
        fs::write(&bad, b"MZ\x90\x00\x03\x00\x00\x00\x04\x00").unwrap();

        let report = pipeline(dir.path(), false)
            .run(&[bad.clone(), good], &mut NoPublish)
            .unwrap();
        assert_eq!(report.invalid.len(), 1);
        assert!(matches!(&report.invalid[0], Error::InvalidModule { path, .. } if *path == bad));
        assert_eq!(report.stripped.len(), 1);
        assert_eq!(report.packages, vec![dir.path().join("Packages").join("Lib.nupkg")]);
        assert!(report.published.is_empty());
        assert!(report.is_clean());
    }

    #[test]
    fn test_output_directory_is_cleaned() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join("Public").join("Stale.dll");
        fs::create_dir_all(stale.parent().unwrap()).unwrap();
        fs::write(&stale, b"old").unwrap();

        pipeline(dir.path(), false).run(&[], &mut NoPublish).unwrap();
        assert!(!stale.exists());
        assert!(dir.path().join("Packages").is_dir());
    }

    #[test]
    fn test_setup_failure_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("Packages");
        fs::write(&blocker, b"a file where a directory should be").unwrap();

        let err = pipeline(dir.path(), false).run(&[], &mut NoPublish).unwrap_err();
        assert!(matches!(err, Error::Setup { .. }));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_publish_failure_is_contained() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("game").join("A.dll");
        let second = dir.path().join("game").join("B.dll");
        write_module(&first, "A");
        write_module(&second, "B");

        let mut publisher = Recording {
            fail: true,
            seen: Vec::new(),
        };
        let report = pipeline(dir.path(), false)
            .run(&[first, second], &mut publisher)
            .unwrap();
        assert_eq!(publisher.seen.len(), 2);
        assert_eq!(report.packages.len(), 2);
        assert!(report.published.is_empty());
        assert_eq!(report.failures.len(), 2);
        assert!(report
            .failures
            .iter()
            .all(|e| matches!(e, Error::Publish { .. })));
    }

    #[test]
    fn test_aggregate_keeps_shallow_module() {
        let dir = tempfile::tempdir().unwrap();
        let deep = dir.path().join("game").join("x").join("y").join("Foo.dll");
        let shallow = dir.path().join("game").join("Foo.dll");
        write_module(&deep, "FooDeep");
        write_module(&shallow, "Foo");

        let mut publisher = Recording {
            fail: false,
            seen: Vec::new(),
        };
        let report = pipeline(dir.path(), true)
            .run(&[deep.clone(), shallow.clone()], &mut publisher)
            .unwrap();

        assert_eq!(report.stripped.len(), 1);
        assert_eq!(report.stripped[0].source, shallow);
        assert_eq!(report.duplicates.len(), 1);
        assert_eq!(report.duplicates[0].skipped, deep);
        assert!(!report.duplicates[0].identical);
        assert_eq!(
            report.packages,
            vec![dir.path().join("Packages").join("AllReferences.nupkg")]
        );
        assert_eq!(report.published, report.packages);

        let written = image::read_file(dir.path().join("Public").join("Foo.dll")).unwrap();
        assert_eq!(written.name, "Foo");
    }
}
