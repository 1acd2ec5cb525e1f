//! Reference module stripping.
//!
//! A [`StripStrategy`] turns a decoded [`Module`] into its reference form in
//! place. [`create_reference_module`] drives one strategy over a file on
//! disk: read, probe, strip, re-serialize, write.
//!
//! Two strategies exist:
//!
//! - [`FilteringStripper`] applies the visibility filter, neutralizes
//!   method bodies, and scrubs configured types and attributes.
//! - [`BodyStripper`] keeps every declaration and only neutralizes bodies
//!   and scrubs configured types.

pub mod filter;
pub mod neutralize;
pub mod scrub;
mod writer;

pub use filter::{MetadataFilter, Selection};
pub use neutralize::Replacement;
pub use scrub::ScrubStats;
pub use writer::ModuleWriter;

use crate::error::{Error, Result};
use crate::image;
use crate::module::Module;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info};

/// Which declarations survive the visibility filter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    /// `PublicAndInternal` if the module exposes its internals, else `Public`
    #[default]
    Auto,
    /// Public and protected declarations
    Public,
    /// Public, protected, and internal declarations
    #[serde(alias = "internals")]
    PublicAndInternal,
    /// Everything
    All,
}

/// Minimum severity of stripping diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Per-declaration detail
    Trace,
    /// Per-module summaries
    Debug,
    /// Outputs written
    Information,
    /// Skipped inputs
    #[default]
    Warning,
    /// Failures
    Error,
    /// Failures only
    Critical,
    /// Nothing
    None,
}

impl LogLevel {
    /// The equivalent `tracing` filter directive level
    pub fn as_directive(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Information => "info",
            Self::Warning => "warn",
            Self::Error | Self::Critical => "error",
            Self::None => "off",
        }
    }
}

/// Stripping configuration, fixed for the length of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StripPolicy {
    /// Visibility filter mode
    pub filter_mode: FilterMode,
    /// Drop non-API fields while keeping value type shape
    pub omit_non_api_members: bool,
    /// Throw `NotImplementedException` instead of the bare trap
    pub make_mock: bool,
    /// Do not stamp the reference marker attribute
    pub omit_reference_assembly_attribute: bool,
    /// Minimum severity of stripping diagnostics
    pub log_level: LogLevel,
    /// Full names of types to remove along with every application of them
    pub remove_types: BTreeSet<String>,
}

impl Default for StripPolicy {
    fn default() -> Self {
        Self {
            filter_mode: FilterMode::Auto,
            omit_non_api_members: false,
            make_mock: false,
            omit_reference_assembly_attribute: false,
            log_level: LogLevel::Warning,
            remove_types: BTreeSet::new(),
        }
    }
}

impl StripPolicy {
    /// Body replacement selected by `make_mock`
    pub fn replacement(&self) -> Replacement {
        if self.make_mock {
            Replacement::Mock
        } else {
            Replacement::Trap
        }
    }

    /// Re-serializer configured for this policy
    pub fn writer(&self) -> ModuleWriter {
        ModuleWriter::new().omit_reference_marker(self.omit_reference_assembly_attribute)
    }
}

/// Counters reported by a strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StripStats {
    /// Bodies replaced by a trap
    pub bodies_neutralized: usize,
    /// Attribute applications removed
    pub attributes_removed: usize,
    /// Type declarations removed
    pub types_removed: usize,
    /// Member declarations removed
    pub members_removed: usize,
}

impl StripStats {
    fn with_scrub(mut self, scrub: ScrubStats) -> Self {
        self.attributes_removed += scrub.attributes_removed;
        self.types_removed += scrub.types_removed;
        self.members_removed += scrub.members_removed;
        self
    }
}

/// Produces the reference form of a module in place
pub trait StripStrategy {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Policy the strategy runs with
    fn policy(&self) -> &StripPolicy;

    /// Strips `module` in place
    fn strip(&self, module: &mut Module) -> Result<StripStats>;
}

/// Selects a [`StripStrategy`] implementation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StripperKind {
    /// [`FilteringStripper`]
    #[default]
    Filtering,
    /// [`BodyStripper`]
    BodiesOnly,
}

impl StripperKind {
    /// Builds the selected strategy around `policy`
    pub fn build(self, policy: StripPolicy) -> Box<dyn StripStrategy> {
        match self {
            Self::Filtering => Box::new(FilteringStripper::new(policy)),
            Self::BodiesOnly => Box::new(BodyStripper::new(policy)),
        }
    }
}

/// Visibility filter, body neutralizer, and scrubber in one pass
#[derive(Debug, Clone)]
pub struct FilteringStripper {
    policy: StripPolicy,
}

impl FilteringStripper {
    /// Creates a stripper with the given policy
    pub fn new(policy: StripPolicy) -> Self {
        Self { policy }
    }
}

impl StripStrategy for FilteringStripper {
    fn name(&self) -> &'static str {
        "filtering"
    }

    fn policy(&self) -> &StripPolicy {
        &self.policy
    }

    fn strip(&self, module: &mut Module) -> Result<StripStats> {
        let filter = MetadataFilter::new(&self.policy, module);
        let selection = filter.select(module);
        let scrubbed = scrub::scrub(module, &self.policy.remove_types, &selection);
        let stats = StripStats {
            bodies_neutralized: neutralize::neutralize(module, self.policy.replacement()),
            ..StripStats::default()
        };
        Ok(stats.with_scrub(scrubbed))
    }
}

/// Keeps every declaration; neutralizes bodies and scrubs configured types
#[derive(Debug, Clone)]
pub struct BodyStripper {
    policy: StripPolicy,
}

impl BodyStripper {
    /// Creates a stripper with the given policy
    pub fn new(policy: StripPolicy) -> Self {
        Self { policy }
    }
}

impl StripStrategy for BodyStripper {
    fn name(&self) -> &'static str {
        "bodies-only"
    }

    fn policy(&self) -> &StripPolicy {
        &self.policy
    }

    fn strip(&self, module: &mut Module) -> Result<StripStats> {
        let scrubbed = scrub::scrub(module, &self.policy.remove_types, &Selection::default());
        let stats = StripStats {
            bodies_neutralized: neutralize::neutralize(module, self.policy.replacement()),
            ..StripStats::default()
        };
        Ok(stats.with_scrub(scrubbed))
    }
}

/// Strips the module at `source` and writes its reference form to `target`
///
/// Every failure is reported as [`Error::StripFailure`] naming `source`, and
/// `target` is only created once the stripped module has serialized and
/// passed the module probe.
pub fn create_reference_module(
    strategy: &dyn StripStrategy,
    source: &Path,
    target: &Path,
) -> Result<Module> {
    let run = || -> Result<Module> {
        let mut module = image::read_file(source)?;
        debug!(
            "stripping {} ({} types) with the {} strategy",
            module.name,
            module.types.len(),
            strategy.name()
        );
        let stats = strategy.strip(&mut module)?;
        strategy.policy().writer().write_file(&mut module, target)?;
        info!(
            "wrote {}: {} bodies neutralized, {} types and {} members removed",
            target.display(),
            stats.bodies_neutralized,
            stats.types_removed,
            stats.members_removed
        );
        Ok(module)
    };
    run().map_err(|e| Error::strip_failure(source, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{
        known, FieldAttributes, FieldDef, MethodAttributes, MethodBody, MethodDef, TypeAttributes,
        TypeDef,
    };
    use crate::version::VersionSpec;
    use pretty_assertions::assert_eq;

    fn module() -> Module {
        let mut module = Module::new("Lib", VersionSpec::full(1, 4, 0, 0));
        module.add_type(
            TypeDef::new("Lib", "Api", TypeAttributes::PUBLIC)
                .with_field(FieldDef::new("cache", FieldAttributes::PRIVATE, "System.Object"))
                .with_method(
                    MethodDef::new("Run", MethodAttributes::PUBLIC)
                        .param("count", "System.Int32")
                        .with_body(MethodBody::new(vec![0x2A])),
                )
                .with_method(
                    MethodDef::new("Helper", MethodAttributes::PRIVATE)
                        .with_body(MethodBody::new(vec![0x2A])),
                ),
        );
        module.add_type(TypeDef::new("Lib", "Hidden", TypeAttributes::NOT_PUBLIC));
        module
    }

    fn policy(mode: FilterMode) -> StripPolicy {
        StripPolicy {
            filter_mode: mode,
            ..StripPolicy::default()
        }
    }

    #[test]
    fn test_filtering_stripper() {
        let mut module = module();
        let stats = FilteringStripper::new(policy(FilterMode::Public))
            .strip(&mut module)
            .unwrap();

        assert_eq!(stats.types_removed, 1);
        assert_eq!(stats.members_removed, 1);
        assert_eq!(stats.bodies_neutralized, 1);
        assert_eq!(
            module.declarations().into_iter().collect::<Vec<_>>(),
            vec![
                "F:Lib.Api::cache".to_string(),
                "M:Lib.Api::Run(System.Int32)~System.Void".to_string(),
                "T:Lib.Api".to_string(),
            ]
        );
    }

    #[test]
    fn test_body_stripper_keeps_declarations() {
        let mut module = module();
        let before = module.declarations();
        let stats = BodyStripper::new(policy(FilterMode::Public))
            .strip(&mut module)
            .unwrap();
        assert_eq!(stats.bodies_neutralized, 2);
        assert_eq!(module.declarations(), before);
    }

    #[test]
    fn test_create_reference_module() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("Lib.dll");
        let target = dir.path().join("Public").join("Lib.dll");
        std::fs::write(&source, image::encode(&module()).unwrap()).unwrap();

        let strategy = StripperKind::Filtering.build(policy(FilterMode::Public));
        let stripped = create_reference_module(strategy.as_ref(), &source, &target).unwrap();
        assert!(stripped.has_assembly_attribute(known::REFERENCE_ASSEMBLY));

        let reread = image::read_file(&target).unwrap();
        assert_eq!(reread, stripped);
    }

    #[test]
    fn test_create_reference_module_failure() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("Broken.dll");
        let target = dir.path().join("Public").join("Broken.dll");
        std::fs::write(&source, b"not a module").unwrap();

        let strategy = StripperKind::BodiesOnly.build(StripPolicy::default());
        let err = create_reference_module(strategy.as_ref(), &source, &target).unwrap_err();
        assert!(matches!(err, Error::StripFailure { .. }));
        assert!(err.to_string().contains("Broken.dll"));
        assert!(!target.exists());
    }

    #[test]
    fn test_policy_deserializes_with_defaults() {
        let policy: StripPolicy =
            serde_json::from_str(r#"{ "filter_mode": "internals", "make_mock": true }"#).unwrap();
        assert_eq!(policy.filter_mode, FilterMode::PublicAndInternal);
        assert_eq!(policy.replacement(), Replacement::Mock);
        assert_eq!(policy.log_level, LogLevel::Warning);
    }
}
