//! # refpack-core
//!
//! A library for turning compiled modules into reference surrogates and
//! shipping them as versioned packages.
//!
//! A reference module keeps the declaration surface of the original (types,
//! members, signatures, custom attributes) but none of its executable
//! logic: every method body is replaced with a sequence that throws.
//! Dependents can compile against it without access to the implementation.
//!
//! ## Architecture
//!
//! - [`module`]: In-memory declaration tree with stable tokens
//! - [`image`]: .NET PE assembly reader and writer, and the "has module metadata" probe
//! - [`strip`]: Visibility filter, body neutralizer, scrubber, re-serializer
//! - [`version`]: Four-part versions and the boost merge
//! - [`package`]: Package model, archive writer, and assembler
//! - [`pipeline`]: One configuration's run from sources to published packages
//! - [`error`]: Error types and handling
//!
//! ## Example
//!
//! ```no_run
//! use refpack_core::{
//!     create_reference_module, FilterMode, PackageAssembler, PackageSettings, StripPolicy,
//!     StripperKind, StrippedModule,
//! };
//! use std::path::Path;
//!
//! let policy = StripPolicy {
//!     filter_mode: FilterMode::Public,
//!     ..StripPolicy::default()
//! };
//! let strategy = StripperKind::Filtering.build(policy);
//!
//! let source = Path::new("game/Lib.dll");
//! let output = Path::new("Public/Lib.dll");
//! let module = create_reference_module(strategy.as_ref(), source, output)?;
//!
//! let assembler = PackageAssembler::new(PackageSettings::default());
//! let package = assembler.assemble_module(&StrippedModule {
//!     source: source.to_path_buf(),
//!     output: output.to_path_buf(),
//!     depth: 0,
//!     version: module.version,
//! })?;
//! package.save(Path::new("Packages"))?;
//! # Ok::<(), refpack_core::Error>(())
//! ```
//!
//! ## Extensibility
//!
//! - [`StripStrategy`]: Plug in a different way of producing reference modules
//! - [`Publisher`]: Send finished packages somewhere

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unreachable_pub)]

pub mod error;
pub mod image;
pub mod module;
pub mod package;
pub mod pipeline;
pub mod strip;
pub mod version;

// Re-export primary types for convenience
pub use error::{Error, Result};
pub use module::{Module, Token, TypeDef};
pub use package::{
    Package, PackageAssembler, PackageMetadata, PackageSettings, SkippedDuplicate, StrippedModule,
};
pub use pipeline::{NoPublish, Pipeline, Publisher, RunReport, RunSettings};
pub use strip::{
    create_reference_module, BodyStripper, FilterMode, FilteringStripper, LogLevel, StripPolicy,
    StripStrategy, StripperKind,
};
pub use version::VersionSpec;

/// Crate version for programmatic access
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
