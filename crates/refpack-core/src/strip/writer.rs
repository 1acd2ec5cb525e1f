//! Re-serialization of stripped modules.

use crate::error::{Error, Result};
use crate::image;
use crate::module::{known, CustomAttribute, Module};
use std::fs;
use std::path::Path;
use tracing::trace;

/// Serializes stripped modules and stamps them as reference modules
#[derive(Debug, Clone, Copy, Default)]
pub struct ModuleWriter {
    omit_reference_marker: bool,
}

impl ModuleWriter {
    /// Creates a writer that adds the reference marker
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip adding the reference marker
    pub fn omit_reference_marker(mut self, omit: bool) -> Self {
        self.omit_reference_marker = omit;
        self
    }

    /// Adds the marker if needed and encodes the module
    ///
    /// The encoded bytes are loaded back through the module probe before
    /// they are returned, so a caller never persists an image the pipeline
    /// would reject.
    pub fn serialize(&self, module: &mut Module) -> Result<Vec<u8>> {
        if !self.omit_reference_marker && !module.has_assembly_attribute(known::REFERENCE_ASSEMBLY) {
            trace!("marking {} as a reference module", module.name);
            let marker = module.core_type(known::REFERENCE_ASSEMBLY);
            module.assembly_attributes.push(CustomAttribute::new(marker));
        }
        let bytes = image::encode(module)?;
        image::probe(&bytes)?;
        Ok(bytes)
    }

    /// Serializes `module` and writes it to `target`
    ///
    /// Nothing is written unless serialization succeeds.
    pub fn write_file(&self, module: &mut Module, target: &Path) -> Result<()> {
        let bytes = self.serialize(module)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::file_write(parent, e))?;
        }
        fs::write(target, bytes).map_err(|e| Error::file_write(target, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{Token, TypeAttributes, TypeDef, TypeName};
    use crate::version::VersionSpec;

    fn module() -> Module {
        let mut module = Module::new("Lib", VersionSpec::full(1, 0, 0, 0));
        module.add_type(TypeDef::new("Lib", "Api", TypeAttributes::PUBLIC));
        module
    }

    #[test]
    fn test_marker_added_once() {
        let writer = ModuleWriter::new();
        let mut module = module();
        writer.serialize(&mut module).unwrap();
        writer.serialize(&mut module).unwrap();
        let markers = module
            .assembly_attributes
            .iter()
            .filter(|a| a.is(known::REFERENCE_ASSEMBLY))
            .count();
        assert_eq!(markers, 1);
    }

    #[test]
    fn test_marker_names_the_core_library_type() {
        let mut module = module();
        ModuleWriter::new().serialize(&mut module).unwrap();
        assert_eq!(
            module.assembly_attributes[0].attribute_type,
            TypeName::core(known::REFERENCE_ASSEMBLY)
        );
    }

    #[test]
    fn test_marker_can_be_omitted() {
        let mut module = module();
        let bytes = ModuleWriter::new()
            .omit_reference_marker(true)
            .serialize(&mut module)
            .unwrap();
        assert!(!image::decode(&bytes)
            .unwrap()
            .has_assembly_attribute(known::REFERENCE_ASSEMBLY));
    }

    #[test]
    fn test_failed_serialization_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out").join("Lib.dll");
        let mut module = module();
        module.types[0].token = Token::NULL;

        assert!(ModuleWriter::new().write_file(&mut module, &target).is_err());
        assert!(!target.exists());
    }

    #[test]
    fn test_write_file_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("Lib.dll");
        ModuleWriter::new().write_file(&mut module(), &target).unwrap();
        assert!(image::probe_file(&target));
    }
}
