//! Binary module images: .NET PE assemblies.
//!
//! A module image is an ECMA-335 assembly: a PE file whose CLI header points
//! at a metadata root with `#~`, `#Strings`, `#US`, `#GUID` and `#Blob`
//! streams. [`decode`] reads the metadata tables into a [`Module`];
//! [`encode`] lays a module out as a minimal IL-only DLL.
//!
//! [`probe`] is the "has module metadata" check used to admit source files
//! into the pipeline and to verify freshly written reference modules. It
//! loads the image with `dotscope`, so a file passes only if an independent
//! metadata reader accepts it as well.

mod decode;
mod encode;
pub(crate) mod heap;
mod pe;
mod signature;
mod tables;

use crate::error::{Error, Result};
use crate::module::Module;
use dotscope::{CilObject, ValidationConfig};
use std::path::Path;
use tracing::trace;

/// Checks that `data` is a .NET assembly whose manifest names it
pub fn probe(data: &[u8]) -> Result<()> {
    CilObject::from_mem_with_validation(data.to_vec(), ValidationConfig::minimal())
        .map_err(|e| Error::malformed(format!("not a loadable .NET assembly: {e}")))?;
    let name = decode::read_assembly_name(data)?;
    if name.trim().is_empty() {
        return Err(Error::malformed("assembly manifest has no name"));
    }
    Ok(())
}

/// Returns true if the file at `path` carries module metadata
///
/// Unreadable files are reported as invalid, never as errors.
pub fn probe_file(path: impl AsRef<Path>) -> bool {
    probe_path(path.as_ref()).is_ok()
}

/// Like [`probe_file`], keeping the reason a file was rejected
///
/// Every failure, unreadable files included, is an [`Error::InvalidModule`].
pub fn probe_path(path: &Path) -> Result<()> {
    let data = std::fs::read(path).map_err(|e| Error::invalid_module(path, e.to_string()))?;
    probe(&data).map_err(|e| {
        trace!("{} failed module probe: {}", path.display(), e);
        Error::invalid_module(path, e.to_string())
    })
}

/// Decodes and validates a module image
pub fn decode(data: &[u8]) -> Result<Module> {
    let module = decode::read_module(data)?;
    module.validate()?;
    Ok(module)
}

/// Validates and encodes a module into image bytes
pub fn encode(module: &Module) -> Result<Vec<u8>> {
    module.validate()?;
    encode::write_module(module)
}

/// Reads and decodes a module image from disk
pub fn read_file(path: impl AsRef<Path>) -> Result<Module> {
    let path = path.as_ref();
    let data = std::fs::read(path).map_err(|e| Error::file_read(path, e))?;
    decode(&data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{
        known, AttributeArg, Constant, CustomAttribute, EventDef, FieldAttributes, FieldDef,
        GenericParam, MemberRef, MemberSignature, MethodAttributes, MethodBody, MethodDef,
        MethodSignature, PropertyDef, Token, TypeAttributes, TypeDef, TypeName, TypeSig,
    };
    use crate::version::VersionSpec;
    use pretty_assertions::assert_eq;

    fn ctor() -> MethodDef {
        MethodDef::new(
            ".ctor",
            MethodAttributes::PUBLIC
                | MethodAttributes::HIDE_BY_SIG
                | MethodAttributes::SPECIAL_NAME
                | MethodAttributes::RT_SPECIAL_NAME,
        )
        .with_body(MethodBody::trap())
    }

    fn sample() -> Module {
        let mut module = Module::new("Lib", VersionSpec::full(1, 4, 0, 0));
        module.assembly_attributes.push(
            CustomAttribute::new(TypeName::core(known::INTERNALS_VISIBLE_TO))
                .with_arg(AttributeArg::String("Lib.Tests".into())),
        );
        let message = module.intern_user_string("size unavailable");
        let exception = module.import_member(MemberRef {
            parent: TypeSig::core("System.InvalidOperationException"),
            name: ".ctor".into(),
            signature: MemberSignature::Method(MethodSignature::instance(
                TypeSig::Void,
                [TypeSig::String],
            )),
        });

        let widget = module.add_type(
            TypeDef::new("Lib", "Widget", TypeAttributes::PUBLIC | TypeAttributes::SEQUENTIAL_LAYOUT)
                .with_layout(16, 4)
                .with_field(FieldDef::new("size", FieldAttributes::PRIVATE, "System.Int32"))
                .with_field(
                    FieldDef::new(
                        "Limit",
                        FieldAttributes::PUBLIC | FieldAttributes::STATIC | FieldAttributes::LITERAL,
                        "System.Int32",
                    )
                    .with_constant(Constant::int32(64)),
                )
                .with_method(ctor())
                .with_method(
                    MethodDef::new(
                        "get_Size",
                        MethodAttributes::PUBLIC | MethodAttributes::SPECIAL_NAME,
                    )
                    .returns("System.Int32")
                    .with_body(MethodBody::throwing(message, exception)),
                )
                .with_method(
                    MethodDef::new("Resize", MethodAttributes::PUBLIC)
                        .param("size", TypeSig::I4)
                        .param("items", TypeSig::local("Lib.Widget/Token").array())
                        .with_body(MethodBody::trap()),
                )
                .with_method(
                    MethodDef::new("add_Changed", MethodAttributes::PUBLIC | MethodAttributes::SPECIAL_NAME)
                        .param("value", TypeSig::core("System.EventHandler"))
                        .with_body(MethodBody::trap()),
                )
                .with_method(
                    MethodDef::new("remove_Changed", MethodAttributes::PUBLIC | MethodAttributes::SPECIAL_NAME)
                        .param("value", TypeSig::core("System.EventHandler"))
                        .with_body(MethodBody::trap()),
                )
                .with_property(PropertyDef::new("Size", "System.Int32").getter("get_Size"))
                .with_event(
                    EventDef::new("Changed", TypeSig::core("System.EventHandler"))
                        .accessors_named("add_Changed", "remove_Changed"),
                ),
        );
        module.add_type(
            TypeDef::new("", "Token", TypeAttributes::NESTED_ASSEMBLY)
                .nested_in(widget)
                .with_attribute(
                    CustomAttribute::new(TypeName::core("System.ObsoleteAttribute"))
                        .with_arg(AttributeArg::String("use handles".into())),
                )
                .with_method(ctor()),
        );
        let mut pool = TypeDef::new("Lib", "Pool`1", TypeAttributes::PUBLIC)
            .implements(TypeSig::GenericInst {
                value_type: false,
                definition: TypeName::core("System.Collections.Generic.IEnumerable`1"),
                arguments: vec![TypeSig::Var(0)],
            })
            .with_method(ctor());
        let mut item = GenericParam::new("T");
        item.constraints.push(TypeSig::local("Lib.Widget"));
        pool.generic_params.push(item);
        module.add_type(pool);
        module
    }

    #[test]
    fn test_encode_decode_preserves_tree() {
        let module = sample();
        let bytes = encode(&module).unwrap();
        assert_eq!(&bytes[..2], b"MZ");
        assert_eq!(decode(&bytes).unwrap(), module);
    }

    #[test]
    fn test_absent_version_components_are_written_as_zero() {
        let mut module = sample();
        module.version = VersionSpec::new(Some(1), Some(4), None, None);
        let decoded = decode(&encode(&module).unwrap()).unwrap();
        assert_eq!(decoded.version, VersionSpec::full(1, 4, 0, 0));
    }

    #[test]
    fn test_written_images_load_in_dotscope() {
        let bytes = encode(&sample()).unwrap();
        probe(&bytes).unwrap();
        let assembly =
            CilObject::from_mem_with_validation(bytes, ValidationConfig::production()).unwrap();
        assert!(assembly.types().len() >= 4);
    }

    #[test]
    fn test_probe_rejects_foreign_data() {
        assert!(probe(b"MZ\x90\x00\x03\x00\x00\x00").is_err());
        assert!(probe(b"plain text").is_err());
        let mut bytes = encode(&sample()).unwrap();
        bytes[0x80] = b'X';
        assert!(probe(&bytes).is_err());
    }

    #[test]
    fn test_decode_rejects_truncated_images() {
        let bytes = encode(&sample()).unwrap();
        assert!(decode(&bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn test_encode_rejects_malformed_tree() {
        let mut module = sample();
        module.types[1].enclosing = Some(Token::new(0x02, 99));
        assert!(matches!(encode(&module), Err(Error::Malformed(_))));
    }

    #[test]
    fn test_probe_file() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("Lib.dll");
        let bad = dir.path().join("notes.dll");
        std::fs::write(&good, encode(&sample()).unwrap()).unwrap();
        std::fs::write(&bad, b"plain text").unwrap();
        assert!(probe_file(&good));
        assert!(!probe_file(&bad));
        assert!(!probe_file(dir.path().join("missing.dll")));
        assert!(matches!(probe_path(&bad), Err(Error::InvalidModule { .. })));
        assert!(matches!(
            probe_path(&dir.path().join("missing.dll")),
            Err(Error::InvalidModule { .. })
        ));
    }
}
