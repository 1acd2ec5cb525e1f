//! Signature blobs (ECMA-335 II.23.2).
//!
//! Named types inside a blob are TypeDef or TypeRef tokens. Reading takes a
//! resolver from token to [`TypeName`]; writing takes one from name back to
//! token, so neither side needs to know how the tables are laid out.

use super::heap::{read_compressed, read_compressed_signed, write_compressed, write_compressed_signed};
use crate::error::{Error, Result};
use crate::module::{table, MemberSignature, MethodSignature, Parameter, Token, TypeName, TypeScope, TypeSig};

mod element {
    pub(super) const VOID: u8 = 0x01;
    pub(super) const BOOLEAN: u8 = 0x02;
    pub(super) const CHAR: u8 = 0x03;
    pub(super) const I1: u8 = 0x04;
    pub(super) const U1: u8 = 0x05;
    pub(super) const I2: u8 = 0x06;
    pub(super) const U2: u8 = 0x07;
    pub(super) const I4: u8 = 0x08;
    pub(super) const U4: u8 = 0x09;
    pub(super) const I8: u8 = 0x0A;
    pub(super) const U8: u8 = 0x0B;
    pub(super) const R4: u8 = 0x0C;
    pub(super) const R8: u8 = 0x0D;
    pub(super) const STRING: u8 = 0x0E;
    pub(super) const PTR: u8 = 0x0F;
    pub(super) const BYREF: u8 = 0x10;
    pub(super) const VALUETYPE: u8 = 0x11;
    pub(super) const CLASS: u8 = 0x12;
    pub(super) const VAR: u8 = 0x13;
    pub(super) const ARRAY: u8 = 0x14;
    pub(super) const GENERICINST: u8 = 0x15;
    pub(super) const TYPEDBYREF: u8 = 0x16;
    pub(super) const I: u8 = 0x18;
    pub(super) const U: u8 = 0x19;
    pub(super) const FNPTR: u8 = 0x1B;
    pub(super) const OBJECT: u8 = 0x1C;
    pub(super) const SZARRAY: u8 = 0x1D;
    pub(super) const MVAR: u8 = 0x1E;
    pub(super) const CMOD_REQD: u8 = 0x1F;
    pub(super) const CMOD_OPT: u8 = 0x20;
    pub(super) const SENTINEL: u8 = 0x41;
}

const FIELD: u8 = 0x06;
const PROPERTY: u8 = 0x08;
const HAS_THIS: u8 = 0x20;
const EXPLICIT_THIS: u8 = 0x40;
const GENERIC: u8 = 0x10;
const VARARG: u8 = 0x05;

/// Maps a TypeDef or TypeRef token to the name it declares
pub(crate) type NameResolver<'r> = &'r dyn Fn(Token) -> Result<TypeName>;

/// Maps a name to the TypeDef or TypeRef token that declares it
pub(crate) type TokenResolver<'r> = &'r mut dyn FnMut(&TypeName) -> Result<Token>;

const PRIMITIVE_ELEMENTS: [(u8, TypeSig); 18] = [
    (element::VOID, TypeSig::Void),
    (element::BOOLEAN, TypeSig::Boolean),
    (element::CHAR, TypeSig::Char),
    (element::I1, TypeSig::I1),
    (element::U1, TypeSig::U1),
    (element::I2, TypeSig::I2),
    (element::U2, TypeSig::U2),
    (element::I4, TypeSig::I4),
    (element::U4, TypeSig::U4),
    (element::I8, TypeSig::I8),
    (element::U8, TypeSig::U8),
    (element::R4, TypeSig::R4),
    (element::R8, TypeSig::R8),
    (element::STRING, TypeSig::String),
    (element::OBJECT, TypeSig::Object),
    (element::I, TypeSig::IntPtr),
    (element::U, TypeSig::UIntPtr),
    (element::TYPEDBYREF, TypeSig::TypedReference),
];

struct Reader<'a, 'r> {
    data: &'a [u8],
    at: usize,
    names: NameResolver<'r>,
}

impl Reader<'_, '_> {
    fn truncated(&self) -> Error {
        Error::malformed(format!("signature blob is truncated at byte {}", self.at))
    }

    fn byte(&mut self) -> Result<u8> {
        let byte = *self.data.get(self.at).ok_or_else(|| self.truncated())?;
        self.at += 1;
        Ok(byte)
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.at).copied()
    }

    fn compressed(&mut self) -> Result<u32> {
        let (value, used) = read_compressed(&self.data[self.at.min(self.data.len())..])
            .ok_or_else(|| self.truncated())?;
        self.at += used;
        Ok(value)
    }

    fn compressed_signed(&mut self) -> Result<i32> {
        let (value, used) = read_compressed_signed(&self.data[self.at.min(self.data.len())..])
            .ok_or_else(|| self.truncated())?;
        self.at += used;
        Ok(value)
    }

    /// A TypeDefOrRefOrSpecEncoded value that must not be a TypeSpec
    fn type_name(&mut self) -> Result<TypeName> {
        let encoded = self.compressed()?;
        let row = encoded >> 2;
        let token = match encoded & 3 {
            0 => Token::new(table::TYPE_DEF, row),
            1 => Token::new(table::TYPE_REF, row),
            _ => {
                return Err(Error::malformed(
                    "type specification used where a named type is required",
                ))
            }
        };
        (self.names)(token)
    }

    fn type_sig(&mut self) -> Result<TypeSig> {
        let code = self.byte()?;
        if let Some((_, primitive)) = PRIMITIVE_ELEMENTS.iter().find(|(c, _)| *c == code) {
            return Ok(primitive.clone());
        }
        Ok(match code {
            element::CLASS | element::VALUETYPE => {
                let name = self.type_name()?;
                match TypeSig::primitive(&name.full_name) {
                    Some(primitive) if name.scope == TypeScope::CoreLibrary => primitive,
                    _ if code == element::VALUETYPE => TypeSig::ValueType(name),
                    _ => TypeSig::Class(name),
                }
            }
            element::PTR => TypeSig::Pointer(Box::new(self.type_sig()?)),
            element::BYREF => TypeSig::ByRef(Box::new(self.type_sig()?)),
            element::SZARRAY => TypeSig::SzArray(Box::new(self.type_sig()?)),
            element::ARRAY => {
                let element = Box::new(self.type_sig()?);
                let rank = self.compressed()?;
                let sizes = (0..self.compressed()?)
                    .map(|_| self.compressed())
                    .collect::<Result<_>>()?;
                let lower_bounds = (0..self.compressed()?)
                    .map(|_| self.compressed_signed())
                    .collect::<Result<_>>()?;
                TypeSig::Array {
                    element,
                    rank,
                    sizes,
                    lower_bounds,
                }
            }
            element::GENERICINST => {
                let value_type = self.byte()? == element::VALUETYPE;
                let definition = self.type_name()?;
                let arguments = (0..self.compressed()?)
                    .map(|_| self.type_sig())
                    .collect::<Result<_>>()?;
                TypeSig::GenericInst {
                    value_type,
                    definition,
                    arguments,
                }
            }
            element::VAR => TypeSig::Var(self.compressed()?),
            element::MVAR => TypeSig::MVar(self.compressed()?),
            element::FNPTR => {
                let first = self.byte()?;
                TypeSig::FnPtr(Box::new(self.method(first)?))
            }
            element::CMOD_REQD | element::CMOD_OPT => {
                let modifier = self.type_name()?;
                TypeSig::Modified {
                    required: code == element::CMOD_REQD,
                    modifier,
                    inner: Box::new(self.type_sig()?),
                }
            }
            other => {
                return Err(Error::malformed(format!(
                    "unsupported element type {other:#04x} in signature"
                )))
            }
        })
    }

    fn method(&mut self, first: u8) -> Result<MethodSignature> {
        let convention = first & 0x0F;
        if convention == VARARG {
            return Err(Error::malformed("vararg method signatures are not supported"));
        }
        let generic_arity = if first & GENERIC != 0 {
            self.compressed()?
        } else {
            0
        };
        let count = self.compressed()?;
        let return_type = self.type_sig()?;
        let mut parameters = Vec::with_capacity(count as usize);
        for _ in 0..count {
            if self.peek() == Some(element::SENTINEL) {
                return Err(Error::malformed("vararg sentinel in method signature"));
            }
            parameters.push(Parameter::new("", self.type_sig()?));
        }
        Ok(MethodSignature {
            has_this: first & HAS_THIS != 0,
            explicit_this: first & EXPLICIT_THIS != 0,
            convention,
            generic_arity,
            return_type,
            parameters,
        })
    }
}

fn reader<'a, 'r>(data: &'a [u8], names: NameResolver<'r>) -> Reader<'a, 'r> {
    Reader { data, at: 0, names }
}

/// Decodes a field signature
pub(crate) fn read_field(blob: &[u8], names: NameResolver<'_>) -> Result<TypeSig> {
    let mut reader = reader(blob, names);
    if reader.byte()? != FIELD {
        return Err(Error::malformed("field signature does not start with FIELD"));
    }
    reader.type_sig()
}

/// Decodes a method definition or reference signature
pub(crate) fn read_method(blob: &[u8], names: NameResolver<'_>) -> Result<MethodSignature> {
    let mut reader = reader(blob, names);
    let first = reader.byte()?;
    reader.method(first)
}

/// Decodes a member reference signature
pub(crate) fn read_member(blob: &[u8], names: NameResolver<'_>) -> Result<MemberSignature> {
    match blob.first() {
        Some(&FIELD) => read_field(blob, names).map(MemberSignature::Field),
        _ => read_method(blob, names).map(MemberSignature::Method),
    }
}

/// Decodes a property signature: instance flag, type, and index parameter types
pub(crate) fn read_property(blob: &[u8], names: NameResolver<'_>) -> Result<(bool, TypeSig, Vec<TypeSig>)> {
    let mut reader = reader(blob, names);
    let first = reader.byte()?;
    if first & 0x0F != PROPERTY {
        return Err(Error::malformed("property signature does not start with PROPERTY"));
    }
    let count = reader.compressed()?;
    let property_type = reader.type_sig()?;
    let parameters = (0..count).map(|_| reader.type_sig()).collect::<Result<_>>()?;
    Ok((first & HAS_THIS != 0, property_type, parameters))
}

/// Decodes a TypeSpec blob
pub(crate) fn read_type(blob: &[u8], names: NameResolver<'_>) -> Result<TypeSig> {
    reader(blob, names).type_sig()
}

struct Writer<'r> {
    out: Vec<u8>,
    tokens: TokenResolver<'r>,
}

impl Writer<'_> {
    fn type_name(&mut self, name: &TypeName) -> Result<()> {
        let token = (self.tokens)(name)?;
        let tag = match token.table() {
            table::TYPE_DEF => 0,
            table::TYPE_REF => 1,
            _ => return Err(Error::internal(format!("{token} does not name a type"))),
        };
        write_compressed(&mut self.out, (token.row() << 2) | tag);
        Ok(())
    }

    fn type_sig(&mut self, sig: &TypeSig) -> Result<()> {
        if let Some((code, _)) = PRIMITIVE_ELEMENTS.iter().find(|(_, p)| p == sig) {
            self.out.push(*code);
            return Ok(());
        }
        match sig {
            TypeSig::Class(name) => {
                self.out.push(element::CLASS);
                self.type_name(name)?;
            }
            TypeSig::ValueType(name) => {
                self.out.push(element::VALUETYPE);
                self.type_name(name)?;
            }
            TypeSig::Pointer(inner) => {
                self.out.push(element::PTR);
                self.type_sig(inner)?;
            }
            TypeSig::ByRef(inner) => {
                self.out.push(element::BYREF);
                self.type_sig(inner)?;
            }
            TypeSig::SzArray(inner) => {
                self.out.push(element::SZARRAY);
                self.type_sig(inner)?;
            }
            TypeSig::Array {
                element: inner,
                rank,
                sizes,
                lower_bounds,
            } => {
                self.out.push(element::ARRAY);
                self.type_sig(inner)?;
                write_compressed(&mut self.out, *rank);
                write_compressed(&mut self.out, sizes.len() as u32);
                for size in sizes {
                    write_compressed(&mut self.out, *size);
                }
                write_compressed(&mut self.out, lower_bounds.len() as u32);
                for bound in lower_bounds {
                    write_compressed_signed(&mut self.out, *bound);
                }
            }
            TypeSig::GenericInst {
                value_type,
                definition,
                arguments,
            } => {
                self.out.push(element::GENERICINST);
                self.out.push(if *value_type {
                    element::VALUETYPE
                } else {
                    element::CLASS
                });
                self.type_name(definition)?;
                write_compressed(&mut self.out, arguments.len() as u32);
                for argument in arguments {
                    self.type_sig(argument)?;
                }
            }
            TypeSig::Var(index) => {
                self.out.push(element::VAR);
                write_compressed(&mut self.out, *index);
            }
            TypeSig::MVar(index) => {
                self.out.push(element::MVAR);
                write_compressed(&mut self.out, *index);
            }
            TypeSig::FnPtr(signature) => {
                self.out.push(element::FNPTR);
                self.method(signature)?;
            }
            TypeSig::Modified {
                required,
                modifier,
                inner,
            } => {
                self.out.push(if *required {
                    element::CMOD_REQD
                } else {
                    element::CMOD_OPT
                });
                self.type_name(modifier)?;
                self.type_sig(inner)?;
            }
            primitive => {
                return Err(Error::internal(format!("no element type for {primitive}")))
            }
        }
        Ok(())
    }

    fn method(&mut self, signature: &MethodSignature) -> Result<()> {
        if signature.convention == VARARG {
            return Err(Error::malformed("vararg method signatures are not supported"));
        }
        let mut first = signature.convention & 0x0F;
        if signature.has_this {
            first |= HAS_THIS;
        }
        if signature.explicit_this {
            first |= EXPLICIT_THIS;
        }
        if signature.generic_arity > 0 {
            first |= GENERIC;
        }
        self.out.push(first);
        if signature.generic_arity > 0 {
            write_compressed(&mut self.out, signature.generic_arity);
        }
        write_compressed(&mut self.out, signature.parameters.len() as u32);
        self.type_sig(&signature.return_type)?;
        for parameter in &signature.parameters {
            self.type_sig(&parameter.param_type)?;
        }
        Ok(())
    }
}

fn writer(tokens: TokenResolver<'_>) -> Writer<'_> {
    Writer {
        out: Vec::new(),
        tokens,
    }
}

/// Encodes a field signature
pub(crate) fn write_field(field_type: &TypeSig, tokens: TokenResolver<'_>) -> Result<Vec<u8>> {
    let mut writer = writer(tokens);
    writer.out.push(FIELD);
    writer.type_sig(field_type)?;
    Ok(writer.out)
}

/// Encodes a method signature
pub(crate) fn write_method(signature: &MethodSignature, tokens: TokenResolver<'_>) -> Result<Vec<u8>> {
    let mut writer = writer(tokens);
    writer.method(signature)?;
    Ok(writer.out)
}

/// Encodes a member reference signature
pub(crate) fn write_member(signature: &MemberSignature, tokens: TokenResolver<'_>) -> Result<Vec<u8>> {
    match signature {
        MemberSignature::Field(field_type) => write_field(field_type, tokens),
        MemberSignature::Method(method) => write_method(method, tokens),
    }
}

/// Encodes a property signature
pub(crate) fn write_property(
    has_this: bool,
    property_type: &TypeSig,
    parameters: &[TypeSig],
    tokens: TokenResolver<'_>,
) -> Result<Vec<u8>> {
    let mut writer = writer(tokens);
    writer.out.push(if has_this { PROPERTY | HAS_THIS } else { PROPERTY });
    write_compressed(&mut writer.out, parameters.len() as u32);
    writer.type_sig(property_type)?;
    for parameter in parameters {
        writer.type_sig(parameter)?;
    }
    Ok(writer.out)
}

/// Encodes a TypeSpec blob
pub(crate) fn write_type(sig: &TypeSig, tokens: TokenResolver<'_>) -> Result<Vec<u8>> {
    let mut writer = writer(tokens);
    writer.type_sig(sig)?;
    Ok(writer.out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn names(token: Token) -> Result<TypeName> {
        match (token.table(), token.row()) {
            (table::TYPE_DEF, 2) => Ok(TypeName::local("Lib.Widget")),
            (table::TYPE_REF, 1) => Ok(TypeName::core("System.Collections.Generic.List`1")),
            (table::TYPE_REF, 2) => Ok(TypeName::core("System.Int32")),
            (table::TYPE_REF, 3) => Ok(TypeName::core("System.Runtime.CompilerServices.IsVolatile")),
            _ => Err(Error::malformed(format!("unknown {token}"))),
        }
    }

    fn tokens(name: &TypeName) -> Result<Token> {
        match name.full_name.as_str() {
            "Lib.Widget" => Ok(Token::new(table::TYPE_DEF, 2)),
            "System.Collections.Generic.List`1" => Ok(Token::new(table::TYPE_REF, 1)),
            "System.Runtime.CompilerServices.IsVolatile" => Ok(Token::new(table::TYPE_REF, 3)),
            other => Err(Error::internal(format!("no token for {other}"))),
        }
    }

    #[test]
    fn test_method_signature_bytes() {
        // instance List`1<Widget> Find(int32[], !!0&)
        let signature = MethodSignature {
            has_this: true,
            generic_arity: 1,
            return_type: TypeSig::GenericInst {
                value_type: false,
                definition: TypeName::core("System.Collections.Generic.List`1"),
                arguments: vec![TypeSig::local("Lib.Widget")],
            },
            parameters: vec![
                Parameter::new("", TypeSig::I4.array()),
                Parameter::new("", TypeSig::ByRef(Box::new(TypeSig::MVar(0)))),
            ],
            ..MethodSignature::default()
        };
        let blob = write_method(&signature, &mut tokens).unwrap();
        assert_eq!(
            blob,
            vec![0x30, 1, 2, 0x15, 0x12, 0x05, 1, 0x12, 0x08, 0x1D, 0x08, 0x10, 0x1E, 0]
        );
        assert_eq!(read_method(&blob, &names).unwrap(), signature);
    }

    #[test]
    fn test_core_primitives_normalize_on_read() {
        // valuetype [core]System.Int32 reads as the int32 element type
        let blob = [FIELD, element::VALUETYPE, (2 << 2) | 1];
        assert_eq!(read_field(&blob, &names).unwrap(), TypeSig::I4);
        assert_eq!(write_field(&TypeSig::I4, &mut tokens).unwrap(), vec![FIELD, element::I4]);
    }

    #[test]
    fn test_modifiers_arrays_and_properties() {
        let field = TypeSig::Modified {
            required: true,
            modifier: TypeName::core("System.Runtime.CompilerServices.IsVolatile"),
            inner: Box::new(TypeSig::Array {
                element: Box::new(TypeSig::ValueType(TypeName::local("Lib.Widget"))),
                rank: 2,
                sizes: vec![4],
                lower_bounds: vec![0, -3],
            }),
        };
        let blob = write_field(&field, &mut tokens).unwrap();
        assert_eq!(read_field(&blob, &names).unwrap(), field);

        let property = write_property(true, &TypeSig::String, &[TypeSig::I4], &mut tokens).unwrap();
        assert_eq!(property, vec![0x28, 1, 0x0E, 0x08]);
        assert_eq!(
            read_property(&property, &names).unwrap(),
            (true, TypeSig::String, vec![TypeSig::I4])
        );
    }

    #[test]
    fn test_unsupported_shapes_are_rejected() {
        assert!(read_method(&[0x05, 0, 0x01], &names).is_err());
        assert!(read_method(&[0x00, 2, 0x01, 0x08, 0x41, 0x08], &names).is_err());
        // class <TypeSpec 1>
        assert!(read_field(&[FIELD, element::CLASS, (1 << 2) | 2], &names).is_err());
        assert!(read_field(&[FIELD], &names).is_err());
    }
}
