//! Type references and signatures.
//!
//! A [`TypeSig`] is the decoded form of an ECMA-335 type signature. Named
//! types carry a [`TypeName`] that records where the type lives: in this
//! module, in the core library, or in another assembly. Display output uses
//! full names only, which is what declaration identities are built from.

use super::decl::{Constant, CustomAttribute};
use std::fmt;

/// Where a named type is declared
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TypeScope {
    /// Declared in the module itself
    Module,
    /// Declared in whichever assembly the module uses as its core library
    CoreLibrary,
    /// Declared in the referenced assembly with this simple name
    Assembly(String),
    /// Declared in another module of the same assembly
    ModuleRef(String),
}

/// A named type and the scope it resolves in
///
/// Nested types use `Outer/Inner` full names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeName {
    /// Resolution scope
    pub scope: TypeScope,
    /// `Namespace.Name`, nested types as `Outer/Inner`
    pub full_name: String,
}

impl TypeName {
    /// A type declared in this module
    pub fn local(full_name: impl Into<String>) -> Self {
        Self {
            scope: TypeScope::Module,
            full_name: full_name.into(),
        }
    }

    /// A type declared in the core library
    pub fn core(full_name: impl Into<String>) -> Self {
        Self {
            scope: TypeScope::CoreLibrary,
            full_name: full_name.into(),
        }
    }

    /// A type declared in the referenced assembly `assembly`
    pub fn external(assembly: impl Into<String>, full_name: impl Into<String>) -> Self {
        Self {
            scope: TypeScope::Assembly(assembly.into()),
            full_name: full_name.into(),
        }
    }

    /// Returns true if the type is declared in this module
    pub fn is_local(&self) -> bool {
        self.scope == TypeScope::Module
    }

    /// Splits the full name into namespace and simple name
    ///
    /// Nested names keep everything up to the last `/` as the namespace part.
    pub fn split(&self) -> (&str, &str) {
        split_full_name(&self.full_name)
    }
}

/// Splits `Namespace.Name` at the last dot
pub(crate) fn split_full_name(full_name: &str) -> (&str, &str) {
    match full_name.rfind('.') {
        Some(dot) => (&full_name[..dot], &full_name[dot + 1..]),
        None => ("", full_name),
    }
}

/// `[Assembly]Namespace.Name` names another assembly, a bare name this module
impl From<&str> for TypeName {
    fn from(text: &str) -> Self {
        let text = text.trim();
        if let Some(rest) = text.strip_prefix('[') {
            if let Some((assembly, name)) = rest.split_once(']') {
                return Self::external(assembly.trim(), name.trim());
            }
        }
        Self::local(text)
    }
}

impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_name)
    }
}

/// A type as it appears in a signature
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeSig {
    /// `void`
    Void,
    /// `bool`
    Boolean,
    /// `char`
    Char,
    /// `sbyte`
    I1,
    /// `byte`
    U1,
    /// `short`
    I2,
    /// `ushort`
    U2,
    /// `int`
    I4,
    /// `uint`
    U4,
    /// `long`
    I8,
    /// `ulong`
    U8,
    /// `float`
    R4,
    /// `double`
    R8,
    /// `string`
    String,
    /// `object`
    Object,
    /// `nint`
    IntPtr,
    /// `nuint`
    UIntPtr,
    /// `System.TypedReference`
    TypedReference,
    /// A reference type
    Class(TypeName),
    /// A value type
    ValueType(TypeName),
    /// Single-dimensional, zero-based array
    SzArray(Box<TypeSig>),
    /// General array
    Array {
        /// Element type
        element: Box<TypeSig>,
        /// Number of dimensions
        rank: u32,
        /// Declared sizes of the leading dimensions
        sizes: Vec<u32>,
        /// Declared lower bounds of the leading dimensions
        lower_bounds: Vec<i32>,
    },
    /// Unmanaged pointer
    Pointer(Box<TypeSig>),
    /// Managed reference
    ByRef(Box<TypeSig>),
    /// Instantiation of a generic type
    GenericInst {
        /// The generic definition is a value type
        value_type: bool,
        /// Generic type definition
        definition: TypeName,
        /// Type arguments
        arguments: Vec<TypeSig>,
    },
    /// Generic parameter of the enclosing type, by position
    Var(u32),
    /// Generic parameter of the enclosing method, by position
    MVar(u32),
    /// Function pointer
    FnPtr(Box<MethodSignature>),
    /// A type carrying a custom modifier
    Modified {
        /// `modreq` rather than `modopt`
        required: bool,
        /// Modifier type
        modifier: TypeName,
        /// Modified type
        inner: Box<TypeSig>,
    },
}

const PRIMITIVES: [(&str, TypeSig); 18] = [
    ("System.Void", TypeSig::Void),
    ("System.Boolean", TypeSig::Boolean),
    ("System.Char", TypeSig::Char),
    ("System.SByte", TypeSig::I1),
    ("System.Byte", TypeSig::U1),
    ("System.Int16", TypeSig::I2),
    ("System.UInt16", TypeSig::U2),
    ("System.Int32", TypeSig::I4),
    ("System.UInt32", TypeSig::U4),
    ("System.Int64", TypeSig::I8),
    ("System.UInt64", TypeSig::U8),
    ("System.Single", TypeSig::R4),
    ("System.Double", TypeSig::R8),
    ("System.String", TypeSig::String),
    ("System.Object", TypeSig::Object),
    ("System.IntPtr", TypeSig::IntPtr),
    ("System.UIntPtr", TypeSig::UIntPtr),
    ("System.TypedReference", TypeSig::TypedReference),
];

impl TypeSig {
    /// The primitive with this core library full name
    pub fn primitive(full_name: &str) -> Option<TypeSig> {
        PRIMITIVES
            .iter()
            .find(|(name, _)| *name == full_name)
            .map(|(_, sig)| sig.clone())
    }

    /// Core library full name of a primitive
    pub fn primitive_name(&self) -> Option<&'static str> {
        PRIMITIVES
            .iter()
            .find(|(_, sig)| sig == self)
            .map(|(name, _)| *name)
    }

    /// A reference type declared in this module
    pub fn local(full_name: impl Into<String>) -> Self {
        Self::Class(TypeName::local(full_name))
    }

    /// A core library type; primitives map to their own variants
    pub fn core(full_name: &str) -> Self {
        Self::primitive(full_name).unwrap_or_else(|| Self::Class(TypeName::core(full_name)))
    }

    /// A reference type declared in the assembly `assembly`
    pub fn external(assembly: impl Into<String>, full_name: impl Into<String>) -> Self {
        Self::Class(TypeName::external(assembly, full_name))
    }

    /// Wraps this type in a single-dimensional array
    pub fn array(self) -> Self {
        Self::SzArray(Box::new(self))
    }

    /// The named type, for `Class` and `ValueType`
    pub fn named(&self) -> Option<&TypeName> {
        match self {
            Self::Class(name) | Self::ValueType(name) => Some(name),
            _ => None,
        }
    }

    /// Calls `visit` for every type name this signature mentions
    pub fn for_each_name<'a>(&'a self, visit: &mut dyn FnMut(&'a TypeName)) {
        match self {
            Self::Class(name) | Self::ValueType(name) => visit(name),
            Self::SzArray(inner) | Self::Pointer(inner) | Self::ByRef(inner) => {
                inner.for_each_name(visit)
            }
            Self::Array { element, .. } => element.for_each_name(visit),
            Self::GenericInst {
                definition,
                arguments,
                ..
            } => {
                visit(definition);
                for argument in arguments {
                    argument.for_each_name(visit);
                }
            }
            Self::FnPtr(signature) => signature.for_each_name(visit),
            Self::Modified {
                modifier, inner, ..
            } => {
                visit(modifier);
                inner.for_each_name(visit);
            }
            _ => {}
        }
    }

    /// Full names of the module-local types this signature mentions
    pub fn local_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.for_each_name(&mut |name| {
            if name.is_local() {
                names.push(name.full_name.as_str());
            }
        });
        names
    }
}

/// Parses the common textual forms
///
/// Primitive full names become primitive variants, `valuetype X` a value
/// type, and trailing `[]`, `&` and `*` wrap the element. Other names
/// follow [`TypeName`]'s `From<&str>`.
impl From<&str> for TypeSig {
    fn from(text: &str) -> Self {
        let text = text.trim();
        if let Some(inner) = text.strip_suffix("[]") {
            return Self::SzArray(Box::new(inner.into()));
        }
        if let Some(inner) = text.strip_suffix('&') {
            return Self::ByRef(Box::new(inner.into()));
        }
        if let Some(inner) = text.strip_suffix('*') {
            return Self::Pointer(Box::new(inner.into()));
        }
        if let Some(rest) = text.strip_prefix("valuetype ") {
            return Self::ValueType(rest.into());
        }
        Self::primitive(text).unwrap_or_else(|| Self::Class(text.into()))
    }
}

impl From<TypeName> for TypeSig {
    fn from(name: TypeName) -> Self {
        Self::Class(name)
    }
}

impl fmt::Display for TypeSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = self.primitive_name() {
            return f.write_str(name);
        }
        match self {
            Self::Class(name) | Self::ValueType(name) => f.write_str(&name.full_name),
            Self::SzArray(inner) => write!(f, "{inner}[]"),
            Self::Array { element, rank, .. } => {
                write!(f, "{element}[{}]", ",".repeat(rank.saturating_sub(1) as usize))
            }
            Self::Pointer(inner) => write!(f, "{inner}*"),
            Self::ByRef(inner) => write!(f, "{inner}&"),
            Self::GenericInst {
                definition,
                arguments,
                ..
            } => {
                write!(f, "{definition}<")?;
                for (i, argument) in arguments.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{argument}")?;
                }
                f.write_str(">")
            }
            Self::Var(index) => write!(f, "!{index}"),
            Self::MVar(index) => write!(f, "!!{index}"),
            Self::FnPtr(signature) => write!(f, "method {signature}"),
            Self::Modified {
                required,
                modifier,
                inner,
            } => {
                let kind = if *required { "modreq" } else { "modopt" };
                write!(f, "{inner} {kind}({modifier})")
            }
            _ => Ok(()),
        }
    }
}

/// A method parameter
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Parameter {
    /// Parameter name, empty when the metadata carries none
    pub name: String,
    /// Parameter type
    pub param_type: TypeSig,
    /// `ParamAttributes` flags other than the derived default and marshal bits
    pub flags: u16,
    /// Default value of an optional parameter
    pub default: Option<Constant>,
    /// Raw marshalling descriptor
    pub marshal: Option<Vec<u8>>,
    /// Applied attributes
    pub attributes: Vec<CustomAttribute>,
}

impl Parameter {
    /// Creates a parameter without flags or attributes
    pub fn new(name: impl Into<String>, param_type: impl Into<TypeSig>) -> Self {
        Self {
            name: name.into(),
            param_type: param_type.into(),
            flags: 0,
            default: None,
            marshal: None,
            attributes: Vec::new(),
        }
    }
}

/// Calling convention, return type and parameter list of a method
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodSignature {
    /// Instance method
    pub has_this: bool,
    /// `this` is passed as the first declared parameter
    pub explicit_this: bool,
    /// Low calling convention bits; 0 for managed methods
    pub convention: u8,
    /// Number of method generic parameters
    pub generic_arity: u32,
    /// Return type
    pub return_type: TypeSig,
    /// Parameters in declaration order
    pub parameters: Vec<Parameter>,
}

impl Default for MethodSignature {
    fn default() -> Self {
        Self {
            has_this: false,
            explicit_this: false,
            convention: 0,
            generic_arity: 0,
            return_type: TypeSig::Void,
            parameters: Vec::new(),
        }
    }
}

impl MethodSignature {
    /// An instance method signature with unnamed parameters
    pub fn instance(return_type: TypeSig, parameters: impl IntoIterator<Item = TypeSig>) -> Self {
        Self {
            has_this: true,
            return_type,
            parameters: parameters
                .into_iter()
                .map(|t| Parameter::new("", t))
                .collect(),
            ..Self::default()
        }
    }

    /// Parameter types in order
    pub fn parameter_types(&self) -> impl Iterator<Item = &TypeSig> {
        self.parameters.iter().map(|p| &p.param_type)
    }

    /// Calls `visit` for every type name the return and parameter types mention
    pub fn for_each_name<'a>(&'a self, visit: &mut dyn FnMut(&'a TypeName)) {
        self.return_type.for_each_name(visit);
        for parameter in &self.parameters {
            parameter.param_type.for_each_name(visit);
        }
    }
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, parameter) in self.parameters.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", parameter.param_type)?;
        }
        write!(f, ")~{}", self.return_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_textual_forms() {
        assert_eq!(TypeSig::from("System.Int32"), TypeSig::I4);
        assert_eq!(TypeSig::from("Lib.State"), TypeSig::local("Lib.State"));
        assert_eq!(
            TypeSig::from("Lib.Point[]&"),
            TypeSig::ByRef(Box::new(TypeSig::local("Lib.Point").array()))
        );
        assert_eq!(
            TypeSig::from("valuetype [Other]Other.Handle"),
            TypeSig::ValueType(TypeName::external("Other", "Other.Handle"))
        );
        assert_eq!(TypeSig::core("System.String"), TypeSig::String);
        assert_eq!(
            TypeSig::core("System.EventHandler"),
            TypeSig::Class(TypeName::core("System.EventHandler"))
        );
    }

    #[test]
    fn test_display_uses_full_names() {
        let list = TypeSig::GenericInst {
            value_type: false,
            definition: TypeName::core("System.Collections.Generic.List`1"),
            arguments: vec![TypeSig::local("Lib.Item"), TypeSig::MVar(0)],
        };
        assert_eq!(list.to_string(), "System.Collections.Generic.List`1<Lib.Item,!!0>");
        assert_eq!(TypeSig::I4.array().to_string(), "System.Int32[]");

        let signature = MethodSignature::instance(TypeSig::Void, [TypeSig::String, TypeSig::Var(1)]);
        assert_eq!(signature.to_string(), "(System.String,!1)~System.Void");
    }

    #[test]
    fn test_local_names_follow_nested_signatures() {
        let sig = TypeSig::GenericInst {
            value_type: false,
            definition: TypeName::core("System.Func`2"),
            arguments: vec![
                TypeSig::local("Lib.In"),
                TypeSig::Modified {
                    required: true,
                    modifier: TypeName::local("Lib.Marker"),
                    inner: Box::new(TypeSig::local("Lib.Out").array()),
                },
            ],
        };
        assert_eq!(sig.local_names(), vec!["Lib.In", "Lib.Marker", "Lib.Out"]);
    }
}
