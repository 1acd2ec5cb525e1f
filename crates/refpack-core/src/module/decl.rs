//! Declarations: types, members, attribute applications and references.

use super::flags::{Accessibility, FieldAttributes, MethodAttributes, MethodImplAttributes};
use super::sig::{MethodSignature, Parameter, TypeName, TypeSig};
use super::{known, MethodBody, Token};
use crate::image::heap::{read_compressed, write_compressed};
use crate::version::VersionSpec;

/// A fixed argument appended by [`CustomAttribute::with_arg`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeArg {
    /// String literal
    String(String),
    /// 32-bit integer
    Int(i32),
    /// Boolean
    Bool(bool),
    /// `typeof(...)` argument, as an assembly-qualified type name
    Type(String),
}

/// An attribute applied to an assembly, module, type, member or parameter
///
/// `value` is the raw custom attribute blob: prolog, fixed arguments, and
/// named arguments, exactly as stored in metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CustomAttribute {
    /// Attribute type
    pub attribute_type: TypeName,
    /// Parameter types of the constructor being applied
    pub constructor: Vec<TypeSig>,
    /// Raw argument blob
    pub value: Vec<u8>,
}

impl CustomAttribute {
    /// Applies the parameterless constructor of `attribute_type`
    pub fn new(attribute_type: impl Into<TypeName>) -> Self {
        Self {
            attribute_type: attribute_type.into(),
            constructor: Vec::new(),
            value: vec![0x01, 0x00, 0x00, 0x00],
        }
    }

    /// Appends a fixed constructor argument
    ///
    /// The blob must not carry named arguments yet.
    pub fn with_arg(mut self, arg: AttributeArg) -> Self {
        let mut encoded = Vec::new();
        let param_type = match arg {
            AttributeArg::String(text) => {
                write_ser_string(&mut encoded, &text);
                TypeSig::String
            }
            AttributeArg::Int(value) => {
                encoded.extend_from_slice(&value.to_le_bytes());
                TypeSig::I4
            }
            AttributeArg::Bool(value) => {
                encoded.push(u8::from(value));
                TypeSig::Boolean
            }
            AttributeArg::Type(name) => {
                write_ser_string(&mut encoded, &name);
                TypeSig::Class(TypeName::core("System.Type"))
            }
        };
        let at = self.value.len().saturating_sub(2).max(2);
        self.value.splice(at..at, encoded);
        self.constructor.push(param_type);
        self
    }

    /// The first fixed argument, if the constructor takes a string first
    pub fn string_argument(&self) -> Option<String> {
        if self.constructor.first() != Some(&TypeSig::String) {
            return None;
        }
        let data = self.value.get(2..)?;
        if data.first() == Some(&0xFF) {
            return None;
        }
        let (len, used) = read_compressed(data)?;
        let text = data.get(used..used + len as usize)?;
        String::from_utf8(text.to_vec()).ok()
    }

    /// Returns true if the attribute type has this full name, in any scope
    pub fn is(&self, full_name: &str) -> bool {
        self.attribute_type.full_name == full_name
    }
}

fn write_ser_string(out: &mut Vec<u8>, text: &str) {
    write_compressed(out, text.len() as u32);
    out.extend_from_slice(text.as_bytes());
}

/// A compile-time constant: element type and little-endian value blob
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Constant {
    /// `ELEMENT_TYPE_*` of the value
    pub element_type: u8,
    /// Raw value bytes
    pub value: Vec<u8>,
}

impl Constant {
    /// A 32-bit integer constant
    pub fn int32(value: i32) -> Self {
        Self {
            element_type: 0x08,
            value: value.to_le_bytes().to_vec(),
        }
    }

    /// A string constant, stored as UTF-16
    pub fn string(value: &str) -> Self {
        Self {
            element_type: 0x0E,
            value: value.encode_utf16().flat_map(u16::to_le_bytes).collect(),
        }
    }

    /// The null reference
    pub fn null() -> Self {
        Self {
            element_type: 0x12,
            value: vec![0; 4],
        }
    }
}

/// A field declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    /// Token, assigned when the owning type is added to a module
    pub token: Token,
    /// Field name
    pub name: String,
    /// `FieldAttributes` flags other than the derived default, marshal and RVA bits
    pub flags: u16,
    /// Field type
    pub field_type: TypeSig,
    /// Literal value
    pub constant: Option<Constant>,
    /// Explicit offset in an explicit-layout type
    pub offset: Option<u32>,
    /// Raw marshalling descriptor
    pub marshal: Option<Vec<u8>>,
    /// Applied attributes
    pub attributes: Vec<CustomAttribute>,
}

impl FieldDef {
    /// Creates a field declaration
    pub fn new(name: impl Into<String>, flags: u16, field_type: impl Into<TypeSig>) -> Self {
        Self {
            token: Token::NULL,
            name: name.into(),
            flags,
            field_type: field_type.into(),
            constant: None,
            offset: None,
            marshal: None,
            attributes: Vec::new(),
        }
    }

    /// Appends an attribute application
    pub fn with_attribute(mut self, attribute: CustomAttribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Sets the literal value
    pub fn with_constant(mut self, constant: Constant) -> Self {
        self.constant = Some(constant);
        self
    }

    /// Returns true for per-instance fields
    pub fn is_instance(&self) -> bool {
        self.flags & FieldAttributes::STATIC == 0
    }

    /// Accessibility derived from the field's access bits
    pub fn accessibility(&self) -> Accessibility {
        Accessibility::of_member(self.flags)
    }
}

/// Platform invoke binding of an extern method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PInvoke {
    /// `PInvokeAttributes` flags
    pub flags: u16,
    /// Exported entry point name
    pub entry: String,
    /// Native module the entry point lives in
    pub module: String,
}

/// A generic parameter of a type or method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericParam {
    /// Parameter name
    pub name: String,
    /// `GenericParamAttributes` flags
    pub flags: u16,
    /// Constraint types
    pub constraints: Vec<TypeSig>,
    /// Applied attributes
    pub attributes: Vec<CustomAttribute>,
}

impl GenericParam {
    /// Creates an unconstrained parameter
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            flags: 0,
            constraints: Vec::new(),
            attributes: Vec::new(),
        }
    }
}

/// A method declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDef {
    /// Token, assigned when the owning type is added to a module
    pub token: Token,
    /// Method name
    pub name: String,
    /// `MethodAttributes` flags other than the derived security bit
    pub flags: u16,
    /// `MethodImplAttributes` flags
    pub impl_flags: u16,
    /// Calling convention, return type and parameters
    pub signature: MethodSignature,
    /// Method generic parameters
    pub generic_params: Vec<GenericParam>,
    /// Platform invoke binding
    pub pinvoke: Option<PInvoke>,
    /// Executable body, if the method has one
    pub body: Option<MethodBody>,
    /// Attributes applied to the return value
    pub return_attributes: Vec<CustomAttribute>,
    /// Raw marshalling descriptor of the return value
    pub return_marshal: Option<Vec<u8>>,
    /// Applied attributes
    pub attributes: Vec<CustomAttribute>,
}

impl MethodDef {
    /// Creates a `void ()` method declaration without a body
    ///
    /// The method is an instance method unless `flags` includes `STATIC`.
    pub fn new(name: impl Into<String>, flags: u16) -> Self {
        Self {
            token: Token::NULL,
            name: name.into(),
            flags,
            impl_flags: MethodImplAttributes::IL,
            signature: MethodSignature {
                has_this: flags & MethodAttributes::STATIC == 0,
                ..MethodSignature::default()
            },
            generic_params: Vec::new(),
            pinvoke: None,
            body: None,
            return_attributes: Vec::new(),
            return_marshal: None,
            attributes: Vec::new(),
        }
    }

    /// Sets the return type
    pub fn returns(mut self, return_type: impl Into<TypeSig>) -> Self {
        self.signature.return_type = return_type.into();
        self
    }

    /// Appends a parameter
    pub fn param(mut self, name: impl Into<String>, param_type: impl Into<TypeSig>) -> Self {
        self.signature.parameters.push(Parameter::new(name, param_type));
        self
    }

    /// Sets the executable body
    pub fn with_body(mut self, body: MethodBody) -> Self {
        self.body = Some(body);
        self
    }

    /// Sets the implementation flags
    pub fn with_impl_flags(mut self, impl_flags: u16) -> Self {
        self.impl_flags = impl_flags;
        self
    }

    /// Appends an attribute application
    pub fn with_attribute(mut self, attribute: CustomAttribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Returns true if the method carries byte code
    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    /// Returns true if the method can never carry CIL byte code
    pub fn is_bodiless(&self) -> bool {
        self.flags & (MethodAttributes::ABSTRACT | MethodAttributes::PINVOKE_IMPL) != 0
            || self.impl_flags & MethodImplAttributes::CODE_TYPE_MASK != MethodImplAttributes::IL
            || self.impl_flags & MethodImplAttributes::INTERNAL_CALL != 0
    }

    /// Accessibility derived from the method's access bits
    pub fn accessibility(&self) -> Accessibility {
        Accessibility::of_member(self.flags)
    }
}

/// A property or event accessor
///
/// Builders name accessors; [`Module::add_type`](super::Module::add_type)
/// links names to method tokens of the owning type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accessor {
    /// A method of the owning type
    Method(Token),
    /// A method name not yet linked
    Named(String),
}

impl Accessor {
    /// The linked method token
    pub fn token(&self) -> Option<Token> {
        match self {
            Self::Method(token) => Some(*token),
            Self::Named(_) => None,
        }
    }
}

/// A property declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyDef {
    /// Token, assigned when the owning type is added to a module
    pub token: Token,
    /// Property name
    pub name: String,
    /// `PropertyAttributes` flags other than the derived default bit
    pub flags: u16,
    /// Instance property
    pub has_this: bool,
    /// Property type
    pub property_type: TypeSig,
    /// Indexer parameter types
    pub parameters: Vec<TypeSig>,
    /// Default value
    pub constant: Option<Constant>,
    /// Getter method
    pub getter: Option<Accessor>,
    /// Setter method
    pub setter: Option<Accessor>,
    /// Applied attributes
    pub attributes: Vec<CustomAttribute>,
}

impl PropertyDef {
    /// Creates an instance property declaration without accessors
    pub fn new(name: impl Into<String>, property_type: impl Into<TypeSig>) -> Self {
        Self {
            token: Token::NULL,
            name: name.into(),
            flags: 0,
            has_this: true,
            property_type: property_type.into(),
            parameters: Vec::new(),
            constant: None,
            getter: None,
            setter: None,
            attributes: Vec::new(),
        }
    }

    /// Names the getter method
    pub fn getter(mut self, method: impl Into<String>) -> Self {
        self.getter = Some(Accessor::Named(method.into()));
        self
    }

    /// Names the setter method
    pub fn setter(mut self, method: impl Into<String>) -> Self {
        self.setter = Some(Accessor::Named(method.into()));
        self
    }

    /// Accessor slots
    pub fn accessor_slots(&mut self) -> [&mut Option<Accessor>; 2] {
        [&mut self.getter, &mut self.setter]
    }

    /// Linked accessor tokens
    pub fn accessors(&self) -> impl Iterator<Item = Token> + '_ {
        self.getter
            .iter()
            .chain(self.setter.iter())
            .filter_map(Accessor::token)
    }
}

/// An event declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDef {
    /// Token, assigned when the owning type is added to a module
    pub token: Token,
    /// Event name
    pub name: String,
    /// `EventAttributes` flags
    pub flags: u16,
    /// Delegate type
    pub event_type: TypeSig,
    /// Add accessor
    pub adder: Option<Accessor>,
    /// Remove accessor
    pub remover: Option<Accessor>,
    /// Raise accessor
    pub raiser: Option<Accessor>,
    /// Applied attributes
    pub attributes: Vec<CustomAttribute>,
}

impl EventDef {
    /// Creates an event declaration without accessors
    pub fn new(name: impl Into<String>, event_type: impl Into<TypeSig>) -> Self {
        Self {
            token: Token::NULL,
            name: name.into(),
            flags: 0,
            event_type: event_type.into(),
            adder: None,
            remover: None,
            raiser: None,
            attributes: Vec::new(),
        }
    }

    /// Names the add and remove accessor methods
    pub fn accessors_named(mut self, adder: impl Into<String>, remover: impl Into<String>) -> Self {
        self.adder = Some(Accessor::Named(adder.into()));
        self.remover = Some(Accessor::Named(remover.into()));
        self
    }

    /// Accessor slots
    pub fn accessor_slots(&mut self) -> [&mut Option<Accessor>; 3] {
        [&mut self.adder, &mut self.remover, &mut self.raiser]
    }

    /// Linked accessor tokens
    pub fn accessors(&self) -> impl Iterator<Item = Token> + '_ {
        self.adder
            .iter()
            .chain(self.remover.iter())
            .chain(self.raiser.iter())
            .filter_map(Accessor::token)
    }
}

/// Explicit size and packing of a type's instance layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassLayout {
    /// Total instance size in bytes, 0 for unspecified
    pub class_size: u32,
    /// Field alignment in bytes, 0 for default
    pub packing: u16,
}

/// A method named by an override: declared here or referenced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodRef {
    /// A method declared in this module
    Def(Token),
    /// A method of another type, usually an interface
    Ref(MemberRef),
}

/// An explicit implementation of an inherited or interface method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodOverride {
    /// Implementing method, declared on the owning type
    pub body: MethodRef,
    /// Implemented method
    pub declaration: MethodRef,
}

/// A type declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDef {
    /// Token, assigned by [`Module::add_type`](super::Module::add_type)
    pub token: Token,
    /// Namespace, empty for nested types and the global namespace
    pub namespace: String,
    /// Simple name
    pub name: String,
    /// `TypeAttributes` flags other than the derived security bit
    pub flags: u32,
    /// Base type
    pub extends: Option<TypeSig>,
    /// Enclosing type, for nested types
    pub enclosing: Option<Token>,
    /// Explicit layout information
    pub layout: Option<ClassLayout>,
    /// Implemented interfaces
    pub interfaces: Vec<TypeSig>,
    /// Type generic parameters
    pub generic_params: Vec<GenericParam>,
    /// Fields in declaration order
    pub fields: Vec<FieldDef>,
    /// Methods in declaration order
    pub methods: Vec<MethodDef>,
    /// Properties in declaration order
    pub properties: Vec<PropertyDef>,
    /// Events in declaration order
    pub events: Vec<EventDef>,
    /// Explicit method implementations
    pub overrides: Vec<MethodOverride>,
    /// Applied attributes
    pub attributes: Vec<CustomAttribute>,
}

impl TypeDef {
    /// Creates a type declaration deriving from `System.Object`
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, flags: u32) -> Self {
        Self {
            token: Token::NULL,
            namespace: namespace.into(),
            name: name.into(),
            flags,
            extends: Some(TypeSig::Object),
            enclosing: None,
            layout: None,
            interfaces: Vec::new(),
            generic_params: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            properties: Vec::new(),
            events: Vec::new(),
            overrides: Vec::new(),
            attributes: Vec::new(),
        }
    }

    /// Creates a sealed value type declaration
    pub fn value_type(namespace: impl Into<String>, name: impl Into<String>, flags: u32) -> Self {
        Self::new(namespace, name, flags | super::TypeAttributes::SEALED)
            .extends(TypeSig::core(known::VALUE_TYPE))
    }

    /// Sets the base type
    pub fn extends(mut self, base: impl Into<TypeSig>) -> Self {
        self.extends = Some(base.into());
        self
    }

    /// Adds an implemented interface
    pub fn implements(mut self, interface: impl Into<TypeSig>) -> Self {
        self.interfaces.push(interface.into());
        self
    }

    /// Declares this type as nested inside `enclosing`
    pub fn nested_in(mut self, enclosing: Token) -> Self {
        self.enclosing = Some(enclosing);
        self.namespace.clear();
        self
    }

    /// Sets explicit layout information
    pub fn with_layout(mut self, class_size: u32, packing: u16) -> Self {
        self.layout = Some(ClassLayout {
            class_size,
            packing,
        });
        self
    }

    /// Appends a field
    pub fn with_field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// Appends a method
    pub fn with_method(mut self, method: MethodDef) -> Self {
        self.methods.push(method);
        self
    }

    /// Appends a property
    pub fn with_property(mut self, property: PropertyDef) -> Self {
        self.properties.push(property);
        self
    }

    /// Appends an event
    pub fn with_event(mut self, event: EventDef) -> Self {
        self.events.push(event);
        self
    }

    /// Appends an attribute application
    pub fn with_attribute(mut self, attribute: CustomAttribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Returns true for value types and enumerations
    pub fn is_value_type(&self) -> bool {
        self.extends
            .as_ref()
            .and_then(TypeSig::named)
            .is_some_and(|base| base.full_name == known::VALUE_TYPE || base.full_name == known::ENUM)
    }

    /// Returns true for the `<Module>` pseudo-type that owns global members
    pub fn is_global(&self) -> bool {
        self.enclosing.is_none() && self.namespace.is_empty() && self.name == known::GLOBAL_TYPE
    }

    /// Returns true for nested types
    pub fn is_nested(&self) -> bool {
        self.enclosing.is_some()
    }

    /// Accessibility derived from the type's visibility bits
    pub fn accessibility(&self) -> Accessibility {
        Accessibility::of_type(self.flags)
    }

    /// Looks up a method by token
    pub fn method(&self, token: Token) -> Option<&MethodDef> {
        self.methods.iter().find(|m| m.token == token)
    }
}

/// What a member reference points at
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MemberSignature {
    /// A method
    Method(MethodSignature),
    /// A field
    Field(TypeSig),
}

/// A reference to a member of some type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemberRef {
    /// Declaring type
    pub parent: TypeSig,
    /// Member name
    pub name: String,
    /// Signature of the referenced member
    pub signature: MemberSignature,
}

/// A referenced assembly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyRef {
    /// Simple name
    pub name: String,
    /// Version
    pub version: VersionSpec,
    /// Culture, empty for neutral
    pub culture: String,
    /// Public key or its token
    pub public_key_or_token: Vec<u8>,
    /// `AssemblyFlags`
    pub flags: u32,
    /// Hash of the referenced file
    pub hash_value: Vec<u8>,
}

impl AssemblyRef {
    /// `mscorlib, Version=4.0.0.0, PublicKeyToken=b77a5c561934e089`
    pub fn core_library() -> Self {
        Self {
            name: "mscorlib".to_string(),
            version: VersionSpec::full(4, 0, 0, 0),
            culture: String::new(),
            public_key_or_token: vec![0xB7, 0x7A, 0x5C, 0x56, 0x19, 0x34, 0xE0, 0x89],
            flags: 0,
            hash_value: Vec::new(),
        }
    }

    /// Returns true if this names an assembly that can serve as core library
    pub fn is_core_library(&self) -> bool {
        Self::is_core_name(&self.name)
    }

    pub(crate) fn is_core_name(name: &str) -> bool {
        known::CORE_LIBRARIES
            .iter()
            .any(|core| name.eq_ignore_ascii_case(core))
    }
}

/// Where an exported type is declared
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportScope {
    /// Forwarded to the referenced assembly with this name
    Assembly(String),
    /// Nested in the exported type at this index
    Enclosing(usize),
}

/// A type forwarded to another assembly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedType {
    /// `TypeAttributes` flags
    pub flags: u32,
    /// TypeDef token hint in the target
    pub type_def_id: u32,
    /// Namespace
    pub namespace: String,
    /// Simple name
    pub name: String,
    /// Declaring scope
    pub scope: ExportScope,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_arguments_build_the_blob() {
        let attribute = CustomAttribute::new(TypeName::core(known::INTERNALS_VISIBLE_TO))
            .with_arg(AttributeArg::String("Lib.Tests".into()));
        assert_eq!(attribute.constructor, vec![TypeSig::String]);
        assert_eq!(&attribute.value[..3], &[0x01, 0x00, 9]);
        assert_eq!(&attribute.value[attribute.value.len() - 2..], &[0, 0]);
        assert_eq!(attribute.string_argument().as_deref(), Some("Lib.Tests"));

        let flagged = CustomAttribute::new(TypeName::local("Lib.Flag"))
            .with_arg(AttributeArg::Int(-3))
            .with_arg(AttributeArg::Bool(true));
        assert_eq!(flagged.value, vec![1, 0, 0xFD, 0xFF, 0xFF, 0xFF, 1, 0, 0]);
        assert_eq!(flagged.string_argument(), None);
    }

    #[test]
    fn test_bodiless_methods() {
        let method = MethodDef::new("Run", MethodAttributes::PUBLIC);
        assert!(!method.is_bodiless());
        assert!(method.signature.has_this);
        let abstract_method = MethodDef::new(
            "Run",
            MethodAttributes::PUBLIC | MethodAttributes::ABSTRACT | MethodAttributes::VIRTUAL,
        );
        assert!(abstract_method.is_bodiless());
        let runtime = MethodDef::new("Invoke", MethodAttributes::PUBLIC)
            .with_impl_flags(MethodImplAttributes::RUNTIME);
        assert!(runtime.is_bodiless());
        let static_method = MethodDef::new("Make", MethodAttributes::STATIC);
        assert!(!static_method.signature.has_this);
    }

    #[test]
    fn test_value_type_detection_ignores_scope() {
        assert!(TypeDef::value_type("Lib", "Point", 0).is_value_type());
        let local_enum = TypeDef::new("Lib", "Kind", 0).extends(TypeSig::local(known::ENUM));
        assert!(local_enum.is_value_type());
        assert!(!TypeDef::new("Lib", "Api", 0).is_value_type());
    }
}
