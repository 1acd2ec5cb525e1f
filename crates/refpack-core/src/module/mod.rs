//! In-memory model of a compiled module's declaration tree.
//!
//! A [`Module`] owns a flat, ordered table of [`TypeDef`]s. Nesting is
//! recorded on the nested type through its `enclosing` token, the same way
//! the NestedClass metadata table does it, so a type can be marked and
//! removed without walking a tree of owners.
//!
//! Every declaration carries a [`Token`] that stays stable for the lifetime
//! of the module. Stripping stages collect tokens first and delete
//! afterwards; they never remove from a table they are iterating.

mod body;
mod decl;
pub mod flags;
mod sig;

use crate::error::{Error, Result};
use crate::version::VersionSpec;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

pub use body::{opcodes, MethodBody};
pub use decl::{
    Accessor, AssemblyRef, AttributeArg, ClassLayout, Constant, CustomAttribute, EventDef,
    ExportScope, ExportedType, FieldDef, GenericParam, MemberRef, MemberSignature, MethodDef,
    MethodOverride, MethodRef, PInvoke, PropertyDef, TypeDef,
};
pub use flags::{
    Accessibility, FieldAttributes, MethodAttributes, MethodImplAttributes, ParamAttributes,
    PropertyAttributes, TypeAttributes,
};
pub use sig::{MethodSignature, Parameter, TypeName, TypeScope, TypeSig};
pub(crate) use sig::split_full_name;

/// Metadata table identifiers (the high byte of a [`Token`])
pub mod table {
    /// Type references
    pub const TYPE_REF: u8 = 0x01;
    /// Type declarations
    pub const TYPE_DEF: u8 = 0x02;
    /// Field declarations
    pub const FIELD: u8 = 0x04;
    /// Method declarations
    pub const METHOD_DEF: u8 = 0x06;
    /// Parameter declarations
    pub const PARAM: u8 = 0x08;
    /// Member references
    pub const MEMBER_REF: u8 = 0x0A;
    /// Standalone signatures, such as local variable lists
    pub const STANDALONE_SIG: u8 = 0x11;
    /// Event declarations
    pub const EVENT: u8 = 0x14;
    /// Property declarations
    pub const PROPERTY: u8 = 0x17;
    /// Constructed type signatures
    pub const TYPE_SPEC: u8 = 0x1B;
    /// Generic method instantiations
    pub const METHOD_SPEC: u8 = 0x2B;
    /// User string heap entries
    pub const USER_STRING: u8 = 0x70;
}

/// Names the stripping stages care about
pub mod known {
    /// Grants another module access to internal declarations
    pub const INTERNALS_VISIBLE_TO: &str =
        "System.Runtime.CompilerServices.InternalsVisibleToAttribute";
    /// Marks a module as reference-only
    pub const REFERENCE_ASSEMBLY: &str =
        "System.Runtime.CompilerServices.ReferenceAssemblyAttribute";
    /// Exception raised by mock bodies
    pub const NOT_IMPLEMENTED_EXCEPTION: &str = "System.NotImplementedException";
    /// Base type of every value type
    pub const VALUE_TYPE: &str = "System.ValueType";
    /// Base type of every enumeration
    pub const ENUM: &str = "System.Enum";
    /// Pseudo-type owning global fields and methods
    pub const GLOBAL_TYPE: &str = "<Module>";
    /// Assemblies that can serve as a module's core library
    pub const CORE_LIBRARIES: [&str; 4] =
        ["System.Runtime", "mscorlib", "netstandard", "System.Private.CoreLib"];
}

/// A metadata token: table identifier in the high byte, 1-based row below it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Token(u32);

impl Token {
    /// The null token, used for declarations not yet added to a module
    pub const NULL: Token = Token(0);

    /// Creates a token from a table identifier and row
    pub const fn new(table: u8, row: u32) -> Self {
        Self(((table as u32) << 24) | (row & 0x00FF_FFFF))
    }

    /// Creates a token from its raw value
    pub const fn from_value(value: u32) -> Self {
        Self(value)
    }

    /// Raw token value
    pub const fn value(&self) -> u32 {
        self.0
    }

    /// Table identifier
    pub const fn table(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// Row within the table
    pub const fn row(&self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    /// Returns true for the null token
    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// A compiled module and its declaration tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    /// Assembly simple name
    pub name: String,
    /// Assembly version
    pub version: VersionSpec,
    /// Assembly culture, empty for neutral
    pub culture: String,
    /// Assembly public key, empty for unsigned assemblies
    pub public_key: Vec<u8>,
    /// `AssemblyFlags` other than the derived public key bit
    pub assembly_flags: u32,
    /// Hash algorithm of the assembly manifest
    pub hash_algorithm: u32,
    /// Module file name
    pub module_name: String,
    /// Module version identifier
    pub mvid: [u8; 16],
    /// Attributes applied at assembly scope
    pub assembly_attributes: Vec<CustomAttribute>,
    /// Attributes applied at module scope
    pub module_attributes: Vec<CustomAttribute>,
    /// Referenced assemblies
    pub assembly_refs: Vec<AssemblyRef>,
    /// Types forwarded to other assemblies
    pub exported_types: Vec<ExportedType>,
    /// Type table, in declaration order
    pub types: Vec<TypeDef>,
    /// Member references used by method bodies; row `n` is index `n - 1`
    pub member_refs: Vec<MemberRef>,
    /// User strings used by method bodies; row `n` is index `n - 1`
    pub user_strings: Vec<String>,
}

impl Module {
    /// Creates an empty module referencing `mscorlib` as its core library
    pub fn new(name: impl Into<String>, version: VersionSpec) -> Self {
        let name = name.into();
        let mut mvid = [0u8; 16];
        mvid.copy_from_slice(&blake3::hash(name.as_bytes()).as_bytes()[..16]);
        Self {
            module_name: format!("{name}.dll"),
            name,
            version,
            culture: String::new(),
            public_key: Vec::new(),
            assembly_flags: 0,
            hash_algorithm: 0x8004,
            mvid,
            assembly_attributes: Vec::new(),
            module_attributes: Vec::new(),
            assembly_refs: vec![AssemblyRef::core_library()],
            exported_types: Vec::new(),
            types: Vec::new(),
            member_refs: Vec::new(),
            user_strings: Vec::new(),
        }
    }

    /// Next free token of `table`
    pub fn allocate(&self, table: u8) -> Token {
        let row = match table {
            table::MEMBER_REF => self.member_refs.len() as u32,
            table::USER_STRING => self.user_strings.len() as u32,
            _ => self
                .declaration_tokens()
                .filter(|t| t.table() == table)
                .map(|t| t.row())
                .max()
                .unwrap_or(0),
        };
        Token::new(table, row + 1)
    }

    /// Adds a type, assigns tokens to it and its members, and links accessors
    ///
    /// Declarations that already carry a token keep it. Accessors named by
    /// a builder are linked to the first method of that name.
    pub fn add_type(&mut self, mut ty: TypeDef) -> Token {
        if ty.token.is_null() {
            ty.token = self.allocate(table::TYPE_DEF);
        }
        let mut next = [table::FIELD, table::METHOD_DEF, table::PROPERTY, table::EVENT]
            .map(|table| self.allocate(table).row());
        assign_rows(&mut next[0], table::FIELD, ty.fields.iter_mut().map(|f| &mut f.token));
        assign_rows(&mut next[1], table::METHOD_DEF, ty.methods.iter_mut().map(|m| &mut m.token));
        assign_rows(&mut next[2], table::PROPERTY, ty.properties.iter_mut().map(|p| &mut p.token));
        assign_rows(&mut next[3], table::EVENT, ty.events.iter_mut().map(|e| &mut e.token));

        let mut by_name: HashMap<String, Token> = HashMap::new();
        for method in &ty.methods {
            by_name.entry(method.name.clone()).or_insert(method.token);
        }
        let link = |slot: &mut Option<Accessor>| {
            if let Some(Accessor::Named(name)) = slot {
                if let Some(&token) = by_name.get(name.as_str()) {
                    *slot = Some(Accessor::Method(token));
                }
            }
        };
        for property in &mut ty.properties {
            property.accessor_slots().into_iter().for_each(link);
        }
        for event in &mut ty.events {
            event.accessor_slots().into_iter().for_each(link);
        }

        let token = ty.token;
        self.types.push(ty);
        token
    }

    /// Looks up a type by token
    pub fn find_type(&self, token: Token) -> Option<&TypeDef> {
        self.types.iter().find(|t| t.token == token)
    }

    /// Looks up a type by its full name
    pub fn type_named(&self, full_name: &str) -> Option<&TypeDef> {
        let names = self.full_names();
        self.types
            .iter()
            .find(|t| names.get(&t.token).is_some_and(|n| n == full_name))
    }

    /// Full name of a type: `Namespace.Name`, nested types as `Outer/Inner`
    pub fn full_name(&self, ty: &TypeDef) -> String {
        let by_token: HashMap<Token, &TypeDef> = self.types.iter().map(|t| (t.token, t)).collect();
        full_name_in(ty, &by_token)
    }

    /// Full names of every type, by token
    pub fn full_names(&self) -> HashMap<Token, String> {
        let by_token: HashMap<Token, &TypeDef> = self.types.iter().map(|t| (t.token, t)).collect();
        self.types
            .iter()
            .map(|t| (t.token, full_name_in(t, &by_token)))
            .collect()
    }

    /// The referenced assembly that provides the core library types
    pub fn core_library(&self) -> Option<&AssemblyRef> {
        self.assembly_refs.iter().find(|r| r.is_core_library())
    }

    /// Names a core library type from inside this module
    ///
    /// A module without a core library reference is the core library, so
    /// the name resolves locally when the module declares it.
    pub fn core_type(&self, full_name: &str) -> TypeName {
        if self.core_library().is_none() && self.type_named(full_name).is_some() {
            TypeName::local(full_name)
        } else {
            TypeName::core(full_name)
        }
    }

    /// Names of the modules granted access to internal declarations
    ///
    /// Reads the first argument of every assembly-scope
    /// `InternalsVisibleToAttribute` and keeps the simple name before any
    /// `, PublicKey=...` suffix. Self-references are ignored.
    pub fn internals_visible_to(&self) -> Vec<String> {
        self.assembly_attributes
            .iter()
            .filter(|a| a.is(known::INTERNALS_VISIBLE_TO))
            .filter_map(|a| a.string_argument())
            .filter_map(|target| {
                let simple = target.split(',').next().unwrap_or_default().trim();
                (!simple.is_empty() && !simple.eq_ignore_ascii_case(&self.name))
                    .then(|| simple.to_string())
            })
            .collect()
    }

    /// Returns true if an assembly-scope attribute of type `full_name` is applied
    pub fn has_assembly_attribute(&self, full_name: &str) -> bool {
        self.assembly_attributes.iter().any(|a| a.is(full_name))
    }

    /// Adds a string to the user string heap, reusing an equal entry
    pub fn intern_user_string(&mut self, value: &str) -> Token {
        if let Some(index) = self.user_strings.iter().position(|s| s == value) {
            return Token::new(table::USER_STRING, index as u32 + 1);
        }
        self.user_strings.push(value.to_string());
        Token::new(table::USER_STRING, self.user_strings.len() as u32)
    }

    /// Adds a member reference, reusing an equal entry
    pub fn import_member(&mut self, member: MemberRef) -> Token {
        if let Some(index) = self.member_refs.iter().position(|m| *m == member) {
            return Token::new(table::MEMBER_REF, index as u32 + 1);
        }
        self.member_refs.push(member);
        Token::new(table::MEMBER_REF, self.member_refs.len() as u32)
    }

    /// Tokens of every type and member declaration
    pub fn declaration_tokens(&self) -> impl Iterator<Item = Token> + '_ {
        self.types.iter().flat_map(|t| {
            std::iter::once(t.token)
                .chain(t.fields.iter().map(|f| f.token))
                .chain(t.methods.iter().map(|m| m.token))
                .chain(t.properties.iter().map(|p| p.token))
                .chain(t.events.iter().map(|e| e.token))
        })
    }

    /// Stable textual identities of every surviving declaration
    ///
    /// Types render as `T:Full.Name`, members as `M:`, `F:`, `P:` and `E:`
    /// prefixed `Owner::member` strings; methods include their signature.
    pub fn declarations(&self) -> BTreeSet<String> {
        let names = self.full_names();
        let mut out = BTreeSet::new();
        for ty in &self.types {
            let owner = &names[&ty.token];
            out.insert(format!("T:{owner}"));
            for field in &ty.fields {
                out.insert(format!("F:{owner}::{}", field.name));
            }
            for method in &ty.methods {
                out.insert(format!("M:{owner}::{}{}", method.name, method.signature));
            }
            for property in &ty.properties {
                out.insert(format!("P:{owner}::{}", property.name));
            }
            for event in &ty.events {
                out.insert(format!("E:{owner}::{}", event.name));
            }
        }
        out
    }

    /// Calls `visit` for every type name the module's declarations mention
    pub fn for_each_type_name<'a>(&'a self, visit: &mut dyn FnMut(&'a TypeName)) {
        attribute_names(&self.assembly_attributes, visit);
        attribute_names(&self.module_attributes, visit);
        for member in &self.member_refs {
            member_names(member, visit);
        }
        for ty in &self.types {
            type_names(ty, visit);
        }
    }

    /// Checks the structural invariants a loadable module must satisfy
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::malformed("module has no assembly name"));
        }

        let mut seen = HashSet::new();
        for token in self.declaration_tokens() {
            if token.is_null() {
                return Err(Error::malformed("declaration without a token"));
            }
            if !seen.insert(token) {
                return Err(Error::malformed(format!("duplicate token {token}")));
            }
        }

        let by_token: HashMap<Token, &TypeDef> = self.types.iter().map(|t| (t.token, t)).collect();
        let methods: HashSet<Token> = self
            .types
            .iter()
            .flat_map(|t| t.methods.iter().map(|m| m.token))
            .collect();
        for ty in &self.types {
            if let Some(enclosing) = ty.enclosing {
                if !by_token.contains_key(&enclosing) {
                    return Err(Error::malformed(format!(
                        "type {} is nested in missing type {enclosing}",
                        ty.name
                    )));
                }
            }

            let accessors = ty
                .properties
                .iter()
                .flat_map(|p| p.getter.iter().chain(p.setter.iter()).map(move |a| (&p.name, a)))
                .chain(ty.events.iter().flat_map(|e| {
                    e.adder
                        .iter()
                        .chain(e.remover.iter())
                        .chain(e.raiser.iter())
                        .map(move |a| (&e.name, a))
                }));
            for (owner, accessor) in accessors {
                match accessor {
                    Accessor::Method(token) if ty.method(*token).is_some() => {}
                    Accessor::Method(token) => {
                        return Err(Error::malformed(format!(
                            "accessor {token} of {}::{owner} is not a method of that type",
                            ty.name
                        )))
                    }
                    Accessor::Named(name) => {
                        return Err(Error::malformed(format!(
                            "accessor {name} of {}::{owner} is not a method of that type",
                            ty.name
                        )))
                    }
                }
            }

            for method_override in &ty.overrides {
                if let MethodRef::Def(body) = method_override.body {
                    if ty.method(body).is_none() {
                        return Err(Error::malformed(format!(
                            "override body {body} is not a method of {}",
                            ty.name
                        )));
                    }
                }
                if let MethodRef::Def(declaration) = method_override.declaration {
                    if !methods.contains(&declaration) {
                        return Err(Error::malformed(format!(
                            "{} overrides missing method {declaration}",
                            ty.name
                        )));
                    }
                }
            }

            for method in &ty.methods {
                let Some(body) = &method.body else {
                    continue;
                };
                for token in body.referenced_tokens() {
                    let resolved = match token.table() {
                        table::USER_STRING => (token.row() as usize) <= self.user_strings.len(),
                        table::MEMBER_REF => (token.row() as usize) <= self.member_refs.len(),
                        _ => true,
                    };
                    if token.row() == 0 || !resolved {
                        return Err(Error::malformed(format!(
                            "method {} references unknown token {token}",
                            method.name
                        )));
                    }
                }
            }
        }

        // enclosing chains must terminate
        for ty in &self.types {
            let mut steps = 0usize;
            let mut current = ty.enclosing;
            while let Some(outer) = current {
                steps += 1;
                if steps > self.types.len() {
                    return Err(Error::malformed(format!(
                        "type {} has a cyclic enclosing chain",
                        ty.name
                    )));
                }
                current = by_token.get(&outer).and_then(|t| t.enclosing);
            }
        }

        let local: HashSet<String> = self.full_names().into_values().collect();
        let has_core = self.core_library().is_some();
        let mut unresolved = None;
        self.for_each_type_name(&mut |name| {
            if unresolved.is_some() {
                return;
            }
            let resolves = match &name.scope {
                TypeScope::Module => local.contains(&name.full_name),
                TypeScope::CoreLibrary => has_core,
                TypeScope::Assembly(assembly) => self
                    .assembly_refs
                    .iter()
                    .any(|r| r.name.eq_ignore_ascii_case(assembly)),
                TypeScope::ModuleRef(_) => true,
            };
            if !resolves {
                unresolved = Some(name.clone());
            }
        });
        if let Some(name) = unresolved {
            return Err(Error::malformed(format!(
                "reference to {} in {:?} does not resolve",
                name.full_name, name.scope
            )));
        }

        Ok(())
    }
}

fn full_name_in(ty: &TypeDef, by_token: &HashMap<Token, &TypeDef>) -> String {
    let qualified = |t: &TypeDef| {
        if t.namespace.is_empty() {
            t.name.clone()
        } else {
            format!("{}.{}", t.namespace, t.name)
        }
    };
    let mut name = qualified(ty);
    let mut seen = HashSet::from([ty.token]);
    let mut current = ty.enclosing;
    while let Some(outer) = current.and_then(|t| by_token.get(&t)) {
        if !seen.insert(outer.token) {
            break;
        }
        name = format!("{}/{name}", qualified(outer));
        current = outer.enclosing;
    }
    name
}

fn attribute_names<'a>(attributes: &'a [CustomAttribute], visit: &mut dyn FnMut(&'a TypeName)) {
    for attribute in attributes {
        visit(&attribute.attribute_type);
        for param_type in &attribute.constructor {
            param_type.for_each_name(visit);
        }
    }
}

fn generic_param_names<'a>(params: &'a [GenericParam], visit: &mut dyn FnMut(&'a TypeName)) {
    for param in params {
        for constraint in &param.constraints {
            constraint.for_each_name(visit);
        }
        attribute_names(&param.attributes, visit);
    }
}

fn member_names<'a>(member: &'a MemberRef, visit: &mut dyn FnMut(&'a TypeName)) {
    member.parent.for_each_name(visit);
    match &member.signature {
        MemberSignature::Method(signature) => signature.for_each_name(visit),
        MemberSignature::Field(field_type) => field_type.for_each_name(visit),
    }
}

/// Type names mentioned by a method's signature, generic parameters and attributes
pub(crate) fn method_names<'a>(method: &'a MethodDef, visit: &mut dyn FnMut(&'a TypeName)) {
    method.signature.for_each_name(visit);
    for parameter in &method.signature.parameters {
        attribute_names(&parameter.attributes, visit);
    }
    generic_param_names(&method.generic_params, visit);
    attribute_names(&method.return_attributes, visit);
    attribute_names(&method.attributes, visit);
}

fn type_names<'a>(ty: &'a TypeDef, visit: &mut dyn FnMut(&'a TypeName)) {
    if let Some(base) = &ty.extends {
        base.for_each_name(visit);
    }
    for interface in &ty.interfaces {
        interface.for_each_name(visit);
    }
    generic_param_names(&ty.generic_params, visit);
    attribute_names(&ty.attributes, visit);
    for field in &ty.fields {
        field.field_type.for_each_name(visit);
        attribute_names(&field.attributes, visit);
    }
    for method in &ty.methods {
        method_names(method, visit);
    }
    for property in &ty.properties {
        property.property_type.for_each_name(visit);
        for parameter in &property.parameters {
            parameter.for_each_name(visit);
        }
        attribute_names(&property.attributes, visit);
    }
    for event in &ty.events {
        event.event_type.for_each_name(visit);
        attribute_names(&event.attributes, visit);
    }
    for method_override in &ty.overrides {
        for target in [&method_override.body, &method_override.declaration] {
            if let MethodRef::Ref(member) = target {
                member_names(member, visit);
            }
        }
    }
}

fn assign_rows<'a>(next: &mut u32, table: u8, slots: impl Iterator<Item = &'a mut Token>) {
    for slot in slots.filter(|slot| slot.is_null()) {
        *slot = Token::new(table, *next);
        *next += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> (Module, Token) {
        let mut module = Module::new("Lib", VersionSpec::full(1, 0, 0, 0));
        let outer = module.add_type(
            TypeDef::new("Lib", "Outer", TypeAttributes::PUBLIC)
                .with_field(FieldDef::new("count", FieldAttributes::PRIVATE, "System.Int32"))
                .with_method(
                    MethodDef::new("get_Count", MethodAttributes::PUBLIC)
                        .returns("System.Int32")
                        .with_body(MethodBody::new(vec![0x16, opcodes::RET])),
                )
                .with_property(PropertyDef::new("Count", "System.Int32").getter("get_Count")),
        );
        module.add_type(
            TypeDef::new("", "Inner", TypeAttributes::NESTED_PRIVATE).nested_in(outer),
        );
        (module, outer)
    }

    #[test]
    fn test_token_parts() {
        let token = Token::new(table::METHOD_DEF, 3);
        assert_eq!(token.value(), 0x0600_0003);
        assert_eq!(token.table(), table::METHOD_DEF);
        assert_eq!(token.row(), 3);
        assert_eq!(token.to_string(), "0x06000003");
    }

    #[test]
    fn test_add_type_assigns_tokens_and_links_accessors() {
        let (module, outer) = sample();
        assert_eq!(outer, Token::new(table::TYPE_DEF, 1));
        let ty = module.find_type(outer).unwrap();
        assert_eq!(ty.fields[0].token, Token::new(table::FIELD, 1));
        assert_eq!(ty.methods[0].token, Token::new(table::METHOD_DEF, 1));
        assert_eq!(ty.properties[0].token, Token::new(table::PROPERTY, 1));
        assert_eq!(
            ty.properties[0].getter,
            Some(Accessor::Method(Token::new(table::METHOD_DEF, 1)))
        );
        assert_eq!(module.types[1].token, Token::new(table::TYPE_DEF, 2));
        module.validate().unwrap();
    }

    #[test]
    fn test_nested_full_name() {
        let (module, _) = sample();
        assert_eq!(module.full_name(&module.types[1]), "Lib.Outer/Inner");
        assert!(module.type_named("Lib.Outer/Inner").is_some());
    }

    #[test]
    fn test_declarations() {
        let (module, _) = sample();
        let names: Vec<String> = module.declarations().into_iter().collect();
        assert_eq!(
            names,
            vec![
                "F:Lib.Outer::count",
                "M:Lib.Outer::get_Count()~System.Int32",
                "P:Lib.Outer::Count",
                "T:Lib.Outer",
                "T:Lib.Outer/Inner",
            ]
        );
    }

    #[test]
    fn test_internals_visible_to() {
        let mut module = Module::new("Lib", VersionSpec::major_minor(1, 0));
        module.assembly_attributes.push(
            CustomAttribute::new(TypeName::core(known::INTERNALS_VISIBLE_TO))
                .with_arg(AttributeArg::String("Lib.Tests, PublicKey=0024".into())),
        );
        module.assembly_attributes.push(
            CustomAttribute::new(TypeName::core(known::INTERNALS_VISIBLE_TO))
                .with_arg(AttributeArg::String("lib".into())),
        );
        assert_eq!(module.internals_visible_to(), vec!["Lib.Tests".to_string()]);
    }

    #[test]
    fn test_validate_rejects_missing_accessor() {
        let mut module = Module::new("Lib", VersionSpec::major_minor(1, 0));
        module.add_type(
            TypeDef::new("Lib", "Broken", TypeAttributes::PUBLIC)
                .with_property(PropertyDef::new("Value", "System.Int32").getter("get_Value")),
        );
        assert!(matches!(module.validate(), Err(Error::Malformed(_))));
    }

    #[test]
    fn test_validate_rejects_dangling_enclosing() {
        let mut module = Module::new("Lib", VersionSpec::major_minor(1, 0));
        module.add_type(
            TypeDef::new("", "Orphan", TypeAttributes::NESTED_PUBLIC)
                .nested_in(Token::new(table::TYPE_DEF, 42)),
        );
        assert!(module.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_missing_local_base_type() {
        let mut module = Module::new("Lib", VersionSpec::major_minor(1, 0));
        module.add_type(
            TypeDef::new("Lib", "State", TypeAttributes::NOT_PUBLIC).extends("Lib.InternalBase"),
        );
        let err = module.validate().unwrap_err();
        assert!(err.to_string().contains("Lib.InternalBase"));

        module.add_type(TypeDef::new("Lib", "InternalBase", TypeAttributes::NOT_PUBLIC));
        module.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_missing_local_signature_type() {
        let mut module = Module::new("Lib", VersionSpec::major_minor(1, 0));
        module.add_type(
            TypeDef::new("Lib", "State", TypeAttributes::NOT_PUBLIC).with_method(
                MethodDef::new("Use", MethodAttributes::PUBLIC).param("h", "Lib.Hidden[]"),
            ),
        );
        let err = module.validate().unwrap_err();
        assert!(err.to_string().contains("Lib.Hidden"));
    }

    #[test]
    fn test_validate_rejects_unknown_assembly_scope() {
        let mut module = Module::new("Lib", VersionSpec::major_minor(1, 0));
        module.add_type(
            TypeDef::new("Lib", "Api", TypeAttributes::PUBLIC)
                .extends(TypeSig::external("Other", "Other.Base")),
        );
        assert!(module.validate().is_err());
        module.assembly_refs.push(AssemblyRef {
            name: "Other".into(),
            ..AssemblyRef::core_library()
        });
        module.validate().unwrap();
    }

    #[test]
    fn test_core_type_resolves_locally_in_the_core_library() {
        let mut corlib = Module::new("System.Private.CoreLib", VersionSpec::full(8, 0, 0, 0));
        corlib.assembly_refs.clear();
        corlib.add_type(TypeDef::new("System", "NotImplementedException", TypeAttributes::PUBLIC));
        assert_eq!(
            corlib.core_type(known::NOT_IMPLEMENTED_EXCEPTION),
            TypeName::local(known::NOT_IMPLEMENTED_EXCEPTION)
        );
        let (module, _) = sample();
        assert_eq!(
            module.core_type(known::NOT_IMPLEMENTED_EXCEPTION),
            TypeName::core(known::NOT_IMPLEMENTED_EXCEPTION)
        );
    }

    #[test]
    fn test_interning_reuses_entries() {
        let mut module = Module::new("Lib", VersionSpec::major_minor(1, 0));
        let a = module.intern_user_string("boom");
        let b = module.intern_user_string("boom");
        assert_eq!(a, b);
        assert_eq!(a, Token::new(table::USER_STRING, 1));
        assert_eq!(module.allocate(table::USER_STRING), Token::new(table::USER_STRING, 2));
    }
}
