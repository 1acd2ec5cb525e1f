//! Writing a [`Module`] as a PE image.
//!
//! `<Module>` always takes TypeDef row 1; the other types follow in model
//! order and their fields, methods, properties and events take rows in the
//! same order. Type references, type specs and member references are
//! created on first use. Tables that metadata requires sorted are sorted
//! once every row exists; generic parameters are emitted already sorted
//! because constraints and attributes point at their rows.
//!
//! Bodies may reference user strings, member references, and the module's
//! own types, fields and methods. Local variable signatures and exception
//! sections have no counterpart in the written tables, so bodies carrying
//! them must be neutralized first.

use super::heap::{BlobHeap, StringHeap, UserStringHeap};
use super::pe::{self, BODY_RVA};
use super::signature;
use super::tables::{id, Coded, TableSet};
use crate::error::{Error, Result};
use crate::module::{
    known, split_full_name, table, Accessor, AssemblyRef, Constant, CustomAttribute, EventDef,
    ExportScope, FieldAttributes, FieldDef, GenericParam, MemberRef, MemberSignature,
    MethodAttributes, MethodBody, MethodDef, MethodRef, MethodSignature, Module,
    ParamAttributes, PropertyAttributes, PropertyDef, Token, TypeAttributes, TypeDef, TypeName,
    TypeScope, TypeSig,
};
use crate::version::VersionSpec;
use std::collections::HashMap;

/// `AssemblyFlags.PublicKey`
const PUBLIC_KEY: u32 = 0x0001;

/// Semantics bits of MethodSemantics rows
mod semantics {
    pub(super) const SETTER: u32 = 0x01;
    pub(super) const GETTER: u32 = 0x02;
    pub(super) const ADD_ON: u32 = 0x08;
    pub(super) const REMOVE_ON: u32 = 0x10;
    pub(super) const FIRE: u32 = 0x20;
}

/// Sorted tables and the column they are keyed on
const SORT_KEYS: [(usize, usize); 10] = [
    (id::INTERFACE_IMPL, 0),
    (id::CONSTANT, 1),
    (id::CUSTOM_ATTRIBUTE, 0),
    (id::FIELD_MARSHAL, 0),
    (id::CLASS_LAYOUT, 2),
    (id::FIELD_LAYOUT, 1),
    (id::METHOD_SEMANTICS, 2),
    (id::METHOD_IMPL, 0),
    (id::IMPL_MAP, 1),
    (id::NESTED_CLASS, 0),
];

/// Encodes `module` as an IL-only DLL
///
/// The caller is expected to have validated the module; names that do not
/// resolve are reported as [`Error::Malformed`] all the same.
pub(crate) fn write_module(module: &Module) -> Result<Vec<u8>> {
    let mut encoder = Encoder::new(module);
    encoder.manifest()?;
    encoder.types()?;
    encoder.finish()
}

fn version_parts(version: &VersionSpec) -> Result<[u32; 4]> {
    let mut parts = [0u32; 4];
    for (part, component) in parts.iter_mut().zip(version.components()) {
        let value = component.unwrap_or(0);
        if value > u32::from(u16::MAX) {
            return Err(Error::malformed(format!(
                "version component {value} does not fit in 16 bits"
            )));
        }
        *part = value;
    }
    Ok(parts)
}

struct PendingParam<'m> {
    owner: u32,
    number: u32,
    param: &'m GenericParam,
}

struct Encoder<'m> {
    module: &'m Module,
    tables: TableSet,
    strings: StringHeap,
    blobs: BlobHeap,
    user_strings: UserStringHeap,
    bodies: Vec<u8>,
    order: Vec<Option<&'m TypeDef>>,
    local_types: HashMap<String, &'m TypeDef>,
    local_rows: HashMap<String, u32>,
    type_rows: HashMap<Token, u32>,
    field_rows: HashMap<Token, u32>,
    method_rows: HashMap<Token, u32>,
    type_refs: HashMap<TypeName, u32>,
    type_specs: HashMap<Vec<u8>, u32>,
    module_refs: HashMap<String, u32>,
    member_refs: HashMap<(u32, String, Vec<u8>), u32>,
    body_strings: HashMap<u32, u32>,
    generic_params: Vec<PendingParam<'m>>,
}

impl<'m> Encoder<'m> {
    fn new(module: &'m Module) -> Self {
        let names = module.full_names();
        let global = module.types.iter().find(|t| t.is_global());
        let mut order = vec![global];
        order.extend(module.types.iter().filter(|t| !t.is_global()).map(Some));

        let mut encoder = Self {
            module,
            tables: TableSet::new(),
            strings: StringHeap::new(),
            blobs: BlobHeap::new(),
            user_strings: UserStringHeap::new(),
            bodies: Vec::new(),
            order: Vec::new(),
            local_types: HashMap::new(),
            local_rows: HashMap::new(),
            type_rows: HashMap::new(),
            field_rows: HashMap::new(),
            method_rows: HashMap::new(),
            type_refs: HashMap::new(),
            type_specs: HashMap::new(),
            module_refs: HashMap::new(),
            member_refs: HashMap::new(),
            body_strings: HashMap::new(),
            generic_params: Vec::new(),
        };

        let (mut next_field, mut next_method) = (1, 1);
        for (rid, ty) in (1..).zip(&order) {
            let Some(ty) = ty else {
                continue;
            };
            encoder.type_rows.insert(ty.token, rid);
            if let Some(name) = names.get(&ty.token) {
                encoder.local_rows.insert(name.clone(), rid);
                encoder.local_types.insert(name.clone(), *ty);
            }
            for field in &ty.fields {
                encoder.field_rows.insert(field.token, next_field);
                next_field += 1;
            }
            for method in &ty.methods {
                encoder.method_rows.insert(method.token, next_method);
                next_method += 1;
            }
        }
        encoder.order = order;
        encoder
    }

    fn string(&mut self, value: &str) -> u32 {
        self.strings.add(value)
    }

    fn blob(&mut self, value: &[u8]) -> u32 {
        self.blobs.add(value)
    }

    /// Module, Assembly, AssemblyRef and ExportedType rows
    fn manifest(&mut self) -> Result<()> {
        let module = self.module;
        let name = self.string(&module.module_name);
        self.tables.push(id::MODULE, vec![0, name, 1, 0, 0]);

        let [major, minor, build, revision] = version_parts(&module.version)?;
        let mut flags = module.assembly_flags & !PUBLIC_KEY;
        if !module.public_key.is_empty() {
            flags |= PUBLIC_KEY;
        }
        let row = vec![
            module.hash_algorithm,
            major,
            minor,
            build,
            revision,
            flags,
            self.blob(&module.public_key),
            self.string(&module.name),
            self.string(&module.culture),
        ];
        self.tables.push(id::ASSEMBLY, row);

        for reference in &module.assembly_refs {
            let [major, minor, build, revision] = version_parts(&reference.version)?;
            let row = vec![
                major,
                minor,
                build,
                revision,
                reference.flags,
                self.blob(&reference.public_key_or_token),
                self.string(&reference.name),
                self.string(&reference.culture),
                self.blob(&reference.hash_value),
            ];
            self.tables.push(id::ASSEMBLY_REF, row);
        }

        self.attributes(id::ASSEMBLY, 1, &module.assembly_attributes)?;
        self.attributes(id::MODULE, 1, &module.module_attributes)?;

        for exported in &module.exported_types {
            let implementation = match &exported.scope {
                ExportScope::Assembly(assembly) => {
                    Coded::Implementation.encode(id::ASSEMBLY_REF, self.assembly_row(assembly)?)?
                }
                ExportScope::Enclosing(index) if *index < module.exported_types.len() => {
                    Coded::Implementation.encode(id::EXPORTED_TYPE, *index as u32 + 1)?
                }
                ExportScope::Enclosing(index) => {
                    return Err(Error::malformed(format!(
                        "exported type {} is nested in missing entry {index}",
                        exported.name
                    )))
                }
            };
            let row = vec![
                exported.flags,
                exported.type_def_id,
                self.string(&exported.name),
                self.string(&exported.namespace),
                implementation,
            ];
            self.tables.push(id::EXPORTED_TYPE, row);
        }
        Ok(())
    }

    fn assembly_row(&self, name: &str) -> Result<u32> {
        self.module
            .assembly_refs
            .iter()
            .position(|r| r.name.eq_ignore_ascii_case(name))
            .map(|i| i as u32 + 1)
            .ok_or_else(|| Error::malformed(format!("assembly {name} is not referenced")))
    }

    fn module_ref(&mut self, name: &str) -> u32 {
        if let Some(&rid) = self.module_refs.get(name) {
            return rid;
        }
        let row = vec![self.string(name)];
        let rid = self.tables.push(id::MODULE_REF, row);
        self.module_refs.insert(name.to_string(), rid);
        rid
    }

    /// The TypeDef or TypeRef token naming `name`
    fn type_token(&mut self, name: &TypeName) -> Result<Token> {
        if name.scope == TypeScope::Module {
            return self
                .local_rows
                .get(&name.full_name)
                .map(|&rid| Token::new(table::TYPE_DEF, rid))
                .ok_or_else(|| {
                    Error::malformed(format!("type {} is not declared in the module", name.full_name))
                });
        }
        self.type_ref(name).map(|rid| Token::new(table::TYPE_REF, rid))
    }

    fn type_ref(&mut self, name: &TypeName) -> Result<u32> {
        if let Some(&rid) = self.type_refs.get(name) {
            return Ok(rid);
        }
        // nested references are scoped by the reference to their enclosing type
        let (scope, simple) = match name.full_name.rsplit_once('/') {
            Some((outer, inner)) => {
                let outer = TypeName {
                    scope: name.scope.clone(),
                    full_name: outer.to_string(),
                };
                let outer = self.type_ref(&outer)?;
                (Coded::ResolutionScope.encode(id::TYPE_REF, outer)?, inner)
            }
            None => (self.resolution_scope(&name.scope)?, name.full_name.as_str()),
        };
        let (namespace, simple) = split_full_name(simple);
        let row = vec![scope, self.string(simple), self.string(namespace)];
        let rid = self.tables.push(id::TYPE_REF, row);
        self.type_refs.insert(name.clone(), rid);
        Ok(rid)
    }

    fn resolution_scope(&mut self, scope: &TypeScope) -> Result<u32> {
        match scope {
            TypeScope::Module => Coded::ResolutionScope.encode(id::MODULE, 1),
            TypeScope::CoreLibrary => {
                let rid = self
                    .module
                    .assembly_refs
                    .iter()
                    .position(AssemblyRef::is_core_library)
                    .map(|i| i as u32 + 1)
                    .ok_or_else(|| {
                        Error::malformed("core library types are used but no core library is referenced")
                    })?;
                Coded::ResolutionScope.encode(id::ASSEMBLY_REF, rid)
            }
            TypeScope::Assembly(assembly) => {
                Coded::ResolutionScope.encode(id::ASSEMBLY_REF, self.assembly_row(assembly)?)
            }
            TypeScope::ModuleRef(module) => {
                let rid = self.module_ref(module);
                Coded::ResolutionScope.encode(id::MODULE_REF, rid)
            }
        }
    }

    /// Table and row of the TypeDef, TypeRef or TypeSpec standing for `sig`
    fn type_row(&mut self, sig: &TypeSig) -> Result<(usize, u32)> {
        let named = match sig {
            TypeSig::Class(name) | TypeSig::ValueType(name) => Some(name.clone()),
            other => other.primitive_name().map(|p| self.module.core_type(p)),
        };
        let Some(name) = named else {
            return Ok((id::TYPE_SPEC, self.type_spec(sig)?));
        };
        let token = self.type_token(&name)?;
        Ok(match token.table() {
            table::TYPE_DEF => (id::TYPE_DEF, token.row()),
            _ => (id::TYPE_REF, token.row()),
        })
    }

    fn type_def_or_ref(&mut self, sig: &TypeSig) -> Result<u32> {
        let (target, rid) = self.type_row(sig)?;
        Coded::TypeDefOrRef.encode(target, rid)
    }

    fn type_spec(&mut self, sig: &TypeSig) -> Result<u32> {
        let blob = signature::write_type(sig, &mut |name: &TypeName| self.type_token(name))?;
        if let Some(&rid) = self.type_specs.get(&blob) {
            return Ok(rid);
        }
        let row = vec![self.blob(&blob)];
        let rid = self.tables.push(id::TYPE_SPEC, row);
        self.type_specs.insert(blob, rid);
        Ok(rid)
    }

    fn member_ref(&mut self, member: &MemberRef) -> Result<u32> {
        let (target, rid) = self.type_row(&member.parent)?;
        let parent = Coded::MemberRefParent.encode(target, rid)?;
        let blob =
            signature::write_member(&member.signature, &mut |name: &TypeName| self.type_token(name))?;
        let key = (parent, member.name.clone(), blob);
        if let Some(&rid) = self.member_refs.get(&key) {
            return Ok(rid);
        }
        let row = vec![parent, self.string(&member.name), self.blob(&key.2)];
        let rid = self.tables.push(id::MEMBER_REF, row);
        self.member_refs.insert(key, rid);
        Ok(rid)
    }

    fn method_def_or_ref(&mut self, method: &MethodRef) -> Result<u32> {
        match method {
            MethodRef::Def(token) => {
                let rid = self.method_row(*token)?;
                Coded::MethodDefOrRef.encode(id::METHOD_DEF, rid)
            }
            MethodRef::Ref(member) => {
                let rid = self.member_ref(member)?;
                Coded::MethodDefOrRef.encode(id::MEMBER_REF, rid)
            }
        }
    }

    fn method_row(&self, token: Token) -> Result<u32> {
        self.method_rows
            .get(&token)
            .copied()
            .ok_or_else(|| Error::malformed(format!("method {token} is not declared in the module")))
    }

    fn attributes(&mut self, parent_table: usize, rid: u32, attributes: &[CustomAttribute]) -> Result<()> {
        if attributes.is_empty() {
            return Ok(());
        }
        let parent = Coded::HasCustomAttribute.encode(parent_table, rid)?;
        for attribute in attributes {
            let constructor = self.attribute_constructor(attribute)?;
            let row = vec![parent, constructor, self.blob(&attribute.value)];
            self.tables.push(id::CUSTOM_ATTRIBUTE, row);
        }
        Ok(())
    }

    /// A local constructor when the attribute type declares a matching one
    fn attribute_constructor(&mut self, attribute: &CustomAttribute) -> Result<u32> {
        let local = attribute
            .attribute_type
            .is_local()
            .then(|| self.local_types.get(&attribute.attribute_type.full_name).copied())
            .flatten();
        let ctor = local.and_then(|ty| {
            ty.methods.iter().find(|m| {
                m.name == ".ctor"
                    && m.signature.has_this
                    && m.signature.parameter_types().eq(attribute.constructor.iter())
            })
        });
        if let Some(ctor) = ctor {
            let rid = self.method_row(ctor.token)?;
            return Coded::CustomAttributeType.encode(id::METHOD_DEF, rid);
        }

        let member = MemberRef {
            parent: TypeSig::Class(attribute.attribute_type.clone()),
            name: ".ctor".to_string(),
            signature: MemberSignature::Method(MethodSignature::instance(
                TypeSig::Void,
                attribute.constructor.iter().cloned(),
            )),
        };
        let rid = self.member_ref(&member)?;
        Coded::CustomAttributeType.encode(id::MEMBER_REF, rid)
    }

    fn constant(&mut self, parent_table: usize, rid: u32, constant: &Constant) -> Result<()> {
        let row = vec![
            u32::from(constant.element_type),
            Coded::HasConstant.encode(parent_table, rid)?,
            self.blob(&constant.value),
        ];
        self.tables.push(id::CONSTANT, row);
        Ok(())
    }

    fn marshal(&mut self, parent_table: usize, rid: u32, descriptor: &[u8]) -> Result<()> {
        let row = vec![
            Coded::HasFieldMarshal.encode(parent_table, rid)?,
            self.blob(descriptor),
        ];
        self.tables.push(id::FIELD_MARSHAL, row);
        Ok(())
    }

    fn queue_generic_params(&mut self, owner_table: usize, rid: u32, params: &'m [GenericParam]) -> Result<()> {
        let owner = Coded::TypeOrMethodDef.encode(owner_table, rid)?;
        for (number, param) in (0..).zip(params) {
            self.generic_params.push(PendingParam {
                owner,
                number,
                param,
            });
        }
        Ok(())
    }

    fn types(&mut self) -> Result<()> {
        let order = std::mem::take(&mut self.order);
        for (rid, ty) in (1..).zip(order) {
            let field_list = self.tables.len(id::FIELD) + 1;
            let method_list = self.tables.len(id::METHOD_DEF) + 1;
            match ty {
                Some(ty) => self.type_def(rid, ty, field_list, method_list)?,
                None => {
                    let row = vec![0, self.string(known::GLOBAL_TYPE), 0, 0, field_list, method_list];
                    self.tables.push(id::TYPE_DEF, row);
                }
            }
        }
        Ok(())
    }

    fn type_def(&mut self, rid: u32, ty: &'m TypeDef, field_list: u32, method_list: u32) -> Result<()> {
        let extends = match &ty.extends {
            Some(base) => self.type_def_or_ref(base)?,
            None => 0,
        };
        let row = vec![
            ty.flags & !TypeAttributes::HAS_SECURITY,
            self.string(&ty.name),
            self.string(&ty.namespace),
            extends,
            field_list,
            method_list,
        ];
        self.tables.push(id::TYPE_DEF, row);

        if let Some(enclosing) = ty.enclosing {
            let outer = self.type_rows.get(&enclosing).copied().ok_or_else(|| {
                Error::malformed(format!("type {} is nested in missing type {enclosing}", ty.name))
            })?;
            self.tables.push(id::NESTED_CLASS, vec![rid, outer]);
        }
        if let Some(layout) = ty.layout {
            self.tables.push(
                id::CLASS_LAYOUT,
                vec![u32::from(layout.packing), layout.class_size, rid],
            );
        }
        for interface in &ty.interfaces {
            let coded = self.type_def_or_ref(interface)?;
            self.tables.push(id::INTERFACE_IMPL, vec![rid, coded]);
        }
        self.attributes(id::TYPE_DEF, rid, &ty.attributes)?;
        self.queue_generic_params(id::TYPE_DEF, rid, &ty.generic_params)?;

        for field in &ty.fields {
            self.field(field)?;
        }
        for method in &ty.methods {
            self.method(method)?;
        }
        if !ty.properties.is_empty() {
            let first = self.tables.len(id::PROPERTY) + 1;
            self.tables.push(id::PROPERTY_MAP, vec![rid, first]);
            for property in &ty.properties {
                self.property(property)?;
            }
        }
        if !ty.events.is_empty() {
            let first = self.tables.len(id::EVENT) + 1;
            self.tables.push(id::EVENT_MAP, vec![rid, first]);
            for event in &ty.events {
                self.event(event)?;
            }
        }
        for method_override in &ty.overrides {
            let body = self.method_def_or_ref(&method_override.body)?;
            let declaration = self.method_def_or_ref(&method_override.declaration)?;
            self.tables.push(id::METHOD_IMPL, vec![rid, body, declaration]);
        }
        Ok(())
    }

    fn field(&mut self, field: &FieldDef) -> Result<()> {
        let mut flags = field.flags
            & !(FieldAttributes::HAS_DEFAULT
                | FieldAttributes::HAS_FIELD_MARSHAL
                | FieldAttributes::HAS_FIELD_RVA);
        if field.constant.is_some() {
            flags |= FieldAttributes::HAS_DEFAULT;
        }
        if field.marshal.is_some() {
            flags |= FieldAttributes::HAS_FIELD_MARSHAL;
        }
        let signature = signature::write_field(&field.field_type, &mut |name: &TypeName| self.type_token(name))?;
        let row = vec![u32::from(flags), self.string(&field.name), self.blob(&signature)];
        let rid = self.tables.push(id::FIELD, row);

        if let Some(constant) = &field.constant {
            self.constant(id::FIELD, rid, constant)?;
        }
        if let Some(descriptor) = &field.marshal {
            self.marshal(id::FIELD, rid, descriptor)?;
        }
        if let Some(offset) = field.offset {
            self.tables.push(id::FIELD_LAYOUT, vec![offset, rid]);
        }
        self.attributes(id::FIELD, rid, &field.attributes)
    }

    fn method(&mut self, method: &'m MethodDef) -> Result<()> {
        let rva = match &method.body {
            Some(body) => self.body(method, body)?,
            None => 0,
        };
        let signature =
            signature::write_method(&method.signature, &mut |name: &TypeName| self.type_token(name))?;
        let param_list = self.tables.len(id::PARAM) + 1;
        let row = vec![
            rva,
            u32::from(method.impl_flags),
            u32::from(method.flags & !MethodAttributes::HAS_SECURITY),
            self.string(&method.name),
            self.blob(&signature),
            param_list,
        ];
        let rid = self.tables.push(id::METHOD_DEF, row);

        if !method.return_attributes.is_empty() || method.return_marshal.is_some() {
            let flags = if method.return_marshal.is_some() {
                ParamAttributes::HAS_FIELD_MARSHAL
            } else {
                0
            };
            let param = self.tables.push(id::PARAM, vec![u32::from(flags), 0, 0]);
            if let Some(descriptor) = &method.return_marshal {
                self.marshal(id::PARAM, param, descriptor)?;
            }
            self.attributes(id::PARAM, param, &method.return_attributes)?;
        }
        for (sequence, parameter) in (1..).zip(&method.signature.parameters) {
            let mut flags = parameter.flags
                & !(ParamAttributes::HAS_DEFAULT | ParamAttributes::HAS_FIELD_MARSHAL);
            if parameter.default.is_some() {
                flags |= ParamAttributes::HAS_DEFAULT;
            }
            if parameter.marshal.is_some() {
                flags |= ParamAttributes::HAS_FIELD_MARSHAL;
            }
            let row = vec![u32::from(flags), sequence, self.string(&parameter.name)];
            let param = self.tables.push(id::PARAM, row);
            if let Some(default) = &parameter.default {
                self.constant(id::PARAM, param, default)?;
            }
            if let Some(descriptor) = &parameter.marshal {
                self.marshal(id::PARAM, param, descriptor)?;
            }
            self.attributes(id::PARAM, param, &parameter.attributes)?;
        }

        if let Some(pinvoke) = &method.pinvoke {
            let scope = self.module_ref(&pinvoke.module);
            let row = vec![
                u32::from(pinvoke.flags),
                Coded::MemberForwarded.encode(id::METHOD_DEF, rid)?,
                self.string(&pinvoke.entry),
                scope,
            ];
            self.tables.push(id::IMPL_MAP, row);
        }
        self.attributes(id::METHOD_DEF, rid, &method.attributes)?;
        self.queue_generic_params(id::METHOD_DEF, rid, &method.generic_params)
    }

    fn property(&mut self, property: &PropertyDef) -> Result<()> {
        let signature = signature::write_property(
            property.has_this,
            &property.property_type,
            &property.parameters,
            &mut |name: &TypeName| self.type_token(name),
        )?;
        let mut flags = property.flags & !PropertyAttributes::HAS_DEFAULT;
        if property.constant.is_some() {
            flags |= PropertyAttributes::HAS_DEFAULT;
        }
        let row = vec![u32::from(flags), self.string(&property.name), self.blob(&signature)];
        let rid = self.tables.push(id::PROPERTY, row);
        if let Some(constant) = &property.constant {
            self.constant(id::PROPERTY, rid, constant)?;
        }
        self.attributes(id::PROPERTY, rid, &property.attributes)?;

        let association = Coded::HasSemantics.encode(id::PROPERTY, rid)?;
        self.accessor(semantics::GETTER, property.getter.as_ref(), association)?;
        self.accessor(semantics::SETTER, property.setter.as_ref(), association)
    }

    fn event(&mut self, event: &EventDef) -> Result<()> {
        let event_type = self.type_def_or_ref(&event.event_type)?;
        let row = vec![u32::from(event.flags), self.string(&event.name), event_type];
        let rid = self.tables.push(id::EVENT, row);
        self.attributes(id::EVENT, rid, &event.attributes)?;

        let association = Coded::HasSemantics.encode(id::EVENT, rid)?;
        self.accessor(semantics::ADD_ON, event.adder.as_ref(), association)?;
        self.accessor(semantics::REMOVE_ON, event.remover.as_ref(), association)?;
        self.accessor(semantics::FIRE, event.raiser.as_ref(), association)
    }

    fn accessor(&mut self, kind: u32, accessor: Option<&Accessor>, association: u32) -> Result<()> {
        let Some(accessor) = accessor else {
            return Ok(());
        };
        let method = match accessor {
            Accessor::Method(token) => self.method_row(*token)?,
            Accessor::Named(name) => {
                return Err(Error::malformed(format!("accessor {name} is not linked to a method")))
            }
        };
        self.tables.push(id::METHOD_SEMANTICS, vec![kind, method, association]);
        Ok(())
    }

    /// Appends a method body and returns its RVA
    fn body(&mut self, method: &MethodDef, body: &MethodBody) -> Result<u32> {
        if body.is_fat() {
            return Err(Error::malformed(format!(
                "method {} has locals or exception handlers; neutralize before encoding",
                method.name
            )));
        }
        let module = self.module;
        let mut relinked = body.clone();
        for (offset, token) in body.token_operands() {
            let target = match token.table() {
                table::USER_STRING => Token::new(table::USER_STRING, self.body_string(token)?),
                table::MEMBER_REF => {
                    let member = (token.row() as usize)
                        .checked_sub(1)
                        .and_then(|i| module.member_refs.get(i))
                        .ok_or_else(|| Error::malformed(format!("unknown member reference {token}")))?;
                    Token::new(table::MEMBER_REF, self.member_ref(member)?)
                }
                table::FIELD => Token::new(table::FIELD, self.row_of(&self.field_rows, token)?),
                table::METHOD_DEF => Token::new(table::METHOD_DEF, self.method_row(token)?),
                table::TYPE_DEF => Token::new(table::TYPE_DEF, self.row_of(&self.type_rows, token)?),
                _ => {
                    return Err(Error::malformed(format!(
                        "method {} references {token}; neutralize before encoding",
                        method.name
                    )))
                }
            };
            relinked.patch_token(offset, target);
        }

        let code = relinked.code;
        if code.len() < 64 && body.max_stack == 8 && !body.init_locals {
            let rva = BODY_RVA + self.bodies.len() as u32;
            self.bodies.push(((code.len() as u8) << 2) | 0x02);
            self.bodies.extend_from_slice(&code);
            return Ok(rva);
        }
        while self.bodies.len() % 4 != 0 {
            self.bodies.push(0);
        }
        let rva = BODY_RVA + self.bodies.len() as u32;
        let flags: u16 = 0x3003 | if body.init_locals { 0x10 } else { 0 };
        self.bodies.extend_from_slice(&flags.to_le_bytes());
        self.bodies.extend_from_slice(&body.max_stack.to_le_bytes());
        self.bodies.extend_from_slice(&(code.len() as u32).to_le_bytes());
        self.bodies.extend_from_slice(&0u32.to_le_bytes());
        self.bodies.extend_from_slice(&code);
        Ok(rva)
    }

    fn row_of(&self, rows: &HashMap<Token, u32>, token: Token) -> Result<u32> {
        rows.get(&token)
            .copied()
            .ok_or_else(|| Error::malformed(format!("{token} is not declared in the module")))
    }

    /// `#US` offset of the user string a body token names
    fn body_string(&mut self, token: Token) -> Result<u32> {
        if let Some(&offset) = self.body_strings.get(&token.row()) {
            return Ok(offset);
        }
        let module = self.module;
        let value = (token.row() as usize)
            .checked_sub(1)
            .and_then(|i| module.user_strings.get(i))
            .ok_or_else(|| Error::malformed(format!("unknown user string {token}")))?;
        let offset = self.user_strings.add(value);
        if offset > 0x00FF_FFFF {
            return Err(Error::malformed("user string heap exceeds 16 MiB"));
        }
        self.body_strings.insert(token.row(), offset);
        Ok(offset)
    }

    fn finish(mut self) -> Result<Vec<u8>> {
        let mut pending = std::mem::take(&mut self.generic_params);
        pending.sort_by_key(|p| (p.owner, p.number));
        for PendingParam { owner, number, param } in pending {
            let row = vec![number, u32::from(param.flags), owner, self.string(&param.name)];
            let rid = self.tables.push(id::GENERIC_PARAM, row);
            for constraint in &param.constraints {
                let coded = self.type_def_or_ref(constraint)?;
                self.tables.push(id::GENERIC_PARAM_CONSTRAINT, vec![rid, coded]);
            }
            self.attributes(id::GENERIC_PARAM, rid, &param.attributes)?;
        }
        for (sorted, key) in SORT_KEYS {
            self.tables.sort_by_column(sorted, key);
        }

        let strings = self.strings.into_bytes();
        let blobs = self.blobs.into_bytes();
        let user_strings = self.user_strings.into_bytes();
        let guids = self.module.mvid.to_vec();
        self.tables.size_heaps(strings.len(), guids.len(), blobs.len());
        let tables = self.tables.write()?;
        let metadata = pe::write_metadata_root(&[
            ("#~", tables),
            ("#Strings", strings),
            ("#US", user_strings),
            ("#GUID", guids),
            ("#Blob", blobs),
        ]);
        Ok(pe::write_image(&self.bodies, &metadata))
    }
}
