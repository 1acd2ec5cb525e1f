//! Method body neutralization.
//!
//! Every method that has a body gets a short throwing sequence instead, so
//! a reference module loaded for execution by mistake fails loudly. The
//! heaps that only bodies referenced are emptied first.

use crate::module::{
    known, MemberRef, MemberSignature, MethodBody, MethodSignature, Module, TypeSig,
};
use tracing::debug;

/// What replaces a neutralized body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replacement {
    /// `ldnull; throw`
    Trap,
    /// Throws `System.NotImplementedException` naming the method
    Mock,
}

/// Replaces every method body in `module` and returns how many were replaced
///
/// Methods that can never carry byte code are untouched, even when a
/// decoded body is attached to them.
pub fn neutralize(module: &mut Module, replacement: Replacement) -> usize {
    module.user_strings.clear();
    module.member_refs.clear();

    let pending: Vec<(usize, usize, String)> = module
        .types
        .iter()
        .enumerate()
        .flat_map(|(t, ty)| {
            let owner = module.full_name(ty);
            ty.methods
                .iter()
                .enumerate()
                .filter(|(_, m)| m.has_body() && !m.is_bodiless())
                .map(move |(m, method)| (t, m, format!("{owner}::{}", method.name)))
        })
        .collect();
    if pending.is_empty() {
        return 0;
    }

    let ctor = match replacement {
        Replacement::Trap => None,
        Replacement::Mock => {
            let exception = module.core_type(known::NOT_IMPLEMENTED_EXCEPTION);
            Some(module.import_member(MemberRef {
                parent: TypeSig::Class(exception),
                name: ".ctor".to_string(),
                signature: MemberSignature::Method(MethodSignature::instance(
                    TypeSig::Void,
                    [TypeSig::String],
                )),
            }))
        }
    };

    let count = pending.len();
    for (t, m, qualified) in pending {
        let body = match ctor {
            Some(ctor) => {
                let message = module.intern_user_string(&format!(
                    "{qualified} is not implemented in a reference assembly"
                ));
                MethodBody::throwing(message, ctor)
            }
            None => MethodBody::trap(),
        };
        module.types[t].methods[m].body = Some(body);
    }

    debug!("neutralized {} method bodies in {}", count, module.name);
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{
        opcodes, MethodAttributes, MethodDef, MethodImplAttributes, TypeAttributes, TypeDef,
        TypeName,
    };
    use crate::version::VersionSpec;

    fn module() -> Module {
        let mut module = Module::new("Lib", VersionSpec::full(1, 0, 0, 0));
        module.user_strings.push("connection string".into());
        module.add_type(
            TypeDef::new("Lib", "Api", TypeAttributes::PUBLIC)
                .with_method(
                    MethodDef::new("Run", MethodAttributes::PUBLIC)
                        .with_body(MethodBody::new(vec![0x72, 1, 0, 0, 0x70, 0x26, 0x2A])),
                )
                .with_method(MethodDef::new(
                    "Describe",
                    MethodAttributes::PUBLIC | MethodAttributes::ABSTRACT | MethodAttributes::VIRTUAL,
                ))
                .with_method(
                    MethodDef::new("Native", MethodAttributes::PUBLIC | MethodAttributes::STATIC)
                        .with_impl_flags(MethodImplAttributes::INTERNAL_CALL),
                )
                .with_method(
                    MethodDef::new(".ctor", MethodAttributes::PUBLIC)
                        .with_body(MethodBody::new(vec![opcodes::RET])),
                ),
        );
        module
    }

    #[test]
    fn test_trap_replaces_bodies() {
        let mut module = module();
        assert_eq!(neutralize(&mut module, Replacement::Trap), 2);

        let api = &module.types[0];
        assert_eq!(api.methods[0].body, Some(MethodBody::trap()));
        assert_eq!(api.methods[1].body, None);
        assert_eq!(api.methods[2].body, None);
        assert!(api.methods[3].body.as_ref().unwrap().throws_immediately());
        assert!(module.user_strings.is_empty());
        module.validate().unwrap();
    }

    #[test]
    fn test_mock_names_the_method() {
        let mut module = module();
        neutralize(&mut module, Replacement::Mock);

        assert_eq!(module.member_refs.len(), 1);
        assert_eq!(
            module.member_refs[0].parent,
            TypeSig::Class(TypeName::core(known::NOT_IMPLEMENTED_EXCEPTION))
        );
        assert_eq!(
            module.user_strings,
            vec![
                "Lib.Api::Run is not implemented in a reference assembly".to_string(),
                "Lib.Api::.ctor is not implemented in a reference assembly".to_string(),
            ]
        );
        for method in &module.types[0].methods {
            if let Some(body) = &method.body {
                assert!(body.throws_immediately());
                assert_eq!(body.code.len(), 11);
            }
        }
        module.validate().unwrap();
    }

    #[test]
    fn test_bodies_on_bodiless_methods_are_left_alone() {
        let mut module = module();
        let stray = MethodBody::new(vec![opcodes::RET]);
        module.types[0].methods[2].body = Some(stray.clone());
        assert_eq!(neutralize(&mut module, Replacement::Trap), 2);
        assert_eq!(module.types[0].methods[2].body, Some(stray));
    }

    #[test]
    fn test_neutralize_is_stable() {
        let mut once = module();
        neutralize(&mut once, Replacement::Mock);
        let mut twice = once.clone();
        neutralize(&mut twice, Replacement::Mock);
        assert_eq!(once, twice);
    }
}
