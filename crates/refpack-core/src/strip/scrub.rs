//! Attribute scrubbing and declaration deletion.
//!
//! Removal happens in two phases. Types are first marked (filter output,
//! configured removals, and everything nested in either), attribute
//! applications naming any marked or configured type are dropped from every
//! declaration that carries attributes, and only then are the marked
//! declarations deleted. Interface lists, overrides and accessors that
//! pointed at deleted declarations are cleared last.

use super::filter::Selection;
use crate::module::{
    Accessor, CustomAttribute, MemberSignature, MethodRef, Module, Token, TypeSig,
};
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, trace};

/// Counters reported by [`scrub`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScrubStats {
    /// Attribute applications removed
    pub attributes_removed: usize,
    /// Type declarations deleted
    pub types_removed: usize,
    /// Member declarations deleted from surviving types
    pub members_removed: usize,
}

/// Names that no longer resolve once marked types are gone
struct Removal {
    /// Configured names plus full names of marked types
    names: HashSet<String>,
    /// Full names of marked module-local types
    local: HashSet<String>,
}

impl Removal {
    fn drops(&self, attribute: &CustomAttribute) -> bool {
        self.names.contains(&attribute.attribute_type.full_name)
            || attribute.constructor.iter().any(|t| self.mentions(t))
    }

    fn mentions(&self, sig: &TypeSig) -> bool {
        sig.local_names().iter().any(|name| self.local.contains(*name))
    }
}

/// Marks, scrubs, and deletes
///
/// `configured` holds full type names to remove regardless of visibility.
/// Configured names that are not declared in the module still have their
/// attribute applications removed.
pub fn scrub(module: &mut Module, configured: &BTreeSet<String>, selection: &Selection) -> ScrubStats {
    let names = module.full_names();
    let mut marked: HashSet<Token> = selection.removed_types.clone();
    for ty in &module.types {
        if names.get(&ty.token).is_some_and(|n| configured.contains(n)) {
            marked.insert(ty.token);
        }
    }
    cascade_nested(module, &mut marked);

    let local: HashSet<String> = marked.iter().filter_map(|t| names.get(t).cloned()).collect();
    let removal = Removal {
        names: configured.iter().cloned().chain(local.iter().cloned()).collect(),
        local,
    };

    let mut stats = ScrubStats::default();
    stats.attributes_removed += scrub_attributes(module, &removal);

    let before = module.types.len();
    module.types.retain(|t| !marked.contains(&t.token));
    stats.types_removed = before - module.types.len();

    let removed = &selection.removed_members;
    for ty in &mut module.types {
        let before = ty.fields.len() + ty.methods.len() + ty.properties.len() + ty.events.len();
        ty.fields.retain(|f| !removed.contains(&f.token));
        ty.methods.retain(|m| !removed.contains(&m.token));
        ty.properties.retain(|p| !removed.contains(&p.token));
        ty.events.retain(|e| !removed.contains(&e.token));
        stats.members_removed +=
            before - (ty.fields.len() + ty.methods.len() + ty.properties.len() + ty.events.len());

        // a surviving property or event may have lost one of its accessors
        let methods: HashSet<Token> = ty.methods.iter().map(|m| m.token).collect();
        let live = |slot: &mut Option<Accessor>| {
            if slot
                .as_ref()
                .and_then(Accessor::token)
                .is_some_and(|token| !methods.contains(&token))
            {
                *slot = None;
            }
        };
        for property in &mut ty.properties {
            property.accessor_slots().into_iter().for_each(live);
        }
        for event in &mut ty.events {
            event.accessor_slots().into_iter().for_each(live);
        }

        ty.interfaces.retain(|interface| {
            let keep = !removal.mentions(interface);
            if !keep {
                trace!("dropping interface {} from {}", interface, ty.name);
            }
            keep
        });
    }

    let methods: HashSet<Token> = module
        .types
        .iter()
        .flat_map(|t| t.methods.iter().map(|m| m.token))
        .collect();
    let live = |target: &MethodRef| match target {
        MethodRef::Def(token) => methods.contains(token),
        MethodRef::Ref(member) => {
            !removal.mentions(&member.parent)
                && match &member.signature {
                    MemberSignature::Method(signature) => {
                        !removal.mentions(&signature.return_type)
                            && !signature.parameter_types().any(|t| removal.mentions(t))
                    }
                    MemberSignature::Field(field_type) => {
                        !removal.mentions(field_type)
                    }
                }
        }
    };
    for ty in &mut module.types {
        ty.overrides.retain(|o| live(&o.body) && live(&o.declaration));
    }

    debug!(
        "scrubbed {} attributes, deleted {} types and {} members",
        stats.attributes_removed, stats.types_removed, stats.members_removed
    );
    stats
}

fn cascade_nested(module: &Module, marked: &mut HashSet<Token>) {
    loop {
        let before = marked.len();
        for ty in &module.types {
            if ty.enclosing.is_some_and(|outer| marked.contains(&outer)) {
                marked.insert(ty.token);
            }
        }
        if marked.len() == before {
            break;
        }
    }
}

fn scrub_attributes(module: &mut Module, removal: &Removal) -> usize {
    let mut count = scrub_list(&mut module.assembly_attributes, removal);
    count += scrub_list(&mut module.module_attributes, removal);
    for ty in &mut module.types {
        count += scrub_list(&mut ty.attributes, removal);
        for param in &mut ty.generic_params {
            count += scrub_list(&mut param.attributes, removal);
        }
        for field in &mut ty.fields {
            count += scrub_list(&mut field.attributes, removal);
        }
        for method in &mut ty.methods {
            count += scrub_list(&mut method.attributes, removal);
            count += scrub_list(&mut method.return_attributes, removal);
            for parameter in &mut method.signature.parameters {
                count += scrub_list(&mut parameter.attributes, removal);
            }
            for param in &mut method.generic_params {
                count += scrub_list(&mut param.attributes, removal);
            }
        }
        for property in &mut ty.properties {
            count += scrub_list(&mut property.attributes, removal);
        }
        for event in &mut ty.events {
            count += scrub_list(&mut event.attributes, removal);
        }
    }
    count
}

fn scrub_list(attributes: &mut Vec<CustomAttribute>, removal: &Removal) -> usize {
    let before = attributes.len();
    attributes.retain(|a| {
        let keep = !removal.drops(a);
        if !keep {
            trace!("dropping [{}]", a.attribute_type);
        }
        keep
    });
    before - attributes.len()
}
