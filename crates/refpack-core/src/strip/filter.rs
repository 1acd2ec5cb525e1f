//! Visibility filter: decides which declarations survive stripping.
//!
//! The filter never mutates the module. It produces a [`Selection`] of
//! tokens to remove, which the scrubber deletes after it has cleaned up
//! attribute applications.

use super::{FilterMode, StripPolicy};
use crate::module::{Accessibility, Module, Token, TypeDef, TypeSig};
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace};

/// Declarations marked for removal by the filter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    /// Types to delete, including every type nested in one of them
    pub removed_types: HashSet<Token>,
    /// Members of surviving types to delete
    pub removed_members: HashSet<Token>,
}

impl Selection {
    /// Returns true if the declaration with `token` survives
    pub fn keeps(&self, token: Token) -> bool {
        !self.removed_types.contains(&token) && !self.removed_members.contains(&token)
    }

    /// Returns true if nothing is removed
    pub fn is_empty(&self) -> bool {
        self.removed_types.is_empty() && self.removed_members.is_empty()
    }
}

/// Visibility policy resolved against one module
#[derive(Debug, Clone, Copy)]
pub struct MetadataFilter {
    mode: FilterMode,
    omit_non_api_members: bool,
}

impl MetadataFilter {
    /// Resolves the policy's mode for `module`
    ///
    /// `Auto` becomes `PublicAndInternal` when the module grants another
    /// module access to its internals and `Public` otherwise. Only the
    /// module's own declarations are consulted.
    pub fn new(policy: &StripPolicy, module: &Module) -> Self {
        let mode = match policy.filter_mode {
            FilterMode::Auto => {
                let friends = module.internals_visible_to();
                if friends.is_empty() {
                    FilterMode::Public
                } else {
                    debug!(
                        "{} exposes internals to {}, keeping internal declarations",
                        module.name,
                        friends.join(", ")
                    );
                    FilterMode::PublicAndInternal
                }
            }
            mode => mode,
        };
        Self {
            mode,
            omit_non_api_members: policy.omit_non_api_members && mode != FilterMode::All,
        }
    }

    /// The effective mode, never `Auto`
    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    /// Returns true if declarations of `accessibility` are part of the kept surface
    pub fn admits(&self, accessibility: Accessibility) -> bool {
        match self.mode {
            FilterMode::All => true,
            FilterMode::PublicAndInternal => accessibility <= Accessibility::Internal,
            FilterMode::Public | FilterMode::Auto => accessibility <= Accessibility::Protected,
        }
    }

    /// Computes the declarations to remove from `module`
    ///
    /// Types the mode would drop are kept when a surviving declaration needs
    /// them: the base type and generic constraints of a kept type, and the
    /// field, parameter, return, property and event types of its kept
    /// members. The `<Module>` type is always kept.
    pub fn select(&self, module: &Module) -> Selection {
        if self.mode == FilterMode::All {
            return Selection::default();
        }

        let by_token: HashMap<Token, &TypeDef> =
            module.types.iter().map(|t| (t.token, t)).collect();
        let by_name: HashMap<String, Token> = module
            .full_names()
            .into_iter()
            .map(|(token, name)| (name, token))
            .collect();

        let mut kept: HashSet<Token> = module
            .types
            .iter()
            .filter(|t| t.is_global() || self.chain_admitted(t, &by_token))
            .map(|t| t.token)
            .collect();

        let mut selection = Selection::default();
        let mut pending: Vec<Token> = module
            .types
            .iter()
            .map(|t| t.token)
            .filter(|t| kept.contains(t))
            .collect();
        let mut visited = HashSet::new();

        while let Some(token) = pending.pop() {
            if !visited.insert(token) {
                continue;
            }
            let Some(ty) = by_token.get(&token) else {
                continue;
            };
            let mut used = self.select_members(ty, &mut selection);
            used.extend(ty.extends.iter());
            used.extend(ty.generic_params.iter().flat_map(|p| p.constraints.iter()));

            for name in used.into_iter().flat_map(TypeSig::local_names) {
                let Some(&referenced) = by_name.get(name) else {
                    continue;
                };
                let mut current = Some(referenced);
                while let Some(t) = current {
                    if kept.insert(t) {
                        trace!("retaining {} for {}", name, ty.name);
                        pending.push(t);
                    }
                    current = by_token.get(&t).and_then(|ty| ty.enclosing);
                }
            }
        }

        selection.removed_types = module
            .types
            .iter()
            .map(|t| t.token)
            .filter(|t| !kept.contains(t))
            .collect();

        debug!(
            "{:?} filter keeps {} of {} types, drops {} members",
            self.mode,
            kept.len(),
            module.types.len(),
            selection.removed_members.len()
        );
        selection
    }

    fn chain_admitted(&self, ty: &TypeDef, by_token: &HashMap<Token, &TypeDef>) -> bool {
        let mut current = Some(ty);
        let mut steps = 0;
        while let Some(t) = current {
            if !self.admits(t.accessibility()) || steps > by_token.len() {
                return false;
            }
            steps += 1;
            current = match t.enclosing {
                Some(outer) => match by_token.get(&outer) {
                    Some(outer) => Some(*outer),
                    None => return false,
                },
                None => None,
            };
        }
        true
    }

    /// Marks the members of a surviving type and returns the signature types of the kept ones
    fn select_members<'t>(&self, ty: &'t TypeDef, selection: &mut Selection) -> Vec<&'t TypeSig> {
        let mut used = Vec::new();
        let mut kept_methods = HashSet::new();
        for method in &ty.methods {
            if self.admits(method.accessibility()) {
                kept_methods.insert(method.token);
                used.push(&method.signature.return_type);
                used.extend(method.signature.parameter_types());
                used.extend(method.generic_params.iter().flat_map(|p| p.constraints.iter()));
            } else {
                selection.removed_members.insert(method.token);
            }
        }

        let shape_field = ty
            .is_value_type()
            .then(|| ty.fields.iter().find(|f| f.is_instance()))
            .flatten()
            .map(|f| f.token);

        for field in &ty.fields {
            let keep = !self.omit_non_api_members
                || self.admits(field.accessibility())
                || Some(field.token) == shape_field;
            if keep {
                used.push(&field.field_type);
            } else {
                selection.removed_members.insert(field.token);
            }
        }

        for property in &ty.properties {
            if property.accessors().any(|a| kept_methods.contains(&a)) {
                used.push(&property.property_type);
                used.extend(property.parameters.iter());
            } else {
                selection.removed_members.insert(property.token);
            }
        }
        for event in &ty.events {
            if event.accessors().any(|a| kept_methods.contains(&a)) {
                used.push(&event.event_type);
            } else {
                selection.removed_members.insert(event.token);
            }
        }

        used
    }
}
