//! Declaration flag constants and the accessibility ladder derived from them.
//!
//! The raw values follow ECMA-335 Partition II (§23.1.15 `TypeAttributes`,
//! §23.1.10 `MethodAttributes`, §23.1.5 `FieldAttributes`, §23.1.13 `ParamAttributes`).

#[allow(non_snake_case)]
/// Type attribute flag constants for type declarations.
pub mod TypeAttributes {
    /// Mask for the three visibility bits
    pub const VISIBILITY_MASK: u32 = 0x0000_0007;
    /// Top-level type visible only inside its module
    pub const NOT_PUBLIC: u32 = 0x0000_0000;
    /// Top-level type visible outside its module
    pub const PUBLIC: u32 = 0x0000_0001;
    /// Nested type accessible wherever its enclosing type is
    pub const NESTED_PUBLIC: u32 = 0x0000_0002;
    /// Nested type accessible only inside its enclosing type
    pub const NESTED_PRIVATE: u32 = 0x0000_0003;
    /// Nested type accessible to the enclosing type and its subtypes
    pub const NESTED_FAMILY: u32 = 0x0000_0004;
    /// Nested type accessible inside the module
    pub const NESTED_ASSEMBLY: u32 = 0x0000_0005;
    /// Nested type accessible to subtypes inside the module
    pub const NESTED_FAM_AND_ASSEM: u32 = 0x0000_0006;
    /// Nested type accessible to subtypes anywhere or inside the module
    pub const NESTED_FAM_OR_ASSEM: u32 = 0x0000_0007;
    /// Mask for the layout bits
    pub const LAYOUT_MASK: u32 = 0x0000_0018;
    /// Fields laid out in declaration order
    pub const SEQUENTIAL_LAYOUT: u32 = 0x0000_0008;
    /// Fields laid out at explicit offsets
    pub const EXPLICIT_LAYOUT: u32 = 0x0000_0010;
    /// Type is an interface
    pub const INTERFACE: u32 = 0x0000_0020;
    /// Type is abstract
    pub const ABSTRACT: u32 = 0x0000_0080;
    /// Type is sealed
    pub const SEALED: u32 = 0x0000_0100;
    /// Type carries declarative security; derived on write
    pub const HAS_SECURITY: u32 = 0x0004_0000;
}

#[allow(non_snake_case)]
/// Method attribute flag constants.
pub mod MethodAttributes {
    /// Mask for the three member access bits
    pub const MEMBER_ACCESS_MASK: u16 = 0x0007;
    /// Member not referenceable
    pub const COMPILER_CONTROLLED: u16 = 0x0000;
    /// Accessible only by the parent type
    pub const PRIVATE: u16 = 0x0001;
    /// Accessible by subtypes only in this module
    pub const FAM_AND_ASSEM: u16 = 0x0002;
    /// Accessible by anyone in the module
    pub const ASSEMBLY: u16 = 0x0003;
    /// Accessible only by type and subtypes
    pub const FAMILY: u16 = 0x0004;
    /// Accessible by subtypes anywhere, plus anyone in the module
    pub const FAM_OR_ASSEM: u16 = 0x0005;
    /// Accessible by anyone who can see the owning type
    pub const PUBLIC: u16 = 0x0006;
    /// Defined on type, else per instance
    pub const STATIC: u16 = 0x0010;
    /// Method cannot be overridden
    pub const FINAL: u16 = 0x0020;
    /// Method is virtual
    pub const VIRTUAL: u16 = 0x0040;
    /// Method hides by name and signature
    pub const HIDE_BY_SIG: u16 = 0x0080;
    /// Method does not provide an implementation
    pub const ABSTRACT: u16 = 0x0400;
    /// Method name is special
    pub const SPECIAL_NAME: u16 = 0x0800;
    /// Name is special to the runtime
    pub const RT_SPECIAL_NAME: u16 = 0x1000;
    /// Implementation is forwarded through P/Invoke
    pub const PINVOKE_IMPL: u16 = 0x2000;
    /// Method carries declarative security; derived on write
    pub const HAS_SECURITY: u16 = 0x4000;
}

#[allow(non_snake_case)]
/// Method implementation flag constants.
pub mod MethodImplAttributes {
    /// Mask for the code type bits
    pub const CODE_TYPE_MASK: u16 = 0x0003;
    /// Implementation is CIL
    pub const IL: u16 = 0x0000;
    /// Implementation is native
    pub const NATIVE: u16 = 0x0001;
    /// Implementation is provided by the runtime
    pub const RUNTIME: u16 = 0x0003;
    /// Implementation is an internal call
    pub const INTERNAL_CALL: u16 = 0x1000;
}

#[allow(non_snake_case)]
/// Field attribute flag constants.
pub mod FieldAttributes {
    /// Mask for the three field access bits
    pub const FIELD_ACCESS_MASK: u16 = 0x0007;
    /// Member not referenceable
    pub const COMPILER_CONTROLLED: u16 = 0x0000;
    /// Accessible only by the parent type
    pub const PRIVATE: u16 = 0x0001;
    /// Accessible by subtypes only in this module
    pub const FAM_AND_ASSEM: u16 = 0x0002;
    /// Accessible by anyone in the module
    pub const ASSEMBLY: u16 = 0x0003;
    /// Accessible only by type and subtypes
    pub const FAMILY: u16 = 0x0004;
    /// Accessible by subtypes anywhere, plus anyone in the module
    pub const FAM_OR_ASSEM: u16 = 0x0005;
    /// Accessible by anyone who can see the owning type
    pub const PUBLIC: u16 = 0x0006;
    /// Defined on type, else per instance
    pub const STATIC: u16 = 0x0010;
    /// Value is a compile time constant
    pub const LITERAL: u16 = 0x0040;
    /// Field has initial data at an RVA; derived on write
    pub const HAS_FIELD_RVA: u16 = 0x0100;
    /// Field has a marshalling descriptor; derived on write
    pub const HAS_FIELD_MARSHAL: u16 = 0x1000;
    /// Field has a default value; derived on write
    pub const HAS_DEFAULT: u16 = 0x8000;
}

#[allow(non_snake_case)]
/// Parameter attribute flag constants.
pub mod ParamAttributes {
    /// Parameter is passed in
    pub const IN: u16 = 0x0001;
    /// Parameter is passed out
    pub const OUT: u16 = 0x0002;
    /// Parameter is optional
    pub const OPTIONAL: u16 = 0x0010;
    /// Parameter has a default value; derived on write
    pub const HAS_DEFAULT: u16 = 0x1000;
    /// Parameter has a marshalling descriptor; derived on write
    pub const HAS_FIELD_MARSHAL: u16 = 0x2000;
}

#[allow(non_snake_case)]
/// Property attribute flag constants.
pub mod PropertyAttributes {
    /// Property has a default value; derived on write
    pub const HAS_DEFAULT: u16 = 0x1000;
}

/// How far outside its declaring scope a declaration can be seen
///
/// Ordered from widest to narrowest, so `a <= b` means `a` is at least as
/// visible as `b`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Accessibility {
    /// Visible to every consumer of the module
    Public,
    /// Visible to subtypes declared in other modules
    Protected,
    /// Visible inside the declaring module only
    Internal,
    /// Visible inside the declaring type only
    Private,
}

impl Accessibility {
    /// Maps type visibility bits to an accessibility level
    pub fn of_type(flags: u32) -> Self {
        match flags & TypeAttributes::VISIBILITY_MASK {
            TypeAttributes::PUBLIC | TypeAttributes::NESTED_PUBLIC => Self::Public,
            TypeAttributes::NESTED_FAMILY | TypeAttributes::NESTED_FAM_OR_ASSEM => Self::Protected,
            TypeAttributes::NESTED_PRIVATE => Self::Private,
            _ => Self::Internal,
        }
    }

    /// Maps method or field access bits to an accessibility level
    ///
    /// Method and field access bits share their encoding.
    pub fn of_member(flags: u16) -> Self {
        match flags & MethodAttributes::MEMBER_ACCESS_MASK {
            MethodAttributes::PUBLIC => Self::Public,
            MethodAttributes::FAMILY | MethodAttributes::FAM_OR_ASSEM => Self::Protected,
            MethodAttributes::ASSEMBLY | MethodAttributes::FAM_AND_ASSEM => Self::Internal,
            _ => Self::Private,
        }
    }
}
