use std::collections::HashMap;
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

use crate::cfg::IrCode;

/// Interned string handle.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct StringId(pub u32);

/// Interned type handle (a JVM internal name such as `Lcom/foo/Bar;`).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TypeId(pub u32);

/// Handle of a class definition registered in the arena.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ClassId(pub u32);

/// A method reference: owner type, name, and prototype descriptor.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct MethodRef {
    pub owner: TypeId,
    pub name: StringId,
    pub proto: StringId,
}

/// A field reference: owner type, name, and type descriptor.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct FieldRef {
    pub owner: TypeId,
    pub name: StringId,
    pub descriptor: StringId,
}

/// Java/DEX access flag set.
#[derive(Clone, Copy, Default, Eq, PartialEq, Hash)]
pub struct AccessFlags(pub u32);

impl AccessFlags {
    pub const PUBLIC: AccessFlags = AccessFlags(0x1);
    pub const PRIVATE: AccessFlags = AccessFlags(0x2);
    pub const PROTECTED: AccessFlags = AccessFlags(0x4);
    pub const STATIC: AccessFlags = AccessFlags(0x8);
    pub const FINAL: AccessFlags = AccessFlags(0x10);
    pub const VOLATILE: AccessFlags = AccessFlags(0x40);
    pub const TRANSIENT: AccessFlags = AccessFlags(0x80);
    pub const NATIVE: AccessFlags = AccessFlags(0x100);
    pub const INTERFACE: AccessFlags = AccessFlags(0x200);
    pub const ABSTRACT: AccessFlags = AccessFlags(0x400);
    pub const SYNTHETIC: AccessFlags = AccessFlags(0x1000);
    pub const ANNOTATION: AccessFlags = AccessFlags(0x2000);
    pub const ENUM: AccessFlags = AccessFlags(0x4000);
    pub const CONSTRUCTOR: AccessFlags = AccessFlags(0x10000);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: AccessFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: AccessFlags) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for AccessFlags {
    type Output = AccessFlags;
    fn bitor(self, rhs: AccessFlags) -> AccessFlags {
        AccessFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for AccessFlags {
    fn bitor_assign(&mut self, rhs: AccessFlags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for AccessFlags {
    type Output = AccessFlags;
    fn bitand(self, rhs: AccessFlags) -> AccessFlags {
        AccessFlags(self.0 & rhs.0)
    }
}

impl fmt::Debug for AccessFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessFlags({:#x})", self.0)
    }
}

/// Provenance marker linking a basic block back to a prior-pass method position.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SourceBlock {
    pub src: MethodRef,
    pub id: u32,
}

/// A field definition.
#[derive(Clone, Debug)]
pub struct DexField {
    pub refr: FieldRef,
    pub access: AccessFlags,
    pub static_value: i64,
}

/// A method definition with optional body.
#[derive(Debug)]
pub struct DexMethod {
    pub refr: MethodRef,
    pub access: AccessFlags,
    /// Deobfuscated display name override; the interned names are used if unset.
    pub deob_name: Option<String>,
    pub code: Option<IrCode>,
}

/// A class definition.
#[derive(Debug)]
pub struct DexClass {
    pub type_id: TypeId,
    pub super_class: Option<TypeId>,
    pub interfaces: Vec<TypeId>,
    pub access: AccessFlags,
    pub dmethods: Vec<DexMethod>,
    pub vmethods: Vec<DexMethod>,
    pub sfields: Vec<DexField>,
    pub ifields: Vec<DexField>,
    pub can_rename: bool,
    pub keep_name: bool,
    pub perf_sensitive: bool,
    pub interdex_subgroup: Option<u32>,
    /// Index of the owning store; 0 is the root store.
    pub store: usize,
}

impl DexClass {
    pub fn new(type_id: TypeId) -> DexClass {
        DexClass {
            type_id,
            super_class: None,
            interfaces: Vec::new(),
            access: AccessFlags::PUBLIC,
            dmethods: Vec::new(),
            vmethods: Vec::new(),
            sfields: Vec::new(),
            ifields: Vec::new(),
            can_rename: true,
            keep_name: false,
            perf_sensitive: false,
            interdex_subgroup: None,
            store: 0,
        }
    }

    pub fn is_interface(&self) -> bool {
        self.access.contains(AccessFlags::INTERFACE)
    }

    pub fn all_methods(&self) -> impl Iterator<Item = &DexMethod> {
        self.dmethods.iter().chain(self.vmethods.iter())
    }

    pub fn all_fields(&self) -> impl Iterator<Item = &DexField> {
        self.sfields.iter().chain(self.ifields.iter())
    }
}

/// References owned by a class, gathered from its members and bodies.
#[derive(Clone, Debug, Default)]
pub struct GatheredRefs {
    pub methods: Vec<MethodRef>,
    pub fields: Vec<FieldRef>,
    pub types: Vec<TypeId>,
    pub strings: Vec<StringId>,
}

/// Process-wide intern tables, threaded explicitly into every parse and
/// transform entry point.
#[derive(Default)]
pub struct DexArena {
    strings: Vec<String>,
    string_ids: HashMap<String, StringId>,
    type_names: Vec<StringId>,
    type_ids: HashMap<StringId, TypeId>,
    classes: Vec<DexClass>,
    class_by_type: HashMap<TypeId, ClassId>,
}

impl DexArena {
    pub fn new() -> DexArena {
        DexArena::default()
    }

    pub fn intern_string(&mut self, s: &str) -> StringId {
        if let Some(&id) = self.string_ids.get(s) {
            return id;
        }
        let id = StringId(self.strings.len() as u32);
        self.strings.push(s.to_string());
        self.string_ids.insert(s.to_string(), id);
        id
    }

    pub fn string(&self, id: StringId) -> &str {
        &self.strings[id.0 as usize]
    }

    /// Intern a type name, creating it if needed.
    pub fn make_type(&mut self, name: &str) -> TypeId {
        let sid = self.intern_string(name);
        if let Some(&id) = self.type_ids.get(&sid) {
            return id;
        }
        let id = TypeId(self.type_names.len() as u32);
        self.type_names.push(sid);
        self.type_ids.insert(sid, id);
        id
    }

    /// Look up an already-interned type name.
    pub fn get_type(&self, name: &str) -> Option<TypeId> {
        let sid = self.string_ids.get(name)?;
        self.type_ids.get(sid).copied()
    }

    pub fn type_name(&self, ty: TypeId) -> &str {
        self.string(self.type_names[ty.0 as usize])
    }

    pub fn add_class(&mut self, cls: DexClass) -> ClassId {
        let id = ClassId(self.classes.len() as u32);
        self.class_by_type.insert(cls.type_id, id);
        self.classes.push(cls);
        id
    }

    pub fn class(&self, id: ClassId) -> &DexClass {
        &self.classes[id.0 as usize]
    }

    pub fn class_mut(&mut self, id: ClassId) -> &mut DexClass {
        &mut self.classes[id.0 as usize]
    }

    /// Resolve a type to its class definition, if one is registered.
    pub fn type_class(&self, ty: TypeId) -> Option<ClassId> {
        self.class_by_type.get(&ty).copied()
    }

    pub fn method_ref(&mut self, owner: &str, name: &str, proto: &str) -> MethodRef {
        MethodRef {
            owner: self.make_type(owner),
            name: self.intern_string(name),
            proto: self.intern_string(proto),
        }
    }

    pub fn field_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> FieldRef {
        FieldRef {
            owner: self.make_type(owner),
            name: self.intern_string(name),
            descriptor: self.intern_string(descriptor),
        }
    }

    pub fn show_method(&self, m: &MethodRef) -> String {
        format!(
            "{}.{}{}",
            self.type_name(m.owner),
            self.string(m.name),
            self.string(m.proto)
        )
    }

    /// Deobfuscated display name for a method reference. Falls back to the
    /// interned name when the definition carries no override or is external.
    pub fn deobfuscated_method_name(&self, m: &MethodRef) -> String {
        if let Some(cls_id) = self.type_class(m.owner) {
            for method in self.class(cls_id).all_methods() {
                if method.refr == *m {
                    if let Some(ref deob) = method.deob_name {
                        return deob.clone();
                    }
                }
            }
        }
        self.show_method(m)
    }

    /// True if `sub` is the same as, a subclass of, or an implementor of `sup`.
    pub fn check_cast(&self, sub: TypeId, sup: TypeId) -> bool {
        if sub == sup {
            return true;
        }
        let Some(cls_id) = self.type_class(sub) else {
            return false;
        };
        let cls = self.class(cls_id);
        if let Some(super_ty) = cls.super_class {
            if self.check_cast(super_ty, sup) {
                return true;
            }
        }
        cls.interfaces.iter().any(|&i| self.check_cast(i, sup))
    }

    /// Gather the outgoing references of a class: members, bodies, hierarchy.
    pub fn gather_refs(&self, id: ClassId) -> GatheredRefs {
        let cls = self.class(id);
        let mut refs = GatheredRefs::default();
        refs.types.push(cls.type_id);
        if let Some(sup) = cls.super_class {
            refs.types.push(sup);
        }
        refs.types.extend(cls.interfaces.iter().copied());
        for field in cls.all_fields() {
            refs.fields.push(field.refr);
            refs.types.push(field.refr.owner);
        }
        for method in cls.all_methods() {
            refs.methods.push(method.refr);
            if let Some(ref code) = method.code {
                code.gather_refs(&mut refs);
            }
        }
        refs.methods.sort_unstable();
        refs.methods.dedup();
        refs.fields.sort_unstable();
        refs.fields.dedup();
        refs.types.sort_unstable();
        refs.types.dedup();
        refs.strings.sort_unstable();
        refs.strings.dedup();
        refs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_tables_are_stable() {
        let mut arena = DexArena::new();
        let a = arena.make_type("Lcom/foo/A;");
        let b = arena.make_type("Lcom/foo/B;");
        assert_ne!(a, b);
        assert_eq!(arena.make_type("Lcom/foo/A;"), a);
        assert_eq!(arena.get_type("Lcom/foo/A;"), Some(a));
        assert_eq!(arena.get_type("Lcom/foo/C;"), None);
        assert_eq!(arena.type_name(b), "Lcom/foo/B;");
    }

    #[test]
    fn check_cast_walks_hierarchy() {
        let mut arena = DexArena::new();
        let object = arena.make_type("Ljava/lang/Object;");
        let iface = arena.make_type("Lcom/foo/Iface;");
        let base = arena.make_type("Lcom/foo/Base;");
        let derived = arena.make_type("Lcom/foo/Derived;");

        let mut base_cls = DexClass::new(base);
        base_cls.super_class = Some(object);
        base_cls.interfaces.push(iface);
        arena.add_class(base_cls);

        let mut derived_cls = DexClass::new(derived);
        derived_cls.super_class = Some(base);
        arena.add_class(derived_cls);

        assert!(arena.check_cast(derived, base));
        assert!(arena.check_cast(derived, object));
        assert!(arena.check_cast(derived, iface));
        assert!(!arena.check_cast(base, derived));
    }

    #[test]
    fn gather_refs_dedups_and_sorts() {
        let mut arena = DexArena::new();
        let object = arena.make_type("Ljava/lang/Object;");
        let a = arena.make_type("Lcom/foo/A;");
        let field = arena.field_ref("Lcom/foo/A;", "count", "I");
        let mut cls = DexClass::new(a);
        cls.super_class = Some(object);
        cls.sfields.push(DexField {
            refr: field,
            access: AccessFlags::PUBLIC | AccessFlags::STATIC,
            static_value: 0,
        });
        let id = arena.add_class(cls);

        let refs = arena.gather_refs(id);
        assert_eq!(refs.fields, vec![field]);
        assert!(refs.types.contains(&a));
        assert!(refs.types.contains(&object));
    }
}
