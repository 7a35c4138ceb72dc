//! Optional cross-DEX method relocation: eligible methods move into fresh
//! helper classes that the minimizer can place independently; helpers merge
//! back into their origin class when the DEX they targeted overflows, or at
//! cleanup.

use std::collections::HashMap;

use log::debug;

use crate::ir::{AccessFlags, ClassId, DexArena, DexClass, DexMethod};

#[derive(Clone, Debug)]
pub struct CrossDexRelocatorConfig {
    pub relocate_static_methods: bool,
    pub relocate_non_static_direct_methods: bool,
    pub relocate_virtual_methods: bool,
    pub max_relocated_methods_per_class: usize,
}

impl Default for CrossDexRelocatorConfig {
    fn default() -> CrossDexRelocatorConfig {
        CrossDexRelocatorConfig {
            relocate_static_methods: false,
            relocate_non_static_direct_methods: false,
            relocate_virtual_methods: false,
            max_relocated_methods_per_class: 200,
        }
    }
}

impl CrossDexRelocatorConfig {
    pub fn enabled(&self) -> bool {
        self.relocate_static_methods
            || self.relocate_non_static_direct_methods
            || self.relocate_virtual_methods
    }
}

#[derive(Debug, Default)]
pub struct CrossDexRelocator {
    config: CrossDexRelocatorConfig,
    /// Helper class -> origin class.
    relocated_owners: HashMap<ClassId, ClassId>,
    /// Helpers placed into the DEX currently being filled.
    current_dex_helpers: Vec<ClassId>,
    /// Helpers already merged back; kept so cleanup skips them.
    squashed: Vec<ClassId>,
}

impl CrossDexRelocator {
    pub fn new(config: CrossDexRelocatorConfig) -> CrossDexRelocator {
        CrossDexRelocator {
            config,
            ..CrossDexRelocator::default()
        }
    }

    pub fn is_relocated_helper(&self, cls: ClassId) -> bool {
        self.relocated_owners.contains_key(&cls)
    }

    /// The origin class a helper was extracted from.
    pub fn origin_of(&self, helper: ClassId) -> Option<ClassId> {
        self.relocated_owners.get(&helper).copied()
    }

    pub fn is_squashed(&self, helper: ClassId) -> bool {
        self.squashed.contains(&helper)
    }

    /// Extract the eligible methods of `cls` into one fresh helper class.
    /// Returns the created helpers (zero or one).
    pub fn relocate_methods(&mut self, arena: &mut DexArena, cls: ClassId) -> Vec<ClassId> {
        let class = arena.class(cls);
        let name_sid = |m: &DexMethod| m.refr.name;
        let mut take_direct = Vec::new();
        for (i, m) in class.dmethods.iter().enumerate() {
            if m.code.is_none() {
                continue;
            }
            let name = arena.string(name_sid(m));
            if name == "<init>" || name == "<clinit>" {
                continue;
            }
            let is_static = m.access.contains(AccessFlags::STATIC);
            let wanted = (is_static && self.config.relocate_static_methods)
                || (!is_static && self.config.relocate_non_static_direct_methods);
            if wanted {
                take_direct.push(i);
            }
        }
        let mut take_virtual = Vec::new();
        if self.config.relocate_virtual_methods {
            for (i, m) in class.vmethods.iter().enumerate() {
                if m.code.is_some() && m.access.contains(AccessFlags::FINAL) {
                    take_virtual.push(i);
                }
            }
        }

        let cap = self.config.max_relocated_methods_per_class;
        take_direct.truncate(cap);
        take_virtual.truncate(cap.saturating_sub(take_direct.len()));
        if take_direct.is_empty() && take_virtual.is_empty() {
            return Vec::new();
        }

        let origin_name = arena.type_name(class.type_id).to_string();
        let helper_name = format!(
            "{}$relocated{};",
            origin_name.trim_end_matches(';'),
            self.relocated_owners.len()
        );
        let helper_ty = arena.make_type(&helper_name);

        let mut moved = Vec::new();
        {
            let class = arena.class_mut(cls);
            for &i in take_direct.iter().rev() {
                moved.push(class.dmethods.remove(i));
            }
            for &i in take_virtual.iter().rev() {
                moved.push(class.vmethods.remove(i));
            }
        }
        let mut helper = DexClass::new(helper_ty);
        helper.access = AccessFlags::PUBLIC | AccessFlags::FINAL;
        for mut method in moved {
            // Relocated methods become static members of the helper.
            method.refr.owner = helper_ty;
            method.access |= AccessFlags::STATIC;
            helper.dmethods.push(method);
        }
        let helper_id = arena.add_class(helper);
        self.relocated_owners.insert(helper_id, cls);
        debug!(
            "relocated {} methods from {} into {}",
            arena.class(helper_id).dmethods.len(),
            origin_name,
            helper_name
        );
        vec![helper_id]
    }

    /// Move a helper's methods back into its origin class; the helper stays
    /// registered but empty (squashed). A no-op for already-squashed helpers.
    pub fn merge_back(&mut self, arena: &mut DexArena, helper: ClassId) {
        if self.is_squashed(helper) {
            return;
        }
        let Some(&origin) = self.relocated_owners.get(&helper) else {
            return;
        };
        let origin_ty = arena.class(origin).type_id;
        let methods: Vec<DexMethod> = arena.class_mut(helper).dmethods.drain(..).collect();
        let origin_class = arena.class_mut(origin);
        for mut method in methods {
            method.refr.owner = origin_ty;
            origin_class.dmethods.push(method);
        }
        self.squashed.push(helper);
    }

    /// Track a class placed into the DEX being filled.
    pub fn add_to_current_dex(&mut self, cls: ClassId) {
        if self.is_relocated_helper(cls) {
            self.current_dex_helpers.push(cls);
        }
    }

    /// The DEX being filled overflowed: merge its helpers back into their
    /// origin classes and return the now-empty helper classes. Helpers that
    /// were already squashed at flush time are left alone.
    pub fn current_dex_overflowed(&mut self, arena: &mut DexArena) -> Vec<ClassId> {
        let helpers = std::mem::take(&mut self.current_dex_helpers);
        let mut merged = Vec::new();
        for helper in helpers {
            if self.is_squashed(helper) {
                continue;
            }
            self.merge_back(arena, helper);
            merged.push(helper);
        }
        merged
    }

    /// Merge back everything still relocated.
    pub fn cleanup(&mut self, arena: &mut DexArena) -> Vec<ClassId> {
        let pending: Vec<ClassId> = self
            .relocated_owners
            .keys()
            .copied()
            .filter(|h| !self.squashed.contains(h))
            .collect();
        let mut sorted = pending;
        sorted.sort_unstable();
        for &helper in &sorted {
            self.merge_back(arena, helper);
        }
        self.current_dex_helpers.clear();
        sorted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{Block, ControlFlowGraph, Instruction, IrCode};

    fn class_with_static_methods(arena: &mut DexArena, name: &str, count: usize) -> ClassId {
        let ty = arena.make_type(name);
        let mut cls = DexClass::new(ty);
        for i in 0..count {
            let refr = arena.method_ref(name, &format!("helper{}", i), "()V");
            let mut cfg = ControlFlowGraph::new();
            let block = cfg.add_block(Block {
                instructions: vec![Instruction::Return { src: None }],
                ..Block::default()
            });
            cfg.set_entry(block);
            cls.dmethods.push(DexMethod {
                refr,
                access: AccessFlags::PUBLIC | AccessFlags::STATIC,
                deob_name: None,
                code: Some(IrCode::new(cfg)),
            });
        }
        arena.add_class(cls)
    }

    #[test]
    fn static_methods_move_to_a_helper_and_back() {
        let mut arena = DexArena::new();
        let cls = class_with_static_methods(&mut arena, "Lcom/Busy;", 3);
        let mut relocator = CrossDexRelocator::new(CrossDexRelocatorConfig {
            relocate_static_methods: true,
            ..CrossDexRelocatorConfig::default()
        });

        let helpers = relocator.relocate_methods(&mut arena, cls);
        assert_eq!(helpers.len(), 1);
        let helper = helpers[0];
        assert!(relocator.is_relocated_helper(helper));
        assert_eq!(arena.class(helper).dmethods.len(), 3);
        assert!(arena.class(cls).dmethods.is_empty());
        let helper_ty = arena.class(helper).type_id;
        assert!(arena
            .class(helper)
            .dmethods
            .iter()
            .all(|m| m.refr.owner == helper_ty));

        let squashed = relocator.cleanup(&mut arena);
        assert_eq!(squashed, vec![helper]);
        assert_eq!(arena.class(cls).dmethods.len(), 3);
        assert!(arena.class(helper).dmethods.is_empty());
    }

    #[test]
    fn overflow_merges_only_current_dex_helpers() {
        let mut arena = DexArena::new();
        let a = class_with_static_methods(&mut arena, "Lcom/A;", 1);
        let b = class_with_static_methods(&mut arena, "Lcom/B;", 1);
        let mut relocator = CrossDexRelocator::new(CrossDexRelocatorConfig {
            relocate_static_methods: true,
            ..CrossDexRelocatorConfig::default()
        });
        let helper_a = relocator.relocate_methods(&mut arena, a)[0];
        let helper_b = relocator.relocate_methods(&mut arena, b)[0];

        relocator.add_to_current_dex(helper_a);
        let merged = relocator.current_dex_overflowed(&mut arena);
        assert_eq!(merged, vec![helper_a]);
        assert_eq!(arena.class(a).dmethods.len(), 1);
        // The other helper is untouched until cleanup.
        assert_eq!(arena.class(helper_b).dmethods.len(), 1);
        let remaining = relocator.cleanup(&mut arena);
        assert_eq!(remaining, vec![helper_b]);
    }

    #[test]
    fn constructors_are_never_relocated() {
        let mut arena = DexArena::new();
        let ty = arena.make_type("Lcom/C;");
        let mut cls = DexClass::new(ty);
        let refr = arena.method_ref("Lcom/C;", "<init>", "()V");
        let mut cfg = ControlFlowGraph::new();
        let block = cfg.add_block(Block {
            instructions: vec![Instruction::Return { src: None }],
            ..Block::default()
        });
        cfg.set_entry(block);
        cls.dmethods.push(DexMethod {
            refr,
            access: AccessFlags::PUBLIC | AccessFlags::STATIC,
            deob_name: None,
            code: Some(IrCode::new(cfg)),
        });
        let cls = arena.add_class(cls);
        let mut relocator = CrossDexRelocator::new(CrossDexRelocatorConfig {
            relocate_static_methods: true,
            ..CrossDexRelocatorConfig::default()
        });

        assert!(relocator.relocate_methods(&mut arena, cls).is_empty());
    }
}
