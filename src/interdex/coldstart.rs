//! Cold-start (betamap) list preparation and the optional pruning of
//! coldstart classes nothing references anymore.

use std::collections::{HashMap, HashSet};

use anyhow::{ensure, Result};
use log::debug;

use crate::ir::{ClassId, DexArena, GatheredRefs, TypeId};

pub const END_MARKER_PREFIX: &str = "LDexEndMarker";
pub const SCROLL_SET_START_PREFIX: &str = "LScrollSetStart";
pub const SCROLL_SET_END_PREFIX: &str = "LScrollSetEnd";
pub const BG_SET_START_PREFIX: &str = "LBackgroundSetStart";
pub const BG_SET_END_PREFIX: &str = "LBackgroundSetEnd";

/// One typed entry of the prepared cold-start sequence.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InterdexEntry {
    Class(ClassId),
    /// Index of this end marker within the list.
    EndMarker(usize),
    ScrollStart,
    ScrollEnd,
    BgStart,
    BgEnd,
}

/// The prepared list plus the number of end markers seen.
#[derive(Debug, Default)]
pub struct InterdexOrder {
    pub entries: Vec<InterdexEntry>,
    pub num_end_markers: usize,
}

/// Convert the ordered name list into typed entries. Classes pre-assigned to
/// an interdex subgroup are withheld and re-inserted after the end marker
/// whose index matches their subgroup.
pub fn load_interdex_entries(
    arena: &DexArena,
    scope: &[ClassId],
    coldstart_class_names: &[String],
) -> Result<InterdexOrder> {
    let in_scope: HashSet<ClassId> = scope.iter().copied().collect();

    // Group the pre-assigned classes by subgroup index.
    let mut group_classes: HashMap<u32, Vec<ClassId>> = HashMap::new();
    let mut num_groups = 0u32;
    for &cls_id in scope {
        if let Some(group) = arena.class(cls_id).interdex_subgroup {
            group_classes.entry(group).or_default().push(cls_id);
            num_groups = num_groups.max(group + 1);
        }
    }

    let mut order = InterdexOrder::default();
    let mut curr_group = 0u32;
    for name in coldstart_class_names {
        let cls = arena
            .get_type(name)
            .and_then(|ty| arena.type_class(ty))
            .filter(|cls| in_scope.contains(cls));
        if let Some(cls) = cls {
            if arena.class(cls).interdex_subgroup.is_some() {
                // Withheld; re-inserted after its group's end marker.
                continue;
            }
            order.entries.push(InterdexEntry::Class(cls));
        } else if name.starts_with(END_MARKER_PREFIX) {
            order.entries.push(InterdexEntry::EndMarker(order.num_end_markers));
            order.num_end_markers += 1;
            if let Some(classes) = group_classes.get(&curr_group) {
                order
                    .entries
                    .extend(classes.iter().map(|&c| InterdexEntry::Class(c)));
            }
            curr_group += 1;
        } else if name.starts_with(SCROLL_SET_START_PREFIX) {
            order.entries.push(InterdexEntry::ScrollStart);
        } else if name.starts_with(SCROLL_SET_END_PREFIX) {
            order.entries.push(InterdexEntry::ScrollEnd);
        } else if name.starts_with(BG_SET_START_PREFIX) {
            order.entries.push(InterdexEntry::BgStart);
        } else if name.starts_with(BG_SET_END_PREFIX) {
            order.entries.push(InterdexEntry::BgEnd);
        }
        // Anything else names a type outside the scope and is dropped.
    }

    // Classes of the group past the last seen end marker still go in.
    ensure!(
        num_groups <= curr_group + 2,
        "too many interdex subgroups: {} groups, {} end markers",
        num_groups,
        curr_group
    );
    if let Some(classes) = group_classes.get(&curr_group) {
        order
            .entries
            .extend(classes.iter().map(|&c| InterdexEntry::Class(c)));
    }

    Ok(order)
}

/// Fixed-point analysis finding coldstart classes no other coldstart class
/// references. Classes that cannot be renamed pin themselves. Off unless
/// static pruning is requested.
pub fn find_unreferenced_coldstart_classes(
    arena: &DexArena,
    scope: &[ClassId],
    entries: &[InterdexEntry],
    static_prune_classes: bool,
) -> HashSet<ClassId> {
    let mut unreferenced_classes = HashSet::new();
    if !static_prune_classes {
        return unreferenced_classes;
    }

    let coldstart_types: HashSet<TypeId> = entries
        .iter()
        .filter_map(|e| match e {
            InterdexEntry::Class(cls) => Some(arena.class(*cls).type_id),
            _ => None,
        })
        .collect();

    let mut input_scope: Vec<ClassId> = scope.to_vec();
    let mut old_no_ref = usize::MAX;
    let mut new_no_ref = 0;

    while old_no_ref != new_no_ref {
        old_no_ref = new_no_ref;
        new_no_ref = 0;
        let mut cold_cold_references: HashSet<TypeId> = HashSet::new();

        // References between distinct coldstart classes.
        for &cls_id in &input_scope {
            let cls = arena.class(cls_id);
            if !coldstart_types.contains(&cls.type_id) {
                continue;
            }
            for method in cls.all_methods() {
                let Some(code) = method.code.as_ref() else {
                    continue;
                };
                let mut refs = GatheredRefs::default();
                code.gather_refs(&mut refs);
                let owners = refs
                    .methods
                    .iter()
                    .map(|m| m.owner)
                    .chain(refs.fields.iter().map(|f| f.owner))
                    .chain(refs.types.iter().copied());
                for owner in owners {
                    if owner != cls.type_id && coldstart_types.contains(&owner) {
                        cold_cold_references.insert(owner);
                    }
                }
            }
        }

        // Classes that might be reached from native code pin themselves.
        for &cls_id in scope {
            let cls = arena.class(cls_id);
            if !cls.can_rename {
                cold_cold_references.insert(cls.type_id);
            }
        }

        // Pull in everything a referenced class mentions, even when no
        // opcode names it directly.
        for &cls_id in &input_scope {
            let cls = arena.class(cls_id);
            if cold_cold_references.contains(&cls.type_id) {
                for ty in arena.gather_refs(cls_id).types {
                    cold_cold_references.insert(ty);
                }
            }
        }

        let mut output_scope = Vec::new();
        for &cls_id in &input_scope {
            let cls = arena.class(cls_id);
            if !coldstart_types.contains(&cls.type_id) {
                continue;
            }
            if cls.can_rename && !cold_cold_references.contains(&cls.type_id) {
                new_no_ref += 1;
                unreferenced_classes.insert(cls_id);
            } else {
                output_scope.push(cls_id);
            }
        }
        debug!(
            "found {} classes in coldstart with no references",
            new_no_ref
        );
        input_scope = output_scope;
    }

    unreferenced_classes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{Block, ControlFlowGraph, Instruction, InvokeKind, IrCode};
    use crate::ir::{AccessFlags, DexClass, DexMethod};

    fn plain_class(arena: &mut DexArena, name: &str) -> ClassId {
        let ty = arena.make_type(name);
        arena.add_class(DexClass::new(ty))
    }

    fn class_calling(arena: &mut DexArena, name: &str, callee: &str) -> ClassId {
        let ty = arena.make_type(name);
        let callee_ref = arena.method_ref(callee, "hit", "()V");
        let refr = arena.method_ref(name, "run", "()V");
        let mut cfg = ControlFlowGraph::new();
        let block = cfg.add_block(Block {
            instructions: vec![
                Instruction::Invoke {
                    kind: InvokeKind::Static,
                    method: callee_ref,
                    args: Vec::new(),
                },
                Instruction::Return { src: None },
            ],
            ..Block::default()
        });
        cfg.set_entry(block);
        let mut cls = DexClass::new(ty);
        cls.vmethods.push(DexMethod {
            refr,
            access: AccessFlags::PUBLIC,
            deob_name: None,
            code: Some(IrCode::new(cfg)),
        });
        arena.add_class(cls)
    }

    #[test]
    fn entries_are_typed_and_markers_recognized() {
        let mut arena = DexArena::new();
        let a = plain_class(&mut arena, "Lcom/A;");
        let scope = vec![a];
        let names = vec![
            "Lcom/A;".to_string(),
            "LScrollSetStart;".to_string(),
            "LScrollSetEnd;".to_string(),
            "LDexEndMarker0;".to_string(),
            "Lcom/Missing;".to_string(),
        ];

        let order = load_interdex_entries(&arena, &scope, &names).expect("load entries");
        assert_eq!(
            order.entries,
            vec![
                InterdexEntry::Class(a),
                InterdexEntry::ScrollStart,
                InterdexEntry::ScrollEnd,
                InterdexEntry::EndMarker(0),
            ]
        );
        assert_eq!(order.num_end_markers, 1);
    }

    #[test]
    fn subgroup_classes_follow_their_end_marker() {
        let mut arena = DexArena::new();
        let a = plain_class(&mut arena, "Lcom/A;");
        let grouped = plain_class(&mut arena, "Lcom/Grouped;");
        arena.class_mut(grouped).interdex_subgroup = Some(0);
        let scope = vec![a, grouped];
        let names = vec![
            "Lcom/A;".to_string(),
            "Lcom/Grouped;".to_string(),
            "LDexEndMarker0;".to_string(),
        ];

        let order = load_interdex_entries(&arena, &scope, &names).expect("load entries");
        assert_eq!(
            order.entries,
            vec![
                InterdexEntry::Class(a),
                InterdexEntry::EndMarker(0),
                InterdexEntry::Class(grouped),
            ]
        );
    }

    #[test]
    fn pruning_keeps_referenced_and_pinned_classes() {
        let mut arena = DexArena::new();
        // A is pinned and calls B; C is unreferenced; D is unrenamable.
        let a = class_calling(&mut arena, "Lcom/A;", "Lcom/B;");
        arena.class_mut(a).can_rename = false;
        let b = plain_class(&mut arena, "Lcom/B;");
        let c = plain_class(&mut arena, "Lcom/C;");
        let d = plain_class(&mut arena, "Lcom/D;");
        arena.class_mut(d).can_rename = false;
        let scope = vec![a, b, c, d];
        let entries = vec![
            InterdexEntry::Class(a),
            InterdexEntry::Class(b),
            InterdexEntry::Class(c),
            InterdexEntry::Class(d),
        ];

        let unreferenced =
            find_unreferenced_coldstart_classes(&arena, &scope, &entries, true);
        assert!(unreferenced.contains(&c));
        assert!(!unreferenced.contains(&a));
        assert!(!unreferenced.contains(&b));
        assert!(!unreferenced.contains(&d));

        let disabled = find_unreferenced_coldstart_classes(&arena, &scope, &entries, false);
        assert!(disabled.is_empty());
    }
}
