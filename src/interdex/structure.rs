//! The per-DEX accumulator enforcing reference caps, and the bookkeeping
//! across the whole emitted DEX sequence.

use std::collections::HashSet;

use crate::interdex::DexInfo;
use crate::ir::{ClassId, FieldRef, GatheredRefs, MethodRef, StringId, TypeId};

/// Hard per-DEX reference caps. The format allows 65,536 of each kind; a
/// reserve can be configured to leave headroom for later passes.
#[derive(Clone, Copy, Debug)]
pub struct DexLimits {
    pub max_method_refs: usize,
    pub max_field_refs: usize,
    pub max_type_refs: usize,
    pub max_string_refs: usize,
}

impl Default for DexLimits {
    fn default() -> DexLimits {
        DexLimits {
            max_method_refs: 65536,
            max_field_refs: 65536,
            max_type_refs: 65536,
            max_string_refs: 65536,
        }
    }
}

/// State of the DEX currently being filled.
#[derive(Debug, Default)]
pub struct DexStructure {
    mrefs: HashSet<MethodRef>,
    frefs: HashSet<FieldRef>,
    trefs: HashSet<TypeId>,
    srefs: HashSet<StringId>,
    classes: Vec<ClassId>,
    squashed_classes: Vec<ClassId>,
}

impl DexStructure {
    pub fn classes(&self) -> &[ClassId] {
        &self.classes
    }

    pub fn squashed_classes(&self) -> &[ClassId] {
        &self.squashed_classes
    }

    pub fn num_mrefs(&self) -> usize {
        self.mrefs.len()
    }

    pub fn num_frefs(&self) -> usize {
        self.frefs.len()
    }

    pub fn num_trefs(&self) -> usize {
        self.trefs.len()
    }

    pub fn num_srefs(&self) -> usize {
        self.srefs.len()
    }

    fn insert_refs(&mut self, refs: &GatheredRefs) {
        self.mrefs.extend(refs.methods.iter().copied());
        self.frefs.extend(refs.fields.iter().copied());
        self.trefs.extend(refs.types.iter().copied());
        self.srefs.extend(refs.strings.iter().copied());
    }

    fn fits(&self, refs: &GatheredRefs, limits: &DexLimits) -> bool {
        let new_m = refs.methods.iter().filter(|r| !self.mrefs.contains(r)).count();
        let new_f = refs.fields.iter().filter(|r| !self.frefs.contains(r)).count();
        let new_t = refs.types.iter().filter(|r| !self.trefs.contains(r)).count();
        let new_s = refs.strings.iter().filter(|r| !self.srefs.contains(r)).count();
        self.mrefs.len() + new_m <= limits.max_method_refs
            && self.frefs.len() + new_f <= limits.max_field_refs
            && self.trefs.len() + new_t <= limits.max_type_refs
            && self.srefs.len() + new_s <= limits.max_string_refs
    }
}

/// Accumulates the sequence of emitted DEX files and the global counters.
#[derive(Debug, Default)]
pub struct DexesStructure {
    limits: DexLimits,
    current: DexStructure,
    all_classes: HashSet<ClassId>,
    num_dexes: usize,
    num_secondary_dexes: usize,
    num_coldstart_dexes: usize,
    num_extended_dexes: usize,
    num_scroll_dexes: usize,
    total_classes: usize,
    total_mrefs: usize,
    total_frefs: usize,
}

impl DexesStructure {
    pub fn new(limits: DexLimits) -> DexesStructure {
        DexesStructure {
            limits,
            ..DexesStructure::default()
        }
    }

    pub fn has_class(&self, cls: ClassId) -> bool {
        self.all_classes.contains(&cls)
    }

    pub fn current_dex_classes(&self) -> &[ClassId] {
        self.current.classes()
    }

    pub fn current_dex_squashed_classes(&self) -> &[ClassId] {
        self.current.squashed_classes()
    }

    pub fn num_dexes(&self) -> usize {
        self.num_dexes
    }

    pub fn num_secondary_dexes(&self) -> usize {
        self.num_secondary_dexes
    }

    pub fn num_coldstart_dexes(&self) -> usize {
        self.num_coldstart_dexes
    }

    pub fn num_extended_dexes(&self) -> usize {
        self.num_extended_dexes
    }

    pub fn num_scroll_dexes(&self) -> usize {
        self.num_scroll_dexes
    }

    pub fn num_classes(&self) -> usize {
        self.total_classes
    }

    pub fn num_mrefs(&self) -> usize {
        self.total_mrefs
    }

    pub fn num_frefs(&self) -> usize {
        self.total_frefs
    }

    /// Add a class if its refs fit under the caps; returns false otherwise.
    pub fn add_class_to_current_dex(&mut self, refs: &GatheredRefs, cls: ClassId) -> bool {
        if !self.current.fits(refs, &self.limits) {
            return false;
        }
        self.add_class_no_checks(refs, cls);
        true
    }

    /// Add a class regardless of the caps.
    pub fn add_class_no_checks(&mut self, refs: &GatheredRefs, cls: ClassId) {
        self.current.insert_refs(refs);
        self.current.classes.push(cls);
        self.all_classes.insert(cls);
    }

    /// Move a class of the current DEX into the squashed set; it will not
    /// appear in the emitted class list.
    pub fn squash_class(&mut self, cls: ClassId) {
        if let Some(pos) = self.current.classes.iter().position(|&c| c == cls) {
            self.current.classes.remove(pos);
            self.current.squashed_classes.push(cls);
        }
    }

    /// Close the current DEX and return its classes.
    pub fn end_dex(&mut self, dex_info: &DexInfo) -> Vec<ClassId> {
        self.num_dexes += 1;
        if !dex_info.primary {
            self.num_secondary_dexes += 1;
            if dex_info.coldstart {
                self.num_coldstart_dexes += 1;
            }
            if dex_info.extended {
                self.num_extended_dexes += 1;
            }
            if dex_info.scroll {
                self.num_scroll_dexes += 1;
            }
        }
        self.total_classes += self.current.classes.len();
        self.total_mrefs += self.current.mrefs.len();
        self.total_frefs += self.current.frefs.len();
        std::mem::take(&mut self.current).classes
    }
}
