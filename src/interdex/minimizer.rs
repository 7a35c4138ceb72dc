//! Greedy cross-DEX reference minimizer: orders class emission so classes
//! sharing references land in the same DEX.

use std::collections::{HashMap, HashSet};

use crate::ir::{ClassId, FieldRef, GatheredRefs, MethodRef, StringId, TypeId};

/// A reference of any kind, unified for counting and overlap tracking.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum RefKey {
    Method(MethodRef),
    Field(FieldRef),
    Type(TypeId),
    String(StringId),
}

#[derive(Clone, Debug)]
pub struct CrossDexRefMinimizerConfig {
    pub method_ref_weight: u64,
    pub field_ref_weight: u64,
    pub type_ref_weight: u64,
    pub string_ref_weight: u64,
    pub method_seed_weight: u64,
    pub field_seed_weight: u64,
    pub type_seed_weight: u64,
    pub string_seed_weight: u64,
}

impl Default for CrossDexRefMinimizerConfig {
    fn default() -> CrossDexRefMinimizerConfig {
        CrossDexRefMinimizerConfig {
            method_ref_weight: 100,
            field_ref_weight: 90,
            type_ref_weight: 100,
            string_ref_weight: 90,
            method_seed_weight: 600,
            field_seed_weight: 200,
            type_seed_weight: 250,
            string_seed_weight: 100,
        }
    }
}

impl CrossDexRefMinimizerConfig {
    fn ref_weight(&self, key: &RefKey) -> u64 {
        match key {
            RefKey::Method(_) => self.method_ref_weight,
            RefKey::Field(_) => self.field_ref_weight,
            RefKey::Type(_) => self.type_ref_weight,
            RefKey::String(_) => self.string_ref_weight,
        }
    }

    fn seed_weight(&self, key: &RefKey) -> u64 {
        match key {
            RefKey::Method(_) => self.method_seed_weight,
            RefKey::Field(_) => self.field_seed_weight,
            RefKey::Type(_) => self.type_seed_weight,
            RefKey::String(_) => self.string_seed_weight,
        }
    }
}

pub fn ref_keys(refs: &GatheredRefs) -> Vec<RefKey> {
    let mut keys = Vec::with_capacity(
        refs.methods.len() + refs.fields.len() + refs.types.len() + refs.strings.len(),
    );
    keys.extend(refs.methods.iter().map(|&m| RefKey::Method(m)));
    keys.extend(refs.fields.iter().map(|&f| RefKey::Field(f)));
    keys.extend(refs.types.iter().map(|&t| RefKey::Type(t)));
    keys.extend(refs.strings.iter().map(|&s| RefKey::String(s)));
    keys
}

#[derive(Debug, Default)]
pub struct CrossDexRefMinimizer {
    config: CrossDexRefMinimizerConfig,
    class_refs: HashMap<ClassId, Vec<RefKey>>,
    ref_counts: HashMap<RefKey, u64>,
    applied_refs: HashSet<RefKey>,
    ignored: HashSet<ClassId>,
}

impl CrossDexRefMinimizer {
    pub fn new(config: CrossDexRefMinimizerConfig) -> CrossDexRefMinimizer {
        CrossDexRefMinimizer {
            config,
            class_refs: HashMap::new(),
            ref_counts: HashMap::new(),
            applied_refs: HashSet::new(),
            ignored: HashSet::new(),
        }
    }

    pub fn config(&self) -> &CrossDexRefMinimizerConfig {
        &self.config
    }

    /// Record ref frequencies; called once per class before insertion.
    pub fn sample(&mut self, refs: &GatheredRefs) {
        for key in ref_keys(refs) {
            *self.ref_counts.entry(key).or_insert(0) += 1;
        }
    }

    /// Track a class as yet-to-emit.
    pub fn insert(&mut self, cls: ClassId, refs: &GatheredRefs) {
        self.class_refs.insert(cls, ref_keys(refs));
    }

    /// Exclude a class from seed selection; relocated helpers are expected
    /// to merge back and should not anchor a fresh DEX.
    pub fn ignore(&mut self, cls: ClassId) {
        self.ignored.insert(cls);
    }

    pub fn is_empty(&self) -> bool {
        self.class_refs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.class_refs.len()
    }

    pub fn contains(&self, cls: ClassId) -> bool {
        self.class_refs.contains_key(&cls)
    }

    pub fn get_applied_refs(&self) -> usize {
        self.applied_refs.len()
    }

    pub fn get_unapplied_refs(&self, cls: ClassId) -> usize {
        self.class_refs
            .get(&cls)
            .map(|refs| {
                refs.iter()
                    .filter(|r| !self.applied_refs.contains(r))
                    .count()
            })
            .unwrap_or(0)
    }

    fn seed_score(&self, cls: ClassId, refs: &[RefKey]) -> u64 {
        if self.ignored.contains(&cls) {
            return 0;
        }
        refs.iter()
            .map(|r| self.config.seed_weight(r) * self.ref_counts.get(r).copied().unwrap_or(0))
            .sum()
    }

    /// The seed pick for a fresh DEX: the class with the heaviest
    /// frequency-weighted refs. Ties break towards the smaller class id.
    pub fn worst(&self) -> Option<ClassId> {
        self.class_refs
            .iter()
            .map(|(&cls, refs)| (self.seed_score(cls, refs), std::cmp::Reverse(cls)))
            .max()
            .map(|(_, std::cmp::Reverse(cls))| cls)
    }

    /// The in-DEX pick: favors heavy overlap with the applied refs and few
    /// unapplied refs; ties break by seed score, then by class id.
    pub fn front(&self) -> Option<ClassId> {
        self.class_refs
            .iter()
            .map(|(&cls, refs)| {
                let mut applied_weight = 0i128;
                let mut unapplied_weight = 0i128;
                for r in refs {
                    let weight = self.config.ref_weight(r) as i128;
                    if self.applied_refs.contains(r) {
                        applied_weight += weight;
                    } else {
                        unapplied_weight += weight;
                    }
                }
                let priority = applied_weight - unapplied_weight;
                (
                    priority,
                    self.seed_score(cls, refs),
                    std::cmp::Reverse(cls),
                )
            })
            .max()
            .map(|(_, _, std::cmp::Reverse(cls))| cls)
    }

    /// Drop a class from tracking. Emitted classes contribute their refs to
    /// the applied set; an overflow means a fresh DEX was started, so the
    /// applied set resets to what the triggering class brought in.
    pub fn erase(&mut self, cls: ClassId, emitted: bool, overflowed: bool) {
        if overflowed {
            self.applied_refs.clear();
        }
        let refs = self.class_refs.remove(&cls);
        self.ignored.remove(&cls);
        if emitted {
            if let Some(refs) = refs {
                self.applied_refs.extend(refs);
            }
        }
    }
}
