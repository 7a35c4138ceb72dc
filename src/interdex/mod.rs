//! Inter-dex packing: partitions the class set into a DEX sequence under
//! per-DEX reference caps, honoring the cold-start ordering contract, the
//! scroll/background/extended marker protocol, and the cross-dex reference
//! minimizer.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use anyhow::{ensure, Context, Result};
use log::{debug, info, warn};

use crate::ir::{AccessFlags, ClassId, DexArena, DexClass, GatheredRefs};

pub mod coldstart;
pub mod minimizer;
pub mod plugin;
pub mod relocator;
pub mod structure;

pub use coldstart::{find_unreferenced_coldstart_classes, load_interdex_entries, InterdexEntry};
pub use minimizer::{CrossDexRefMinimizer, CrossDexRefMinimizerConfig};
pub use plugin::InterDexPlugin;
pub use relocator::{CrossDexRelocator, CrossDexRelocatorConfig};
pub use structure::{DexLimits, DexesStructure};

pub const CANARY_PREFIX: &str = "Lsecondary/dex";
const MAX_DEX_NUM: usize = 99;

/// Flags carried alongside each emitted DEX.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DexInfo {
    pub primary: bool,
    pub coldstart: bool,
    pub extended: bool,
    pub scroll: bool,
    pub background: bool,
    pub betamap_ordered: bool,
}

#[derive(Clone, Debug)]
pub struct InterDexConfig {
    /// False keeps the primary DEX sealed: its classes stay, nothing enters.
    pub normal_primary_dex: bool,
    /// In normal-primary mode, prepend the primary's classes to the order.
    pub keep_primary_order: bool,
    pub static_prune_classes: bool,
    pub minimize_cross_dex_refs: bool,
    pub force_single_dex: bool,
    pub emit_canaries: bool,
    pub sort_remaining_classes: bool,
    pub limits: DexLimits,
    pub minimizer: CrossDexRefMinimizerConfig,
    pub relocator: CrossDexRelocatorConfig,
    pub secondary_dex_asset_dir: Option<PathBuf>,
}

impl Default for InterDexConfig {
    fn default() -> InterDexConfig {
        InterDexConfig {
            normal_primary_dex: false,
            keep_primary_order: true,
            static_prune_classes: false,
            minimize_cross_dex_refs: true,
            force_single_dex: false,
            emit_canaries: true,
            sort_remaining_classes: false,
            limits: DexLimits::default(),
            minimizer: CrossDexRefMinimizerConfig::default(),
            relocator: CrossDexRelocatorConfig::default(),
            secondary_dex_asset_dir: None,
        }
    }
}

/// The ordered DEX partition and the flags of each canary-carrying DEX.
#[derive(Debug, Default)]
pub struct InterDexResult {
    pub dexes: Vec<Vec<ClassId>>,
    pub dex_infos: Vec<(String, DexInfo)>,
}

pub struct InterDex<'a> {
    arena: &'a mut DexArena,
    /// The root store's input DEX list; index 0 is the primary.
    dexen: Vec<Vec<ClassId>>,
    scope: Vec<ClassId>,
    plugins: Vec<Box<dyn InterDexPlugin>>,
    config: InterDexConfig,
    coldstart_class_names: Vec<String>,
    dexes_structure: DexesStructure,
    emitting_scroll_set: bool,
    emitting_bg_set: bool,
    emitted_bg_set: bool,
    emitting_extended: bool,
    outdex: Vec<Vec<ClassId>>,
    dex_infos: Vec<(String, DexInfo)>,
    minimizer: CrossDexRefMinimizer,
    relocator: Option<CrossDexRelocator>,
}

impl<'a> InterDex<'a> {
    pub fn new(
        arena: &'a mut DexArena,
        dexen: Vec<Vec<ClassId>>,
        coldstart_class_names: Vec<String>,
        plugins: Vec<Box<dyn InterDexPlugin>>,
        config: InterDexConfig,
    ) -> InterDex<'a> {
        let scope: Vec<ClassId> = dexen.iter().flatten().copied().collect();
        let dexes_structure = DexesStructure::new(config.limits);
        let minimizer = CrossDexRefMinimizer::new(config.minimizer.clone());
        let relocator = config
            .relocator
            .enabled()
            .then(|| CrossDexRelocator::new(config.relocator.clone()));
        InterDex {
            arena,
            dexen,
            scope,
            plugins,
            config,
            coldstart_class_names,
            dexes_structure,
            emitting_scroll_set: false,
            emitting_bg_set: false,
            emitted_bg_set: false,
            emitting_extended: false,
            outdex: Vec::new(),
            dex_infos: Vec::new(),
            minimizer,
            relocator,
        }
    }

    fn is_canary(&self, cls: ClassId) -> bool {
        let ty = self.arena.class(cls).type_id;
        self.arena.type_name(ty).starts_with(CANARY_PREFIX)
    }

    fn should_skip_class_due_to_plugin(&mut self, cls: ClassId) -> bool {
        let arena: &DexArena = self.arena;
        for plugin in &mut self.plugins {
            if plugin.should_skip_class(arena, cls) {
                debug!(
                    "skipping class from {} :: {}",
                    plugin.name(),
                    arena.type_name(arena.class(cls).type_id)
                );
                return true;
            }
        }
        false
    }

    fn should_not_relocate_methods_of_class(&self, cls: ClassId) -> bool {
        self.plugins
            .iter()
            .any(|p| p.should_not_relocate_methods_of_class(self.arena, cls))
    }

    /// Class refs plus whatever the plugins tax on top.
    fn gather_refs(
        &mut self,
        dex_info: &DexInfo,
        cls: ClassId,
        mut erased_classes: Option<&mut Vec<ClassId>>,
    ) -> GatheredRefs {
        let mut refs = self.arena.gather_refs(cls);
        let should_not_relocate = self.should_not_relocate_methods_of_class(cls);
        let mut local_erased = Vec::new();
        let erased: &mut Vec<ClassId> = match erased_classes.as_mut() {
            Some(erased) => &mut **erased,
            None => &mut local_erased,
        };
        let arena: &DexArena = self.arena;
        for plugin in &mut self.plugins {
            plugin.gather_refs(arena, dex_info, cls, &mut refs, erased, should_not_relocate);
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

    /// Try to place a class into the current DEX; an overflow flushes and
    /// retries unchecked. Returns whether the class was newly emitted.
    fn emit_class(
        &mut self,
        dex_info: &mut DexInfo,
        cls: ClassId,
        check_if_skip: bool,
        perf_sensitive: bool,
        mut erased_classes: Option<&mut Vec<ClassId>>,
    ) -> Result<bool> {
        if self.is_canary(cls) {
            return Ok(false);
        }
        if self.dexes_structure.has_class(cls) {
            debug!(
                "trying to re-add class {}",
                self.arena.type_name(self.arena.class(cls).type_id)
            );
            return Ok(false);
        }
        if check_if_skip && self.should_skip_class_due_to_plugin(cls) {
            return Ok(false);
        }
        if perf_sensitive {
            self.arena.class_mut(cls).perf_sensitive = true;
        }

        let refs = self.gather_refs(dex_info, cls, erased_classes.as_mut().map(|e| &mut **e));
        let fits = self.dexes_structure.add_class_to_current_dex(&refs, cls);
        if !fits {
            self.flush_out_dex(dex_info)?;
            // Plugins may keep per-dex state; gather again so they can
            // rebuild it for the fresh DEX.
            if let Some(erased) = erased_classes.as_mut() {
                erased.clear();
            }
            let refs = self.gather_refs(dex_info, cls, erased_classes);
            self.dexes_structure.add_class_no_checks(&refs, cls);
        }
        Ok(true)
    }

    /// Sealed-mode primary emission: betamap-ordered members first (marked
    /// perf-sensitive), then the rest. The primary must still fit one DEX.
    fn emit_primary_dex(
        &mut self,
        primary_dex: &[ClassId],
        entries: &[InterdexEntry],
        unreferenced_classes: &HashSet<ClassId>,
    ) -> Result<()> {
        let primary_set: HashSet<ClassId> = primary_dex.iter().copied().collect();
        let mut primary_dex_info = DexInfo {
            primary: true,
            ..DexInfo::default()
        };

        let mut in_primary = 0usize;
        let mut skipped_in_primary = 0usize;
        for entry in entries {
            let InterdexEntry::Class(cls) = entry else {
                continue;
            };
            if !primary_set.contains(cls) {
                continue;
            }
            if unreferenced_classes.contains(cls) {
                skipped_in_primary += 1;
                continue;
            }
            self.emit_class(&mut primary_dex_info, *cls, true, true, None)?;
            in_primary += 1;
        }
        for &cls in primary_dex {
            self.emit_class(&mut primary_dex_info, cls, true, false, None)?;
        }
        debug!(
            "[primary dex]: {} out of {} classes from the interdex order, {} skipped",
            in_primary,
            primary_dex.len(),
            skipped_in_primary
        );

        self.flush_out_dex(&mut primary_dex_info)?;
        ensure!(
            self.dexes_structure.num_dexes() == 1,
            "primary dex doesn't fit in only 1 dex anymore, but in {}",
            self.dexes_structure.num_dexes()
        );
        Ok(())
    }

    /// The cold-start emission state machine over the typed entry list.
    fn emit_interdex_classes(
        &mut self,
        dex_info: &mut DexInfo,
        order: &coldstart::InterdexOrder,
        unreferenced_classes: &HashSet<ClassId>,
    ) -> Result<()> {
        if order.entries.is_empty() {
            debug!("no interdex classes passed");
            return Ok(());
        }

        // Coldstart has no interaction with the extended and scroll sets,
        // but that is not true for the latter two.
        dex_info.coldstart = true;

        let mut skipped_in_secondary = 0usize;
        for entry in &order.entries {
            match *entry {
                InterdexEntry::ScrollStart => {
                    ensure!(
                        !self.emitting_scroll_set,
                        "scroll start marker discovered after another scroll start marker"
                    );
                    ensure!(
                        !self.emitting_bg_set,
                        "scroll start marker discovered between background set markers"
                    );
                    self.emitting_scroll_set = true;
                    dex_info.scroll = true;
                }
                InterdexEntry::ScrollEnd => {
                    ensure!(
                        self.emitting_scroll_set,
                        "scroll end marker discovered without scroll start marker"
                    );
                    self.emitting_scroll_set = false;
                }
                InterdexEntry::BgStart => {
                    ensure!(
                        !self.emitting_bg_set,
                        "background start marker discovered after another background start marker"
                    );
                    ensure!(
                        !self.emitting_scroll_set,
                        "background start marker discovered between scroll set markers"
                    );
                    self.emitting_bg_set = true;
                    dex_info.background = true;
                }
                InterdexEntry::BgEnd => {
                    ensure!(
                        self.emitting_bg_set,
                        "background end marker discovered without background start marker"
                    );
                    self.emitting_bg_set = false;
                    self.emitted_bg_set = true;
                }
                InterdexEntry::EndMarker(index) => {
                    ensure!(
                        !self.emitting_scroll_set,
                        "end marker discovered between scroll start/end markers"
                    );
                    ensure!(
                        !self.emitting_bg_set,
                        "end marker discovered between background start/end markers"
                    );
                    debug!("terminating dex due to end marker {}", index);
                    self.flush_out_dex(dex_info)?;
                    if index + 1 == order.num_end_markers {
                        dex_info.coldstart = false;
                    }
                }
                InterdexEntry::Class(cls) => {
                    if unreferenced_classes.contains(&cls) {
                        skipped_in_secondary += 1;
                        continue;
                    }
                    if self.emitted_bg_set {
                        self.emitted_bg_set = false;
                        dex_info.extended = true;
                        self.emitting_extended = true;
                    }
                    dex_info.betamap_ordered = true;
                    self.emit_class(dex_info, cls, true, true, None)?;
                }
            }
        }

        // Now emit the classes omitted from the original coldstart set.
        for entry in &order.entries {
            if let InterdexEntry::Class(cls) = *entry {
                if unreferenced_classes.contains(&cls) {
                    self.emit_class(dex_info, cls, true, false, None)?;
                }
            }
        }
        debug!(
            "[interdex order]: {} classes are unreferenced from the interdex order",
            skipped_in_secondary
        );

        ensure!(!self.emitting_scroll_set, "unterminated scroll set marker");
        ensure!(!self.emitting_bg_set, "unterminated background set marker");
        self.emitting_extended = false;
        Ok(())
    }

    fn init_cross_dex_ref_minimizer_and_relocate_methods(&mut self) -> Result<()> {
        let cfg = self.minimizer.config();
        debug!(
            "[dex ordering] cross-dex-ref-minimizer active with ref weights \
             m={} f={} t={} s={}, seed weights m={} f={} t={} s={}",
            cfg.method_ref_weight,
            cfg.field_ref_weight,
            cfg.type_ref_weight,
            cfg.string_ref_weight,
            cfg.method_seed_weight,
            cfg.field_seed_weight,
            cfg.type_seed_weight,
            cfg.string_seed_weight
        );

        let mut relocator = self.relocator.take();
        let mut classes_to_insert = Vec::new();
        let scope = self.scope.clone();
        for cls in scope {
            if self.is_canary(cls) || self.dexes_structure.has_class(cls) {
                continue;
            }

            if let Some(reloc) = relocator.as_mut() {
                if !self.should_not_relocate_methods_of_class(cls) {
                    for relocated_cls in reloc.relocate_methods(self.arena, cls) {
                        for plugin in &mut self.plugins {
                            plugin.add_to_scope(relocated_cls);
                        }
                        ensure!(
                            !self.should_skip_class_due_to_plugin(relocated_cls),
                            "plugin rejected a relocated helper class"
                        );
                        self.minimizer.ignore(relocated_cls);
                        classes_to_insert.push(relocated_cls);
                    }
                }
            }

            if self.should_skip_class_due_to_plugin(cls) {
                // Members of a skipped class may surface later through the
                // additional-class mechanism, so its refs still count.
                let refs = self.arena.gather_refs(cls);
                self.minimizer.sample(&refs);
                continue;
            }
            classes_to_insert.push(cls);
        }
        self.relocator = relocator;

        // Initialize ref frequency counts, then track the classes.
        for &cls in &classes_to_insert {
            let refs = self.arena.gather_refs(cls);
            self.minimizer.sample(&refs);
        }
        for &cls in &classes_to_insert {
            let refs = self.arena.gather_refs(cls);
            self.minimizer.insert(cls, &refs);
        }

        // Classes already in the DEX being filled have their refs applied.
        let current: Vec<ClassId> = self.dexes_structure.current_dex_classes().to_vec();
        for cls in current {
            let refs = self.arena.gather_refs(cls);
            self.minimizer.sample(&refs);
            self.minimizer.insert(cls, &refs);
            self.minimizer.erase(cls, true, false);
        }
        Ok(())
    }

    /// Phase 5: everything the cold-start order did not place.
    fn emit_remaining_classes(&mut self, dex_info: &mut DexInfo) -> Result<()> {
        if !self.config.minimize_cross_dex_refs {
            let scope = self.scope.clone();
            for cls in scope {
                self.emit_class(dex_info, cls, true, false, None)?;
            }
            return Ok(());
        }

        self.init_cross_dex_ref_minimizer_and_relocate_methods()?;

        // At the start of a fresh DEX pick the "worst" class, the one with
        // the most unapplied refs; during a DEX pick the priority winner.
        let mut dexnum = self.dexes_structure.num_dexes();
        let mut pick_worst = true;
        while !self.minimizer.is_empty() {
            let mut cls = None;
            if pick_worst {
                if let Some(worst) = self.minimizer.worst() {
                    if self.minimizer.get_unapplied_refs(worst) > self.minimizer.get_applied_refs()
                    {
                        cls = Some(worst);
                    }
                }
            }
            let cls = match cls {
                Some(cls) => cls,
                None => self
                    .minimizer
                    .front()
                    .context("cross-dex-ref minimizer is out of classes")?,
            };

            let mut erased_classes = Vec::new();
            let emitted = self.emit_class(dex_info, cls, false, false, Some(&mut erased_classes))?;
            let new_dexnum = self.dexes_structure.num_dexes();
            let overflowed = dexnum != new_dexnum;
            self.minimizer.erase(cls, emitted, overflowed);

            if let Some(mut reloc) = self.relocator.take() {
                // Helpers left in the overflowed DEX merge back into their
                // origin classes; their empty shells leave the flushed list.
                if overflowed {
                    let merged = reloc.current_dex_overflowed(self.arena);
                    if let Some(flushed) = self.outdex.last_mut() {
                        flushed.retain(|c| !merged.contains(c));
                    }
                }
                reloc.add_to_current_dex(cls);
                self.relocator = Some(reloc);
            }

            // Refs owned by plugin-erased classes count as emitted.
            for erased_cls in erased_classes {
                debug!(
                    "[dex ordering] applying erased class {}",
                    self.arena.type_name(self.arena.class(erased_cls).type_id)
                );
                let refs = self.arena.gather_refs(erased_cls);
                self.minimizer.insert(erased_cls, &refs);
                self.minimizer.erase(erased_cls, true, false);
            }

            pick_worst = (pick_worst && !emitted) || overflowed;
            dexnum = new_dexnum;
        }
        Ok(())
    }

    /// Force-single-dex mode: everything lands in one DEX without checks;
    /// overflow is deferred to the downstream writer.
    fn run_in_force_single_dex_mode(mut self) -> Result<InterDexResult> {
        let mut dex_info = DexInfo {
            primary: true,
            ..DexInfo::default()
        };

        let mut scope = self.scope.clone();
        if self.coldstart_class_names.is_empty() {
            debug!("force single dex mode: no coldstart classes");
        } else {
            dex_info.coldstart = true;
            self.order_classes_by_coldstart(&mut scope);
        }

        for cls in scope {
            let refs = self.gather_refs(&dex_info, cls, None);
            self.dexes_structure.add_class_no_checks(&refs, cls);
        }
        if !self.dexes_structure.current_dex_classes().is_empty() {
            self.flush_out_dex(&mut dex_info)?;
        }
        debug!(
            "force_single_dex dex number: {}",
            self.dexes_structure.num_dexes()
        );
        self.print_stats();
        Ok(InterDexResult {
            dexes: self.outdex,
            dex_infos: self.dex_infos,
        })
    }

    /// Stable-sort the scope by cold-start priority and mark the listed
    /// classes perf-sensitive.
    fn order_classes_by_coldstart(&mut self, scope: &mut [ClassId]) {
        let mut priority_of = std::collections::HashMap::new();
        let mut priority = 0u32;
        for name in &self.coldstart_class_names {
            let Some(cls) = self
                .arena
                .get_type(name)
                .and_then(|ty| self.arena.type_class(ty))
            else {
                continue;
            };
            priority_of.entry(cls).or_insert_with(|| {
                let p = priority;
                priority += 1;
                p
            });
            self.arena.class_mut(cls).perf_sensitive = true;
        }
        debug!("ordered {} classes at the beginning", priority);
        scope.sort_by_key(|cls| priority_of.get(cls).copied().unwrap_or(u32::MAX));
    }

    /// Pack the full root store.
    pub fn run(mut self) -> Result<InterDexResult> {
        info!("running interdex on root store");
        if self.config.force_single_dex {
            return self.run_in_force_single_dex_mode();
        }

        let mut order =
            load_interdex_entries(self.arena, &self.scope, &self.coldstart_class_names)?;
        let unreferenced_classes = find_unreferenced_coldstart_classes(
            self.arena,
            &self.scope,
            &order.entries,
            self.config.static_prune_classes,
        );

        let primary_dex = self.dexen.first().cloned().unwrap_or_default();
        if !self.config.normal_primary_dex {
            self.emit_primary_dex(&primary_dex, &order.entries, &unreferenced_classes)?;
        } else if self.config.keep_primary_order && !order.entries.is_empty() {
            // The primary is treated like a normal dex; keep its classes at
            // the head of the order so they stay together.
            order.entries.splice(
                0..0,
                primary_dex.iter().map(|&cls| InterdexEntry::Class(cls)),
            );
        }

        let mut dex_info = DexInfo::default();
        self.emit_interdex_classes(&mut dex_info, &order, &unreferenced_classes)?;
        self.emit_remaining_classes(&mut dex_info)?;

        // Whatever leftovers there are from plugins.
        let leftovers: Vec<(String, Vec<ClassId>)> = self
            .plugins
            .iter_mut()
            .map(|p| (p.name().to_string(), p.leftover_classes()))
            .collect();
        for (name, classes) in leftovers {
            for cls in classes {
                debug!("emitting {}-plugin generated leftover class", name);
                self.emit_class(&mut dex_info, cls, false, false, None)?;
            }
        }

        if !self.dexes_structure.current_dex_classes().is_empty() {
            self.flush_out_dex(&mut dex_info)?;
        }

        // Any helper still carrying relocated methods merges back now; the
        // emptied shells disappear from the emitted DEX lists.
        if let Some(mut reloc) = self.relocator.take() {
            let merged = reloc.cleanup(self.arena);
            if !merged.is_empty() {
                for dex in &mut self.outdex {
                    dex.retain(|c| !merged.contains(c));
                }
            }
            self.relocator = Some(reloc);
        }

        self.write_manifest()?;
        self.print_stats();
        Ok(InterDexResult {
            dexes: self.outdex,
            dex_infos: self.dex_infos,
        })
    }

    /// Pack a non-root store: plain emission in scope order, final flush.
    pub fn run_on_nonroot_store(mut self) -> Result<InterDexResult> {
        info!("running interdex on non-root store");
        let mut dex_info = DexInfo::default();
        let scope = self.scope.clone();
        for cls in scope {
            self.emit_class(&mut dex_info, cls, false, false, None)?;
        }
        if !self.dexes_structure.current_dex_classes().is_empty() {
            self.flush_out_dex(&mut dex_info)?;
        }
        self.print_stats();
        Ok(InterDexResult {
            dexes: self.outdex,
            dex_infos: self.dex_infos,
        })
    }

    fn write_manifest(&self) -> Result<()> {
        let Some(dir) = &self.config.secondary_dex_asset_dir else {
            return Ok(());
        };
        let mut out = String::new();
        for (ordinal, (canary_name, flags)) in self.dex_infos.iter().enumerate() {
            out.push_str(&format!(
                "{},ordinal={},coldstart={},extended={},primary={},scroll={},background={}\n",
                canary_name,
                ordinal,
                flags.coldstart as u8,
                flags.extended as u8,
                flags.primary as u8,
                flags.scroll as u8,
                flags.background as u8,
            ));
        }
        let path = dir.join("dex_manifest.txt");
        fs::write(&path, out).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    fn print_stats(&self) {
        debug!(
            "interdex stats: {} dexes, {} secondary, {} coldstart, {} extended, {} scroll",
            self.dexes_structure.num_dexes(),
            self.dexes_structure.num_secondary_dexes(),
            self.dexes_structure.num_coldstart_dexes(),
            self.dexes_structure.num_extended_dexes(),
            self.dexes_structure.num_scroll_dexes()
        );
        debug!(
            "global stats: {} classes, {} mrefs, {} frefs",
            self.dexes_structure.num_classes(),
            self.dexes_structure.num_mrefs(),
            self.dexes_structure.num_frefs()
        );
    }

    /// Close the current DEX: fabricate the canary, squash colocated
    /// relocation helpers, collect plugin classes, optionally sort for
    /// compressed size, and reset the per-DEX flags.
    fn flush_out_dex(&mut self, dex_info: &mut DexInfo) -> Result<()> {
        let dexnum = self.dexes_structure.num_dexes();
        if dex_info.primary {
            debug!(
                "writing out primary dex with {} classes",
                self.dexes_structure.current_dex_classes().len()
            );
        } else {
            debug!(
                "writing out secondary dex number {} with {} classes (coldstart={} extended={} \
                 background={} scroll={})",
                self.dexes_structure.num_secondary_dexes() + 1,
                self.dexes_structure.current_dex_classes().len(),
                dex_info.coldstart,
                dex_info.extended,
                dex_info.background,
                dex_info.scroll
            );
        }

        if self.config.emit_canaries && !dex_info.primary {
            ensure!(
                dexnum < MAX_DEX_NUM,
                "bailing, max dex number surpassed: {}",
                dexnum
            );
            let canary_name = format!("{}{:02}/Canary;", CANARY_PREFIX, dexnum);
            let canary_ty = self.arena.make_type(&canary_name);
            let canary_cls = match self.arena.type_class(canary_ty) {
                Some(cls) => cls,
                None => {
                    warn!("no canary class {} found, fabricating it", canary_name);
                    let object = self.arena.make_type("Ljava/lang/Object;");
                    let mut cls = DexClass::new(canary_ty);
                    cls.access =
                        AccessFlags::PUBLIC | AccessFlags::INTERFACE | AccessFlags::ABSTRACT;
                    cls.super_class = Some(object);
                    // The app loader looks canaries up by name.
                    cls.keep_name = true;
                    cls.can_rename = false;
                    self.arena.add_class(cls)
                }
            };
            let refs = self.arena.gather_refs(canary_cls);
            self.dexes_structure.add_class_no_checks(&refs, canary_cls);
            self.dex_infos.push((canary_name, *dex_info));
        }

        // Relocation helpers sharing a DEX with their origin class merge
        // back and disappear from the emitted list.
        if let Some(mut reloc) = self.relocator.take() {
            let current: Vec<ClassId> = self.dexes_structure.current_dex_classes().to_vec();
            let current_set: HashSet<ClassId> = current.iter().copied().collect();
            for cls in current {
                if let Some(origin) = reloc.origin_of(cls) {
                    if current_set.contains(&origin) && !reloc.is_squashed(cls) {
                        reloc.merge_back(self.arena, cls);
                        self.dexes_structure.squash_class(cls);
                    }
                }
            }
            self.relocator = Some(reloc);
        }

        let mut additional_classes = HashSet::new();
        {
            let mut current: Vec<ClassId> = self.dexes_structure.current_dex_classes().to_vec();
            current.extend_from_slice(self.dexes_structure.current_dex_squashed_classes());
            let arena: &DexArena = self.arena;
            let mut contributed = Vec::new();
            for plugin in &mut self.plugins {
                for cls in plugin.additional_classes(arena, &current) {
                    debug!("emitting {}-plugin-generated class", plugin.name());
                    contributed.push(cls);
                }
            }
            for cls in contributed {
                let refs = self.arena.gather_refs(cls);
                self.dexes_structure.add_class_no_checks(&refs, cls);
                if dex_info.primary || dex_info.betamap_ordered {
                    self.arena.class_mut(cls).perf_sensitive = true;
                }
                additional_classes.insert(cls);
            }
        }

        let mut classes = self.dexes_structure.end_dex(dex_info);
        if self.config.sort_remaining_classes {
            let is_ordered = |cls: ClassId| {
                self.arena.class(cls).perf_sensitive && !additional_classes.contains(&cls)
            };
            let mut begin = 0;
            while begin < classes.len() && is_ordered(classes[begin]) {
                begin += 1;
            }
            debug!(
                "skipping {} and sorting {} classes",
                begin,
                classes.len() - begin
            );
            let arena: &DexArena = self.arena;
            classes[begin..].sort_by(|&c1, &c2| compare_for_compressed_size(arena, c1, c2));
        }
        self.outdex.push(classes);

        if !self.emitting_scroll_set {
            dex_info.scroll = false;
        }
        if !self.emitting_bg_set {
            dex_info.background = false;
        }
        if !self.emitting_extended {
            dex_info.extended = false;
        }
        // Reset as this method advances to the next writable DEX.
        dex_info.betamap_ordered = false;
        Ok(())
    }
}

/// Ordering that tends to compress well: canaries first, interfaces after
/// non-interfaces, subtypes before supertypes, then by super-class and
/// interface-list names.
fn compare_for_compressed_size(
    arena: &DexArena,
    c1: ClassId,
    c2: ClassId,
) -> std::cmp::Ordering {
    use std::cmp::Ordering;

    let name = |cls: ClassId| arena.type_name(arena.class(cls).type_id);
    let canary1 = name(c1).starts_with(CANARY_PREFIX);
    let canary2 = name(c2).starts_with(CANARY_PREFIX);
    if canary1 != canary2 {
        return if canary1 { Ordering::Less } else { Ordering::Greater };
    }
    let iface1 = arena.class(c1).is_interface();
    let iface2 = arena.class(c2).is_interface();
    if iface1 != iface2 {
        return if iface1 { Ordering::Greater } else { Ordering::Less };
    }
    let ty1 = arena.class(c1).type_id;
    let ty2 = arena.class(c2).type_id;
    if ty1 != ty2 {
        if arena.check_cast(ty2, ty1) {
            return Ordering::Greater;
        }
        if arena.check_cast(ty1, ty2) {
            return Ordering::Less;
        }
    }
    let super1 = arena.class(c1).super_class.map(|t| arena.type_name(t));
    let super2 = arena.class(c2).super_class.map(|t| arena.type_name(t));
    if super1 != super2 {
        return super1.cmp(&super2);
    }
    let ifaces1: Vec<&str> = arena.class(c1).interfaces.iter().map(|&t| arena.type_name(t)).collect();
    let ifaces2: Vec<&str> = arena.class(c2).interfaces.iter().map(|&t| arena.type_name(t)).collect();
    ifaces1.cmp(&ifaces2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{DexClass, GatheredRefs};

    fn class_with_strings(arena: &mut DexArena, name: &str, strings: &[&str]) -> ClassId {
        use crate::cfg::{Block, ControlFlowGraph, Instruction, IrCode};
        use crate::ir::{AccessFlags, DexMethod};
        let ty = arena.make_type(name);
        let mut cls = DexClass::new(ty);
        if !strings.is_empty() {
            let refr = arena.method_ref(name, "run", "()V");
            let mut insns: Vec<Instruction> = strings
                .iter()
                .map(|s| Instruction::ConstString {
                    dest: 0,
                    string: arena.intern_string(s),
                })
                .collect();
            insns.push(Instruction::Return { src: None });
            let mut cfg = ControlFlowGraph::new();
            let block = cfg.add_block(Block {
                instructions: insns,
                ..Block::default()
            });
            cfg.set_entry(block);
            cls.vmethods.push(DexMethod {
                refr,
                access: AccessFlags::PUBLIC,
                deob_name: None,
                code: Some(IrCode::new(cfg)),
            });
        }
        arena.add_class(cls)
    }

    fn plain(arena: &mut DexArena, name: &str) -> ClassId {
        class_with_strings(arena, name, &[])
    }

    fn config_no_canaries() -> InterDexConfig {
        InterDexConfig {
            emit_canaries: false,
            ..InterDexConfig::default()
        }
    }

    fn union_refs(arena: &DexArena, classes: &[ClassId]) -> GatheredRefs {
        let mut all = GatheredRefs::default();
        for &cls in classes {
            let refs = arena.gather_refs(cls);
            all.methods.extend(refs.methods);
            all.fields.extend(refs.fields);
            all.types.extend(refs.types);
            all.strings.extend(refs.strings);
        }
        all.methods.sort_unstable();
        all.methods.dedup();
        all.fields.sort_unstable();
        all.fields.dedup();
        all.types.sort_unstable();
        all.types.dedup();
        all.strings.sort_unstable();
        all.strings.dedup();
        all
    }

    #[test]
    fn sealed_primary_keeps_interdex_order_first() {
        let mut arena = DexArena::new();
        let p1 = plain(&mut arena, "Lcom/P1;");
        let p2 = plain(&mut arena, "Lcom/P2;");
        let interdex = InterDex::new(
            &mut arena,
            vec![vec![p1, p2]],
            vec!["Lcom/P2;".to_string()],
            Vec::new(),
            config_no_canaries(),
        );

        let result = interdex.run().expect("run");
        // One dex, with the betamap-listed class first.
        assert_eq!(result.dexes.len(), 1);
        assert_eq!(result.dexes[0], vec![p2, p1]);
    }

    #[test]
    fn coldstart_end_marker_splits_dexes_and_clears_flag() {
        let mut arena = DexArena::new();
        let p = plain(&mut arena, "Lcom/P;");
        let a = plain(&mut arena, "Lcom/A;");
        let b = plain(&mut arena, "Lcom/B;");
        let c = plain(&mut arena, "Lcom/C;");
        let names = vec![
            "Lcom/A;".to_string(),
            "Lcom/B;".to_string(),
            "LDexEndMarker0;".to_string(),
            "Lcom/C;".to_string(),
        ];
        let interdex = InterDex::new(
            &mut arena,
            vec![vec![p], vec![a, b, c]],
            names,
            Vec::new(),
            InterDexConfig::default(),
        );

        let result = interdex.run().expect("run");
        // Primary, then the coldstart dex with A and B, then the rest.
        assert_eq!(result.dexes.len(), 3);
        assert_eq!(result.dexes[0], vec![p]);
        assert_eq!(&result.dexes[1][..2], &[a, b]);
        assert_eq!(&result.dexes[2][..1], &[c]);
        // First secondary carries the coldstart flag; the one after the last
        // end marker does not.
        assert_eq!(result.dex_infos.len(), 2);
        assert_eq!(result.dex_infos[0].0, "Lsecondary/dex01/Canary;");
        assert!(result.dex_infos[0].1.coldstart);
        assert_eq!(result.dex_infos[1].0, "Lsecondary/dex02/Canary;");
        assert!(!result.dex_infos[1].1.coldstart);
    }

    #[test]
    fn every_class_lands_in_exactly_one_dex() {
        let mut arena = DexArena::new();
        let mut all = Vec::new();
        for i in 0..100 {
            all.push(plain(&mut arena, &format!("Lcom/gen/C{};", i)));
        }
        let primary = vec![all[0]];
        let secondary: Vec<ClassId> = all[1..].to_vec();
        let interdex = InterDex::new(
            &mut arena,
            vec![primary, secondary],
            Vec::new(),
            Vec::new(),
            config_no_canaries(),
        );

        let result = interdex.run().expect("run");
        let mut seen = HashSet::new();
        for dex in &result.dexes {
            for &cls in dex {
                assert!(seen.insert(cls), "class emitted twice");
            }
        }
        assert_eq!(seen.len(), 100);
    }

    #[test]
    fn minimizer_orders_shared_refs_together_and_respects_caps() {
        let mut arena = DexArena::new();
        let a = class_with_strings(&mut arena, "Lcom/A;", &["r1", "r2"]);
        let b = class_with_strings(&mut arena, "Lcom/B;", &["r1", "r3"]);
        let c = class_with_strings(&mut arena, "Lcom/C;", &["r4"]);
        let config = InterDexConfig {
            normal_primary_dex: true,
            emit_canaries: false,
            limits: DexLimits {
                max_string_refs: 3,
                ..DexLimits::default()
            },
            ..InterDexConfig::default()
        };
        let interdex = InterDex::new(
            &mut arena,
            vec![vec![a, b, c]],
            Vec::new(),
            Vec::new(),
            config.clone(),
        );

        let result = interdex.run().expect("run");
        assert_eq!(result.dexes.len(), 2);
        // A seeds the first dex, B shares r1 with it, C overflows.
        assert_eq!(result.dexes[0], vec![a, b]);
        assert_eq!(result.dexes[1], vec![c]);
        // Re-walk each dex and verify the caps hold.
        for dex in &result.dexes {
            let refs = union_refs(&arena, dex);
            assert!(refs.strings.len() <= config.limits.max_string_refs);
            assert!(refs.types.len() <= config.limits.max_type_refs);
        }
    }

    #[test]
    fn force_single_dex_flushes_once() {
        let mut arena = DexArena::new();
        let mut all = Vec::new();
        for i in 0..500 {
            all.push(plain(&mut arena, &format!("Lcom/big/C{};", i)));
        }
        let config = InterDexConfig {
            force_single_dex: true,
            ..InterDexConfig::default()
        };
        let interdex = InterDex::new(&mut arena, vec![all.clone()], Vec::new(), Vec::new(), config);

        let result = interdex.run().expect("run");
        assert_eq!(result.dexes.len(), 1);
        assert_eq!(result.dexes[0].len(), 500);
    }

    #[test]
    fn unterminated_scroll_marker_is_fatal() {
        let mut arena = DexArena::new();
        let p = plain(&mut arena, "Lcom/P;");
        let a = plain(&mut arena, "Lcom/A;");
        let names = vec!["LScrollSetStart;".to_string(), "Lcom/A;".to_string()];
        let interdex = InterDex::new(
            &mut arena,
            vec![vec![p], vec![a]],
            names,
            Vec::new(),
            config_no_canaries(),
        );
        assert!(interdex.run().is_err());
    }

    #[test]
    fn bg_marker_inside_scroll_set_is_fatal() {
        let mut arena = DexArena::new();
        let p = plain(&mut arena, "Lcom/P;");
        let names = vec![
            "LScrollSetStart;".to_string(),
            "LBackgroundSetStart;".to_string(),
        ];
        let interdex = InterDex::new(
            &mut arena,
            vec![vec![p]],
            names,
            Vec::new(),
            config_no_canaries(),
        );
        assert!(interdex.run().is_err());
    }

    #[test]
    fn background_then_class_marks_extended_set() {
        let mut arena = DexArena::new();
        let p = plain(&mut arena, "Lcom/P;");
        let a = plain(&mut arena, "Lcom/A;");
        let b = plain(&mut arena, "Lcom/B;");
        let names = vec![
            "LBackgroundSetStart;".to_string(),
            "Lcom/A;".to_string(),
            "LBackgroundSetEnd;".to_string(),
            "Lcom/B;".to_string(),
            "LDexEndMarker0;".to_string(),
        ];
        let interdex = InterDex::new(
            &mut arena,
            vec![vec![p], vec![a, b]],
            names,
            Vec::new(),
            InterDexConfig::default(),
        );

        let result = interdex.run().expect("run");
        // The dex closed by the end marker saw a class entry after the
        // background set finished, so it is part of the extended set.
        let flags = result.dex_infos[0].1;
        assert!(flags.background);
        assert!(flags.extended);
        assert!(flags.coldstart);
    }

    #[test]
    fn nonroot_store_emits_everything_in_order() {
        let mut arena = DexArena::new();
        let a = plain(&mut arena, "Lcom/A;");
        let b = plain(&mut arena, "Lcom/B;");
        let interdex = InterDex::new(
            &mut arena,
            vec![vec![a, b]],
            Vec::new(),
            Vec::new(),
            config_no_canaries(),
        );

        let result = interdex.run_on_nonroot_store().expect("run");
        assert_eq!(result.dexes, vec![vec![a, b]]);
    }

    #[test]
    fn manifest_lists_each_secondary_dex() {
        let mut arena = DexArena::new();
        let p = plain(&mut arena, "Lcom/P;");
        let a = plain(&mut arena, "Lcom/A;");
        let dir = tempfile::tempdir().expect("temp dir");
        let names = vec!["Lcom/A;".to_string(), "LDexEndMarker0;".to_string()];
        let config = InterDexConfig {
            secondary_dex_asset_dir: Some(dir.path().to_path_buf()),
            ..InterDexConfig::default()
        };
        let interdex = InterDex::new(&mut arena, vec![vec![p], vec![a]], names, Vec::new(), config);

        interdex.run().expect("run");
        let manifest =
            std::fs::read_to_string(dir.path().join("dex_manifest.txt")).expect("manifest");
        let lines: Vec<&str> = manifest.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("Lsecondary/dex01/Canary;,ordinal=0,coldstart=1"));
    }

    struct SkipAndLeftoverPlugin {
        skipped: ClassId,
    }

    impl InterDexPlugin for SkipAndLeftoverPlugin {
        fn name(&self) -> &str {
            "skip-and-leftover"
        }

        fn should_skip_class(&mut self, _arena: &DexArena, cls: ClassId) -> bool {
            cls == self.skipped
        }

        fn leftover_classes(&mut self) -> Vec<ClassId> {
            vec![self.skipped]
        }
    }

    #[test]
    fn plugin_skipped_class_returns_as_leftover() {
        let mut arena = DexArena::new();
        let p = plain(&mut arena, "Lcom/P;");
        let a = plain(&mut arena, "Lcom/A;");
        let skipped = plain(&mut arena, "Lcom/Skipped;");
        let config = InterDexConfig {
            emit_canaries: false,
            minimize_cross_dex_refs: false,
            ..InterDexConfig::default()
        };
        let interdex = InterDex::new(
            &mut arena,
            vec![vec![p], vec![a, skipped]],
            Vec::new(),
            vec![Box::new(SkipAndLeftoverPlugin { skipped })],
            config,
        );

        let result = interdex.run().expect("run");
        let all: Vec<ClassId> = result.dexes.iter().flatten().copied().collect();
        assert!(all.contains(&skipped));
        assert_eq!(all.iter().filter(|&&c| c == skipped).count(), 1);
        // The leftover lands after the ordinary classes.
        assert_eq!(all.last(), Some(&skipped));
    }

    fn class_with_static_helpers(arena: &mut DexArena, name: &str, count: usize) -> ClassId {
        use crate::cfg::{Block, ControlFlowGraph, Instruction, IrCode};
        use crate::ir::{AccessFlags, DexMethod};
        let ty = arena.make_type(name);
        let mut cls = DexClass::new(ty);
        for i in 0..count {
            let refr = arena.method_ref(name, &format!("util{}", i), "()V");
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
    fn relocated_helpers_merge_back_and_leave_no_shells() {
        let mut arena = DexArena::new();
        let p = plain(&mut arena, "Lcom/P;");
        let busy = class_with_static_helpers(&mut arena, "Lcom/Busy;", 2);
        let other = plain(&mut arena, "Lcom/Other;");
        let config = InterDexConfig {
            emit_canaries: false,
            relocator: CrossDexRelocatorConfig {
                relocate_static_methods: true,
                ..CrossDexRelocatorConfig::default()
            },
            ..InterDexConfig::default()
        };
        let interdex = InterDex::new(
            &mut arena,
            vec![vec![p], vec![busy, other]],
            Vec::new(),
            Vec::new(),
            config,
        );

        let result = interdex.run().expect("run");
        for dex in &result.dexes {
            for &cls in dex {
                let name = arena.type_name(arena.class(cls).type_id);
                assert!(
                    !name.contains("$relocated"),
                    "helper shell left in output: {}",
                    name
                );
            }
        }
        // The static methods are back on their origin class.
        let busy_cls = arena.class(busy);
        assert_eq!(busy_cls.dmethods.len(), 2);
        assert!(busy_cls
            .dmethods
            .iter()
            .all(|m| m.refr.owner == busy_cls.type_id));
    }

    #[test]
    fn overflowing_dex_merges_its_helpers_back() {
        let mut arena = DexArena::new();
        let p = plain(&mut arena, "Lcom/P;");
        let busy = class_with_static_helpers(&mut arena, "Lcom/Busy;", 2);
        let mut heavy = Vec::new();
        for i in 0..3 {
            heavy.push(class_with_strings(
                &mut arena,
                &format!("Lcom/Heavy{};", i),
                &[&format!("s{}a", i), &format!("s{}b", i)],
            ));
        }
        let mut secondary = vec![busy];
        secondary.extend(&heavy);
        let config = InterDexConfig {
            emit_canaries: false,
            limits: DexLimits {
                max_string_refs: 4,
                ..DexLimits::default()
            },
            relocator: CrossDexRelocatorConfig {
                relocate_static_methods: true,
                ..CrossDexRelocatorConfig::default()
            },
            ..InterDexConfig::default()
        };
        let interdex = InterDex::new(
            &mut arena,
            vec![vec![p], secondary],
            Vec::new(),
            Vec::new(),
            config,
        );

        let result = interdex.run().expect("run");
        // The string caps force at least one overflow; however the packing
        // falls out, no helper shell survives and the methods are home.
        assert!(result.dexes.len() > 2);
        for dex in &result.dexes {
            for &cls in dex {
                let name = arena.type_name(arena.class(cls).type_id);
                assert!(!name.contains("$relocated"));
            }
        }
        assert_eq!(arena.class(busy).dmethods.len(), 2);
    }

    struct ErasingPlugin {
        host: ClassId,
        erased: ClassId,
    }

    impl InterDexPlugin for ErasingPlugin {
        fn name(&self) -> &str {
            "erasing"
        }

        fn should_skip_class(&mut self, _arena: &DexArena, cls: ClassId) -> bool {
            cls == self.erased
        }

        fn gather_refs(
            &mut self,
            arena: &DexArena,
            _dex_info: &DexInfo,
            cls: ClassId,
            refs: &mut GatheredRefs,
            erased_classes: &mut Vec<ClassId>,
            _should_not_relocate_methods: bool,
        ) {
            if cls == self.host {
                let covered = arena.gather_refs(self.erased);
                refs.types.extend(covered.types);
                erased_classes.push(self.erased);
            }
        }
    }

    #[test]
    fn plugin_erased_class_is_absorbed_by_its_host() {
        let mut arena = DexArena::new();
        let p = plain(&mut arena, "Lcom/P;");
        let host = plain(&mut arena, "Lcom/Host;");
        let erased = plain(&mut arena, "Lcom/Erased;");
        let interdex = InterDex::new(
            &mut arena,
            vec![vec![p], vec![host, erased]],
            Vec::new(),
            vec![Box::new(ErasingPlugin { host, erased })],
            config_no_canaries(),
        );

        let result = interdex.run().expect("run");
        let all: Vec<ClassId> = result.dexes.iter().flatten().copied().collect();
        assert!(all.contains(&host));
        // The erased class's refs ride along with the host; the class itself
        // never shows up on its own.
        assert!(!all.contains(&erased));
    }

    #[test]
    fn compressed_size_sort_puts_canaries_first_and_interfaces_last() {
        let mut arena = DexArena::new();
        let object = arena.make_type("Ljava/lang/Object;");
        let p = plain(&mut arena, "Lcom/P;");
        let regular = plain(&mut arena, "Lcom/Regular;");
        arena.class_mut(regular).super_class = Some(object);
        let iface_ty = arena.make_type("Lcom/Iface;");
        let mut iface_cls = DexClass::new(iface_ty);
        iface_cls.access = AccessFlags::PUBLIC | AccessFlags::INTERFACE | AccessFlags::ABSTRACT;
        let iface = arena.add_class(iface_cls);
        let config = InterDexConfig {
            sort_remaining_classes: true,
            ..InterDexConfig::default()
        };
        let interdex = InterDex::new(
            &mut arena,
            vec![vec![p], vec![iface, regular]],
            Vec::new(),
            Vec::new(),
            config,
        );

        let result = interdex.run().expect("run");
        let secondary = &result.dexes[1];
        let names: Vec<&str> = secondary
            .iter()
            .map(|&c| arena.type_name(arena.class(c).type_id))
            .collect();
        assert_eq!(
            names,
            vec!["Lsecondary/dex01/Canary;", "Lcom/Regular;", "Lcom/Iface;"]
        );
    }
}
