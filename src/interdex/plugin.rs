use crate::interdex::DexInfo;
use crate::ir::{ClassId, DexArena, GatheredRefs};

/// Extension hook for the inter-dex packer. Plugins may veto classes, tax a
/// class with extra refs, contribute classes per DEX, or hand over leftovers
/// at the end of the run.
pub trait InterDexPlugin {
    fn name(&self) -> &str;

    fn should_skip_class(&mut self, _arena: &DexArena, _cls: ClassId) -> bool {
        false
    }

    fn should_not_relocate_methods_of_class(&self, _arena: &DexArena, _cls: ClassId) -> bool {
        false
    }

    /// Extend `refs` with whatever emitting `cls` would additionally pull in.
    /// Classes whose refs become covered by this one are reported through
    /// `erased_classes`.
    fn gather_refs(
        &mut self,
        _arena: &DexArena,
        _dex_info: &DexInfo,
        _cls: ClassId,
        _refs: &mut GatheredRefs,
        _erased_classes: &mut Vec<ClassId>,
        _should_not_relocate_methods: bool,
    ) {
    }

    fn add_to_scope(&mut self, _cls: ClassId) {}

    /// Classes to append to the DEX being flushed.
    fn additional_classes(
        &mut self,
        _arena: &DexArena,
        _current_dex_classes: &[ClassId],
    ) -> Vec<ClassId> {
        Vec::new()
    }

    /// Classes to emit after everything else.
    fn leftover_classes(&mut self) -> Vec<ClassId> {
        Vec::new()
    }
}
