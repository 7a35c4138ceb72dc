//! Per-method CFG rewriting: block classification, bit-vector prologue,
//! coverage updates, and exit-hook insertion.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::BitOr;

use crate::cfg::{Block, BlockId, ControlFlowGraph, EdgeKind, Instruction, InvokeKind, IrCode, Reg};
use crate::instrument::{InstrumentOptions, MethodInstrumentationRecord, BIT_VECTOR_SIZE};
use crate::ir::MethodRef;

/// Block classification flag set.
#[derive(Clone, Copy, Default, Eq, PartialEq)]
pub struct BlockTypeFlags(pub u16);

impl BlockTypeFlags {
    pub const INSTRUMENTABLE: BlockTypeFlags = BlockTypeFlags(1 << 0);
    pub const EMPTY: BlockTypeFlags = BlockTypeFlags(1 << 1);
    pub const USELESS: BlockTypeFlags = BlockTypeFlags(1 << 2);
    pub const NORMAL: BlockTypeFlags = BlockTypeFlags(1 << 3);
    pub const CATCH: BlockTypeFlags = BlockTypeFlags(1 << 4);
    pub const MOVE_EXCEPTION: BlockTypeFlags = BlockTypeFlags(1 << 5);
    pub const NO_SOURCE_BLOCK: BlockTypeFlags = BlockTypeFlags(1 << 6);

    pub fn contains(self, other: BlockTypeFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for BlockTypeFlags {
    type Output = BlockTypeFlags;
    fn bitor(self, rhs: BlockTypeFlags) -> BlockTypeFlags {
        BlockTypeFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for BlockTypeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockTypeFlags({:#b})", self.0)
    }
}

/// Classification of one candidate block during instrumentation.
#[derive(Clone, Debug)]
pub struct BlockInfo {
    pub block: BlockId,
    pub block_type: BlockTypeFlags,
    pub insertion_point: Option<usize>,
    pub bit_id: Option<usize>,
}

impl BlockInfo {
    fn new(block: BlockId, block_type: BlockTypeFlags, insertion_point: Option<usize>) -> BlockInfo {
        BlockInfo {
            block,
            block_type,
            insertion_point,
            bit_id: None,
        }
    }

    pub fn is_instrumentable(&self) -> bool {
        self.block_type.contains(BlockTypeFlags::INSTRUMENTABLE)
    }
}

fn create_block_info(
    cfg: &ControlFlowGraph,
    id: BlockId,
    options: &InstrumentOptions,
) -> BlockInfo {
    let block = cfg.block(id);
    if block.num_opcodes() == 0 {
        return BlockInfo::new(id, BlockTypeFlags::EMPTY, None);
    }

    // Catch blocks are skipped unless requested, with the hope they are cold;
    // instrumenting huge numbers of them has caused register pressure issues.
    if block.is_catch && !options.instrument_catches {
        return BlockInfo::new(id, BlockTypeFlags::CATCH, None);
    }

    let mut block_type = if block.is_catch {
        BlockTypeFlags::CATCH
    } else {
        BlockTypeFlags::NORMAL
    };
    let insert_pos = if block.starts_with_move_result() {
        block.first_non_move_result_insn()
    } else if block.starts_with_move_exception() {
        // move-exception must be the first instruction of a handler, so the
        // update goes right after it.
        block_type = block_type | BlockTypeFlags::MOVE_EXCEPTION;
        block.first_next_of_move_exception()
    } else {
        block.first_non_param_loading_insn()
    };

    if insert_pos >= block.instructions.len() {
        return BlockInfo::new(id, BlockTypeFlags::USELESS | block_type, None);
    }

    // Without a source block the coverage bit cannot be mapped back, so skip
    // the block unless it is an exit block (those must carry the exit hook).
    if !options.instrument_blocks_without_source_block
        && !block.has_source_blocks()
        && cfg.succs(id).next().is_some()
    {
        return BlockInfo::new(id, BlockTypeFlags::NO_SOURCE_BLOCK | block_type, None);
    }

    BlockInfo::new(
        id,
        BlockTypeFlags::INSTRUMENTABLE | block_type,
        Some(insert_pos),
    )
}

/// Enumerate candidate blocks in source-block DFS order and classify them.
/// Returns `(infos, num_bit_ids, too_many_blocks)`; on overflow all blocks
/// are rejected and the method falls back to method tracing.
pub(crate) fn get_blocks_to_instrument(
    cfg: &ControlFlowGraph,
    max_num_blocks: usize,
    options: &InstrumentOptions,
) -> (Vec<BlockInfo>, usize, bool) {
    let mut blocks = Vec::new();
    cfg.visit_in_order(
        |id| {
            // The entry block is not instrumented, with one exception: when
            // it has outgoing throw edges the prologue insertion will split
            // it, and what remains is no longer the entry.
            if id == cfg.entry_block() && cfg.outgoing_throws(id).next().is_none() {
                return;
            }
            blocks.push(id);
        },
        |_, _| {},
        |_| {},
    );

    let mut infos = Vec::with_capacity(blocks.len());
    let mut bit_id = 0usize;
    for id in blocks {
        let mut info = create_block_info(cfg, id, options);
        if info.is_instrumentable() {
            if bit_id >= max_num_blocks {
                return (Vec::new(), 0, true);
            }
            info.bit_id = Some(bit_id);
            bit_id += 1;
        }
        infos.push(info);
    }
    (infos, bit_id, false)
}

/// Insert the `vec[bit_id/16] |= 1 << (bit_id%16)` update at every
/// instrumentable block's insertion point.
pub(crate) fn insert_block_coverage_computations(
    cfg: &mut ControlFlowGraph,
    infos: &[BlockInfo],
    reg_vectors: &[Reg],
) {
    for info in infos {
        let (Some(bit_id), Some(insert_pos)) = (info.bit_id, info.insertion_point) else {
            continue;
        };
        let vector_id = bit_id / BIT_VECTOR_SIZE;
        let literal = 1i16 << (bit_id % BIT_VECTOR_SIZE) as i16;
        cfg.insert_before(
            info.block,
            insert_pos,
            vec![Instruction::OrIntLit16 {
                dest: reg_vectors[vector_id],
                src: reg_vectors[vector_id],
                literal,
            }],
        );
    }
}

/// Prepend the bit-vector zero-initializers and the `onMethodBegin` call to
/// the entry block, after parameter loading. An entry block with outgoing
/// throw edges is split so the potentially-throwing call does not sit inside
/// a try region.
pub(crate) fn insert_prologue_insts(
    cfg: &mut ControlFlowGraph,
    on_method_begin: MethodRef,
    reg_vectors: &[Reg],
    reg_method_offset: Reg,
    method_offset: usize,
) {
    let mut prologue = Vec::with_capacity(reg_vectors.len() + 2);
    for &reg in reg_vectors {
        prologue.push(Instruction::Const {
            dest: reg,
            literal: 0,
        });
    }
    prologue.push(Instruction::Const {
        dest: reg_method_offset,
        literal: method_offset as i64,
    });
    prologue.push(Instruction::Invoke {
        kind: InvokeKind::Static,
        method: on_method_begin,
        args: vec![reg_method_offset],
    });

    let entry = cfg.entry_block();
    if cfg.outgoing_throws(entry).next().is_some() {
        let param_end = cfg.block(entry).first_non_param_loading_insn();
        let mut insns: Vec<Instruction> = cfg
            .block_mut(entry)
            .instructions
            .drain(..param_end)
            .collect();
        insns.extend(prologue);
        let new_entry = cfg.add_block(Block {
            instructions: insns,
            ..Block::default()
        });
        cfg.add_edge(new_entry, entry, EdgeKind::Goto);
        cfg.set_entry(new_entry);
    } else {
        let at = cfg.block(entry).first_non_param_loading_insn();
        cfg.insert_before(entry, at, prologue);
    }
}

/// Exit blocks that receive the exit hook: real exit blocks without any
/// successors. Monitor-exit chains and the like still have successors and
/// are skipped.
fn only_terminal_return_or_throw_blocks(cfg: &ControlFlowGraph) -> Vec<BlockId> {
    cfg.real_exit_blocks(false)
        .into_iter()
        .filter(|&id| cfg.succs(id).next().is_none())
        .collect()
}

/// Insert `onMethodExit(offset, vec…)` chains right before the terminal
/// instruction of every exit block. Overload arity is bounded; larger vector
/// counts split into multiple calls with a bumped offset in between.
pub(crate) fn insert_on_method_exit_calls(
    cfg: &mut ControlFlowGraph,
    reg_vectors: &[Reg],
    method_offset: usize,
    reg_method_offset: Reg,
    on_method_exit_map: &BTreeMap<usize, MethodRef>,
    max_vector_arity: usize,
) -> usize {
    if reg_vectors.is_empty() {
        return 0;
    }

    let num_vectors = reg_vectors.len();
    let num_invokes = num_vectors.div_ceil(max_vector_arity);
    let create_invoke_insts = || {
        let mut insts = Vec::with_capacity(num_invokes * 2 - 1);
        let mut offset = method_offset;
        let mut remaining = num_vectors;
        for i in 0..num_invokes {
            let arity = remaining.min(max_vector_arity);
            let mut args = Vec::with_capacity(arity + 1);
            args.push(reg_method_offset);
            args.extend_from_slice(&reg_vectors[max_vector_arity * i..][..arity]);
            insts.push(Instruction::Invoke {
                kind: InvokeKind::Static,
                method: on_method_exit_map[&arity],
                args,
            });
            if i != num_invokes - 1 {
                offset += max_vector_arity;
                insts.push(Instruction::Const {
                    dest: reg_method_offset,
                    literal: offset as i64,
                });
            }
            remaining -= arity;
        }
        insts
    };

    let exit_blocks = only_terminal_return_or_throw_blocks(cfg);
    for &block in &exit_blocks {
        let len = cfg.block(block).instructions.len();
        cfg.insert_before(block, len.saturating_sub(1), create_invoke_insts());
    }
    exit_blocks.len()
}

/// Rewrite one method body: classify blocks, allocate vectors, inject the
/// prologue, the per-block coverage updates, and the exit hooks, then build
/// the metadata record.
pub(crate) fn instrument_basic_blocks(
    code: &mut IrCode,
    method: MethodRef,
    on_method_begin: MethodRef,
    on_method_exit_map: &BTreeMap<usize, MethodRef>,
    max_vector_arity: usize,
    method_offset: usize,
    max_num_blocks: usize,
    options: &InstrumentOptions,
) -> MethodInstrumentationRecord {
    let cfg = code.editable_cfg();

    let (infos, num_to_instrument, too_many_blocks) =
        get_blocks_to_instrument(cfg, max_num_blocks, options);

    let num_vectors = num_to_instrument.div_ceil(BIT_VECTOR_SIZE);
    let reg_vectors: Vec<Reg> = (0..num_vectors).map(|_| cfg.allocate_temp()).collect();
    let reg_method_offset = cfg.allocate_temp();

    // Coverage updates go in first: their insertion points were computed on
    // the unmodified blocks. The prologue then lands ahead of any update in
    // the entry block because its position is recomputed afterwards.
    insert_block_coverage_computations(cfg, &infos, &reg_vectors);
    insert_prologue_insts(
        cfg,
        on_method_begin,
        &reg_vectors,
        reg_method_offset,
        method_offset,
    );
    let num_exit_calls = insert_on_method_exit_calls(
        cfg,
        &reg_vectors,
        method_offset,
        reg_method_offset,
        on_method_exit_map,
        max_vector_arity,
    );
    cfg.recompute_registers_size();

    let count = |flags: BlockTypeFlags| {
        infos
            .iter()
            .filter(|i| i.block_type.contains(flags))
            .count()
    };

    let num_non_entry_blocks = cfg.num_blocks() - 1;
    let mut record = MethodInstrumentationRecord {
        method,
        too_many_blocks,
        offset: method_offset,
        num_non_entry_blocks,
        num_vectors,
        num_exit_calls,
        num_empty_blocks: count(BlockTypeFlags::EMPTY),
        num_useless_blocks: count(BlockTypeFlags::USELESS),
        num_no_source_blocks: count(BlockTypeFlags::NO_SOURCE_BLOCK),
        num_blocks_too_large: if too_many_blocks { num_non_entry_blocks } else { 0 },
        num_catches: count(BlockTypeFlags::CATCH),
        num_instrumented_catches: count(BlockTypeFlags::CATCH | BlockTypeFlags::INSTRUMENTABLE),
        num_instrumented_blocks: num_to_instrument,
        bit_id_to_block_id: Vec::with_capacity(num_to_instrument),
        bit_id_to_source_blocks: Vec::with_capacity(num_to_instrument),
        rejected_blocks: BTreeMap::new(),
    };

    for info in &infos {
        if info.is_instrumentable() {
            record.bit_id_to_block_id.push(info.block);
            record
                .bit_id_to_source_blocks
                .push(cfg.block(info.block).source_blocks.clone());
        } else {
            record.rejected_blocks.insert(info.block, info.block_type);
        }
    }

    if !record.too_many_blocks
        && record.num_instrumented_blocks
            != record.num_non_entry_blocks - record.rejected_blocks.len()
    {
        log::warn!(
            "post condition violation in {:?}: {} != {} - {}",
            method,
            record.num_instrumented_blocks,
            record.num_non_entry_blocks,
            record.rejected_blocks.len()
        );
    }

    record
}
