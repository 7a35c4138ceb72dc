//! Basic-block instrumentation pass: rewrites selected method bodies to
//! record per-block execution into 16-bit vectors and to call the analysis
//! class's entry/exit hooks, then emits the CSV metadata sidecars.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::{debug, info};

use crate::cfg::BlockId;
use crate::ir::{ClassId, DexArena, MethodRef, SourceBlock};

pub mod blocks;
pub mod metadata;

pub use blocks::BlockTypeFlags;

pub const BIT_VECTOR_SIZE: usize = 16;
pub const PROFILING_DATA_VERSION: u32 = 3;

/// The stats-array header: two shorts of method-level stats come first for
/// every method, after an eight-short file header.
const METHOD_STATS_HEADER_SHORTS: usize = 8;

const STATS_FIELD_NAME: &str = "sMethodStats";
const NUM_INSTRUMENTED_FIELD_NAME: &str = "sNumStaticallyInstrumented";
const PROFILE_TYPE_FIELD_NAME: &str = "sProfileType";
const PROFILE_TYPE_BASIC_BLOCK_TRACING: i64 = 4;

const COLD_START_END_MARKER: &str = "LDexEndMarker0;";

#[derive(Clone, Debug)]
pub struct InstrumentOptions {
    /// Internal name of the analysis class carrying the runtime hooks.
    pub analysis_class: String,
    /// Exactly two names: `[onMethodBegin, onMethodExit]`.
    pub analysis_method_names: Vec<String>,
    pub metadata_file_name: String,
    pub max_num_blocks: usize,
    pub instrument_catches: bool,
    pub instrument_blocks_without_source_block: bool,
    pub instrument_only_root_store: bool,
    pub only_cold_start_class: bool,
    pub allowlist: HashSet<String>,
    pub blocklist: HashSet<String>,
}

impl Default for InstrumentOptions {
    fn default() -> InstrumentOptions {
        InstrumentOptions {
            analysis_class: String::new(),
            analysis_method_names: vec![
                "onMethodBegin".to_string(),
                "onMethodExit".to_string(),
            ],
            metadata_file_name: "redex-source-blocks.csv".to_string(),
            max_num_blocks: 4096,
            instrument_catches: true,
            instrument_blocks_without_source_block: true,
            instrument_only_root_store: false,
            only_cold_start_class: false,
            allowlist: HashSet::new(),
            blocklist: HashSet::new(),
        }
    }
}

/// Per-method outcome of the rewrite, feeding the metadata sidecar.
#[derive(Clone, Debug)]
pub struct MethodInstrumentationRecord {
    pub method: MethodRef,
    pub too_many_blocks: bool,
    pub offset: usize,
    pub num_non_entry_blocks: usize,
    pub num_vectors: usize,
    pub num_exit_calls: usize,
    pub num_empty_blocks: usize,
    pub num_useless_blocks: usize,
    pub num_no_source_blocks: usize,
    pub num_blocks_too_large: usize,
    pub num_catches: usize,
    pub num_instrumented_catches: usize,
    pub num_instrumented_blocks: usize,
    pub bit_id_to_block_id: Vec<BlockId>,
    pub bit_id_to_source_blocks: Vec<Vec<SourceBlock>>,
    pub rejected_blocks: BTreeMap<BlockId, BlockTypeFlags>,
}

/// The `instrument` column of the metadata CSV.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InstrumentedType {
    /// Too many basic blocks; only method tracing was done.
    MethodOnly = 1,
    Both = 2,
    /// No exit call was inserted although vectors were allocated.
    UnableToTrackBlock = 3,
}

pub fn instrumented_type(record: &MethodInstrumentationRecord) -> InstrumentedType {
    if record.too_many_blocks {
        InstrumentedType::MethodOnly
    } else if record.num_exit_calls == 0 && record.num_vectors != 0 {
        InstrumentedType::UnableToTrackBlock
    } else {
        InstrumentedType::Both
    }
}

/// Selection counters and per-method records for one pass run.
#[derive(Debug, Default)]
pub struct InstrumentStats {
    pub all_methods: usize,
    pub eligible: usize,
    pub specials: usize,
    pub picked_by_allowlist: usize,
    pub picked_by_cold_start: usize,
    pub blocklisted: usize,
    pub rejected: usize,
    pub non_root_store_methods: usize,
    pub block_instrumented: usize,
    /// Final offset, which equals the stats-array size in shorts.
    pub method_offset: usize,
    pub records: Vec<MethodInstrumentationRecord>,
}

fn proto_args(proto: &str) -> Option<&str> {
    let inner = proto.strip_prefix('(')?;
    let close = inner.find(')')?;
    Some(&inner[..close])
}

fn load_on_method_begin(arena: &DexArena, cls: ClassId, name: &str) -> Result<MethodRef> {
    let class = arena.class(cls);
    for method in &class.dmethods {
        if arena.string(method.refr.name) != name {
            continue;
        }
        let proto = arena.string(method.refr.proto);
        if proto_args(proto) != Some("I") {
            bail!(
                "prototype of {} must be (int), but it was {}",
                name,
                proto
            );
        }
        return Ok(method.refr);
    }
    bail!(
        "cannot find {} in {}",
        name,
        arena.type_name(class.type_id)
    );
}

fn build_on_method_exit_map(
    arena: &DexArena,
    cls: ClassId,
    name: &str,
) -> Result<BTreeMap<usize, MethodRef>> {
    let class = arena.class(cls);
    let mut map = BTreeMap::new();
    for method in &class.dmethods {
        if arena.string(method.refr.name) != name {
            continue;
        }
        let proto = arena.string(method.refr.proto);
        let args = proto_args(proto).unwrap_or("");
        let valid = args.starts_with('I') && args[1..].chars().all(|c| c == 'S');
        if !valid {
            bail!(
                "prototype of {} must be (int) or (int, short, ..., short), but it was {}",
                name,
                proto
            );
        }
        map.insert(args.len() - 1, method.refr);
    }
    if map.is_empty() {
        bail!(
            "cannot find {} in {}",
            name,
            arena.type_name(class.type_id)
        );
    }
    Ok(map)
}

/// Cold-start classes truncated at the first DEX end marker, each converted
/// to a class-prefix key (the trailing `;` becomes `/`).
fn get_cold_start_classes(coldstart_class_names: &[String]) -> HashSet<String> {
    let mut out = HashSet::new();
    for name in coldstart_class_names {
        if name == COLD_START_END_MARKER {
            break;
        }
        let mut key = name.clone();
        key.pop();
        key.push('/');
        out.insert(key);
    }
    out
}

/// Entries ending in `/` are class-prefix matches against the method's class
/// key; everything else matches the deobfuscated method name exactly.
fn is_included(method_name: &str, class_key: &str, set: &HashSet<String>) -> bool {
    set.iter().any(|entry| {
        if entry.ends_with('/') {
            class_key.starts_with(entry.as_str())
        } else {
            method_name == entry
        }
    })
}

fn class_key(type_name: &str) -> String {
    let mut key = type_name.to_string();
    key.pop();
    key.push('/');
    key
}

fn patch_static_field(arena: &mut DexArena, cls: ClassId, name: &str, value: i64) -> Result<()> {
    let sid = arena.intern_string(name);
    let class_name = arena.type_name(arena.class(cls).type_id).to_string();
    let class = arena.class_mut(cls);
    for field in &mut class.sfields {
        if field.refr.name == sid {
            field.static_value = value;
            return Ok(());
        }
    }
    bail!("cannot find static field {} in {}", name, class_name);
}

/// Run basic-block tracing over the scope: select methods, rewrite their
/// CFGs, patch the analysis class, and write the metadata sidecars.
pub fn do_basic_block_tracing(
    arena: &mut DexArena,
    scope: &[ClassId],
    coldstart_class_names: &[String],
    options: &InstrumentOptions,
    out_dir: &Path,
) -> Result<InstrumentStats> {
    if options.analysis_method_names.len() != 2 {
        bail!(
            "basic block profiling must have two analysis methods: [onMethodBegin, onMethodExit]"
        );
    }

    let analysis_type = arena
        .get_type(&options.analysis_class)
        .with_context(|| format!("analysis class {} not found", options.analysis_class))?;
    let analysis_cls = arena
        .type_class(analysis_type)
        .with_context(|| format!("analysis class {} has no definition", options.analysis_class))?;

    let on_method_begin =
        load_on_method_begin(arena, analysis_cls, &options.analysis_method_names[0])?;
    let on_method_exit_map =
        build_on_method_exit_map(arena, analysis_cls, &options.analysis_method_names[1])?;
    let max_vector_arity = on_method_exit_map
        .keys()
        .next_back()
        .copied()
        .context("empty onMethodExit overload map")?;
    debug!("max arity for onMethodExit: {}", max_vector_arity);

    let cold_start_classes = get_cold_start_classes(coldstart_class_names);
    debug!("cold start classes: {}", cold_start_classes.len());

    let mut stats = InstrumentStats::default();
    let use_selection = !options.allowlist.is_empty() || options.only_cold_start_class;

    // Selection happens over an immutable arena; the rewrite below mutates
    // the chosen method bodies one at a time.
    struct Selected {
        cls: ClassId,
        direct: bool,
        index: usize,
        method: MethodRef,
    }
    let mut selected = Vec::new();

    for &cls_id in scope {
        let class = arena.class(cls_id);
        if options.instrument_only_root_store && class.store != 0 {
            let with_code = class.all_methods().filter(|m| m.code.is_some()).count();
            stats.non_root_store_methods += with_code;
            stats.all_methods += with_code;
            continue;
        }
        let key = class_key(arena.type_name(class.type_id));
        let members = class
            .dmethods
            .iter()
            .enumerate()
            .map(|(i, m)| (true, i, m))
            .chain(class.vmethods.iter().enumerate().map(|(i, m)| (false, i, m)));
        for (direct, index, method) in members {
            if method.code.is_none() {
                continue;
            }
            stats.all_methods += 1;

            let is_clinit = method.refr.owner == analysis_type
                && arena.string(method.refr.name) == "<clinit>";
            if is_clinit
                || method.refr == on_method_begin
                || on_method_exit_map.values().any(|&m| m == method.refr)
            {
                stats.specials += 1;
                continue;
            }
            stats.eligible += 1;

            let deob = arena.deobfuscated_method_name(&method.refr);
            if use_selection {
                if is_included(&deob, &key, &options.allowlist) {
                    stats.picked_by_allowlist += 1;
                } else if is_included(&deob, &key, &cold_start_classes) {
                    stats.picked_by_cold_start += 1;
                } else {
                    stats.rejected += 1;
                    continue;
                }
            }

            // Blocklist has priority over the allowlist and cold start list.
            if is_included(&deob, &key, &options.blocklist) {
                stats.blocklisted += 1;
                continue;
            }

            selected.push(Selected {
                cls: cls_id,
                direct,
                index,
                method: method.refr,
            });
        }
    }

    let mut method_offset = METHOD_STATS_HEADER_SHORTS;
    for sel in selected {
        let class = arena.class_mut(sel.cls);
        let method = if sel.direct {
            &mut class.dmethods[sel.index]
        } else {
            &mut class.vmethods[sel.index]
        };
        let Some(code) = method.code.as_mut() else {
            continue;
        };
        let record = blocks::instrument_basic_blocks(
            code,
            sel.method,
            on_method_begin,
            &on_method_exit_map,
            max_vector_arity,
            method_offset,
            options.max_num_blocks,
            options,
        );
        if !record.too_many_blocks {
            stats.block_instrumented += 1;
        }
        // Two shorts of method-level stats, then one per vector.
        method_offset += 2 + record.num_vectors;
        stats.records.push(record);
    }
    stats.method_offset = method_offset;

    patch_static_field(arena, analysis_cls, STATS_FIELD_NAME, method_offset as i64)?;
    patch_static_field(
        arena,
        analysis_cls,
        NUM_INSTRUMENTED_FIELD_NAME,
        stats.records.len() as i64,
    )?;
    patch_static_field(
        arena,
        analysis_cls,
        PROFILE_TYPE_FIELD_NAME,
        PROFILE_TYPE_BASIC_BLOCK_TRACING,
    )?;

    metadata::write_metadata(arena, out_dir, &options.metadata_file_name, &stats.records)?;

    info!(
        "instrumented {} methods ({} block + method, {} method only)",
        stats.records.len(),
        stats.block_instrumented,
        stats.records.len() - stats.block_instrumented
    );
    debug!(
        "selection: all={} eligible={} special={} allowlist={} coldstart={} \
         blocklisted={} rejected={} non_root={}",
        stats.all_methods,
        stats.eligible,
        stats.specials,
        stats.picked_by_allowlist,
        stats.picked_by_cold_start,
        stats.blocklisted,
        stats.rejected,
        stats.non_root_store_methods
    );

    Ok(stats)
}
