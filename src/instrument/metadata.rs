//! CSV metadata sidecars: the method-name dictionary and the per-method
//! block mapping consumed by the downstream profiler.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use anyhow::{ensure, Context, Result};
use log::debug;

use crate::instrument::{instrumented_type, MethodInstrumentationRecord, PROFILING_DATA_VERSION};
use crate::ir::{DexArena, MethodRef};

const METHOD_DICTIONARY_FILE_NAME: &str = "redex-source-block-method-dictionary.csv";

type MethodDictionary = HashMap<MethodRef, usize>;

/// Write the deobfuscated method-name dictionary, alphabetically sorted, and
/// return the name-to-index mapping. Duplicate deobfuscated names are a
/// hard error since the profiler keys on them.
fn create_method_dictionary(
    arena: &DexArena,
    path: &Path,
    records: &[MethodInstrumentationRecord],
) -> Result<MethodDictionary> {
    let mut methods = HashSet::new();
    for record in records {
        methods.insert(record.method);
        for source_blocks in &record.bit_id_to_source_blocks {
            for sb in source_blocks {
                methods.insert(sb.src);
            }
        }
    }

    let mut named: Vec<(String, MethodRef)> = methods
        .into_iter()
        .map(|m| (arena.deobfuscated_method_name(&m), m))
        .collect();
    named.sort();
    for pair in named.windows(2) {
        ensure!(
            pair[0].0 != pair[1].0,
            "identical deobfuscated names were found: {}",
            pair[0].0
        );
    }

    let mut out = String::from("type,version\nredex-source-block-method-dictionary,1\n");
    out.push_str("index,deob_name\n");
    let mut dictionary = MethodDictionary::new();
    for (index, (name, method)) in named.into_iter().enumerate() {
        out.push_str(&format!("{},{}\n", index, name));
        dictionary.insert(method, index);
    }
    fs::write(path, out).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(dictionary)
}

fn join_block_ids(record: &MethodInstrumentationRecord) -> String {
    record
        .bit_id_to_block_id
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(";")
}

fn join_rejected_blocks(record: &MethodInstrumentationRecord) -> String {
    record
        .rejected_blocks
        .iter()
        .map(|(id, ty)| format!("{}:{}", id, ty.0))
        .collect::<Vec<_>>()
        .join(";")
}

/// `;` separates bit ids, `|` separates the source blocks of one bit id,
/// each encoded as `method_idx#sb_id`.
fn join_source_blocks(
    dictionary: &MethodDictionary,
    record: &MethodInstrumentationRecord,
) -> String {
    record
        .bit_id_to_source_blocks
        .iter()
        .map(|source_blocks| {
            source_blocks
                .iter()
                .map(|sb| format!("{}#{}", dictionary[&sb.src], sb.id))
                .collect::<Vec<_>>()
                .join("|")
        })
        .collect::<Vec<_>>()
        .join(";")
}

/// Write both sidecars into `out_dir`.
pub fn write_metadata(
    arena: &DexArena,
    out_dir: &Path,
    metadata_base_file_name: &str,
    records: &[MethodInstrumentationRecord],
) -> Result<()> {
    let dictionary =
        create_method_dictionary(arena, &out_dir.join(METHOD_DICTIONARY_FILE_NAME), records)?;

    let mut out = String::from("profile_type,version,num_methods\n");
    out.push_str(&format!(
        "basic-block-tracing,{},{}\n",
        PROFILING_DATA_VERSION,
        records.len()
    ));
    out.push_str("offset,name,instrument,non_entry_blocks,vectors,bit_id_2_block_id,rejected_blocks,src_blocks\n");
    for record in records {
        out.push_str(&format!(
            "{},{},{},{},{},{},{},{}\n",
            record.offset,
            dictionary[&record.method],
            instrumented_type(record) as i32,
            record.num_non_entry_blocks,
            record.num_vectors,
            join_block_ids(record),
            join_rejected_blocks(record),
            join_source_blocks(&dictionary, record),
        ));
    }

    let path = out_dir.join(metadata_base_file_name);
    fs::write(&path, out).with_context(|| format!("failed to write {}", path.display()))?;
    debug!("metadata file was written to: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::BlockTypeFlags;
    use crate::ir::SourceBlock;
    use std::collections::BTreeMap;

    fn record(arena: &mut DexArena, owner: &str) -> MethodInstrumentationRecord {
        let method = arena.method_ref(owner, "run", "()V");
        let mut rejected = BTreeMap::new();
        rejected.insert(3, BlockTypeFlags::EMPTY);
        MethodInstrumentationRecord {
            method,
            too_many_blocks: false,
            offset: 8,
            num_non_entry_blocks: 3,
            num_vectors: 1,
            num_exit_calls: 1,
            num_empty_blocks: 1,
            num_useless_blocks: 0,
            num_no_source_blocks: 0,
            num_blocks_too_large: 0,
            num_catches: 0,
            num_instrumented_catches: 0,
            num_instrumented_blocks: 2,
            bit_id_to_block_id: vec![1, 2],
            bit_id_to_source_blocks: vec![
                vec![SourceBlock { src: method, id: 0 }],
                vec![
                    SourceBlock { src: method, id: 1 },
                    SourceBlock { src: method, id: 2 },
                ],
            ],
            rejected_blocks: rejected,
        }
    }

    #[test]
    fn metadata_has_three_header_lines_plus_rows() {
        let mut arena = DexArena::new();
        let records = vec![
            record(&mut arena, "Lcom/A;"),
            record(&mut arena, "Lcom/B;"),
        ];
        let dir = tempfile::tempdir().expect("temp dir");

        write_metadata(&arena, dir.path(), "redex-source-blocks.csv", &records)
            .expect("write metadata");

        let metadata =
            fs::read_to_string(dir.path().join("redex-source-blocks.csv")).expect("read");
        let lines: Vec<&str> = metadata.lines().collect();
        assert_eq!(lines.len(), 3 + records.len());
        assert_eq!(lines[0], "profile_type,version,num_methods");
        assert_eq!(lines[1], format!("basic-block-tracing,{},2", PROFILING_DATA_VERSION));
        assert!(lines[2].starts_with("offset,name,instrument"));
    }

    #[test]
    fn dictionary_is_sorted_and_indexed() {
        let mut arena = DexArena::new();
        let records = vec![
            record(&mut arena, "Lcom/Zebra;"),
            record(&mut arena, "Lcom/Alpha;"),
        ];
        let dir = tempfile::tempdir().expect("temp dir");

        write_metadata(&arena, dir.path(), "redex-source-blocks.csv", &records)
            .expect("write metadata");

        let dict = fs::read_to_string(dir.path().join(METHOD_DICTIONARY_FILE_NAME)).expect("read");
        let lines: Vec<&str> = dict.lines().collect();
        assert_eq!(lines[0], "type,version");
        assert_eq!(lines[1], "redex-source-block-method-dictionary,1");
        assert_eq!(lines[2], "index,deob_name");
        assert_eq!(lines[3], "0,Lcom/Alpha;.run()V");
        assert_eq!(lines[4], "1,Lcom/Zebra;.run()V");
    }

    #[test]
    fn row_encodes_block_and_source_block_maps() {
        let mut arena = DexArena::new();
        let records = vec![record(&mut arena, "Lcom/A;")];
        let dir = tempfile::tempdir().expect("temp dir");

        write_metadata(&arena, dir.path(), "redex-source-blocks.csv", &records)
            .expect("write metadata");

        let metadata =
            fs::read_to_string(dir.path().join("redex-source-blocks.csv")).expect("read");
        let row = metadata.lines().nth(3).expect("data row");
        let fields: Vec<&str> = row.split(',').collect();
        assert_eq!(fields[0], "8");
        assert_eq!(fields[2], "2"); // instrument = Both
        assert_eq!(fields[5], "1;2");
        assert_eq!(fields[6], format!("3:{}", BlockTypeFlags::EMPTY.0));
        assert_eq!(fields[7], "0#0;0#1|0#2");
    }

    #[test]
    fn duplicate_deobfuscated_names_are_rejected() {
        let mut arena = DexArena::new();
        let mut a = record(&mut arena, "Lcom/A;");
        let b = record(&mut arena, "Lcom/B;");
        // Force a duplicate display name through the override.
        let ty = arena.make_type("Lcom/A;");
        let mut cls = crate::ir::DexClass::new(ty);
        cls.vmethods.push(crate::ir::DexMethod {
            refr: a.method,
            access: crate::ir::AccessFlags::PUBLIC,
            deob_name: Some("Lcom/B;.run()V".to_string()),
            code: None,
        });
        arena.add_class(cls);
        a.bit_id_to_source_blocks.clear();
        a.bit_id_to_block_id.clear();
        let dir = tempfile::tempdir().expect("temp dir");

        let result = write_metadata(&arena, dir.path(), "redex-source-blocks.csv", &[a, b]);
        assert!(result.is_err());
    }
}
