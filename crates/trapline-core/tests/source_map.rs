//! Tests for the source location index and module sections

mod common;

use trapline_core::module::Module;
use trapline_core::source_map::{ExprLoc, SourceLocation, SourceLocationIndex};
use trapline_core::types::BytecodeOffset;

fn off(value: u32) -> BytecodeOffset
{
    BytecodeOffset::new(value)
}

#[test]
fn test_scenario_lines_map_to_ascending_offsets()
{
    let index = SourceLocationIndex::from_records(vec![
        ExprLoc::new(2, 3, off(30)),
        ExprLoc::new(2, 7, off(20)),
        ExprLoc::new(1, 1, off(10)),
    ])
    .unwrap();

    assert_eq!(index.offsets_of_line(2), &[off(20), off(30)]);
    assert_eq!(index.location_of(off(20)), Some(SourceLocation { line: 2, column: 7 }));
    assert_eq!(index.len(), 3);
}

#[test]
fn test_every_line_matches_filtered_table()
{
    let records: Vec<_> = (0..40u32).map(|i| ExprLoc::new(i % 7, i, off(i * 3))).collect();
    let index = SourceLocationIndex::from_records(records).unwrap();
    for line in 0..8 {
        let expected: Vec<_> = index
            .all_locations()
            .iter()
            .filter(|loc| loc.line == line)
            .map(|loc| loc.offset)
            .collect();
        assert_eq!(index.offsets_of_line(line), expected.as_slice());
    }
}

#[test]
fn test_empty_index()
{
    let index = SourceLocationIndex::from_records(Vec::new()).unwrap();
    assert!(index.is_empty());
    assert!(index.offsets_of_line(1).is_empty());
    assert_eq!(index.location_of(off(0)), None);
}

#[test]
fn test_module_sections_are_listed()
{
    let module = Module::from_bytes(common::module_bytes(true)).unwrap();
    let kinds: Vec<_> = module.sections().iter().map(|s| s.kind()).collect();
    assert_eq!(kinds, vec!["code", "sourceMappingURL"]);
    assert_eq!(module.custom_sections().count(), 1);
    assert_eq!(module.source_mapping_url().as_deref(), Some(common::SOURCE_MAP_URL));
}

#[test]
fn test_module_with_bad_magic_is_rejected()
{
    let mut bytes = common::module_bytes(false);
    bytes[0] = 0xff;
    assert!(Module::from_bytes(bytes).is_err());
}
