//! Property-based test generators using proptest.

use crate::fixtures::ElementSpec;
use proptest::prelude::*;
use rundown_storage::CommitMode;

/// Strategy for a small update record.
pub fn record_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..24)
}

/// Strategy for one element of a write set targeting `block`.
///
/// Acquired and written blocks with a free-count delta in `-2..=2`, some of
/// them already committed by the dead writer.
pub fn element_strategy(block: u32) -> impl Strategy<Value = ElementSpec> {
    element_in(
        block,
        prop_oneof![Just(CommitMode::Acquired), Just(CommitMode::Write)],
    )
}

/// Like [`element_strategy`], but also emits the root-write and
/// busy-to-free elements only single-region transactions carry.
pub fn single_region_element_strategy(block: u32) -> impl Strategy<Value = ElementSpec> {
    element_in(
        block,
        prop_oneof![
            3 => Just(CommitMode::Acquired),
            3 => Just(CommitMode::Write),
            1 => Just(CommitMode::WriteRoot),
            1 => Just(CommitMode::BusyToFree),
        ],
    )
}

fn element_in(
    block: u32,
    mode: impl Strategy<Value = CommitMode>,
) -> impl Strategy<Value = ElementSpec> {
    (
        mode,
        prop::collection::vec(record_strategy(), 0..3),
        -2i32..=2,
        any::<bool>(),
    )
        .prop_map(move |(mode, records, delta, committed)| {
            let mut spec = ElementSpec::new(block, mode).delta(delta);
            spec.records = records;
            spec.committed = committed;
            spec
        })
}

/// Strategy for a write set of up to `max` elements on distinct blocks
/// `1..=max`.
pub fn write_set_strategy(max: usize) -> impl Strategy<Value = Vec<ElementSpec>> {
    (1..=max).prop_flat_map(|len| {
        (1..=len as u32)
            .map(element_strategy)
            .collect::<Vec<_>>()
    })
}

/// Strategy for a single-region write set of up to `max` elements.
pub fn single_region_write_set_strategy(max: usize) -> impl Strategy<Value = Vec<ElementSpec>> {
    (1..=max).prop_flat_map(|len| {
        (1..=len as u32)
            .map(single_region_element_strategy)
            .collect::<Vec<_>>()
    })
}

/// Strategy for a multi-region write set whose committed elements form a
/// prefix, as a writer dying mid-loop leaves them.
pub fn partial_write_set_strategy(max: usize) -> impl Strategy<Value = Vec<ElementSpec>> {
    write_set_strategy(max).prop_flat_map(|specs| {
        let len = specs.len();
        (Just(specs), 0..=len).prop_map(|(mut specs, done)| {
            for (i, spec) in specs.iter_mut().enumerate() {
                spec.committed = i < done;
            }
            specs
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn write_sets_use_distinct_blocks(specs in write_set_strategy(8)) {
            let mut blocks: Vec<u32> = specs.iter().map(|s| s.block).collect();
            blocks.dedup();
            prop_assert_eq!(blocks.len(), specs.len());
        }

        #[test]
        fn multi_region_sets_only_write_pages(specs in partial_write_set_strategy(8)) {
            prop_assert!(specs.iter().all(|s| s.mode.writes_page()));
        }

        #[test]
        fn partial_sets_commit_a_prefix(specs in partial_write_set_strategy(8)) {
            let done = specs.iter().take_while(|s| s.committed).count();
            prop_assert!(specs[done..].iter().all(|s| !s.committed));
        }
    }
}
