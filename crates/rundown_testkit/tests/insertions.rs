//! Block-number insertions, root writes and fixup chains.

use rundown_core::{CleanupReason, Config, DiagSite, RundownReport};
use rundown_storage::block::{self, BlockHeader, ChainLink};
use rundown_storage::{CommitMode, UpdateState};
use rundown_testkit::prelude::*;

const PAYLOAD: &[u8] = &[0; 8];

fn run(scenario: &mut Scenario) -> RundownReport {
    scenario
        .run(Config::default(), &CountingProbe::default(), &ScriptedOracle::new())
        .unwrap()
}

#[test]
fn out_of_range_insertions_skip_the_element() {
    // Records span 20..28: below the first record, past its end, or naming
    // an element that is not earlier in the array.
    for (off, index) in [(12, 0), (26, 0), (20, 1), (20, -1)] {
        let mut builder = ScenarioBuilder::new();
        let region = builder.region(RegionSpec::mapped().in_commit());
        let array = builder.single_region_commit(
            &region,
            &[
                ElementSpec::acquired(7),
                ElementSpec::write(4).records(&[PAYLOAD]).insert(off, index),
            ],
        );
        let mut scenario = builder.build(CleanupReason::AbnormalTermination);

        let report = run(&mut scenario);
        assert_eq!(report.elements_replayed, 1, "{off} {index}");
        assert_eq!(report.elements_skipped, 1);
        let mem = &scenario.mem;
        assert!(region.traced(mem, DiagSite::InsertOffsetInvalid));
        let second = mem.element_arrays.get(array).unwrap().elements[1];
        assert!(!mem.elements.get(second).unwrap().is_committed());
        let history = region.header(mem).history;
        assert_eq!(history.current, history.next);
    }
}

#[test]
fn root_write_fills_the_block_before_it() {
    let mut builder = ScenarioBuilder::new();
    let region = builder.region(RegionSpec::mapped().in_commit());
    let array = builder.single_region_commit(
        &region,
        &[
            ElementSpec::acquired(7),
            ElementSpec::write(4).records(&[PAYLOAD]).insert(20, 0),
            ElementSpec::new(0, CommitMode::WriteRoot).insert(24, 0).delta(1),
            ElementSpec::new(9, CommitMode::BusyToFree).delta(-1),
        ],
    );
    let mut scenario = builder.build(CleanupReason::AbnormalTermination);

    let report = run(&mut scenario);
    assert_eq!(report.elements_replayed, 4);
    let mem = &scenario.mem;
    assert!(!region.traced(mem, DiagSite::RootInsertInvalid));
    let page = region.page(mem, 4);
    assert_eq!(block::read_word(page, 20), Some(7));
    assert_eq!(block::read_word(page, 24), Some(7));
    // Terminal elements touch no page and leave the free count alone.
    assert!(region.page(mem, 9).iter().all(|&b| b == 0));
    assert_eq!(region.header(mem).history.free_blocks, 99);
    let elements = &mem.element_arrays.get(array).unwrap().elements;
    for (&ptr, mode) in elements[2..].iter().zip([CommitMode::WriteRoot, CommitMode::BusyToFree]) {
        let cse = mem.elements.get(ptr).unwrap();
        assert_eq!(cse.mode, CommitMode::Committed);
        assert_eq!(cse.prior_mode, Some(mode));
    }
}

#[test]
fn out_of_range_root_write_skips_the_block_it_points_into() {
    let mut builder = ScenarioBuilder::new();
    let region = builder.region(RegionSpec::mapped().in_commit());
    builder.single_region_commit(
        &region,
        &[
            ElementSpec::acquired(7),
            ElementSpec::write(4).records(&[PAYLOAD]).insert(20, 0),
            ElementSpec::new(0, CommitMode::WriteRoot).insert(30, 0),
        ],
    );
    let mut scenario = builder.build(CleanupReason::AbnormalTermination);

    let report = run(&mut scenario);
    assert_eq!(report.elements_replayed, 2);
    assert_eq!(report.elements_skipped, 1);
    let mem = &scenario.mem;
    assert!(region.traced(mem, DiagSite::RootInsertInvalid));
    // The block's own insertion landed before the root was checked.
    assert_eq!(block::read_word(region.page(mem, 4), 20), Some(7));
}

#[test]
fn multi_region_insertion_below_the_records_is_rejected() {
    let mut builder = ScenarioBuilder::new();
    let region = builder.region(RegionSpec::mapped().in_commit());
    builder.multi_region_commit(
        &[(
            region.descriptor,
            vec![
                ElementSpec::acquired(7),
                ElementSpec::write(4).records(&[PAYLOAD]).insert(12, 0),
            ],
        )],
        UpdateState::CommitStarted,
    );
    let mut scenario = builder.build(CleanupReason::AbnormalTermination);

    let report = run(&mut scenario);
    assert_eq!(report.elements_replayed, 1);
    assert_eq!(report.elements_skipped, 1);
    assert!(region.traced(&scenario.mem, DiagSite::InsertOffsetInvalid));
}

#[test]
fn chain_index_past_the_depth_is_recorded_and_the_block_kept() {
    let mut builder = ScenarioBuilder::new();
    let region = builder.region(RegionSpec::mapped().in_commit());
    builder.multi_region_commit(
        &[(
            region.descriptor,
            vec![
                ElementSpec::acquired(7),
                ElementSpec::write(4).records(&[b"\0\0\0\0ptr!"]).insert(20, 5),
            ],
        )],
        UpdateState::CommitStarted,
    );
    let mut scenario = builder.build(CleanupReason::AbnormalTermination);

    let report = run(&mut scenario);
    assert_eq!(report.elements_replayed, 2);
    let mem = &scenario.mem;
    assert!(region.traced(mem, DiagSite::FixupChainBroken));
    let page = region.page(mem, 4);
    let link = ChainLink::decode(block::read_word(page, 20).unwrap());
    assert!(link.flag);
    assert_eq!(link.index, 5);
    assert_eq!(&page[24..28], b"ptr!");
}

#[test]
fn prebuilt_chain_running_past_the_used_size_stops() {
    let mut builder = ScenarioBuilder::new();
    let region = builder.region(RegionSpec::mapped().in_commit());
    let subs = builder.multi_region_commit(
        &[(region.descriptor, vec![ElementSpec::acquired(7), ElementSpec::write(4)])],
        UpdateState::CommitStarted,
    );

    // One link at 20 whose successor would sit at 36, past the 32 used bytes.
    let mut image = vec![0u8; 32];
    let header = BlockHeader {
        version: block::BLOCK_VERSION,
        level: 0,
        used: 32,
        commit_counter: 3,
    };
    assert!(header.write(&mut image));
    let link = ChainLink {
        flag: true,
        index: 0,
        next_off: 16,
    };
    assert!(block::write_word(&mut image, 20, link.encode()));
    let image = builder.mem().heap.map_bytes(&image).unwrap();
    let first = builder.mem().subtransactions.get(subs[0]).unwrap().first.unwrap();
    let second = builder.mem().elements.get(first).unwrap().next.unwrap();
    {
        let cse = builder.mem().elements.get_mut(second).unwrap();
        cse.done = true;
        cse.new_image = Some(image);
        cse.first_off = 20;
    }
    let mut scenario = builder.build(CleanupReason::AbnormalTermination);

    let report = run(&mut scenario);
    assert_eq!(report.elements_replayed, 2);
    let mem = &scenario.mem;
    assert!(region.traced(mem, DiagSite::FixupChainBroken));
    let page = region.page(mem, 4);
    assert_eq!(block::read_word(page, 20), Some(7));
    assert_eq!(BlockHeader::read(page).unwrap().commit_counter, 10);
}
