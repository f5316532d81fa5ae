//! The restricted profile, with page-granular probing and subtraction-only
//! arithmetic, must leave the same image as the unrestricted one.

use rundown_core::{CleanupReason, Config, ExecutionProfile, RundownReport};
use rundown_storage::block::BlockHeader;
use rundown_storage::{
    JournalPoolControl, MappingProbe, MemoryProbe, PageGranularProbe, Ptr, SharedHeader,
    UpdateState,
};
use rundown_testkit::prelude::*;

/// Everything a sweep is expected to change in the images built here.
#[derive(Debug, PartialEq)]
struct Outcome {
    report: RundownReport,
    headers: Vec<SharedHeader>,
    pages: Vec<Vec<u8>>,
    pool: Option<JournalPoolControl>,
}

/// A partly committed multi-region update plus a journal pool whose
/// reserved tail wraps the ring.
fn crash_image() -> (Scenario, Vec<RegionHandles>, Ptr<JournalPoolControl>) {
    let mut builder = ScenarioBuilder::new();
    let done = builder.region(RegionSpec::mapped().in_commit());
    let partial = builder.region(RegionSpec::mapped().in_commit());
    builder.multi_region_commit(
        &[
            (
                done.descriptor,
                vec![
                    ElementSpec::acquired(2).committed(),
                    ElementSpec::write(3).committed(),
                ],
            ),
            (
                partial.descriptor,
                vec![
                    ElementSpec::acquired(5).records(&[b"new"]).committed(),
                    ElementSpec::write(4).records(&[b"\0\0\0\0upd"]).delta(-1),
                ],
            ),
        ],
        UpdateState::CommitStarted,
    );
    let (pool, control) = builder.journal_pool(64, 40, 30);
    (builder.build(CleanupReason::AbnormalTermination), vec![done, partial, pool], control)
}

fn sweep(profile: ExecutionProfile, probe: &dyn MemoryProbe) -> Outcome {
    let (mut scenario, regions, control) = crash_image();
    let report = scenario
        .run(Config::default().profile(profile), probe, &ScriptedOracle::new())
        .unwrap();
    let mem = &scenario.mem;
    Outcome {
        report,
        headers: regions.iter().map(|r| *r.header(mem)).collect(),
        pages: (0..16).map(|block| regions[1].page(mem, block).to_vec()).collect(),
        pool: mem.journal_pools.get(control).ok().copied(),
    }
}

#[test]
fn restricted_and_unrestricted_sweeps_agree() {
    let restricted = sweep(
        ExecutionProfile::Restricted,
        &CountingProbe::new(PageGranularProbe::default()),
    );
    let unrestricted = sweep(
        ExecutionProfile::Unrestricted,
        &CountingProbe::new(MappingProbe),
    );
    assert_eq!(restricted, unrestricted);

    assert_eq!(restricted.report.regions_rolled_forward, 2);
    assert_eq!(restricted.report.elements_replayed, 1);
    assert_eq!(restricted.report.locks_released, 3);
    assert!(restricted.report.journal_pool_fixed);
    let pool = restricted.pool.unwrap();
    assert_eq!((pool.write, pool.write_addr, pool.seqno), (6, 5030, 2));
    let free: Vec<i64> = restricted.headers[..2].iter().map(|h| h.history.free_blocks).collect();
    assert_eq!(free, [99, 100]);
    let page = &restricted.pages[4];
    assert_eq!(BlockHeader::read(page).unwrap().commit_counter, 10);
    assert_eq!(&page[24..27], b"upd");
}

#[test]
fn page_granular_probe_drives_a_single_region_commit() {
    let mut builder = ScenarioBuilder::new();
    let region = builder.region(RegionSpec::buffered(4).in_commit());
    builder.single_region_commit(
        &region,
        &[
            ElementSpec::acquired(3).records(&[b"abc"]),
            ElementSpec::write(7).records(&[b"defg"]).delta(-1),
        ],
    );
    let mut scenario = builder.build(CleanupReason::AbnormalTermination);
    let probe = CountingProbe::new(PageGranularProbe::new(12));

    let report = scenario
        .run(
            Config::default().profile(ExecutionProfile::Restricted),
            &probe,
            &ScriptedOracle::new(),
        )
        .unwrap();
    assert_eq!(report.elements_replayed, 2);
    assert!(probe.calls() > 0);
    let mem = &scenario.mem;
    assert_eq!(&region.cached_page(mem, 3).unwrap()[20..23], b"abc");
    assert_eq!(&region.cached_page(mem, 7).unwrap()[20..24], b"defg");
    assert_eq!(region.header(mem).history.free_blocks, 100);
}
