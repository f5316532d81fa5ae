//! Sweeps over images that fault part-way through.

use proptest::prelude::*;
use rundown_core::{CleanupReason, Config, InvariantPolicy};
use rundown_storage::UpdateState;
use rundown_testkit::prelude::*;

fn crash_image() -> (Scenario, RegionHandles, RegionHandles) {
    let mut builder = ScenarioBuilder::new();
    let mapped = builder.region(RegionSpec::mapped().in_commit());
    let buffered = builder.region(RegionSpec::buffered(4).in_commit());
    builder.multi_region_commit(
        &[
            (
                mapped.descriptor,
                vec![
                    ElementSpec::acquired(2).records(&[b"one"]).committed(),
                    ElementSpec::write(3).records(&[b"two"]),
                ],
            ),
            (buffered.descriptor, vec![ElementSpec::write(5).records(&[b"three"])]),
        ],
        UpdateState::CommitStarted,
    );
    builder.journal_pool(64, 8, 16);
    (builder.build(CleanupReason::AbnormalTermination), mapped, buffered)
}

fn recording() -> Config {
    Config::default().invariant_policy(InvariantPolicy::Record)
}

#[test]
fn clean_run_touches_everything() {
    init_tracing();
    let (mut scenario, mapped, buffered) = crash_image();
    let probe = CountingProbe::default();
    let report = scenario.run(recording(), &probe, &ScriptedOracle::new()).unwrap();

    assert_eq!(report.elements_replayed, 2);
    assert_eq!(report.locks_released, 3);
    assert!(report.journal_pool_fixed);
    assert!(probe.calls() > 0);
    assert_eq!(&mapped.page(&scenario.mem, 3)[20..23], b"two");
    assert_eq!(&buffered.cached_page(&scenario.mem, 5).unwrap()[20..25], b"three");
}

#[test]
fn unmapped_file_skips_its_elements_but_releases_the_lock() {
    let (mut scenario, mapped, _) = crash_image();
    let probe = CountingProbe::default();
    probe.fail_base(mapped.base);

    let report = scenario.run(recording(), &probe, &ScriptedOracle::new()).unwrap();
    assert_eq!(report.elements_replayed, 1);
    assert_eq!(report.elements_skipped, 1);
    let mem = &scenario.mem;
    assert!(!mapped.state(mem).holds_write_lock);
    let history = mapped.header(mem).history;
    assert_eq!(history.current, history.next);
}

#[test]
fn healed_probe_counts_calls_across_runs() {
    let (mut scenario, _, _) = crash_image();
    let probe = CountingProbe::default();
    probe.fail_from(0);
    let report = scenario.run(recording(), &probe, &ScriptedOracle::new()).unwrap();
    assert_eq!(report.regions_visited, 0);
    let failed = probe.calls();

    probe.heal();
    let report = scenario.run(recording(), &probe, &ScriptedOracle::new()).unwrap();
    assert_eq!(report.elements_replayed, 2);
    assert!(probe.calls() > failed);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(96))]

    /// Whatever probe fails first, the sweep finishes and never replays an
    /// element twice.
    #[test]
    fn sweep_survives_a_fault_at_any_point(from in 0u64..400, single in any::<bool>()) {
        let (mut scenario, mapped, buffered) = crash_image();
        let probe = CountingProbe::default();
        if single {
            probe.fail_call(from);
        } else {
            probe.fail_from(from);
        }
        let oracle = ScriptedOracle::new();
        let first = scenario.run(recording(), &probe, &oracle).unwrap();
        prop_assert!(first.elements_replayed <= 2);

        probe.heal();
        let second = scenario.run(recording(), &probe, &oracle).unwrap();
        prop_assert!(first.elements_replayed + second.elements_replayed <= 2);

        let mem = &scenario.mem;
        for region in [&mapped, &buffered] {
            let history = region.header(mem).history;
            prop_assert!(history.next >= history.current);
            prop_assert!(history.next - history.current <= 1);
        }
    }
}
