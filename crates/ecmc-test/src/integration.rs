//! End-to-end run tests
//!
//! Complete runs of the systems in [`crate::systems`] under both mediators:
//! - Bit-identical traces for a fixed seed
//! - Committed times never decrease
//! - Single- and multi-process mediators commit the same events
//! - Unconfirmed events are resent without going back in time
//! - Outputs, run summaries and configuration errors

use ecmc_core::EcmcResult;
use ecmc_runtime::RunConfig;

use crate::systems::System;
use crate::trace::{record_trace, Trace};

/// Upper bound on the steps of a test run.
pub const MAX_STEPS: usize = 200_000;

/// Run a system to its end and return its trace.
pub fn run_system(system: System, config: &RunConfig) -> EcmcResult<Trace> {
    let mut run = system.build(config)?;
    record_trace(run.mediator.as_mut(), MAX_STEPS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    use ecmc_core::{EcmcError, Node};
    use ecmc_runtime::{build_mediator, MemoryOutputSink, RunOutcome, SchedulerKind, TagActivator};
    use ecmc_state::TreeStateHandler;

    use crate::systems::*;

    fn parameters() -> RunParameters {
        RunParameters::default()
    }

    fn seeded(seed: u64) -> RunConfig {
        RunConfig::seeded(seed)
    }

    fn multi_process(seed: u64, cores: usize) -> RunConfig {
        RunConfig {
            seed,
            ..RunConfig::multi_process(cores)
        }
    }

    fn two_disks() -> System {
        two_hard_disks(&parameters()).unwrap()
    }

    fn disk_grid() -> System {
        hard_disk_grid(3, 0.05, &parameters()).unwrap()
    }

    fn inverse_power() -> System {
        inverse_power_grid(3, &parameters(), None).unwrap()
    }

    fn dimer_pairs() -> System {
        dimers(4, &parameters(), None).unwrap()
    }

    fn cell_veto() -> System {
        cell_veto_grid(3, 4, &parameters(), None).unwrap()
    }

    fn systems() -> [(&'static str, fn() -> System); 5] {
        [
            ("two hard disks", two_disks),
            ("hard disk grid", disk_grid),
            ("inverse power", inverse_power),
            ("dimers", dimer_pairs),
            ("cell veto", cell_veto),
        ]
    }

    fn periodic_distance(a: &Node, b: &Node) -> f64 {
        a.unit
            .position
            .iter()
            .zip(&b.unit.position)
            .map(|(x, y)| {
                let mut d = (x - y).abs();
                if d > 0.5 {
                    d = 1.0 - d;
                }
                d * d
            })
            .sum::<f64>()
            .sqrt()
    }

    // ========================================================================
    // Determinism
    // ========================================================================

    #[test]
    fn test_two_hard_disks_trace_is_reproducible() {
        let first = run_system(two_hard_disks(&parameters()).unwrap(), &seeded(7)).unwrap();
        let second = run_system(two_hard_disks(&parameters()).unwrap(), &seeded(7)).unwrap();
        assert!(!first.is_empty());
        assert_eq!(first.entries, second.entries);
        assert!(first.is_monotonic());
        assert_eq!(first.final_time().unwrap().to_float(), 5.5);
    }

    #[test]
    fn test_every_system_is_reproducible_and_monotonic() {
        for (name, build) in systems() {
            let first = run_system(build(), &seeded(11)).unwrap();
            let second = run_system(build(), &seeded(11)).unwrap();
            assert_eq!(first.entries, second.entries, "{} is not reproducible", name);
            assert!(first.is_monotonic(), "{} went back in time", name);
            assert_eq!(first.summary, second.summary, "{} summaries differ", name);
        }
    }

    #[test]
    fn test_stochastic_trace_depends_on_seed() {
        let first = run_system(inverse_power_grid(3, &parameters(), None).unwrap(), &seeded(1)).unwrap();
        let second = run_system(inverse_power_grid(3, &parameters(), None).unwrap(), &seeded(2)).unwrap();
        assert_ne!(first.entries, second.entries);
    }

    #[test]
    fn test_heap_and_list_schedulers_agree() {
        for (name, build) in systems() {
            let heap = run_system(build(), &seeded(5)).unwrap();
            let list = run_system(
                build(),
                &RunConfig {
                    scheduler: SchedulerKind::List,
                    ..seeded(5)
                },
            )
            .unwrap();
            assert_eq!(heap.entries, list.entries, "{} differs between schedulers", name);
        }
    }

    // ========================================================================
    // Mediator equivalence
    // ========================================================================

    #[test]
    fn test_single_and_multi_process_agree() {
        for (name, build) in systems() {
            for cores in [2, 4] {
                let mut single = build().build(&seeded(3)).unwrap();
                let mut multi = build().build(&multi_process(3, cores)).unwrap();
                let single_trace = record_trace(single.mediator.as_mut(), MAX_STEPS).unwrap();
                let multi_trace = record_trace(multi.mediator.as_mut(), MAX_STEPS).unwrap();

                assert_eq!(
                    single_trace.entries, multi_trace.entries,
                    "{} differs with {} cores",
                    name, cores
                );
                assert_eq!(single.mediator.global_state(), multi.mediator.global_state());
                assert_eq!(single.sink.records(), multi.sink.records());
            }
        }
    }

    // ========================================================================
    // Unconfirmed events
    // ========================================================================

    #[test]
    fn test_unconfirmed_cell_veto_events_keep_time_monotonic() {
        for seed in [3, 5, 11] {
            let single = run_system(cell_veto(), &seeded(seed)).unwrap();
            assert!(single.is_monotonic(), "seed {} went back in time", seed);
            assert!(
                single.summary.unconfirmed_of("cell_veto") > 0,
                "seed {} never left a cell-veto event unconfirmed",
                seed
            );
            assert_eq!(single.summary.events_of("end_of_run"), 1);
            assert_eq!(single.summary.unconfirmed_per_tag.keys().collect::<Vec<_>>(), vec!["cell_veto"]);

            for cores in [2, 4] {
                let multi = run_system(cell_veto(), &multi_process(seed, cores)).unwrap();
                assert!(multi.is_monotonic());
                assert_eq!(multi.entries, single.entries, "seed {} differs with {} cores", seed, cores);
                assert_eq!(multi.summary, single.summary);
            }
        }
    }

    #[test]
    fn test_exhausted_step_limit_is_an_error() {
        for config in [seeded(0), multi_process(0, 2)] {
            let mut run = cell_veto().build(&config).unwrap();
            let result = record_trace(run.mediator.as_mut(), 10);
            assert!(matches!(result, Err(EcmcError::Mediator(_))));
        }
    }

    #[test]
    fn test_multi_process_run_from_toml() {
        let config = RunConfig::from_toml_str(
            r#"
            seed = 9

            [mediator]
            kind = "multi_process"
            cores = 3
            "#,
        )
        .unwrap();
        let mut run = cell_veto().build(&config).unwrap();
        let RunOutcome::Stopped(summary) = run.mediator.run().unwrap();
        assert_eq!(summary.events_of("end_of_run"), 1);
        assert!(summary.events_of("cell_boundary") > 0);
    }

    // ========================================================================
    // Physics and outputs
    // ========================================================================

    #[test]
    fn test_hard_disks_never_overlap() {
        let radius = 0.05;
        let mut run = hard_disk_grid(3, radius, &parameters()).unwrap().build(&seeded(0)).unwrap();
        run.mediator.run().unwrap();
        let state = run.mediator.global_state();
        for (index, a) in state.iter().enumerate() {
            for b in &state[index + 1..] {
                assert!(
                    periodic_distance(a, b) >= 2.0 * radius - 1e-9,
                    "disks {} and {} overlap",
                    a.unit.identifier,
                    b.unit.identifier
                );
            }
        }
    }

    #[test]
    fn test_sampling_and_final_outputs() {
        let mut run = two_hard_disks(&parameters()).unwrap().build(&seeded(0)).unwrap();
        run.mediator.run().unwrap();

        let samples = run.sink.records_of(POSITIONS);
        let times: Vec<f64> = samples.iter().map(|record| record.time).collect();
        assert_eq!(times, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        assert!(samples.iter().all(|record| record.branches.len() == 2));

        let last = run.sink.records_of(FINAL_STATE);
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].time, 5.5);
        assert_eq!(last[0].branches, run.mediator.global_state());
    }

    #[test]
    fn test_run_summary_of_hard_disks() {
        let mut run = hard_disk_grid(3, 0.05, &parameters()).unwrap().build(&seeded(0)).unwrap();
        let RunOutcome::Stopped(summary) = run.mediator.run().unwrap();

        assert_eq!(summary.events_of("start_of_run"), 1);
        assert_eq!(summary.events_of("end_of_run"), 1);
        assert_eq!(summary.events_of("sampling"), 5);
        assert_eq!(summary.events_of("end_of_chain"), 7);
        assert_eq!(summary.events_per_tag.values().sum::<u64>(), summary.events);
        assert_eq!(summary.last_event_time, 5.5);
        assert!((summary.total_time - 5.5).abs() < 1e-9);
        assert!((summary.total_distance - summary.total_time).abs() < 1e-9);
        assert_eq!(summary.final_time_stamp, Some(5.5));
    }

    #[test]
    fn test_bounding_violation_limit_from_config() {
        let config = RunConfig::from_toml_str("seed = 4\nbounding_violation_limit = 0\n").unwrap();
        // The bounding prefactor is twice the real one, so the bound holds everywhere.
        let system = inverse_power_grid(3, &parameters(), config.bounding_violation_limit).unwrap();
        let trace = run_system(system, &config).unwrap();
        assert_eq!(trace.summary.events_of("end_of_run"), 1);
    }

    #[test]
    fn test_step_after_the_end_is_an_error() {
        let mut run = two_hard_disks(&parameters()).unwrap().build(&seeded(0)).unwrap();
        run.mediator.run().unwrap();
        assert!(matches!(run.mediator.step(), Err(EcmcError::Mediator(_))));
    }

    // ========================================================================
    // Configuration errors
    // ========================================================================

    fn build_with_sink(sink: MemoryOutputSink, config: &RunConfig) -> EcmcResult<()> {
        let system = two_hard_disks(&parameters())?;
        let state = TreeStateHandler::new(system.global_state)?;
        let activator = TagActivator::new(system.taggers, system.internal_states)?;
        build_mediator(config, Box::new(state), activator, Box::new(sink)).map(|_| ())
    }

    #[test]
    fn test_missing_output_is_rejected() {
        let result = build_with_sink(MemoryOutputSink::new(&[POSITIONS]), &seeded(0));
        assert!(matches!(result, Err(EcmcError::Configuration(_))));
    }

    #[test]
    fn test_single_core_multi_process_is_rejected() {
        let result = build_with_sink(MemoryOutputSink::new(&[POSITIONS, FINAL_STATE]), &multi_process(0, 1));
        assert!(matches!(result, Err(EcmcError::Configuration(_))));
    }

    #[test]
    fn test_too_small_handler_pool_is_fatal() {
        let mut system = hard_disk_grid(3, 0.05, &parameters()).unwrap();
        for tagger in &mut system.taggers {
            if tagger.tag == "hard_disk" {
                tagger.number_event_handlers = 2;
            }
        }
        let result = run_system(system, &seeded(0));
        assert!(matches!(result, Err(EcmcError::TagActivator(_))));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        #[test]
        fn prop_committed_times_never_decrease(seed in any::<u64>()) {
            let trace = run_system(inverse_power_grid(2, &parameters(), None).unwrap(), &seeded(seed)).unwrap();
            prop_assert!(trace.is_monotonic());
            prop_assert_eq!(trace.summary.events_of("end_of_run"), 1);
        }
    }
}
