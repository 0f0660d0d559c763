//! Property-based tests for the memory pressure governor.
//!
//! - At Normal a process is never killed, however far over quota it runs
//! - Under pressure a process with a prior violation is killed exactly once
//! - Every state change is reported exactly once, with the matching actions
//! - Admission is refused at Low and above for every app type
//! - Non-native launches skip the headroom check

use proptest::prelude::*;

use shellhost_core::error::AdmissionDenied;
use shellhost_core::ids::ProcessId;
use shellhost_core::memory_pressure::{
    GovernorAction, MemoryConfig, MemoryPressureGovernor, MemoryState, PushedTelemetry,
    StaticThresholds, ThresholdLevel, ThresholdTable,
};
use shellhost_core::spawn::AppType;

// ────────────────────────────────────────────────────────────────────
// Strategies
// ────────────────────────────────────────────────────────────────────

fn arb_state() -> impl Strategy<Value = MemoryState> {
    prop_oneof![
        Just(MemoryState::Normal),
        Just(MemoryState::Medium),
        Just(MemoryState::Low),
        Just(MemoryState::Critical),
    ]
}

fn arb_pressure() -> impl Strategy<Value = MemoryState> {
    prop_oneof![Just(MemoryState::Low), Just(MemoryState::Critical)]
}

fn arb_app_type() -> impl Strategy<Value = AppType> {
    prop_oneof![
        Just(AppType::Web),
        Just(AppType::Service),
        Just(AppType::Native),
    ]
}

fn table_with_headroom(remaining_mb: u64) -> ThresholdTable {
    let level = ThresholdLevel {
        limit_mb: 1_000,
        remaining_mb,
    };
    ThresholdTable {
        normal: level,
        low: level,
        critical: level,
        reboot: level,
    }
}

fn governor(headroom_mb: u64) -> (MemoryPressureGovernor, PushedTelemetry) {
    let telemetry = PushedTelemetry::new();
    let mut gov = MemoryPressureGovernor::new(
        MemoryConfig::default(),
        Box::new(telemetry.clone()),
        Box::new(StaticThresholds::new(table_with_headroom(headroom_mb))),
    );
    gov.set_sampling_enabled(true);
    (gov, telemetry)
}

fn kills(actions: &[GovernorAction]) -> Vec<ProcessId> {
    actions
        .iter()
        .filter_map(|a| match a {
            GovernorAction::Kill { pid, .. } => Some(*pid),
            _ => None,
        })
        .collect()
}

// ────────────────────────────────────────────────────────────────────
// Quota enforcement
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Samples taken while the state is Normal never produce a kill.
    #[test]
    fn prop_never_killed_at_normal(
        quota in 10u64..200,
        samples in prop::collection::vec(0u64..1_000, 1..30),
    ) {
        let (mut gov, telemetry) = governor(10_000);
        let pid = ProcessId(1001);
        gov.track(pid, quota);
        for rss in samples {
            telemetry.set_process_mb(pid, rss);
            let actions = gov.tick();
            prop_assert!(kills(&actions).is_empty());
            prop_assert!(gov.watch(pid).is_some());
        }
    }

    /// A process that violated its quota once is killed on its next violating
    /// sample once pressure reaches Low, and only once.
    #[test]
    fn prop_killed_once_under_pressure(
        quota in 10u64..200,
        excess in 1u64..500,
        pressure in arb_pressure(),
        extra_ticks in 0usize..5,
    ) {
        let (mut gov, telemetry) = governor(10_000);
        let pid = ProcessId(1001);
        gov.track(pid, quota);
        telemetry.set_process_mb(pid, quota + excess);

        // First violation at Normal only counts.
        prop_assert!(kills(&gov.tick()).is_empty());
        prop_assert_eq!(gov.watch(pid).map(|w| w.violation_count), Some(1));

        gov.on_threshold_crossing(pressure);
        let first = kills(&gov.tick());
        prop_assert_eq!(first, vec![pid]);
        prop_assert!(gov.watch(pid).is_none());

        for _ in 0..extra_ticks {
            prop_assert!(kills(&gov.tick()).is_empty());
        }
    }

    /// Dropping back under quota clears the violation count.
    #[test]
    fn prop_recovery_resets_violations(quota in 10u64..200, excess in 1u64..500) {
        let (mut gov, telemetry) = governor(10_000);
        let pid = ProcessId(1001);
        gov.track(pid, quota);
        telemetry.set_process_mb(pid, quota + excess);
        gov.tick();
        telemetry.set_process_mb(pid, quota);
        gov.tick();
        prop_assert_eq!(gov.watch(pid).map(|w| w.violation_count), Some(0));

        // A single fresh violation under pressure is not yet a kill.
        gov.on_threshold_crossing(MemoryState::Critical);
        telemetry.set_process_mb(pid, quota + excess);
        prop_assert!(kills(&gov.tick()).is_empty());
    }
}

// ────────────────────────────────────────────────────────────────────
// State transitions
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Each distinct transition reports StateChanged once, preceded by the
    /// cleanup that state calls for; repeats report nothing.
    #[test]
    fn prop_transitions_reported_once(states in prop::collection::vec(arb_state(), 1..30)) {
        let (mut gov, _telemetry) = governor(10_000);
        let mut current = MemoryState::Normal;
        for state in states {
            let actions = gov.on_threshold_crossing(state);
            if state == current {
                prop_assert!(actions.is_empty());
                continue;
            }
            let changed: Vec<_> = actions
                .iter()
                .filter(|a| matches!(a, GovernorAction::StateChanged { .. }))
                .collect();
            let expected_change = GovernorAction::StateChanged { state };
            prop_assert_eq!(changed, vec![&expected_change]);
            match state {
                MemoryState::Normal => prop_assert_eq!(actions.len(), 1),
                MemoryState::Medium => {
                    prop_assert!(actions.contains(&GovernorAction::TrimAllocator));
                }
                MemoryState::Low | MemoryState::Critical => {
                    prop_assert!(actions.contains(&GovernorAction::FlushCache));
                    prop_assert!(actions.contains(&GovernorAction::ReapKeptAlive));
                }
            }
            prop_assert_eq!(gov.state(), state);
            current = state;
        }
    }

    /// The effective state is the worse of the system and self readings.
    #[test]
    fn prop_effective_state_is_max(system in arb_state(), self_mb in 0u64..700) {
        let (mut gov, telemetry) = governor(10_000);
        telemetry.set_self_mb(self_mb);
        gov.on_threshold_crossing(system);
        gov.tick();
        let expected = system.max(gov.config().classify_self(self_mb));
        prop_assert_eq!(gov.state(), expected);
    }
}

// ────────────────────────────────────────────────────────────────────
// Admission
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Launches are refused at Low and above regardless of type or size.
    #[test]
    fn prop_no_admission_under_pressure(
        pressure in arb_pressure(),
        app_type in arb_app_type(),
        required in 0u64..100,
    ) {
        let (mut gov, _telemetry) = governor(10_000);
        gov.on_threshold_crossing(pressure);
        let denied = gov.admit_launch(required, app_type);
        prop_assert_eq!(denied, Err(AdmissionDenied::MemoryPressure { state: pressure }));
    }

    /// Native launches must fit the critical headroom after reserving every
    /// tracked process's unused quota; other types are never checked.
    #[test]
    fn prop_native_headroom(
        headroom in 0u64..500,
        required in 0u64..300,
        quotas in prop::collection::vec((10u64..100, 0u64..100), 0..4),
    ) {
        let (mut gov, telemetry) = governor(headroom);
        let mut reserved = 0u64;
        for (i, (quota, rss)) in quotas.iter().enumerate() {
            let pid = ProcessId(2000 + i as u32);
            gov.track(pid, *quota);
            telemetry.set_process_mb(pid, (*rss).min(*quota));
            reserved += quota - (*rss).min(*quota);
        }
        gov.tick();

        let native = gov.admit_launch(required, AppType::Native);
        prop_assert_eq!(native.is_ok(), required + reserved <= headroom);
        prop_assert!(gov.admit_launch(required, AppType::Web).is_ok());
    }
}

// ────────────────────────────────────────────────────────────────────
// Scenario
// ────────────────────────────────────────────────────────────────────

/// Quota 50MB under Low: 80MB is the first violation, 85MB the kill.
#[test]
fn quota_violator_scenario() {
    let (mut gov, telemetry) = governor(10_000);
    let pid = ProcessId(1001);
    gov.track(pid, 50);

    let actions = gov.on_threshold_crossing(MemoryState::Low);
    assert!(actions.contains(&GovernorAction::FlushCache));

    telemetry.set_process_mb(pid, 80);
    assert!(kills(&gov.tick()).is_empty());
    assert_eq!(gov.watch(pid).map(|w| w.violation_count), Some(1));

    telemetry.set_process_mb(pid, 85);
    let actions = gov.tick();
    assert_eq!(
        actions,
        vec![GovernorAction::Kill {
            pid,
            rss_mb: 85,
            quota_mb: 50
        }]
    );
    assert!(gov.watch(pid).is_none());
}
