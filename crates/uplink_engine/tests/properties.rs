//! Property tests for the uplink engine against the reference service.

use proptest::prelude::*;
use std::time::Duration;
use uplink_engine::OfflineRetry;
use uplink_testkit::prelude::*;

fn channel_strategy() -> impl Strategy<Value = Channel> {
    prop::sample::select(Channel::ALL.to_vec())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn published_snapshot_matches_remote(
        channel in channel_strategy(),
        snapshot in snapshot_strategy(6),
    ) {
        let mut rig = Rig::channel(channel, uplink_config(), service_config());
        rig.uplink.set_snapshot(snapshot.clone());
        rig.step(Duration::from_secs(1)).unwrap();
        for (key, value) in &snapshot {
            let remote = rig.remote_value(key);
            prop_assert_eq!(remote.as_ref(), Some(value));
        }
    }

    #[test]
    fn updates_reported_only_for_newer_writes(
        channel in channel_strategy(),
        writes in prop::collection::vec(any::<bool>(), 1..8),
    ) {
        let mut rig = Rig::channel(channel, uplink_config(), service_config());
        rig.uplink.subscribe("setpoint").unwrap();
        rig.step(Duration::from_secs(1)).unwrap();

        for (round, write) in writes.iter().enumerate() {
            if *write {
                rig.remote_write("setpoint", &format!("v{round}"));
            }
            rig.run(10, Duration::from_secs(1)).unwrap();
            let updates = rig.uplink.drain_updates();
            if *write {
                let expected = format!("v{round}");
                prop_assert_eq!(updates.get("setpoint"), Some(&expected));
            } else {
                prop_assert!(updates.is_empty(), "{:?}", updates);
            }
        }
    }

    #[test]
    fn link_recovers_once_faults_stop(
        channel in channel_strategy(),
        faults in prop::collection::vec((0u32..30, fault_strategy()), 0..8),
    ) {
        let config = uplink_config().with_offline_retry(OfflineRetry::After(Duration::from_secs(20)));
        let mut rig = Rig::channel(channel, config, service_config());
        let stormy = SimulationPlan {
            ticks: 30,
            remote_write_every: None,
            faults: faults.into_iter().map(|(at, f)| (at, FaultSpec(f))).collect(),
            ..SimulationPlan::default()
        };
        simulate(&mut rig, &stormy);

        rig.service.faults().clear();
        let quiet = SimulationPlan {
            ticks: 90,
            remote_write_every: None,
            ..SimulationPlan::default()
        };
        let report = simulate(&mut rig, &quiet);
        prop_assert_eq!(report.final_state.as_str(), "Connected");
        prop_assert!(rig.uplink.is_usable());
    }
}
