//! Scripted runs of an uplink against the reference service.
//!
//! A [`SimulationPlan`] describes a device: how many feeds it publishes, what
//! it subscribes to, how often the dashboard writes back, and which faults
//! and outages hit the link at which tick. [`simulate`] plays the plan on a
//! [`Rig`] and summarises what happened.

use crate::fixtures::Rig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uplink_engine::{SyncError, Transport, UplinkStats};
use uplink_service::{Fault, ServiceStats};

/// What to play.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationPlan {
    /// Ticks to run.
    pub ticks: u32,
    /// Time between ticks, in milliseconds.
    pub tick_millis: u64,
    /// Feeds published, named `sensor-0`, `sensor-1`, ...
    pub feeds: usize,
    /// Feeds subscribed to.
    pub subscribe: Vec<String>,
    /// Dashboard writes to every subscribed feed every this many ticks.
    pub remote_write_every: Option<u32>,
    /// Faults injected before the given tick.
    pub faults: Vec<(u32, FaultSpec)>,
    /// Outage as `(first tick, length in ticks)`.
    pub outage: Option<(u32, u32)>,
}

impl Default for SimulationPlan {
    fn default() -> Self {
        Self {
            ticks: 120,
            tick_millis: 1000,
            feeds: 3,
            subscribe: vec!["setpoint".into()],
            remote_write_every: Some(30),
            faults: Vec::new(),
            outage: None,
        }
    }
}

impl SimulationPlan {
    /// Time between ticks.
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_millis)
    }
}

/// Serializable form of a [`Fault`]: `disconnect`, `timeout`, `oom` or a
/// status code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FaultSpec(pub Fault);

impl TryFrom<String> for FaultSpec {
    type Error = String;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        Fault::parse(&text)
            .map(FaultSpec)
            .ok_or_else(|| format!("unknown fault: {text}"))
    }
}

impl From<FaultSpec> for String {
    fn from(spec: FaultSpec) -> Self {
        match spec.0 {
            Fault::Status(status) => status.to_string(),
            Fault::Disconnect => "disconnect".into(),
            Fault::Timeout => "timeout".into(),
            Fault::OutOfMemory => "oom".into(),
        }
    }
}

/// What happened.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    /// Transport name.
    pub transport: String,
    /// Engine counters.
    pub uplink: UplinkStats,
    /// Service counters.
    pub service: ServiceStats,
    /// Reset requests raised (and acknowledged).
    pub resets: u32,
    /// Ticks that returned any other error.
    pub failed_ticks: u32,
    /// Remote updates delivered to the device, by feed.
    pub updates: BTreeMap<String, u32>,
    /// Connection state at the end, debug-formatted.
    pub final_state: String,
    /// Whether every published feed holds the device's last value.
    pub converged: bool,
}

/// Plays a plan.
pub fn simulate<T: Transport>(rig: &mut Rig<T>, plan: &SimulationPlan) -> SimulationReport {
    let mut report = SimulationReport {
        transport: rig.uplink.transport().name().to_string(),
        uplink: UplinkStats::default(),
        service: ServiceStats::default(),
        resets: 0,
        failed_ticks: 0,
        updates: BTreeMap::new(),
        final_state: String::new(),
        converged: false,
    };

    for key in &plan.subscribe {
        if let Err(err) = rig.uplink.subscribe(key) {
            tracing::warn!(feed = %key, error = %err, "subscribe failed");
        }
    }

    let mut snapshot = BTreeMap::new();
    for tick in 0..plan.ticks {
        for (at, fault) in &plan.faults {
            if *at == tick {
                rig.service.inject(fault.0);
            }
        }
        if let Some((start, length)) = plan.outage {
            if tick == start {
                rig.service.set_online(false);
            }
            if tick == start.saturating_add(length) {
                rig.service.set_online(true);
            }
        }
        if let Some(every) = plan.remote_write_every.filter(|n| *n > 0) {
            if tick > 0 && tick % every == 0 {
                for key in &plan.subscribe {
                    rig.remote_write(key, &format!("remote-{tick}"));
                }
            }
        }

        snapshot = (0..plan.feeds)
            .map(|i| (format!("sensor-{i}"), format!("{}.{}", tick, i)))
            .collect();
        rig.uplink.set_snapshot(snapshot.clone());

        match rig.step(plan.tick()) {
            Ok(_) => {}
            Err(SyncError::ResetRequested(reset)) => {
                tracing::warn!(reason = %reset.reason, tick, "reset requested");
                report.resets += 1;
                rig.uplink.acknowledge_reset();
            }
            Err(err) => {
                tracing::debug!(error = %err, tick, "tick failed");
                report.failed_ticks += 1;
            }
        }
        for key in rig.uplink.drain_updates().into_keys() {
            *report.updates.entry(key).or_default() += 1;
        }
    }

    report.uplink = rig.uplink.stats();
    report.service = rig.service.stats();
    report.final_state = format!("{:?}", rig.uplink.connection_state());
    report.converged = snapshot
        .iter()
        .all(|(key, value)| rig.remote_value(key).as_deref() == Some(value.as_str()));
    report
}
