//! Simulate command implementation.
//!
//! Plays a [`SimulationPlan`] against the reference service over one
//! channel and prints the resulting report.

use super::{config, read_file, CliError, Format};
use std::path::PathBuf;
use uplink_engine::RemoteLog;
use uplink_service::{Fault, ServiceConfig};
use uplink_testkit::{
    simulate, uplink_config, Channel, FaultSpec, Rig, SimulationPlan, SimulationReport, TEST_KEY,
};

/// Options of the simulate command.
#[derive(Debug, Clone)]
pub struct SimulateArgs {
    /// Channel to simulate.
    pub channel: Channel,
    /// Plan file; command-line options override its fields.
    pub plan: Option<PathBuf>,
    /// Uplink configuration file.
    pub config: Option<PathBuf>,
    /// Ticks to run.
    pub ticks: Option<u32>,
    /// Feeds to publish.
    pub feeds: Option<usize>,
    /// Faults as `TICK:FAULT`.
    pub faults: Vec<String>,
    /// Outage as `START:LENGTH`.
    pub outage: Option<String>,
    /// Service write budget per minute.
    pub write_limit: Option<u32>,
    /// Feed that receives the engine's warnings; overrides the configuration.
    pub log_feed: Option<String>,
    /// Queue of captured warnings to forward.
    pub log: Option<RemoteLog>,
}

/// Parses `TICK:FAULT`, e.g. `12:disconnect` or `30:503`.
pub fn parse_fault(spec: &str) -> Result<(u32, FaultSpec), CliError> {
    let (tick, fault) = split_pair(spec)?;
    let tick = parse_number(tick, spec)?;
    let fault = Fault::parse(fault)
        .ok_or_else(|| CliError::Argument(format!("unknown fault in {spec}")))?;
    Ok((tick, FaultSpec(fault)))
}

/// Parses `START:LENGTH` in ticks.
pub fn parse_outage(spec: &str) -> Result<(u32, u32), CliError> {
    let (start, length) = split_pair(spec)?;
    Ok((parse_number(start, spec)?, parse_number(length, spec)?))
}

fn split_pair(spec: &str) -> Result<(&str, &str), CliError> {
    spec.split_once(':')
        .ok_or_else(|| CliError::Argument(format!("expected A:B, got {spec}")))
}

fn parse_number(text: &str, spec: &str) -> Result<u32, CliError> {
    text.trim()
        .parse()
        .map_err(|_| CliError::Argument(format!("bad number {text:?} in {spec}")))
}

/// Builds the plan from the plan file and the command-line overrides.
pub fn build_plan(args: &SimulateArgs) -> Result<SimulationPlan, CliError> {
    let mut plan = match &args.plan {
        Some(path) => serde_json::from_str(&read_file(path)?)?,
        None => SimulationPlan::default(),
    };
    if let Some(ticks) = args.ticks {
        plan.ticks = ticks;
    }
    if let Some(feeds) = args.feeds {
        plan.feeds = feeds;
    }
    for spec in &args.faults {
        plan.faults.push(parse_fault(spec)?);
    }
    if let Some(outage) = &args.outage {
        plan.outage = Some(parse_outage(outage)?);
    }
    Ok(plan)
}

/// Runs the simulation and returns its report.
pub fn execute(args: &SimulateArgs) -> Result<SimulationReport, CliError> {
    let plan = build_plan(args)?;
    let mut uplink = match &args.config {
        Some(path) => config::load(path)?,
        None => uplink_config(),
    };
    if let Some(feed) = &args.log_feed {
        uplink = uplink.with_log_feed(feed.clone());
        uplink.validate()?;
    }
    let mut service = ServiceConfig::new(uplink.account.clone(), TEST_KEY);
    if let Some(limit) = args.write_limit {
        service = service.with_write_limit(limit, std::time::Duration::from_secs(60));
    }

    tracing::info!(
        channel = %args.channel,
        ticks = plan.ticks,
        feeds = plan.feeds,
        faults = plan.faults.len(),
        "simulation starting"
    );
    let forward_logs = uplink.log_feed.is_some();
    let mut rig = Rig::channel(args.channel, uplink, service);
    if let (true, Some(log)) = (forward_logs, &args.log) {
        rig.uplink.attach_log(log.clone());
    }
    Ok(simulate(&mut rig, &plan))
}

/// Runs the simulate command.
pub fn run(args: &SimulateArgs, format: Format) -> Result<(), CliError> {
    let report = execute(args)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        Format::Text => print_report(&report),
    }
    Ok(())
}

fn print_report(report: &SimulationReport) {
    let uplink = &report.uplink;
    println!("Simulation over {}", report.transport);
    println!();
    println!("Ticks:            {}", uplink.ticks);
    println!("Publishes:        {}", uplink.publishes);
    println!("Values sent:      {}", uplink.feeds_sent);
    println!("Updates received: {}", uplink.updates_received);
    println!("Rate limits:      {}", uplink.rate_limits);
    println!("Reconnects:       {}", uplink.reconnects);
    println!("Offline entries:  {}", uplink.offline_entries);
    println!("Notes received:   {}", uplink.notes_received);
    println!("Log lines sent:   {}", uplink.logs_forwarded);
    println!("Resets:           {}", report.resets);
    println!("Failed ticks:     {}", report.failed_ticks);
    for (kind, count) in &uplink.errors_by_kind {
        println!("  {kind}: {count}");
    }
    println!();
    println!(
        "Service:          {} writes, {} rejected",
        report.service.writes, report.service.rejected_writes
    );
    for (feed, count) in &report.updates {
        println!("Updates for {feed}: {count}");
    }
    println!("Final state:      {}", report.final_state);
    if report.converged {
        println!("✓ Remote feeds match the last snapshot");
    } else {
        println!("✗ Remote feeds lag the last snapshot");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args(channel: Channel) -> SimulateArgs {
        SimulateArgs {
            channel,
            plan: None,
            config: None,
            ticks: None,
            feeds: None,
            faults: Vec::new(),
            outage: None,
            write_limit: None,
            log_feed: None,
            log: None,
        }
    }

    #[test]
    fn parses_fault_and_outage_specs() {
        assert_eq!(
            parse_fault("12:disconnect").unwrap(),
            (12, FaultSpec(Fault::Disconnect))
        );
        assert_eq!(parse_fault("3:503").unwrap(), (3, FaultSpec(Fault::Status(503))));
        assert!(parse_fault("3").is_err());
        assert!(parse_fault("x:timeout").is_err());
        assert!(parse_fault("3:gremlins").is_err());

        assert_eq!(parse_outage("40:20").unwrap(), (40, 20));
        assert!(parse_outage("40-20").is_err());
    }

    #[test]
    fn overrides_apply_on_top_of_plan_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{"ticks": 500, "feeds": 2, "faults": [[5, "timeout"]]}"#)
            .unwrap();
        let args = SimulateArgs {
            plan: Some(file.path().to_path_buf()),
            ticks: Some(30),
            faults: vec!["8:oom".into()],
            ..args(Channel::Http)
        };
        let plan = build_plan(&args).unwrap();
        assert_eq!(plan.ticks, 30);
        assert_eq!(plan.feeds, 2);
        assert_eq!(plan.faults.len(), 2);
        assert_eq!(plan.faults[1], (8, FaultSpec(Fault::OutOfMemory)));
    }

    #[test]
    fn short_run_reports_per_channel() {
        for channel in Channel::ALL {
            let args = SimulateArgs {
                ticks: Some(20),
                ..args(channel)
            };
            let report = execute(&args).unwrap();
            assert_eq!(report.transport, channel.to_string());
            assert_eq!(report.uplink.ticks, 20);
            assert_eq!(report.resets, 0);
        }
    }

    #[test]
    fn captured_warnings_go_to_the_log_feed() {
        let log = RemoteLog::new();
        log.push("WARN simulated brownout");
        let args = SimulateArgs {
            ticks: Some(3),
            log_feed: Some("device-log".into()),
            log: Some(log.clone()),
            ..args(Channel::Http)
        };
        let report = execute(&args).unwrap();
        assert!(report.uplink.logs_forwarded >= 1);
        assert!(log.is_empty());

        let bad = SimulateArgs {
            log_feed: Some("bad feed".into()),
            ..self::args(Channel::Http)
        };
        assert!(matches!(execute(&bad), Err(CliError::Config(_))));
    }

    #[test]
    fn tight_budget_shows_rate_limits() {
        let args = SimulateArgs {
            ticks: Some(40),
            write_limit: Some(5),
            ..args(Channel::Http)
        };
        let report = execute(&args).unwrap();
        assert!(report.uplink.rate_limits >= 1);
        assert!(report.service.rejected_writes >= 1);
    }
}
