//! Config command implementation.

use super::{read_file, CliError, Format};
use std::path::Path;
use uplink_engine::{OfflineRetry, UplinkConfig};

/// Loads and validates an uplink configuration file.
pub fn load(path: &Path) -> Result<UplinkConfig, CliError> {
    let text = read_file(path)?;
    Ok(UplinkConfig::from_json(&text)?)
}

/// Runs the config command: prints the effective configuration.
pub fn run(path: &Path, format: Format) -> Result<(), CliError> {
    let config = load(path)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&config)?),
        Format::Text => print!("{}", render(&config)),
    }
    Ok(())
}

fn render(config: &UplinkConfig) -> String {
    let retry = match config.offline_retry_delay {
        OfflineRetry::After(delay) => format!("after {:.1}s", delay.as_secs_f64()),
        OfflineRetry::Disabled => "disabled".to_string(),
    };
    let mut out = String::new();
    out.push_str(&format!("account:               {}\n", config.account));
    out.push_str(&format!("group:                 {}\n", config.group));
    out.push_str(&format!(
        "metadata:              {}\n",
        config.metadata.as_deref().unwrap_or("-")
    ));
    out.push_str(&format!("offline retry:         {retry}\n"));
    out.push_str(&format!(
        "max consecutive errors: {}\n",
        config.max_consecutive_errors
    ));
    out.push_str(&format!(
        "throttle:              {:.1}s cool-down, +{:.1}s per signal\n",
        config.throttle_cooldown.as_secs_f64(),
        config.throttle_step.as_secs_f64()
    ));
    out.push_str(&format!(
        "publish interval:      {:.1}s (at least {:.1}s per feed + 1s)\n",
        config.publish_interval.as_secs_f64(),
        config.min_interval_per_feed.as_secs_f64()
    ));
    out.push_str(&format!(
        "receive interval:      {:.1}s\n",
        config.receive_interval.as_secs_f64()
    ));
    out.push_str(&format!("chunk size:            {} bytes\n", config.chunk_size));
    out.push_str(&format!(
        "time sync on connect:  {}\n",
        config.sync_time_on_connect
    ));
    out
}
