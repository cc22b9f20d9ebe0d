//! Classify command implementation.

use super::{CliError, Format};
use serde::Serialize;
use std::time::Duration;
use uplink_engine::{classify, TransportError};

/// One row of the classification table.
#[derive(Debug, Serialize)]
pub struct ClassRow {
    /// Example failure.
    pub error: String,
    /// Category it falls in.
    pub kind: String,
    /// Action the engine takes.
    pub action: String,
    /// Whether it counts toward the circuit breaker.
    pub counted: bool,
}

/// Builds the table from one example of every transport failure.
pub fn table() -> Vec<ClassRow> {
    let samples = [
        TransportError::from_status(429, "too many requests"),
        TransportError::from_status(404, "feed not found"),
        TransportError::Connection("link dropped".into()),
        TransportError::Malformed("truncated body".into()),
        TransportError::Timeout(Duration::from_secs(30)),
        TransportError::from_status(503, "service unavailable"),
        TransportError::ResourceExhausted("heap".into()),
        TransportError::from_status(401, "bad key"),
        TransportError::Protocol("unsupported request".into()),
        TransportError::Other("unexpected".into()),
    ];
    samples
        .into_iter()
        .map(|err| {
            let error = err.to_string();
            let event = classify(err);
            ClassRow {
                error,
                kind: event.kind.to_string(),
                action: format!("{:?}", event.kind.default_action()),
                counted: event.retry_budget_consumed,
            }
        })
        .collect()
}

/// Runs the classify command.
pub fn run(format: Format) -> Result<(), CliError> {
    let rows = table();
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        Format::Text => {
            println!("{:<40} {:<20} {:<18} counted", "error", "kind", "action");
            for row in rows {
                println!(
                    "{:<40} {:<20} {:<18} {}",
                    row.error, row.kind, row.action, row.counted
                );
            }
        }
    }
    Ok(())
}
