use anyhow::Result;
use std::time::Duration;

use crate::courier::{Destination, Transport};

pub fn check_destinations(transport: Transport, dests: &[Destination]) -> Result<()> {
    for d in dests {
        anyhow::ensure!(!d.host.trim().is_empty(), "dispatch.{}: empty host", transport);
        anyhow::ensure!(!d.host.contains(char::is_whitespace), "dispatch.{}: host {:?} contains whitespace", transport, d.host);
        anyhow::ensure!(d.port > 0, "dispatch.{}: port 0 for {}", transport, d.host);
    }
    Ok(())
}

pub fn check_timing(interval: Duration, send_timeout: Duration) -> Result<()> {
    anyhow::ensure!(
        interval >= Duration::from_millis(100) && interval <= Duration::from_secs(60),
        "dispatch.interval_ms should be 100..60000"
    );
    anyhow::ensure!(!send_timeout.is_zero(), "dispatch.send_timeout_ms must be > 0");
    Ok(())
}
