use anyhow::Result;
use std::path::Path;

use crate::policy::{AccuracyPolicy, LatestProviderPolicy, SelectionPolicy};
use crate::source::DEFAULT_BAUD;
use trackit_proto::Provider;

pub fn check_source(kind: &str, path: &str, baud: Option<u32>) -> Result<()> {
    anyhow::ensure!(!path.is_empty(), "sources.path missing for {}", kind);
    match kind {
        "nmea-serial" => {
            let baud = baud.unwrap_or(DEFAULT_BAUD);
            anyhow::ensure!(baud >= 4800 && baud <= 921_600, "sources.baud {} out of range for {}", baud, path);
        }
        "nmea-file" | "replay" => {
            anyhow::ensure!(Path::new(path).is_file(), "source file not found: {}", path);
        }
        other => anyhow::bail!("unknown sources.kind: {}", other),
    }
    Ok(())
}

/// Builds the configured policy; also used by doctor to reject unknown names.
pub fn build_policy(name: &str, preferred: Option<&str>) -> Result<Box<dyn SelectionPolicy>> {
    match name {
        "accuracy" => Ok(Box::new(AccuracyPolicy)),
        "latest-provider" => {
            let preferred: Provider = match preferred {
                Some(p) => p.parse()?,
                None => Provider::Network,
            };
            Ok(Box::new(LatestProviderPolicy::new(preferred)))
        }
        other => anyhow::bail!("unknown arbiter.policy: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_names() {
        assert_eq!(build_policy("accuracy", None).unwrap().name(), "accuracy");
        assert_eq!(build_policy("latest-provider", Some("gps")).unwrap().name(), "latest-provider");
        assert!(build_policy("latest-provider", Some("wifi")).is_err());
        assert!(build_policy("fused", None).is_err());
    }

    #[test]
    fn source_checks() {
        assert!(check_source("nmea-serial", "/dev/ttyUSB0", Some(9600)).is_ok());
        // run opens the port at DEFAULT_BAUD when none is configured
        assert!(check_source("nmea-serial", "/dev/ttyUSB0", None).is_ok());
        assert!(check_source("nmea-serial", "/dev/ttyUSB0", Some(300)).is_err());
        assert!(check_source("replay", "/definitely/not/here.csv", None).is_err());
        assert!(check_source("nmea-file", "", None).is_err());
        assert!(check_source("gpsd", "localhost", None).is_err());
    }
}
