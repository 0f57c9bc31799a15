use bytes::Bytes;
use serde::Serialize;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

use crate::sample::{LocationSample, Provider};

/// Display/wire snapshot of the current best fix.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Telemetry {
    pub lat: f64,
    pub lon: f64,
    pub date: String,
    pub time: String,
    pub provider: Provider,
    pub line: String,
}

impl Telemetry {
    /// UTF-8 bytes of the line; one copy shared by every send in a tick.
    pub fn payload(&self) -> Bytes {
        Bytes::from(self.line.clone())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TelemetryFormat {
    offset: UtcOffset,
}

impl TelemetryFormat {
    pub fn new(offset: UtcOffset) -> Self {
        Self { offset }
    }

    pub fn utc() -> Self {
        Self::new(UtcOffset::UTC)
    }

    /// Host local offset. `time` refuses to read it once other threads exist,
    /// in which case UTC is used.
    pub fn local() -> Self {
        Self::new(UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC))
    }

    pub fn offset(&self) -> UtcOffset {
        self.offset
    }

    pub fn render(&self, sample: &LocationSample) -> Telemetry {
        let ts = OffsetDateTime::from_unix_timestamp_nanos(sample.timestamp_ms() as i128 * 1_000_000)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH)
            .to_offset(self.offset);

        let date = ts
            .format(format_description!("[year]-[month]-[day]"))
            .unwrap_or_default();
        let time = ts
            .format(format_description!("[hour]:[minute]:[second]"))
            .unwrap_or_default();

        let line = format!(
            "Lat: {}, Lon: {}, Date: {}, Time: {}, Provider: {}",
            sample.lat(),
            sample.lon(),
            date,
            time,
            sample.provider()
        );

        Telemetry {
            lat: sample.lat(),
            lon: sample.lon(),
            date,
            time,
            provider: sample.provider(),
            line,
        }
    }
}

impl Default for TelemetryFormat {
    fn default() -> Self {
        Self::utc()
    }
}
