use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Gps,
    Network,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Gps => "gps",
            Provider::Network => "network",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = SampleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gps" => Ok(Provider::Gps),
            "network" => Ok(Provider::Network),
            other => Err(SampleError::UnknownProvider(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SampleError {
    #[error("unknown provider: {0:?}")]
    UnknownProvider(String),
    #[error("latitude out of range: {0}")]
    Latitude(f64),
    #[error("longitude out of range: {0}")]
    Longitude(f64),
    #[error("accuracy must be finite and non-negative: {0}")]
    Accuracy(f32),
    #[error("timestamp not representable: {0} ms")]
    Timestamp(i64),
}

/// One reading from a location provider.
///
/// Validated on construction and immutable afterwards; the arbiter only ever
/// swaps which sample it holds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationSample {
    provider: Provider,
    lat: f64,
    lon: f64,
    timestamp_ms: i64,
    accuracy_m: Option<f32>,
}

impl LocationSample {
    pub fn new(
        provider: Provider,
        lat: f64,
        lon: f64,
        timestamp_ms: i64,
        accuracy_m: Option<f32>,
    ) -> Result<Self, SampleError> {
        if !lat.is_finite() || lat.abs() > 90.0 {
            return Err(SampleError::Latitude(lat));
        }
        if !lon.is_finite() || lon.abs() > 180.0 {
            return Err(SampleError::Longitude(lon));
        }
        if let Some(acc) = accuracy_m {
            if !acc.is_finite() || acc < 0.0 {
                return Err(SampleError::Accuracy(acc));
            }
        }
        OffsetDateTime::from_unix_timestamp_nanos(timestamp_ms as i128 * 1_000_000)
            .map_err(|_| SampleError::Timestamp(timestamp_ms))?;

        Ok(Self { provider, lat, lon, timestamp_ms, accuracy_m })
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn lat(&self) -> f64 {
        self.lat
    }

    pub fn lon(&self) -> f64 {
        self.lon
    }

    /// Provider-assigned epoch milliseconds. Only meaningful relative to other samples.
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    pub fn accuracy_m(&self) -> Option<f32> {
        self.accuracy_m
    }

    /// Accuracy radius with "unknown" mapped to +inf, so it never compares as better.
    pub fn accuracy_or_worst(&self) -> f32 {
        self.accuracy_m.unwrap_or(f32::INFINITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_coordinates() {
        assert_eq!(
            LocationSample::new(Provider::Gps, 91.0, 0.0, 0, None),
            Err(SampleError::Latitude(91.0))
        );
        assert_eq!(
            LocationSample::new(Provider::Gps, 0.0, -180.5, 0, None),
            Err(SampleError::Longitude(-180.5))
        );
        assert!(LocationSample::new(Provider::Gps, f64::NAN, 0.0, 0, None).is_err());
    }

    #[test]
    fn rejects_negative_accuracy() {
        assert_eq!(
            LocationSample::new(Provider::Network, 1.0, 1.0, 0, Some(-1.0)),
            Err(SampleError::Accuracy(-1.0))
        );
        assert!(LocationSample::new(Provider::Network, 1.0, 1.0, 0, Some(f32::INFINITY)).is_err());
    }

    #[test]
    fn rejects_unrepresentable_timestamp() {
        assert!(LocationSample::new(Provider::Gps, 0.0, 0.0, i64::MAX, None).is_err());
    }

    #[test]
    fn unknown_accuracy_is_worst() {
        let s = LocationSample::new(Provider::Network, 40.4, -3.7, 1_000, None).unwrap();
        assert_eq!(s.accuracy_or_worst(), f32::INFINITY);
        let s = LocationSample::new(Provider::Gps, 40.4, -3.7, 1_000, Some(4.5)).unwrap();
        assert_eq!(s.accuracy_or_worst(), 4.5);
    }

    #[test]
    fn provider_parses_case_insensitively() {
        assert_eq!("GPS".parse::<Provider>().unwrap(), Provider::Gps);
        assert_eq!(" network ".parse::<Provider>().unwrap(), Provider::Network);
        assert!("fused".parse::<Provider>().is_err());
        assert_eq!(Provider::Network.to_string(), "network");
    }
}
