pub mod sample;
pub mod telemetry;

pub use sample::{LocationSample, Provider, SampleError};
pub use telemetry::{Telemetry, TelemetryFormat};
