pub mod arbiter;
pub mod doctor;
pub mod policy;
pub mod source;

pub use arbiter::{BestFix, LocationArbiter};
pub use policy::{AccuracyPolicy, LatestProviderPolicy, SelectionPolicy};
pub use source::{SampleSource, DEFAULT_BAUD};
