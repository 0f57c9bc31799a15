use tokio::sync::watch;
use tracing::debug;

use trackit_proto::{LocationSample, Telemetry, TelemetryFormat};

use crate::policy::{AccuracyPolicy, SelectionPolicy};

#[derive(Debug, Clone, PartialEq)]
pub struct BestFix {
    pub sample: LocationSample,
    pub telemetry: Telemetry,
}

/// Fuses samples from any number of providers into one best fix.
///
/// The arbiter is the only writer of the published telemetry; readers get a
/// `watch` receiver and always see a whole snapshot.
pub struct LocationArbiter {
    policy: Box<dyn SelectionPolicy>,
    format: TelemetryFormat,
    best: Option<BestFix>,
    tx: watch::Sender<Option<Telemetry>>,
}

impl LocationArbiter {
    pub fn new(policy: Box<dyn SelectionPolicy>, format: TelemetryFormat) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { policy, format, best: None, tx }
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    pub fn best(&self) -> Option<&BestFix> {
        self.best.as_ref()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Telemetry>> {
        self.tx.subscribe()
    }

    /// Returns the new best fix when `sample` replaced it, `None` when rejected.
    pub fn observe(&mut self, sample: LocationSample) -> Option<BestFix> {
        self.policy.record(&sample);

        let wins = match &self.best {
            None => true,
            Some(cur) if cur.sample == sample => false,
            Some(cur) => self.policy.prefer(&cur.sample, &sample),
        };
        if !wins {
            debug!(
                provider = %sample.provider(),
                ts = sample.timestamp_ms(),
                "arbiter: sample rejected"
            );
            return None;
        }

        let telemetry = self.format.render(&sample);
        let fix = BestFix { sample, telemetry };
        self.tx.send_replace(Some(fix.telemetry.clone()));
        self.best = Some(fix.clone());
        Some(fix)
    }
}

impl Default for LocationArbiter {
    fn default() -> Self {
        Self::new(Box::new(AccuracyPolicy), TelemetryFormat::default())
    }
}
