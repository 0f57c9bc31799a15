use std::collections::HashMap;

use trackit_proto::{LocationSample, Provider};

/// Samples more than this far apart in time are decided on age alone.
pub const SIGNIFICANT_AGE_MS: i64 = 120_000;

/// Decides whether a candidate replaces the current best fix.
pub trait SelectionPolicy: Send {
    /// Called once per observed sample, before any comparison.
    fn record(&mut self, _sample: &LocationSample) {}

    fn prefer(&mut self, current: &LocationSample, candidate: &LocationSample) -> bool;

    fn name(&self) -> &'static str;
}

/// Age window first, then accuracy, then recency and provider change.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccuracyPolicy;

impl SelectionPolicy for AccuracyPolicy {
    fn prefer(&mut self, current: &LocationSample, candidate: &LocationSample) -> bool {
        let time_delta = candidate.timestamp_ms().saturating_sub(current.timestamp_ms());
        if time_delta > SIGNIFICANT_AGE_MS {
            return true;
        }
        if time_delta < -SIGNIFICANT_AGE_MS {
            return false;
        }

        let accuracy_delta = accuracy_delta(candidate, current);
        let is_newer = time_delta > 0;

        if accuracy_delta < 0.0 {
            true
        } else if is_newer && accuracy_delta <= 0.0 {
            true
        } else {
            is_newer && candidate.provider() != current.provider()
        }
    }

    fn name(&self) -> &'static str {
        "accuracy"
    }
}

// Unknown accuracy counts as +inf; two unknowns compare equal instead of NaN.
fn accuracy_delta(candidate: &LocationSample, current: &LocationSample) -> f32 {
    match (candidate.accuracy_m(), current.accuracy_m()) {
        (None, None) => 0.0,
        _ => candidate.accuracy_or_worst() - current.accuracy_or_worst(),
    }
}

/// Whichever provider reported most recently wins; ties go to `preferred`.
#[derive(Debug, Clone)]
pub struct LatestProviderPolicy {
    preferred: Provider,
    last_seen: HashMap<Provider, i64>,
}

impl LatestProviderPolicy {
    pub fn new(preferred: Provider) -> Self {
        Self { preferred, last_seen: HashMap::new() }
    }

    fn leader(&self) -> Option<Provider> {
        let mut leader: Option<(Provider, i64)> = None;
        for (&provider, &ts) in &self.last_seen {
            leader = match leader {
                None => Some((provider, ts)),
                Some((_, best)) if ts > best => Some((provider, ts)),
                Some((_, best)) if ts == best && provider == self.preferred => Some((provider, ts)),
                keep => keep,
            };
        }
        leader.map(|(p, _)| p)
    }
}

impl Default for LatestProviderPolicy {
    fn default() -> Self {
        Self::new(Provider::Network)
    }
}

impl SelectionPolicy for LatestProviderPolicy {
    fn record(&mut self, sample: &LocationSample) {
        self.last_seen.insert(sample.provider(), sample.timestamp_ms());
    }

    fn prefer(&mut self, _current: &LocationSample, candidate: &LocationSample) -> bool {
        self.leader() == Some(candidate.provider())
    }

    fn name(&self) -> &'static str {
        "latest-provider"
    }
}
