pub mod courier;
pub mod doctor;
mod error;

pub use courier::{Courier, Destination, NetCourier, Transport};
pub use error::ControlError;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use trackit_proto::Telemetry;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkHealth {
    pub sent: u64,
    pub failed: u64,
    pub consecutive_failures: u32,
    pub last_rtt_ms: Option<u32>,
    pub last_error: Option<String>,
}

type HealthMap = Arc<Mutex<HashMap<(Transport, Destination), LinkHealth>>>;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Only one transport may send at a time.
    pub exclusive: bool,
    pub send_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { exclusive: true, send_timeout: Duration::from_secs(5) }
    }
}

/// Display state of one transport control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlState {
    pub transport: Transport,
    pub active: bool,
    /// False while the other transport holds the exclusive slot.
    pub available: bool,
}

/// Outcome of one tick's fan-out.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub delivered: Vec<Destination>,
    pub failed: Vec<(Destination, String)>,
    pub skipped: bool,
}

impl TickReport {
    fn skipped() -> Self {
        Self { skipped: true, ..Self::default() }
    }
}

struct Session<C> {
    ctx: Arc<TickContext<C>>,
    interval: Duration,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Periodically pushes the latest telemetry line to every destination of
/// each active transport.
pub struct Dispatcher<C: Courier> {
    courier: Arc<C>,
    telemetry: watch::Receiver<Option<Telemetry>>,
    cfg: DispatcherConfig,
    sessions: HashMap<Transport, Session<C>>,
    health: HealthMap,
}

impl<C: Courier> Dispatcher<C> {
    pub fn new(courier: Arc<C>, telemetry: watch::Receiver<Option<Telemetry>>, cfg: DispatcherConfig) -> Self {
        Self {
            courier,
            telemetry,
            cfg,
            sessions: HashMap::new(),
            health: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn is_active(&self, transport: Transport) -> bool {
        self.sessions.contains_key(&transport)
    }

    /// Starts (or restarts, resetting the schedule) periodic sending. Must be
    /// called from within a Tokio runtime.
    pub fn start(&mut self, transport: Transport, destinations: Vec<Destination>, interval: Duration) -> Result<(), ControlError> {
        let other = transport.other();
        if self.cfg.exclusive && self.is_active(other) {
            return Err(ControlError::Exclusive { requested: transport, active: other });
        }
        if destinations.is_empty() {
            return Err(ControlError::NoDestinations(transport));
        }
        if interval.is_zero() {
            return Err(ControlError::ZeroInterval);
        }

        if let Some(old) = self.sessions.remove(&transport) {
            old.cancel.cancel();
            debug!("{}: restarting session", transport);
        }

        let ctx = Arc::new(TickContext {
            transport,
            destinations: destinations.into(),
            courier: Arc::clone(&self.courier),
            telemetry: self.telemetry.clone(),
            send_timeout: self.cfg.send_timeout,
            health: Arc::clone(&self.health),
        });
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_session(Arc::clone(&ctx), interval, cancel.clone()));

        info!(
            "{}: sending every {}ms to {} destination(s)",
            transport,
            interval.as_millis(),
            ctx.destinations.len()
        );
        self.sessions.insert(transport, Session { ctx, interval, cancel, handle });
        Ok(())
    }

    /// Returns false if the transport was not active.
    pub fn stop(&mut self, transport: Transport) -> bool {
        match self.sessions.remove(&transport) {
            Some(session) => {
                session.cancel.cancel();
                info!("{}: sending stopped", transport);
                true
            }
            None => false,
        }
    }

    pub fn status(&self) -> Vec<ControlState> {
        Transport::ALL
            .iter()
            .map(|&t| ControlState {
                transport: t,
                active: self.is_active(t),
                available: !(self.cfg.exclusive && self.is_active(t.other())),
            })
            .collect()
    }

    pub fn interval(&self, transport: Transport) -> Option<Duration> {
        self.sessions.get(&transport).map(|s| s.interval)
    }

    pub fn destinations(&self, transport: Transport) -> Option<&[Destination]> {
        self.sessions.get(&transport).map(|s| &s.ctx.destinations[..])
    }

    /// Per-destination counters, ordered by transport then destination.
    pub fn health(&self) -> Vec<(Transport, Destination, LinkHealth)> {
        let map = self.health.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<_> = map
            .iter()
            .map(|((t, d), h)| (*t, d.clone(), h.clone()))
            .collect();
        out.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
        out
    }

    /// Stops every session and waits for their loops to exit.
    pub async fn shutdown(&mut self) {
        for (transport, session) in self.sessions.drain() {
            session.cancel.cancel();
            if let Err(e) = session.handle.await {
                warn!("{}: session task failed: {}", transport, e);
            }
        }
    }
}

impl<C: Courier> Drop for Dispatcher<C> {
    fn drop(&mut self) {
        for session in self.sessions.values() {
            session.cancel.cancel();
        }
    }
}

// Fixed delay: the next wait starts only after the tick has finished, so ticks
// of one transport never overlap. Cancellation wins every race.
async fn run_session<C: Courier>(ctx: Arc<TickContext<C>>, interval: Duration, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ctx.tick() => {}
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!("{}: session loop exited", ctx.transport);
}

struct TickContext<C> {
    transport: Transport,
    destinations: Arc<[Destination]>,
    courier: Arc<C>,
    telemetry: watch::Receiver<Option<Telemetry>>,
    send_timeout: Duration,
    health: HealthMap,
}

impl<C: Courier> TickContext<C> {
    async fn tick(&self) -> TickReport {
        let payload: Bytes = match &*self.telemetry.borrow() {
            Some(t) if !t.line.is_empty() => t.payload(),
            _ => return TickReport::skipped(),
        };

        let mut sends = JoinSet::new();
        for dest in self.destinations.iter().cloned() {
            let courier = Arc::clone(&self.courier);
            let payload = payload.clone();
            let transport = self.transport;
            let timeout = self.send_timeout;

            sends.spawn(async move {
                let start = Instant::now();
                let res = match tokio::time::timeout(timeout, courier.deliver(transport, &dest, &payload)).await {
                    Ok(r) => r,
                    Err(_) => Err(anyhow::anyhow!("timed out after {}ms", timeout.as_millis())),
                };
                (dest, res, start.elapsed())
            });
        }

        let mut report = TickReport::default();
        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok((dest, Ok(()), rtt)) => {
                    let rtt_ms = rtt.as_millis() as u32;
                    debug!("{}: sent {} bytes to {} ({}ms)", self.transport, payload.len(), dest, rtt_ms);
                    self.record(&dest, Ok(rtt_ms));
                    report.delivered.push(dest);
                }
                Ok((dest, Err(e), _)) => {
                    let cause = format!("{:#}", e);
                    warn!("{}: send to {} failed: {}", self.transport, dest, cause);
                    self.record(&dest, Err(cause.clone()));
                    report.failed.push((dest, cause));
                }
                Err(e) => warn!("{}: send task did not complete: {}", self.transport, e),
            }
        }
        report
    }

    fn record(&self, dest: &Destination, outcome: Result<u32, String>) {
        let mut map = self.health.lock().unwrap_or_else(|e| e.into_inner());
        let h = map.entry((self.transport, dest.clone())).or_default();
        match outcome {
            Ok(rtt_ms) => {
                h.sent += 1;
                h.consecutive_failures = 0;
                h.last_rtt_ms = Some(rtt_ms);
            }
            Err(cause) => {
                h.failed += 1;
                h.consecutive_failures += 1;
                h.last_error = Some(cause);
            }
        }
    }
}
