use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use time::macros::format_description;
use time::UtcOffset;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use trackit_nav::{doctor as nav_doctor, LocationArbiter, SampleSource, DEFAULT_BAUD};
use trackit_proto::{LocationSample, TelemetryFormat};
use trackit_uplink::{doctor as uplink_doctor, Destination, Dispatcher, DispatcherConfig, NetCourier, Transport};

#[derive(Debug, Parser)]
#[command(name = "trackit", version, about = "TrackIt - location fusion and telemetry forwarding")]
struct Cli {
    #[arg(long)]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the configuration without opening devices or sockets.
    Doctor,
    /// Read sources, track the best fix and forward it.
    Run,
}

#[derive(Debug, serde::Deserialize)]
struct Config {
    #[serde(default)]
    telemetry: TelemetryCfg,
    #[serde(default)]
    arbiter: ArbiterCfg,
    sources: Vec<SourceCfg>,
    dispatch: DispatchCfg,
}

#[derive(Debug, Default, serde::Deserialize)]
struct TelemetryCfg {
    /// e.g. "+02:00"; host local offset when absent.
    utc_offset: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct ArbiterCfg {
    policy: String,
    preferred_provider: Option<String>,
}

impl Default for ArbiterCfg {
    fn default() -> Self {
        Self { policy: "accuracy".into(), preferred_provider: None }
    }
}

#[derive(Debug, serde::Deserialize)]
struct SourceCfg {
    kind: String,
    path: String,
    baud: Option<u32>,
    #[serde(default)]
    pace: bool,
}

#[derive(Debug, serde::Deserialize)]
struct DispatchCfg {
    #[serde(default = "default_interval_ms")]
    interval_ms: u64,
    #[serde(default = "default_true")]
    exclusive: bool,
    #[serde(default = "default_send_timeout_ms")]
    send_timeout_ms: u64,
    autostart: Option<Transport>,
    #[serde(default)]
    udp: Vec<Destination>,
    #[serde(default)]
    tcp: Vec<Destination>,
}

impl DispatchCfg {
    fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    fn destinations(&self, transport: Transport) -> &[Destination] {
        match transport {
            Transport::Udp => &self.udp,
            Transport::Tcp => &self.tcp,
        }
    }
}

fn default_interval_ms() -> u64 { 1000 }
fn default_send_timeout_ms() -> u64 { 5000 }
fn default_true() -> bool { true }

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).context("read config")?;
    parse_config(&s)
}

fn parse_config(s: &str) -> Result<Config> {
    Ok(toml::from_str(s).context("parse config toml")?)
}

fn parse_offset(s: &str) -> Result<UtcOffset> {
    UtcOffset::parse(s.trim(), format_description!("[offset_hour sign:mandatory]:[offset_minute]"))
        .with_context(|| format!("telemetry.utc_offset {:?} (expected e.g. +02:00)", s))
}

// Resolved before the runtime starts: `time` only reads the local offset
// while the process is single-threaded.
fn telemetry_format(cfg: &TelemetryCfg) -> Result<TelemetryFormat> {
    match &cfg.utc_offset {
        Some(s) => Ok(TelemetryFormat::new(parse_offset(s)?)),
        None => Ok(TelemetryFormat::local()),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;
    let format = telemetry_format(&cfg.telemetry)?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg),
        Command::Run => rt.block_on(run(&cfg, format)),
    }
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    anyhow::ensure!(!cfg.sources.is_empty(), "no [[sources]] configured");
    for s in &cfg.sources {
        nav_doctor::check_source(&s.kind, &s.path, s.baud)?;
    }
    nav_doctor::build_policy(&cfg.arbiter.policy, cfg.arbiter.preferred_provider.as_deref())?;
    if let Some(s) = &cfg.telemetry.utc_offset {
        parse_offset(s)?;
    }

    let d = &cfg.dispatch;
    uplink_doctor::check_timing(d.interval(), d.send_timeout())?;
    for t in Transport::ALL {
        uplink_doctor::check_destinations(t, d.destinations(t))?;
    }
    anyhow::ensure!(!d.udp.is_empty() || !d.tcp.is_empty(), "no dispatch destinations configured");
    if let Some(t) = d.autostart {
        anyhow::ensure!(!d.destinations(t).is_empty(), "dispatch.autostart={} but no {} destinations", t, t);
    }
    if !d.exclusive {
        warn!("doctor: dispatch.exclusive=false, udp and tcp may send at the same time");
    }

    info!("doctor: OK");
    Ok(())
}

fn open_source(s: &SourceCfg) -> Result<SampleSource> {
    match s.kind.as_str() {
        "nmea-serial" => SampleSource::serial(&s.path, s.baud.unwrap_or(DEFAULT_BAUD)),
        "nmea-file" => SampleSource::file(&s.path),
        "replay" => SampleSource::replay(&s.path, s.pace),
        other => anyhow::bail!("unknown sources.kind: {}", other),
    }
}

async fn run(cfg: &Config, format: TelemetryFormat) -> Result<()> {
    info!("run: starting");

    let policy = nav_doctor::build_policy(&cfg.arbiter.policy, cfg.arbiter.preferred_provider.as_deref())?;
    let mut arbiter = LocationArbiter::new(policy, format);
    info!("run: arbiter policy={} utc_offset={}", arbiter.policy_name(), format.offset());

    // One task per source; the arbiter is the only consumer.
    let (sample_tx, mut sample_rx) = mpsc::channel::<LocationSample>(64);
    for s in &cfg.sources {
        let mut src = open_source(s)?;
        let tx = sample_tx.clone();
        let path = s.path.clone();
        tokio::spawn(async move {
            loop {
                match src.next_sample().await {
                    Ok(Some(sample)) => {
                        if tx.send(sample).await.is_err() { break; }
                    }
                    Ok(None) => {
                        info!("source {} ({}) exhausted", path, src.kind());
                        break;
                    }
                    Err(e) => {
                        warn!("source {} ({}) failed: {:#}", path, src.kind(), e);
                        break;
                    }
                }
            }
        });
    }
    drop(sample_tx);

    let d = &cfg.dispatch;
    let mut dispatcher = Dispatcher::new(
        Arc::new(NetCourier),
        arbiter.subscribe(),
        DispatcherConfig { exclusive: d.exclusive, send_timeout: d.send_timeout() },
    );
    if let Some(t) = d.autostart {
        if let Err(e) = dispatcher.start(t, d.destinations(t).to_vec(), d.interval()) {
            warn!("autostart {}: {}", t, e);
        }
    }

    let mut console = BufReader::new(tokio::io::stdin()).lines();
    let mut sources_open = true;
    let mut console_open = true;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            sample = sample_rx.recv(), if sources_open => match sample {
                Some(sample) => {
                    if let Some(fix) = arbiter.observe(sample) {
                        let t = &fix.telemetry;
                        info!(lat = t.lat, lon = t.lon, date = %t.date, time = %t.time, provider = %t.provider, "fix: {}", t.line);
                    }
                }
                None => {
                    info!("run: all sources finished; last fix is still forwarded");
                    sources_open = false;
                }
            },
            line = console.next_line(), if console_open => match line {
                Ok(Some(line)) => match parse_command(&line) {
                    Ok(Some(ConsoleCmd::Quit)) => break,
                    Ok(Some(cmd)) => apply_command(&mut dispatcher, d, cmd),
                    Ok(None) => {}
                    Err(e) => println!("error: {:#}", e),
                },
                Ok(None) => console_open = false,
                Err(e) => {
                    warn!("console read failed: {:#}", e);
                    console_open = false;
                }
            },
            _ = &mut ctrl_c => {
                info!("run: interrupted");
                break;
            }
        }
    }

    dispatcher.shutdown().await;
    info!("run: stopped");
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsoleCmd {
    Start(Transport),
    Stop(Transport),
    Toggle(Transport),
    Status,
    Health,
    Quit,
}

fn parse_command(line: &str) -> Result<Option<ConsoleCmd>> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let cmd = match words.as_slice() {
        [] => return Ok(None),
        ["status"] => ConsoleCmd::Status,
        ["health"] => ConsoleCmd::Health,
        ["quit"] | ["exit"] => ConsoleCmd::Quit,
        [t] => ConsoleCmd::Toggle(t.parse()?),
        [t, "start"] => ConsoleCmd::Start(t.parse()?),
        [t, "stop"] => ConsoleCmd::Stop(t.parse()?),
        _ => anyhow::bail!("usage: <udp|tcp> [start|stop] | status | health | quit"),
    };
    Ok(Some(cmd))
}

fn apply_command(dispatcher: &mut Dispatcher<NetCourier>, d: &DispatchCfg, cmd: ConsoleCmd) {
    let cmd = match cmd {
        ConsoleCmd::Toggle(t) if dispatcher.is_active(t) => ConsoleCmd::Stop(t),
        ConsoleCmd::Toggle(t) => ConsoleCmd::Start(t),
        other => other,
    };
    match cmd {
        ConsoleCmd::Start(t) => match dispatcher.start(t, d.destinations(t).to_vec(), d.interval()) {
            Ok(()) => println!("{}: sending", t),
            Err(e) => println!("rejected: {}", e),
        },
        ConsoleCmd::Stop(t) => {
            if dispatcher.stop(t) {
                println!("{}: stopped", t);
            } else {
                println!("{}: not active", t);
            }
        }
        ConsoleCmd::Status => {
            for c in dispatcher.status() {
                println!(
                    "{} active={} available={} interval={:?}",
                    c.transport,
                    c.active,
                    c.available,
                    dispatcher.interval(c.transport)
                );
            }
        }
        ConsoleCmd::Health => {
            for (t, dest, h) in dispatcher.health() {
                println!(
                    "{} {} sent={} failed={} consecutive_failures={} rtt_ms={:?} last_error={:?}",
                    t, dest, h.sent, h.failed, h.consecutive_failures, h.last_rtt_ms, h.last_error
                );
            }
        }
        ConsoleCmd::Toggle(_) | ConsoleCmd::Quit => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = include_str!("../../../config/trackit.toml");

    #[test]
    fn example_config_parses() {
        let cfg = parse_config(EXAMPLE).unwrap();
        assert_eq!(cfg.arbiter.policy, "accuracy");
        assert_eq!(cfg.dispatch.interval_ms, 1000);
        assert!(cfg.dispatch.exclusive);
        assert_eq!(cfg.dispatch.udp.len(), 3);
        assert_eq!(cfg.dispatch.udp[0], Destination::new("trackit1.ddns.net", 60001));
        assert_eq!(cfg.dispatch.tcp[2].port, 60000);
        assert_eq!(cfg.dispatch.autostart, Some(Transport::Udp));
        assert_eq!(cfg.sources[0].kind, "replay");
    }

    #[test]
    fn defaults_apply() {
        let cfg = parse_config(
            r#"
            [[sources]]
            kind = "nmea-serial"
            path = "/dev/ttyUSB0"

            [dispatch]
            tcp = [{ host = "10.0.0.1", port = 60000 }]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.arbiter.policy, "accuracy");
        assert_eq!(cfg.dispatch.interval(), Duration::from_secs(1));
        assert_eq!(cfg.dispatch.send_timeout(), Duration::from_secs(5));
        assert!(cfg.dispatch.exclusive);
        assert!(cfg.dispatch.udp.is_empty());
        assert!(cfg.telemetry.utc_offset.is_none());
    }

    #[test]
    fn serial_source_defaults_baud() {
        let cfg = parse_config(
            r#"
            [[sources]]
            kind = "nmea-serial"
            path = "/dev/ttyUSB0"

            [dispatch]
            udp = [{ host = "10.0.0.1", port = 60001 }]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.sources[0].baud, None);
        assert!(doctor(&cfg).is_ok());
    }

    #[test]
    fn doctor_rejects_autostart_without_destinations() {
        let cfg = parse_config(
            r#"
            [[sources]]
            kind = "nmea-serial"
            path = "/dev/ttyUSB0"
            baud = 9600

            [dispatch]
            autostart = "tcp"
            udp = [{ host = "10.0.0.1", port = 60001 }]
            "#,
        )
        .unwrap();
        assert!(doctor(&cfg).is_err());
    }

    #[test]
    fn offsets() {
        assert_eq!(parse_offset("+02:00").unwrap(), UtcOffset::from_hms(2, 0, 0).unwrap());
        assert_eq!(parse_offset("-05:30").unwrap(), UtcOffset::from_hms(-5, -30, 0).unwrap());
        assert!(parse_offset("CET").is_err());
    }

    #[test]
    fn console_commands() {
        assert_eq!(parse_command("udp start").unwrap(), Some(ConsoleCmd::Start(Transport::Udp)));
        assert_eq!(parse_command("  TCP stop ").unwrap(), Some(ConsoleCmd::Stop(Transport::Tcp)));
        assert_eq!(parse_command("tcp").unwrap(), Some(ConsoleCmd::Toggle(Transport::Tcp)));
        assert_eq!(parse_command("status").unwrap(), Some(ConsoleCmd::Status));
        assert_eq!(parse_command("exit").unwrap(), Some(ConsoleCmd::Quit));
        assert_eq!(parse_command("").unwrap(), None);
        assert!(parse_command("sms start").is_err());
        assert!(parse_command("udp start now").is_err());
    }
}
