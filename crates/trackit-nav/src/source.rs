use anyhow::{Context, Result};
use std::time::Duration;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, warn};

use trackit_proto::{LocationSample, Provider};

/// User-equivalent range error used to turn HDOP into a radius in metres.
const UERE_M: f32 = 5.0;

/// Baud rate used for `nmea-serial` sources that do not set one.
pub const DEFAULT_BAUD: u32 = 9600;

const MAX_REPLAY_GAP: Duration = Duration::from_secs(10);

/// Producer side of the arbiter: turns a device or file into samples.
pub enum SampleSource {
    Serial { reader: BufReader<SerialStream>, nmea: NmeaState },
    File { reader: BufReader<File>, nmea: NmeaState },
    Replay { reader: BufReader<File>, pace: bool, last_ts: Option<i64> },
}

impl SampleSource {
    pub fn serial(dev: &str, baud: u32) -> Result<Self> {
        let port = tokio_serial::new(dev, baud).open_native_async()
            .with_context(|| format!("open serial {}", dev))?;
        Ok(Self::Serial { reader: BufReader::new(port), nmea: NmeaState::default() })
    }

    pub fn file(path: &str) -> Result<Self> {
        let f = std::fs::File::open(path).with_context(|| format!("open nmea file {}", path))?;
        Ok(Self::File { reader: BufReader::new(File::from_std(f)), nmea: NmeaState::default() })
    }

    pub fn replay(path: &str, pace: bool) -> Result<Self> {
        let f = std::fs::File::open(path).with_context(|| format!("open replay file {}", path))?;
        Ok(Self::Replay { reader: BufReader::new(File::from_std(f)), pace, last_ts: None })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SampleSource::Serial { .. } => "nmea-serial",
            SampleSource::File { .. } => "nmea-file",
            SampleSource::Replay { .. } => "replay",
        }
    }

    /// Next valid sample, or `None` once a finite source is exhausted.
    ///
    /// Lines that are not valid UTF-8 (line noise, baud mismatch) are skipped;
    /// only I/O errors end the source.
    pub async fn next_sample(&mut self) -> Result<Option<LocationSample>> {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let kind = self.kind();
            match self {
                SampleSource::Serial { reader, nmea } => {
                    let n = reader.read_until(b'\n', &mut buf).await.context("read serial")?;
                    anyhow::ensure!(n > 0, "serial port closed");
                    let Some(line) = utf8_line(kind, &buf) else { continue };
                    if let Some(s) = nmea.feed(line.trim()) {
                        return Ok(Some(s));
                    }
                }
                SampleSource::File { reader, nmea } => {
                    let n = reader.read_until(b'\n', &mut buf).await.context("read nmea file")?;
                    if n == 0 {
                        // EOF: wait for the writer to append more
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        continue;
                    }
                    let Some(line) = utf8_line(kind, &buf) else { continue };
                    if let Some(s) = nmea.feed(line.trim()) {
                        return Ok(Some(s));
                    }
                }
                SampleSource::Replay { reader, pace, last_ts } => {
                    let n = reader.read_until(b'\n', &mut buf).await.context("read replay file")?;
                    if n == 0 {
                        return Ok(None);
                    }
                    let Some(line) = utf8_line(kind, &buf) else { continue };
                    let sample = match parse_replay_line(line) {
                        Ok(Some(s)) => s,
                        Ok(None) => continue,
                        Err(e) => {
                            warn!("replay: skipping line {:?}: {:#}", line.trim(), e);
                            continue;
                        }
                    };
                    if *pace {
                        if let Some(prev) = *last_ts {
                            let gap = sample.timestamp_ms().saturating_sub(prev).max(0) as u64;
                            tokio::time::sleep(Duration::from_millis(gap).min(MAX_REPLAY_GAP)).await;
                        }
                        *last_ts = Some(sample.timestamp_ms());
                    }
                    return Ok(Some(sample));
                }
            }
        }
    }
}

fn utf8_line<'a>(kind: &str, buf: &'a [u8]) -> Option<&'a str> {
    match std::str::from_utf8(buf) {
        Ok(line) => Some(line),
        Err(e) => {
            debug!("{}: skipping non-UTF-8 line ({} bytes): {}", kind, buf.len(), e);
            None
        }
    }
}

/// `provider,timestamp_ms,lat,lon[,accuracy]`. Blank lines and `#` comments yield `None`.
pub fn parse_replay_line(line: &str) -> Result<Option<LocationSample>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    anyhow::ensure!(parts.len() == 4 || parts.len() == 5, "expected 4 or 5 fields, got {}", parts.len());

    let provider: Provider = parts[0].parse()?;
    let ts: i64 = parts[1].parse().context("timestamp_ms")?;
    let lat: f64 = parts[2].parse().context("lat")?;
    let lon: f64 = parts[3].parse().context("lon")?;
    let accuracy = match parts.get(4) {
        Some(v) if !v.is_empty() => Some(v.parse::<f32>().context("accuracy")?),
        _ => None,
    };
    Ok(Some(LocationSample::new(provider, lat, lon, ts, accuracy)?))
}

/// NMEA sentence state: GGA supplies HDOP, RMC supplies position and time.
#[derive(Debug, Default)]
pub struct NmeaState {
    hdop: Option<f32>,
}

impl NmeaState {
    pub fn feed(&mut self, s: &str) -> Option<LocationSample> {
        if s.starts_with("$GNGGA") || s.starts_with("$GPGGA") {
            let parts: Vec<&str> = s.split(',').collect();
            if parts.len() > 8 {
                let fix_quality: u8 = parts[6].parse().unwrap_or(0);
                self.hdop = match parts[8].parse::<f32>() {
                    Ok(h) if fix_quality > 0 && h.is_finite() && h >= 0.0 => Some(h),
                    _ => None,
                };
            }
            return None;
        }

        if s.starts_with("$GNRMC") || s.starts_with("$GPRMC") {
            let parts: Vec<&str> = s.split(',').collect();
            if parts.len() <= 9 || parts[2] != "A" {
                return None;
            }
            let lat = parse_deg_min(parts[3], parts[4])?;
            let lon = parse_deg_min(parts[5], parts[6])?;
            let ts_ms = parse_rmc_time(parts[1], parts[9])
                .unwrap_or_else(|| (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64);
            let accuracy = self.hdop.map(|h| h * UERE_M);

            return match LocationSample::new(Provider::Gps, lat, lon, ts_ms, accuracy) {
                Ok(sample) => Some(sample),
                Err(e) => {
                    debug!("nmea: dropping RMC: {}", e);
                    None
                }
            };
        }

        None
    }
}

fn parse_deg_min(v: &str, hemi: &str) -> Option<f64> {
    if v.is_empty() { return None; }
    // lat: ddmm.mmmm, lon: dddmm.mmmm
    let dot = v.find('.')?;
    let deg_len = if dot > 4 { 3 } else { 2 };
    let deg: f64 = v.get(..deg_len)?.parse().ok()?;
    let min: f64 = v.get(deg_len..)?.parse().ok()?;
    let mut out = deg + (min / 60.0);
    if hemi == "S" || hemi == "W" { out = -out; }
    Some(out)
}

// hhmmss[.sss] + ddmmyy, UTC
fn parse_rmc_time(hms: &str, dmy: &str) -> Option<i64> {
    if hms.len() < 6 || dmy.len() != 6 { return None; }
    let hour: u8 = hms.get(0..2)?.parse().ok()?;
    let minute: u8 = hms.get(2..4)?.parse().ok()?;
    let second: u8 = hms.get(4..6)?.parse().ok()?;
    let millis: u16 = match hms.get(6..) {
        Some(frac) if frac.starts_with('.') && frac.len() > 1 => {
            let digits = frac.get(1..frac.len().min(4))?;
            if !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let scale = 10u16.pow(3 - digits.len() as u32);
            digits.parse::<u16>().ok()? * scale
        }
        _ => 0,
    };

    let day: u8 = dmy.get(0..2)?.parse().ok()?;
    let month: u8 = dmy.get(2..4)?.parse().ok()?;
    let year: i32 = 2000 + dmy.get(4..6)?.parse::<i32>().ok()?;

    let date = Date::from_calendar_date(year, Month::try_from(month).ok()?, day).ok()?;
    let time = Time::from_hms_milli(hour, minute, second, millis).ok()?;
    let dt = PrimitiveDateTime::new(date, time).assume_utc();
    Some((dt.unix_timestamp_nanos() / 1_000_000) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GGA: &str = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";
    const RMC: &str = "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A";

    #[test]
    fn rmc_after_gga_carries_hdop_accuracy() {
        let mut nmea = NmeaState::default();
        assert!(nmea.feed(GGA).is_none());
        let s = nmea.feed(RMC).expect("rmc yields sample");
        assert_eq!(s.provider(), Provider::Gps);
        assert!((s.lat() - 48.1173).abs() < 1e-4);
        assert!((s.lon() - 11.516_666).abs() < 1e-4);
        assert!((s.accuracy_m().unwrap() - 4.5).abs() < 1e-4);
        // 1994-03-23 12:35:19 UTC
        assert_eq!(s.timestamp_ms(), 764_426_119_000);
    }

    #[test]
    fn rmc_without_gga_has_unknown_accuracy() {
        let mut nmea = NmeaState::default();
        let s = nmea.feed(RMC).unwrap();
        assert_eq!(s.accuracy_m(), None);
    }

    #[test]
    fn gga_without_fix_clears_hdop() {
        let mut nmea = NmeaState::default();
        nmea.feed(GGA);
        nmea.feed("$GPGGA,123520,4807.038,N,01131.000,E,0,00,0.9,545.4,M,46.9,M,,*47");
        assert_eq!(nmea.feed(RMC).unwrap().accuracy_m(), None);
    }

    #[test]
    fn void_or_empty_rmc_is_ignored() {
        let mut nmea = NmeaState::default();
        assert!(nmea.feed("$GPRMC,123519,V,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A").is_none());
        assert!(nmea.feed("$GPRMC,123519,A,,,,,022.4,084.4,230394,003.1,W*6A").is_none());
        assert!(nmea.feed("$GPGSV,3,1,11,03,03,111,00*74").is_none());
    }

    #[test]
    fn southern_western_hemispheres_are_negative() {
        assert!((parse_deg_min("3342.000", "S").unwrap() + 33.7).abs() < 1e-9);
        assert!((parse_deg_min("07030.000", "W").unwrap() + 70.5).abs() < 1e-9);
    }

    #[test]
    fn rmc_time_keeps_fractional_seconds() {
        assert_eq!(parse_rmc_time("000000.25", "010100"), Some(946_684_800_250));
        assert_eq!(parse_rmc_time("xx", "010100"), None);
        assert_eq!(parse_rmc_time("120000", "311399"), None);
        // multi-byte noise in the fraction must not split a char
        assert_eq!(parse_rmc_time("123519.éé", "230394"), None);
        assert_eq!(parse_rmc_time("123519.+5", "230394"), None);
    }

    #[test]
    fn rmc_with_garbled_time_keeps_position() {
        let mut nmea = NmeaState::default();
        let s = nmea
            .feed("$GPRMC,123519.éé,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A")
            .expect("position still valid");
        assert!((s.lat() - 48.1173).abs() < 1e-4);
        assert_ne!(s.timestamp_ms(), 764_426_119_000);
    }

    #[test]
    fn replay_lines() {
        let s = parse_replay_line("network, 1700000000000, 40.4168, -3.7038, 25").unwrap().unwrap();
        assert_eq!(s.provider(), Provider::Network);
        assert_eq!(s.timestamp_ms(), 1_700_000_000_000);
        assert_eq!(s.accuracy_m(), Some(25.0));

        let s = parse_replay_line("gps,0,1.0,2.0").unwrap().unwrap();
        assert_eq!(s.accuracy_m(), None);

        assert!(parse_replay_line("   ").unwrap().is_none());
        assert!(parse_replay_line("# provider,ts,lat,lon").unwrap().is_none());
        assert!(parse_replay_line("gps,0,95.0,2.0").is_err());
        assert!(parse_replay_line("wifi,0,1.0,2.0").is_err());
        assert!(parse_replay_line("gps,0,1.0").is_err());
    }

    #[tokio::test]
    async fn replay_source_skips_bad_lines_and_ends() {
        let path = std::env::temp_dir().join(format!("trackit-replay-{}.csv", std::process::id()));
        std::fs::write(&path, "# header\ngps,1000,10,10,5\nbogus\nnetwork,31000,11,11,50\n").unwrap();

        let mut src = SampleSource::replay(path.to_str().unwrap(), false).unwrap();
        assert_eq!(src.kind(), "replay");
        let a = src.next_sample().await.unwrap().unwrap();
        let b = src.next_sample().await.unwrap().unwrap();
        assert_eq!(a.provider(), Provider::Gps);
        assert_eq!(b.provider(), Provider::Network);
        assert!(src.next_sample().await.unwrap().is_none());

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn nmea_file_skips_non_utf8_lines() {
        let path = std::env::temp_dir().join(format!("trackit-noise-{}.nmea", std::process::id()));
        let mut data = b"$GPGSV,\xff\xfe garbage\n".to_vec();
        data.extend_from_slice(RMC.as_bytes());
        data.push(b'\n');
        std::fs::write(&path, &data).unwrap();

        let mut src = SampleSource::file(path.to_str().unwrap()).unwrap();
        let s = src.next_sample().await.unwrap().expect("rmc after noise");
        assert_eq!(s.timestamp_ms(), 764_426_119_000);

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn replay_skips_non_utf8_lines() {
        let path = std::env::temp_dir().join(format!("trackit-noise-{}.csv", std::process::id()));
        std::fs::write(&path, b"gps,1000,10,10,5\n\xc3\x28,0,1,1\nnetwork,2000,11,11\n").unwrap();

        let mut src = SampleSource::replay(path.to_str().unwrap(), false).unwrap();
        assert_eq!(src.next_sample().await.unwrap().unwrap().provider(), Provider::Gps);
        assert_eq!(src.next_sample().await.unwrap().unwrap().provider(), Provider::Network);
        assert!(src.next_sample().await.unwrap().is_none());

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn paced_replay_waits_between_samples() {
        let path = std::env::temp_dir().join(format!("trackit-paced-{}.csv", std::process::id()));
        std::fs::write(&path, "gps,0,10,10\ngps,150,10,10\ngps,100,10,10\n").unwrap();

        let mut src = SampleSource::replay(path.to_str().unwrap(), true).unwrap();
        let start = std::time::Instant::now();
        src.next_sample().await.unwrap();
        src.next_sample().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(150));
        // going backwards in time does not wait
        let third = src.next_sample().await.unwrap().unwrap();
        assert_eq!(third.timestamp_ms(), 100);

        std::fs::remove_file(&path).ok();
    }
}
