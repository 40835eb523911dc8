//! Time-series telemetry over the InfluxDB line protocol.
//!
//! Each record is one short-lived HTTP POST written directly on a
//! `TcpStream`. A push counts as failed unless the server answers 2xx.

use anyhow::{bail, Context, Result};
use log::debug;
use std::fmt::Write as _;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::config::TelemetryConf;
use crate::device::{Digitizer, NUM_CHANNELS};
use crate::metadata::RunMetadata;
use crate::sink::EventSink;

const PUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct InfluxClient {
    host: String,
    port: u16,
    database: String,
    measurement: String,
    host_tag: String,
}

impl InfluxClient {
    pub fn new(conf: &TelemetryConf) -> Self {
        let host_tag = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown-host".to_string());
        Self {
            host: conf.host.clone(),
            port: conf.port,
            database: conf.database.clone(),
            measurement: conf.measurement.clone(),
            host_tag,
        }
    }

    /// Assemble one record: `measurement,host=..,device=.. <fields>`.
    pub fn line(&self, device_model: &str, fields: &str) -> String {
        format!(
            "{},host={},device={} {}",
            self.measurement, self.host_tag, device_model, fields
        )
    }

    /// POST one line-protocol record to `/write?db=..`.
    pub fn push(&self, line: &str) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port)
            .to_socket_addrs()
            .with_context(|| format!("cannot resolve {}:{}", self.host, self.port))?
            .next()
            .with_context(|| format!("no address for {}:{}", self.host, self.port))?;

        let mut stream = TcpStream::connect_timeout(&addr, PUSH_TIMEOUT)
            .with_context(|| format!("cannot connect to {addr}"))?;
        stream.set_read_timeout(Some(PUSH_TIMEOUT))?;
        stream.set_write_timeout(Some(PUSH_TIMEOUT))?;

        let request = format!(
            "POST /write?db={} HTTP/1.1\r\n\
             Host: {}:{}\r\n\
             Content-Type: text/plain; charset=utf-8\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\
             \r\n\
             {}",
            self.database,
            self.host,
            self.port,
            line.len(),
            line
        );
        debug!("telemetry push: {line}");
        stream.write_all(request.as_bytes())?;

        let mut reader = BufReader::new(stream);
        let mut status = String::new();
        reader.read_line(&mut status).context("no response from telemetry endpoint")?;
        let code: u16 = status
            .split_whitespace()
            .nth(1)
            .and_then(|c| c.parse().ok())
            .with_context(|| format!("malformed status line '{}'", status.trim()))?;
        if !(200..300).contains(&code) {
            bail!("telemetry endpoint answered {code}");
        }
        Ok(())
    }
}

/// Build the `temp_chN=..` field set, skipping unreadable sensors. `None`
/// when not a single sensor was readable.
pub fn temperature_fields(temps: &[Option<u32>]) -> Option<String> {
    let mut fields = String::new();
    for (ch, t) in temps.iter().enumerate() {
        if let Some(t) = t {
            if !fields.is_empty() {
                fields.push(',');
            }
            let _ = write!(fields, "temp_ch{ch}={:.1}", *t as f64);
        }
    }
    if fields.is_empty() {
        None
    } else {
        Some(fields)
    }
}

/// Probe which sensor index answers with a plausible temperature. Strict
/// pass first (0 < t < 150 C), then any successful read.
pub fn find_temp_channel<D: Digitizer>(device: &D) -> Option<u8> {
    for ch in 0..NUM_CHANNELS as u8 {
        if let Ok(t) = device.read_temperature(ch) {
            if t > 0 && t < 150 {
                return Some(ch);
            }
        }
    }
    (0..NUM_CHANNELS as u8).find(|&ch| device.read_temperature(ch).is_ok())
}

/// Dispatcher-facing sink: one push per sensor-read occasion (run start and
/// run end). A transport failure surfaces as a sink error, which takes the
/// sink out of the run.
pub struct TelemetrySink {
    client: InfluxClient,
    device_model: String,
}

impl TelemetrySink {
    pub fn new(client: InfluxClient, device_model: String) -> Self {
        Self {
            client,
            device_model,
        }
    }

    fn push_temps(&self, temps: &[Option<u32>]) -> Result<()> {
        let fields = match temperature_fields(temps) {
            Some(f) => f,
            None => bail!("no readable temperature sensors"),
        };
        self.client.push(&self.client.line(&self.device_model, &fields))
    }
}

impl EventSink for TelemetrySink {
    fn name(&self) -> &'static str {
        "telemetry"
    }

    fn on_run_start(&mut self, meta: &RunMetadata) -> Result<()> {
        self.push_temps(&meta.temp_start)
    }

    fn on_run_end(&mut self, meta: &RunMetadata) -> Result<()> {
        self.push_temps(&meta.temp_end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDigitizer;
    use std::io::Read;
    use std::net::TcpListener;
    use std::thread;

    fn conf_for(port: u16) -> TelemetryConf {
        TelemetryConf {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port,
            database: "testdb".to_string(),
            measurement: "digitizer".to_string(),
            interval_sec: 5,
        }
    }

    /// One-shot HTTP server answering every request with `status`.
    fn spawn_server(status: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf);
                let _ = stream.write_all(
                    format!("HTTP/1.1 {status}\r\nContent-Length: 0\r\n\r\n").as_bytes(),
                );
            }
        });
        port
    }

    #[test]
    fn fields_skip_unreadable_sensors() {
        let fields = temperature_fields(&[Some(38), None, Some(40)]).unwrap();
        assert_eq!(fields, "temp_ch0=38.0,temp_ch2=40.0");
        assert!(temperature_fields(&[None, None]).is_none());
    }

    #[test]
    fn line_carries_host_and_device_tags() {
        let client = InfluxClient::new(&conf_for(8086));
        let line = client.line("SIM730", "temp_ch0=38.0");
        assert!(line.starts_with("digitizer,host="));
        assert!(line.contains(",device=SIM730 temp_ch0=38.0"));
    }

    #[test]
    fn push_accepts_204() {
        let port = spawn_server("204 No Content");
        let client = InfluxClient::new(&conf_for(port));
        client.push("digitizer,host=h temp_ch0=38.0").unwrap();
    }

    #[test]
    fn push_rejects_server_errors() {
        let port = spawn_server("500 Internal Server Error");
        let client = InfluxClient::new(&conf_for(port));
        assert!(client.push("digitizer,host=h temp_ch0=38.0").is_err());
    }

    #[test]
    fn probe_finds_the_first_live_sensor() {
        let dev = SimDigitizer::open(0).unwrap().with_dead_sensors(0b0000_0011);
        assert_eq!(find_temp_channel(&dev), Some(2));

        let dead = SimDigitizer::open(0).unwrap().with_dead_sensors(0xff);
        assert_eq!(find_temp_channel(&dead), None);
    }
}
