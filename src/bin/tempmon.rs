//! Standalone temperature telemetry daemon.
//!
//! Runs next to (or instead of) an acquisition: polls the board's sensors on
//! a fixed interval and pushes one line-protocol record per cycle. A failed
//! push ends the loop — acquisition, if any, is unaffected because this is a
//! separate process.

use clap::Parser;
use crossbeam_channel::tick;
use log::{debug, error, info, LevelFilter};
use simplelog::{ColorChoice, Config as LogConfig, TermLogger, TerminalMode};
use std::process;
use std::time::Duration;

use wavedaq::config::TelemetryConf;
use wavedaq::telemetry::{find_temp_channel, temperature_fields, InfluxClient};
use wavedaq::{Digitizer, SimDigitizer, NUM_CHANNELS};

#[derive(Parser, Debug)]
#[command(name = "tempmon", version, about = "Push digitizer temperatures to InfluxDB")]
struct Cli {
    #[arg(long = "influx-host", default_value = "127.0.0.1")]
    host: String,

    #[arg(long = "influx-port", default_value_t = 8086)]
    port: u16,

    #[arg(long = "influx-db", default_value = "testdb")]
    database: String,

    #[arg(long, default_value = "digitizer")]
    measurement: String,

    /// Seconds between pushes
    #[arg(long, default_value_t = 5)]
    interval: u64,

    /// Push a single record and exit
    #[arg(long)]
    once: bool,

    #[arg(long)]
    verbose: bool,

    /// Device link index
    #[arg(long, default_value_t = 0)]
    link: u8,
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    TermLogger::init(
        level,
        LogConfig::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )
    .expect("logger init");

    let device = match SimDigitizer::open(cli.link) {
        Ok(d) => d,
        Err(e) => {
            error!("failed to open digitizer: {e}");
            process::exit(1);
        }
    };
    let model = match device.board_info() {
        Ok(info) => info.model,
        Err(e) => {
            error!("failed to identify board: {e}");
            process::exit(1);
        }
    };

    let probe = match find_temp_channel(&device) {
        Some(ch) => ch,
        None => {
            error!("could not find a readable temperature channel");
            process::exit(1);
        }
    };
    debug!("temperature probe channel: {probe}");

    let conf = TelemetryConf {
        enabled: true,
        host: cli.host,
        port: cli.port,
        database: cli.database,
        measurement: cli.measurement,
        interval_sec: cli.interval,
    };
    let client = InfluxClient::new(&conf);
    let ticker = tick(Duration::from_secs(conf.interval_sec));

    loop {
        let temps: Vec<Option<u32>> = (0..NUM_CHANNELS as u8)
            .map(|ch| device.read_temperature(ch).ok().filter(|&t| t < 200))
            .collect();
        let fields = match temperature_fields(&temps) {
            Some(f) => f,
            None => {
                error!("no valid temperature channels read");
                process::exit(1);
            }
        };

        if let Err(e) = client.push(&client.line(&model, &fields)) {
            error!("telemetry push failed: {e:#}");
            process::exit(1);
        }
        info!("temperatures sent: {fields}");

        if cli.once {
            break;
        }
        let _ = ticker.recv();
    }
}
