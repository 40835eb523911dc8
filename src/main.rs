use clap::Parser;
use log::{error, info, warn, LevelFilter};
use simplelog::{ColorChoice, Config as LogConfig, TermLogger, TerminalMode};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use wavedaq::{
    acquisition, calibration, config::load_conf, trigger, AggregateTextSink, BoardParams,
    DeviceSession, Dispatcher, Hdf5Sink, PerEventTextSink, RunConfig, RunMetadata, RunStats,
    SimDigitizer, SinkConfig, TelemetryConf, TelemetrySink, TriggerMode,
};

#[derive(Parser, Debug)]
#[command(
    name = "wavedaq",
    version,
    about = "Waveform digitizer acquisition controller"
)]
struct Cli {
    /// Number of events to acquire
    #[arg(short = 'n', long = "num-events", default_value_t = 10)]
    num_events: u32,

    /// Trigger mode
    #[arg(short = 'm', long = "trigger", value_enum, default_value_t = TriggerMode::SelfThreshold)]
    trigger: TriggerMode,

    /// Device link index
    #[arg(long, default_value_t = 0)]
    link: u8,

    /// Target channel
    #[arg(short = 'c', long, default_value_t = 0)]
    channel: u8,

    /// Record length in samples
    #[arg(short = 'r', long = "record-len", default_value_t = 1024)]
    record_len: u32,

    /// Post-trigger percentage
    #[arg(long, default_value_t = 50)]
    post: u32,

    /// Threshold delta below the pedestal, in ADC counts
    #[arg(short = 't', long = "delta", default_value_t = 120)]
    delta: u32,

    /// Append every event to this text file
    #[arg(long)]
    txt: Option<PathBuf>,

    /// Write one text file per event into this directory
    #[arg(long)]
    txtdir: Option<PathBuf>,

    /// Append run records to this HDF5 file
    #[arg(long)]
    hdf5: Option<PathBuf>,

    /// Run tag (defaults to the trigger-mode name)
    #[arg(long)]
    tag: Option<String>,

    /// TOML config file with board and telemetry settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// More chatter on stderr
    #[arg(long)]
    verbose: bool,
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

    let conf = match load_conf(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!("{e:#}");
            process::exit(2);
        }
    };
    let board = match conf.board.resolve() {
        Ok(b) => b,
        Err(e) => {
            error!("{e}");
            process::exit(2);
        }
    };

    let sinks = SinkConfig {
        hdf5: cli.hdf5.clone(),
        txt: cli.txt.clone(),
        txt_dir: cli.txtdir.clone(),
        telemetry: conf.telemetry.enabled,
    };
    let config = match RunConfig::new(
        cli.num_events,
        cli.trigger,
        cli.link,
        cli.channel,
        cli.record_len,
        cli.post,
        cli.delta,
        cli.tag.clone(),
        sinks,
    ) {
        Ok(c) => c,
        Err(e) => {
            error!("{e}");
            process::exit(2);
        }
    };

    info!(
        "n={} trig={} link={} ch={} rec_len={} post={}% delta={} tag={}",
        config.num_events,
        config.trigger,
        config.link,
        config.channel,
        config.record_len,
        config.post_trigger,
        config.delta,
        config.tag
    );

    if let Some(dir) = &config.sinks.txt_dir {
        if let Err(e) = std::fs::create_dir_all(dir) {
            warn!("could not create directory '{}' ({e})", dir.display());
        }
    }

    match acquire(&config, &board, &conf.telemetry) {
        Ok(stats) => {
            println!("Collected {} events.", stats.acquired);
        }
        Err(e) => {
            error!("{e:#}");
            process::exit(1);
        }
    }
}

fn acquire(
    config: &RunConfig,
    board: &BoardParams,
    telemetry: &TelemetryConf,
) -> anyhow::Result<RunStats> {
    let mut session = DeviceSession::<SimDigitizer>::open(config.link)?;
    session.configure(config, board)?;

    let cal = calibration::measure_pedestal(&mut session, config.channel)?;
    let plan = trigger::plan(config.trigger, config.channel, cal.pedestal, config.delta);
    trigger::configure(&mut session, config.trigger, &plan)?;
    if config.trigger == TriggerMode::SelfThreshold {
        info!(
            "ped(ch{})={}  thr_abs={}  delta={}  pair_mask={:#04x}",
            config.channel, cal.pedestal, plan.threshold, config.delta, plan.armed_mask
        );
    } else {
        info!(
            "ped(ch{})={}  (delta={}; self-trigger not used in this mode)",
            config.channel, cal.pedestal, config.delta
        );
    }

    let temp_start = session.read_temperatures();
    let mut meta = RunMetadata::new(config.clone(), cal, plan, temp_start);
    let mut dispatcher = build_dispatcher(config, telemetry, &session);

    // Cancellation token read once per loop iteration; wiring an interrupt
    // to it is the embedding's job.
    let cancel = Arc::new(AtomicBool::new(false));
    let stats = acquisition::run(&mut session, config, &mut meta, &mut dispatcher, &cancel)?;

    session.close()?;
    Ok(stats)
}

fn build_dispatcher(
    config: &RunConfig,
    telemetry: &TelemetryConf,
    session: &DeviceSession<SimDigitizer>,
) -> Dispatcher {
    let mut dispatcher = Dispatcher::new();

    if let Some(path) = &config.sinks.hdf5 {
        match Hdf5Sink::open(path) {
            Ok(sink) => dispatcher.register(Box::new(sink)),
            Err(e) => warn!("hdf5 sink skipped: {e:#}"),
        }
    }
    if let Some(path) = &config.sinks.txt {
        dispatcher.register(Box::new(AggregateTextSink::new(path.clone())));
    }
    if let Some(dir) = &config.sinks.txt_dir {
        dispatcher.register(Box::new(PerEventTextSink::new(dir.clone())));
    }
    if config.sinks.telemetry {
        let client = wavedaq::InfluxClient::new(telemetry);
        let model = session.board_info().model.clone();
        dispatcher.register(Box::new(TelemetrySink::new(client, model)));
    }

    if dispatcher.is_empty() {
        info!("no sinks configured; events will only be counted");
    }
    dispatcher
}
