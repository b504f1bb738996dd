//! CAN Pipeline CLI Application
//!
//! Command-line front end for the can-pipeline library:
//! - Describe the messages and signals of a DBC file
//! - Run the virtual generator and print (and optionally record) its frames
//! - Replay a recorded session with its original timing
//! - Send a message once or cyclically over the virtual bus

use anyhow::{Context, Result};
use can_pipeline::{DecodedFrame, PipelineConfig, Session, SignalDatabase, SignalValues, VirtualBus};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

mod config;
mod output;

use config::AppConfig;

/// CAN Pipeline - Acquire, decode, record and replay CAN frames
#[derive(Parser, Debug)]
#[command(name = "can-pipeline-cli")]
#[command(about = "Acquire, decode, record and replay CAN frames", long_about = None)]
#[command(version)]
struct Args {
    /// Path to configuration file (config.toml)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Path to DBC file (overrides the configuration file)
    #[arg(long, value_name = "FILE", global = true)]
    dbc: Option<PathBuf>,

    /// Print JSON lines instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the messages and signals of the DBC file
    Describe,

    /// Synthesize frames from the DBC file
    Generate {
        /// Generator period in milliseconds
        #[arg(long, default_value_t = 100)]
        period_ms: u64,

        /// Message to generate (can be repeated; default: all)
        #[arg(short, long = "message", value_name = "NAME")]
        messages: Vec<String>,

        /// Random values instead of counters
        #[arg(long)]
        random: bool,

        /// How long to run in seconds
        #[arg(long, default_value_t = 5.0)]
        duration: f64,

        /// Record into a new file in the configured log directory
        #[arg(long)]
        record: bool,

        /// Record into this file
        #[arg(long, value_name = "FILE", conflicts_with = "record")]
        record_to: Option<PathBuf>,
    },

    /// Replay a recorded session
    Replay {
        /// Recording to replay
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Playback speed multiplier
        #[arg(long, default_value_t = 1.0)]
        speed: f64,

        /// Restart from the beginning when the recording ends
        #[arg(long = "loop")]
        looping: bool,

        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<f64>,
    },

    /// Encode a message and send it over the virtual bus
    Send {
        /// Message name
        #[arg(value_name = "NAME")]
        message: String,

        /// Signal assignment (can be repeated: --set Speed=88)
        #[arg(long = "set", value_name = "SIGNAL=VALUE", value_parser = parse_assignment)]
        values: Vec<(String, f64)>,

        /// Send cyclically with this period in milliseconds
        #[arg(long)]
        period_ms: Option<u64>,

        /// How long to keep a cyclic job running in seconds
        #[arg(long, default_value_t = 2.0)]
        duration: f64,
    },
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(args.verbose, args.quiet);

    log::info!("CAN Pipeline CLI v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using pipeline library v{}", can_pipeline::VERSION);

    let app = config::load_or_default(args.config.as_deref())?;
    let json = args.json || app.output.json;
    let dbc = app.dbc_path(args.dbc.as_deref());

    match &args.command {
        Command::Describe => {
            let dbc = dbc.context("No DBC file given (use --dbc or set `dbc` in the config file)")?;
            describe(&dbc, json)
        }
        Command::Generate {
            period_ms,
            messages,
            random,
            duration,
            record,
            record_to,
        } => {
            let dbc = dbc.context("The generator needs a DBC file")?;
            let session = new_session(&app.pipeline, Some(&dbc), json)?;

            if let Some(path) = record_to {
                session
                    .start_recording(path)
                    .with_context(|| format!("Failed to create recording {:?}", path))?;
            } else if *record {
                let path = session.start_recording_in(&app.pipeline.log_dir)?;
                log::info!("Recording to {:?}", path);
            }

            session.start_virtual(*period_ms, messages.iter().cloned(), *random)?;
            run_for(&session, seconds(*duration)?, false);
            session.shutdown();
            Ok(())
        }
        Command::Replay {
            file,
            speed,
            looping,
            duration,
        } => {
            let session = new_session(&app.pipeline, dbc.as_deref(), json)?;
            let events = session
                .start_replay(file, *speed, *looping)
                .with_context(|| format!("Failed to replay {:?}", file))?;
            log::info!("Replaying {} events from {:?}", events, file);

            let limit = duration.map(seconds).transpose()?;
            run_for(&session, limit.unwrap_or(Duration::MAX), true);
            session.shutdown();
            Ok(())
        }
        Command::Send {
            message,
            values,
            period_ms,
            duration,
        } => {
            let dbc = dbc.context("Sending needs a DBC file")?;
            send(&app, &dbc, message, values, *period_ms, *duration, json)
        }
    }
}

/// Print the contents of a DBC file
fn describe(dbc: &Path, json: bool) -> Result<()> {
    let db = SignalDatabase::from_dbc_file(dbc)
        .with_context(|| format!("Failed to load DBC file: {:?}", dbc))?;
    let stats = db.stats();
    log::info!("{} messages, {} signals", stats.num_messages, stats.num_signals);

    for line in output::render_database(&db, json)? {
        println!("{}", line);
    }
    Ok(())
}

/// Send through one session while a second one on the same virtual bus prints what arrives
fn send(
    app: &AppConfig,
    dbc: &Path,
    message: &str,
    assignments: &[(String, f64)],
    period_ms: Option<u64>,
    duration: f64,
    json: bool,
) -> Result<()> {
    let bus = VirtualBus::new();
    let values: SignalValues = assignments.iter().cloned().collect();

    let monitor = Session::new(Arc::new(bus.clone()), app.pipeline.clone())?;
    monitor.load_dbc(dbc)?;
    monitor.set_observer(printer(json));
    monitor.connect(&app.bus)?;

    let sender = Session::new(Arc::new(bus), app.pipeline.clone())?;
    sender.load_dbc(dbc)?;
    sender.connect(&app.bus)?;

    match period_ms {
        Some(period_ms) => {
            sender.set_cyclic(message, &values, period_ms, true)?;
            thread::sleep(seconds(duration)?);
            sender.set_cyclic(message, &values, period_ms, false)?;
        }
        None => {
            sender.send_message(message, &values)?;
            // Give the monitor one receive interval to print it
            thread::sleep(app.pipeline.receive_timeout() * 2);
        }
    }

    let stats = sender.bus_stats();
    log::info!("Sent {} frames", stats.frames_sent);
    sender.shutdown();
    monitor.shutdown();
    Ok(())
}

fn new_session(pipeline: &PipelineConfig, dbc: Option<&Path>, json: bool) -> Result<Session> {
    let session = Session::new(Arc::new(VirtualBus::new()), pipeline.clone())?;
    if let Some(dbc) = dbc {
        let stats = session
            .load_dbc(dbc)
            .with_context(|| format!("Failed to load DBC file: {:?}", dbc))?;
        log::info!(
            "Signal database: {} messages, {} signals",
            stats.num_messages,
            stats.num_signals
        );
    }
    session.set_observer(printer(json));
    Ok(session)
}

fn printer(json: bool) -> impl Fn(&DecodedFrame) + Send + Sync + 'static {
    move |decoded: &DecodedFrame| match output::render_frame(decoded, json) {
        Ok(line) => println!("{}", line),
        Err(e) => log::warn!("Failed to render frame: {}", e),
    }
}

/// Block for `limit`, or until the session has no active source when `until_idle`
fn run_for(session: &Session, limit: Duration, until_idle: bool) {
    let started = Instant::now();
    while started.elapsed() < limit {
        if until_idle && session.active_source().is_none() {
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }
}

fn seconds(value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .with_context(|| format!("Invalid duration: {} seconds", value))
}

/// Parse a `SIGNAL=VALUE` assignment
fn parse_assignment(s: &str) -> std::result::Result<(String, f64), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected SIGNAL=VALUE, got '{}'", s))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing signal name in '{}'", s));
    }
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("invalid value '{}' for signal '{}'", value.trim(), name))?;
    if !value.is_finite() {
        return Err(format!("value for signal '{}' must be finite", name));
    }
    Ok((name.to_string(), value))
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assignment() {
        assert_eq!(
            parse_assignment("Speed=88.5").unwrap(),
            ("Speed".to_string(), 88.5)
        );
        assert_eq!(
            parse_assignment(" Rpm = 1500 ").unwrap(),
            ("Rpm".to_string(), 1500.0)
        );
        assert!(parse_assignment("Speed").is_err());
        assert!(parse_assignment("=1").is_err());
        assert!(parse_assignment("Speed=fast").is_err());
        assert!(parse_assignment("Speed=inf").is_err());
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "can-pipeline-cli",
            "--dbc",
            "vehicle.dbc",
            "send",
            "EngineData",
            "--set",
            "Speed=10",
            "--set",
            "Rpm=2000",
            "--period-ms",
            "100",
        ])
        .unwrap();

        match args.command {
            Command::Send {
                message,
                values,
                period_ms,
                ..
            } => {
                assert_eq!(message, "EngineData");
                assert_eq!(values.len(), 2);
                assert_eq!(period_ms, Some(100));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_record_flags_conflict() {
        let result = Args::try_parse_from([
            "can-pipeline-cli",
            "generate",
            "--record",
            "--record-to",
            "out.csv",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_duration() {
        assert!(seconds(-1.0).is_err());
        assert_eq!(seconds(0.5).unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn test_describe_missing_file() {
        assert!(describe(Path::new("/nonexistent/vehicle.dbc"), false).is_err());
    }
}
