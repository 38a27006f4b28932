//! `playbulbd`: drives one PlayBulb from line commands on stdin.
//!
//! Replies `OK` or `ERR <message>` to every command and prints host updates as
//! `UPDATE <unit> <fields>` lines. Logs go to stderr.

use std::fmt::Write as _;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use chrono::Local;
use clap::Parser;
use color_eyre::eyre::{eyre, Result};
use parking_lot::Mutex;
use playbulb::*;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::EnvFilter;

const HEARTBEAT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// File keeping the last commanded lamp state across restarts
    #[arg(short, long)]
    state: Option<PathBuf>,
    /// Lamp MAC address, overrides the configuration file
    #[arg(short, long)]
    address: Option<String>,
}

/// Prints host updates and keeps the state file current
struct StdoutSink {
    path: Option<PathBuf>,
    state: Mutex<RestoredState>,
}

impl StdoutSink {
    fn new(path: Option<PathBuf>, state: RestoredState) -> Self {
        StdoutSink {
            path,
            state: Mutex::new(state),
        }
    }

    fn persist(&self, state: &RestoredState) {
        let Some(path) = &self.path else {
            return;
        };
        match toml::to_string(state) {
            Ok(text) => {
                if let Err(e) = std::fs::write(path, text) {
                    warn!("Could not save state to {}: {}", path.display(), e);
                }
            }
            Err(e) => warn!("Could not encode state: {}", e),
        }
    }
}

impl StateSink for StdoutSink {
    fn update_device(&self, unit: Unit, update: &DeviceUpdate) {
        println!("UPDATE {} {}", unit, format_update(update));

        let mut state = self.state.lock();
        let before = state.clone();
        match unit {
            Unit::Switch => {
                if let Some(on) = update.power_on {
                    state.power_on = on;
                }
                if let Some(level) = update.level {
                    state.level = level;
                }
                if update.color.is_some() {
                    state.color = update.color;
                }
            }
            Unit::Effects => {
                if update.level.is_some() {
                    state.effect_selector = update.level;
                }
            }
            Unit::Speed => {
                if update.level.is_some() {
                    state.speed_level = update.level;
                }
            }
            Unit::Battery => {}
        }
        if *state != before {
            self.persist(&state);
        }
    }
}

fn format_update(update: &DeviceUpdate) -> String {
    let mut out = String::new();
    if let Some(on) = update.power_on {
        let _ = write!(out, " on={on}");
    }
    if let Some(level) = update.level {
        let _ = write!(out, " level={level}");
    }
    if let Some(color) = &update.color {
        let _ = write!(out, " color={}", color.to_json());
    }
    if let Some(timed_out) = update.timed_out {
        let _ = write!(out, " timed_out={timed_out}");
    }
    if let Some(battery) = update.battery {
        let _ = write!(out, " battery={battery}");
    }
    if let Some(icon) = update.icon {
        let _ = write!(out, " icon={}", icon.id());
    }
    if update.forced {
        out.push_str(" forced");
    }
    out.trim_start().to_string()
}

fn parse_level(what: &str, arg: Option<&str>) -> playbulb::Result<u8> {
    let arg = arg.ok_or_else(|| Error::InvalidCommand(format!("no {what} given")))?;
    arg.trim()
        .parse()
        .map_err(|_| Error::InvalidCommand(format!("invalid {what} '{arg}'")))
}

/// Parses one stdin line.
fn parse_command(line: &str) -> playbulb::Result<Command> {
    let (name, args) = match line.split_once(':') {
        Some((name, args)) => (name, Some(args)),
        None => (line, None),
    };

    match name {
        "on" => Ok(Command::On),
        "off" if args == Some("force") => Ok(Command::ForceOff),
        "off" => Ok(Command::Off),
        "color" => {
            // the payload is JSON and has colons of its own
            let (json, level) = args
                .and_then(|a| a.rsplit_once(':'))
                .ok_or_else(|| Error::InvalidCommand("use color:<json>:<level>".into()))?;
            Ok(Command::SetColor {
                color: ColorPayload::from_json(json)?,
                level: parse_level("brightness", Some(level))?,
            })
        }
        "level" => Ok(Command::SetLevel {
            level: parse_level("brightness", args)?,
            color: None,
        }),
        "effect" => {
            let arg = args.ok_or_else(|| Error::InvalidCommand("no effect given".into()))?;
            let selector = match arg.trim().parse() {
                Ok(selector) => selector,
                Err(_) => EFFECTS
                    .by_name(arg.trim())
                    .map(reconciler::selector_from_effect)
                    .ok_or_else(|| Error::InvalidCommand(format!("unknown effect '{arg}'")))?,
            };
            Ok(Command::SetEffect { selector })
        }
        "speed" => Ok(Command::SetSpeed {
            level: parse_level("speed", args)?,
        }),
        "battery" => Ok(Command::GetBatteryNow),
        "" => Err(Error::InvalidCommand("no command given".into())),
        other => Err(Error::InvalidCommand(format!("unknown command: {other}"))),
    }
}

/// Forwards lines from `input` read on a plain thread. A blocked read there
/// doesn't hold up runtime shutdown the way `tokio::io::stdin` does.
fn spawn_line_reader<R>(input: R) -> mpsc::UnboundedReceiver<std::io::Result<String>>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    thread::spawn(move || {
        for line in input.lines() {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match (&cli.config, &cli.address) {
        (Some(path), _) => Config::load(path)?,
        (None, Some(address)) => Config::new(address.clone()),
        (None, None) => return Err(eyre!("either --config or --address is required")),
    };
    if let Some(address) = &cli.address {
        config.address = address.clone();
    }
    config.validate()?;
    Ok(config)
}

fn load_state(path: &Path) -> Result<RestoredState> {
    if !path.exists() {
        debug!("No saved state at {}", path.display());
        return Ok(RestoredState::default());
    }
    Ok(toml::from_str(&std::fs::read_to_string(path)?)?)
}

#[tokio::main]
#[instrument]
async fn main() -> Result<()> {
    // Initialize color-eyre for pretty error reporting
    color_eyre::install()?;

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RUST_LOG")
                .unwrap_or_else(|_| EnvFilter::new(config.log_filter())),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();
    debug!("Parsed command line arguments");

    let saved = match &cli.state {
        Some(path) => load_state(path).unwrap_or_else(|e| {
            warn!("Ignoring unreadable state file {}: {}", path.display(), e);
            RestoredState::default()
        }),
        None => RestoredState::default(),
    };

    let sink = StdoutSink::new(cli.state.clone(), saved.clone());
    let mut lamp = PlayBulb::new(config, BtleTransport::new(), sink);
    if let Err(e) = lamp.restore(&saved) {
        warn!("Could not restore saved state: {}", e);
    }
    lamp.start()?;
    println!("OK");

    let mut lines = spawn_line_reader(std::io::BufReader::new(std::io::stdin()));
    let mut heartbeat = tokio::time::interval(HEARTBEAT);

    loop {
        tokio::select! {
            line = lines.recv() => {
                let Some(line) = line.transpose()? else {
                    info!("End of input");
                    break;
                };
                let reply = parse_command(line.trim()).and_then(|cmd| lamp.handle_command(cmd));
                match reply {
                    Ok(()) => println!("OK"),
                    Err(e) => println!("ERR {e}"),
                }
            }
            _ = heartbeat.tick() => {
                if let Err(e) = lamp.on_tick(Local::now()) {
                    error!("Heartbeat failed: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    lamp.stop().await;
    Ok(())
}
