//! liveosc CLI - The `liveosc` command.
//!
//! Talks to the device script from a terminal: one-shot verbs print their
//! reply and exit, streaming commands print until interrupted.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use liveosc_core::{
    Bridge, CallArgs, Config, CountArgs, GetArgs, ObserveArgs, OscType, RecvTimeoutError, SetArgs,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How long streaming loops wait before re-checking for Ctrl+C.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(name = "liveosc")]
#[command(version, about = "OSC bridge to a live device script", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (default: ~/.config/liveosc/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Host running the device script
    #[arg(long)]
    host: Option<String>,

    /// Port the device script listens on
    #[arg(long)]
    send_port: Option<u16>,

    /// Port to receive replies on
    #[arg(long)]
    receive_port: Option<u16>,

    /// Reply timeout for get/call/count in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Read a property
    Get { path: String, property: String },
    /// Write a property
    Set {
        path: String,
        property: String,
        /// Parsed as integer, then float, else string
        value: String,
    },
    /// Invoke a method
    Call { path: String, method: String },
    /// Count the entries of a list property
    Count { path: String, property: String },
    /// Print every change of a property
    Observe { path: String, property: String },
    /// Print the held notes of a MIDI device
    Notes {
        device: i32,
        /// Print raw note events instead of held notes
        #[arg(long)]
        raw: bool,
    },
    /// Print service id announcements
    Listen,
    /// Create a default configuration file
    Init,
    /// Show the configuration file path
    ConfigPath,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            let path = Config::create_default_config_file()?;
            println!("Created default config at: {}", path.display());
            return Ok(());
        }
        Commands::ConfigPath => {
            let path = Config::config_path()?;
            println!("{}", path.display());
            return Ok(());
        }
        _ => {}
    }

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load_or_default(),
    };

    // Apply CLI overrides
    if let Some(host) = cli.host {
        config.peer.host = host;
    }
    if let Some(port) = cli.send_port {
        config.ports.send = port;
    }
    if let Some(port) = cli.receive_port {
        config.ports.receive = port;
    }
    if let Some(ms) = cli.timeout_ms {
        config.timeouts.reply_ms = ms;
    }

    let bridge = Bridge::bind(&config)
        .with_context(|| format!("Failed to bind receive port {}", config.ports.receive))?;
    let timeout = config.reply_timeout();

    match cli.command {
        Commands::Get { path, property } => {
            let value = bridge.get(GetArgs::new(path, property))?.wait_timeout(timeout)?;
            println!("{}", format_value(&value));
        }
        Commands::Set {
            path,
            property,
            value,
        } => {
            bridge.set(SetArgs::new(path, property, parse_value(&value)))?;
        }
        Commands::Call { path, method } => {
            let values = bridge.call(CallArgs::new(path, method))?.wait_timeout(timeout)?;
            println!("{}", format_values(&values));
        }
        Commands::Count { path, property } => {
            let value = bridge
                .count(CountArgs::new(path, property))?
                .wait_timeout(timeout)?;
            println!("{}", format_value(&value));
        }
        Commands::Observe { path, property } => {
            let shutdown = install_shutdown_flag()?;
            let subscription = bridge.observe(ObserveArgs::new(path, property))?;
            log::info!("Observing {} (Ctrl+C to stop)", subscription.callback_id());
            while !shutdown.load(Ordering::Relaxed) {
                match subscription.recv_timeout(POLL_INTERVAL) {
                    Ok(values) => println!("{}", format_values(&values)),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        log::warn!("Subscription closed");
                        break;
                    }
                }
            }
        }
        Commands::Notes { device, raw } => {
            let shutdown = install_shutdown_flag()?;
            if raw {
                let events = bridge.note_events(device);
                while !shutdown.load(Ordering::Relaxed) {
                    match events.recv_timeout(POLL_INTERVAL) {
                        Ok(event) => println!(
                            "ch={} pitch={} vel={} cc={}:{} bend={}",
                            event.midi_channel,
                            event.pitch,
                            event.velocity,
                            event.control_change_controller,
                            event.control_change_value,
                            event.pitch_bend
                        ),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            } else {
                let mut notes = bridge.active_notes(device);
                while !shutdown.load(Ordering::Relaxed) {
                    match notes.recv_timeout(POLL_INTERVAL) {
                        Ok(snapshot) => {
                            let held: Vec<String> =
                                snapshot.pitches().map(|p| p.to_string()).collect();
                            println!("[{}]", held.join(" "));
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            }
        }
        Commands::Listen => {
            let shutdown = install_shutdown_flag()?;
            let ids = bridge.watch_service_id();
            while !shutdown.load(Ordering::Relaxed) {
                match ids.recv_timeout(POLL_INTERVAL) {
                    Ok(id) => println!("{}", id),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        }
        Commands::Init | Commands::ConfigPath => unreachable!("handled before binding"),
    }

    bridge.shutdown();
    Ok(())
}

/// Flag raised by SIGINT or SIGTERM.
fn install_shutdown_flag() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&flag))
        .context("Failed to install SIGINT handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag))
        .context("Failed to install SIGTERM handler")?;
    Ok(flag)
}

fn parse_value(raw: &str) -> OscType {
    if let Ok(n) = raw.parse::<i32>() {
        OscType::Int(n)
    } else if let Ok(f) = raw.parse::<f32>() {
        OscType::Float(f)
    } else {
        OscType::String(raw.to_string())
    }
}

fn format_value(value: &OscType) -> String {
    match value {
        OscType::Int(n) => n.to_string(),
        OscType::Long(n) => n.to_string(),
        OscType::Float(f) => f.to_string(),
        OscType::Double(d) => d.to_string(),
        OscType::String(s) => s.clone(),
        OscType::Bool(b) => b.to_string(),
        OscType::Nil => "nil".to_string(),
        other => format!("{:?}", other),
    }
}

fn format_values(values: &[OscType]) -> String {
    values.iter().map(format_value).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("3"), OscType::Int(3));
        assert_eq!(parse_value("0.5"), OscType::Float(0.5));
        assert_eq!(parse_value("tempo"), OscType::String("tempo".to_string()));
    }

    #[test]
    fn test_format_values() {
        let values = vec![OscType::Int(1), OscType::String("a".to_string()), OscType::Nil];
        assert_eq!(format_values(&values), "1 a nil");
    }

    #[test]
    fn test_cli_parses_overrides() {
        let cli = Cli::try_parse_from([
            "liveosc",
            "--send-port",
            "7000",
            "get",
            "live_set",
            "tempo",
        ])
        .unwrap();
        assert_eq!(cli.send_port, Some(7000));
        assert!(matches!(cli.command, Commands::Get { .. }));
    }
}
