//! CLI Entry Point for stage-control
//!
//! Provides command-line interface for:
//! - Running the interactive control panel against a serial stage (or a
//!   simulated one)
//! - Saving the stage position to device EEPROM in one shot (for OS
//!   shutdown/sleep scripts)
//! - Listing serial ports and printing the effective configuration
//!
//! # Usage
//!
//! ```bash
//! stage-control run --port /dev/ttyUSB0
//! stage-control run --simulate
//! stage-control run --load
//! stage-control save --port COM5
//! stage-control ports
//! stage-control config
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stage_control::config::StageConfig;
use stage_control::console::{describe_event, render_status, Console, ConsoleCommand, Flow, HELP};
use stage_control::logging;
use stage_control::session::{SaveOutcome, Session, SessionEvent, SessionEvents};
use stage_control::transport::serial::list_ports;
use stage_control::transport::{SerialTransport, SimulatedStage, Transport};
use std::io::BufRead;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "stage-control", version)]
#[command(about = "Control panel for a serial stepper linear stage", long_about = None)]
struct Cli {
    /// Configuration file (default: config/stage.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the interactive control panel
    Run {
        /// Serial port, overrides the configuration
        #[arg(long)]
        port: Option<String>,

        /// Baud rate, overrides the configuration
        #[arg(long)]
        baud: Option<u32>,

        /// Drive an in-process simulated stage instead of a serial port
        #[arg(long)]
        simulate: bool,

        /// Adopt the position saved in device EEPROM on startup
        #[arg(long)]
        load: bool,
    },

    /// Save the current position to device EEPROM and exit
    Save {
        /// Serial port, overrides the configuration
        #[arg(long)]
        port: Option<String>,

        /// Baud rate, overrides the configuration
        #[arg(long)]
        baud: Option<u32>,
    },

    /// List available serial ports
    Ports,

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => StageConfig::load_from(path),
        None => StageConfig::load(),
    }
    .context("Failed to load configuration")?;

    if let Commands::Run { port, baud, .. } | Commands::Save { port, baud } = &cli.command {
        if let Some(port) = port {
            config.serial.port = port.clone();
        }
        if let Some(baud) = baud {
            config.serial.baud_rate = *baud;
        }
    }

    config.validate().context("Invalid configuration")?;
    logging::init_from_config(&config)?;

    match cli.command {
        Commands::Run { simulate, load, .. } => run_panel(config, simulate, load).await,
        Commands::Save { .. } => tokio::task::block_in_place(|| save_once(&config)),
        Commands::Ports => show_ports(),
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

async fn run_panel(config: StageConfig, simulate: bool, load: bool) -> Result<()> {
    if simulate {
        println!("🔧 Using simulated stage");
        let (mut session, events) = Session::from_config(SimulatedStage::default(), &config);
        if load {
            session.load_position()?;
        }
        return host_loop(session, events, &config).await;
    }

    println!("🔌 Opening {} at {} baud...", config.serial.port, config.serial.baud_rate);
    let serial = config.serial.clone();
    let port = tokio::task::spawn_blocking(move || SerialTransport::open(&serial))
        .await
        .context("Serial open task failed")?
        .with_context(|| format!("Could not connect to stage on {}", config.serial.port))?;

    let (mut session, events) = Session::from_config(port, &config);
    if load {
        session
            .load_position()
            .context("Failed to request saved position")?;
    }
    host_loop(session, events, &config).await
}

/// Drives the session until quit, end of input or Ctrl-C, then flushes the
/// position to the device and closes the port.
async fn host_loop<T: Transport>(
    mut session: Session<T>,
    mut events: SessionEvents,
    config: &StageConfig,
) -> Result<()> {
    // A plain thread: a pending blocking read must not hold up runtime shutdown.
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });

    let mut tick = tokio::time::interval(config.timing.poll_interval());
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut console = Console::default();
    println!("{HELP}");
    println!("{}", render_status(&session.status()));

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Interrupted, shutting down");
                break;
            }

            _ = tick.tick() => {
                if let Err(e) = session.tick() {
                    warn!(error = %e, "Session tick failed");
                }
            }

            line = line_rx.recv() => {
                let Some(line) = line else {
                    info!("Input closed, shutting down");
                    break;
                };
                match ConsoleCommand::parse(&line) {
                    Ok(None) => {}
                    Ok(Some(command)) => {
                        match tokio::task::block_in_place(|| console.apply(&mut session, command)) {
                            Ok(Flow::Quit) => break,
                            Ok(Flow::Continue(Some(reply))) => println!("{reply}"),
                            Ok(Flow::Continue(None)) => {}
                            Err(e) => eprintln!("❌ {e}"),
                        }
                    }
                    Err(e) => eprintln!("{e}"),
                }
            }

            Some(event) = events.recv() => {
                if let Some(text) = describe_event(&event) {
                    println!("{text}");
                }
                if matches!(event, SessionEvent::MoveCompleted { .. }) && !session.is_busy() {
                    println!("{}", render_status(&session.status()));
                }
            }
        }
    }

    println!("💾 Saving position before exit...");
    tokio::task::block_in_place(|| session.flush_and_close())
        .context("Failed to close session")?;
    Ok(())
}

fn save_once(config: &StageConfig) -> Result<()> {
    let port = SerialTransport::open(&config.serial)
        .with_context(|| format!("Could not connect to stage on {}", config.serial.port))?;
    let (mut session, _events) = Session::from_config(port, config);

    let outcome = session.save_position().context("Save failed")?;
    session.close()?;

    match outcome {
        SaveOutcome::Confirmed => println!("✅ Position saved to device"),
        SaveOutcome::Unconfirmed => {
            eprintln!("⚠️  No save confirmation from device within timeout");
        }
    }
    Ok(())
}

fn show_ports() -> Result<()> {
    let ports = list_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
        return Ok(());
    }

    for info in ports {
        match info.port_type {
            serialport::SerialPortType::UsbPort(usb) => println!(
                "{}  USB {:04x}:{:04x}  {}",
                info.port_name,
                usb.vid,
                usb.pid,
                usb.product.unwrap_or_default()
            ),
            serialport::SerialPortType::PciPort => println!("{}  PCI", info.port_name),
            serialport::SerialPortType::BluetoothPort => {
                println!("{}  Bluetooth", info.port_name)
            }
            serialport::SerialPortType::Unknown => println!("{}", info.port_name),
        }
    }
    Ok(())
}
