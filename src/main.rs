// Line-oriented operator console
//
// Reads one command per line from stdin; every reply, telemetry sample and
// drive error is written to stdout as a JSON line. Logs go to stderr.

use std::io::BufRead;
use std::time::Duration;

use clap::Parser;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use indradrive_ctl::config::{BAUD_RATE, ControlConfig, ERROR_LOG_CAPACITY, POLL_PERIOD, RELEASE_MASK};
use indradrive_ctl::controller::ConnectionState;
use indradrive_ctl::error::ControlError;
use indradrive_ctl::link::{LinkHandle, MODE_CODE_SPEED, SimulatedDrive, SisDriveLink};
use indradrive_ctl::messages::{ConsoleEvent, SequenceRow};
use indradrive_ctl::panel::ControlPanel;

const USAGE: &str = "commands: open <port> | close | speed-mode | seq-mode | speed <rpm> <accel> | \
                     add | set <row> <col> <text> | remove <row> | list | run | trigger | clear | \
                     diag | errors | quit";

#[derive(Parser, Debug)]
#[command(name = "indradrive-ctl")]
#[command(about = "Operator console for an IndraDrive servo controller", long_about = None)]
#[command(version)]
struct Args {
    /// Serial port to open at startup (e.g. COM3, /dev/ttyUSB0)
    #[arg(long)]
    port: Option<String>,

    /// Serial baud rate
    #[arg(long, default_value_t = BAUD_RATE)]
    baud: u32,

    /// Telemetry poll period in milliseconds
    #[arg(long, default_value_t = POLL_PERIOD.as_millis() as u64)]
    poll_ms: u64,

    /// Number of drive errors kept in memory
    #[arg(long, default_value_t = ERROR_LOG_CAPACITY)]
    error_capacity: usize,

    /// Run against an in-memory drive instead of a serial port
    #[arg(long)]
    simulate: bool,
}

/// One parsed console line
#[derive(Debug, Clone, PartialEq)]
enum Command {
    Open(String),
    Close,
    SpeedMode,
    SeqMode,
    Speed { speed: String, accel: String },
    Add,
    Set { row: usize, column: usize, text: String },
    Remove(usize),
    List,
    Run,
    Trigger,
    Clear,
    Diag,
    Errors,
    Quit,
}

#[derive(Debug, PartialEq, thiserror::Error)]
enum CommandError {
    #[error("unknown command '{0}'")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),
}

impl Command {
    /// Parse a console line; blank lines yield `None`
    fn parse(line: &str) -> Result<Option<Self>, CommandError> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some((&name, args)) = parts.split_first() else {
            return Ok(None);
        };

        let command = match (name, args) {
            ("open", [port]) => Command::Open(port.to_string()),
            ("open", _) => return Err(CommandError::Usage("open <port>")),
            ("close", []) => Command::Close,
            ("speed-mode", []) => Command::SpeedMode,
            ("seq-mode", []) => Command::SeqMode,
            ("speed", [speed, accel]) => Command::Speed {
                speed: speed.to_string(),
                accel: accel.to_string(),
            },
            ("speed", _) => return Err(CommandError::Usage("speed <rpm> <accel>")),
            ("add", []) => Command::Add,
            ("set", [row, column, text]) => match (row.parse(), column.parse()) {
                (Ok(row), Ok(column)) => Command::Set {
                    row,
                    column,
                    text: text.to_string(),
                },
                _ => return Err(CommandError::Usage("set <row> <col> <text>")),
            },
            ("set", _) => return Err(CommandError::Usage("set <row> <col> <text>")),
            ("remove", [row]) => match row.parse() {
                Ok(row) => Command::Remove(row),
                Err(_) => return Err(CommandError::Usage("remove <row>")),
            },
            ("remove", _) => return Err(CommandError::Usage("remove <row>")),
            ("list", []) => Command::List,
            ("run", []) => Command::Run,
            ("trigger", []) => Command::Trigger,
            ("clear", []) => Command::Clear,
            ("diag", []) => Command::Diag,
            ("errors", []) => Command::Errors,
            ("quit" | "exit", []) => Command::Quit,
            _ => return Err(CommandError::Unknown(line.trim().to_string())),
        };
        Ok(Some(command))
    }
}

/// Reply for a command that either completed or was refused
fn outcome(command: &str, result: Result<(), ControlError>) -> ConsoleEvent {
    match result {
        Ok(()) => ConsoleEvent::Done {
            command: command.to_string(),
        },
        Err(e) => ConsoleEvent::Failed {
            command: command.to_string(),
            error: e.to_string(),
        },
    }
}

fn mode(panel: &ControlPanel) -> ConsoleEvent {
    ConsoleEvent::Mode { mode: panel.mode() }
}

fn execute(panel: &mut ControlPanel, command: Command) -> Vec<ConsoleEvent> {
    match command {
        Command::Open(port) => vec![outcome("open", panel.open(&port)), mode(panel)],
        Command::Close => vec![outcome("close", panel.close()), mode(panel)],
        Command::SpeedMode => vec![
            outcome("speed-mode", panel.activate_speed_mode()),
            mode(panel),
        ],
        Command::SeqMode => vec![
            outcome("seq-mode", panel.activate_sequence_mode()),
            mode(panel),
        ],
        Command::Speed { speed, accel } => vec![outcome("speed", panel.set_speed(&speed, &accel))],
        Command::Add => {
            panel.append_sequence_entry();
            vec![outcome("add", Ok(()))]
        }
        Command::Set { row, column, text } => {
            vec![outcome("set", panel.update_sequence_entry(row, column, &text))]
        }
        Command::Remove(row) => vec![outcome("remove", panel.remove_sequence_entry(row).map(|_| ()))],
        Command::List => vec![ConsoleEvent::Sequence {
            rows: panel.sequence().entries().iter().map(SequenceRow::from).collect(),
        }],
        Command::Run => vec![outcome("run", panel.run_sequence())],
        Command::Trigger => vec![outcome("trigger", panel.trigger_sequence())],
        Command::Clear => vec![outcome("clear", panel.clear_error())],
        Command::Diag => match panel.diagnostic_number() {
            Ok(number) => vec![ConsoleEvent::DiagnosticNumber { number }],
            Err(e) => vec![outcome("diag", Err(e))],
        },
        Command::Errors => vec![ConsoleEvent::ErrorLog {
            records: panel.errors().records(),
            dropped: panel.errors().dropped(),
        }],
        // Handled by the input loop
        Command::Quit => Vec::new(),
    }
}

/// Close a session left open at exit, off the async worker like any command
fn shut_down(panel: &mut ControlPanel) -> Option<ConsoleEvent> {
    if panel.connection() != ConnectionState::Connected {
        return None;
    }
    let closed = tokio::task::block_in_place(|| panel.close());
    Some(outcome("close", closed))
}

fn emit(event: &ConsoleEvent) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string(event)?);
    Ok(())
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = ControlConfig {
        baud_rate: args.baud,
        poll_period: Duration::from_millis(args.poll_ms),
        error_capacity: args.error_capacity,
        ..ControlConfig::default()
    };

    let link = if args.simulate {
        info!("Using simulated drive");
        LinkHandle::new(
            SimulatedDrive::new()
                .with_drive_mode(MODE_CODE_SPEED)
                .with_operating_state(RELEASE_MASK),
        )
    } else {
        LinkHandle::new(SisDriveLink::new())
    };
    let mut panel = ControlPanel::new(link, config, Handle::current());

    // Samples and errors arrive on poller threads; forward them to this loop
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ConsoleEvent>();
    let tx = event_tx.clone();
    panel.subscribe_speed(move |sample| {
        let _ = tx.send(ConsoleEvent::from(*sample));
    });
    let tx = event_tx.clone();
    panel.subscribe_diagnostic(move |sample| {
        let _ = tx.send(ConsoleEvent::from(sample.clone()));
    });
    let tx = event_tx;
    panel.subscribe_errors(move |record| {
        let _ = tx.send(ConsoleEvent::from(record));
    });

    // Dedicated input thread so stdin never blocks the runtime
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if line_tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
    });

    if let Some(port) = &args.port {
        for event in tokio::task::block_in_place(|| execute(&mut panel, Command::Open(port.clone()))) {
            emit(&event)?;
        }
    }
    info!("Console ready ({})", USAGE);

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => emit(&event)?,
            line = line_rx.recv() => {
                // stdin closed
                let Some(line) = line else { break };
                match Command::parse(&line) {
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(command)) => {
                        // Link calls block; keep the poll loops running meanwhile
                        let events = tokio::task::block_in_place(|| execute(&mut panel, command));
                        for event in events {
                            emit(&event)?;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => emit(&ConsoleEvent::Failed {
                        command: line.trim().to_string(),
                        error: e.to_string(),
                    })?,
                }
            }
        }
    }

    if let Some(event) = shut_down(&mut panel) {
        emit(&event)?;
    }
    info!("Console closed");
    Ok(())
}

#[tokio::main]
async fn main() {
    // Logs on stderr (set RUST_LOG=debug for telegram dumps)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("Console error: {}", e);
        std::process::exit(1);
    }
}
