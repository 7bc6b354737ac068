//! Modemlink - modem terminal with XMODEM file transfer
//!
//! Talks to a serial-attached modem: AT commands, dial/answer/hangup, chat
//! once connected, and XMODEM send/receive over the call.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use modemlink_core::cli::console::HELP;
use modemlink_core::cli::{exit_code_description, format_event, parse_console_line, CliResult, ConsoleCommand, ExitCodes};
use modemlink_core::config::log_dir;
use modemlink_core::core::logger::generate_transcript_filename;
use modemlink_core::{
    list_ports, AppConfig, EventSink, NotificationSink, SerialOpener, SessionController, TracingSink,
    TranscriptLogger, TransferOutcome, TransferRequest,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// CLI output format
#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON format for scripting
    Json,
}

/// Modemlink CLI
#[derive(Parser, Debug)]
#[command(
    name = "modemlink",
    version,
    about = "Modem terminal with XMODEM file transfer",
    long_about = None
)]
struct Cli {
    /// Configuration file (default: platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List available serial ports
    ListPorts {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Interactive modem console
    Terminal {
        /// Serial port name (e.g., COM3, /dev/ttyUSB0)
        #[arg(short, long)]
        port: Option<String>,

        /// Baud rate
        #[arg(short, long)]
        baud: Option<u32>,

        /// Write a session transcript to this file
        #[arg(long)]
        transcript: Option<PathBuf>,
    },

    /// Send a file with XMODEM over a direct link
    Send {
        /// Serial port name
        #[arg(short, long)]
        port: Option<String>,

        /// Baud rate
        #[arg(short, long)]
        baud: Option<u32>,

        /// File to send
        file: PathBuf,
    },

    /// Receive a file with XMODEM over a direct link
    Receive {
        /// Serial port name
        #[arg(short, long)]
        port: Option<String>,

        /// Baud rate
        #[arg(short, long)]
        baud: Option<u32>,

        /// Where to store the file
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let loaded = match &cli.config {
        Some(path) => AppConfig::load(path),
        None => AppConfig::load_default(),
    };
    let config = match loaded {
        Ok(config) => config,
        Err(e) => return report(&cli, CliResult::from(e)),
    };

    init_tracing(&cli, &config.logging.filter);
    tracing::debug!("Starting Modemlink v{}", modemlink_core::VERSION);

    let result = match &cli.command {
        Commands::ListPorts { format } => print_ports(&cli, *format),
        Commands::Terminal { port, baud, transcript } => match resolve_port(&config, port.as_deref(), *baud) {
            Ok((port, baud)) => run_terminal(&cli, &config, &port, baud, transcript.clone()).await,
            Err(result) => result,
        },
        Commands::Send { port, baud, file } => match resolve_port(&config, port.as_deref(), *baud) {
            Ok((port, baud)) => transfer_once(&config, &port, baud, TransferRequest::send(file)).await,
            Err(result) => result,
        },
        Commands::Receive { port, baud, file } => match resolve_port(&config, port.as_deref(), *baud) {
            Ok((port, baud)) => transfer_once(&config, &port, baud, TransferRequest::receive(file)).await,
            Err(result) => result,
        },
    };

    report(&cli, result)
}

fn init_tracing(cli: &Cli, configured: &str) {
    let default = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        configured
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn report(cli: &Cli, result: CliResult) -> ExitCode {
    match &result {
        CliResult::Success(Some(msg)) if !cli.quiet => println!("{msg}"),
        CliResult::Success(_) => {}
        CliResult::Error(code, msg) => {
            eprintln!("Error: {msg}");
            if cli.verbose {
                eprintln!("Exit code {code}: {}", exit_code_description(*code));
            }
        }
    }
    result.to_exit_code()
}

fn resolve_port(config: &AppConfig, port: Option<&str>, baud: Option<u32>) -> Result<(String, u32), CliResult> {
    let port = port.unwrap_or(&config.serial.port);
    if port.is_empty() {
        return Err(CliResult::error(
            ExitCodes::INVALID_ARGS,
            "No port given (use --port or set serial.port in the config file)",
        ));
    }
    Ok((port.to_string(), baud.unwrap_or(config.serial.baud_rate)))
}

fn print_ports(cli: &Cli, format: OutputFormat) -> CliResult {
    let ports = match list_ports() {
        Ok(ports) => ports,
        Err(e) => return e.into(),
    };

    match format {
        OutputFormat::Json => {
            let json: Vec<serde_json::Value> = ports
                .iter()
                .map(|p| {
                    serde_json::json!({
                        "name": p.port_name,
                        "type": format!("{:?}", p.port_type)
                    })
                })
                .collect();
            match serde_json::to_string_pretty(&json) {
                Ok(text) => println!("{text}"),
                Err(e) => return CliResult::error(ExitCodes::INTERNAL_ERROR, e.to_string()),
            }
        }
        OutputFormat::Text => {
            if ports.is_empty() {
                if !cli.quiet {
                    println!("No serial ports found.");
                }
            } else {
                for port in &ports {
                    println!("{}", port.port_name);
                }
            }
        }
    }

    CliResult::success()
}

fn open_transcript(config: &AppConfig, requested: Option<PathBuf>) -> anyhow::Result<Option<TranscriptLogger>> {
    let path = match requested {
        Some(path) => path,
        None if config.logging.transcript => {
            let dir = config
                .logging
                .directory
                .clone()
                .or_else(log_dir)
                .context("no transcript directory configured")?;
            std::fs::create_dir_all(&dir).with_context(|| format!("cannot create {}", dir.display()))?;
            dir.join(generate_transcript_filename("modemlink"))
        }
        None => return Ok(None),
    };

    let logger = TranscriptLogger::create(&path).with_context(|| format!("cannot open transcript {}", path.display()))?;
    Ok(Some(logger))
}

async fn run_terminal(cli: &Cli, config: &AppConfig, port: &str, baud: u32, transcript: Option<PathBuf>) -> CliResult {
    let (events, mut rx) = EventSink::channel();
    let sink: Arc<dyn NotificationSink> = match open_transcript(config, transcript) {
        Ok(Some(logger)) => {
            if !cli.quiet {
                eprintln!("Transcript: {}", logger.path().display());
            }
            Arc::new((events, logger))
        }
        Ok(None) => Arc::new(events),
        Err(e) => return CliResult::error(ExitCodes::ERROR, format!("{e:#}")),
    };

    let controller = SessionController::new(
        config.session.clone(),
        config.xmodem.clone(),
        Arc::new(SerialOpener::new(config.serial.clone())),
        sink,
    );
    if let Err(e) = controller.connect(port, baud).await {
        return e.into();
    }

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Some(line) = format_event(&event) {
                println!("{line}");
            }
        }
    });
    if !cli.quiet {
        eprintln!("Type /help for commands.");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut watchdog = tokio::time::interval(Duration::from_millis(500));

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => break,
            _ = watchdog.tick() => {
                if controller.state().is_open() {
                    continue;
                }
                eprintln!("Session closed.");
                break;
            }
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "stdin read failed");
                break;
            }
        };
        let Some(command) = parse_console_line(&line) else {
            continue;
        };

        let result = match command {
            ConsoleCommand::Line(text) => controller.send_line(&text).await,
            ConsoleCommand::Dial(number) => controller.dial(&number).await,
            ConsoleCommand::Answer => controller.answer().await,
            ConsoleCommand::Hangup => controller.hangup().await,
            ConsoleCommand::Send(path) => controller.start_transfer(TransferRequest::send(path)).map(drop),
            ConsoleCommand::Receive(path) => controller.start_transfer(TransferRequest::receive(path)).map(drop),
            ConsoleCommand::Status => {
                print_status(&controller);
                Ok(())
            }
            ConsoleCommand::Help => {
                println!("{HELP}");
                Ok(())
            }
            ConsoleCommand::Quit => break,
            ConsoleCommand::Invalid(msg) => {
                eprintln!("{msg}");
                Ok(())
            }
        };
        if let Err(e) = result {
            eprintln!("Error: {e}");
        }
    }

    if controller.state().is_open() {
        if let Err(e) = controller.disconnect().await {
            tracing::warn!(error = %e, "disconnect failed");
        }
    }
    drop(controller);
    // Let the last notifications print
    let _ = tokio::time::timeout(Duration::from_millis(200), printer).await;

    CliResult::success()
}

fn print_status(controller: &SessionController) {
    let state = controller.state();
    let caps = controller.capabilities();
    println!("State:    {state}");
    if let Some(port) = controller.port_name() {
        println!("Port:     {port}");
    }
    if let Some(id) = controller.session_id() {
        println!("Session:  {id}");
    }
    println!(
        "Allowed:  send={} dial={} hangup={} transfer={}",
        caps.send, caps.dial, caps.hangup, caps.transfer
    );
    if controller.transfer_active() {
        println!("Transfer: running");
    }
}

async fn transfer_once(config: &AppConfig, port: &str, baud: u32, request: TransferRequest) -> CliResult {
    // Direct link: no CONNECT to wait for
    let mut settings = config.session.clone();
    settings.allow_transfer_in_command_mode = true;

    let controller = SessionController::new(
        settings,
        config.xmodem.clone(),
        Arc::new(SerialOpener::new(config.serial.clone())),
        Arc::new(TracingSink),
    );
    if let Err(e) = controller.connect(port, baud).await {
        return e.into();
    }

    let file_name = request.file_name();
    let direction = request.direction;
    let outcome = match controller.start_transfer(request) {
        Ok(handle) => handle.await,
        Err(e) => return e.into(),
    };
    if controller.state().is_open() {
        if let Err(e) = controller.disconnect().await {
            tracing::debug!(error = %e, "disconnect after transfer failed");
        }
    }

    match outcome {
        Ok(TransferOutcome::Success(summary)) => CliResult::success_with_message(format!(
            "{direction} of {file_name} complete: {} blocks, {} bytes",
            summary.blocks, summary.bytes
        )),
        Ok(TransferOutcome::Failure(e)) => e.into(),
        Err(e) => CliResult::error(ExitCodes::INTERNAL_ERROR, format!("transfer task failed: {e}")),
    }
}
