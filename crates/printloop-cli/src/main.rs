//! Command-line host for live-coded printing sessions.
//!
//! # Usage
//!
//! ```bash
//! # Compile a script and print the expanded calls
//! printloop check spiral.lp
//!
//! # Rehearse: print the G-code instead of sending it
//! printloop run spiral.lp --dry-run
//!
//! # Perform against a networked printer
//! printloop run spiral.lp --connect 192.168.1.40:8888
//!
//! # Type shorthand live; tasks keep running between lines
//! printloop live --connect 192.168.1.40:8888
//! > # start 200 | upto 5
//! > :every zbump 4000 # up 1 | down 1
//! > :once lift 10000 # upto 20
//! > :stop zbump
//! > :quit
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use printloop_core::compiler::{compile_source, SourceItem, BLOCK_DELIMITER};
use printloop_core::config::PrintloopConfig;
use printloop_core::gcode_client::GcodeTransport;
use printloop_core::live::{Live, RunReport};
use printloop_core::session::{logs_dir, Session};
use printloop_core::transport::{DryRunTransport, Transport};
use printloop_core::LiveError;

/// Live-coding runtime for 3D printers.
#[derive(Parser)]
#[command(name = "printloop")]
#[command(about = "Compile and perform live-coded 3D printer scripts")]
#[command(version)]
struct Cli {
    /// Session name, used for the event log file
    #[arg(short, long, default_value = "default", env = "PRINTLOOP_SESSION")]
    session: String,

    /// Config file (defaults to ~/.printloop/config.json)
    #[arg(short, long, env = "PRINTLOOP_CONFIG")]
    config: Option<PathBuf>,

    /// Write logs to ~/.printloop/logs/printloop.log instead of stderr
    #[arg(long)]
    log_file: bool,

    /// Output format: text or json
    #[arg(short, long, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Compile a script and print the expanded calls
    Check {
        /// Path to the script file (reads stdin if omitted)
        script: Option<PathBuf>,
    },

    /// Run a script against a printer
    Run {
        /// Path to the script file (reads stdin if omitted)
        script: Option<PathBuf>,

        #[command(flatten)]
        target: Target,
    },

    /// Read shorthand from stdin and execute it line by line
    Live {
        #[command(flatten)]
        target: Target,
    },
}

#[derive(Args)]
struct Target {
    /// Printer address as host:port (defaults to the configured transport)
    #[arg(long, env = "PRINTLOOP_CONNECT", conflicts_with = "dry_run")]
    connect: Option<String>,

    /// Print G-code instead of sending it
    #[arg(long)]
    dry_run: bool,

    /// Per-command acknowledgment timeout in milliseconds
    #[arg(long)]
    ack_timeout_ms: Option<u64>,
}

#[derive(Debug)]
enum CliError {
    Connection(String),
    Live(LiveError),
    Io(std::io::Error),
}

impl CliError {
    fn exit_code(&self) -> ExitCode {
        match self {
            CliError::Connection(_) => ExitCode::from(1),
            CliError::Live(e) => ExitCode::from(e.exit_code() as u8),
            CliError::Io(_) => ExitCode::from(4),
        }
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Connection(msg) => write!(f, "Connection error: {}", msg),
            CliError::Live(e) => write!(f, "{}", e),
            CliError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl From<LiveError> for CliError {
    fn from(e: LiveError) -> Self {
        CliError::Live(e)
    }
}

impl From<std::io::Error> for CliError {
    fn from(e: std::io::Error) -> Self {
        CliError::Io(e)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Held until exit so buffered log lines are flushed.
    let _guard = if cli.log_file {
        let file_appender = tracing_appender::rolling::never(logs_dir(), "printloop.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .with_writer(non_blocking)
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_writer(std::io::stderr)
            .init();
        None
    };

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, CliError> {
    let config = match &cli.config {
        Some(path) => PrintloopConfig::load_from(path),
        None => PrintloopConfig::load(),
    };

    match cli.command {
        Command::Check { script } => {
            let source = read_script(script.as_ref())?;
            Ok(check(&source, cli.format))
        }
        Command::Run { script, target } => {
            let source = read_script(script.as_ref())?;
            let (live, dry_run) = start(&config, &target, &cli.session).await?;
            let report = live.run_source(&source).await;
            let flushed = live.flush().await;
            if let Some(dry_run) = &dry_run {
                print_new_gcode(dry_run, &mut 0);
            }
            print_report(&report, cli.format);
            live.shutdown().await;
            flushed?;
            Ok(ExitCode::from(report.exit_code() as u8))
        }
        Command::Live { target } => {
            let (live, dry_run) = start(&config, &target, &cli.session).await?;
            let result = repl(&live, dry_run.as_deref()).await;
            live.shutdown().await;
            result.map(|()| ExitCode::SUCCESS)
        }
    }
}

fn read_script(path: Option<&PathBuf>) -> Result<String, CliError> {
    match path {
        Some(path) => Ok(std::fs::read_to_string(path)?),
        None => {
            use std::io::Read;
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            Ok(buf)
        }
    }
}

fn check(source: &str, format: OutputFormat) -> ExitCode {
    let mut errors = 0;
    for item in compile_source(source) {
        match item {
            SourceItem::Statement(stmt) => match format {
                OutputFormat::Text => println!("{:>4}  {}", stmt.line, stmt),
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::json!({ "line": stmt.line, "call": stmt.to_string() })
                ),
            },
            SourceItem::Error(err) => {
                errors += 1;
                match format {
                    OutputFormat::Text => eprintln!("{}", err),
                    OutputFormat::Json => println!(
                        "{}",
                        serde_json::json!({
                            "line": err.line,
                            "column": err.column,
                            "error": err.message,
                        })
                    ),
                }
            }
            SourceItem::Passthrough { .. } => {}
        }
    }
    if errors > 0 {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    }
}

/// Start a live runtime on the chosen transport. For dry runs the recording
/// transport is handed back so its G-code can be printed.
async fn start(
    config: &PrintloopConfig,
    target: &Target,
    session_name: &str,
) -> Result<(Live, Option<Arc<DryRunTransport>>), CliError> {
    let mut config = config.clone();
    if let Some(ms) = target.ack_timeout_ms {
        config.queue.ack_timeout_ms = ms;
    }

    let (transport, dry_run): (Arc<dyn Transport>, _) = if target.dry_run {
        // A rehearsal has no motion to wait for.
        config.queue.wait_for_motion = false;
        let dry_run = Arc::new(DryRunTransport::new());
        let transport: Arc<dyn Transport> = dry_run.clone();
        (transport, Some(dry_run))
    } else {
        let addr = match &target.connect {
            Some(addr) => addr.clone(),
            None => format!("{}:{}", config.transport.host, config.transport.port),
        };
        let addr = resolve(&addr).await?;
        let read_timeout = Duration::from_millis(config.transport.read_timeout_ms);
        let transport = GcodeTransport::connect(addr, read_timeout)
            .await
            .map_err(|e| CliError::Connection(format!("{}: {}", addr, e)))?;
        info!(%addr, "connected to printer");
        (Arc::new(transport), None)
    };

    let session = Session::new(session_name);
    if let Some(path) = session.log_path() {
        debug!(path = %path.display(), "session log");
    }
    Ok((Live::start(&config, transport, session).await, dry_run))
}

async fn resolve(addr: &str) -> Result<SocketAddr, CliError> {
    tokio::net::lookup_host(addr)
        .await
        .map_err(|e| CliError::Connection(format!("{}: {}", addr, e)))?
        .next()
        .ok_or_else(|| CliError::Connection(format!("{}: no address found", addr)))
}

fn print_new_gcode(dry_run: &DryRunTransport, printed: &mut usize) {
    let sent = dry_run.sent();
    for line in sent.iter().skip(*printed) {
        println!("{}", line);
    }
    *printed = sent.len();
}

fn print_report(report: &RunReport, format: OutputFormat) {
    match format {
        OutputFormat::Text => {
            for err in &report.parse_errors {
                eprintln!("{}", err);
            }
            for (line, err) in &report.failures {
                eprintln!("line {}: {}", line, err);
            }
        }
        OutputFormat::Json => {
            let failures: Vec<_> = report
                .failures
                .iter()
                .map(|(line, err)| serde_json::json!({ "line": line, "error": err.to_string() }))
                .collect();
            let parse_errors: Vec<_> = report
                .parse_errors
                .iter()
                .map(|e| serde_json::json!({ "line": e.line, "column": e.column, "error": e.message }))
                .collect();
            eprintln!(
                "{}",
                serde_json::json!({
                    "executed": report.executed,
                    "passthrough": report.passthrough,
                    "parse_errors": parse_errors,
                    "failures": failures,
                })
            );
        }
    }
}

/// A parsed `:` meta-command.
#[derive(Debug, PartialEq)]
enum Meta<'a> {
    Every { name: &'a str, interval_ms: u64, body: &'a str },
    Once { name: &'a str, delay_ms: u64, body: &'a str },
    Stop(&'a str),
    Set { name: &'a str, value: f64 },
    Tasks,
    Quit,
}

fn parse_meta(line: &str) -> Result<Meta<'_>, String> {
    let line = line.trim();
    let (cmd, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    match cmd {
        ":every" | ":once" => {
            let mut parts = rest.splitn(3, char::is_whitespace);
            let (Some(name), Some(ms), Some(body)) = (parts.next(), parts.next(), parts.next()) else {
                return Err(format!("usage: {} <name> <ms> <shorthand>", cmd));
            };
            let ms = ms
                .parse()
                .map_err(|_| format!("invalid interval `{}`", ms))?;
            let body = body.trim();
            Ok(if cmd == ":every" {
                Meta::Every {
                    name,
                    interval_ms: ms,
                    body,
                }
            } else {
                Meta::Once {
                    name,
                    delay_ms: ms,
                    body,
                }
            })
        }
        ":stop" if !rest.is_empty() => Ok(Meta::Stop(rest)),
        ":stop" => Err("usage: :stop <name>".to_string()),
        ":set" => {
            let (name, value) = rest
                .split_once(char::is_whitespace)
                .ok_or_else(|| "usage: :set <name> <number>".to_string())?;
            let value = value
                .trim()
                .parse()
                .map_err(|_| format!("invalid number `{}`", value.trim()))?;
            Ok(Meta::Set { name, value })
        }
        ":tasks" => Ok(Meta::Tasks),
        ":quit" | ":q" => Ok(Meta::Quit),
        other => Err(format!("unknown command `{}`", other)),
    }
}

async fn repl(live: &Live, dry_run: Option<&DryRunTransport>) -> Result<(), CliError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut block: Option<Vec<String>> = None;
    let mut printed = 0;

    loop {
        let line = tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        };
        let trimmed = line.trim();

        if let Some(body) = block.as_mut() {
            if trimmed == BLOCK_DELIMITER {
                let source = format!("{}\n{}\n{}", BLOCK_DELIMITER, body.join("\n"), BLOCK_DELIMITER);
                block = None;
                report_live(live.run_source(&source).await);
            } else {
                body.push(line);
            }
            continue;
        }

        if trimmed == BLOCK_DELIMITER {
            block = Some(Vec::new());
            continue;
        }
        if trimmed.starts_with(':') {
            match parse_meta(trimmed) {
                Ok(Meta::Quit) => break,
                Ok(meta) => {
                    if let Err(e) = run_meta(live, meta).await {
                        eprintln!("{}", e);
                    }
                }
                Err(usage) => eprintln!("{}", usage),
            }
        } else if !trimmed.is_empty() {
            let report = live.run_source(&line).await;
            if report.passthrough > 0 {
                eprintln!("not a shorthand line (start it with '#')");
            }
            report_live(report);
        }

        if let Some(dry_run) = dry_run {
            live.flush().await?;
            print_new_gcode(dry_run, &mut printed);
        }
    }

    live.flush().await?;
    if let Some(dry_run) = dry_run {
        print_new_gcode(dry_run, &mut printed);
    }
    Ok(())
}

async fn run_meta(live: &Live, meta: Meta<'_>) -> Result<(), LiveError> {
    match meta {
        Meta::Every {
            name,
            interval_ms,
            body,
        } => {
            live.add_shorthand_task(name, Duration::from_millis(interval_ms), body)
                .await?;
            println!("task {} every {} ms", name, interval_ms);
        }
        Meta::Once {
            name,
            delay_ms,
            body,
        } => {
            live.schedule_shorthand_once(name, Duration::from_millis(delay_ms), body)
                .await?;
            println!("task {} once in {} ms", name, delay_ms);
        }
        Meta::Stop(name) => {
            live.remove_task(name)?;
            println!("task {} stopped", name);
        }
        Meta::Set { name, value } => live.set_var(name, value).await,
        Meta::Tasks => {
            let tasks = live.tasks().await?;
            if tasks.is_empty() {
                println!("no tasks");
            }
            for task in tasks {
                let state = if task.running { " (running)" } else { "" };
                let schedule = if task.repeat { "every" } else { "once in" };
                println!(
                    "{} {} {} ms, fired {} times{}",
                    task.name, schedule, task.interval_ms, task.fire_count, state
                );
            }
        }
        Meta::Quit => {}
    }
    Ok(())
}

fn report_live(report: RunReport) {
    for err in &report.parse_errors {
        eprintln!("{}", err);
    }
    for (_, err) in &report.failures {
        eprintln!("{}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_every() {
        assert_eq!(
            parse_meta(":every zbump 4000 # up 1 | down 1").unwrap(),
            Meta::Every {
                name: "zbump",
                interval_ms: 4000,
                body: "# up 1 | down 1"
            }
        );
        assert!(parse_meta(":every zbump").is_err());
        assert_eq!(
            parse_meta(":once cue 2000 # upto 5").unwrap(),
            Meta::Once {
                name: "cue",
                delay_ms: 2000,
                body: "# upto 5"
            }
        );
        assert!(parse_meta(":once cue").is_err());
        assert!(parse_meta(":every zbump soon # up 1").is_err());
    }

    #[test]
    fn test_parse_other_meta_commands() {
        assert_eq!(parse_meta(":stop zbump").unwrap(), Meta::Stop("zbump"));
        assert!(parse_meta(":stop").is_err());
        assert_eq!(
            parse_meta(":set bump -1").unwrap(),
            Meta::Set {
                name: "bump",
                value: -1.0
            }
        );
        assert_eq!(parse_meta(":tasks").unwrap(), Meta::Tasks);
        assert_eq!(parse_meta(":q").unwrap(), Meta::Quit);
        assert!(parse_meta(":dance").is_err());
    }
}
