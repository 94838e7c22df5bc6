//! solvertray command replay
//!
//! Plays a command script against one session, the way a host process would
//! through the C ABI.
//!
//! Usage:
//!   solvertray_replay --script FILE [--devices SPEC] [--quiet] [--keep-going]
//!
//! Script lines:
//!   // comment
//!   solver_param set_string @solver.prototxt   (buffer = file bytes)
//!   solver create
//!   solver step =100                           (buffer = native int)
//!   solver_param get_bytesize #4               (buffer = 4 zeroed bytes)

use std::fs;
use std::os::raw::c_int;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use thiserror::Error;

use solvertray::runtime::{self, EnvDevices};
use solvertray::{Buffer, Session};

#[derive(Parser, Debug)]
#[command(name = "solvertray_replay", version, about = "Replay a solvertray command script")]
struct Args {
    /// Command script, one command per line
    #[arg(long)]
    script: PathBuf,

    /// Device spec: "" for CPU, "all", or a comma-separated list
    #[arg(long, default_value = "")]
    devices: String,

    /// Only report failures
    #[arg(long, short)]
    quiet: bool,

    /// Continue after a failed command
    #[arg(long)]
    keep_going: bool,
}

/// Buffer contents for one script line
#[derive(Debug, Clone, PartialEq, Eq)]
enum Payload {
    Empty,
    File(PathBuf),
    Int(c_int),
    Zeroed(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ScriptLine {
    command: String,
    payload: Payload,
}

#[derive(Debug, Error)]
enum ScriptError {
    #[error("line {line}: invalid payload '{payload}'")]
    Payload { line: usize, payload: String },

    #[error("line {line}: cannot read '{path}': {source}")]
    Io {
        line: usize,
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Split a line into command and payload. Blank and `//` lines yield `None`.
fn parse_line(number: usize, line: &str) -> Result<Option<ScriptLine>, ScriptError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with("//") {
        return Ok(None);
    }

    let (command, last) = match line.rsplit_once([' ', '\t']) {
        Some((head, tail)) => (head.trim_end(), tail),
        None => (line, ""),
    };
    let invalid = || ScriptError::Payload {
        line: number,
        payload: last.to_string(),
    };

    let payload = if let Some(path) = last.strip_prefix('@') {
        Payload::File(PathBuf::from(path))
    } else if let Some(value) = last.strip_prefix('=') {
        Payload::Int(value.parse().map_err(|_| invalid())?)
    } else if let Some(size) = last.strip_prefix('#') {
        Payload::Zeroed(size.parse().map_err(|_| invalid())?)
    } else {
        return Ok(Some(ScriptLine {
            command: line.to_string(),
            payload: Payload::Empty,
        }));
    };

    Ok(Some(ScriptLine {
        command: command.to_string(),
        payload,
    }))
}

fn payload_bytes(number: usize, payload: &Payload, base: &Path) -> Result<Vec<u8>, ScriptError> {
    match payload {
        Payload::Empty => Ok(Vec::new()),
        Payload::File(path) => {
            let path = base.join(path);
            fs::read(&path).map_err(|source| ScriptError::Io {
                line: number,
                path: path.display().to_string(),
                source,
            })
        }
        Payload::Int(value) => Ok(value.to_ne_bytes().to_vec()),
        Payload::Zeroed(size) => Ok(vec![0; *size]),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = if args.quiet { "warn" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    let script = match fs::read_to_string(&args.script) {
        Ok(script) => script,
        Err(e) => {
            eprintln!("Error: cannot read {}: {}", args.script.display(), e);
            return ExitCode::FAILURE;
        }
    };
    let base = args.script.parent().map(Path::to_path_buf).unwrap_or_default();

    let running = Arc::new(AtomicBool::new(true));
    let stop_handle = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("\nStopping after the current command...");
        stop_handle.store(false, Ordering::SeqCst);
    }) {
        log::warn!("Ctrl+C handler not installed: {}", e);
    }

    runtime::initialize(&args.devices, &EnvDevices);
    let mut session = Session::new();
    let mut failed = false;

    for (index, raw) in script.lines().enumerate() {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        let number = index + 1;

        let line = match parse_line(number, raw) {
            Ok(Some(line)) => line,
            Ok(None) => continue,
            Err(e) => {
                eprintln!("Error: {}", e);
                return ExitCode::FAILURE;
            }
        };
        let mut bytes = match payload_bytes(number, &line.payload, &base) {
            Ok(bytes) => bytes,
            Err(e) => {
                eprintln!("Error: {}", e);
                return ExitCode::FAILURE;
            }
        };

        let mut buffer = Buffer::new(&mut bytes);
        let ok = session.send(&line.command, &mut buffer);
        if ok {
            if !args.quiet {
                if buffer.is_int_sized() {
                    println!("{:>4}: ok  {} -> {}", number, line.command, buffer.read_int());
                } else {
                    println!("{:>4}: ok  {}", number, line.command);
                }
            }
        } else {
            println!("{:>4}: FAILED  {}", number, line.command);
            failed = true;
            if !args.keep_going {
                break;
            }
        }
    }

    let stats = session.stats();
    if !args.quiet {
        println!("{} commands, {} failed", stats.commands, stats.failures);
    }
    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
